use anyhow::{Context, Result, anyhow};

use crate::{exec::DynRunner, utils::process::CmdSpec};

const PROBE: &str = r#"for b in "$@"; do command -v "$b" >/dev/null 2>&1 || echo "$b"; done"#;

/// Fails unless every binary in `bins` resolves in `PATH` on the execution
/// host. One probe command covers the whole list.
pub fn ensure_bins<I, S>(runner: &DynRunner, bins: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let cmd = CmdSpec::new("sh")
        .args(["-c", PROBE, "sh"])
        .args(bins.into_iter().map(|b| b.as_ref().to_string()));
    let out = runner.run(&cmd).context("probe required binaries")?;

    let missing: Vec<&str> = out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "missing required binaries in PATH: {}",
            missing.join(", ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::{FakeRunner, Reply};

    #[test]
    fn all_present() {
        let fake = FakeRunner::new();
        ensure_bins(&fake, ["pvesh", "vzdump"]).unwrap();
        let calls = fake.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("sh -c "));
        assert!(calls[0].ends_with(" sh pvesh vzdump"));
    }

    #[test]
    fn reports_missing() {
        let fake = FakeRunner::new();
        fake.reply("sh", Reply::ok("qmrestore\npct\n"));
        let err = ensure_bins(&fake, ["qm", "qmrestore", "pct"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing required binaries in PATH: qmrestore, pct"
        );
    }

    #[cfg(unix)]
    #[test]
    fn local_probe_finds_sh() {
        let r = crate::exec::LocalRunner::default();
        ensure_bins(&r, ["sh"]).unwrap();
        let err = ensure_bins(&r, ["vzbridge-no-such-tool"]).unwrap_err();
        assert!(err.to_string().contains("vzbridge-no-such-tool"));
    }
}
