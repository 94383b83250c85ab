use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::{exec::DynRunner, utils::process::CmdSpec};

pub const REQ_BINS: &[&str] = &["pvesh"];

/// One entry of `/cluster/resources --type vm` or of a pool's members.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub vmid: u32,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub node: String,
}

#[derive(Debug, Deserialize)]
struct PoolResponse {
    #[serde(default)]
    members: Vec<Resource>,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
    #[serde(default)]
    release: Option<String>,
}

pub trait PveshPort: Send + Sync {
    fn cluster_resources(&self) -> Result<Vec<Resource>>;
    fn pool_members(&self, pool: &str) -> Result<Vec<Resource>>;
    fn version(&self) -> Result<String>;
}

pub struct PveshCli {
    runner: Arc<DynRunner>,
}

impl PveshCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self { runner }
    }

    #[inline]
    fn get(&self, path: &str) -> CmdSpec {
        CmdSpec::new("pvesh").args(["get", path])
    }

    fn json(&self, cmd: CmdSpec) -> Result<String> {
        let out = self
            .runner
            .run(&cmd.args(["--output-format", "json"]))?;
        Ok(out.stdout)
    }
}

impl PveshPort for PveshCli {
    fn cluster_resources(&self) -> Result<Vec<Resource>> {
        let out = self
            .json(self.get("/cluster/resources").args(["--type", "vm"]))
            .context("run pvesh get /cluster/resources")?;
        serde_json::from_str(&out).context("parse cluster resources json")
    }

    fn pool_members(&self, pool: &str) -> Result<Vec<Resource>> {
        let out = self
            .json(self.get(&format!("/pools/{pool}")))
            .with_context(|| format!("run pvesh get /pools/{pool}"))?;
        let resp: PoolResponse = serde_json::from_str(&out)
            .with_context(|| format!("parse pool {pool} json"))?;
        Ok(resp.members)
    }

    fn version(&self) -> Result<String> {
        let out = self
            .json(self.get("/version"))
            .context("run pvesh get /version")?;
        let v: VersionResponse = serde_json::from_str(&out).context("parse version json")?;
        Ok(match v.release {
            Some(r) => format!("{} (release {r})", v.version),
            None => v.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::{FakeRunner, Reply};

    #[test]
    fn cluster_resources_parses_and_tolerates_missing_fields() {
        let fake = Arc::new(FakeRunner::new());
        fake.reply(
            "pvesh",
            Reply::ok(
                r#"[{"vmid":101,"type":"qemu","node":"pve1","name":"web"},
                    {"vmid":200,"type":"lxc","node":"pve2"},
                    {"type":"storage","node":"pve1"}]"#,
            ),
        );
        let cli = PveshCli::new(fake.clone());
        let res = cli.cluster_resources().unwrap();
        assert_eq!(res.len(), 3);
        assert_eq!(res[0].kind, "qemu");
        assert_eq!(res[2].vmid, 0);
        assert_eq!(
            fake.calls(),
            vec!["pvesh get /cluster/resources --type vm --output-format json".to_string()]
        );
    }

    #[test]
    fn pool_members_unwraps_members() {
        let fake = Arc::new(FakeRunner::new());
        fake.reply(
            "pvesh",
            Reply::ok(r#"{"poolid":"prod","members":[{"vmid":300,"type":"lxc","node":"pve1"}]}"#),
        );
        let cli = PveshCli::new(fake.clone());
        let members = cli.pool_members("prod").unwrap();
        assert_eq!(members[0].vmid, 300);
        assert_eq!(
            fake.calls(),
            vec!["pvesh get /pools/prod --output-format json".to_string()]
        );
    }

    #[test]
    fn failures_carry_context() {
        let fake = Arc::new(FakeRunner::new());
        fake.reply("pvesh", Reply::fail(2, "no such pool 'x'"));
        let cli = PveshCli::new(fake);
        let err = format!("{:#}", cli.pool_members("x").unwrap_err());
        assert!(err.contains("/pools/x"), "err was: {err}");
        assert!(err.contains("no such pool"), "err was: {err}");
    }

    #[test]
    fn version_includes_release() {
        let fake = Arc::new(FakeRunner::new());
        fake.reply("pvesh", Reply::ok(r#"{"version":"8.2.4","release":"8.2"}"#));
        assert_eq!(PveshCli::new(fake).version().unwrap(), "8.2.4 (release 8.2)");
    }
}
