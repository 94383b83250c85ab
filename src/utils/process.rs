use std::process::Command;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CmdSpec {
    program: String,
    args: Vec<String>,
}

impl CmdSpec {
    #[must_use]
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, it: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(it.into_iter().map(Into::into));
        self
    }

    #[inline]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[inline]
    pub fn argv(&self) -> &[String] {
        &self.args
    }

    /// Shell form of the command. This is both what gets logged and what a
    /// remote shell executes, so every word goes through `sh_quote`.
    pub fn render(&self) -> String {
        let mut out = sh_quote(&self.program);
        for a in &self.args {
            out.push(' ');
            out.push_str(&sh_quote(a));
        }
        out
    }

    /// Render with a trailing output redirection, e.g. `cat > '<path>'`.
    pub fn render_redirect(&self, target: &str) -> String {
        format!("{} > {}", self.render(), sh_quote(target))
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// Quotes anything outside a conservative set of shell-inert characters.
pub fn sh_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".into();
    }
    let inert = s.bytes().all(|b| {
        b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b'=' | b':' | b',' | b'+' | b'@' | b'%')
    });
    if inert {
        return s.to_string();
    }
    let mut out = String::from("'");
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sh_quote_empty() {
        assert_eq!(sh_quote(""), "''");
    }

    #[test]
    fn sh_quote_simple() {
        assert_eq!(sh_quote("vzdump"), "vzdump");
        assert_eq!(sh_quote("/var/lib/vz/dump/a.vma.zst"), "/var/lib/vz/dump/a.vma.zst");
    }

    #[test]
    fn sh_quote_with_space() {
        assert_eq!(sh_quote("hello world"), "'hello world'");
    }

    #[test]
    fn sh_quote_with_single_quote() {
        assert_eq!(sh_quote("don't"), "'don'\\''t'");
    }

    #[test]
    fn sh_quote_shell_metacharacters() {
        assert_eq!(sh_quote("a;rm -rf /"), "'a;rm -rf /'");
        assert_eq!(sh_quote("$(id)"), "'$(id)'");
        assert_eq!(sh_quote("x|y"), "'x|y'");
        assert_eq!(sh_quote("*"), "'*'");
    }

    #[test]
    fn cmd_spec_render() {
        let cmd = CmdSpec::new("pct")
            .arg("restore")
            .args(["101", "/tmp/dump dir/x.tar"]);
        assert_eq!(cmd.render(), "pct restore 101 '/tmp/dump dir/x.tar'");
    }

    #[test]
    fn cmd_spec_render_redirect() {
        let cmd = CmdSpec::new("cat");
        assert_eq!(cmd.render_redirect("/tmp/a b"), "cat > '/tmp/a b'");
    }
}
