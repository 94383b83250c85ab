use std::{
    fmt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use config as cfg;
use serde::{Deserialize, Serialize};

pub const DEFAULT_STAGING_DIR: &str = "/var/lib/vz/dump";
pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Clone)]
pub struct Config {
    pub connection: Connection,
    pub backup: Backup,
    pub restore: Restore,
}

#[derive(Debug, Clone)]
pub enum Connection {
    Local { host: Option<String> },
    Remote(RemoteTarget),
}

#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: Auth,
}

#[derive(Clone)]
pub enum Auth {
    Password(String),
    Identity(PathBuf),
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::Password(_) => f.write_str("Password(<redacted>)"),
            Auth::Identity(p) => f.debug_tuple("Identity").field(p).finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    #[default]
    Snapshot,
    Suspend,
    Stop,
}

impl BackupMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupMode::Snapshot => "snapshot",
            BackupMode::Suspend => "suspend",
            BackupMode::Stop => "stop",
        }
    }
}

/// Value passed to `vzdump --compress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressSetting {
    #[default]
    Off,
    On,
    Gzip,
    Lzo,
    Zstd,
}

impl CompressSetting {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressSetting::Off => "0",
            CompressSetting::On => "1",
            CompressSetting::Gzip => "gzip",
            CompressSetting::Lzo => "lzo",
            CompressSetting::Zstd => "zstd",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "0" => CompressSetting::Off,
            "1" => CompressSetting::On,
            "gzip" => CompressSetting::Gzip,
            "lzo" => CompressSetting::Lzo,
            "zstd" => CompressSetting::Zstd,
            other => bail!("[backup] compress: expected 0|1|gzip|lzo|zstd, got '{other}'"),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Backup {
    pub mode: BackupMode,
    pub compress: CompressSetting,
    pub node: Option<String>,
    /// Write `vzdump-v<N>-…` names instead of the untagged form.
    pub version_tag: bool,
}

#[derive(Debug, Clone)]
pub struct Restore {
    pub staging_dir: PathBuf,
    pub cleanup: bool,
    pub vmid: Option<u32>,
}

impl Default for Restore {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from(DEFAULT_STAGING_DIR),
            cleanup: false,
            vmid: None,
        }
    }
}

impl Config {
    /// Name recorded as the origin of produced archives.
    pub fn origin(&self) -> &str {
        match &self.connection {
            Connection::Local { host: Some(h) } => h,
            Connection::Local { host: None } => "local",
            Connection::Remote(t) => &t.host,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let raw: RawConfig = cfg::Config::builder()
            .add_source(cfg::File::from(path))
            .build()
            .with_context(|| format!("load {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("deserialize {}", path.display()))?;

        Self::from_raw(raw, base_dir)
    }

    fn from_raw(raw: RawConfig, base_dir: &Path) -> Result<Self> {
        let n = config_helpers::Normalizer { base_dir };

        let mode = n
            .trim_opt(raw.connection.mode)
            .ok_or_else(|| anyhow!("[connection] mode must be set (local|remote)"))?;
        let host = n.trim_opt(raw.connection.host);

        let connection = match mode.as_str() {
            "local" => Connection::Local { host },
            "remote" => {
                let host = host.ok_or_else(|| anyhow!("[connection] host is required for remote mode"))?;
                let username = n
                    .trim_opt(raw.connection.username)
                    .ok_or_else(|| anyhow!("[connection] username is required for remote mode"))?;
                let method = n
                    .trim_opt(raw.connection.method)
                    .ok_or_else(|| anyhow!("[connection] method is required for remote mode"))?;
                let auth = match method.as_str() {
                    "password" => {
                        let p = n
                            .trim_opt(raw.connection.password_file)
                            .map(|s| n.resolve(&s))
                            .ok_or_else(|| anyhow!("[connection] password_file is required for method=password"))?;
                        let pw = n
                            .read_secret(&p)
                            .with_context(|| format!("read ssh password from {}", p.display()))?;
                        if pw.is_empty() {
                            bail!("[connection] password file {} is empty", p.display());
                        }
                        Auth::Password(pw)
                    }
                    "identity" => {
                        let p = n
                            .trim_opt(raw.connection.identity_file)
                            .ok_or_else(|| anyhow!("[connection] identity_file is required for method=identity"))?;
                        Auth::Identity(n.resolve(&n.expand_home(&p)?))
                    }
                    other => bail!("[connection] method: expected password|identity, got '{other}'"),
                };
                Connection::Remote(RemoteTarget {
                    host,
                    port: raw.connection.port.unwrap_or(DEFAULT_SSH_PORT),
                    username,
                    auth,
                })
            }
            other => bail!("[connection] mode: expected local|remote, got '{other}'"),
        };

        let compress = match n.trim_opt(raw.backup.compress) {
            Some(s) => CompressSetting::parse(&s)?,
            None => CompressSetting::default(),
        };
        let backup = Backup {
            mode: raw.backup.mode.unwrap_or_default(),
            compress,
            node: n.trim_opt(raw.backup.node),
            version_tag: raw.backup.version_tag.unwrap_or(false),
        };

        if raw.restore.vmid == Some(0) {
            bail!("[restore] vmid must be a positive integer");
        }
        let restore = Restore {
            staging_dir: n
                .trim_opt(raw.restore.staging_dir)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STAGING_DIR)),
            cleanup: raw.restore.cleanup.unwrap_or(false),
            vmid: raw.restore.vmid,
        };
        if !restore.staging_dir.is_absolute() {
            bail!(
                "[restore] staging_dir must be absolute, got '{}'",
                restore.staging_dir.display()
            );
        }

        Ok(Self {
            connection,
            backup,
            restore,
        })
    }

    pub fn to_redacted_toml(&self) -> Result<String> {
        #[derive(Serialize)]
        struct ConnectionOut<'a> {
            mode: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            host: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            port: Option<u16>,
            #[serde(skip_serializing_if = "Option::is_none")]
            username: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            method: Option<&'static str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            password: Option<&'static str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            identity_file: Option<String>,
        }
        #[derive(Serialize)]
        struct BackupOut<'a> {
            mode: &'static str,
            compress: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            node: Option<&'a str>,
            version_tag: bool,
        }
        #[derive(Serialize)]
        struct RestoreOut {
            staging_dir: String,
            cleanup: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            vmid: Option<u32>,
        }
        #[derive(Serialize)]
        struct Out<'a> {
            connection: ConnectionOut<'a>,
            backup: BackupOut<'a>,
            restore: RestoreOut,
        }

        let connection = match &self.connection {
            Connection::Local { host } => ConnectionOut {
                mode: "local",
                host: host.as_deref(),
                port: None,
                username: None,
                method: None,
                password: None,
                identity_file: None,
            },
            Connection::Remote(t) => {
                let (method, password, identity_file) = match &t.auth {
                    Auth::Password(_) => ("password", Some("<redacted>"), None),
                    Auth::Identity(p) => ("identity", None, Some(p.display().to_string())),
                };
                ConnectionOut {
                    mode: "remote",
                    host: Some(&t.host),
                    port: Some(t.port),
                    username: Some(&t.username),
                    method: Some(method),
                    password,
                    identity_file,
                }
            }
        };

        let out = Out {
            connection,
            backup: BackupOut {
                mode: self.backup.mode.as_str(),
                compress: self.backup.compress.as_str(),
                node: self.backup.node.as_deref(),
                version_tag: self.backup.version_tag,
            },
            restore: RestoreOut {
                staging_dir: self.restore.staging_dir.display().to_string(),
                cleanup: self.restore.cleanup,
                vmid: self.restore.vmid,
            },
        };
        Ok(toml::to_string_pretty(&out)?)
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    connection: RawConnection,

    #[serde(default)]
    backup: RawBackup,

    #[serde(default)]
    restore: RawRestore,
}

#[derive(Debug, Deserialize)]
struct RawConnection {
    mode: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    method: Option<String>,
    password_file: Option<String>,
    identity_file: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawBackup {
    mode: Option<BackupMode>,
    compress: Option<String>,
    node: Option<String>,
    version_tag: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct RawRestore {
    staging_dir: Option<String>,
    cleanup: Option<bool>,
    vmid: Option<u32>,
}

mod config_helpers {
    use std::{
        env, fs,
        path::{Path, PathBuf},
    };

    use anyhow::{Result, anyhow};

    pub(super) struct Normalizer<'a> {
        pub base_dir: &'a Path,
    }

    impl<'a> Normalizer<'a> {
        #[inline]
        pub fn trim_opt(&self, s: Option<String>) -> Option<String> {
            s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        }

        #[inline]
        pub fn resolve(&self, p: &str) -> PathBuf {
            let pb = PathBuf::from(p.trim());
            if pb.is_absolute() {
                pb
            } else {
                self.base_dir.join(pb)
            }
        }

        pub fn expand_home(&self, p: &str) -> Result<String> {
            if p != "~" && !p.starts_with("~/") {
                return Ok(p.to_string());
            }
            let home = env::var("HOME").map_err(|_| anyhow!("cannot expand '{p}': HOME is not set"))?;
            Ok(format!("{home}{}", &p[1..]))
        }

        pub fn read_secret(&self, p: &Path) -> Result<String> {
            let mut s = String::from_utf8(fs::read(p)?)?;
            while s.ends_with('\n') || s.ends_with('\r') {
                s.pop();
            }
            Ok(s)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn write(path: &Path, s: &str) {
        fs::write(path, s).unwrap();
    }

    #[test]
    fn load_local_defaults() {
        let tmp = TempDir::new().unwrap();
        let cfg_path = tmp.path().join("config.toml");
        write(
            &cfg_path,
            r#"
[connection]
mode = "local"
"#,
        );

        let cfg = Config::load(&cfg_path).unwrap();
        assert!(matches!(cfg.connection, Connection::Local { host: None }));
        assert_eq!(cfg.origin(), "local");
        assert_eq!(cfg.backup.mode, BackupMode::Snapshot);
        assert_eq!(cfg.backup.compress.as_str(), "0");
        assert_eq!(cfg.restore.staging_dir, PathBuf::from(DEFAULT_STAGING_DIR));
        assert!(!cfg.restore.cleanup);
    }

    #[test]
    fn load_remote_password_from_relative_file() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        write(&dir.join("pw"), "sekret\n");
        let cfg_path = dir.join("config.toml");
        write(
            &cfg_path,
            r#"
[connection]
mode = "remote"
host = "pve1.lan"
username = "root"
method = "password"
password_file = "pw"

[backup]
mode = "stop"
compress = "zstd"
node = "pve1"
version_tag = true

[restore]
staging_dir = "/srv/staging"
cleanup = true
vmid = 101
"#,
        );

        let cfg = Config::load(&cfg_path).unwrap();
        let Connection::Remote(t) = &cfg.connection else {
            panic!("expected remote");
        };
        assert_eq!(t.port, DEFAULT_SSH_PORT);
        assert!(matches!(&t.auth, Auth::Password(p) if p == "sekret"));
        assert_eq!(cfg.origin(), "pve1.lan");
        assert_eq!(cfg.backup.mode, BackupMode::Stop);
        assert_eq!(cfg.backup.compress, CompressSetting::Zstd);
        assert_eq!(cfg.backup.node.as_deref(), Some("pve1"));
        assert!(cfg.backup.version_tag);
        assert_eq!(cfg.restore.vmid, Some(101));
        assert!(cfg.restore.cleanup);
    }

    #[test]
    fn remote_requires_credentials() {
        let tmp = TempDir::new().unwrap();
        let cfg_path = tmp.path().join("config.toml");
        write(
            &cfg_path,
            r#"
[connection]
mode = "remote"
host = "pve1.lan"
username = "root"
method = "identity"
"#,
        );
        let err = Config::load(&cfg_path).unwrap_err().to_string();
        assert!(err.contains("identity_file"), "err was: {err}");
    }

    #[test]
    fn rejects_unknown_values() {
        let tmp = TempDir::new().unwrap();
        let cfg_path = tmp.path().join("config.toml");
        write(
            &cfg_path,
            r#"
[connection]
mode = "local"

[backup]
compress = "bzip2"
"#,
        );
        let err = Config::load(&cfg_path).unwrap_err().to_string();
        assert!(err.contains("compress"), "err was: {err}");

        write(
            &cfg_path,
            r#"
[connection]
mode = "sideways"
"#,
        );
        let err = Config::load(&cfg_path).unwrap_err().to_string();
        assert!(err.contains("mode"), "err was: {err}");
    }

    #[test]
    fn print_config_redacts_password() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        write(&dir.join("pw"), "sekret");
        let cfg_path = dir.join("config.toml");
        write(
            &cfg_path,
            r#"
[connection]
mode = "remote"
host = "pve1.lan"
port = 2222
username = "root"
method = "password"
password_file = "pw"
"#,
        );

        let cfg = Config::load(&cfg_path).unwrap();
        let printed = cfg.to_redacted_toml().unwrap();
        assert!(printed.contains(r#"password = "<redacted>""#));
        assert!(!printed.contains("sekret"));
        assert!(printed.contains("port = 2222"));
        assert!(printed.contains("[restore]"));
    }
}
