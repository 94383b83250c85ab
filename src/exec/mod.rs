//! Command execution backends.
//!
//! Business code only sees [`Runner`]; whether a command runs as a local
//! child or inside an ssh channel is decided once, in [`connect`].

use std::{
    fmt,
    io::{Read, Write},
    path::Path,
    sync::Arc,
    time::SystemTime,
};

use crate::{
    config::{Config, Connection},
    error::Result,
    utils::{cancel::CancelToken, process::CmdSpec},
};

pub mod local;
pub mod remote;
pub mod stream;

pub use local::LocalRunner;
pub use remote::SshRunner;
pub use stream::StreamHandle;

/// Captured output of a command that exited successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
}

/// How a process (or remote channel) ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exit {
    code: Option<i32>,
    detail: String,
}

impl Exit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            detail: format!("exit status: {code}"),
        }
    }

    pub fn terminated(detail: impl Into<String>) -> Self {
        Self {
            code: None,
            detail: detail.into(),
        }
    }

    #[inline]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for Exit {
    fn from(st: std::process::ExitStatus) -> Self {
        Self {
            code: st.code(),
            detail: st.to_string(),
        }
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

/// The live side of a started command.
pub trait Process: Send {
    /// Blocks until the command has ended.
    fn wait(&mut self) -> std::io::Result<Exit>;
    /// Terminates the command without waiting for it.
    fn abort(&mut self) -> std::io::Result<()>;
}

/// Writable file on the execution host. `finish` flushes and reports
/// failures that only show up once the data is complete.
pub trait FileSink: Write + Send {
    fn finish(self: Box<Self>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

pub trait Runner: Send + Sync {
    /// Starts `cmd` with stdout exposed as a stream and stderr drained in
    /// the background.
    fn open_stream(&self, cmd: &CmdSpec) -> Result<StreamHandle>;

    /// Runs `cmd` to completion. Non-zero exits become `Error::Command`.
    fn run(&self, cmd: &CmdSpec) -> Result<Output> {
        self.open_stream(cmd)?.collect()
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>>;
    fn create(&self, path: &Path) -> Result<Box<dyn FileSink>>;
    fn stat(&self, path: &Path) -> Result<FileStat>;
    fn remove(&self, path: &Path) -> Result<()>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub type DynRunner = dyn Runner;

pub fn connect(cfg: &Config, cancel: CancelToken) -> Result<Arc<DynRunner>> {
    match &cfg.connection {
        Connection::Local { .. } => Ok(Arc::new(LocalRunner::new(cancel))),
        Connection::Remote(target) => Ok(Arc::new(SshRunner::new(target.clone(), cancel))),
    }
}
