use std::{path::Path, sync::Arc};

use crate::{
    archive::Kind,
    error::{Error, Result},
    exec::DynRunner,
    utils::process::CmdSpec,
};

pub const REQ_BINS: &[&str] = &["qm", "qmrestore", "pct"];

/// Stop failures that mean "nothing to stop".
const ALREADY_STOPPED: &[&str] = &[
    "not running",
    "already stopped",
    "does not exist",
    "no such vm",
    "no such container",
    "configuration file",
];

pub fn is_already_stopped(diagnostic: &str) -> bool {
    let lower = diagnostic.to_lowercase();
    ALREADY_STOPPED.iter().any(|p| lower.contains(p))
}

/// Guest lifecycle commands (`qm` / `pct`).
pub trait GuestPort: Send + Sync {
    fn stop(&self, kind: Kind, vmid: u32) -> Result<()>;
    /// Restores `archive` over guest `vmid`, replacing it if present.
    fn restore(&self, kind: Kind, vmid: u32, archive: &Path) -> Result<()>;
}

pub struct GuestCli {
    runner: Arc<DynRunner>,
}

impl GuestCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self { runner }
    }
}

impl GuestPort for GuestCli {
    fn stop(&self, kind: Kind, vmid: u32) -> Result<()> {
        let tool = match kind {
            Kind::Qemu => "qm",
            Kind::Lxc => "pct",
        };
        let cmd = CmdSpec::new(tool).args(["stop".to_string(), vmid.to_string()]);
        match self.runner.run(&cmd) {
            Ok(_) => Ok(()),
            Err(e @ Error::Command { .. }) if e.diagnostic().is_some_and(is_already_stopped) => {
                tracing::debug!("{tool} stop {vmid}: ignored: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn restore(&self, kind: Kind, vmid: u32, archive: &Path) -> Result<()> {
        let file = archive.display().to_string();
        let id = vmid.to_string();
        let cmd = match kind {
            Kind::Qemu => CmdSpec::new("qmrestore").args([file, id, "--force".into()]),
            Kind::Lxc => CmdSpec::new("pct").args(["restore".into(), id, file, "--force".into()]),
        };
        self.runner.run(&cmd).map(|_| ())
    }
}
