use std::{collections::BTreeSet, sync::Arc};

use anyhow::Result;

use crate::{config::Config, exec::DynRunner, utils::bins::ensure_bins};

pub mod guest;
pub mod pvesh;
pub mod vzdump;

pub use guest::{GuestCli, GuestPort};
pub use pvesh::{PveshCli, PveshPort};
pub use vzdump::{VzdumpCli, VzdumpPort};

/// Which tools a job needs on the execution host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Need {
    Inventory,
    Backup,
    Restore,
}

pub struct Toolbox {
    runner: Arc<DynRunner>,
    pvesh: Arc<dyn PveshPort>,
    vzdump: Arc<dyn VzdumpPort>,
    guest: Arc<dyn GuestPort>,
}

impl Toolbox {
    pub fn new(cfg: &Config, runner: Arc<DynRunner>, need: Need) -> Result<Self> {
        ensure_bins_for(&*runner, need)?;

        let pvesh = Arc::new(PveshCli::new(runner.clone())) as Arc<dyn PveshPort>;
        let vzdump =
            Arc::new(VzdumpCli::new(runner.clone(), cfg.backup.clone())) as Arc<dyn VzdumpPort>;
        let guest = Arc::new(GuestCli::new(runner.clone())) as Arc<dyn GuestPort>;

        Ok(Self {
            runner,
            pvesh,
            vzdump,
            guest,
        })
    }

    #[inline]
    pub fn runner(&self) -> Arc<DynRunner> {
        self.runner.clone()
    }
    #[inline]
    pub fn pvesh(&self) -> Arc<dyn PveshPort> {
        self.pvesh.clone()
    }
    #[inline]
    pub fn vzdump(&self) -> Arc<dyn VzdumpPort> {
        self.vzdump.clone()
    }
    #[inline]
    pub fn guest(&self) -> Arc<dyn GuestPort> {
        self.guest.clone()
    }
}

fn ensure_bins_for(runner: &DynRunner, need: Need) -> Result<()> {
    let mut all: BTreeSet<&'static str> = BTreeSet::new();
    all.extend(pvesh::REQ_BINS);
    match need {
        Need::Inventory => {}
        Need::Backup => all.extend(vzdump::REQ_BINS),
        Need::Restore => all.extend(guest::REQ_BINS),
    }
    ensure_bins(runner, all)
}
