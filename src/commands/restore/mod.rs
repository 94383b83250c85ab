use anyhow::{Context, Result, bail};
use clap::Args;
use std::path::PathBuf;
use tracing as log;

use crate::{
    AppCtx,
    store::DirStore,
    tooling::{Need, Toolbox},
    ui,
};

pub mod correlator;
pub mod join;

pub use correlator::{Correlator, Outcome, Resolution, Settings};

#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Store directory holding archives and their metadata sidecars
    #[arg(long)]
    pub from: PathBuf,

    /// Only restore this guest; overrides [restore].vmid
    #[arg(long)]
    pub vmid: Option<u32>,
}

impl RestoreArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        if !self.from.is_dir() {
            bail!("store {} is not a directory", self.from.display());
        }
        let store = DirStore::open(&self.from)?;

        let runner = ctx.runner()?;
        let result = (|| -> Result<Vec<Resolution>> {
            let tools = Toolbox::new(&ctx.cfg, runner.clone(), Need::Restore)?;
            let settings = Settings {
                staging_dir: ctx.cfg.restore.staging_dir.clone(),
                cleanup: ctx.cfg.restore.cleanup,
                vmid: self.vmid.or(ctx.cfg.restore.vmid),
            };
            log::info!(
                "[restore] from {} via staging {}",
                store.root().display(),
                settings.staging_dir.display()
            );
            run_restore(&store, Correlator::new(tools.runner(), tools.guest(), settings))
        })();
        if let Err(e) = runner.close() {
            log::debug!("close runner: {e}");
        }
        let resolutions = result?;

        ui::print_restore(&resolutions);
        let failed = resolutions
            .iter()
            .filter(|r| r.outcome.is_failure())
            .count();
        if failed > 0 {
            bail!("restore finished with {failed} failed record(s)");
        }
        Ok(())
    }
}

/// Feeds every record of `store` through `correlator` and collects one
/// resolution per record.
pub fn run_restore(store: &DirStore, mut correlator: Correlator) -> Result<Vec<Resolution>> {
    let mut resolutions = Vec::new();
    for record in store.records()? {
        let record = record.context("read store record")?;
        log::debug!("[restore] record {}", record.pathname);
        for r in correlator.feed(record) {
            log_resolution(&r);
            resolutions.push(r);
        }
        log::debug!("[restore] {} record(s) waiting for a partner", correlator.pending());
    }
    for r in correlator.finish() {
        log_resolution(&r);
        resolutions.push(r);
    }
    Ok(resolutions)
}

fn log_resolution(r: &Resolution) {
    match &r.outcome {
        Outcome::Failed(e) => log::warn!("[restore] {}: {e}", r.pathname),
        other => log::info!("[restore] {}: {other}", r.pathname),
    }
}
