use anyhow::Result;
use clap::Args;
use tracing as log;

use crate::{
    AppCtx,
    archive::MachineRef,
    inventory::Inventory,
    tooling::{Need, Toolbox},
    ui,
};

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only members of this pool
    #[arg(long)]
    pub pool: Option<String>,
}

impl ListArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        let runner = ctx.runner()?;
        let listed = (|| -> Result<Vec<MachineRef>> {
            let tools = Toolbox::new(&ctx.cfg, runner.clone(), Need::Inventory)?;
            let inventory = Inventory::new(tools.pvesh(), ctx.cfg.backup.node.clone());
            match &self.pool {
                Some(p) => inventory.list_pool(p),
                None => inventory.list_all(),
            }
        })();
        let _ = runner.close();
        ui::print_machines(&listed?);
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct PingArgs {}

impl PingArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        let runner = ctx.runner()?;
        let version = Toolbox::new(&ctx.cfg, runner.clone(), Need::Inventory)
            .and_then(|tools| tools.pvesh().version());
        let _ = runner.close();
        log::info!("{}: Proxmox VE {}", ctx.cfg.origin(), version?);
        Ok(())
    }
}
