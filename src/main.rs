use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use std::{path::PathBuf, sync::Arc};
use tracing_subscriber::{EnvFilter, fmt};

mod archive;
mod commands;
mod config;
mod error;
mod exec;
mod inventory;
mod store;
mod tooling;
mod ui;
mod utils;

use commands::{backup, inventory as inventory_cmd, restore};
use config::Config;
use exec::DynRunner;
use utils::cancel::{CancelToken, cancel_on_signals};

pub struct AppCtx {
    pub cfg: Config,
    pub cancel: CancelToken,
}

impl AppCtx {
    /// Execution backend for this run, local or ssh per `[connection]`.
    pub fn runner(&self) -> Result<Arc<DynRunner>> {
        Ok(exec::connect(&self.cfg, self.cancel.clone())?)
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "vzbridge",
    about = "Stream Proxmox VE guest dumps into a backup store and restore them",
    arg_required_else_help = false,
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[arg(long, default_value = "./config.toml", global = true)]
    config: PathBuf,

    #[arg(long, global = true)]
    debug: bool,

    #[arg(long, global = true)]
    check_config: bool,

    #[arg(long, global = true)]
    print_config: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Back up guests into a store directory
    Backup(backup::BackupArgs),
    /// Restore guests from a store directory
    Restore(restore::RestoreArgs),
    /// List guests known to the cluster
    List(inventory_cmd::ListArgs),
    /// Check that the management API answers
    Ping(inventory_cmd::PingArgs),
}

fn init_tracing(debug: bool) {
    let default = if debug { "trace" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(debug)
        .with_line_number(debug)
        .without_time()
        .try_init();
}

fn main() -> Result<()> {
    // Before any thread exists; see utils::time.
    utils::time::init_local_offset();
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if cli.command.is_none() && !cli.check_config && !cli.print_config {
        let mut cmd = Cli::command();
        cmd.print_help()?;
        println!();
        return Ok(());
    }
    let cfg = Config::load(&cli.config)?;

    if cli.check_config {
        tracing::info!("config OK");
        return Ok(());
    }
    if cli.print_config {
        println!("{}", cfg.to_redacted_toml()?);
        return Ok(());
    }

    let Some(cmd) = cli.command else {
        let mut cmd = Cli::command();
        cmd.print_help()?;
        println!();
        return Ok(());
    };

    let cancel = CancelToken::new();
    cancel_on_signals(cancel.clone())?;

    let ctx = AppCtx {
        cfg,
        cancel,
    };

    match cmd {
        Cmd::Backup(args) => args.run(&ctx),
        Cmd::Restore(args) => args.run(&ctx),
        Cmd::List(args) => args.run(&ctx),
        Cmd::Ping(args) => args.run(&ctx),
    }
}
