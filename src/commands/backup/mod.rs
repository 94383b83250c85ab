use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use std::path::PathBuf;
use tracing as log;

use crate::{
    AppCtx,
    archive::{DumpMetadata, MachineRef, metadata::sidecar_name},
    config::Config,
    inventory::Inventory,
    store::{DirStore, RecordSink},
    tooling::{Need, Toolbox, VzdumpPort},
    ui,
    utils::time,
};

/// Which guests a backup job covers. Exactly one form must be given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Vmid(u32),
    Pool(String),
    All,
}

impl Selection {
    pub fn from_parts(vmid: Option<u32>, pool: Option<&str>, all: bool) -> Result<Self> {
        let pool = pool.map(str::trim).filter(|p| !p.is_empty());
        let given = usize::from(vmid.is_some()) + usize::from(pool.is_some()) + usize::from(all);
        if given == 0 {
            bail!("missing backup selection: vmid, pool or all");
        }
        if given > 1 {
            bail!("ambiguous backup selection: specify only one of vmid, pool or all");
        }
        Ok(match (vmid, pool) {
            (Some(0), _) => bail!("invalid vmid: 0"),
            (Some(id), _) => Selection::Vmid(id),
            (_, Some(p)) => {
                if !p
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
                {
                    bail!("invalid pool name: {p:?}");
                }
                Selection::Pool(p.to_string())
            }
            _ => Selection::All,
        })
    }

    /// Concrete guests, ascending by id. An empty result is an error.
    pub fn resolve(&self, inventory: &Inventory) -> Result<Vec<MachineRef>> {
        let machines = match self {
            Selection::Vmid(id) => vec![MachineRef {
                vmid: *id,
                kind: inventory.type_of(*id)?,
                node: inventory.node().map(str::to_string),
            }],
            Selection::Pool(p) => inventory.list_pool(p)?,
            Selection::All => inventory.list_all()?,
        };
        if machines.is_empty() {
            bail!("no VM/CT found for selection");
        }
        Ok(machines)
    }
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Store directory receiving archives and their metadata sidecars
    #[arg(long)]
    pub to: PathBuf,

    #[arg(long)]
    pub vmid: Option<u32>,

    #[arg(long)]
    pub pool: Option<String>,

    #[arg(long)]
    pub all: bool,
}

/// Result of backing up one guest.
#[derive(Debug)]
pub struct Stored {
    pub machine: MachineRef,
    pub outcome: Result<(String, u64)>,
}

impl BackupArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        let selection = Selection::from_parts(self.vmid, self.pool.as_deref(), self.all)?;
        let mut store = DirStore::open(&self.to)?;

        let runner = ctx.runner()?;
        let result = (|| -> Result<Vec<Stored>> {
            let tools = Toolbox::new(&ctx.cfg, runner.clone(), Need::Backup)?;
            let inventory = Inventory::new(tools.pvesh(), ctx.cfg.backup.node.clone());
            let machines = selection.resolve(&inventory)?;
            log::info!(
                "[backup] {} guest(s) -> {}",
                machines.len(),
                store.root().display()
            );
            Ok(run_backup(&ctx.cfg, &*tools.vzdump(), &machines, &mut store))
        })();
        if let Err(e) = runner.close() {
            log::debug!("close runner: {e}");
        }
        let stored = result?;

        ui::print_backup(&stored);
        let failed = stored.iter().filter(|s| s.outcome.is_err()).count();
        if failed > 0 {
            bail!("backup finished with {failed} failed guest(s)");
        }
        Ok(())
    }
}

/// Streams every guest into `sink`, one after the other. A failure only
/// affects its own guest.
pub fn run_backup(
    cfg: &Config,
    vzdump: &dyn VzdumpPort,
    machines: &[MachineRef],
    sink: &mut dyn RecordSink,
) -> Vec<Stored> {
    machines
        .iter()
        .map(|m| {
            let outcome = backup_one(cfg, vzdump, m, sink);
            match &outcome {
                Ok((name, n)) => log::info!("[backup] {m}: stored {name} ({n} bytes)"),
                Err(e) => log::warn!("[backup] {m}: {e:#}"),
            }
            Stored {
                machine: m.clone(),
                outcome,
            }
        })
        .collect()
}

fn backup_one(
    cfg: &Config,
    vzdump: &dyn VzdumpPort,
    machine: &MachineRef,
    sink: &mut dyn RecordSink,
) -> Result<(String, u64)> {
    log::info!("[backup] {machine}: starting vzdump");
    let mut reader = vzdump
        .capture(machine)
        .with_context(|| format!("start backup of {machine}"))?;
    let archive = reader.name().to_string();

    let stored = sink.put(&format!("/{archive}"), &mut reader);
    // Joins vzdump; after a failed put this kills it instead.
    let closed = match &stored {
        Ok(_) => reader.close(),
        Err(_) => reader.abort(),
    };
    let n = stored.with_context(|| format!("store {archive}"))?;
    closed.with_context(|| format!("vzdump for {machine}"))?;
    if !reader.diagnostic().is_empty() {
        log::debug!("[backup] {machine}: vzdump said: {}", reader.diagnostic());
    }
    if n != reader.bytes_read() {
        return Err(anyhow!(
            "store acknowledged {n} bytes of {archive}, {} were read",
            reader.bytes_read()
        ));
    }

    let meta = DumpMetadata::for_archive(
        &archive,
        machine.vmid,
        &cfg.backup,
        cfg.origin(),
        n,
        time::now(),
    );
    let body = meta.encode()?;
    sink.put(&format!("/{}", sidecar_name(&archive)), &mut body.as_slice())
        .with_context(|| format!("store metadata for {archive}"))?;
    Ok((archive, n))
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        io::Read,
        sync::{Arc, Mutex},
    };

    use super::*;
    use crate::{
        archive::Kind,
        config::{Backup, BackupMode, CompressSetting, Connection, Restore},
        exec::fake::{FakeRunner, Reply},
        tooling::{PveshCli, VzdumpCli},
    };

    #[derive(Default)]
    struct MemSink {
        records: HashMap<String, Vec<u8>>,
    }

    impl RecordSink for MemSink {
        fn put(&mut self, pathname: &str, reader: &mut dyn Read) -> Result<u64> {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            let n = buf.len() as u64;
            self.records.insert(pathname.to_string(), buf);
            Ok(n)
        }
    }

    fn cfg() -> Config {
        Config {
            connection: Connection::Local {
                host: Some("pve1.lan".into()),
            },
            backup: Backup {
                mode: BackupMode::Snapshot,
                compress: CompressSetting::Zstd,
                node: None,
                version_tag: false,
            },
            restore: Restore::default(),
        }
    }

    fn vm(vmid: u32, kind: Kind) -> MachineRef {
        MachineRef {
            vmid,
            kind,
            node: None,
        }
    }

    #[test]
    fn selection_requires_exactly_one_form() {
        let err = Selection::from_parts(None, None, false).unwrap_err();
        assert!(err.to_string().starts_with("missing backup selection"));
        let err = Selection::from_parts(Some(1), None, true).unwrap_err();
        assert!(err.to_string().starts_with("ambiguous backup selection"));
        let err = Selection::from_parts(None, Some("prod"), true).unwrap_err();
        assert!(err.to_string().starts_with("ambiguous backup selection"));

        assert_eq!(Selection::from_parts(Some(101), None, false).unwrap(), Selection::Vmid(101));
        assert_eq!(
            Selection::from_parts(None, Some(" prod "), false).unwrap(),
            Selection::Pool("prod".into())
        );
        assert_eq!(Selection::from_parts(None, None, true).unwrap(), Selection::All);
        assert!(Selection::from_parts(None, Some("../x"), false).is_err());
        assert!(Selection::from_parts(Some(0), None, false).is_err());
    }

    #[test]
    fn empty_selection_is_fatal_before_any_backup() {
        let fake = Arc::new(FakeRunner::new());
        fake.reply("pvesh", Reply::ok(r#"{"members":[]}"#));
        let inventory = Inventory::new(Arc::new(PveshCli::new(fake.clone())), None);
        let err = Selection::Pool("empty".into())
            .resolve(&inventory)
            .unwrap_err();
        assert_eq!(err.to_string(), "no VM/CT found for selection");
        assert!(fake.calls_to("vzdump").is_empty());
    }

    #[test]
    fn single_vmid_resolves_kind_from_inventory() {
        let fake = Arc::new(FakeRunner::new());
        fake.reply("pvesh", Reply::ok(r#"[{"vmid":200,"type":"lxc","node":"pve2"}]"#));
        let inventory = Inventory::new(Arc::new(PveshCli::new(fake)), Some("pve2".into()));
        let m = Selection::Vmid(200).resolve(&inventory).unwrap();
        assert_eq!(m, vec![MachineRef { vmid: 200, kind: Kind::Lxc, node: Some("pve2".into()) }]);
    }

    #[test]
    fn backup_streams_payload_then_sidecar() {
        let cfg = cfg();
        let fake = Arc::new(FakeRunner::new());
        let mut payload = vec![0x28, 0xb5, 0x2f, 0xfd];
        payload.extend_from_slice(&[7u8; 1000]);
        fake.reply("vzdump", Reply::ok(payload.clone()));
        let vzdump = VzdumpCli::new(fake.clone(), cfg.backup.clone());

        let mut sink = MemSink::default();
        let stored = run_backup(&cfg, &vzdump, &[vm(101, Kind::Qemu)], &mut sink);
        let (archive, n) = stored[0].outcome.as_ref().unwrap();
        assert!(archive.starts_with("vzdump-qemu-101-") && archive.ends_with(".vma.zst"));
        assert_eq!(*n, payload.len() as u64);
        assert_eq!(sink.records[&format!("/{archive}")], payload);

        let meta_bytes = &sink.records[&format!("/{}", sidecar_name(archive))];
        let meta = DumpMetadata::decode(meta_bytes.as_slice()).unwrap();
        assert_eq!(meta.vmid, 101);
        assert_eq!(meta.vm_type, "qemu");
        assert_eq!(&meta.archive_name, archive);
        assert_eq!(meta.archive_size, payload.len() as u64);
        assert_eq!(meta.origin, "pve1.lan");
        assert_eq!(meta.backup_compression, "zstd");
    }

    #[test]
    fn failed_guest_does_not_stop_the_job() {
        let cfg = cfg();
        let fake = Arc::new(FakeRunner::new());
        fake.reply("vzdump", Reply::fail(255, "ERROR: VM 101 locked"));
        fake.reply("vzdump", Reply::ok(&b"plain tar stream"[..]));
        let vzdump = VzdumpCli::new(fake.clone(), cfg.backup.clone());

        let mut sink = MemSink::default();
        let stored = run_backup(
            &cfg,
            &vzdump,
            &[vm(101, Kind::Qemu), vm(200, Kind::Lxc)],
            &mut sink,
        );
        let err = format!("{:#}", stored[0].outcome.as_ref().unwrap_err());
        assert!(err.contains("VM 101 locked"), "err was: {err}");
        let (archive, _) = stored[1].outcome.as_ref().unwrap();
        assert!(archive.ends_with(".tar"));
        // Nothing of the failed guest reached the store.
        assert_eq!(sink.records.len(), 2);
    }

    struct BrokenSink(Arc<Mutex<usize>>);

    impl RecordSink for BrokenSink {
        fn put(&mut self, _pathname: &str, reader: &mut dyn Read) -> Result<u64> {
            *self.0.lock().unwrap() += 1;
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf)?;
            bail!("store is full")
        }
    }

    #[test]
    fn store_failure_aborts_vzdump_and_skips_sidecar() {
        let cfg = cfg();
        let fake = Arc::new(FakeRunner::new());
        fake.reply("vzdump", Reply::ok(vec![0x1f, 0x8b, 1, 2, 3, 4, 5, 6, 7, 8]));
        let vzdump = VzdumpCli::new(fake, cfg.backup.clone());
        let puts = Arc::new(Mutex::new(0));
        let mut sink = BrokenSink(puts.clone());
        let stored = run_backup(&cfg, &vzdump, &[vm(101, Kind::Qemu)], &mut sink);
        let err = format!("{:#}", stored[0].outcome.as_ref().unwrap_err());
        assert!(err.contains("store is full"), "err was: {err}");
        assert_eq!(*puts.lock().unwrap(), 1);
    }
}
