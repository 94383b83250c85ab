use std::{
    collections::{HashMap, HashSet},
    fmt, io,
    path::PathBuf,
    sync::Arc,
};

use tracing as log;

use super::join::{Offer, PairJoin, Side};
use crate::{
    archive::{
        DumpMetadata, DumpName, Kind,
        dumpname::staging_name,
        metadata::parse_sidecar_name,
    },
    error::{Error, Result},
    exec::DynRunner,
    store::Record,
    tooling::GuestPort,
    utils::time,
};

/// What happened to one incoming record.
#[derive(Debug, Clone)]
pub enum Outcome {
    Restored {
        kind: Kind,
        vmid: u32,
        staged: PathBuf,
        /// Removing the staged file failed; the restore itself stands.
        cleanup: Option<Error>,
    },
    /// Filtered out by the configured vmid.
    Skipped,
    /// Neither an archive nor a sidecar.
    Ignored,
    Failed(Error),
}

impl Outcome {
    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Restored {
                kind,
                vmid,
                cleanup: None,
                ..
            } => write!(f, "restored {kind} {vmid}"),
            Outcome::Restored {
                kind,
                vmid,
                cleanup: Some(e),
                ..
            } => write!(f, "restored {kind} {vmid} (cleanup failed: {e})"),
            Outcome::Skipped => f.write_str("skipped"),
            Outcome::Ignored => f.write_str("ignored"),
            Outcome::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub pathname: String,
    pub outcome: Outcome,
}

impl Resolution {
    fn new(pathname: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            pathname: pathname.into(),
            outcome,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub staging_dir: PathBuf,
    pub cleanup: bool,
    pub vmid: Option<u32>,
}

/// Pairs archives with their sidecars, in whatever order they arrive, and
/// restores each archive once both are known.
///
/// Archives wait unstaged; nothing touches the staging directory until the
/// matching sidecar has been validated.
pub struct Correlator {
    runner: Arc<DynRunner>,
    guest: Arc<dyn GuestPort>,
    settings: Settings,
    join: PairJoin<String, Record, (String, DumpMetadata)>,
    rejected: HashMap<String, Error>,
    skipped: HashSet<String>,
}

enum Class {
    Sidecar(String),
    Payload,
    Other,
}

fn classify(name: &str) -> Class {
    if let Some(archive) = parse_sidecar_name(name) {
        return Class::Sidecar(archive.to_string());
    }
    if DumpName::parse(name).is_ok() {
        return Class::Payload;
    }
    let lower = name.to_ascii_lowercase();
    if lower.contains(".vma") || lower.contains(".tar") {
        return Class::Payload;
    }
    Class::Other
}

impl Correlator {
    pub fn new(runner: Arc<DynRunner>, guest: Arc<dyn GuestPort>, settings: Settings) -> Self {
        Self {
            runner,
            guest,
            settings,
            join: PairJoin::new(),
            rejected: HashMap::new(),
            skipped: HashSet::new(),
        }
    }

    /// Number of halves still waiting for their partner.
    #[inline]
    pub fn pending(&self) -> usize {
        self.join.len()
    }

    /// Consumes one record. Returns every record resolved by it, which may
    /// include a previously buffered partner, or nothing while it waits.
    pub fn feed(&mut self, record: Record) -> Vec<Resolution> {
        let name = record.name().to_string();
        match classify(&name) {
            Class::Sidecar(archive) => self.on_sidecar(archive, record),
            Class::Payload => self.on_payload(name, record),
            Class::Other => vec![Resolution::new(record.pathname, Outcome::Ignored)],
        }
    }

    /// Ends the job: every half left without a partner is an error.
    pub fn finish(self) -> Vec<Resolution> {
        self.join
            .into_orphans()
            .map(|(archive, side)| match side {
                Side::Left(payload) => {
                    log::warn!("[restore] {archive}: no metadata received");
                    Resolution::new(payload.pathname, Outcome::Failed(Error::MissingMetadata(archive)))
                }
                Side::Right((pathname, _)) => {
                    log::warn!("[restore] {archive}: metadata without archive");
                    Resolution::new(pathname, Outcome::Failed(Error::MissingArchive(archive)))
                }
            })
            .collect()
    }

    fn on_sidecar(&mut self, archive: String, mut record: Record) -> Vec<Resolution> {
        if self.skipped.contains(&archive) {
            return vec![Resolution::new(record.pathname, Outcome::Skipped)];
        }
        let meta = match DumpMetadata::decode(&mut record.reader) {
            Ok(m) => m,
            Err(e) => return self.reject(archive, record.pathname, e),
        };

        // The archive name decides when it carries an id, so both halves
        // are filtered on the same value.
        let vmid = DumpName::parse(&archive)
            .map(|(_, id)| i64::from(id))
            .unwrap_or(meta.vmid);
        if let Some(want) = self.settings.vmid
            && vmid != i64::from(want)
        {
            log::debug!("[restore] {archive}: vmid {vmid} filtered out");
            self.skipped.insert(archive.clone());
            let mut out = vec![Resolution::new(record.pathname, Outcome::Skipped)];
            if let Some(Side::Left(payload)) = self.join.take(&archive) {
                out.push(Resolution::new(payload.pathname, Outcome::Skipped));
            }
            return out;
        }

        if let Err(e) = meta.validate(&archive) {
            return self.reject(archive, record.pathname, e);
        }

        match self.join.offer_right(archive.clone(), (record.pathname, meta)) {
            Offer::Waiting => Vec::new(),
            Offer::Complete(payload, (pathname, meta)) => {
                self.complete(&archive, payload, pathname, &meta)
            }
            Offer::Duplicate(side) => {
                let pathname = match side {
                    Side::Right((p, _)) => p,
                    Side::Left(payload) => payload.pathname,
                };
                vec![Resolution::new(
                    pathname,
                    Outcome::Failed(Error::Validation(format!(
                        "duplicate metadata for archive {archive}"
                    ))),
                )]
            }
        }
    }

    fn on_payload(&mut self, archive: String, record: Record) -> Vec<Resolution> {
        let parsed = match DumpName::parse(&archive) {
            Ok(p) => Some(p),
            Err(e) if archive.starts_with("vzdump-") => {
                return vec![Resolution::new(record.pathname, Outcome::Failed(e))];
            }
            Err(_) => None,
        };

        if let Some(e) = self.rejected.get(&archive) {
            return vec![Resolution::new(record.pathname, Outcome::Failed(e.clone()))];
        }
        if self.skipped.contains(&archive) {
            return vec![Resolution::new(record.pathname, Outcome::Skipped)];
        }
        if let (Some(want), Some((_, vmid))) = (self.settings.vmid, parsed)
            && vmid != want
        {
            log::debug!("[restore] {archive}: vmid {vmid} filtered out");
            self.skipped.insert(archive);
            return vec![Resolution::new(record.pathname, Outcome::Skipped)];
        }

        match self.join.offer_left(archive.clone(), record) {
            Offer::Waiting => Vec::new(),
            Offer::Complete(payload, (pathname, meta)) => {
                self.complete(&archive, payload, pathname, &meta)
            }
            Offer::Duplicate(side) => {
                let pathname = match side {
                    Side::Left(payload) => payload.pathname,
                    Side::Right((p, _)) => p,
                };
                vec![Resolution::new(
                    pathname,
                    Outcome::Failed(Error::Validation(format!("duplicate archive {archive}"))),
                )]
            }
        }
    }

    /// A bad sidecar fails its archive too, whether that is already waiting
    /// or arrives later.
    fn reject(&mut self, archive: String, pathname: String, e: Error) -> Vec<Resolution> {
        log::warn!("[restore] {archive}: rejected metadata: {e}");
        let mut out = vec![Resolution::new(pathname, Outcome::Failed(e.clone()))];
        if let Some(Side::Left(payload)) = self.join.take(&archive) {
            out.push(Resolution::new(payload.pathname, Outcome::Failed(e.clone())));
        }
        self.rejected.insert(archive, e);
        out
    }

    fn complete(
        &self,
        archive: &str,
        payload: Record,
        sidecar: String,
        meta: &DumpMetadata,
    ) -> Vec<Resolution> {
        let outcome = match self.stage_and_restore(archive, payload.reader, meta) {
            Ok(o) => o,
            Err(e) => {
                log::warn!("[restore] {archive}: {e}");
                Outcome::Failed(e)
            }
        };
        vec![
            Resolution::new(payload.pathname, outcome.clone()),
            Resolution::new(sidecar, outcome),
        ]
    }

    fn stage_and_restore(
        &self,
        archive: &str,
        mut reader: Box<dyn io::Read + Send>,
        meta: &DumpMetadata,
    ) -> Result<Outcome> {
        let (kind, vmid) = meta.validate(archive)?;
        let staged = self
            .settings
            .staging_dir
            .join(staging_name(archive, kind, vmid, time::now()));
        log::info!("[restore] {archive} -> {} ({kind} {vmid})", staged.display());

        let result = self.stage(&mut reader, &staged).and_then(|()| {
            self.guest.stop(kind, vmid)?;
            self.guest.restore(kind, vmid, &staged)
        });

        let cleanup = if self.settings.cleanup {
            self.runner.remove(&staged).err()
        } else {
            None
        };
        if let Some(e) = &cleanup {
            log::warn!("[restore] cleanup of {} failed: {e}", staged.display());
        }

        result?;
        log::info!("[restore] {kind} {vmid} restored from {archive}");
        Ok(Outcome::Restored {
            kind,
            vmid,
            staged,
            cleanup,
        })
    }

    fn stage(&self, reader: &mut dyn io::Read, staged: &std::path::Path) -> Result<()> {
        let mut sink = self.runner.create(staged)?;
        let written = io::copy(reader, &mut sink)
            .map_err(|e| Error::io(format!("stage {}", staged.display()), e))?;
        sink.finish()?;

        let st = self.runner.stat(staged)?;
        if st.size != written {
            return Err(Error::Validation(format!(
                "staged file {} has {} bytes, expected {written}",
                staged.display(),
                st.size
            )));
        }
        Ok(())
    }
}
