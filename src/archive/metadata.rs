use std::io::Read;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{DumpName, Kind};
use crate::{
    config::Backup,
    error::{Error, Result},
};

pub const METADATA_FORMAT: &str = "proxmox-backup-meta";
pub const METADATA_VERSION: u64 = 1;

const SIDECAR_PREFIX: &str = ".vzdump-meta-";
const SIDECAR_SUFFIX: &str = ".json";

/// Detached descriptor stored next to every archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpMetadata {
    pub format: String,
    pub version: u64,
    /// Signed so that bogus negative ids survive decoding and fail validation.
    pub vmid: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub vm_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub node: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub backup_mode: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub backup_compression: String,
    pub archive_name: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub archive_size: u64,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub origin: String,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

pub fn sidecar_name(archive_name: &str) -> String {
    format!("{SIDECAR_PREFIX}{archive_name}{SIDECAR_SUFFIX}")
}

/// Inverse of [`sidecar_name`]; `None` for anything that is not a sidecar.
pub fn parse_sidecar_name(name: &str) -> Option<&str> {
    name.strip_prefix(SIDECAR_PREFIX)?
        .strip_suffix(SIDECAR_SUFFIX)
        .filter(|archive| !archive.is_empty())
}

impl DumpMetadata {
    /// Record for a freshly streamed archive. The guest kind is taken from
    /// the archive name itself.
    pub fn for_archive(
        archive_name: &str,
        vmid: u32,
        backup: &Backup,
        origin: &str,
        archive_size: u64,
        created_at: OffsetDateTime,
    ) -> Self {
        let vm_type = DumpName::parse(archive_name)
            .map(|(kind, _)| kind.as_str().to_string())
            .unwrap_or_default();
        Self {
            format: METADATA_FORMAT.into(),
            version: METADATA_VERSION,
            vmid: i64::from(vmid),
            vm_type,
            node: backup.node.clone().unwrap_or_default(),
            backup_mode: backup.mode.as_str().into(),
            backup_compression: backup.compress.as_str().into(),
            archive_name: archive_name.into(),
            archive_size,
            created_at: Some(created_at),
            origin: origin.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Parse(format!("encode metadata: {e}")))
    }

    /// Decodes a sidecar. Absent format/version tags are tolerated, wrong
    /// ones are not.
    pub fn decode(mut reader: impl Read) -> Result<Self> {
        let mut payload = Vec::new();
        reader
            .read_to_end(&mut payload)
            .map_err(|e| Error::io("read metadata", e))?;
        let meta: Self = serde_json::from_slice(&payload)
            .map_err(|e| Error::Parse(format!("decode metadata: {e}")))?;

        if !meta.format.is_empty() && meta.format != METADATA_FORMAT {
            return Err(Error::Parse(format!(
                "unsupported metadata format: {}",
                meta.format
            )));
        }
        if meta.version != 0 && meta.version != METADATA_VERSION {
            return Err(Error::UnsupportedVersion {
                what: "metadata",
                version: meta.version,
            });
        }
        Ok(meta)
    }

    /// Checks the record against the archive it was paired with and returns
    /// the guest it describes.
    pub fn validate(&self, archive_name: &str) -> Result<(Kind, u32)> {
        if !self.archive_name.is_empty() && self.archive_name != archive_name {
            return Err(Error::Validation(format!(
                "metadata archive name mismatch: {} != {}",
                self.archive_name, archive_name
            )));
        }
        let vmid = u32::try_from(self.vmid)
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| Error::Validation(format!("invalid vmid in metadata: {}", self.vmid)))?;
        let kind = self.vm_type.parse::<Kind>()?;
        Ok((kind, vmid))
    }
}
