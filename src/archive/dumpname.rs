use std::{fmt, sync::LazyLock};

use regex::Regex;
use time::OffsetDateTime;

use super::{Compression, Kind};
use crate::{
    error::{Error, Result},
    utils::{path::basename, time::dump_stamp},
};

/// Highest (and only) version tag accepted in `vzdump-v<N>-…` names.
pub const DUMP_FILENAME_VERSION: u64 = 1;

static DUMP_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^vzdump(?:-v([0-9]+))?-(qemu|lxc)-([0-9]+)-").expect("dump name pattern")
});

static ARCHIVE_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\.(vma|tar)(\.[a-z0-9]+)?$").expect("archive suffix pattern"));

/// Canonical `vzdump-<kind>-<id>-<stamp>.<ext>[.<comp>]` archive name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpName {
    pub kind: Kind,
    pub vmid: u32,
    pub stamp: String,
    pub compression: Compression,
    version: Option<u64>,
}

impl DumpName {
    pub fn new(kind: Kind, vmid: u32, at: OffsetDateTime, compression: Compression) -> Self {
        Self {
            kind,
            vmid,
            stamp: dump_stamp(at),
            compression,
            version: None,
        }
    }

    /// Adds an explicit `-v<N>` tag. Only the supported version is accepted.
    pub fn with_version(mut self, version: u64) -> Result<Self> {
        check_version(version)?;
        self.version = Some(version);
        Ok(self)
    }

    /// Extracts kind and id from a (possibly path-prefixed) dump filename.
    pub fn parse(name: &str) -> Result<(Kind, u32)> {
        let base = basename(name);
        let caps = DUMP_NAME_RE
            .captures(base)
            .ok_or_else(|| Error::Parse(format!("invalid vzdump filename: {base}")))?;

        if let Some(v) = caps.get(1) {
            let version: u64 = v
                .as_str()
                .parse()
                .map_err(|_| Error::Parse(format!("invalid vzdump filename version: {base}")))?;
            check_version(version)?;
        }

        let kind = caps[2].parse::<Kind>()?;
        let vmid = caps[3]
            .parse::<u32>()
            .map_err(|_| Error::Parse(format!("invalid vmid in filename: {base}")))?;
        Ok((kind, vmid))
    }
}

fn check_version(version: u64) -> Result<()> {
    if version != DUMP_FILENAME_VERSION {
        return Err(Error::UnsupportedVersion {
            what: "vzdump filename",
            version,
        });
    }
    Ok(())
}

impl fmt::Display for DumpName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("vzdump")?;
        if let Some(v) = self.version {
            write!(f, "-v{v}")?;
        }
        write!(
            f,
            "-{}-{}-{}.{}{}",
            self.kind,
            self.vmid,
            self.stamp,
            self.kind.base_ext(),
            self.compression.suffix()
        )
    }
}

/// Name under which an incoming archive is staged for `qmrestore` /
/// `pct restore`, which insist on the vzdump naming scheme.
pub fn staging_name(original: &str, kind: Kind, vmid: u32, now: OffsetDateTime) -> String {
    format!(
        "vzdump-{kind}-{vmid}-{}{}",
        dump_stamp(now),
        canonical_suffix(original, kind)
    )
}

/// The `.<ext>[.<comp>]` tail of `original`, or the bare base extension
/// when the name does not carry a recognisable one.
fn canonical_suffix(original: &str, kind: Kind) -> String {
    let base_ext = format!(".{}", kind.base_ext());
    let base = basename(original);
    // ASCII lowering keeps byte offsets aligned with `base`.
    let lower = base.to_ascii_lowercase();
    let Some(idx) = lower.find(&base_ext) else {
        return base_ext;
    };
    if ARCHIVE_SUFFIX_RE.is_match(&lower[idx..]) {
        base[idx..].to_string()
    } else {
        base_ext
    }
}
