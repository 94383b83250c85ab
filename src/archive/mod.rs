//! Archive naming and metadata codecs.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub mod dumpname;
pub mod metadata;

pub use dumpname::DumpName;
pub use metadata::DumpMetadata;

/// Guest kind as named by the hypervisor tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Qemu,
    Lxc,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Qemu => "qemu",
            Kind::Lxc => "lxc",
        }
    }

    /// Archive format written by vzdump for this kind.
    pub fn base_ext(self) -> &'static str {
        match self {
            Kind::Qemu => "vma",
            Kind::Lxc => "tar",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Kind::Qemu => "VM",
            Kind::Lxc => "CT",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qemu" => Ok(Kind::Qemu),
            "lxc" => Ok(Kind::Lxc),
            other => Err(Error::Validation(format!("invalid vm type: {other:?}"))),
        }
    }
}

/// Compression detected from the first bytes of a dump stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Lzo,
    Zstd,
}

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const LZO_MAGIC: &[u8] = &[0x89, 0x4c, 0x5a, 0x4f, 0x00, 0x0d, 0x0a, 0x1a, 0x0a];

/// Bytes peeked from a dump stream; long enough for every magic above.
pub const HEADER_LEN: usize = 16;

impl Compression {
    pub fn classify(header: &[u8]) -> Self {
        if header.starts_with(GZIP_MAGIC) {
            Compression::Gzip
        } else if header.starts_with(ZSTD_MAGIC) {
            Compression::Zstd
        } else if header.starts_with(LZO_MAGIC) {
            Compression::Lzo
        } else {
            Compression::None
        }
    }

    /// File suffix including the leading dot, empty when uncompressed.
    pub fn suffix(self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Lzo => ".lzo",
            Compression::Zstd => ".zst",
        }
    }
}

/// A guest resolved from the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineRef {
    pub vmid: u32,
    pub kind: Kind,
    pub node: Option<String>,
}

impl fmt::Display for MachineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.label(), self.vmid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_magics() {
        assert_eq!(Compression::classify(&[0x1f, 0x8b, 0x08, 0]), Compression::Gzip);
        assert_eq!(
            Compression::classify(&[0x28, 0xb5, 0x2f, 0xfd, 0x04]),
            Compression::Zstd
        );
        assert_eq!(
            Compression::classify(b"\x89LZO\x00\r\n\x1a\n\x10\x30"),
            Compression::Lzo
        );
    }

    #[test]
    fn classify_everything_else_as_uncompressed() {
        assert_eq!(Compression::classify(b"VMA\0"), Compression::None);
        assert_eq!(Compression::classify(&[]), Compression::None);
        // Truncated magics do not count.
        assert_eq!(Compression::classify(&[0x1f]), Compression::None);
        assert_eq!(Compression::classify(&[0x28, 0xb5, 0x2f]), Compression::None);
        assert_eq!(Compression::classify(b"\x89LZO\x00\r\n"), Compression::None);
    }

    #[test]
    fn kind_parse_and_exts() {
        assert_eq!("qemu".parse::<Kind>().unwrap(), Kind::Qemu);
        assert_eq!("lxc".parse::<Kind>().unwrap().base_ext(), "tar");
        assert!("openvz".parse::<Kind>().is_err());
        assert_eq!(Compression::Zstd.suffix(), ".zst");
        assert_eq!(Compression::None.suffix(), "");
    }
}
