use std::{
    io::{self, Cursor, Read},
    sync::Arc,
};

use crate::{
    archive::{Compression, DumpName, HEADER_LEN, MachineRef, dumpname::DUMP_FILENAME_VERSION},
    config::Backup,
    error::{Error, Result},
    exec::{DynRunner, StreamHandle},
    utils::{process::CmdSpec, time},
};

pub const REQ_BINS: &[&str] = &["vzdump"];

pub trait VzdumpPort: Send + Sync {
    /// Starts `vzdump --stdout` for `machine` and names the archive from the
    /// first bytes of its output.
    fn capture(&self, machine: &MachineRef) -> Result<ArchiveReader>;
}

pub struct VzdumpCli {
    runner: Arc<DynRunner>,
    backup: Backup,
}

impl VzdumpCli {
    pub fn new(runner: Arc<DynRunner>, backup: Backup) -> Self {
        Self { runner, backup }
    }

    fn command(&self, vmid: u32) -> CmdSpec {
        let mut cmd = CmdSpec::new("vzdump").arg(vmid.to_string()).args([
            "--stdout",
            "--mode",
            self.backup.mode.as_str(),
            "--compress",
            self.backup.compress.as_str(),
        ]);
        if let Some(node) = &self.backup.node {
            cmd = cmd.args(["--node", node.as_str()]);
        }
        cmd
    }
}

impl VzdumpPort for VzdumpCli {
    fn capture(&self, machine: &MachineRef) -> Result<ArchiveReader> {
        let mut stream = self.runner.open_stream(&self.command(machine.vmid))?;

        let header = match read_header(&mut stream, HEADER_LEN) {
            Ok(h) => h,
            Err(e) => {
                let _ = stream.abort();
                return Err(e.into());
            }
        };
        if header.is_empty() {
            // Finalized by the EOF above, so the diagnostic is complete.
            return Err(Error::Command {
                program: stream.program().to_string(),
                status: "empty vzdump stream header".into(),
                diagnostic: stream.diagnostic().to_string(),
            });
        }

        let compression = Compression::classify(&header);
        let mut name = DumpName::new(machine.kind, machine.vmid, time::now(), compression);
        if self.backup.version_tag {
            name = name.with_version(DUMP_FILENAME_VERSION)?;
        }
        tracing::debug!(
            "[backup] {machine}: {} header bytes, compression {:?}, archive {name}",
            header.len(),
            compression
        );

        Ok(ArchiveReader {
            name,
            header: Cursor::new(header),
            stream,
            count: 0,
        })
    }
}

/// Reads up to `len` bytes, stopping early only at end of stream.
pub fn read_header(r: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

/// The full archive stream: the peeked header followed by the rest of
/// vzdump's stdout. EOF joins the process; a failed exit is reported as a
/// read error instead of a clean end.
pub struct ArchiveReader {
    name: DumpName,
    header: Cursor<Vec<u8>>,
    stream: StreamHandle,
    count: u64,
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader")
            .field("name", &self.name.to_string())
            .field("count", &self.count)
            .finish()
    }
}

impl ArchiveReader {
    #[inline]
    pub fn name(&self) -> &DumpName {
        &self.name
    }

    /// Bytes handed to the consumer so far, header included.
    #[inline]
    pub fn bytes_read(&self) -> u64 {
        self.count
    }

    #[inline]
    pub fn diagnostic(&self) -> &str {
        self.stream.diagnostic()
    }

    /// Waits for vzdump to exit. Safe to call after EOF.
    pub fn close(&mut self) -> Result<()> {
        self.stream.close()
    }

    pub fn abort(&mut self) -> Result<()> {
        self.stream.abort()
    }
}

impl Read for ArchiveReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match self.header.read(buf)? {
            0 => self.stream.read(buf)?,
            n => n,
        };
        self.count += n as u64;
        Ok(n)
    }
}
