use std::{
    fs::{self, File},
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
    process::{Child, Stdio},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use super::{Exit, FileSink, FileStat, Process, Runner, StreamHandle};
use crate::{
    error::{Error, Result},
    utils::{cancel::CancelToken, process::CmdSpec},
};

const WAIT_POLL: Duration = Duration::from_millis(25);

/// Runs commands as direct children of this process.
#[derive(Clone, Default)]
pub struct LocalRunner {
    cancel: CancelToken,
}

impl LocalRunner {
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }
}

struct LocalProcess {
    child: Arc<Mutex<Child>>,
}

fn lock(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(|e| e.into_inner())
}

impl Process for LocalProcess {
    // try_wait polling keeps the lock free for the cancel hook, which
    // kills from another thread.
    fn wait(&mut self) -> io::Result<Exit> {
        loop {
            if let Some(status) = lock(&self.child).try_wait()? {
                return Ok(status.into());
            }
            thread::sleep(WAIT_POLL);
        }
    }

    fn abort(&mut self) -> io::Result<()> {
        match lock(&self.child).kill() {
            // Already exited.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        }
    }
}

impl Runner for LocalRunner {
    fn open_stream(&self, cmd: &CmdSpec) -> Result<StreamHandle> {
        tracing::debug!("exec: {}", cmd.render());
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled {
                program: cmd.program().to_string(),
                diagnostic: String::new(),
            });
        }

        let mut child = cmd
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::spawn(cmd.program(), e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::spawn(cmd.program(), io::Error::other("stdout not piped")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::spawn(cmd.program(), io::Error::other("stderr not piped")))?;

        let child = Arc::new(Mutex::new(child));
        let hook_child = child.clone();
        let guard = self.cancel.on_cancel(move || {
            let _ = lock(&hook_child).kill();
        });

        StreamHandle::new(
            cmd.program(),
            Box::new(stdout),
            Box::new(stderr),
            Box::new(LocalProcess { child }),
            self.cancel.clone(),
            Some(guard),
        )
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let f = File::open(path).map_err(|e| Error::io(format!("open {}", path.display()), e))?;
        Ok(Box::new(f))
    }

    fn create(&self, path: &Path) -> Result<Box<dyn FileSink>> {
        let f =
            File::create(path).map_err(|e| Error::io(format!("create {}", path.display()), e))?;
        Ok(Box::new(LocalFile {
            path: path.to_path_buf(),
            out: BufWriter::new(f),
        }))
    }

    fn stat(&self, path: &Path) -> Result<FileStat> {
        let meta = fs::metadata(path).map_err(|e| Error::io(format!("stat {}", path.display()), e))?;
        Ok(FileStat {
            size: meta.len(),
            modified: meta.modified().ok(),
        })
    }

    fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| Error::io(format!("remove {}", path.display()), e))
    }
}

struct LocalFile {
    path: PathBuf,
    out: BufWriter<File>,
}

impl Write for LocalFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

impl FileSink for LocalFile {
    fn finish(self: Box<Self>) -> Result<()> {
        let LocalFile { path, out } = *self;
        let file = out
            .into_inner()
            .map_err(|e| Error::io(format!("flush {}", path.display()), e.into_error()))?;
        file.sync_all()
            .map_err(|e| Error::io(format!("sync {}", path.display()), e))
    }
}
