use std::{
    io::{self, Read},
    thread::{self, JoinHandle},
};

use super::{Exit, Output, Process};
use crate::{
    error::{Error, Result},
    utils::cancel::{CancelGuard, CancelToken},
};

/// A started command whose stdout is read by the caller while stderr is
/// drained on a helper thread.
///
/// The process is owned until finalized. Finalization (first EOF, `close`,
/// `abort` or drop) waits for the exit, joins the drain and caches the
/// outcome; later calls return the cached outcome without waiting again.
pub struct StreamHandle {
    program: String,
    stdout: Box<dyn Read + Send>,
    process: Box<dyn Process>,
    drain: Option<JoinHandle<Vec<u8>>>,
    cancel: CancelToken,
    _abort_hook: Option<CancelGuard>,
    diagnostic: String,
    outcome: Option<Result<()>>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("program", &self.program)
            .field("finalized", &self.outcome.is_some())
            .finish()
    }
}

impl StreamHandle {
    pub fn new(
        program: &str,
        stdout: Box<dyn Read + Send>,
        mut stderr: Box<dyn Read + Send>,
        process: Box<dyn Process>,
        cancel: CancelToken,
        abort_hook: Option<CancelGuard>,
    ) -> Result<Self> {
        let drain = thread::Builder::new()
            .name(format!("{program}-stderr"))
            .spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                buf
            })
            .map_err(|e| Error::spawn(program, e))?;

        Ok(Self {
            program: program.to_string(),
            stdout,
            process,
            drain: Some(drain),
            cancel,
            _abort_hook: abort_hook,
            diagnostic: String::new(),
            outcome: None,
        })
    }

    #[inline]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Trimmed stderr text. Only complete once the handle is finalized.
    #[inline]
    pub fn diagnostic(&self) -> &str {
        &self.diagnostic
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn close(&mut self) -> Result<()> {
        self.finalize()
    }

    /// Kills the command instead of waiting for it to finish on its own.
    pub fn abort(&mut self) -> Result<()> {
        if self.outcome.is_none()
            && let Err(e) = self.process.abort()
        {
            tracing::debug!("abort {}: {e}", self.program);
        }
        self.finalize()
    }

    pub fn finalize(&mut self) -> Result<()> {
        if let Some(done) = &self.outcome {
            return done.clone();
        }

        // Release our end of stdout so a writer blocked on a full pipe
        // sees EPIPE instead of hanging the wait below.
        self.stdout = Box::new(io::empty());
        let waited = self.process.wait();
        let text = self
            .drain
            .take()
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default();
        self.diagnostic = String::from_utf8_lossy(&text).trim().to_string();

        let outcome = match waited {
            Ok(exit) if exit.success() => Ok(()),
            _ if self.cancel.is_cancelled() => Err(Error::Cancelled {
                program: self.program.clone(),
                diagnostic: self.diagnostic.clone(),
            }),
            Err(e) => Err(Error::io(format!("wait for {}", self.program), e)),
            Ok(exit) => Err(self.command_error(&exit)),
        };
        if let Err(e) = &outcome {
            tracing::debug!("{} finished with error: {e}", self.program);
        }
        self.outcome = Some(outcome.clone());
        outcome
    }

    fn command_error(&self, exit: &Exit) -> Error {
        Error::Command {
            program: self.program.clone(),
            status: exit.to_string(),
            diagnostic: self.diagnostic.clone(),
        }
    }

    /// Reads stdout to the end and finalizes. A failing command whose
    /// stderr is empty reports its stdout instead.
    pub fn collect(mut self) -> Result<Output> {
        let mut stdout = Vec::new();
        if let Err(e) = self.stdout.read_to_end(&mut stdout) {
            let _ = self.abort();
            return Err(Error::io(format!("read {} output", self.program), e));
        }
        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        match self.finalize() {
            Ok(()) => Ok(Output {
                stdout,
                stderr: self.diagnostic.clone(),
            }),
            Err(Error::Command {
                program,
                status,
                diagnostic,
            }) if diagnostic.is_empty() => Err(Error::Command {
                program,
                status,
                diagnostic: stdout.trim().to_string(),
            }),
            Err(e) => Err(e),
        }
    }
}

impl Read for StreamHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(done) = &self.outcome {
            return match done {
                Ok(()) => Ok(0),
                Err(e) => Err(e.clone().into_io()),
            };
        }
        let n = match self.stdout.read(buf) {
            Ok(n) => n,
            // A cancelled transport fails reads; report the cancel instead.
            Err(e) if self.cancel.is_cancelled() => {
                return Err(match self.abort() {
                    Ok(()) => e,
                    Err(cancelled) => cancelled.into_io(),
                });
            }
            Err(e) => return Err(e),
        };
        if n == 0 && !buf.is_empty() {
            // A failed exit outranks the clean EOF.
            self.finalize().map_err(Error::into_io)?;
        }
        Ok(n)
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.outcome.is_none() {
            let _ = self.abort();
        }
    }
}
