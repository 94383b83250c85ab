use std::{io, sync::Arc};

use thiserror::Error;

/// Errors raised by the execution, capture and correlation layers.
///
/// The type is `Clone` so a finalized stream can hand the same outcome to
/// every caller that observes EOF or close, and so one restore failure can be
/// reported on both records of a pair.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("{program} failed: {status}: {diagnostic}")]
    Command {
        program: String,
        status: String,
        diagnostic: String,
    },

    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("ssh session: {0}")]
    Session(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("{program} cancelled: {diagnostic}")]
    Cancelled { program: String, diagnostic: String },

    #[error("{0}")]
    Parse(String),

    #[error("unsupported {what} version: {version}")]
    UnsupportedVersion { what: &'static str, version: u64 },

    #[error("{0}")]
    Validation(String),

    #[error("missing metadata for archive {0}")]
    MissingMetadata(String),

    #[error("missing archive for metadata {0}")]
    MissingArchive(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    pub fn spawn(program: impl Into<String>, source: io::Error) -> Self {
        Error::Spawn {
            program: program.into(),
            source: Arc::new(source),
        }
    }

    pub fn session(e: impl std::fmt::Display) -> Self {
        Error::Session(e.to_string())
    }

    /// Trimmed side-channel text carried by transport failures.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Error::Command { diagnostic, .. } | Error::Cancelled { diagnostic, .. } => {
                Some(diagnostic.as_str())
            }
            _ => None,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Command { .. }
                | Error::Spawn { .. }
                | Error::Session(_)
                | Error::Io { .. }
                | Error::Cancelled { .. }
        )
    }

    /// Converts back into an `io::Error` for `Read` implementations,
    /// keeping the original error reachable through `get_ref`.
    pub fn into_io(self) -> io::Error {
        io::Error::other(self)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        // A stream that failed during finalization surfaces as io::Error
        // to its reader; unwrap it instead of nesting.
        if e.get_ref().is_none() {
            return Error::io("io", e);
        }
        let kind = e.kind();
        match e.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(err)) => *err,
            Some(Err(other)) => Error::io("io", io::Error::new(kind, other)),
            None => Error::io("io", io::Error::from(kind)),
        }
    }
}

impl From<ssh2::Error> for Error {
    fn from(e: ssh2::Error) -> Self {
        Error::session(e)
    }
}
