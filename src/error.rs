use std::io;
use std::path::PathBuf;

use derive_more::Display;

use crate::record::{EntryID, PeID};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display)]
pub enum Error {
    #[display("log file {} does not exist", _0.display())]
    MissingFile(PathBuf),

    #[display("malformed record at {}:{line}: {reason}", path.display())]
    MalformedRecord {
        path: PathBuf,
        line: u64,
        reason: String,
    },

    #[display("unsupported event kind {tag} at {}:{line}", path.display())]
    UnsupportedEventKind { path: PathBuf, line: u64, tag: i64 },

    #[display("no End Computation record found in {}", _0.display())]
    TruncatedTrace(PathBuf),

    // A failed read other than end-of-file.
    #[display("couldn't read log file {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[display("entry {entry} occurrence {n} not found on PE {pe}")]
    EntryNotFound { pe: PeID, entry: EntryID, n: u64 },

    #[display("bad configuration at {}:{line}: {reason}", path.display())]
    Config {
        path: PathBuf,
        line: u64,
        reason: String,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the errors that stop reading a file (as opposed to lookups
    /// that simply came up empty).
    pub fn is_read_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedRecord { .. }
                | Error::UnsupportedEventKind { .. }
                | Error::TruncatedTrace(_)
                | Error::Io { .. }
        )
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
