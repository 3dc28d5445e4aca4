use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = HistoryError> = std::result::Result<T, E>;

/// Place in the database an error message refers to: a line number when the
/// database was being walked sequentially, a byte offset when it was being
/// accessed at random, or nothing at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    None,
    Line(u64),
    Offset(u64),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Location::None => Ok(()),
            Location::Line(line) => write!(f, ":{}", line),
            Location::Offset(offset) => write!(f, "@{}", offset),
        }
    }
}

/// Errors raised by the history database.
///
/// Callers dispatch on the variant; the rendered message carries the file
/// path and, where known, the line or offset the failure refers to.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("bad history handle")]
    BadHandle,

    #[error("`{0}' isn't a valid history method")]
    UnknownMethod(String),

    #[error("{context} {}{location}: {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        location: Location,
        #[source]
        source: std::io::Error,
    },

    #[error("{reason} {}{location}", .path.display())]
    Parse {
        reason: &'static str,
        path: PathBuf,
        location: Location,
    },

    #[error("error formatting history line for {}", .path.display())]
    Format { path: PathBuf },

    #[error("new history line too long {}@{offset}", .path.display())]
    ReplaceTooLong { path: PathBuf, offset: u64 },

    #[error("no history entry to replace in {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("dbz not open for this history file {}", .path.display())]
    IndexNotOwned { path: PathBuf },

    #[error("dbz already open in this process")]
    IndexBusy,

    #[error("dbz table full {}", .path.display())]
    IndexFull { path: PathBuf },

    #[error("history not open for writing {}", .path.display())]
    ReadOnly { path: PathBuf },

    #[error("can't expire from read/write history {}", .path.display())]
    ExpireFromWritable { path: PathBuf },

    #[error("path already set in handle")]
    PathAlreadySet,

    #[error("callback failed {}{location}", .path.display())]
    Callback { path: PathBuf, location: Location },

    #[error("can't {action} server for `{reason}': {cause}")]
    Server {
        action: &'static str,
        reason: String,
        cause: anyhow::Error,
    },
}

impl HistoryError {
    pub(crate) fn io(
        context: &'static str,
        path: impl Into<PathBuf>,
        location: Location,
        source: std::io::Error,
    ) -> Self {
        HistoryError::Io { context, path: path.into(), location, source }
    }

    /// The underlying file went stale (rotated away under us on NFS).
    pub(crate) fn is_stale(&self) -> bool {
        match self {
            HistoryError::Io { source, .. } => {
                source.raw_os_error() == Some(libc::ESTALE)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_renders_like_errloc() {
        assert_eq!(Location::Line(42).to_string(), ":42");
        assert_eq!(Location::Offset(1234).to_string(), "@1234");
        assert_eq!(Location::None.to_string(), "");
    }

    #[test]
    fn io_message_carries_path_and_offset() {
        let err = HistoryError::io(
            "can't read history",
            "/var/news/history",
            Location::Offset(99),
            std::io::Error::from_raw_os_error(libc::EIO),
        );
        let msg = err.to_string();
        assert!(msg.starts_with("can't read history /var/news/history@99: "));
    }
}
