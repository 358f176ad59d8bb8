#![forbid(unsafe_code)]
//! Error types for ext2-lite.
//!
//! Defines `Ext2Error` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for host-facing response codes.

use e2l_types::ParseError;
use thiserror::Error;

/// Unified error type for all ext2-lite operations.
#[derive(Debug, Error)]
pub enum Ext2Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("stale inode {0}")]
    Stale(u32),

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("name too long")]
    NameTooLong,

    #[error("file exists")]
    Exists,

    #[error("too many links")]
    TooManyLinks,

    #[error("read-only filesystem")]
    ReadOnly,

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidInput(&'static str),
}

impl Ext2Error {
    /// Convert this error into a POSIX errno suitable for host replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::Stale(_) => libc::EIO,
            Self::Format(_) | Self::InvalidInput(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists => libc::EEXIST,
            Self::TooManyLinks => libc::EMLINK,
            Self::ReadOnly => libc::EROFS,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
        }
    }

    /// Whether the error marks on-disk structure damage (drives the
    /// configured error policy).
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

impl From<ParseError> for Ext2Error {
    fn from(err: ParseError) -> Self {
        Self::Format(err.to_string())
    }
}

/// Result alias using `Ext2Error`.
pub type Result<T> = std::result::Result<T, Ext2Error>;

/// Hook invoked at every site that detects on-disk structure damage.
///
/// The mounted filesystem implements this with its configured error policy
/// (continue / remount read-only / panic) and on-disk `ERROR_FS` marking;
/// lower layers call it with the reporting function's name and a diagnostic
/// and then unwind with `Ext2Error::Corruption` where the operation cannot
/// proceed.
pub trait CorruptionSink: Send + Sync {
    fn fs_error(&self, function: &str, detail: &str);
}

/// Sink that only logs; used by tests and read-only tooling.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlySink;

impl CorruptionSink for LogOnlySink {
    fn fs_error(&self, _function: &str, _detail: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_taxonomy() {
        assert_eq!(Ext2Error::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(Ext2Error::NotFound("x".into()).to_errno(), libc::ENOENT);
        assert_eq!(Ext2Error::Exists.to_errno(), libc::EEXIST);
        assert_eq!(Ext2Error::NotEmpty.to_errno(), libc::ENOTEMPTY);
        assert_eq!(Ext2Error::NameTooLong.to_errno(), libc::ENAMETOOLONG);
        assert_eq!(Ext2Error::TooManyLinks.to_errno(), libc::EMLINK);
        assert_eq!(Ext2Error::Unsupported("x").to_errno(), libc::EOPNOTSUPP);
        assert_eq!(
            Ext2Error::Corruption {
                block: 3,
                detail: "bad".into()
            }
            .to_errno(),
            libc::EIO
        );
        assert_eq!(Ext2Error::Stale(12).to_errno(), libc::EIO);
        assert_eq!(Ext2Error::ReadOnly.to_errno(), libc::EROFS);
    }

    #[test]
    fn parse_error_converts_to_format() {
        let err: Ext2Error = ParseError::InvalidField {
            field: "magic",
            reason: "bad",
        }
        .into();
        assert!(matches!(err, Ext2Error::Format(_)));
    }

    #[test]
    fn corruption_predicate() {
        assert!(Ext2Error::Corruption {
            block: 0,
            detail: String::new()
        }
        .is_corruption());
        assert!(!Ext2Error::NoSpace.is_corruption());
    }
}
