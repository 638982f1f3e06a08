//! Error types for the sentryfs core library.
//!
//! All fallible operations return a [`Result<T>`] which is an alias for
//! `Result<T, OverlayError>`. The variants follow the categories the mount
//! surface has to distinguish: integrity violations, append-only policy
//! violations, backing filesystem errors, and sidecar failures.

use rustix::io::Errno;

/// Result type alias for operations that may return an OverlayError.
pub type Result<T> = std::result::Result<T, OverlayError>;

/// Error types for overlay operations.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    /// The stored checksum does not match the content on disk.
    #[error("checksum mismatch for {path}: stored {stored}, found {found}")]
    DigestMismatch {
        path: String,
        stored: String,
        found: String,
    },

    /// The handle already failed verification; the verdict is cached until release.
    #[error("handle for {path} previously failed verification")]
    VerificationFailed { path: String },

    /// The operation would destroy data under an append-only subtree.
    #[error("append-only policy forbids {op} of {path}")]
    AppendOnly { op: &'static str, path: String },

    /// Another writer handle is already open on this path.
    #[error("{path} is already open for writing")]
    WriterBusy { path: String },

    /// The handle is not in the handle table.
    #[error("unknown file handle {0}")]
    BadHandle(u64),

    /// I/O error from the backing filesystem (std surface).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error from the backing filesystem (raw errno surface).
    #[error("{0}")]
    Backing(#[from] Errno),

    /// A sidecar statement failed to prepare or execute.
    #[error("sidecar error: {0}")]
    Sidecar(#[from] rusqlite::Error),
}

impl OverlayError {
    pub(crate) fn append_only(op: &'static str, path: &str) -> Self {
        OverlayError::AppendOnly {
            op,
            path: path.to_string(),
        }
    }

    /// The errno to report on the mount surface for this error.
    ///
    /// Backing errors pass through unchanged; everything the overlay itself
    /// detects maps onto the conventional codes: EIO for integrity and
    /// sidecar-durability failures, EPERM for policy violations.
    pub fn errno(&self) -> Errno {
        match self {
            OverlayError::DigestMismatch { .. } | OverlayError::VerificationFailed { .. } => {
                Errno::IO
            }
            OverlayError::AppendOnly { .. } => Errno::PERM,
            OverlayError::WriterBusy { .. } => Errno::BUSY,
            OverlayError::BadHandle(..) => Errno::BADF,
            OverlayError::Io(err) => err
                .raw_os_error()
                .map_or(Errno::IO, Errno::from_raw_os_error),
            OverlayError::Backing(errno) => *errno,
            OverlayError::Sidecar(..) => Errno::IO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        let err = OverlayError::append_only("unlink", "/logs/a.txt");
        assert_eq!(err.errno(), Errno::PERM);

        let err = OverlayError::DigestMismatch {
            path: "/t.txt".into(),
            stored: "00".into(),
            found: "11".into(),
        };
        assert_eq!(err.errno(), Errno::IO);

        let err = OverlayError::Io(std::io::Error::from_raw_os_error(
            Errno::NOENT.raw_os_error(),
        ));
        assert_eq!(err.errno(), Errno::NOENT);

        let err = OverlayError::Backing(Errno::ACCESS);
        assert_eq!(err.errno(), Errno::ACCESS);

        assert_eq!(OverlayError::BadHandle(7).errno(), Errno::BADF);
    }
}
