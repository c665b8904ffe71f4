//! Error types for git-fastcdc operations.

use thiserror::Error;

/// Errors that can occur while driving the filter protocol or the chunk
/// store.
///
/// Only a subset of these is recoverable within a session: see
/// [`FilterError::is_request_local`].
#[derive(Error, Debug)]
pub enum FilterError {
    /// Malformed pkt-line, unexpected packet, or unsupported protocol
    /// version. Fatal to the session.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A smudge referenced a digest that is not reachable from the chunk
    /// branch.
    #[error("chunk {0} not found on chunk branch")]
    MissingChunk(String),

    /// Smudge input is not a chunk manifest or contains a malformed digest
    /// line.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// A git plumbing command exited non-zero or produced unparsable
    /// output.
    #[error("git {command} failed: {detail}")]
    Storage {
        /// The plumbing subcommand that failed.
        command: String,
        /// Captured stderr, or a parse-failure description.
        detail: String,
    },

    /// The compare-and-swap on the chunk branch failed even after a retry.
    #[error("chunk branch moved concurrently: {0}")]
    RefContention(String),

    /// A `fastcdc.*` configuration value is malformed or out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Temp-file or pipe error. Fatal.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FilterError {
    /// Whether this error is confined to the current request.
    ///
    /// Request-local errors are reported to the host with `status=error`
    /// and the session continues; everything else tears the session down.
    #[must_use]
    pub const fn is_request_local(&self) -> bool {
        matches!(
            self,
            Self::MissingChunk(_) | Self::InvalidManifest(_) | Self::Storage { .. }
        )
    }
}

/// Result type for git-fastcdc operations.
pub type Result<T> = std::result::Result<T, FilterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_protocol() {
        let err = FilterError::Protocol("bad length header".to_string());
        assert!(err.to_string().contains("protocol error"));
        assert!(err.to_string().contains("bad length header"));
    }

    #[test]
    fn error_display_missing_chunk() {
        let err = FilterError::MissingChunk("ab".repeat(20));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn error_display_storage() {
        let err = FilterError::Storage {
            command: "mktree".to_string(),
            detail: "fatal: entry not sorted".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("git mktree failed"));
        assert!(msg.contains("entry not sorted"));
    }

    #[test]
    fn request_local_split() {
        assert!(FilterError::MissingChunk(String::new()).is_request_local());
        assert!(FilterError::InvalidManifest(String::new()).is_request_local());
        assert!(FilterError::Storage {
            command: String::new(),
            detail: String::new(),
        }
        .is_request_local());

        assert!(!FilterError::Protocol(String::new()).is_request_local());
        assert!(!FilterError::RefContention(String::new()).is_request_local());
        assert!(!FilterError::InvalidConfig(String::new()).is_request_local());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(!FilterError::Io(io).is_request_local());
    }
}
