//! Error taxonomy for the issuance core.
//!
//! Every failure the core can surface maps to exactly one [`PkiError`] variant. The HTTP layer
//! only needs [`PkiError::status_code`] to answer the caller.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced by the ledger, serial counter, lock and issuance service.
#[derive(Error, Debug)]
pub enum PkiError {
    /// A certificate with this common name is already recorded in the index.
    #[error("A certificate with the name '{0}' was already issued")]
    Conflict(String),

    /// The index is held by another issuance. Carries the time the marker was written.
    #[error("Index file was locked {}. Please try again later.", .acquired_at.to_rfc3339())]
    Locked { acquired_at: DateTime<Utc> },

    /// An index line does not follow the legacy index format.
    #[error("Malformed index line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// The generated bundle is incomplete.
    #[error("Invalid certificate bundle: {0}")]
    Validation(String),

    /// The requested common name cannot be recorded in the index.
    #[error("Invalid common name '{0}': only letters, digits and '_' are allowed (1-64 chars)")]
    InvalidName(String),

    /// Key generation or signing failed inside OpenSSL.
    #[error("Crypto operation failed: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    /// Filesystem failure on any read or write.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl PkiError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PkiError::Io {
            context: context.into(),
            source,
        }
    }

    /// HTTP status code a web collaborator should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            PkiError::Conflict(_) => 409,
            PkiError::Locked { .. } => 423,
            PkiError::InvalidName(_) => 400,
            PkiError::Parse { .. }
            | PkiError::Validation(_)
            | PkiError::Crypto(_)
            | PkiError::Io { .. } => 500,
        }
    }
}

/// Result alias used throughout the issuance core.
pub type Result<T> = std::result::Result<T, PkiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_codes() {
        assert_eq!(PkiError::Conflict("alice".to_string()).status_code(), 409);
        let locked = PkiError::Locked {
            acquired_at: Utc.timestamp_millis_opt(0).unwrap(),
        };
        assert_eq!(locked.status_code(), 423);
        assert_eq!(PkiError::InvalidName("a b".to_string()).status_code(), 400);
        assert_eq!(PkiError::Validation("empty".to_string()).status_code(), 500);
        let io = PkiError::io(
            "read index",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(io.status_code(), 500);
    }

    #[test]
    fn test_locked_message_carries_timestamp() {
        let locked = PkiError::Locked {
            acquired_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        };
        let message = locked.to_string();
        assert!(message.contains("2024-03-01T12:00:00"));
        assert!(message.contains("try again later"));
    }
}
