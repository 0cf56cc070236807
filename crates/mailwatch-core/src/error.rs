//! Error types for the core library.

use mailwatch_imap::Uid;
use thiserror::Error;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The endpoint was unreachable, the TLS handshake failed, or the
    /// connection dropped.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The server rejected the credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A command was refused or answered unexpectedly (for example the
    /// mailbox could not be opened read-write).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A single message could not be retrieved or decoded.
    #[error("Failed to fetch message {uid}: {reason}")]
    Fetch {
        /// The message that failed.
        uid: Uid,
        /// What went wrong.
        reason: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true when trying again with the same settings cannot help:
    /// rejected credentials or an invalid configuration.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Authentication(_) | Self::Config(_))
    }
}

impl From<mailwatch_imap::Error> for Error {
    fn from(err: mailwatch_imap::Error) -> Self {
        match err {
            mailwatch_imap::Error::Auth(reason) => Self::Authentication(reason),
            err if err.is_transport() => Self::Connection(err.to_string()),
            err => Self::Protocol(err.to_string()),
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_imap_error_mapping() {
        let auth = Error::from(mailwatch_imap::Error::Auth("bad password".into()));
        assert!(matches!(auth, Error::Authentication(ref r) if r == "bad password"));

        let timeout = Error::from(mailwatch_imap::Error::Timeout(Duration::from_secs(30)));
        assert!(matches!(timeout, Error::Connection(_)));

        let refused = Error::from(mailwatch_imap::Error::Protocol("NO [CANNOT]".into()));
        assert!(matches!(refused, Error::Protocol(_)));
    }

    #[test]
    fn test_classification() {
        let fetch = Error::Fetch {
            uid: Uid::new(3).unwrap(),
            reason: "truncated".into(),
        };
        assert!(!fetch.is_permanent());
        assert_eq!(fetch.to_string(), "Failed to fetch message 3: truncated");
        assert!(Error::Authentication(String::new()).is_permanent());
        assert!(Error::Config("no host".into()).is_permanent());
        assert!(!Error::Connection("reset".into()).is_permanent());
        assert!(!Error::Protocol("BYE".into()).is_permanent());
    }
}
