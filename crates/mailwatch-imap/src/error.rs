//! Error types for the IMAP adapter.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during IMAP operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake or encryption error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// Error reported by the underlying IMAP client.
    #[error("IMAP error: {0}")]
    Imap(#[from] async_imap::error::Error),

    /// The server closed the connection before sending a greeting.
    #[error("Server sent no greeting")]
    MissingGreeting,

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Connecting took longer than the configured timeout.
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid state for the requested operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Protocol violation or unexpected data.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Returns true if the transport failed or went away, as opposed to the
    /// server refusing a command.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Tls(_)
                | Self::InvalidDnsName(_)
                | Self::MissingGreeting
                | Self::Timeout(_)
                | Self::Imap(
                    async_imap::error::Error::Io(_) | async_imap::error::Error::ConnectionLost
                )
        )
    }

    /// Maps a rejected LOGIN/AUTHENTICATE into [`Error::Auth`], keeping
    /// transport failures as they are.
    pub(crate) fn from_auth(err: async_imap::error::Error) -> Self {
        match err {
            err @ (async_imap::error::Error::No(_) | async_imap::error::Error::Bad(_)) => {
                Self::Auth(err.to_string())
            }
            other => Self::Imap(other),
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
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(Error::MissingGreeting.is_transport());
        assert!(Error::Timeout(Duration::from_secs(30)).is_transport());
        assert!(!Error::Auth("rejected".into()).is_transport());
        assert!(!Error::Protocol("junk".into()).is_transport());
    }

    #[test]
    fn test_connection_lost_is_not_auth() {
        let err = Error::from_auth(async_imap::error::Error::ConnectionLost);
        assert!(matches!(err, Error::Imap(_)));
        assert!(err.is_transport());
    }
}
