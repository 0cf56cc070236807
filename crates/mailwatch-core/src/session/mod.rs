//! The mail-protocol session seam and the session factory.
//!
//! [`Connector`] and [`MailSession`] describe the capabilities the watch loop
//! and the message operations need from a protocol client. The IMAP
//! implementation lives in [`imap`]; tests substitute an in-memory one.

mod imap;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

pub use imap::ImapConnector;
pub use mailwatch_imap::{MailboxStatus, Uid};

use crate::config::{Credentials, ServerConfig};
use crate::query::SearchQuery;
use crate::Result;

/// Access mode a mailbox is opened with; fixed until it is reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// EXAMINE: nothing can be modified.
    ReadOnly,
    /// SELECT: flags can be changed and messages expunged.
    ReadWrite,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "read-only"),
            Self::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// How a [`MailSession::wait_for_change`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The mailbox count changed.
    Changed,
    /// The context deadline passed.
    TimedOut,
    /// The context was cancelled.
    Cancelled,
}

/// About thirty years; the deadline used when a timeout overflows.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Deadline plus cancellation handed to a blocking wait.
#[derive(Debug, Clone)]
pub struct WaitContext {
    deadline: Instant,
    token: CancellationToken,
}

impl WaitContext {
    /// Creates a context from an absolute deadline and a token.
    #[must_use]
    pub const fn new(deadline: Instant, token: CancellationToken) -> Self {
        Self { deadline, token }
    }

    /// Creates a context expiring `timeout` from now with a fresh token.
    ///
    /// A timeout too large to represent ends in the far future instead.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);
        Self::new(deadline, CancellationToken::new())
    }

    /// The deadline.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left until the deadline, zero once it has passed.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Requests cancellation of every wait using this context.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when cancellation is requested.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

/// Opens authenticated sessions.
pub trait Connector: Send + Sync {
    /// Session type produced.
    type Session: MailSession;

    /// Connects over an encrypted transport and authenticates.
    ///
    /// Fails with [`Error::Connection`](crate::Error::Connection) when the
    /// endpoint or handshake fails and
    /// [`Error::Authentication`](crate::Error::Authentication) when the
    /// credentials are rejected.
    fn connect(
        &self,
        server: &ServerConfig,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// An authenticated protocol session.
///
/// A session is used by exactly one task at a time.
pub trait MailSession: Send {
    /// Opens `mailbox` with the given access mode.
    fn open_mailbox(
        &mut self,
        mailbox: &str,
        access: Access,
    ) -> impl Future<Output = Result<MailboxStatus>> + Send;

    /// Blocks until the open mailbox's message count changes, the context's
    /// deadline passes, or the context is cancelled.
    ///
    /// An already-cancelled context returns [`WaitOutcome::Cancelled`]
    /// without touching the server.
    fn wait_for_change(
        &mut self,
        ctx: &WaitContext,
    ) -> impl Future<Output = Result<WaitOutcome>> + Send;

    /// Evaluates `query` on the server; UIDs come back in ascending order.
    fn search(&mut self, query: &SearchQuery) -> impl Future<Output = Result<Vec<Uid>>> + Send;

    /// Retrieves the raw RFC 5322 message.
    fn fetch(&mut self, uid: Uid) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Adds the `\Deleted` flag.
    fn flag_deleted(&mut self, uid: Uid) -> impl Future<Output = Result<()>> + Send;

    /// Removes every `\Deleted` message; returns how many were removed.
    fn expunge(&mut self) -> impl Future<Output = Result<u32>> + Send;

    /// Logs out and releases the connection.
    fn disconnect(self) -> impl Future<Output = Result<()>> + Send
    where
        Self: Sized;
}

/// Lazily connects and caches one session.
///
/// [`session`](Self::session) connects on first use and returns the cached
/// handle afterwards; [`dispose`](Self::dispose) disconnects it, and the next
/// call connects afresh. There is never more than one live connection per
/// factory.
pub struct SessionFactory<'a, C: Connector> {
    connector: &'a C,
    server: &'a ServerConfig,
    credentials: &'a Credentials,
    session: Option<C::Session>,
}

impl<C: Connector> fmt::Debug for SessionFactory<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("host", &self.server.host)
            .field("connected", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl<'a, C: Connector> SessionFactory<'a, C> {
    /// Creates a factory; nothing is connected yet.
    #[must_use]
    pub const fn new(connector: &'a C, server: &'a ServerConfig, credentials: &'a Credentials) -> Self {
        Self {
            connector,
            server,
            credentials,
            session: None,
        }
    }

    /// Returns true while a session is cached.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Returns the cached session, connecting first if there is none.
    ///
    /// # Errors
    ///
    /// Propagates connection and authentication failures; nothing is cached
    /// in that case.
    pub async fn session(&mut self) -> Result<&mut C::Session> {
        let session = match self.session.take() {
            Some(session) => session,
            None => {
                tracing::debug!(host = %self.server.host, "opening session");
                self.connector.connect(self.server, self.credentials).await?
            }
        };
        Ok(self.session.insert(session))
    }

    /// Disconnects and forgets the cached session.
    ///
    /// Disconnect failures are logged; the handle is dropped either way.
    pub async fn dispose(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::debug!(host = %self.server.host, "closing session");
            if let Err(err) = session.disconnect().await {
                tracing::warn!(host = %self.server.host, error = %err, "disconnect failed");
            }
        }
    }
}

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
    use crate::testing::{Call, FakeServer};

    #[tokio::test]
    async fn test_session_is_cached() {
        let server = FakeServer::new();
        let connector = server.connector();
        let (config, creds) = FakeServer::config();
        let mut factory = SessionFactory::new(&connector, &config, &creds);

        assert!(!factory.is_connected());
        factory.session().await.unwrap();
        factory.session().await.unwrap();
        assert!(factory.is_connected());
        assert_eq!(server.connects(), 1);
    }

    #[tokio::test]
    async fn test_dispose_then_reconnect() {
        let server = FakeServer::new();
        let connector = server.connector();
        let (config, creds) = FakeServer::config();
        let mut factory = SessionFactory::new(&connector, &config, &creds);

        factory.session().await.unwrap();
        factory.dispose().await;
        assert!(!factory.is_connected());
        factory.dispose().await;
        factory.session().await.unwrap();

        assert_eq!(server.connects(), 2);
        assert_eq!(
            server.calls(),
            vec![Call::Connect, Call::Disconnect, Call::Connect]
        );
    }

    #[tokio::test]
    async fn test_failed_connect_caches_nothing() {
        let server = FakeServer::new();
        server.fail_next_connect(crate::Error::Connection("refused".into()));
        let connector = server.connector();
        let (config, creds) = FakeServer::config();
        let mut factory = SessionFactory::new(&connector, &config, &creds);

        assert!(factory.session().await.is_err());
        assert!(!factory.is_connected());
        factory.session().await.unwrap();
        assert_eq!(server.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_context() {
        let ctx = WaitContext::with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.remaining(), Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(ctx.remaining(), Duration::ZERO);

        let clone = ctx.clone();
        assert!(!ctx.is_cancelled());
        clone.cancel();
        assert!(ctx.is_cancelled());
        ctx.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_timeout_saturates() {
        let ctx = WaitContext::with_timeout(Duration::MAX);
        assert!(ctx.remaining() >= Duration::from_secs(86_400 * 365 * 29));

        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert!(!ctx.remaining().is_zero());
    }
}
