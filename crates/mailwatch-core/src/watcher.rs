//! Caller-facing entry point.

use std::convert::Infallible;

use tokio::sync::{Mutex, watch};

use crate::config::{Credentials, ServerConfig, WatchConfig, WatchOptions};
use crate::dispatch::ChangeHandler;
use crate::message::Message;
use crate::ops::{self, SearchReport};
use crate::query::SearchQuery;
use crate::session::{Connector, ImapConnector, SessionFactory, Uid};
use crate::watch::{self as watch_loop, WatchState};
use crate::Result;

/// Watches one mailbox and runs message operations against it.
///
/// Every call gets its own session: the watch loop holds one for the
/// lifetime of a cycle, and each [`search`](Self::search) or
/// [`delete`](Self::delete) connects, does its work and disconnects. A
/// `Watcher` can therefore be shared (`&self`) between the task running
/// [`watch`](Self::watch) and tasks reacting to its notifications.
///
/// # Example
///
/// ```no_run
/// use mailwatch_core::{SearchQuery, Watcher};
///
/// # async fn example() -> mailwatch_core::Result<()> {
/// let watcher = Watcher::new("imap.example.com", "me@example.com", "app-password");
/// let unread = watcher.search(&SearchQuery::Unseen).await?;
/// println!("{} unread", unread.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Watcher<C = ImapConnector> {
    connector: C,
    server: ServerConfig,
    credentials: Credentials,
    options: WatchOptions,
    state: watch::Sender<WatchState>,
    watch_lock: Mutex<()>,
}

impl Watcher {
    /// Creates a watcher for `host` over implicit TLS, watching `INBOX`.
    #[must_use]
    pub fn new(host: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::with_config(ServerConfig::new(host), Credentials::new(username, password))
    }

    /// Creates a watcher from explicit server settings.
    #[must_use]
    pub fn with_config(server: ServerConfig, credentials: Credentials) -> Self {
        Self::with_connector(ImapConnector, server, credentials)
    }

    /// Creates a watcher from a settings file's contents.
    #[must_use]
    pub fn from_config(config: &WatchConfig) -> Self {
        Self::with_config(config.server.clone(), config.credentials.clone()).options(config.options())
    }
}

impl<C: Connector> Watcher<C> {
    /// Creates a watcher over a custom protocol connector.
    #[must_use]
    pub fn with_connector(connector: C, server: ServerConfig, credentials: Credentials) -> Self {
        let (state, _) = watch::channel(WatchState::Idle);
        Self {
            connector,
            server,
            credentials,
            options: WatchOptions::default(),
            state,
            watch_lock: Mutex::new(()),
        }
    }

    /// Replaces the watch parameters.
    #[must_use]
    pub fn options(mut self, options: WatchOptions) -> Self {
        self.options = options;
        self
    }

    /// The watched mailbox.
    #[must_use]
    pub fn mailbox(&self) -> &str {
        &self.options.mailbox
    }

    /// Server settings.
    #[must_use]
    pub const fn server(&self) -> &ServerConfig {
        &self.server
    }

    /// The protocol connector.
    #[must_use]
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    /// Subscribes to watch loop state changes.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<WatchState> {
        self.state.subscribe()
    }

    /// Runs the watch loop, calling `handler` on every mailbox count change.
    ///
    /// Never returns normally. A second call on the same watcher waits until
    /// the first one has ended, so at most one loop runs per watcher.
    ///
    /// # Errors
    ///
    /// Returns the connection, authentication or protocol error that ended
    /// the loop. Restarting is up to the caller.
    pub async fn watch<H>(&self, handler: &mut H) -> Result<Infallible>
    where
        H: ChangeHandler + ?Sized,
    {
        let _guard = self.watch_lock.lock().await;
        tracing::info!(host = %self.server.host, mailbox = %self.options.mailbox, "starting watch");
        watch_loop::watch(
            &self.connector,
            &self.server,
            &self.credentials,
            &self.options,
            handler,
            &self.state,
        )
        .await
    }

    /// Fetches every message matching `query` that is not flagged
    /// `\Deleted`, silently omitting the ones that fail.
    ///
    /// # Errors
    ///
    /// Returns connection, authentication and protocol errors.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<Message>> {
        Ok(self.search_report(query).await?.messages)
    }

    /// Like [`search`](Self::search), also reporting the skipped messages.
    ///
    /// # Errors
    ///
    /// Returns connection, authentication and protocol errors.
    pub async fn search_report(&self, query: &SearchQuery) -> Result<SearchReport> {
        let mut factory = self.factory();
        let result = match factory.session().await {
            Ok(session) => ops::search_report(session, &self.options.mailbox, query).await,
            Err(err) => Err(err),
        };
        factory.dispose().await;
        result
    }

    /// Flags `uids` deleted and expunges the mailbox, returning how many
    /// messages were removed.
    ///
    /// Every message already flagged `\Deleted` is removed too. An empty
    /// `uids` returns without connecting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`](crate::Error::Protocol) if the mailbox
    /// cannot be opened read-write, and connection or authentication errors.
    pub async fn delete(&self, uids: &[Uid]) -> Result<u32> {
        if uids.is_empty() {
            tracing::debug!("nothing to delete");
            return Ok(0);
        }
        let mut factory = self.factory();
        let result = match factory.session().await {
            Ok(session) => ops::delete(session, &self.options.mailbox, uids).await,
            Err(err) => Err(err),
        };
        factory.dispose().await;
        result
    }

    const fn factory(&self) -> SessionFactory<'_, C> {
        SessionFactory::new(&self.connector, &self.server, &self.credentials)
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
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::dispatch::{ChangeNotification, notification_channel};
    use crate::session::Access;
    use crate::testing::{Call, FakeConnector, FakeServer};
    use crate::Error;

    fn watcher(server: &FakeServer) -> Watcher<FakeConnector> {
        let (config, creds) = FakeServer::config();
        Watcher::with_connector(server.connector(), config, creds)
    }

    fn uid(n: u32) -> Uid {
        Uid::new(n).unwrap()
    }

    #[tokio::test]
    async fn test_delete_empty_makes_no_calls() {
        let server = FakeServer::with_messages([1]);
        let watcher = watcher(&server);

        assert_eq!(watcher.delete(&[]).await.unwrap(), 0);
        assert!(server.calls().is_empty());
    }

    #[tokio::test]
    async fn test_operations_use_their_own_session() {
        let server = FakeServer::with_messages([1, 2, 3]);
        let watcher = watcher(&server);

        let messages = watcher.search(&SearchQuery::All).await.unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(watcher.delete(&[uid(2)]).await.unwrap(), 1);

        assert_eq!(server.connects(), 2);
        assert_eq!(server.open_sessions(), 0);
        assert_eq!(server.stored_uids(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_failed_operation_still_disconnects() {
        let server = FakeServer::with_messages([1]);
        server.refuse_read_write();
        let watcher = watcher(&server);

        let err = watcher.delete(&[uid(1)]).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(server.open_sessions(), 0);
        assert_eq!(server.calls().last(), Some(&Call::Disconnect));
    }

    #[tokio::test]
    async fn test_connect_failure_is_returned() {
        let server = FakeServer::new();
        server.fail_next_connect(Error::Authentication("bad password".into()));
        let watcher = watcher(&server);

        let err = watcher.search(&SearchQuery::All).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        assert!(server.calls().is_empty());
    }

    #[tokio::test]
    async fn test_search_report_lists_failures() {
        let server = FakeServer::with_messages([1, 2]);
        server.fail_fetch(1);
        let watcher = watcher(&server);

        let report = watcher.search_report(&SearchQuery::All).await.unwrap();
        assert_eq!(report.messages.len(), 1);
        assert_eq!(report.failures[0].uid, uid(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_triggers_search_on_separate_session() {
        let server = FakeServer::with_messages([1]);
        let watcher = Arc::new(watcher(&server));
        let (mut tx, mut rx) = notification_channel();

        let looping = Arc::clone(&watcher);
        let handle = tokio::spawn(async move { looping.watch(&mut tx).await });

        tokio::time::sleep(Duration::from_secs(60)).await;
        server.add_message(2);
        server.push_change();

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification, ChangeNotification { mailbox: "INBOX".into() });
        let messages = watcher.search(&SearchQuery::All).await.unwrap();
        assert_eq!(messages.len(), 2);

        // The watch session is still open; the search session is gone.
        assert_eq!(server.connects(), 2);
        assert_eq!(server.open_sessions(), 1);
        assert_eq!(server.count(&Call::Open(Access::ReadOnly)), 1);
        assert_eq!(server.count(&Call::Open(Access::ReadWrite)), 1);
        assert_eq!(*watcher.state().borrow(), WatchState::Watching);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_cycle_keeps_one_session() {
        let server = FakeServer::new();
        let watcher = Arc::new(watcher(&server).options(WatchOptions {
            mailbox: "INBOX".into(),
            cycle: Duration::MAX,
        }));
        let (mut tx, mut rx) = notification_channel();

        let looping = Arc::clone(&watcher);
        let handle = tokio::spawn(async move { looping.watch(&mut tx).await });

        tokio::time::sleep(Duration::from_secs(3 * 60 * 60)).await;
        server.push_change();
        rx.recv().await.unwrap();

        assert_eq!(server.connects(), 1);
        assert_eq!(*watcher.state().borrow(), WatchState::Watching);
        assert_eq!(watcher.mailbox(), "INBOX");
        handle.abort();
    }
}
