//! The mailbox watch loop.
//!
//! Each cycle opens its own session, examines the mailbox read-only and
//! waits for count changes. A wall-clock deadline fixed at the start of the
//! cycle bounds the wait: when it passes, the wait is cancelled, the loop
//! waits for it to return, disconnects, and starts the next cycle with a
//! fresh connection. Long-lived IDLE connections can die silently, and the
//! forced reconnect is what recovers them.
//!
//! ```text
//! Idle → Connecting → Watching ──(deadline)──→ Draining → Disconnected
//!            ↑                                                │
//!            └────────────────────────────────────────────────┘
//! ```
//!
//! Errors while connecting, opening or waiting end the loop and are
//! returned to the caller; there is no internal retry.

use std::convert::Infallible;
use std::fmt;

use tokio::sync::watch;

use crate::config::{Credentials, ServerConfig, WatchOptions};
use crate::dispatch::{ChangeHandler, ChangeNotification};
use crate::session::{Access, Connector, MailSession, SessionFactory, WaitContext, WaitOutcome};
use crate::Result;

/// Where the watch loop is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchState {
    /// Not started.
    #[default]
    Idle,
    /// Opening a session and the mailbox.
    Connecting,
    /// Blocked waiting for changes.
    Watching,
    /// Deadline reached; waiting for the cancelled wait to return.
    Draining,
    /// Session closed; the next cycle starts immediately.
    Disconnected,
}

impl fmt::Display for WatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Watching => "watching",
            Self::Draining => "draining",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Everything a cycle needs, borrowed for the lifetime of the loop.
struct Cycle<'a, C: Connector, H: ?Sized> {
    connector: &'a C,
    server: &'a ServerConfig,
    credentials: &'a Credentials,
    options: &'a WatchOptions,
    handler: &'a mut H,
    state: &'a watch::Sender<WatchState>,
    notification: ChangeNotification,
}

/// Runs the watch loop until an error ends it.
///
/// `handler` is invoked on this task for every count change; the loop does
/// not resume waiting until it returns. State transitions are published on
/// `state`.
///
/// # Errors
///
/// Returns the first connection, authentication or protocol error. The
/// session of the failing cycle is disconnected first.
pub async fn watch<C, H>(
    connector: &C,
    server: &ServerConfig,
    credentials: &Credentials,
    options: &WatchOptions,
    handler: &mut H,
    state: &watch::Sender<WatchState>,
) -> Result<Infallible>
where
    C: Connector,
    H: ChangeHandler + ?Sized,
{
    let mut cycle = Cycle {
        connector,
        server,
        credentials,
        options,
        handler,
        state,
        notification: ChangeNotification {
            mailbox: options.mailbox.clone(),
        },
    };

    let mut number: u64 = 0;
    loop {
        number = number.wrapping_add(1);
        if let Err(err) = cycle.run(number).await {
            tracing::error!(cycle = number, host = %server.host, error = %err, "watch loop stopped");
            return Err(err);
        }
    }
}

impl<C: Connector, H: ChangeHandler + ?Sized> Cycle<'_, C, H> {
    fn set_state(&self, state: WatchState) {
        tracing::trace!(%state, "watch state");
        self.state.send_replace(state);
    }

    async fn run(&mut self, number: u64) -> Result<()> {
        self.set_state(WatchState::Connecting);
        let mut factory = SessionFactory::new(self.connector, self.server, self.credentials);

        let result = self.watch_session(&mut factory, number).await;

        factory.dispose().await;
        self.set_state(WatchState::Disconnected);
        result
    }

    async fn watch_session(&mut self, factory: &mut SessionFactory<'_, C>, number: u64) -> Result<()> {
        let session = factory.session().await?;
        let status = session.open_mailbox(&self.options.mailbox, Access::ReadOnly).await?;

        let ctx = WaitContext::with_timeout(self.options.cycle);
        let deadline = ctx.deadline();
        self.set_state(WatchState::Watching);
        tracing::info!(
            cycle = number,
            mailbox = %self.options.mailbox,
            exists = status.exists,
            "watching mailbox"
        );

        let mut changes: u64 = 0;
        loop {
            let wait = session.wait_for_change(&ctx);
            tokio::pin!(wait);
            let outcome = tokio::select! {
                outcome = &mut wait => outcome?,
                () = tokio::time::sleep_until(deadline), if !ctx.is_cancelled() => {
                    self.set_state(WatchState::Draining);
                    ctx.cancel();
                    wait.await?
                }
            };

            match outcome {
                WaitOutcome::Changed => {
                    changes += 1;
                    tracing::debug!(cycle = number, mailbox = %self.options.mailbox, "mailbox count changed");
                    self.handler.on_change(&self.notification);
                }
                WaitOutcome::TimedOut | WaitOutcome::Cancelled => {
                    tracing::info!(cycle = number, changes, ?outcome, "cycle finished, reconnecting");
                    return Ok(());
                }
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
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::Error;
    use crate::testing::{Call, FakeServer};

    const MINUTE: Duration = Duration::from_secs(60);

    fn spawn_watch<H: ChangeHandler + 'static>(
        server: &FakeServer,
        mut handler: H,
    ) -> (
        tokio::task::JoinHandle<Result<Infallible>>,
        watch::Receiver<WatchState>,
    ) {
        let connector = server.connector();
        let (state_tx, state_rx) = watch::channel(WatchState::Idle);
        let handle = tokio::spawn(async move {
            let (config, creds) = FakeServer::config();
            watch(
                &connector,
                &config,
                &creds,
                &WatchOptions::default(),
                &mut handler,
                &state_tx,
            )
            .await
        });
        (handle, state_rx)
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnMut(&ChangeNotification) + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        (count, move |n: &ChangeNotification| {
            assert_eq!(n.mailbox, "INBOX");
            seen.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_every_cycle_without_changes() {
        let server = FakeServer::new();
        let (count, handler) = counter();
        let (handle, _state) = spawn_watch(&server, handler);

        tokio::time::sleep(31 * MINUTE).await;

        assert_eq!(server.connects(), 3);
        assert_eq!(server.open_sessions(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_before_disconnect() {
        let server = FakeServer::new();
        let (_count, handler) = counter();
        let (handle, _state) = spawn_watch(&server, handler);

        tokio::time::sleep(16 * MINUTE).await;
        handle.abort();

        let calls = server.calls();
        assert_eq!(&calls[..3], &[Call::Connect, Call::Open(Access::ReadOnly), Call::Wait]);
        assert!(matches!(
            calls[3],
            Call::WaitEnded(WaitOutcome::Cancelled | WaitOutcome::TimedOut)
        ));
        assert_eq!(&calls[4..6], &[Call::Disconnect, Call::Connect]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_changes_invoke_handler_twice() {
        let server = FakeServer::new();
        let (count, handler) = counter();
        let (handle, _state) = spawn_watch(&server, handler);

        tokio::time::sleep(MINUTE).await;
        server.push_change();
        tokio::time::sleep(MINUTE).await;
        server.push_change();
        tokio::time::sleep(MINUTE).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(server.connects(), 1);
        assert_eq!(server.count(&Call::WaitEnded(WaitOutcome::Changed)), 2);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_transitions() {
        let server = FakeServer::new();
        let (_count, handler) = counter();
        let (handle, mut state) = spawn_watch(&server, handler);
        assert_eq!(*state.borrow(), WatchState::Idle);

        tokio::time::sleep(MINUTE).await;
        assert_eq!(*state.borrow_and_update(), WatchState::Watching);

        tokio::time::sleep(15 * MINUTE).await;
        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow_and_update(), WatchState::Watching);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cancellation_is_awaited_before_disconnect() {
        let server = FakeServer::new();
        server.slow_to_cancel(MINUTE);
        let (_count, handler) = counter();
        let (handle, state) = spawn_watch(&server, handler);

        tokio::time::sleep(15 * MINUTE + Duration::from_secs(30)).await;
        assert_eq!(*state.borrow(), WatchState::Draining);
        assert_eq!(server.calls().last(), Some(&Call::Wait));
        assert_eq!(server.count(&Call::Disconnect), 0);

        tokio::time::sleep(MINUTE).await;
        let calls = server.calls();
        assert_eq!(
            &calls[3..6],
            &[
                Call::WaitEnded(WaitOutcome::Cancelled),
                Call::Disconnect,
                Call::Connect
            ]
        );
        assert_eq!(*state.borrow(), WatchState::Watching);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_ends_loop() {
        let server = FakeServer::new();
        server.fail_next_connect(Error::Connection("unreachable".into()));
        let (_count, handler) = counter();
        let (handle, state) = spawn_watch(&server, handler);

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(server.connects(), 0);
        assert_eq!(*state.borrow(), WatchState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_failure_disconnects_and_propagates() {
        let server = FakeServer::new();
        let (_count, handler) = counter();
        let (handle, _state) = spawn_watch(&server, handler);

        tokio::time::sleep(16 * MINUTE).await;
        server.fail_next_wait(Error::Connection("reset by peer".into()));
        server.push_change();

        let err = tokio::time::timeout(20 * MINUTE, handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert_eq!(server.open_sessions(), 0);
        assert_eq!(server.calls().last(), Some(&Call::Disconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_on_later_cycle_ends_loop() {
        let server = FakeServer::new();
        let (_count, handler) = counter();
        let (handle, _state) = spawn_watch(&server, handler);

        tokio::time::sleep(MINUTE).await;
        server.fail_next_connect(Error::Authentication("password changed".into()));

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        assert_eq!(server.connects(), 1);
    }
}
