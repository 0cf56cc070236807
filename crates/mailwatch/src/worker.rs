//! Reacts to change notifications off the watch loop's task.

use std::sync::Arc;

use mailwatch_core::{ChangeReceiver, Connector, Message, SearchQuery, Watcher};

/// Re-queries the mailbox for every notification until the sender is gone.
///
/// Failures are logged and never stop the worker.
pub async fn run<C: Connector>(watcher: Arc<Watcher<C>>, mut changes: ChangeReceiver) {
    while let Some(notification) = changes.recv().await {
        tracing::info!(mailbox = %notification.mailbox, "mailbox changed");
        match watcher.search_report(&SearchQuery::All).await {
            Ok(report) => {
                for message in &report.messages {
                    log_message(message);
                }
                if !report.failures.is_empty() {
                    tracing::warn!(
                        mailbox = %notification.mailbox,
                        skipped = report.failures.len(),
                        "some messages could not be fetched"
                    );
                }
                tracing::info!(
                    mailbox = %notification.mailbox,
                    messages = report.messages.len(),
                    "mailbox listed"
                );
            }
            Err(err) => {
                tracing::error!(mailbox = %notification.mailbox, error = %err, "search failed");
            }
        }
    }
    tracing::debug!("notification channel closed");
}

fn log_message(message: &Message) {
    let from = message
        .from
        .first()
        .map(ToString::to_string)
        .unwrap_or_default();
    let recipients: Vec<&str> = message.recipients().collect();
    tracing::info!(
        uid = %message.uid,
        from = %from,
        to = %recipients.join(", "),
        subject = message.subject.as_deref().unwrap_or(""),
        date = ?message.date,
        "message"
    );
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    use mailwatch_core::{
        ChangeNotification, Credentials, Error, ImapConnector, Result, ServerConfig,
        notification_channel,
    };

    use super::*;

    /// Connector whose server is never reachable.
    #[derive(Debug, Default)]
    struct Unreachable {
        attempts: AtomicUsize,
    }

    impl Connector for Unreachable {
        type Session = <ImapConnector as Connector>::Session;

        async fn connect(&self, _: &ServerConfig, _: &Credentials) -> Result<Self::Session> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::Connection("unreachable".into()))
        }
    }

    fn watcher() -> Arc<Watcher<Unreachable>> {
        Arc::new(Watcher::with_connector(
            Unreachable::default(),
            ServerConfig::new("imap.test"),
            Credentials::new("me", "pw"),
        ))
    }

    fn inbox() -> ChangeNotification {
        ChangeNotification {
            mailbox: "INBOX".into(),
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_worker() {
        let watcher = watcher();
        let (tx, rx) = notification_channel();
        let worker = tokio::spawn(run(Arc::clone(&watcher), rx));

        assert!(tx.notify(&inbox()));
        while watcher_attempts(&watcher) < 1 {
            tokio::task::yield_now().await;
        }
        assert!(tx.notify(&inbox()));
        drop(tx);

        worker.await.unwrap();
        assert_eq!(watcher_attempts(&watcher), 2);
    }

    #[tokio::test]
    async fn test_pending_notifications_coalesce() {
        let watcher = watcher();
        let (tx, rx) = notification_channel();

        tx.notify(&inbox());
        tx.notify(&inbox());
        drop(tx);
        run(Arc::clone(&watcher), rx).await;

        assert_eq!(watcher_attempts(&watcher), 1);
    }

    fn watcher_attempts(watcher: &Watcher<Unreachable>) -> usize {
        watcher.connector().attempts.load(Ordering::SeqCst)
    }
}
