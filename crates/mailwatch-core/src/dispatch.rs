//! Change notifications and their delivery.
//!
//! The watch loop hands every detected count change to a [`ChangeHandler`]
//! on its own task. Handlers must return quickly: the loop does not resume
//! waiting until the handler returns. Work that takes longer belongs on
//! another task, which [`notification_channel`] provides: its sender is a
//! handler that never blocks, holds at most one pending notification, and
//! drops further ones until the receiver catches up.

use tokio::sync::mpsc;

/// "The message count of `mailbox` changed."
///
/// Arrivals and removals look the same; re-query the mailbox to find out
/// what happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    /// Watched mailbox.
    pub mailbox: String,
}

/// Receives change notifications from the watch loop.
pub trait ChangeHandler: Send {
    /// Called on the watch loop's task for each change.
    fn on_change(&mut self, notification: &ChangeNotification);
}

impl<F> ChangeHandler for F
where
    F: FnMut(&ChangeNotification) + Send,
{
    fn on_change(&mut self, notification: &ChangeNotification) {
        self(notification);
    }
}

/// Creates a coalescing notification channel.
#[must_use]
pub fn notification_channel() -> (ChangeSender, ChangeReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (ChangeSender { tx }, ChangeReceiver { rx })
}

/// Non-blocking handler side of [`notification_channel`].
#[derive(Debug, Clone)]
pub struct ChangeSender {
    tx: mpsc::Sender<ChangeNotification>,
}

impl ChangeSender {
    /// Queues a notification unless one is already pending.
    ///
    /// Returns true if it was queued.
    pub fn notify(&self, notification: &ChangeNotification) -> bool {
        match self.tx.try_send(notification.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!(mailbox = %notification.mailbox, "notification already pending");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(mailbox = %notification.mailbox, "notification receiver gone");
                false
            }
        }
    }
}

impl ChangeHandler for ChangeSender {
    fn on_change(&mut self, notification: &ChangeNotification) {
        self.notify(notification);
    }
}

/// Draining side of [`notification_channel`].
#[derive(Debug)]
pub struct ChangeReceiver {
    rx: mpsc::Receiver<ChangeNotification>,
}

impl ChangeReceiver {
    /// Waits for the next notification; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<ChangeNotification> {
        self.rx.recv().await
    }

    /// Takes the pending notification without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeNotification> {
        self.rx.try_recv().ok()
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
    use tokio_test::{assert_pending, assert_ready_eq, task};

    use super::*;

    fn inbox() -> ChangeNotification {
        ChangeNotification {
            mailbox: "INBOX".into(),
        }
    }

    #[test]
    fn test_closure_handler() {
        let mut count = 0;
        {
            let mut handler = |n: &ChangeNotification| {
                assert_eq!(n.mailbox, "INBOX");
                count += 1;
            };
            handler.on_change(&inbox());
            handler.on_change(&inbox());
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn test_channel_coalesces() {
        let (mut tx, mut rx) = notification_channel();

        assert!(tx.notify(&inbox()));
        assert!(!tx.notify(&inbox()));
        tx.on_change(&inbox());

        assert_eq!(rx.try_recv(), Some(inbox()));
        assert_eq!(rx.try_recv(), None);

        assert!(tx.notify(&inbox()));
        assert_eq!(rx.try_recv(), Some(inbox()));
    }

    #[test]
    fn test_recv_wakes_on_notify() {
        let (tx, mut rx) = notification_channel();
        let mut recv = task::spawn(async move { rx.recv().await });

        assert_pending!(recv.poll());
        tx.notify(&inbox());
        assert!(recv.is_woken());
        assert_ready_eq!(recv.poll(), Some(inbox()));
    }

    #[test]
    fn test_recv_ends_when_sender_dropped() {
        let (tx, mut rx) = notification_channel();
        let mut recv = task::spawn(async move { rx.recv().await });

        assert_pending!(recv.poll());
        drop(tx);
        assert_ready_eq!(recv.poll(), None);
    }

    #[test]
    fn test_notify_after_receiver_dropped() {
        let (tx, rx) = notification_channel();
        drop(rx);
        assert!(!tx.notify(&inbox()));
    }
}
