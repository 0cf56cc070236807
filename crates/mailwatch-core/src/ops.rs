//! One-shot message operations over an open session.
//!
//! These functions take a session by reference and leave connecting and
//! disconnecting to the caller; [`Watcher`](crate::Watcher) wraps each call in
//! its own short-lived session.

use crate::message::Message;
use crate::query::SearchQuery;
use crate::session::{Access, MailSession, Uid};
use crate::{Error, Result};

/// A matched message that could not be retrieved or decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    /// UID of the message.
    pub uid: Uid,
    /// What went wrong.
    pub reason: String,
}

/// Result of [`search_report`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchReport {
    /// Successfully fetched messages in ascending UID order.
    pub messages: Vec<Message>,
    /// Matched messages that were skipped.
    pub failures: Vec<FetchFailure>,
}

/// Runs `query` against `mailbox` and fetches every match not flagged
/// `\Deleted`, keeping track of the ones that failed.
///
/// The mailbox is opened read-write.
///
/// # Errors
///
/// Per-message fetch and decode failures are recorded in
/// [`SearchReport::failures`]. Connection, authentication and protocol errors
/// abort the search.
pub async fn search_report<S: MailSession>(
    session: &mut S,
    mailbox: &str,
    query: &SearchQuery,
) -> Result<SearchReport> {
    session.open_mailbox(mailbox, Access::ReadWrite).await?;

    let query = query.clone().excluding_deleted();
    let uids = session.search(&query).await?;
    tracing::debug!(mailbox, query = %query, matched = uids.len(), "search");

    let mut report = SearchReport::default();
    for uid in uids {
        let fetched = match session.fetch(uid).await {
            Ok(raw) => Message::parse(uid, &raw),
            Err(err) => Err(err),
        };
        match fetched {
            Ok(message) => report.messages.push(message),
            Err(Error::Fetch { uid, reason }) => {
                tracing::warn!(mailbox, %uid, %reason, "skipping message");
                report.failures.push(FetchFailure { uid, reason });
            }
            Err(err) => return Err(err),
        }
    }
    Ok(report)
}

/// Like [`search_report`], dropping the failures after logging them.
///
/// # Errors
///
/// See [`search_report`].
pub async fn search<S: MailSession>(
    session: &mut S,
    mailbox: &str,
    query: &SearchQuery,
) -> Result<Vec<Message>> {
    Ok(search_report(session, mailbox, query).await?.messages)
}

/// Flags `uids` `\Deleted` and expunges `mailbox`.
///
/// The expunge removes every message flagged `\Deleted`, not only `uids`.
/// An empty `uids` does nothing and touches no session state. Returns the
/// number of messages removed.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the mailbox cannot be opened read-write.
pub async fn delete<S: MailSession>(session: &mut S, mailbox: &str, uids: &[Uid]) -> Result<u32> {
    if uids.is_empty() {
        return Ok(0);
    }

    session.open_mailbox(mailbox, Access::ReadWrite).await?;
    for &uid in uids {
        session.flag_deleted(uid).await?;
    }
    let removed = session.expunge().await?;
    tracing::info!(mailbox, flagged = uids.len(), removed, "deleted messages");
    Ok(removed)
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
    use proptest::prelude::*;

    use super::*;
    use crate::session::Connector;
    use crate::testing::{Call, FakeServer, FakeSession};

    fn uid(n: u32) -> Uid {
        Uid::new(n).unwrap()
    }

    async fn session(server: &FakeServer) -> FakeSession {
        let (config, creds) = FakeServer::config();
        server.connector().connect(&config, &creds).await.unwrap()
    }

    fn uids(messages: &[Message]) -> Vec<u32> {
        messages.iter().map(|m| m.uid.get()).collect()
    }

    #[tokio::test]
    async fn test_search_skips_deleted() {
        let server = FakeServer::with_messages([1, 2, 3]);
        server.mark_deleted(2);
        let mut session = session(&server).await;

        let messages = search(&mut session, "INBOX", &SearchQuery::All).await.unwrap();

        assert_eq!(uids(&messages), vec![1, 3]);
        assert_eq!(messages[1].subject.as_deref(), Some("message 3"));
        assert_eq!(messages[1].recipients().collect::<Vec<_>>(), vec!["rcpt3@test"]);
        assert!(server.calls().contains(&Call::Open(Access::ReadWrite)));
        assert!(server.calls().contains(&Call::Search("UNDELETED".into())));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_skipped() {
        let server = FakeServer::with_messages(1..=5);
        server.fail_fetch(3);
        let mut session = session(&server).await;

        let report = search_report(&mut session, "INBOX", &SearchQuery::All).await.unwrap();

        assert_eq!(uids(&report.messages), vec![1, 2, 4, 5]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].uid, uid(3));
        assert_eq!(server.count(&Call::Fetch(5)), 1);
    }

    #[tokio::test]
    async fn test_search_narrows_query() {
        let server = FakeServer::with_messages([1, 2, 3]);
        let mut session = session(&server).await;

        let query = SearchQuery::Subject("message 2".into());
        let messages = search(&mut session, "INBOX", &query).await.unwrap();

        assert_eq!(uids(&messages), vec![2]);
        assert!(server
            .calls()
            .contains(&Call::Search("SUBJECT \"message 2\" UNDELETED".into())));
    }

    #[tokio::test]
    async fn test_search_needs_read_write() {
        let server = FakeServer::with_messages([1]);
        server.refuse_read_write();
        let mut session = session(&server).await;

        let err = search(&mut session, "INBOX", &SearchQuery::All).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(server.count(&Call::Fetch(1)), 0);
    }

    #[tokio::test]
    async fn test_delete_empty_touches_nothing() {
        let server = FakeServer::with_messages([1]);
        let mut session = session(&server).await;

        assert_eq!(delete(&mut session, "INBOX", &[]).await.unwrap(), 0);
        assert_eq!(server.calls(), vec![Call::Connect]);
    }

    #[tokio::test]
    async fn test_delete_sweeps_all_flagged() {
        let server = FakeServer::with_messages([1, 2, 3, 4]);
        server.mark_deleted(4);
        let mut session = session(&server).await;

        let removed = delete(&mut session, "INBOX", &[uid(1), uid(2)]).await.unwrap();

        assert_eq!(removed, 3);
        assert_eq!(server.stored_uids(), vec![3]);
        assert_eq!(
            &server.calls()[1..],
            &[
                Call::Open(Access::ReadWrite),
                Call::Flag(1),
                Call::Flag(2),
                Call::Expunge
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_read_write_refused() {
        let server = FakeServer::with_messages([1]);
        server.refuse_read_write();
        let mut session = session(&server).await;

        let err = delete(&mut session, "INBOX", &[uid(1)]).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(server.stored_uids(), vec![1]);
        assert_eq!(server.count(&Call::Flag(1)), 0);
    }

    proptest! {
        #[test]
        fn prop_search_never_returns_deleted(
            flags in proptest::collection::vec(any::<bool>(), 1..12)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let server = FakeServer::new();
            for (i, &deleted) in flags.iter().enumerate() {
                let n = u32::try_from(i).unwrap() + 1;
                server.add_message(n);
                if deleted {
                    server.mark_deleted(n);
                }
            }

            let found = rt.block_on(async {
                let mut session = session(&server).await;
                search(&mut session, "INBOX", &SearchQuery::All).await.unwrap()
            });

            let expected: Vec<u32> = flags
                .iter()
                .enumerate()
                .filter(|(_, deleted)| !**deleted)
                .map(|(i, _)| u32::try_from(i).unwrap() + 1)
                .collect();
            prop_assert_eq!(uids(&found), expected);
        }
    }
}
