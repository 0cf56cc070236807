//! In-memory protocol collaborator for tests.
//!
//! [`FakeServer`] holds a mailbox and records every protocol call in order,
//! so tests can assert on exactly what a watch cycle or operation did.

#![allow(clippy::unwrap_used, clippy::missing_panics_doc)]

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use crate::config::{Credentials, ServerConfig};
use crate::query::SearchQuery;
use crate::session::{
    Access, Connector, MailSession, MailboxStatus, Uid, WaitContext, WaitOutcome,
};
use crate::{Error, Result};

/// One protocol interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect,
    Open(Access),
    Wait,
    WaitEnded(WaitOutcome),
    Search(String),
    Fetch(u32),
    Flag(u32),
    Expunge,
    Disconnect,
}

#[derive(Debug)]
struct StoredMessage {
    uid: u32,
    raw: Vec<u8>,
    deleted: bool,
}

#[derive(Debug, Default)]
struct State {
    messages: Vec<StoredMessage>,
    calls: Vec<Call>,
    connect_failures: VecDeque<Error>,
    wait_failures: VecDeque<Error>,
    failing_fetches: HashSet<u32>,
    refuse_read_write: bool,
    cancel_delay: Option<Duration>,
}

/// Shared fake mailbox.
#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<State>>,
    changes: Arc<Notify>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server settings and credentials accepted by the fake.
    pub fn config() -> (ServerConfig, Credentials) {
        (
            ServerConfig::new("imap.test"),
            Credentials::new("bob@test", "secret"),
        )
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            server: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn record(&self, call: Call) {
        self.lock().calls.push(call);
    }

    /// Adds a message with a predictable subject and recipient.
    pub fn add_message(&self, uid: u32) {
        let raw = format!(
            "Message-ID: <{uid}@test>\r\nFrom: Sender <sender@test>\r\nTo: rcpt{uid}@test\r\n\
             Subject: message {uid}\r\n\r\nbody {uid}\r\n"
        );
        self.lock().messages.push(StoredMessage {
            uid,
            raw: raw.into_bytes(),
            deleted: false,
        });
    }

    pub fn with_messages(uids: impl IntoIterator<Item = u32>) -> Self {
        let server = Self::new();
        for uid in uids {
            server.add_message(uid);
        }
        server
    }

    /// Flags a message `\Deleted` behind the client's back.
    pub fn mark_deleted(&self, uid: u32) {
        for message in &mut self.lock().messages {
            if message.uid == uid {
                message.deleted = true;
            }
        }
    }

    pub fn fail_fetch(&self, uid: u32) {
        self.lock().failing_fetches.insert(uid);
    }

    pub fn fail_next_connect(&self, err: Error) {
        self.lock().connect_failures.push_back(err);
    }

    pub fn fail_next_wait(&self, err: Error) {
        self.lock().wait_failures.push_back(err);
    }

    /// Makes waits ignore the deadline and take `delay` to acknowledge
    /// cancellation, like a server slow to answer DONE.
    pub fn slow_to_cancel(&self, delay: Duration) {
        self.lock().cancel_delay = Some(delay);
    }

    pub fn refuse_read_write(&self) {
        self.lock().refuse_read_write = true;
    }

    /// Simulates an EXISTS/EXPUNGE push to whoever is waiting.
    pub fn push_change(&self) {
        self.changes.notify_one();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn connects(&self) -> usize {
        self.count(&Call::Connect)
    }

    pub fn count(&self, call: &Call) -> usize {
        self.lock().calls.iter().filter(|c| *c == call).count()
    }

    /// UIDs still stored, including flagged ones.
    pub fn stored_uids(&self) -> Vec<u32> {
        self.lock().messages.iter().map(|m| m.uid).collect()
    }

    /// Connected sessions not yet disconnected.
    pub fn open_sessions(&self) -> usize {
        self.connects() - self.count(&Call::Disconnect)
    }
}

/// Connector handing out [`FakeSession`]s.
#[derive(Debug, Clone)]
pub struct FakeConnector {
    server: FakeServer,
}

impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self, _server: &ServerConfig, _credentials: &Credentials) -> Result<FakeSession> {
        if let Some(err) = self.server.lock().connect_failures.pop_front() {
            return Err(err);
        }
        self.server.record(Call::Connect);
        Ok(FakeSession {
            server: self.server.clone(),
            access: None,
        })
    }
}

/// Session over a [`FakeServer`].
#[derive(Debug)]
pub struct FakeSession {
    server: FakeServer,
    access: Option<Access>,
}

impl FakeSession {
    fn require_write(&self) -> Result<()> {
        match self.access {
            Some(Access::ReadWrite) => Ok(()),
            _ => Err(Error::Protocol("mailbox is not open read-write".into())),
        }
    }
}

fn matches(query: &SearchQuery, message: &StoredMessage) -> bool {
    match query {
        SearchQuery::Deleted => message.deleted,
        SearchQuery::NotDeleted => !message.deleted,
        SearchQuery::And(items) => items.iter().all(|q| matches(q, message)),
        SearchQuery::Or(a, b) => matches(a, message) || matches(b, message),
        SearchQuery::Not(q) => !matches(q, message),
        SearchQuery::Subject(s) => String::from_utf8_lossy(&message.raw).contains(s.as_str()),
        _ => true,
    }
}

impl MailSession for FakeSession {
    async fn open_mailbox(&mut self, _mailbox: &str, access: Access) -> Result<MailboxStatus> {
        self.server.record(Call::Open(access));
        let state = self.server.lock();
        if access == Access::ReadWrite && state.refuse_read_write {
            return Err(Error::Protocol("cannot open INBOX read-write".into()));
        }
        self.access = Some(access);
        Ok(MailboxStatus {
            exists: u32::try_from(state.messages.len()).unwrap(),
            uid_next: state.messages.iter().map(|m| m.uid + 1).max(),
            uid_validity: Some(1),
        })
    }

    async fn wait_for_change(&mut self, ctx: &WaitContext) -> Result<WaitOutcome> {
        self.server.record(Call::Wait);
        if let Some(err) = self.server.lock().wait_failures.pop_front() {
            return Err(err);
        }
        let changes = Arc::clone(&self.server.changes);
        let cancel_delay = self.server.lock().cancel_delay;
        let outcome = if ctx.is_cancelled() {
            WaitOutcome::Cancelled
        } else {
            tokio::select! {
                biased;
                () = ctx.cancelled() => {
                    if let Some(delay) = cancel_delay {
                        tokio::time::sleep(delay).await;
                    }
                    WaitOutcome::Cancelled
                }
                () = changes.notified() => WaitOutcome::Changed,
                () = tokio::time::sleep_until(ctx.deadline()), if cancel_delay.is_none() => {
                    WaitOutcome::TimedOut
                }
            }
        };
        self.server.record(Call::WaitEnded(outcome));
        Ok(outcome)
    }

    async fn search(&mut self, query: &SearchQuery) -> Result<Vec<Uid>> {
        self.server.record(Call::Search(query.to_imap()));
        let state = self.server.lock();
        let mut uids: Vec<Uid> = state
            .messages
            .iter()
            .filter(|m| matches(query, m))
            .filter_map(|m| Uid::new(m.uid))
            .collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch(&mut self, uid: Uid) -> Result<Vec<u8>> {
        self.server.record(Call::Fetch(uid.get()));
        let state = self.server.lock();
        if state.failing_fetches.contains(&uid.get()) {
            return Err(Error::Fetch {
                uid,
                reason: "simulated failure".into(),
            });
        }
        state
            .messages
            .iter()
            .find(|m| m.uid == uid.get())
            .map(|m| m.raw.clone())
            .ok_or_else(|| Error::Fetch {
                uid,
                reason: "no such message".into(),
            })
    }

    async fn flag_deleted(&mut self, uid: Uid) -> Result<()> {
        self.server.record(Call::Flag(uid.get()));
        self.require_write()?;
        self.server.mark_deleted(uid.get());
        Ok(())
    }

    async fn expunge(&mut self) -> Result<u32> {
        self.server.record(Call::Expunge);
        self.require_write()?;
        let mut state = self.server.lock();
        let before = state.messages.len();
        state.messages.retain(|m| !m.deleted);
        Ok(u32::try_from(before - state.messages.len()).unwrap())
    }

    async fn disconnect(self) -> Result<()> {
        self.server.record(Call::Disconnect);
        Ok(())
    }
}
