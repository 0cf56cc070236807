//! Authenticated IMAP session.

#![allow(clippy::missing_errors_doc)]

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::types::{Capability, Fetch, UnsolicitedResponse};
use futures::TryStreamExt;
use tokio::time::Instant;

use crate::auth::{self, Mechanism, PlainAuthenticator, ServerCapabilities};
use crate::idle::{IdleOutcome, Push};
use crate::stream::{self, Security, TlsStream, Transport};
use crate::types::{MailboxStatus, Uid, uid_set};
use crate::{Error, Result};

/// Stand-in deadline for timeouts too long to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Connects, negotiates a mechanism and authenticates.
///
/// `port` falls back to [`Security::default_port`]. With [`Security::Tls`]
/// the TLS handshake happens first; with [`Security::StartTls`] the
/// plaintext greeting is read and the connection is upgraded before any
/// credentials are sent.
pub async fn connect(
    host: &str,
    port: Option<u16>,
    security: Security,
    username: &str,
    password: &str,
) -> Result<ImapSession<TlsStream>> {
    let port = port.unwrap_or_else(|| security.default_port());
    tracing::debug!(host, port, ?security, "connecting");
    match security {
        Security::Tls => {
            let stream = stream::connect_tls(host, port).await?;
            ImapSession::from_stream(stream, username, password).await
        }
        Security::StartTls => {
            let tcp = stream::connect_tcp(host, port).await?;
            let mut client = async_imap::Client::new(tcp);
            read_greeting(&mut client).await?;
            client.run_command_and_check_ok("STARTTLS", None).await?;
            let tls = stream::upgrade_to_tls(client.into_inner(), host).await?;
            ImapSession::login(async_imap::Client::new(tls), None, username, password).await
        }
    }
}

async fn read_greeting<S: Transport>(
    client: &mut async_imap::Client<S>,
) -> Result<Option<ServerCapabilities>> {
    let greeting = client
        .read_response()
        .await
        .ok_or(Error::MissingGreeting)??;
    Ok(ServerCapabilities::from_response(greeting.parsed()))
}

/// An authenticated session, optionally with a mailbox open.
///
/// Every method needs exclusive access; a session is never shared between
/// tasks. A failed IDLE leaves the session closed, after which every
/// command returns [`Error::InvalidState`].
pub struct ImapSession<S: Transport> {
    inner: Option<async_imap::Session<S>>,
    mailbox: Option<String>,
    read_only: bool,
    exists: u32,
}

impl<S: Transport> fmt::Debug for ImapSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapSession")
            .field("open", &self.inner.is_some())
            .field("mailbox", &self.mailbox)
            .field("read_only", &self.read_only)
            .field("exists", &self.exists)
            .finish()
    }
}

impl<S: Transport> ImapSession<S> {
    /// Reads the greeting from an established stream and authenticates.
    pub async fn from_stream(stream: S, username: &str, password: &str) -> Result<Self> {
        let mut client = async_imap::Client::new(stream);
        let capabilities = read_greeting(&mut client).await?;
        Self::login(client, capabilities.as_ref(), username, password).await
    }

    async fn login(
        client: async_imap::Client<S>,
        capabilities: Option<&ServerCapabilities>,
        username: &str,
        password: &str,
    ) -> Result<Self> {
        let mechanism = auth::negotiate(capabilities)?;
        tracing::debug!(?mechanism, username, "authenticating");

        let session = match mechanism {
            Mechanism::Plain => {
                client
                    .authenticate("PLAIN", PlainAuthenticator { username, password })
                    .await
            }
            Mechanism::Login => client.login(username, password).await,
        }
        .map_err(|(err, _client)| Error::from_auth(err))?;

        Ok(Self {
            inner: Some(session),
            mailbox: None,
            read_only: false,
            exists: 0,
        })
    }

    /// Returns the open mailbox, if any.
    #[must_use]
    pub fn mailbox(&self) -> Option<&str> {
        self.mailbox.as_deref()
    }

    /// Returns true if the open mailbox was opened with EXAMINE.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Last known message count of the open mailbox.
    #[must_use]
    pub const fn exists(&self) -> u32 {
        self.exists
    }

    /// Returns true until the session is logged out or broken.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    fn session_mut(&mut self) -> Result<&mut async_imap::Session<S>> {
        self.inner
            .as_mut()
            .ok_or_else(|| Error::InvalidState("session is closed".to_string()))
    }

    /// Opens a mailbox read-only (EXAMINE).
    pub async fn examine(&mut self, mailbox: &str) -> Result<MailboxStatus> {
        let status = MailboxStatus::from(&self.session_mut()?.examine(mailbox).await?);
        self.opened(mailbox, true, status);
        Ok(status)
    }

    /// Opens a mailbox read-write (SELECT).
    pub async fn select(&mut self, mailbox: &str) -> Result<MailboxStatus> {
        let status = MailboxStatus::from(&self.session_mut()?.select(mailbox).await?);
        self.opened(mailbox, false, status);
        Ok(status)
    }

    fn opened(&mut self, mailbox: &str, read_only: bool, status: MailboxStatus) {
        tracing::debug!(mailbox, read_only, exists = status.exists, "mailbox opened");
        self.mailbox = Some(mailbox.to_string());
        self.read_only = read_only;
        self.exists = status.exists;
    }

    /// Applies count changes that arrived outside IDLE; returns the new
    /// count if it moved.
    fn drain_unsolicited(&mut self) -> Option<u32> {
        let session = self.inner.as_mut()?;
        let mut changed = None;
        while let Ok(response) = session.unsolicited_responses.try_recv() {
            let push = match response {
                UnsolicitedResponse::Exists(n) => Push::Exists(n),
                UnsolicitedResponse::Expunge(_) => Push::Expunge,
                _ => Push::Other,
            };
            if let Some(exists) = push.apply(self.exists) {
                self.exists = exists;
                changed = Some(exists);
            }
        }
        changed
    }

    /// Idles until the message count changes, `timeout` elapses or
    /// `interrupt` resolves.
    ///
    /// Pushes that do not move the count (flag updates, keep-alives) are
    /// absorbed and the wait continues. When `interrupt` fires the IDLE is
    /// stopped, the pending read drains, and DONE is sent before returning,
    /// so the session is usable again afterwards.
    pub async fn idle<F>(&mut self, timeout: Duration, interrupt: F) -> Result<IdleOutcome>
    where
        F: Future<Output = ()>,
    {
        if self.mailbox.is_none() {
            return Err(Error::InvalidState(
                "IDLE requires an open mailbox".to_string(),
            ));
        }
        if let Some(exists) = self.drain_unsolicited() {
            return Ok(IdleOutcome::CountChanged { exists });
        }

        let session = self
            .inner
            .take()
            .ok_or_else(|| Error::InvalidState("session is closed".to_string()))?;
        let mut handle = session.idle();
        handle.init().await?;

        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);
        tokio::pin!(interrupt);

        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break IdleOutcome::Timeout;
            }

            let (wait, stop) = handle.wait_with_timeout(remaining);
            tokio::pin!(wait);
            let (response, interrupted) = tokio::select! {
                response = &mut wait => (response?, false),
                () = &mut interrupt => {
                    drop(stop);
                    (wait.await?, true)
                }
            };

            match response {
                IdleResponse::NewData(data) => {
                    let push = Push::classify(data.parsed());
                    if let Some(exists) = push.apply(self.exists) {
                        self.exists = exists;
                        break IdleOutcome::CountChanged { exists };
                    }
                    if interrupted {
                        break IdleOutcome::Interrupted;
                    }
                    tracing::trace!(?push, "absorbed push without count change");
                }
                IdleResponse::Timeout => break IdleOutcome::Timeout,
                IdleResponse::ManualInterrupt => break IdleOutcome::Interrupted,
            }
        };

        self.inner = Some(handle.done().await?);
        tracing::debug!(?outcome, exists = self.exists, "IDLE finished");
        Ok(outcome)
    }

    /// Asks the server (CAPABILITY) whether it advertises the atom `name`,
    /// compared case-insensitively.
    pub async fn has_capability(&mut self, name: &str) -> Result<bool> {
        let capabilities = self.session_mut()?.capabilities().await?;
        Ok(capabilities
            .iter()
            .any(|cap| matches!(cap, Capability::Atom(atom) if atom.eq_ignore_ascii_case(name))))
    }

    /// Runs `UID SEARCH` and returns the matches in ascending order.
    pub async fn uid_search(&mut self, criteria: &str) -> Result<Vec<Uid>> {
        let found = self.session_mut()?.uid_search(criteria).await?;
        let mut uids: Vec<Uid> = found.into_iter().filter_map(Uid::new).collect();
        uids.sort_unstable();
        Ok(uids)
    }

    /// Fetches the full RFC 5322 body of one message without setting
    /// `\Seen`.
    ///
    /// Returns `Ok(None)` if the server answered without a body (the UID no
    /// longer exists, or the FETCH was refused). A connection that went away
    /// mid-command is reported as a transport error instead.
    pub async fn uid_fetch_body(&mut self, uid: Uid) -> Result<Option<Vec<u8>>> {
        let session = self.session_mut()?;
        let fetches: Vec<Fetch> = session
            .uid_fetch(uid.to_string(), "BODY.PEEK[]")
            .await?
            .try_collect()
            .await?;

        let body = fetches
            .iter()
            .filter(|fetch| fetch.uid.is_none_or(|u| u == uid.get()))
            .find_map(|fetch| fetch.body().map(<[u8]>::to_vec));
        if body.is_none() {
            // The fetch stream ends silently on a tagged NO and on EOF alike.
            session.run_command_and_check_ok("NOOP").await?;
        }
        Ok(body)
    }

    /// Adds `\Deleted` to the given messages.
    pub async fn uid_add_deleted(&mut self, uids: &[Uid]) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        if self.read_only {
            return Err(Error::InvalidState(
                "mailbox is open read-only".to_string(),
            ));
        }
        let _: Vec<Fetch> = self
            .session_mut()?
            .uid_store(uid_set(uids), "+FLAGS.SILENT (\\Deleted)")
            .await?
            .try_collect()
            .await?;
        Ok(())
    }

    /// Permanently removes every `\Deleted` message in the open mailbox.
    ///
    /// Returns the number of messages removed.
    pub async fn expunge(&mut self) -> Result<u32> {
        if self.read_only {
            return Err(Error::InvalidState(
                "mailbox is open read-only".to_string(),
            ));
        }
        let removed: Vec<u32> = self.session_mut()?.expunge().await?.try_collect().await?;
        let count = u32::try_from(removed.len()).unwrap_or(u32::MAX);
        self.exists = self.exists.saturating_sub(count);
        Ok(count)
    }

    /// Sends LOGOUT and closes the session.
    pub async fn logout(mut self) -> Result<()> {
        if let Some(mut session) = self.inner.take() {
            session.logout().await?;
        }
        Ok(())
    }
}
