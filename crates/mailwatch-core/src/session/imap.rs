//! [`Connector`] and [`MailSession`] over `mailwatch-imap`.

use mailwatch_imap::{IdleOutcome, ImapSession, TlsStream, Transport};

use super::{Access, Connector, MailSession, MailboxStatus, Uid, WaitContext, WaitOutcome};
use crate::config::{Credentials, ServerConfig};
use crate::query::SearchQuery;
use crate::{Error, Result};

/// Largest literal a `LITERAL-` server accepts without synchronizing.
const LITERAL_MINUS_MAX: usize = 4096;

/// Connects to real IMAP servers over TLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImapConnector;

impl Connector for ImapConnector {
    type Session = ImapSession<TlsStream>;

    async fn connect(
        &self,
        server: &ServerConfig,
        credentials: &Credentials,
    ) -> Result<Self::Session> {
        let host = server.host.trim();
        let session = mailwatch_imap::connect(
            host,
            server.port,
            server.security,
            &credentials.username,
            &credentials.password,
        )
        .await?;
        tracing::info!(host, port = server.effective_port(), "connected");
        Ok(session)
    }
}

impl<S: Transport> MailSession for ImapSession<S> {
    async fn open_mailbox(&mut self, mailbox: &str, access: Access) -> Result<MailboxStatus> {
        let opened = match access {
            Access::ReadOnly => self.examine(mailbox).await,
            Access::ReadWrite => self.select(mailbox).await,
        };
        opened.map_err(|err| match Error::from(err) {
            Error::Protocol(reason) => {
                Error::Protocol(format!("cannot open {mailbox} {access}: {reason}"))
            }
            other => other,
        })
    }

    async fn wait_for_change(&mut self, ctx: &WaitContext) -> Result<WaitOutcome> {
        if ctx.is_cancelled() {
            return Ok(WaitOutcome::Cancelled);
        }
        let remaining = ctx.remaining();
        if remaining.is_zero() {
            return Ok(WaitOutcome::TimedOut);
        }

        Ok(match self.idle(remaining, ctx.cancelled()).await? {
            IdleOutcome::CountChanged { .. } => WaitOutcome::Changed,
            IdleOutcome::Timeout => WaitOutcome::TimedOut,
            IdleOutcome::Interrupted => WaitOutcome::Cancelled,
        })
    }

    async fn search(&mut self, query: &SearchQuery) -> Result<Vec<Uid>> {
        if let Some(longest) = query.longest_literal() {
            let accepted = self.has_capability("LITERAL+").await?
                || (longest <= LITERAL_MINUS_MAX && self.has_capability("LITERAL-").await?);
            if !accepted {
                return Err(Error::Protocol(
                    "non-ASCII search text needs the LITERAL+ capability".to_string(),
                ));
            }
        }
        Ok(self.uid_search(&query.to_imap()).await?)
    }

    async fn fetch(&mut self, uid: Uid) -> Result<Vec<u8>> {
        match self.uid_fetch_body(uid).await {
            Ok(Some(body)) => Ok(body),
            Ok(None) => Err(Error::Fetch {
                uid,
                reason: "server returned no body".to_string(),
            }),
            Err(err) if err.is_transport() => Err(err.into()),
            Err(err) => Err(Error::Fetch {
                uid,
                reason: err.to_string(),
            }),
        }
    }

    async fn flag_deleted(&mut self, uid: Uid) -> Result<()> {
        Ok(self.uid_add_deleted(&[uid]).await?)
    }

    async fn expunge(&mut self) -> Result<u32> {
        Ok(Self::expunge(self).await?)
    }

    async fn disconnect(self) -> Result<()> {
        Ok(self.logout().await?)
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
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::ops;

    /// How the scripted server behaves.
    #[derive(Debug, Clone, Default)]
    struct Script {
        uids: Vec<u32>,
        refuse_select: bool,
        refused_fetch: Option<u32>,
        hangup_fetch: Option<u32>,
        idle_push: Option<u32>,
        capabilities: &'static str,
    }

    impl Script {
        fn with_messages(uids: impl IntoIterator<Item = u32>) -> Self {
            Self {
                uids: uids.into_iter().collect(),
                ..Self::default()
            }
        }
    }

    type CommandLog = Arc<Mutex<Vec<String>>>;

    fn body(uid: u32) -> String {
        format!(
            "From: Alice <alice@example.com>\r\nTo: Bob <bob@example.com>\r\n\
             Subject: Message {uid}\r\n\r\nHello\r\n"
        )
    }

    async fn serve(stream: DuplexStream, script: Script, log: CommandLog) {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();
        write
            .write_all(b"* OK [CAPABILITY IMAP4rev1 IDLE] ready\r\n")
            .await
            .unwrap();
        let exists = script.uids.len();

        while let Ok(Some(mut line)) = lines.next_line().await {
            if line.ends_with("+}") {
                let literal = lines.next_line().await.unwrap().unwrap();
                line = format!("{line}\n{literal}");
            }
            let (tag, rest) = line.split_once(' ').unwrap();
            log.lock().unwrap().push(rest.to_string());
            let command = rest.split(' ').next().unwrap().to_ascii_uppercase();

            let reply = match command.as_str() {
                "LOGIN" => format!("{tag} OK LOGIN completed\r\n"),
                "CAPABILITY" => {
                    let caps = ["IMAP4rev1", "IDLE", script.capabilities];
                    let caps: Vec<&str> = caps.into_iter().filter(|c| !c.is_empty()).collect();
                    format!("* CAPABILITY {}\r\n{tag} OK done\r\n", caps.join(" "))
                }
                "SELECT" if script.refuse_select => {
                    format!("{tag} NO [CANNOT] mailbox is read-only for you\r\n")
                }
                "SELECT" | "EXAMINE" => format!(
                    "* {exists} EXISTS\r\n* OK [UIDVALIDITY 1] ok\r\n{tag} OK {command} completed\r\n"
                ),
                "UID" if rest.starts_with("UID SEARCH") => {
                    let found: Vec<String> = script.uids.iter().map(u32::to_string).collect();
                    format!("* SEARCH {}\r\n{tag} OK SEARCH completed\r\n", found.join(" "))
                }
                "UID" if rest.starts_with("UID FETCH") => {
                    let uid: u32 = rest.split(' ').nth(2).unwrap().parse().unwrap();
                    if script.hangup_fetch == Some(uid) {
                        return;
                    }
                    if script.refused_fetch == Some(uid) {
                        format!("{tag} NO message is gone\r\n")
                    } else {
                        let seq = script.uids.iter().position(|&u| u == uid).unwrap() + 1;
                        let body = body(uid);
                        format!(
                            "* {seq} FETCH (UID {uid} BODY[] {{{}}}\r\n{body})\r\n{tag} OK FETCH completed\r\n",
                            body.len()
                        )
                    }
                }
                "UID" => format!("{tag} OK STORE completed\r\n"),
                "NOOP" => format!("{tag} OK NOOP completed\r\n"),
                "EXPUNGE" => format!("{tag} OK EXPUNGE completed\r\n"),
                "IDLE" => {
                    write.write_all(b"+ idling\r\n").await.unwrap();
                    if let Some(n) = script.idle_push {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        write
                            .write_all(format!("* {n} EXISTS\r\n").as_bytes())
                            .await
                            .unwrap();
                    }
                    let done = lines.next_line().await.unwrap().unwrap();
                    log.lock().unwrap().push(done);
                    format!("{tag} OK IDLE terminated\r\n")
                }
                "LOGOUT" => {
                    let bye = format!("* BYE\r\n{tag} OK LOGOUT completed\r\n");
                    write.write_all(bye.as_bytes()).await.unwrap();
                    break;
                }
                _ => format!("{tag} BAD unexpected command\r\n"),
            };
            write.write_all(reply.as_bytes()).await.unwrap();
        }
    }

    async fn connect(script: Script) -> (ImapSession<DuplexStream>, CommandLog, JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let log = CommandLog::default();
        let handle = tokio::spawn(serve(server, script, Arc::clone(&log)));
        let session = ImapSession::from_stream(client, "bob", "pw").await.unwrap();
        (session, log, handle)
    }

    fn sent(log: &CommandLog) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn uid(n: u32) -> Uid {
        Uid::new(n).unwrap()
    }

    #[tokio::test]
    async fn test_refused_fetch_is_skipped() {
        let mut script = Script::with_messages(1..=5);
        script.refused_fetch = Some(3);
        let (mut session, log, _server) = connect(script).await;

        let report = ops::search_report(&mut session, "INBOX", &SearchQuery::All)
            .await
            .unwrap();

        let fetched: Vec<u32> = report.messages.iter().map(|m| m.uid.get()).collect();
        assert_eq!(fetched, vec![1, 2, 4, 5]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].uid, uid(3));
        assert_eq!(report.messages[0].subject.as_deref(), Some("Message 1"));
        assert!(sent(&log).contains(&"UID SEARCH UNDELETED".to_string()));
    }

    #[tokio::test]
    async fn test_hangup_during_fetch_aborts_search() {
        let mut script = Script::with_messages(1..=3);
        script.hangup_fetch = Some(2);
        let (mut session, _log, server) = connect(script).await;

        let err = ops::search_report(&mut session, "INBOX", &SearchQuery::All)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)), "unexpected error: {err}");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_select_fails_delete() {
        let mut script = Script::with_messages([1, 2]);
        script.refuse_select = true;
        let (mut session, log, _server) = connect(script).await;

        let err = ops::delete(&mut session, "INBOX", &[uid(1)]).await.unwrap_err();
        match err {
            Error::Protocol(reason) => assert!(reason.contains("cannot open INBOX read-write")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!sent(&log).iter().any(|c| c.starts_with("UID STORE")));
    }

    #[tokio::test]
    async fn test_delete_flags_then_expunges() {
        let (mut session, log, server) = connect(Script::with_messages([1, 2])).await;

        ops::delete(&mut session, "INBOX", &[uid(2)]).await.unwrap();
        MailSession::disconnect(session).await.unwrap();
        server.await.unwrap();

        let sent = sent(&log);
        let store = sent.iter().position(|c| c.starts_with("UID STORE 2 ")).unwrap();
        assert_eq!(sent[store + 1], "EXPUNGE");
        assert_eq!(sent.last().unwrap(), "LOGOUT");
    }

    #[tokio::test]
    async fn test_wait_reports_count_change() {
        let mut script = Script::with_messages(1..=5);
        script.idle_push = Some(6);
        let (mut session, log, _server) = connect(script).await;
        session.open_mailbox("INBOX", Access::ReadOnly).await.unwrap();

        let ctx = WaitContext::with_timeout(Duration::from_secs(10));
        let outcome = session.wait_for_change(&ctx).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Changed);
        assert_eq!(sent(&log).last().unwrap(), "DONE");
    }

    #[tokio::test]
    async fn test_wait_times_out_at_deadline() {
        let (mut session, _log, _server) = connect(Script::with_messages([1])).await;
        session.open_mailbox("INBOX", Access::ReadOnly).await.unwrap();

        let ctx = WaitContext::with_timeout(Duration::from_millis(100));
        assert_eq!(
            session.wait_for_change(&ctx).await.unwrap(),
            WaitOutcome::TimedOut
        );
    }

    #[tokio::test]
    async fn test_wait_cancelled_mid_idle() {
        let (mut session, log, _server) = connect(Script::with_messages([1])).await;
        session.open_mailbox("INBOX", Access::ReadOnly).await.unwrap();

        let ctx = WaitContext::with_timeout(Duration::from_secs(30));
        let (outcome, ()) = tokio::join!(session.wait_for_change(&ctx), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.cancel();
        });
        assert_eq!(outcome.unwrap(), WaitOutcome::Cancelled);
        assert_eq!(sent(&log).last().unwrap(), "DONE");
    }

    #[tokio::test]
    async fn test_finished_context_skips_idle() {
        let (mut session, log, _server) = connect(Script::with_messages([1])).await;
        session.open_mailbox("INBOX", Access::ReadOnly).await.unwrap();

        let expired = WaitContext::new(Instant::now(), CancellationToken::new());
        assert_eq!(
            session.wait_for_change(&expired).await.unwrap(),
            WaitOutcome::TimedOut
        );
        let cancelled = WaitContext::with_timeout(Duration::from_secs(30));
        cancelled.cancel();
        assert_eq!(
            session.wait_for_change(&cancelled).await.unwrap(),
            WaitOutcome::Cancelled
        );
        assert!(!sent(&log).contains(&"IDLE".to_string()));
    }

    #[tokio::test]
    async fn test_non_ascii_search_uses_literal() {
        let mut script = Script::with_messages([4]);
        script.capabilities = "LITERAL+";
        let (mut session, log, _server) = connect(script).await;
        session.open_mailbox("INBOX", Access::ReadOnly).await.unwrap();

        let found = MailSession::search(&mut session, &SearchQuery::Subject("Grüße".into()))
            .await
            .unwrap();
        assert_eq!(found, vec![uid(4)]);
        assert!(
            sent(&log).contains(&"UID SEARCH CHARSET UTF-8 SUBJECT {7+}\nGrüße".to_string())
        );
    }

    #[tokio::test]
    async fn test_non_ascii_search_without_literal_plus() {
        let (mut session, log, _server) = connect(Script::with_messages([4])).await;
        session.open_mailbox("INBOX", Access::ReadOnly).await.unwrap();

        let err = MailSession::search(&mut session, &SearchQuery::From("José".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(!sent(&log).iter().any(|c| c.starts_with("UID SEARCH")));
    }
}
