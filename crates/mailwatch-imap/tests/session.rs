//! Integration tests for the IMAP session.
//!
//! A scripted server runs on the other end of an in-memory duplex pipe, so
//! the real `async-imap` client is exercised without a network connection.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::too_many_lines)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

use mailwatch_imap::{Error, IdleOutcome, ImapSession, Uid};

const GREETING: &str = "* OK [CAPABILITY IMAP4rev1 IDLE AUTH=XOAUTH2] Test server ready\r\n";

const MESSAGE: &str = "From: Alice <alice@example.com>\r\n\
To: Bob <bob@example.com>\r\n\
Subject: Hello\r\n\
\r\n\
Hi Bob\r\n";

/// UID the server refuses to FETCH.
const VANISHED: u32 = 9;

/// UID whose FETCH makes the server hang up.
const HANGUP: u32 = 8;

/// What the server does after answering IDLE with a continuation.
#[derive(Debug, Clone, Copy)]
enum IdleScript {
    /// Push `* n EXISTS` shortly after IDLE starts.
    Push(u32),
    /// Stay silent until DONE.
    Quiet,
}

type CommandLog = Arc<Mutex<Vec<String>>>;

fn spawn_server(
    greeting: &'static str,
    idle: IdleScript,
) -> (DuplexStream, CommandLog, JoinHandle<()>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let log = CommandLog::default();
    let handle = tokio::spawn(serve(server, greeting, idle, Arc::clone(&log)));
    (client, log, handle)
}

async fn serve(stream: DuplexStream, greeting: &str, idle: IdleScript, log: CommandLog) {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    write.write_all(greeting.as_bytes()).await.unwrap();

    while let Ok(Some(line)) = lines.next_line().await {
        log.lock().unwrap().push(line.clone());

        let mut parts = line.splitn(3, ' ');
        let tag = parts.next().unwrap_or_default().to_string();
        let command = parts.next().unwrap_or_default().to_ascii_uppercase();
        let rest = parts.next().unwrap_or_default().to_string();

        let reply = match command.as_str() {
            "LOGIN" if rest.contains("wrong") => {
                format!("{tag} NO [AUTHENTICATIONFAILED] Invalid credentials\r\n")
            }
            "LOGIN" => format!("{tag} OK LOGIN completed\r\n"),
            "EXAMINE" | "SELECT" => {
                let mode = if command == "EXAMINE" { "READ-ONLY" } else { "READ-WRITE" };
                format!(
                    "* 3 EXISTS\r\n* 0 RECENT\r\n* OK [UIDVALIDITY 7] UIDs valid\r\n\
                     * OK [UIDNEXT 4] Predicted next UID\r\n{tag} OK [{mode}] {command} completed\r\n"
                )
            }
            "UID" => {
                let mut args = rest.split(' ');
                match args.next().unwrap_or_default().to_ascii_uppercase().as_str() {
                    "SEARCH" => format!("* SEARCH 3 1\r\n{tag} OK SEARCH completed\r\n"),
                    "FETCH" => {
                        let uid: u32 = args.next().unwrap().parse().unwrap();
                        match uid {
                            VANISHED => format!("{tag} NO no such message\r\n"),
                            HANGUP => return,
                            _ => format!(
                                "* 1 FETCH (UID {uid} BODY[] {{{}}}\r\n{MESSAGE})\r\n{tag} OK FETCH completed\r\n",
                                MESSAGE.len()
                            ),
                        }
                    }
                    "STORE" => format!("{tag} OK STORE completed\r\n"),
                    _ => format!("{tag} BAD unknown UID command\r\n"),
                }
            }
            "CAPABILITY" => format!(
                "* CAPABILITY IMAP4rev1 IDLE literal+\r\n{tag} OK CAPABILITY completed\r\n"
            ),
            "NOOP" => format!("{tag} OK NOOP completed\r\n"),
            "EXPUNGE" => format!("* 2 EXPUNGE\r\n{tag} OK EXPUNGE completed\r\n"),
            "IDLE" => {
                write.write_all(b"+ idling\r\n").await.unwrap();
                if let IdleScript::Push(n) = idle {
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
                write
                    .write_all(format!("* BYE Logging out\r\n{tag} OK LOGOUT completed\r\n").as_bytes())
                    .await
                    .unwrap();
                break;
            }
            _ => format!("{tag} BAD unknown command\r\n"),
        };
        write.write_all(reply.as_bytes()).await.unwrap();
    }
}

fn commands(log: &CommandLog) -> Vec<String> {
    // Strip tags so assertions do not depend on tag numbering.
    log.lock()
        .unwrap()
        .iter()
        .map(|line| match line.split_once(' ') {
            Some((_, command)) => command.to_string(),
            None => line.clone(),
        })
        .collect()
}

async fn open(idle: IdleScript) -> (ImapSession<DuplexStream>, CommandLog, JoinHandle<()>) {
    let (stream, log, server) = spawn_server(GREETING, idle);
    let session = ImapSession::from_stream(stream, "bob", "secret").await.unwrap();
    (session, log, server)
}

#[tokio::test]
async fn test_examine_search_and_fetch() {
    let (mut session, log, server) = open(IdleScript::Quiet).await;

    let status = session.examine("INBOX").await.unwrap();
    assert_eq!(status.exists, 3);
    assert_eq!(status.uid_next, Some(4));
    assert_eq!(status.uid_validity, Some(7));
    assert!(session.is_read_only());
    assert_eq!(session.mailbox(), Some("INBOX"));

    let uids = session.uid_search("NOT DELETED").await.unwrap();
    assert_eq!(uids, vec![Uid::new(1).unwrap(), Uid::new(3).unwrap()]);

    let body = session
        .uid_fetch_body(Uid::new(3).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body, MESSAGE.as_bytes());

    session.logout().await.unwrap();
    server.await.unwrap();

    let sent = commands(&log);
    assert!(sent[0].starts_with("LOGIN"), "password login expected: {sent:?}");
    assert!(sent.contains(&"UID SEARCH NOT DELETED".to_string()));
    assert!(sent.contains(&"UID FETCH 3 BODY.PEEK[]".to_string()));
    assert_eq!(sent.last().unwrap(), "LOGOUT");
}

#[tokio::test]
async fn test_rejected_login_is_auth_error() {
    let (stream, _log, _server) = spawn_server(GREETING, IdleScript::Quiet);
    let err = ImapSession::from_stream(stream, "bob", "wrong")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Auth(_)), "unexpected error: {err}");
}

#[tokio::test]
async fn test_closed_stream_before_greeting() {
    let (client, server) = tokio::io::duplex(1024);
    drop(server);
    let err = ImapSession::from_stream(client, "bob", "secret")
        .await
        .unwrap_err();
    assert!(!matches!(err, Error::Auth(_)));
}

#[tokio::test]
async fn test_flag_and_expunge() {
    let (mut session, log, server) = open(IdleScript::Quiet).await;

    session.select("INBOX").await.unwrap();
    assert!(!session.is_read_only());

    let uids = [Uid::new(2).unwrap(), Uid::new(1).unwrap()];
    session.uid_add_deleted(&uids).await.unwrap();
    assert_eq!(session.expunge().await.unwrap(), 1);
    assert_eq!(session.exists(), 2);

    session.logout().await.unwrap();
    server.await.unwrap();

    let sent = commands(&log);
    assert!(sent.contains(&"UID STORE 1:2 +FLAGS.SILENT (\\Deleted)".to_string()));
    assert!(sent.contains(&"EXPUNGE".to_string()));
}

#[tokio::test]
async fn test_read_only_mailbox_refuses_writes() {
    let (mut session, log, _server) = open(IdleScript::Quiet).await;

    session.examine("INBOX").await.unwrap();
    let err = session
        .uid_add_deleted(&[Uid::new(1).unwrap()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert!(matches!(session.expunge().await, Err(Error::InvalidState(_))));

    let sent = commands(&log);
    assert!(!sent.iter().any(|c| c.starts_with("UID STORE") || c == "EXPUNGE"));
}

#[tokio::test]
async fn test_idle_requires_open_mailbox() {
    let (mut session, _log, _server) = open(IdleScript::Quiet).await;
    let err = session
        .idle(Duration::from_secs(1), std::future::pending())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert!(session.is_open());
}

#[tokio::test]
async fn test_idle_reports_count_change() {
    let (mut session, log, server) = open(IdleScript::Push(4)).await;
    session.examine("INBOX").await.unwrap();

    let outcome = session
        .idle(Duration::from_secs(10), std::future::pending())
        .await
        .unwrap();
    assert_eq!(outcome, IdleOutcome::CountChanged { exists: 4 });
    assert_eq!(session.exists(), 4);

    session.logout().await.unwrap();
    server.await.unwrap();

    let sent = commands(&log);
    let idle = sent.iter().position(|c| c == "IDLE").unwrap();
    assert_eq!(sent[idle + 1], "DONE");
}

#[tokio::test]
async fn test_idle_interrupt_sends_done_before_returning() {
    let (mut session, log, server) = open(IdleScript::Quiet).await;
    session.examine("INBOX").await.unwrap();

    let outcome = session
        .idle(
            Duration::from_secs(30),
            tokio::time::sleep(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    assert_eq!(outcome, IdleOutcome::Interrupted);
    assert!(session.is_open());
    assert_eq!(commands(&log).last().unwrap(), "DONE");

    session.logout().await.unwrap();
    server.await.unwrap();
    assert_eq!(
        &commands(&log)[2..],
        &["IDLE".to_string(), "DONE".to_string(), "LOGOUT".to_string()]
    );
}

#[tokio::test]
async fn test_idle_absorbs_unchanged_count_until_timeout() {
    let (mut session, _log, server) = open(IdleScript::Push(3)).await;
    session.examine("INBOX").await.unwrap();

    let outcome = session
        .idle(Duration::from_millis(200), std::future::pending())
        .await
        .unwrap();
    assert_eq!(outcome, IdleOutcome::Timeout);
    assert_eq!(session.exists(), 3);

    session.logout().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_idle_accepts_unbounded_timeout() {
    let (mut session, _log, server) = open(IdleScript::Push(5)).await;
    session.examine("INBOX").await.unwrap();

    let outcome = session
        .idle(Duration::MAX, std::future::pending())
        .await
        .unwrap();
    assert_eq!(outcome, IdleOutcome::CountChanged { exists: 5 });

    session.logout().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_refused_fetch_leaves_session_usable() {
    let (mut session, log, server) = open(IdleScript::Quiet).await;
    session.examine("INBOX").await.unwrap();

    let body = session.uid_fetch_body(Uid::new(VANISHED).unwrap()).await.unwrap();
    assert!(body.is_none());
    let body = session.uid_fetch_body(Uid::new(1).unwrap()).await.unwrap();
    assert_eq!(body.as_deref(), Some(MESSAGE.as_bytes()));

    session.logout().await.unwrap();
    server.await.unwrap();
    assert!(commands(&log).contains(&"NOOP".to_string()));
}

#[tokio::test]
async fn test_hangup_during_fetch_is_transport_error() {
    let (mut session, _log, server) = open(IdleScript::Quiet).await;
    session.examine("INBOX").await.unwrap();

    let err = session
        .uid_fetch_body(Uid::new(HANGUP).unwrap())
        .await
        .unwrap_err();
    assert!(err.is_transport(), "unexpected error: {err}");
    server.await.unwrap();
}

#[tokio::test]
async fn test_capability_lookup_ignores_case() {
    let (mut session, _log, _server) = open(IdleScript::Quiet).await;
    assert!(session.has_capability("LITERAL+").await.unwrap());
    assert!(!session.has_capability("LITERAL-").await.unwrap());
}
