//! # mailwatch-imap
//!
//! The IMAP side of mailwatch: a thin, strongly typed adapter over
//! [`async_imap`] that covers exactly what a mailbox watcher needs.
//!
//! ## Features
//!
//! - **TLS via rustls**: implicit TLS or STARTTLS, webpki root store
//! - **Mechanism negotiation**: OAuth SASL mechanisms are stripped from the
//!   advertised set; PLAIN is preferred, LOGIN is the fallback
//! - **Cancellable IDLE**: [`ImapSession::idle`] takes a timeout and an
//!   interrupt future and always leaves IDLE cleanly with DONE
//! - **UID operations**: search, body fetch, `\Deleted` flagging, expunge
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use mailwatch_imap::{IdleOutcome, Security};
//!
//! #[tokio::main]
//! async fn main() -> mailwatch_imap::Result<()> {
//!     let mut session = mailwatch_imap::connect(
//!         "imap.example.com",
//!         None,
//!         Security::Tls,
//!         "user@example.com",
//!         "password",
//!     )
//!     .await?;
//!
//!     let status = session.examine("INBOX").await?;
//!     println!("Messages: {}", status.exists);
//!
//!     match session.idle(Duration::from_secs(60), std::future::pending()).await? {
//!         IdleOutcome::CountChanged { exists } => println!("New count: {exists}"),
//!         IdleOutcome::Timeout | IdleOutcome::Interrupted => {}
//!     }
//!
//!     session.logout().await
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod auth;
mod error;
mod idle;
mod session;
pub mod stream;
mod types;

pub use auth::{Mechanism, ServerCapabilities};
pub use error::{Error, Result};
pub use idle::IdleOutcome;
pub use session::{ImapSession, connect};
pub use stream::{Security, TlsStream, Transport};
pub use types::{MailboxStatus, Uid, uid_set};
