//! # mailwatch-core
//!
//! Mailbox watching for mailwatch.
//!
//! This crate provides:
//! - **Watch loop** - IDLE on a mailbox in fixed cycles, reconnecting every
//!   cycle so silently dropped connections recover
//! - **Change notifications** - a handler called on every message count
//!   change, plus a coalescing channel for handing work to another task
//! - **Message operations** - search with `\Deleted` messages filtered out,
//!   and delete by UID with a mailbox-wide expunge
//! - **Session seam** - [`Connector`] and [`MailSession`] traits with an
//!   IMAP implementation backed by `mailwatch-imap`
//! - **Configuration** - JSON settings with validation
//!
//! ## Example
//!
//! ```no_run
//! use mailwatch_core::{SearchQuery, Watcher, notification_channel};
//!
//! # async fn example() -> mailwatch_core::Result<()> {
//! let watcher = std::sync::Arc::new(Watcher::new("imap.example.com", "me@example.com", "secret"));
//! let (mut tx, mut rx) = notification_channel();
//!
//! let worker = std::sync::Arc::clone(&watcher);
//! tokio::spawn(async move {
//!     while rx.recv().await.is_some() {
//!         if let Ok(messages) = worker.search(&SearchQuery::Unseen).await {
//!             println!("{} unread", messages.len());
//!         }
//!     }
//! });
//!
//! watcher.watch(&mut tx).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod config;
pub mod dispatch;
mod error;
mod message;
pub mod ops;
mod query;
pub mod session;
pub mod watch;
mod watcher;

#[cfg(test)]
mod testing;

pub use config::{
    Credentials, Security, ServerConfig, ValidationError, ValidationResult, WatchConfig,
    WatchOptions, validate_config, validate_connection,
};
pub use dispatch::{
    ChangeHandler, ChangeNotification, ChangeReceiver, ChangeSender, notification_channel,
};
pub use error::{Error, Result};
pub use message::{Address, Message};
pub use ops::{FetchFailure, SearchReport};
pub use query::SearchQuery;
pub use session::{
    Access, Connector, ImapConnector, MailSession, MailboxStatus, SessionFactory, Uid,
    WaitContext, WaitOutcome,
};
pub use watch::WatchState;
pub use watcher::Watcher;
