//! `mailwatch` - Watches an IMAP inbox and lists it on every change.
//!
//! Settings come from `settings.json` in the user's config directory (or
//! `$MAILWATCH_CONFIG`), overridable with `MAILWATCH_HOST`,
//! `MAILWATCH_USERNAME` and `MAILWATCH_PASSWORD`.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod settings;
mod supervisor;
mod worker;

use std::sync::Arc;

use anyhow::Context;
use mailwatch_core::{Watcher, notification_channel};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use supervisor::Backoff;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "mailwatch=info,mailwatch_core=info,mailwatch_imap=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting mailwatch");

    let config = settings::load().await.context("invalid settings")?;
    let options = config.options();
    let watcher = Arc::new(Watcher::from_config(&config));
    info!(
        host = %watcher.server().host,
        mailbox = %watcher.mailbox(),
        cycle_secs = options.cycle.as_secs(),
        "loaded settings"
    );

    let (mut changes, receiver) = notification_channel();
    let worker = tokio::spawn(worker::run(Arc::clone(&watcher), receiver));

    let supervised = supervisor::supervise(
        async || watcher.watch(&mut changes).await,
        Backoff::default(),
        options.cycle,
    );

    let result = tokio::select! {
        err = supervised => Err(anyhow::Error::new(err).context("watch loop stopped")),
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("Shutting down");
            Ok(())
        }
    };
    worker.abort();
    result
}
