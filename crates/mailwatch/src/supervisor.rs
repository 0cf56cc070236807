//! Restarts the watch loop after failures.

use std::convert::Infallible;
use std::time::Duration;

use mailwatch_core::Error;
use tokio::time::Instant;

/// Exponential backoff between restarts.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// First delay, and the delay after a reset.
    pub initial: Duration,
    /// Delay clamp.
    pub max: Duration,
    /// Multiplier applied after every attempt.
    pub factor: u32,
    value: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(5 * 60))
    }
}

impl Backoff {
    /// Doubling backoff from `initial` up to `max`.
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            factor: 2,
            value: initial,
        }
    }

    /// Returns the current delay and precomputes the next one.
    pub fn advance(&mut self) -> Duration {
        let current = self.value;
        self.value = current.saturating_mul(self.factor).min(self.max);
        current
    }

    /// Starts over from the initial delay.
    pub const fn reset(&mut self) {
        self.value = self.initial;
    }
}

/// Runs `work` until it fails in a way a restart cannot fix.
///
/// Every failure is followed by a backoff delay. An attempt that lasted at
/// least `healthy_after` resets the backoff first. Permanent failures such
/// as rejected credentials are returned straight away.
pub async fn supervise<W>(mut work: W, mut backoff: Backoff, healthy_after: Duration) -> Error
where
    W: AsyncFnMut() -> Result<Infallible, Error>,
{
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        let started = Instant::now();
        let err = match work().await {
            Ok(never) => match never {},
            Err(err) => err,
        };

        if err.is_permanent() {
            tracing::error!(attempt, error = %err, "giving up");
            return err;
        }
        if started.elapsed() >= healthy_after {
            backoff.reset();
        }
        let delay = backoff.advance();
        tracing::warn!(attempt, error = %err, retry_in = ?delay, "watch loop failed, restarting");
        tokio::time::sleep(delay).await;
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
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn test_backoff_doubles_and_clamps() {
        let mut backoff = Backoff::new(2 * SECOND, 10 * SECOND);
        let delays: Vec<u64> = (0..5).map(|_| backoff.advance().as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 10, 10]);

        backoff.reset();
        assert_eq!(backoff.advance(), 2 * SECOND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_with_growing_delay() {
        let start = Instant::now();
        let mut attempts = Vec::new();

        let err = supervise(
            async || {
                attempts.push(start.elapsed().as_secs());
                if attempts.len() == 4 {
                    Err(Error::Authentication("rejected".into()))
                } else {
                    Err(Error::Connection("refused".into()))
                }
            },
            Backoff::default(),
            60 * SECOND,
        )
        .await;

        assert!(matches!(err, Error::Authentication(_)));
        assert_eq!(attempts, vec![0, 2, 6, 14]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_attempt_resets_backoff() {
        let start = Instant::now();
        let mut attempts = Vec::new();

        supervise(
            async || {
                attempts.push(start.elapsed().as_secs());
                match attempts.len() {
                    3 => {
                        tokio::time::sleep(120 * SECOND).await;
                        Err(Error::Connection("reset by peer".into()))
                    }
                    5 => Err(Error::Authentication("rejected".into())),
                    _ => Err(Error::Protocol("BYE".into())),
                }
            },
            Backoff::default(),
            60 * SECOND,
        )
        .await;

        // 0 fails, +2; 2 fails, +4; 6 runs 120s and resets, +2; 128 fails, +4.
        assert_eq!(attempts, vec![0, 2, 6, 128, 132]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_error_is_not_retried() {
        let mut calls = 0;
        let err = supervise(
            async || {
                calls += 1;
                Err(Error::Config("IMAP server is required".into()))
            },
            Backoff::default(),
            60 * SECOND,
        )
        .await;

        assert!(matches!(err, Error::Config(_)));
        assert_eq!(calls, 1);
    }
}
