//! Track errors and successes to enable backing off reconnect attempts.
use std::time::Duration;

use anyhow::Result;

use crate::config::BackoffConfig;
use crate::context::Context;
use crate::error::ReconnectAttemptsExceeded;

/// Track failures and successes to incrementally delay retries.
///
/// Intended for use in looping operations:
///
/// - When a loop encounters an error call [`Backoff::retry`].
/// - When a loop completes call [`Backoff::success`] to clear memory of previous failures.
///
/// `max_retries` mirrors `maxReconnectToBroker` from `spec.md` §4.1: `None` (config key
/// absent) means unlimited attempts, `Some(0)` means never retry, `Some(n)` means stop
/// after `n` attempts.
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    max_retries: Option<u32>,
    multiplier: u32,
    seen: u32,
    start_delay: Duration,
}

impl Backoff {
    /// Initialise a new backoff engine from configuration.
    pub fn new(conf: &BackoffConfig) -> Backoff {
        let start_delay = Duration::from_millis(conf.start_delay_ms);
        Backoff {
            delay: start_delay,
            max_delay: Duration::from_secs(conf.max_delay_secs),
            max_retries: conf.max_retries,
            multiplier: conf.multiplier,
            seen: 0,
            start_delay,
        }
    }

    /// The loop has encountered an error and needs to delay the next cycle appropriately.
    ///
    /// When the loop fails too many times the original error is reported back so the
    /// caller can fail properly. Otherwise this sleeps for an incrementally longer
    /// period, up to a configured max, and returns `Ok(())`.
    pub async fn retry(&mut self, context: &Context, error: anyhow::Error) -> Result<()> {
        self.seen += 1;
        if let Some(max) = self.max_retries {
            if self.seen > max {
                let context = ReconnectAttemptsExceeded(max);
                return Err(error.context(context));
            }
        }

        slog::warn!(
            context.logger, "Broker connection attempt failed, retrying after backoff";
            "attempt" => self.seen, "delay_ms" => self.delay.as_millis() as u64,
            "error" => %error,
        );
        tokio::time::sleep(self.delay).await;
        self.delay = std::cmp::min(self.delay * self.multiplier, self.max_delay);
        Ok(())
    }

    /// Reset the state of tracked failures.
    pub fn success(&mut self) {
        self.delay = self.start_delay;
        self.seen = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf() -> BackoffConfig {
        BackoffConfig {
            start_delay_ms: 1,
            max_delay_secs: 1,
            max_retries: Some(2),
            multiplier: 2,
        }
    }

    #[tokio::test]
    async fn retry_exceeds_max() {
        let context = Context::fixture();
        let mut backoff = Backoff::new(&conf());
        backoff.retry(&context, anyhow::anyhow!("e1")).await.unwrap();
        backoff.retry(&context, anyhow::anyhow!("e2")).await.unwrap();
        let result = backoff.retry(&context, anyhow::anyhow!("e3")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn success_resets_count() {
        let context = Context::fixture();
        let mut backoff = Backoff::new(&conf());
        backoff.retry(&context, anyhow::anyhow!("e1")).await.unwrap();
        backoff.retry(&context, anyhow::anyhow!("e2")).await.unwrap();
        backoff.success();
        // After success the counter is back to zero, so two more retries succeed.
        backoff.retry(&context, anyhow::anyhow!("e3")).await.unwrap();
        backoff.retry(&context, anyhow::anyhow!("e4")).await.unwrap();
    }

    #[tokio::test]
    async fn unlimited_when_max_retries_unset() {
        let context = Context::fixture();
        let mut conf = conf();
        conf.max_retries = None;
        let mut backoff = Backoff::new(&conf);
        for _ in 0..10 {
            backoff
                .retry(&context, anyhow::anyhow!("e"))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn never_retries_when_max_retries_explicit_zero() {
        let context = Context::fixture();
        let mut conf = conf();
        conf.max_retries = Some(0);
        let mut backoff = Backoff::new(&conf);
        let result = backoff.retry(&context, anyhow::anyhow!("e1")).await;
        assert!(result.is_err());
    }
}
