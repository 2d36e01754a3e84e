use crate::buffer::{FragmentBuffer, StreamBuffer};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Longest wait a single delivery can be charged.
pub const MAX_DELIVERY_COST: Duration = Duration::from_secs(24 * 60 * 60);

/// A buffer that caps delivery throughput at a number of estimated tokens
/// per second.
///
/// Each delivery is charged `chars / chars_per_token / tokens_per_second`
/// seconds, capped at [`MAX_DELIVERY_COST`]; the next `get` sleeps until that
/// budget has elapsed. The wait counts against the `get` timeout, so a `get`
/// whose timeout runs out first returns `None`.
pub struct RateLimitedBuffer {
    inner: StreamBuffer,
    tokens_per_second: f64,
    chars_per_token: f64,
    next_allowed: Mutex<Option<Instant>>,
}

impl RateLimitedBuffer {
    /// Wraps a new [`StreamBuffer`] of `capacity` chars.
    ///
    /// Non-positive rates disable the limit.
    pub fn new(capacity: usize, tokens_per_second: f64, chars_per_token: f64) -> Self {
        Self::wrap(StreamBuffer::new(capacity), tokens_per_second, chars_per_token)
    }

    /// Wraps an existing buffer.
    pub fn wrap(inner: StreamBuffer, tokens_per_second: f64, chars_per_token: f64) -> Self {
        Self {
            inner,
            tokens_per_second,
            chars_per_token: if chars_per_token > 0.0 {
                chars_per_token
            } else {
                switchyard_core::CHARS_PER_TOKEN as f64
            },
            next_allowed: Mutex::new(None),
        }
    }

    /// Time one delivery of `chars` characters costs.
    pub fn delivery_cost(&self, chars: usize) -> Duration {
        if self.tokens_per_second <= 0.0 {
            return Duration::ZERO;
        }
        let tokens = chars as f64 / self.chars_per_token;
        Duration::try_from_secs_f64(tokens / self.tokens_per_second)
            .map_or(MAX_DELIVERY_COST, |cost| cost.min(MAX_DELIVERY_COST))
    }

    /// Sleeps until the budget has elapsed or the buffer is drained.
    /// Returns `false` if `deadline` came first.
    async fn wait_for_budget(&self, deadline: Option<Instant>) -> bool {
        let Some(until) = *self.next_allowed.lock() else {
            return true;
        };
        loop {
            let now = Instant::now();
            if now >= until || self.inner.is_drained() {
                return true;
            }
            if deadline.is_some_and(|d| now >= d) {
                return false;
            }
            let mut step = (until - now).min(self.inner.poll_interval());
            if let Some(d) = deadline {
                step = step.min(d - now);
            }
            tokio::time::sleep(step).await;
        }
    }
}

#[async_trait]
impl FragmentBuffer for RateLimitedBuffer {
    fn queue(&self) -> &StreamBuffer {
        &self.inner
    }

    async fn get(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now().checked_add(timeout);
        if !self.wait_for_budget(deadline).await {
            return None;
        }
        let remaining = deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));
        let out = self.inner.get(remaining).await?;
        let cost = self.delivery_cost(out.chars().count());
        *self.next_allowed.lock() = Some(Instant::now() + cost);
        Some(out)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_cost() {
        let buf = RateLimitedBuffer::new(1000, 10.0, 4.0);
        // 80 chars = 20 tokens = 2s at 10 tok/s
        assert_eq!(buf.delivery_cost(80), Duration::from_secs(2));
        let unlimited = RateLimitedBuffer::new(1000, 0.0, 4.0);
        assert_eq!(unlimited.delivery_cost(80), Duration::ZERO);
    }

    #[test]
    fn test_extreme_rate_is_capped() {
        let crawl = RateLimitedBuffer::new(1000, 1e-300, 1.0);
        assert_eq!(crawl.delivery_cost(1_000), MAX_DELIVERY_COST);
    }

    #[tokio::test]
    async fn test_get_timeout_bounds_budget_wait() {
        let buf = RateLimitedBuffer::new(1000, 1.0, 1.0);
        buf.add(&"a".repeat(60));
        buf.get(Duration::ZERO).await.unwrap();
        buf.add("b");

        let start = Instant::now();
        assert_eq!(buf.get(Duration::from_millis(30)).await, None);
        assert!(start.elapsed() < Duration::from_secs(1));
        // nothing was consumed
        assert_eq!(buf.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_second_get_waits_for_budget() {
        // 100 tok/s, 1 char per token: 20 chars cost 200ms
        let buf = RateLimitedBuffer::new(1000, 100.0, 1.0);
        buf.add(&"a".repeat(20));
        let first = Instant::now();
        assert_eq!(buf.get(Duration::ZERO).await.unwrap().len(), 20);
        assert!(first.elapsed() < Duration::from_millis(100));

        buf.add("b");
        let second = Instant::now();
        assert_eq!(buf.get(Duration::from_secs(1)).await.as_deref(), Some("b"));
        assert!(second.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_abort_cuts_budget_wait_short() {
        let buf = std::sync::Arc::new(RateLimitedBuffer::new(1000, 1.0, 1.0));
        buf.add(&"a".repeat(60));
        buf.get(Duration::ZERO).await.unwrap();

        let reader = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.get(Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buf.abort();
        let got = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, None);
    }
}
