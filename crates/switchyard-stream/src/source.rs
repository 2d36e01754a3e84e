//! The "pull next fragment" seam between a backend and the stream worker.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use switchyard_core::{FinishReason, GatewayResult, TokenUsage};

/// One incremental event from a backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    /// Generated text; may be empty for bookkeeping events.
    pub delta: String,
    /// Usage, when the backend reports it on this event.
    pub usage: Option<TokenUsage>,
    /// Why generation stopped, when this event says so.
    pub finish_reason: Option<FinishReason>,
    /// The decoded backend event.
    pub raw: Option<serde_json::Value>,
}

impl Fragment {
    /// A text fragment.
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: delta.into(),
            ..Default::default()
        }
    }

    /// Attaches reported usage.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Attaches a finish reason.
    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = Some(reason);
        self
    }

    /// Attaches the raw backend event.
    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }
}

/// Produces fragments until the reply ends.
#[async_trait]
pub trait FragmentSource: Send {
    /// The next fragment, an error, or `None` once the reply is complete.
    async fn next_fragment(&mut self) -> Option<GatewayResult<Fragment>>;

    /// Releases the backend connection. Called once when the stream ends,
    /// whatever the reason.
    async fn close(&mut self) -> GatewayResult<()> {
        Ok(())
    }
}

/// A source replaying a fixed list of fragments, optionally pausing before
/// each one.
pub struct VecSource {
    items: VecDeque<GatewayResult<Fragment>>,
    delay: Duration,
}

impl VecSource {
    /// Replays `items` in order.
    pub fn new(items: Vec<GatewayResult<Fragment>>) -> Self {
        Self {
            items: items.into(),
            delay: Duration::ZERO,
        }
    }

    /// Replays successful text fragments.
    pub fn from_deltas<I, S>(deltas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(deltas.into_iter().map(|d| Ok(Fragment::text(d))).collect())
    }

    /// Sleeps `delay` before yielding each item.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl FragmentSource for VecSource {
    async fn next_fragment(&mut self) -> Option<GatewayResult<Fragment>> {
        if self.items.is_empty() {
            return None;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.items.pop_front()
    }
}
