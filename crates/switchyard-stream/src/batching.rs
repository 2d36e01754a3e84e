use crate::buffer::{FragmentBuffer, StreamBuffer};
use async_trait::async_trait;
use std::time::{Duration, Instant};

/// A buffer that withholds delivery until a batch is worth sending.
///
/// A batch is released when any of these holds: at least `min_chars` are
/// queued, the oldest fragment has waited `max_wait`, the queued text
/// contains `delimiter`, or the writer has closed the buffer.
pub struct BatchingBuffer {
    inner: StreamBuffer,
    min_chars: usize,
    max_wait: Duration,
    delimiter: Option<String>,
}

impl BatchingBuffer {
    /// Wraps a new [`StreamBuffer`] of `capacity` chars.
    pub fn new(
        capacity: usize,
        min_chars: usize,
        max_wait: Duration,
        delimiter: Option<String>,
    ) -> Self {
        Self::wrap(StreamBuffer::new(capacity), min_chars, max_wait, delimiter)
    }

    /// Wraps an existing buffer. `min_chars` is clamped to its capacity so a
    /// full buffer always releases.
    pub fn wrap(
        inner: StreamBuffer,
        min_chars: usize,
        max_wait: Duration,
        delimiter: Option<String>,
    ) -> Self {
        let min_chars = min_chars.clamp(1, inner.capacity().max(1));
        Self {
            inner,
            min_chars,
            max_wait,
            delimiter: delimiter.filter(|d| !d.is_empty()),
        }
    }

    fn try_release(&self) -> Option<String> {
        self.inner.take_when(|view| {
            view.closed
                || view.queued_chars >= self.min_chars
                || view.oldest_age.is_some_and(|age| age >= self.max_wait)
                || self
                    .delimiter
                    .as_deref()
                    .is_some_and(|d| view.contains(d))
        })
    }
}

#[async_trait]
impl FragmentBuffer for BatchingBuffer {
    fn queue(&self) -> &StreamBuffer {
        &self.inner
    }

    async fn get(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(out) = self.try_release() {
                return Some(out);
            }
            if self.inner.is_drained() {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.inner.wait_for_data(deadline - now).await;
        }
    }
}
