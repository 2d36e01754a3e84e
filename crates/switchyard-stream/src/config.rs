use crate::batching::BatchingBuffer;
use crate::buffer::{FragmentBuffer, StreamBuffer, DEFAULT_POLL_INTERVAL};
use crate::rate_limited::RateLimitedBuffer;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::StreamOptions;

/// Which buffer a stream should use, derived from the request's stream
/// options.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferConfig {
    /// Deliver everything as soon as it arrives.
    Plain {
        /// Maximum queued characters.
        capacity: usize,
    },
    /// Cap delivery throughput.
    RateLimited {
        /// Maximum queued characters.
        capacity: usize,
        /// Estimated tokens per second.
        tokens_per_second: f64,
        /// Characters counted as one token.
        chars_per_token: f64,
    },
    /// Withhold delivery until a batch is ready.
    Batching {
        /// Maximum queued characters.
        capacity: usize,
        /// Release once this many characters are queued.
        min_chars: usize,
        /// Release once the oldest fragment has waited this long.
        max_wait: Duration,
        /// Release once the queued text contains this.
        delimiter: Option<String>,
    },
}

impl BufferConfig {
    /// Picks the variant for `options`. A throughput cap takes precedence
    /// over batching.
    pub fn from_options(options: &StreamOptions) -> Self {
        let capacity = options.buffer_capacity.max(1);
        if let Some(tps) = options.max_tokens_per_second.filter(|t| *t > 0.0) {
            return BufferConfig::RateLimited {
                capacity,
                tokens_per_second: tps,
                chars_per_token: options.chars_per_token,
            };
        }
        if let Some(batch) = &options.batch {
            return BufferConfig::Batching {
                capacity,
                min_chars: batch.min_chars,
                max_wait: Duration::from_millis(batch.max_wait_ms),
                delimiter: batch.delimiter.clone(),
            };
        }
        BufferConfig::Plain { capacity }
    }

    /// Maximum queued characters of the configured buffer.
    pub fn capacity(&self) -> usize {
        match self {
            BufferConfig::Plain { capacity }
            | BufferConfig::RateLimited { capacity, .. }
            | BufferConfig::Batching { capacity, .. } => *capacity,
        }
    }

    /// Builds the buffer with the default poll interval.
    pub fn build(&self) -> Arc<dyn FragmentBuffer> {
        self.build_with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Builds the buffer.
    pub fn build_with_poll_interval(&self, poll_interval: Duration) -> Arc<dyn FragmentBuffer> {
        let queue = StreamBuffer::with_poll_interval(self.capacity(), poll_interval);
        match self {
            BufferConfig::Plain { .. } => Arc::new(queue),
            BufferConfig::RateLimited {
                tokens_per_second,
                chars_per_token,
                ..
            } => Arc::new(RateLimitedBuffer::wrap(
                queue,
                *tokens_per_second,
                *chars_per_token,
            )),
            BufferConfig::Batching {
                min_chars,
                max_wait,
                delimiter,
                ..
            } => Arc::new(BatchingBuffer::wrap(
                queue,
                *min_chars,
                *max_wait,
                delimiter.clone(),
            )),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self::from_options(&StreamOptions::default())
    }
}
