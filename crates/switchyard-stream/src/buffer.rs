//! Bounded, thread-safe FIFO of text fragments between a stream worker and
//! its reader.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// How long a blocked reader or writer sleeps before re-checking state.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Counters describing buffer traffic. Kept under their own lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferMetrics {
    /// Calls to `add` that queued at least one character.
    pub fragments_added: u64,
    /// Characters accepted into the queue.
    pub chars_added: u64,
    /// Characters rejected because the buffer was full.
    pub chars_dropped: u64,
    /// Characters handed to readers.
    pub chars_delivered: u64,
    /// Successful `get` calls.
    pub deliveries: u64,
    /// Writes refused because the buffer was closed.
    pub rejected_writes: u64,
}

struct BufferState {
    queue: VecDeque<String>,
    queued_chars: usize,
    paused: bool,
    closed: bool,
    last_activity: Instant,
    oldest_enqueued: Option<Instant>,
}

/// Read-only view of the queued fragments, handed to delivery predicates.
pub struct PendingView<'a> {
    queue: &'a VecDeque<String>,
    /// Characters currently queued.
    pub queued_chars: usize,
    /// How long the oldest queued fragment has waited.
    pub oldest_age: Option<Duration>,
    /// Whether the writer has closed the buffer.
    pub closed: bool,
}

impl PendingView<'_> {
    /// Whether the queued text, read as one string, contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        if self.queue.iter().any(|f| f.contains(needle)) {
            return true;
        }
        // the needle may straddle two fragments
        self.queue.iter().map(String::as_str).collect::<String>().contains(needle)
    }
}

/// The plain bounded buffer.
///
/// Invariant: the queued character count never exceeds `capacity`. A paused
/// buffer keeps accepting writes but withholds them from readers until it is
/// resumed.
pub struct StreamBuffer {
    capacity: usize,
    poll_interval: Duration,
    state: Mutex<BufferState>,
    metrics: Mutex<BufferMetrics>,
    data_ready: Notify,
    space_ready: Notify,
}

impl StreamBuffer {
    /// A buffer holding at most `capacity` characters.
    pub fn new(capacity: usize) -> Self {
        Self::with_poll_interval(capacity, DEFAULT_POLL_INTERVAL)
    }

    /// A buffer with a custom poll granularity.
    pub fn with_poll_interval(capacity: usize, poll_interval: Duration) -> Self {
        Self {
            capacity,
            poll_interval,
            state: Mutex::new(BufferState {
                queue: VecDeque::new(),
                queued_chars: 0,
                paused: false,
                closed: false,
                last_activity: Instant::now(),
                oldest_enqueued: None,
            }),
            metrics: Mutex::new(BufferMetrics::default()),
            data_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    /// Poll granularity used while waiting.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Queue `text`.
    ///
    /// Returns `false` when the buffer is closed or when `text` does not fit;
    /// in the latter case the prefix that fits is kept and the tail dropped.
    pub fn add(&self, text: &str) -> bool {
        if text.is_empty() {
            return !self.is_closed();
        }
        let len = text.chars().count();

        let mut st = self.state.lock();
        if st.closed {
            drop(st);
            self.metrics.lock().rejected_writes += 1;
            return false;
        }

        let room = self.capacity.saturating_sub(st.queued_chars);
        let (accepted, accepted_len) = if len <= room {
            (text.to_string(), len)
        } else {
            (text.chars().take(room).collect::<String>(), room)
        };

        let now = Instant::now();
        if accepted_len > 0 {
            st.queue.push_back(accepted);
            st.queued_chars += accepted_len;
            st.oldest_enqueued.get_or_insert(now);
        }
        st.last_activity = now;
        let paused = st.paused;
        drop(st);

        {
            let mut m = self.metrics.lock();
            if accepted_len > 0 {
                m.fragments_added += 1;
            }
            m.chars_added += accepted_len as u64;
            m.chars_dropped += (len - accepted_len) as u64;
        }

        if accepted_len > 0 && !paused {
            self.data_ready.notify_one();
        }
        accepted_len == len
    }

    /// Drain every queued fragment, waiting up to `timeout` for one to
    /// arrive. Returns `None` on timeout, or once the buffer is closed and
    /// empty. `get(Duration::ZERO)` never waits.
    pub async fn get(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(out) = self.take_when(|_| true) {
                return Some(out);
            }
            if self.is_drained() {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.wait_for_data(deadline - now).await;
        }
    }

    /// Drain the queue if it is deliverable (not paused, not empty) and
    /// `ready` accepts it.
    pub fn take_when<F>(&self, ready: F) -> Option<String>
    where
        F: FnOnce(&PendingView<'_>) -> bool,
    {
        let mut st = self.state.lock();
        if st.paused || st.queue.is_empty() {
            return None;
        }
        let now = Instant::now();
        let view = PendingView {
            queue: &st.queue,
            queued_chars: st.queued_chars,
            oldest_age: st.oldest_enqueued.map(|t| now.duration_since(t)),
            closed: st.closed,
        };
        if !ready(&view) {
            return None;
        }

        let out: String = st.queue.drain(..).collect();
        let delivered = st.queued_chars;
        st.queued_chars = 0;
        st.oldest_enqueued = None;
        st.last_activity = now;
        drop(st);

        {
            let mut m = self.metrics.lock();
            m.deliveries += 1;
            m.chars_delivered += delivered as u64;
        }
        self.space_ready.notify_one();
        Some(out)
    }

    /// Sleep until data may be available, at most `max_wait` and at most one
    /// poll interval.
    pub async fn wait_for_data(&self, max_wait: Duration) {
        let wait = max_wait.min(self.poll_interval);
        let _ = tokio::time::timeout(wait, self.data_ready.notified()).await;
    }

    /// Sleep until a reader frees space, at most one poll interval.
    pub async fn wait_for_space(&self) {
        let _ = tokio::time::timeout(self.poll_interval, self.space_ready.notified()).await;
    }

    /// Concatenation of the queued fragments, without draining them.
    pub fn peek(&self) -> Option<String> {
        let st = self.state.lock();
        if st.queue.is_empty() {
            None
        } else {
            Some(st.queue.iter().map(String::as_str).collect())
        }
    }

    /// Suspend delivery. Writes are still accepted.
    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    /// Resume delivery and wake a waiting reader.
    pub fn resume(&self) {
        let has_data = {
            let mut st = self.state.lock();
            st.paused = false;
            !st.queue.is_empty()
        };
        if has_data {
            self.data_ready.notify_one();
        }
    }

    /// Refuse further writes. Queued data stays readable.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.wake_all();
    }

    /// Discard queued data and close. Used on cancellation.
    pub fn abort(&self) {
        {
            let mut st = self.state.lock();
            st.queue.clear();
            st.queued_chars = 0;
            st.oldest_enqueued = None;
            st.paused = false;
            st.closed = true;
        }
        self.wake_all();
    }

    fn wake_all(&self) {
        self.data_ready.notify_waiters();
        self.data_ready.notify_one();
        self.space_ready.notify_waiters();
        self.space_ready.notify_one();
    }

    /// Time since the last write or delivery.
    pub fn idle_time(&self) -> Duration {
        self.state.lock().last_activity.elapsed()
    }

    /// Whether delivery is suspended.
    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Whether writes are refused.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Closed with nothing left to read.
    pub fn is_drained(&self) -> bool {
        let st = self.state.lock();
        st.closed && st.queue.is_empty()
    }

    /// Characters queued.
    pub fn len(&self) -> usize {
        self.state.lock().queued_chars
    }

    /// Maximum queued characters.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Characters that can still be queued.
    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// Snapshot of the traffic counters.
    pub fn metrics(&self) -> BufferMetrics {
        *self.metrics.lock()
    }
}

/// Delivery policy seam shared by the plain, rate-limited and batching
/// buffers.
///
/// Every implementation wraps a [`StreamBuffer`]; only `get` differs, so
/// everything else has a default that delegates to [`FragmentBuffer::queue`].
#[async_trait]
pub trait FragmentBuffer: Send + Sync {
    /// The underlying queue.
    fn queue(&self) -> &StreamBuffer;

    /// Deliver queued text according to this buffer's policy.
    async fn get(&self, timeout: Duration) -> Option<String>;

    /// See [`StreamBuffer::add`].
    fn add(&self, text: &str) -> bool {
        self.queue().add(text)
    }

    /// See [`StreamBuffer::pause`].
    fn pause(&self) {
        self.queue().pause();
    }

    /// See [`StreamBuffer::resume`].
    fn resume(&self) {
        self.queue().resume();
    }

    /// See [`StreamBuffer::close`].
    fn close(&self) {
        self.queue().close();
    }

    /// See [`StreamBuffer::abort`].
    fn abort(&self) {
        self.queue().abort();
    }

    /// See [`StreamBuffer::peek`].
    fn peek(&self) -> Option<String> {
        self.queue().peek()
    }

    /// See [`StreamBuffer::idle_time`].
    fn idle_time(&self) -> Duration {
        self.queue().idle_time()
    }

    /// See [`StreamBuffer::is_drained`].
    fn is_drained(&self) -> bool {
        self.queue().is_drained()
    }

    /// See [`StreamBuffer::metrics`].
    fn metrics(&self) -> BufferMetrics {
        self.queue().metrics()
    }
}

#[async_trait]
impl FragmentBuffer for StreamBuffer {
    fn queue(&self) -> &StreamBuffer {
        self
    }

    async fn get(&self, timeout: Duration) -> Option<String> {
        StreamBuffer::get(self, timeout).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_add_then_get_returns_ordered_concatenation() {
        let buf = StreamBuffer::new(100);
        assert!(buf.add("Hel"));
        assert!(buf.add("lo, "));
        assert!(buf.add("world"));
        assert_eq!(buf.get(Duration::ZERO).await.as_deref(), Some("Hello, world"));
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.get(Duration::ZERO).await, None);
    }

    #[tokio::test]
    async fn test_overflow_keeps_fitting_prefix() {
        let buf = StreamBuffer::new(5);
        assert!(buf.add("abc"));
        assert!(!buf.add("defgh"));
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.get(Duration::ZERO).await.as_deref(), Some("abcde"));

        let m = buf.metrics();
        assert_eq!(m.chars_added, 5);
        assert_eq!(m.chars_dropped, 3);
        assert_eq!(m.chars_delivered, 5);
    }

    #[tokio::test]
    async fn test_capacity_counts_chars_not_bytes() {
        let buf = StreamBuffer::new(3);
        assert!(buf.add("héé"));
        assert!(!buf.add("x"));
        assert_eq!(buf.get(Duration::ZERO).await.as_deref(), Some("héé"));
    }

    #[tokio::test]
    async fn test_paused_buffer_accepts_but_withholds() {
        let buf = StreamBuffer::new(100);
        buf.pause();
        assert!(buf.add("queued"));
        assert_eq!(buf.get(Duration::from_millis(20)).await, None);
        assert_eq!(buf.peek().as_deref(), Some("queued"));
        buf.resume();
        assert_eq!(buf.get(Duration::ZERO).await.as_deref(), Some("queued"));
    }

    #[tokio::test]
    async fn test_peek_is_non_destructive() {
        let buf = StreamBuffer::new(100);
        assert_eq!(buf.peek(), None);
        buf.add("a");
        buf.add("b");
        assert_eq!(buf.peek().as_deref(), Some("ab"));
        assert_eq!(buf.len(), 2);
    }

    #[tokio::test]
    async fn test_closed_buffer_rejects_writes_but_drains() {
        let buf = StreamBuffer::new(100);
        buf.add("tail");
        buf.close();
        assert!(!buf.add("late"));
        assert_eq!(buf.get(Duration::from_secs(1)).await.as_deref(), Some("tail"));
        assert_eq!(buf.get(Duration::from_secs(1)).await, None);
        assert_eq!(buf.metrics().rejected_writes, 1);
    }

    #[tokio::test]
    async fn test_blocked_reader_wakes_on_write() {
        let buf = Arc::new(StreamBuffer::new(100));
        let reader = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.get(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buf.add("ping");
        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_deref(), Some("ping"));
    }

    #[tokio::test]
    async fn test_abort_wakes_reader_within_poll_interval() {
        let buf = Arc::new(StreamBuffer::with_poll_interval(100, Duration::from_millis(10)));
        let reader = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.get(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = Instant::now();
        buf.abort();
        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, None);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_idle_time_resets_on_activity() {
        let buf = StreamBuffer::new(100);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(buf.idle_time() >= Duration::from_millis(25));
        buf.add("x");
        assert!(buf.idle_time() < Duration::from_millis(25));
    }

    #[test]
    fn test_pending_view_finds_straddling_delimiter() {
        let buf = StreamBuffer::new(100);
        buf.add("first line\r");
        buf.add("\nsecond");
        let out = buf.take_when(|v| v.contains("\r\n"));
        assert_eq!(out.as_deref(), Some("first line\r\nsecond"));
    }
}
