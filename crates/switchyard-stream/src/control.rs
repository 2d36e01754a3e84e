//! The stream lifecycle state machine.
//!
//! ```text
//! Initializing ──start──► Active ──pause──► Paused
//!      │                   │  ▲              │
//!      │                   │  └───resume─────┤
//!      │                   │                 │
//!      │              complete          cancel│
//!      │                   ▼                 ▼
//!      │               Completed         Cancelled ◄──cancel── Active
//!      │
//!      └──fail──► Error ◄──fail── Active / Paused
//! ```
//!
//! Every transition method returns `false`, without side effects, when the
//! current state does not allow it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle state of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// Created, not yet consuming the backend.
    Initializing,
    /// Consuming and delivering.
    Active,
    /// Consuming, delivery suspended.
    Paused,
    /// Stopped by the caller.
    Cancelled,
    /// The backend finished the reply.
    Completed,
    /// The stream failed.
    Error,
}

impl StreamState {
    /// Whether no further transitions or content changes are allowed.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Cancelled | StreamState::Completed | StreamState::Error
        )
    }
}

struct ControlInner {
    state: StreamState,
    error: Option<String>,
}

/// Thread-safe owner of a [`StreamState`].
///
/// State changes are also published on a `watch` channel so a worker can
/// react to cancellation without polling.
pub struct StreamControl {
    inner: Mutex<ControlInner>,
    tx: watch::Sender<StreamState>,
}

impl StreamControl {
    /// A new control in [`StreamState::Initializing`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StreamState::Initializing);
        Self {
            inner: Mutex::new(ControlInner {
                state: StreamState::Initializing,
                error: None,
            }),
            tx,
        }
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    /// Whether the state is terminal.
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Failure message recorded by [`StreamControl::fail`].
    pub fn error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.tx.subscribe()
    }

    /// Initializing → Active.
    pub fn start(&self) -> bool {
        self.transition(&[StreamState::Initializing], StreamState::Active)
    }

    /// Active → Paused.
    pub fn pause(&self) -> bool {
        self.transition(&[StreamState::Active], StreamState::Paused)
    }

    /// Paused → Active.
    pub fn resume(&self) -> bool {
        self.transition(&[StreamState::Paused], StreamState::Active)
    }

    /// Active/Paused → Cancelled. A second call returns `false`.
    pub fn cancel(&self) -> bool {
        self.transition(
            &[StreamState::Active, StreamState::Paused],
            StreamState::Cancelled,
        )
    }

    /// Active → Completed.
    pub fn complete(&self) -> bool {
        self.transition(&[StreamState::Active], StreamState::Completed)
    }

    /// Initializing/Active/Paused → Error, recording `message`.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            debug!(from = ?inner.state, "ignoring fail on terminal stream");
            return false;
        }
        inner.state = StreamState::Error;
        inner.error = Some(message.into());
        self.tx.send_replace(StreamState::Error);
        true
    }

    fn transition(&self, from: &[StreamState], to: StreamState) -> bool {
        let mut inner = self.inner.lock();
        if !from.contains(&inner.state) {
            debug!(from = ?inner.state, to = ?to, "rejected stream transition");
            return false;
        }
        inner.state = to;
        self.tx.send_replace(to);
        true
    }
}

impl Default for StreamControl {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamControl")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let c = StreamControl::new();
        assert_eq!(c.state(), StreamState::Initializing);
        assert!(c.start());
        assert!(c.pause());
        assert!(c.resume());
        assert!(c.complete());
        assert_eq!(c.state(), StreamState::Completed);
        assert!(c.is_terminal());
    }

    #[test]
    fn test_pause_requires_active() {
        let c = StreamControl::new();
        assert!(!c.pause());
        assert_eq!(c.state(), StreamState::Initializing);
        c.start();
        assert!(c.pause());
        assert!(!c.pause());
        assert_eq!(c.state(), StreamState::Paused);
    }

    #[test]
    fn test_resume_requires_paused() {
        let c = StreamControl::new();
        c.start();
        assert!(!c.resume());
        assert_eq!(c.state(), StreamState::Active);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let c = StreamControl::new();
        c.start();
        assert!(c.cancel());
        assert!(!c.cancel());
        assert_eq!(c.state(), StreamState::Cancelled);
    }

    #[test]
    fn test_cancel_from_paused() {
        let c = StreamControl::new();
        c.start();
        c.pause();
        assert!(c.cancel());
        assert!(!c.resume());
    }

    #[test]
    fn test_complete_only_from_active() {
        let c = StreamControl::new();
        assert!(!c.complete());
        c.start();
        c.pause();
        assert!(!c.complete());
        assert_eq!(c.state(), StreamState::Paused);
    }

    #[test]
    fn test_fail_records_message_and_is_final() {
        let c = StreamControl::new();
        assert!(c.fail("boom"));
        assert_eq!(c.state(), StreamState::Error);
        assert_eq!(c.error().as_deref(), Some("boom"));
        assert!(!c.fail("again"));
        assert!(!c.start());
        assert_eq!(c.error().as_deref(), Some("boom"));
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let c = StreamControl::new();
        c.start();
        c.complete();
        assert!(!c.pause());
        assert!(!c.resume());
        assert!(!c.cancel());
        assert!(!c.fail("late"));
        assert_eq!(c.state(), StreamState::Completed);
    }

    #[tokio::test]
    async fn test_subscribers_observe_changes() {
        let c = StreamControl::new();
        let mut rx = c.subscribe();
        c.start();
        rx.changed().await.ok();
        assert_eq!(*rx.borrow(), StreamState::Active);
        c.pause();
        c.cancel();
        rx.changed().await.ok();
        assert_eq!(*rx.borrow(), StreamState::Cancelled);
    }
}
