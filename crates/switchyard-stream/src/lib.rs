//! Streaming subsystem for the Switchyard gateway.
//!
//! A stream is three composed parts: a [`StreamControl`] lifecycle state
//! machine, a bounded [`FragmentBuffer`] between the backend and the reader,
//! and a [`FragmentSource`] that yields backend fragments. [`StreamHandler`]
//! ties them together with a worker task.
//!
//! # Main types
//!
//! - [`StreamHandler`] — A streaming reply in progress.
//! - [`StreamController`] — Cloneable pause/resume/cancel handle.
//! - [`StreamBuffer`] — The plain bounded fragment queue.
//! - [`RateLimitedBuffer`] / [`BatchingBuffer`] — Delivery policies over it.
//! - [`BufferConfig`] — Chooses a buffer from the request's stream options.

/// Bounded fragment queue and the delivery-policy trait.
pub mod buffer;
/// Batch-until-ready delivery.
pub mod batching;
/// Buffer selection from request options.
pub mod config;
pub mod control;
pub mod handler;
/// Throughput-capped delivery.
pub mod rate_limited;
pub mod source;

pub use batching::BatchingBuffer;
pub use buffer::{BufferMetrics, FragmentBuffer, PendingView, StreamBuffer, DEFAULT_POLL_INTERVAL};
pub use config::BufferConfig;
pub use control::{StreamControl, StreamState};
pub use handler::{HandlerSource, StreamController, StreamHandler, StreamSettings};
pub use rate_limited::RateLimitedBuffer;
pub use source::{Fragment, FragmentSource, VecSource};
