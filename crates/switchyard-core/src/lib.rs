//! Core types and error definitions for the Switchyard gateway.
//!
//! This crate provides the value types shared by every other Switchyard crate:
//! the message/request/response model, token usage and cost objects, task
//! types, and the typed error vocabulary.
//!
//! # Main types
//!
//! - [`GatewayError`] — Unified error enum for every backend boundary.
//! - [`GatewayResult`] — Convenience alias for `Result<T, GatewayError>`.
//! - [`ErrorKind`] — Policy-facing view of an error.
//! - [`Message`] — A single immutable conversation message.
//! - [`Request`] — What the caller wants generated.
//! - [`Response`] — What came back, with usage and cost.

/// Error taxonomy and HTTP status classification.
pub mod error;
/// Conversation messages and typed content blocks.
pub mod message;
/// Generation requests and their metadata.
pub mod request;
/// Generation responses and finish reasons.
pub mod response;
pub mod task;
pub mod usage;

pub use error::{ErrorKind, FieldError, GatewayError, GatewayResult};
pub use message::{Content, ContentBlock, ImageSource, Message, Role};
pub use request::{BatchOptions, Request, RequestMetadata, StreamOptions};
pub use response::{FinishReason, Response};
pub use task::TaskType;
pub use usage::{estimate_tokens, CostEstimate, Pricing, TokenUsage, CHARS_PER_TOKEN};
