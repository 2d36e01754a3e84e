use crate::usage::{CostEstimate, TokenUsage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why generation stopped, normalized across backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of the reply.
    Stop,
    /// The max-token limit was reached.
    Length,
    /// The backend filtered the content.
    ContentFilter,
    /// The model asked to call a tool.
    ToolUse,
    /// The caller cancelled a stream.
    Cancelled,
    /// The stream ended in an error.
    Error,
    /// Any other backend-specific reason.
    Other(String),
}

impl FinishReason {
    /// Maps a backend's stop/finish reason string.
    pub fn from_backend(reason: &str) -> Self {
        match reason {
            "stop" | "end_turn" | "stop_sequence" | "eos" => FinishReason::Stop,
            "length" | "max_tokens" => FinishReason::Length,
            "content_filter" | "safety" | "refusal" => FinishReason::ContentFilter,
            "tool_calls" | "tool_use" | "function_call" => FinishReason::ToolUse,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// The result of a generation call.
///
/// Blocking calls return it fully populated. Streaming calls hand back an
/// empty one immediately and the final copy once the stream is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Gateway-assigned identifier.
    pub id: Uuid,
    /// Provider that served the call.
    pub provider: String,
    /// Model that served the call.
    pub model: String,
    /// Generated text.
    pub content: String,
    /// Token counters, reported or estimated.
    pub usage: TokenUsage,
    /// Priced usage.
    pub cost: CostEstimate,
    /// Raw backend payload (the final event for streams).
    #[serde(default)]
    pub raw: Option<serde_json::Value>,
    /// Why generation stopped; `None` while a stream is still running.
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
    /// When the response object was created.
    pub created_at: DateTime<Utc>,
}

impl Response {
    /// An empty response for `provider`/`model`, the starting point of a stream.
    pub fn empty(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.into(),
            model: model.into(),
            content: String::new(),
            usage: TokenUsage::default(),
            cost: CostEstimate::zero(),
            raw: None,
            finish_reason: None,
            created_at: Utc::now(),
        }
    }

    /// Whether generation has finished.
    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(FinishReason::from_backend("end_turn"), FinishReason::Stop);
        assert_eq!(FinishReason::from_backend("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::from_backend("max_tokens"), FinishReason::Length);
        assert_eq!(FinishReason::from_backend("length"), FinishReason::Length);
        assert_eq!(
            FinishReason::from_backend("tool_calls"),
            FinishReason::ToolUse
        );
        assert_eq!(
            FinishReason::from_backend("weird"),
            FinishReason::Other("weird".into())
        );
    }

    #[test]
    fn test_empty_response() {
        let resp = Response::empty("mock", "mock-model");
        assert!(resp.content.is_empty());
        assert!(resp.usage.is_empty());
        assert!(!resp.is_finished());
    }
}
