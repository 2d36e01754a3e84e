use crate::message::{Message, Role};
use crate::task::TaskType;
use crate::usage::CHARS_PER_TOKEN;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Batching controls for a streamed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Deliver once at least this many characters are queued.
    #[serde(default = "default_batch_min_chars")]
    pub min_chars: usize,
    /// Deliver whatever is queued once the oldest fragment has waited this long.
    #[serde(default = "default_batch_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Deliver as soon as the queued text contains this substring.
    #[serde(default)]
    pub delimiter: Option<String>,
}

fn default_batch_min_chars() -> usize {
    64
}

fn default_batch_max_wait_ms() -> u64 {
    250
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            min_chars: default_batch_min_chars(),
            max_wait_ms: default_batch_max_wait_ms(),
            delimiter: None,
        }
    }
}

/// Per-request streaming controls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Maximum queued characters between the backend and the reader.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Cap delivery at this many estimated tokens per second.
    #[serde(default)]
    pub max_tokens_per_second: Option<f64>,
    /// Characters per token used by the rate limiter.
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f64,
    /// Batch deltas before delivery.
    #[serde(default)]
    pub batch: Option<BatchOptions>,
    /// Fail the stream if the backend sends nothing for this long.
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
}

fn default_buffer_capacity() -> usize {
    64 * 1024
}

fn default_chars_per_token() -> f64 {
    CHARS_PER_TOKEN as f64
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            max_tokens_per_second: None,
            chars_per_token: default_chars_per_token(),
            batch: None,
            idle_timeout_ms: None,
        }
    }
}

/// Optional hints attached to a [`Request`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Explicit task type; overrides keyword classification.
    #[serde(default)]
    pub task_type: Option<TaskType>,
    /// Capability tags the serving model should have.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Streaming controls.
    #[serde(default)]
    pub stream: StreamOptions,
    /// Free-form caller data, passed through untouched.
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A generation request.
///
/// Owned by the caller; adapters only ever borrow it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Conversation so far, oldest first.
    pub messages: Vec<Message>,
    /// System prompt, sent through each backend's dedicated slot.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Routing and streaming hints.
    #[serde(default)]
    pub metadata: RequestMetadata,
    /// Per-call override of the resolved max tokens.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Per-call sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl Request {
    /// Creates a request from a list of messages.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Shorthand for a single user message.
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self::new(vec![Message::user(prompt.into())])
    }

    /// Sets the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Sets the max-tokens override.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Sets the temperature override.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the task-type hint.
    pub fn with_task_type(mut self, task: TaskType) -> Self {
        self.metadata.task_type = Some(task);
        self
    }

    /// Replaces the streaming controls.
    pub fn with_stream_options(mut self, options: StreamOptions) -> Self {
        self.metadata.stream = options;
        self
    }

    /// Text of the most recent user message, if any.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role() == Role::User)
            .map(Message::text)
    }

    /// All system instructions: the system prompt followed by any
    /// system-role messages, joined by blank lines.
    pub fn system_text(&self) -> Option<String> {
        let mut parts: Vec<String> = Vec::new();
        if let Some(sys) = &self.system_prompt {
            if !sys.trim().is_empty() {
                parts.push(sys.clone());
            }
        }
        parts.extend(
            self.messages
                .iter()
                .filter(|m| m.role() == Role::System)
                .map(Message::text),
        );
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// Messages other than system-role ones, in order.
    pub fn conversation(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.role() != Role::System)
    }

    /// Full prompt text (system text plus every message), used for estimates.
    pub fn prompt_text(&self) -> String {
        let mut out = String::new();
        if let Some(sys) = &self.system_prompt {
            out.push_str(sys);
            out.push('\n');
        }
        for m in &self.messages {
            out.push_str(&m.text());
            out.push('\n');
        }
        out
    }

    /// Input token estimate using the characters-per-token heuristic.
    pub fn estimated_input_tokens(&self) -> u64 {
        let chars: usize = self.system_prompt.as_deref().map_or(0, |s| s.chars().count())
            + self
                .messages
                .iter()
                .map(|m| m.content().char_count())
                .sum::<usize>();
        (chars / CHARS_PER_TOKEN) as u64
    }

    /// The task this request asks for: the metadata hint when present,
    /// otherwise a keyword classification of the last user message.
    pub fn task_type(&self) -> TaskType {
        if let Some(task) = self.metadata.task_type {
            return task;
        }
        self.last_user_text()
            .map(|t| TaskType::classify_text(&t))
            .unwrap_or(TaskType::Conversation)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_system_text_merges_prompt_and_system_messages() {
        let req = Request::new(vec![
            Message::system("rule one"),
            Message::user("hi"),
            Message::system("rule two"),
        ])
        .with_system_prompt("base");
        assert_eq!(req.system_text().unwrap(), "base\n\nrule one\n\nrule two");
        assert_eq!(req.conversation().count(), 1);
    }

    #[test]
    fn test_task_type_hint_wins_over_keywords() {
        let req = Request::from_prompt("write a poem").with_task_type(TaskType::Code);
        assert_eq!(req.task_type(), TaskType::Code);
        let req = Request::from_prompt("write a poem");
        assert_eq!(req.task_type(), TaskType::Creative);
    }

    #[test]
    fn test_estimated_input_tokens() {
        let req = Request::from_prompt("hello world!").with_system_prompt("sys.");
        // 12 + 4 chars at 4 chars per token
        assert_eq!(req.estimated_input_tokens(), 4);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let req: Request =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.metadata.stream.buffer_capacity, 64 * 1024);
        assert!(req.max_tokens.is_none());
    }
}
