use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchyard_core::TokenUsage;

/// Where a backend reports token counters in its payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStrategy {
    /// `usage.input_tokens` / `usage.output_tokens`, also nested under
    /// `message` in a stream's `message_start` event.
    AnthropicMessages,
    /// `usage.prompt_tokens` / `usage.completion_tokens`.
    OpenAiChat,
    /// Top-level `prompt_eval_count` / `eval_count`.
    OllamaCounters,
}

impl UsageStrategy {
    /// Reported usage in `payload`, if the counters are present.
    pub fn extract(self, payload: &Value) -> Option<TokenUsage> {
        let (usage, input_key, output_key) = match self {
            UsageStrategy::AnthropicMessages => {
                let usage = payload
                    .get("usage")
                    .or_else(|| payload.get("message").and_then(|m| m.get("usage")))?;
                (usage, "input_tokens", "output_tokens")
            }
            UsageStrategy::OpenAiChat => (payload.get("usage")?, "prompt_tokens", "completion_tokens"),
            UsageStrategy::OllamaCounters => (payload, "prompt_eval_count", "eval_count"),
        };
        let input = usage.get(input_key).and_then(Value::as_u64);
        let output = usage.get(output_key).and_then(Value::as_u64);
        if input.is_none() && output.is_none() {
            return None;
        }
        Some(TokenUsage::new(input.unwrap_or(0), output.unwrap_or(0)))
    }

    /// Reported usage, or a character-count estimate when the payload has
    /// none.
    pub fn resolve(self, payload: &Value, prompt: &str, completion: &str) -> TokenUsage {
        self.extract(payload)
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| TokenUsage::estimate(prompt, completion))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_anthropic_usage() {
        let body = json!({"usage": {"input_tokens": 10, "output_tokens": 25}});
        assert_eq!(
            UsageStrategy::AnthropicMessages.extract(&body),
            Some(TokenUsage::new(10, 25))
        );
        let start = json!({"type": "message_start", "message": {"usage": {"input_tokens": 7}}});
        assert_eq!(
            UsageStrategy::AnthropicMessages.extract(&start),
            Some(TokenUsage::new(7, 0))
        );
    }

    #[test]
    fn test_openai_usage() {
        let body = json!({"usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}});
        assert_eq!(
            UsageStrategy::OpenAiChat.extract(&body),
            Some(TokenUsage::new(3, 4))
        );
        assert_eq!(UsageStrategy::OpenAiChat.extract(&json!({"usage": null})), None);
    }

    #[test]
    fn test_ollama_counters() {
        let body = json!({"done": true, "prompt_eval_count": 26, "eval_count": 290});
        assert_eq!(
            UsageStrategy::OllamaCounters.extract(&body),
            Some(TokenUsage::new(26, 290))
        );
    }

    #[test]
    fn test_resolve_falls_back_to_estimate() {
        let usage = UsageStrategy::OpenAiChat.resolve(&json!({}), "12345678", "abcd");
        assert_eq!(usage, TokenUsage::new(2, 1));
    }
}
