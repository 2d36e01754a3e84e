/// Anthropic Messages API.
pub mod anthropic;
/// In-memory test backend.
pub mod mock;
/// Local Ollama server.
pub mod ollama;
/// OpenAI chat completions.
pub mod openai;

use crate::config::{GatewayConfig, ResolvedOptions};
use crate::http::HttpSettings;
use serde_json::Value;
use switchyard_core::{FinishReason, GatewayError, GatewayResult, Pricing, Response, TokenUsage};

/// HTTP settings for an adapter: the resolved endpoint plus the provider's
/// configured timeouts.
pub(crate) fn http_settings(options: &ResolvedOptions, config: &GatewayConfig) -> HttpSettings {
    let settings = config.provider_settings(&options.provider);
    HttpSettings {
        base_url: options.endpoint.clone(),
        connect_timeout: settings.connect_timeout(),
        request_timeout: settings.request_timeout(),
    }
}

/// The credential for `options.provider`: an `api_key` extra wins over the
/// configured key.
pub(crate) fn api_key(options: &ResolvedOptions, config: &GatewayConfig) -> String {
    options
        .extras
        .get("api_key")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| config.provider_settings(&options.provider).api_key_or_empty())
}

/// Rejects an empty credential without contacting the backend.
pub(crate) fn require_key(provider: &str, key: &str) -> GatewayResult<()> {
    if key.trim().is_empty() {
        return Err(GatewayError::authentication(provider, "no API key configured"));
    }
    Ok(())
}

/// A payload that parsed as JSON but not into the expected shape.
pub(crate) fn malformed(provider: &str, what: &str) -> GatewayError {
    GatewayError::Provider {
        provider: provider.to_string(),
        status: None,
        message: format!("malformed response: {what}"),
    }
}

/// Builds the final blocking response.
pub(crate) fn completed_response(
    provider: &str,
    model: &str,
    content: String,
    usage: TokenUsage,
    pricing: Pricing,
    finish_reason: Option<&str>,
    raw: Value,
) -> Response {
    let mut response = Response::empty(provider, model);
    response.cost = pricing.estimate(&usage);
    response.usage = usage;
    response.content = content;
    response.finish_reason = Some(finish_reason.map_or(FinishReason::Stop, FinishReason::from_backend));
    response.raw = Some(raw);
    response
}

/// String ids under `data[].id`, as listed by `/v1/models`.
pub(crate) fn model_ids(provider: &str, body: &Value) -> GatewayResult<Vec<String>> {
    let data = body
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed(provider, "model list has no data array"))?;
    Ok(data
        .iter()
        .filter_map(|m| m.get("id").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_require_key() {
        assert!(require_key("openai", "sk-1").is_ok());
        let err = require_key("openai", "  ").unwrap_err();
        assert!(matches!(err, GatewayError::Authentication { .. }));
    }

    #[test]
    fn test_api_key_extra_wins() {
        let mut config = GatewayConfig::default();
        config.providers.entry("openai".into()).or_default().api_key = Some("from-config".into());
        let mut options = ResolvedOptions {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            max_tokens: 10,
            endpoint: "https://api.openai.com".into(),
            extras: Default::default(),
        };
        assert_eq!(api_key(&options, &config), "from-config");
        options.extras.insert("api_key".into(), json!("from-extra"));
        assert_eq!(api_key(&options, &config), "from-extra");
    }

    #[test]
    fn test_model_ids() {
        let body = json!({"data": [{"id": "a"}, {"id": "b"}, {"object": "x"}]});
        assert_eq!(model_ids("openai", &body).unwrap(), vec!["a", "b"]);
        assert!(model_ids("openai", &json!({})).is_err());
    }
}
