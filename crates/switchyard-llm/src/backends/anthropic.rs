use super::{api_key, completed_response, http_settings, malformed, model_ids, require_key};
use crate::capability;
use crate::config::{GatewayConfig, ResolvedOptions, ANTHROPIC};
use crate::http::HttpTransport;
use crate::pricing::pricing_for;
use crate::provider::Provider;
use crate::sse::{sse_data, BodySource, LineParser};
use crate::usage::UsageStrategy;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde_json::{json, Value};
use switchyard_core::{
    Content, ContentBlock, CostEstimate, FinishReason, GatewayError, GatewayResult, ImageSource,
    Request, Response, TokenUsage,
};
use switchyard_stream::{Fragment, StreamHandler};
use tracing::debug;

const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API backend.
pub struct AnthropicProvider {
    model: String,
    max_tokens: u32,
    api_key: String,
    transport: HttpTransport,
}

impl AnthropicProvider {
    /// Builds the adapter. No network traffic happens until the first call.
    pub fn new(options: &ResolvedOptions, config: &GatewayConfig) -> Self {
        Self {
            model: options.model.clone(),
            max_tokens: options.max_tokens,
            api_key: api_key(options, config),
            transport: HttpTransport::new(ANTHROPIC, http_settings(options, config)),
        }
    }

    fn authed(&self, method: Method, path: &str) -> GatewayResult<RequestBuilder> {
        require_key(ANTHROPIC, &self.api_key)?;
        Ok(self
            .transport
            .request(method, path)?
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION))
    }

    /// Request body for `/v1/messages`. System instructions go to the
    /// dedicated `system` field.
    pub(crate) fn build_body(&self, request: &Request, stream: bool) -> Value {
        let messages: Vec<Value> = request
            .conversation()
            .map(|m| {
                json!({
                    "role": m.role().as_str(),
                    "content": wire_content(m.content()),
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "messages": messages,
        });
        if let Some(system) = request.system_text() {
            body["system"] = json!(system);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }
}

fn wire_content(content: &Content) -> Value {
    match content {
        Content::Text(text) => json!(text),
        Content::Blocks(blocks) => Value::Array(
            blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                    ContentBlock::Image {
                        source: ImageSource::Base64 { media_type, data },
                    } => json!({
                        "type": "image",
                        "source": {"type": "base64", "media_type": media_type, "data": data},
                    }),
                    ContentBlock::Image {
                        source: ImageSource::Url { url },
                    } => json!({
                        "type": "image",
                        "source": {"type": "url", "url": url},
                    }),
                })
                .collect(),
        ),
    }
}

/// Text blocks of a Messages API reply, concatenated.
fn reply_text(body: &Value) -> GatewayResult<String> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed(ANTHROPIC, "no content array"))?;
    Ok(blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect())
}

/// Parses the Messages API event stream.
///
/// `message_start` carries the input token count, `content_block_delta`
/// the text, `message_delta` the stop reason and output count, and
/// `message_stop` ends the reply.
#[derive(Debug, Default)]
pub struct AnthropicParser {
    input_tokens: u64,
    done: bool,
}

impl AnthropicParser {
    /// A parser at the start of a stream.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LineParser for AnthropicParser {
    fn parse_line(&mut self, line: &str) -> GatewayResult<Option<Fragment>> {
        let Some(data) = sse_data(line) else {
            return Ok(None);
        };
        let event: Value = serde_json::from_str(data).map_err(|e| {
            GatewayError::stream(ANTHROPIC, format!("undecodable event: {e}"), false)
        })?;

        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(usage) = UsageStrategy::AnthropicMessages.extract(&event) {
                    self.input_tokens = usage.input_tokens;
                }
                Ok(None)
            }
            Some("content_block_delta") => {
                let delta = &event["delta"];
                if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
                    return Ok(None);
                }
                let text = delta.get("text").and_then(Value::as_str).unwrap_or_default();
                Ok(Some(Fragment::text(text)))
            }
            Some("message_delta") => {
                let output = event
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let mut fragment = Fragment::text("")
                    .with_usage(TokenUsage::new(self.input_tokens, output))
                    .with_raw(event.clone());
                if let Some(reason) = event["delta"].get("stop_reason").and_then(Value::as_str) {
                    fragment = fragment.with_finish_reason(FinishReason::from_backend(reason));
                }
                Ok(Some(fragment))
            }
            Some("message_stop") => {
                self.done = true;
                Ok(None)
            }
            Some("error") => {
                let kind = event["error"].get("type").and_then(Value::as_str).unwrap_or("error");
                let message = event["error"]
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown stream error");
                Err(GatewayError::stream(
                    ANTHROPIC,
                    format!("{kind}: {message}"),
                    kind == "overloaded_error",
                ))
            }
            _ => Ok(None),
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        ANTHROPIC
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &Request) -> GatewayResult<Response> {
        let builder = self
            .authed(Method::POST, "/v1/messages")?
            .json(&self.build_body(request, false));
        let response = self.transport.send(builder, false).await?;
        let body = self.transport.read_json(response).await?;

        let content = reply_text(&body)?;
        let usage = UsageStrategy::AnthropicMessages.resolve(&body, &request.prompt_text(), &content);
        let finish = body.get("stop_reason").and_then(Value::as_str).map(str::to_string);
        debug!(model = %self.model, input = usage.input_tokens, output = usage.output_tokens, "message complete");
        Ok(completed_response(
            ANTHROPIC,
            &self.model,
            content,
            usage,
            pricing_for(ANTHROPIC, &self.model),
            finish.as_deref(),
            body,
        ))
    }

    async fn generate_stream(&self, request: &Request) -> GatewayResult<(Response, StreamHandler)> {
        let builder = self
            .authed(Method::POST, "/v1/messages")?
            .json(&self.build_body(request, true));
        let response = self.transport.send(builder, true).await?;

        let source = BodySource::new(ANTHROPIC, response, AnthropicParser::new());
        let initial = Response::empty(ANTHROPIC, self.model.clone());
        let handler = StreamHandler::from_request(
            initial.clone(),
            Box::new(source),
            request,
            pricing_for(ANTHROPIC, &self.model),
        );
        Ok((initial, handler))
    }

    async fn available_models(&self) -> GatewayResult<Vec<String>> {
        let builder = self.authed(Method::GET, "/v1/models")?;
        let response = self.transport.send(builder, false).await?;
        let body = self.transport.read_json(response).await?;
        model_ids(ANTHROPIC, &body)
    }

    async fn validate_credential(&self) -> GatewayResult<()> {
        self.available_models().await.map(|_| ())
    }

    fn calculate_cost(&self, usage: &TokenUsage, model: Option<&str>) -> CostEstimate {
        pricing_for(ANTHROPIC, model.unwrap_or(&self.model)).estimate(usage)
    }

    fn capability_strength(&self, capability: &str) -> u8 {
        capability::strength(&self.model, capability)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use switchyard_core::Message;

    fn provider() -> AnthropicProvider {
        let options = ResolvedOptions {
            provider: ANTHROPIC.into(),
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 1024,
            endpoint: "https://api.anthropic.com".into(),
            extras: [("api_key".to_string(), json!("sk-ant"))].into_iter().collect(),
        };
        AnthropicProvider::new(&options, &GatewayConfig::default())
    }

    #[test]
    fn test_body_promotes_system_text() {
        let request = Request::new(vec![
            Message::system("Be brief."),
            Message::user("Hi"),
            Message::assistant("Hello"),
            Message::user(Content::Blocks(vec![
                ContentBlock::Text {
                    text: "What is this?".into(),
                },
                ContentBlock::Image {
                    source: ImageSource::Base64 {
                        media_type: "image/png".into(),
                        data: "AAAA".into(),
                    },
                },
            ])),
        ])
        .with_system_prompt("You are helpful.");

        let body = provider().build_body(&request, false);
        assert_eq!(body["system"], "You are helpful.\n\nBe brief.");
        assert_eq!(body["max_tokens"], 1024);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[2]["content"][1]["source"]["type"], "base64");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_request_override_of_max_tokens() {
        let body = provider().build_body(&Request::from_prompt("x").with_max_tokens(7), true);
        assert_eq!(body["max_tokens"], 7);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_parser_event_sequence() {
        let mut p = AnthropicParser::new();
        let lines = [
            "event: message_start",
            r#"data: {"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":1}}}"#,
            r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"data: {"type":"ping"}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
            r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":5}}"#,
        ];
        let fragments: Vec<Fragment> = lines
            .iter()
            .filter_map(|l| p.parse_line(l).unwrap())
            .collect();
        let text: String = fragments.iter().map(|f| f.delta.as_str()).collect();
        assert_eq!(text, "Hello");
        let last = fragments.last().unwrap();
        assert_eq!(last.usage, Some(TokenUsage::new(12, 5)));
        assert_eq!(last.finish_reason, Some(FinishReason::Stop));
        assert!(!p.is_done());
        p.parse_line(r#"data: {"type":"message_stop"}"#).unwrap();
        assert!(p.is_done());
    }

    #[test]
    fn test_parser_error_events() {
        let mut p = AnthropicParser::new();
        let err = p
            .parse_line(r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#)
            .unwrap_err();
        assert!(err.is_retryable());
        let err = p
            .parse_line(r#"data: {"type":"error","error":{"type":"invalid_request_error","message":"bad"}}"#)
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(p.parse_line("data: {not json").is_err());
    }

    #[test]
    fn test_reply_text_joins_text_blocks() {
        let body = json!({"content": [
            {"type": "text", "text": "a"},
            {"type": "tool_use", "id": "t"},
            {"type": "text", "text": "b"}
        ]});
        assert_eq!(reply_text(&body).unwrap(), "ab");
    }

    #[tokio::test]
    async fn test_empty_key_fails_before_http() {
        let options = ResolvedOptions {
            provider: ANTHROPIC.into(),
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 10,
            endpoint: "http://127.0.0.1:9".into(),
            extras: Default::default(),
        };
        let p = AnthropicProvider::new(&options, &GatewayConfig::default());
        let err = p.validate_credential().await.unwrap_err();
        assert!(matches!(err, GatewayError::Authentication { .. }));
        assert!(!p.transport.is_connected());
    }
}
