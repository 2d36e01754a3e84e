use super::{api_key, completed_response, http_settings, malformed, model_ids, require_key};
use crate::capability;
use crate::config::{GatewayConfig, ResolvedOptions, OPENAI};
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
    Request, Response, Role, TokenUsage,
};
use switchyard_stream::{Fragment, StreamHandler};

/// OpenAI chat completions backend. Also works against compatible servers
/// through an endpoint override.
pub struct OpenAiProvider {
    model: String,
    max_tokens: u32,
    api_key: String,
    transport: HttpTransport,
}

impl OpenAiProvider {
    /// Builds the adapter. No network traffic happens until the first call.
    pub fn new(options: &ResolvedOptions, config: &GatewayConfig) -> Self {
        Self {
            model: options.model.clone(),
            max_tokens: options.max_tokens,
            api_key: api_key(options, config),
            transport: HttpTransport::new(OPENAI, http_settings(options, config)),
        }
    }

    fn authed(&self, method: Method, path: &str) -> GatewayResult<RequestBuilder> {
        require_key(OPENAI, &self.api_key)?;
        Ok(self.transport.request(method, path)?.bearer_auth(&self.api_key))
    }

    /// Request body for `/v1/chat/completions`. System instructions become a
    /// leading system message.
    pub(crate) fn build_body(&self, request: &Request, stream: bool) -> Value {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = request.system_text() {
            messages.push(json!({"role": Role::System.as_str(), "content": system}));
        }
        messages.extend(request.conversation().map(|m| {
            json!({
                "role": m.role().as_str(),
                "content": wire_content(m.content()),
            })
        }));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
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
                    ContentBlock::Image { source } => {
                        let url = match source {
                            ImageSource::Url { url } => url.clone(),
                            ImageSource::Base64 { media_type, data } => {
                                format!("data:{media_type};base64,{data}")
                            }
                        };
                        json!({"type": "image_url", "image_url": {"url": url}})
                    }
                })
                .collect(),
        ),
    }
}

/// Parses chat-completion chunks up to the `[DONE]` sentinel.
#[derive(Debug, Default)]
pub struct OpenAiParser {
    done: bool,
}

impl OpenAiParser {
    /// A parser at the start of a stream.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LineParser for OpenAiParser {
    fn parse_line(&mut self, line: &str) -> GatewayResult<Option<Fragment>> {
        let Some(data) = sse_data(line) else {
            return Ok(None);
        };
        if data == "[DONE]" {
            self.done = true;
            return Ok(None);
        }
        let chunk: Value = serde_json::from_str(data)
            .map_err(|e| GatewayError::stream(OPENAI, format!("undecodable chunk: {e}"), false))?;

        if let Some(error) = chunk.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown stream error");
            let resumable = error.get("type").and_then(Value::as_str) == Some("server_error");
            return Err(GatewayError::stream(OPENAI, message, resumable));
        }

        let choice = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first());
        let text = choice
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let finish = choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(Value::as_str);
        let usage = UsageStrategy::OpenAiChat.extract(&chunk);

        if text.is_empty() && finish.is_none() && usage.is_none() {
            return Ok(None);
        }
        let mut fragment = Fragment::text(text);
        if let Some(reason) = finish {
            fragment = fragment.with_finish_reason(FinishReason::from_backend(reason));
        }
        if let Some(usage) = usage {
            fragment = fragment.with_usage(usage).with_raw(chunk);
        }
        Ok(Some(fragment))
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        OPENAI
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &Request) -> GatewayResult<Response> {
        let builder = self
            .authed(Method::POST, "/v1/chat/completions")?
            .json(&self.build_body(request, false));
        let response = self.transport.send(builder, false).await?;
        let body = self.transport.read_json(response).await?;

        let choice = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .ok_or_else(|| malformed(OPENAI, "no choices"))?;
        let content = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let finish = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(str::to_string);
        let usage = UsageStrategy::OpenAiChat.resolve(&body, &request.prompt_text(), &content);
        Ok(completed_response(
            OPENAI,
            &self.model,
            content,
            usage,
            pricing_for(OPENAI, &self.model),
            finish.as_deref(),
            body,
        ))
    }

    async fn generate_stream(&self, request: &Request) -> GatewayResult<(Response, StreamHandler)> {
        let builder = self
            .authed(Method::POST, "/v1/chat/completions")?
            .json(&self.build_body(request, true));
        let response = self.transport.send(builder, true).await?;

        let source = BodySource::new(OPENAI, response, OpenAiParser::new());
        let initial = Response::empty(OPENAI, self.model.clone());
        let handler = StreamHandler::from_request(
            initial.clone(),
            Box::new(source),
            request,
            pricing_for(OPENAI, &self.model),
        );
        Ok((initial, handler))
    }

    async fn available_models(&self) -> GatewayResult<Vec<String>> {
        let builder = self.authed(Method::GET, "/v1/models")?;
        let response = self.transport.send(builder, false).await?;
        let body = self.transport.read_json(response).await?;
        model_ids(OPENAI, &body)
    }

    async fn validate_credential(&self) -> GatewayResult<()> {
        self.available_models().await.map(|_| ())
    }

    fn calculate_cost(&self, usage: &TokenUsage, model: Option<&str>) -> CostEstimate {
        pricing_for(OPENAI, model.unwrap_or(&self.model)).estimate(usage)
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

    fn provider() -> OpenAiProvider {
        let options = ResolvedOptions {
            provider: OPENAI.into(),
            model: "gpt-4o".into(),
            max_tokens: 256,
            endpoint: "https://api.openai.com".into(),
            extras: [("api_key".to_string(), json!("sk-test"))].into_iter().collect(),
        };
        OpenAiProvider::new(&options, &GatewayConfig::default())
    }

    #[test]
    fn test_body_prepends_system_message() {
        let request = Request::new(vec![
            Message::user("Describe"),
            Message::system("Answer in French."),
            Message::user(Content::Blocks(vec![ContentBlock::Image {
                source: ImageSource::Base64 {
                    media_type: "image/jpeg".into(),
                    data: "QUJD".into(),
                },
            }])),
        ]);
        let body = provider().build_body(&request, true);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "Answer in French.");
        assert_eq!(
            messages[2]["content"][0]["image_url"]["url"],
            "data:image/jpeg;base64,QUJD"
        );
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_parser_chunks_and_done() {
        let mut p = OpenAiParser::new();
        let lines = [
            r#"data: {"choices":[{"index":0,"delta":{"role":"assistant","content":""}}]}"#,
            r#"data: {"choices":[{"index":0,"delta":{"content":"Hi"}}]}"#,
            r#"data: {"choices":[{"index":0,"delta":{"content":" there"}}]}"#,
            r#"data: {"choices":[{"index":0,"delta":{},"finish_reason":"length"}]}"#,
            r#"data: {"choices":[],"usage":{"prompt_tokens":9,"completion_tokens":2,"total_tokens":11}}"#,
        ];
        let fragments: Vec<Fragment> = lines
            .iter()
            .filter_map(|l| p.parse_line(l).unwrap())
            .collect();
        assert_eq!(fragments.len(), 4);
        let text: String = fragments.iter().map(|f| f.delta.as_str()).collect();
        assert_eq!(text, "Hi there");
        assert_eq!(fragments[2].finish_reason, Some(FinishReason::Length));
        assert_eq!(fragments[3].usage, Some(TokenUsage::new(9, 2)));
        assert!(!p.is_done());
        assert!(p.parse_line("data: [DONE]").unwrap().is_none());
        assert!(p.is_done());
    }

    #[test]
    fn test_parser_error_chunk() {
        let mut p = OpenAiParser::new();
        let err = p
            .parse_line(r#"data: {"error":{"message":"boom","type":"server_error"}}"#)
            .unwrap_err();
        assert!(matches!(err, GatewayError::Stream { resumable: true, .. }));
    }
}
