use super::{api_key, completed_response, http_settings, malformed};
use crate::capability;
use crate::config::{GatewayConfig, ResolvedOptions, OLLAMA};
use crate::http::HttpTransport;
use crate::pricing::pricing_for;
use crate::provider::Provider;
use crate::sse::{BodySource, LineParser};
use crate::usage::UsageStrategy;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde_json::{json, Value};
use switchyard_core::{
    Content, ContentBlock, CostEstimate, FinishReason, GatewayError, GatewayResult, ImageSource,
    Request, Response, Role, TokenUsage,
};
use switchyard_stream::{Fragment, StreamHandler};

/// Local Ollama server backend.
///
/// Needs no credential; a configured key is sent as a bearer token for
/// servers behind an authenticating proxy. Usage is free.
pub struct OllamaProvider {
    model: String,
    max_tokens: u32,
    api_key: String,
    transport: HttpTransport,
}

impl OllamaProvider {
    /// Builds the adapter. No network traffic happens until the first call.
    pub fn new(options: &ResolvedOptions, config: &GatewayConfig) -> Self {
        Self {
            model: options.model.clone(),
            max_tokens: options.max_tokens,
            api_key: api_key(options, config),
            transport: HttpTransport::new(OLLAMA, http_settings(options, config)),
        }
    }

    fn request(&self, method: Method, path: &str) -> GatewayResult<RequestBuilder> {
        let builder = self.transport.request(method, path)?;
        if self.api_key.trim().is_empty() {
            Ok(builder)
        } else {
            Ok(builder.bearer_auth(&self.api_key))
        }
    }

    /// Request body for `/api/chat`. Only inline base64 images are accepted.
    pub(crate) fn build_body(&self, request: &Request, stream: bool) -> GatewayResult<Value> {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = request.system_text() {
            messages.push(json!({"role": Role::System.as_str(), "content": system}));
        }
        for m in request.conversation() {
            let mut message = json!({
                "role": m.role().as_str(),
                "content": m.text(),
            });
            let images = images_of(m.content())?;
            if !images.is_empty() {
                message["images"] = json!(images);
            }
            messages.push(message);
        }

        let mut options = json!({"num_predict": request.max_tokens.unwrap_or(self.max_tokens)});
        if let Some(t) = request.temperature {
            options["temperature"] = json!(t);
        }
        Ok(json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
            "options": options,
        }))
    }
}

fn images_of(content: &Content) -> GatewayResult<Vec<String>> {
    let Content::Blocks(blocks) = content else {
        return Ok(Vec::new());
    };
    let mut images = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { .. } => {}
            ContentBlock::Image {
                source: ImageSource::Base64 { data, .. },
            } => images.push(data.clone()),
            ContentBlock::Image {
                source: ImageSource::Url { url },
            } => {
                return Err(GatewayError::validation(
                    OLLAMA,
                    format!("image URLs are not supported, send base64 data instead: {url}"),
                ))
            }
        }
    }
    Ok(images)
}

/// Parses the newline-delimited JSON chat stream.
#[derive(Debug, Default)]
pub struct OllamaParser {
    done: bool,
}

impl OllamaParser {
    /// A parser at the start of a stream.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LineParser for OllamaParser {
    fn parse_line(&mut self, line: &str) -> GatewayResult<Option<Fragment>> {
        let chunk: Value = serde_json::from_str(line)
            .map_err(|e| GatewayError::stream(OLLAMA, format!("undecodable line: {e}"), false))?;
        if let Some(error) = chunk.get("error").and_then(Value::as_str) {
            return Err(GatewayError::stream(OLLAMA, error, false));
        }

        let text = chunk
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !chunk.get("done").and_then(Value::as_bool).unwrap_or(false) {
            return Ok((!text.is_empty()).then(|| Fragment::text(text)));
        }

        self.done = true;
        let reason = chunk
            .get("done_reason")
            .and_then(Value::as_str)
            .map_or(FinishReason::Stop, FinishReason::from_backend);
        let mut fragment = Fragment::text(text).with_finish_reason(reason);
        if let Some(usage) = UsageStrategy::OllamaCounters.extract(&chunk) {
            fragment = fragment.with_usage(usage);
        }
        Ok(Some(fragment.with_raw(chunk)))
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        OLLAMA
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &Request) -> GatewayResult<Response> {
        let body = self.build_body(request, false)?;
        let builder = self.request(Method::POST, "/api/chat")?.json(&body);
        let response = self.transport.send(builder, false).await?;
        let body = self.transport.read_json(response).await?;

        let content = body
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| malformed(OLLAMA, "no message content"))?
            .to_string();
        let finish = body
            .get("done_reason")
            .and_then(Value::as_str)
            .map(str::to_string);
        let usage = UsageStrategy::OllamaCounters.resolve(&body, &request.prompt_text(), &content);
        Ok(completed_response(
            OLLAMA,
            &self.model,
            content,
            usage,
            pricing_for(OLLAMA, &self.model),
            finish.as_deref(),
            body,
        ))
    }

    async fn generate_stream(&self, request: &Request) -> GatewayResult<(Response, StreamHandler)> {
        let body = self.build_body(request, true)?;
        let builder = self.request(Method::POST, "/api/chat")?.json(&body);
        let response = self.transport.send(builder, true).await?;

        let source = BodySource::new(OLLAMA, response, OllamaParser::new());
        let initial = Response::empty(OLLAMA, self.model.clone());
        let handler = StreamHandler::from_request(
            initial.clone(),
            Box::new(source),
            request,
            pricing_for(OLLAMA, &self.model),
        );
        Ok((initial, handler))
    }

    async fn available_models(&self) -> GatewayResult<Vec<String>> {
        let builder = self.request(Method::GET, "/api/tags")?;
        let response = self.transport.send(builder, false).await?;
        let body = self.transport.read_json(response).await?;
        let models = body
            .get("models")
            .and_then(Value::as_array)
            .ok_or_else(|| malformed(OLLAMA, "tag list has no models array"))?;
        Ok(models
            .iter()
            .filter_map(|m| m.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    async fn validate_credential(&self) -> GatewayResult<()> {
        self.available_models().await.map(|_| ())
    }

    fn calculate_cost(&self, usage: &TokenUsage, model: Option<&str>) -> CostEstimate {
        pricing_for(OLLAMA, model.unwrap_or(&self.model)).estimate(usage)
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

    fn provider() -> OllamaProvider {
        let options = ResolvedOptions {
            provider: OLLAMA.into(),
            model: "llama3.1".into(),
            max_tokens: 128,
            endpoint: "http://localhost:11434".into(),
            extras: Default::default(),
        };
        OllamaProvider::new(&options, &GatewayConfig::default())
    }

    #[test]
    fn test_body_shape() {
        let request = Request::new(vec![Message::user(Content::Blocks(vec![
            ContentBlock::Text {
                text: "What is in this picture?".into(),
            },
            ContentBlock::Image {
                source: ImageSource::Base64 {
                    media_type: "image/png".into(),
                    data: "iVBOR".into(),
                },
            },
        ]))])
        .with_system_prompt("Be terse.")
        .with_temperature(0.5);
        let body = provider().build_body(&request, false).unwrap();
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["num_predict"], 128);
        assert_eq!(body["options"]["temperature"], 0.5);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "What is in this picture?");
        assert_eq!(body["messages"][1]["images"][0], "iVBOR");
    }

    #[test]
    fn test_url_images_are_rejected() {
        let request = Request::new(vec![Message::user(Content::Blocks(vec![
            ContentBlock::Image {
                source: ImageSource::Url {
                    url: "https://example.com/cat.png".into(),
                },
            },
        ]))]);
        let err = provider().build_body(&request, true).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
    }

    #[test]
    fn test_parser_ndjson() {
        let mut p = OllamaParser::new();
        let a = p
            .parse_line(r#"{"model":"llama3.1","message":{"role":"assistant","content":"Hel"},"done":false}"#)
            .unwrap()
            .unwrap();
        assert_eq!(a.delta, "Hel");
        let end = p
            .parse_line(r#"{"model":"llama3.1","message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","prompt_eval_count":26,"eval_count":3}"#)
            .unwrap()
            .unwrap();
        assert_eq!(end.usage, Some(TokenUsage::new(26, 3)));
        assert_eq!(end.finish_reason, Some(FinishReason::Stop));
        assert!(p.is_done());
    }

    #[test]
    fn test_parser_error_line() {
        let mut p = OllamaParser::new();
        let err = p.parse_line(r#"{"error":"model 'x' not found"}"#).unwrap_err();
        assert_eq!(err.kind(), switchyard_core::ErrorKind::Stream);
    }

    #[test]
    fn test_local_usage_is_free() {
        let cost = provider().calculate_cost(&TokenUsage::new(1_000_000, 1_000_000), None);
        assert_eq!(cost.total_cost, 0.0);
    }
}
