use crate::capability;
use crate::config::{ResolvedOptions, MOCK};
use crate::provider::Provider;
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use switchyard_core::{
    CostEstimate, ErrorKind, FinishReason, GatewayError, GatewayResult, Pricing, Request, Response,
    TokenUsage,
};
use switchyard_stream::{Fragment, StreamHandler, VecSource};
use tracing::debug;

/// In-memory backend for tests and offline development.
///
/// Replies are synthesized from the request. Failures can be injected
/// deterministically (`with_failures`) or randomly (`with_error_rate`), and
/// every generate call is counted.
pub struct MockProvider {
    model: String,
    reply: Option<String>,
    error_rate: f64,
    error_kind: ErrorKind,
    retry_after: Option<Duration>,
    latency: Duration,
    fragment_chars: usize,
    failures: u32,
    stream_breaks: u32,
    strengths: HashMap<String, u8>,
    pricing: Pricing,
    attempts: AtomicU32,
    streams: AtomicU32,
}

impl MockProvider {
    /// A mock that always succeeds.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            reply: None,
            error_rate: 0.0,
            error_kind: ErrorKind::Server,
            retry_after: None,
            latency: Duration::ZERO,
            fragment_chars: 8,
            failures: 0,
            stream_breaks: 0,
            strengths: HashMap::new(),
            pricing: Pricing::free(),
            attempts: AtomicU32::new(0),
            streams: AtomicU32::new(0),
        }
    }

    /// Builds a mock from resolved options. Recognised extras:
    /// `reply`, `error_rate`, `error_kind`, `latency_ms`, `fragment_chars`,
    /// `stream_breaks` and `strengths` (an object of tag → 0..=4).
    pub fn from_options(options: &ResolvedOptions) -> GatewayResult<Self> {
        let mut mock = Self::new(options.model.clone());
        let extras = &options.extras;

        if let Some(reply) = extras.get("reply").and_then(Value::as_str) {
            mock.reply = Some(reply.to_string());
        }
        if let Some(v) = extras.get("error_rate") {
            let rate = v
                .as_f64()
                .filter(|r| (0.0..=1.0).contains(r))
                .ok_or_else(|| {
                    GatewayError::Config(format!("mock error_rate must be within 0..=1, got {v}"))
                })?;
            mock.error_rate = rate;
        }
        if let Some(v) = extras.get("error_kind") {
            mock.error_kind = serde_json::from_value(v.clone())
                .map_err(|e| GatewayError::Config(format!("mock error_kind {v}: {e}")))?;
        }
        if let Some(ms) = extras.get("latency_ms").and_then(Value::as_u64) {
            mock.latency = Duration::from_millis(ms);
        }
        if let Some(n) = extras.get("fragment_chars").and_then(Value::as_u64) {
            mock.fragment_chars = usize::try_from(n).unwrap_or(usize::MAX).max(1);
        }
        if let Some(n) = extras.get("stream_breaks").and_then(Value::as_u64) {
            mock.stream_breaks = u32::try_from(n).unwrap_or(u32::MAX);
        }
        if let Some(map) = extras.get("strengths").and_then(Value::as_object) {
            for (tag, score) in map {
                let score = score.as_u64().unwrap_or(0).min(4) as u8;
                mock.strengths.insert(tag.to_ascii_lowercase(), score);
            }
        }
        Ok(mock)
    }

    /// Fixed reply text.
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Probability in `0.0..=1.0` that a call fails.
    pub fn with_error_rate(mut self, rate: f64) -> Self {
        self.error_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Kind of the injected errors. Defaults to Server.
    pub fn with_error_kind(mut self, kind: ErrorKind) -> Self {
        self.error_kind = kind;
        self
    }

    /// `retry-after` attached to injected RateLimit errors.
    pub fn with_retry_after(mut self, after: Duration) -> Self {
        self.retry_after = Some(after);
        self
    }

    /// Delay before each reply, and between streamed fragments.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Characters per streamed fragment.
    pub fn with_fragment_chars(mut self, chars: usize) -> Self {
        self.fragment_chars = chars.max(1);
        self
    }

    /// The first `n` calls fail, later ones succeed.
    pub fn with_failures(mut self, n: u32) -> Self {
        self.failures = n;
        self
    }

    /// The first `n` streams that start break after their first fragment
    /// with a resumable stream error.
    pub fn with_stream_breaks(mut self, n: u32) -> Self {
        self.stream_breaks = n;
        self
    }

    /// Overrides the strength reported for `capability`.
    pub fn with_strength(mut self, capability: &str, strength: u8) -> Self {
        self.strengths
            .insert(capability.to_ascii_lowercase(), strength.min(4));
        self
    }

    /// Rates used for cost. Free by default.
    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    /// Generate calls made so far, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn begin_attempt(&self) -> GatewayResult<()> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        let fail = n < self.failures
            || (self.error_rate > 0.0 && rand::thread_rng().gen::<f64>() < self.error_rate);
        if fail {
            debug!(model = %self.model, attempt = n + 1, kind = %self.error_kind, "injecting failure");
            return Err(self.injected_error());
        }
        Ok(())
    }

    fn injected_error(&self) -> GatewayError {
        let message = "injected failure";
        match self.error_kind {
            ErrorKind::Authentication => GatewayError::authentication(MOCK, message),
            ErrorKind::RateLimit => GatewayError::RateLimit {
                provider: MOCK.to_string(),
                status: Some(429),
                message: message.to_string(),
                retry_after: self.retry_after,
            },
            ErrorKind::Server => GatewayError::server(MOCK, message),
            ErrorKind::Timeout => GatewayError::timeout(MOCK, message),
            ErrorKind::Validation => GatewayError::validation(MOCK, message),
            ErrorKind::Stream => GatewayError::stream(MOCK, message, true),
            ErrorKind::Config => GatewayError::Config(format!("{MOCK}: {message}")),
            ErrorKind::QuotaExceeded => GatewayError::QuotaExceeded {
                provider: MOCK.to_string(),
                status: Some(402),
                message: message.to_string(),
            },
            ErrorKind::CircuitOpen => GatewayError::CircuitOpen {
                provider: MOCK.to_string(),
            },
            ErrorKind::Provider => GatewayError::Provider {
                provider: MOCK.to_string(),
                status: None,
                message: message.to_string(),
            },
            ErrorKind::Serialization => GatewayError::Serialization(message.to_string()),
        }
    }

    fn reply_for(&self, request: &Request) -> String {
        if let Some(reply) = &self.reply {
            return reply.clone();
        }
        match request.last_user_text() {
            Some(text) if !text.trim().is_empty() => {
                format!("Mock reply from {}: {}", self.model, text.trim())
            }
            _ => format!("Mock reply from {}", self.model),
        }
    }

    fn chunks(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        chars
            .chunks(self.fragment_chars)
            .map(|c| c.iter().collect())
            .collect()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        MOCK
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &Request) -> GatewayResult<Response> {
        self.begin_attempt()?;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let content = self.reply_for(request);
        let usage = TokenUsage::estimate(&request.prompt_text(), &content);
        let mut response = Response::empty(MOCK, self.model.clone());
        response.cost = self.pricing.estimate(&usage);
        response.usage = usage;
        response.raw = Some(serde_json::json!({ "mock": true, "model": self.model }));
        response.content = content;
        response.finish_reason = Some(FinishReason::Stop);
        Ok(response)
    }

    async fn generate_stream(&self, request: &Request) -> GatewayResult<(Response, StreamHandler)> {
        self.begin_attempt()?;

        let content = self.reply_for(request);
        let usage = TokenUsage::estimate(&request.prompt_text(), &content);
        let mut fragments: Vec<GatewayResult<Fragment>> =
            self.chunks(&content).into_iter().map(|c| Ok(Fragment::text(c))).collect();
        if self.streams.fetch_add(1, Ordering::SeqCst) < self.stream_breaks {
            fragments.truncate(1);
            fragments.push(Err(GatewayError::stream(MOCK, "connection reset mid-stream", true)));
        } else {
            fragments.push(Ok(Fragment::text("")
                .with_usage(usage)
                .with_finish_reason(FinishReason::Stop)));
        }

        let source = VecSource::new(fragments).with_delay(self.latency);
        let initial = Response::empty(MOCK, self.model.clone());
        let handler = StreamHandler::from_request(initial.clone(), Box::new(source), request, self.pricing);
        Ok((initial, handler))
    }

    async fn available_models(&self) -> GatewayResult<Vec<String>> {
        Ok(vec![self.model.clone()])
    }

    async fn validate_credential(&self) -> GatewayResult<()> {
        Ok(())
    }

    fn calculate_cost(&self, usage: &TokenUsage, _model: Option<&str>) -> CostEstimate {
        self.pricing.estimate(usage)
    }

    fn capability_strength(&self, capability: &str) -> u8 {
        let tag = capability.trim().to_ascii_lowercase();
        self.strengths
            .get(&tag)
            .copied()
            .unwrap_or_else(|| capability::strength(&self.model, &tag))
    }
}
