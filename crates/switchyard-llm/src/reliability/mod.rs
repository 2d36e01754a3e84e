//! Retry and circuit-breaker policies wrapped around any [`Provider`].

/// Circuit breaker state machine.
pub mod circuit;
mod resume;
/// Backoff computation and retryable-kind policy.
pub mod retry;

pub use circuit::{BreakerPermit, CircuitBreaker, CircuitConfig, CircuitState};
pub use retry::RetryConfig;

use crate::provider::Provider;
use async_trait::async_trait;
use resume::ResumingSource;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{
    CostEstimate, GatewayError, GatewayResult, Pricing, Request, Response, TokenUsage,
};
use switchyard_stream::{BufferConfig, StreamHandler, StreamSettings};
use tracing::{info, warn};

/// Type alias for the injectable sleep function used in tests.
#[cfg(test)]
type SleepFn = Box<
    dyn Fn(Duration) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

/// A [`Provider`] that guards another with retries and a circuit breaker.
///
/// The breaker decides whether a call is made at all; the inner provider
/// performs and classifies it; the retry policy decides whether a failure
/// earns another attempt. Only backend-health failures (server, timeout,
/// rate limit, stream, generic provider errors) count toward the breaker.
///
/// For streams, retries cover establishing the stream. After that, a
/// failure flagged resumable opens a new stream for the same request and
/// the reader only sees the text it has not seen yet; any other mid-stream
/// failure surfaces through the [`StreamHandler`].
pub struct ReliableProvider {
    inner: Arc<dyn Provider>,
    retry: RetryConfig,
    breaker: Arc<CircuitBreaker>,
    /// Injectable sleep function for testing (allows skipping real delays).
    #[cfg(test)]
    sleep_fn: Option<SleepFn>,
}

impl ReliableProvider {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn Provider>, retry: RetryConfig, circuit: CircuitConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(inner.name().to_string(), circuit));
        Self {
            inner,
            retry,
            breaker,
            #[cfg(test)]
            sleep_fn: None,
        }
    }

    /// The wrapped provider.
    pub fn inner(&self) -> &Arc<dyn Provider> {
        &self.inner
    }

    /// The breaker shared by every caller of this wrapper.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The retry policy in force.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    async fn do_sleep(&self, delay: Duration) {
        #[cfg(test)]
        if let Some(ref f) = self.sleep_fn {
            f(delay).await;
            return;
        }
        tokio::time::sleep(delay).await;
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, mut attempt_fn: F) -> GatewayResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = GatewayResult<T>> + Send,
        T: Send,
    {
        let provider = self.inner.name();
        let mut attempt: u32 = 0;
        loop {
            let Some(permit) = self.breaker.acquire() else {
                warn!(provider, operation, "circuit open, rejecting call");
                return Err(GatewayError::CircuitOpen {
                    provider: provider.to_string(),
                });
            };

            let err = match attempt_fn().await {
                Ok(value) => {
                    permit.success();
                    if attempt > 0 {
                        info!(provider, operation, attempt, "call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if err.kind().counts_as_backend_failure() {
                permit.failure();
            } else {
                permit.neutral();
            }

            if !self.retry.should_retry(&err) {
                warn!(provider, operation, attempt, error = %err, "non-retryable error");
                return Err(err);
            }
            if attempt >= self.retry.max_retries {
                warn!(provider, operation, attempt, error = %err, "retries exhausted");
                return Err(err);
            }

            let delay = self.retry.delay_for(attempt, &err);
            info!(
                provider,
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retryable error, backing off"
            );
            self.do_sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl Provider for ReliableProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn generate(&self, request: &Request) -> GatewayResult<Response> {
        self.call("generate", || self.inner.generate(request)).await
    }

    async fn generate_stream(&self, request: &Request) -> GatewayResult<(Response, StreamHandler)> {
        if self.retry.max_retries == 0 {
            return self
                .call("generate_stream", || self.inner.generate_stream(request))
                .await;
        }

        // delivery shaping happens once, on the stream handed to the caller
        let mut backend_request = request.clone();
        backend_request.metadata.stream.max_tokens_per_second = None;
        backend_request.metadata.stream.batch = None;

        let (initial, first) = self
            .call("generate_stream", || self.inner.generate_stream(&backend_request))
            .await?;
        let source = ResumingSource::new(
            self.inner.clone(),
            self.breaker.clone(),
            self.retry.clone(),
            backend_request,
            first,
        );
        // the idle timeout is enforced on each backend stream, not across restarts
        let settings = StreamSettings {
            idle_timeout: None,
            ..StreamSettings::for_request(request, pricing_of(self.inner.as_ref()))
        };
        let buffer = BufferConfig::from_options(&request.metadata.stream).build();
        let handler = StreamHandler::spawn(initial.clone(), Box::new(source), buffer, settings);
        Ok((initial, handler))
    }

    async fn available_models(&self) -> GatewayResult<Vec<String>> {
        self.call("available_models", || self.inner.available_models())
            .await
    }

    async fn validate_credential(&self) -> GatewayResult<()> {
        self.inner.validate_credential().await
    }

    fn calculate_cost(&self, usage: &TokenUsage, model: Option<&str>) -> CostEstimate {
        self.inner.calculate_cost(usage, model)
    }

    fn capability_strength(&self, capability: &str) -> u8 {
        self.inner.capability_strength(capability)
    }
}

/// Per-million rates of `provider`, read back from its cost function.
fn pricing_of(provider: &dyn Provider) -> Pricing {
    let per_million = provider.calculate_cost(&TokenUsage::new(1_000_000, 1_000_000), None);
    Pricing::new(per_million.input_cost, per_million.output_cost)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backends::mock::MockProvider;
    use parking_lot::Mutex;
    use switchyard_core::ErrorKind;

    fn recording_sleep(log: Arc<Mutex<Vec<Duration>>>) -> SleepFn {
        Box::new(
            move |d: Duration| -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> {
                log.lock().push(d);
                Box::pin(async {})
            },
        )
    }

    fn policy(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.0,
            ..RetryConfig::default()
        }
    }

    fn wrap(mock: Arc<MockProvider>, retry: RetryConfig, log: Arc<Mutex<Vec<Duration>>>) -> ReliableProvider {
        let mut p = ReliableProvider::new(mock, retry, CircuitConfig::lenient());
        p.sleep_fn = Some(recording_sleep(log));
        p
    }

    // ── Test 1: backoff delays follow the exponential schedule ───────────

    #[tokio::test]
    async fn backoff_schedule_is_exponential() {
        let mock = Arc::new(MockProvider::new("mock-model").with_failures(3));
        let log = Arc::new(Mutex::new(Vec::new()));
        let p = wrap(mock.clone(), policy(3), log.clone());

        let resp = p.generate(&Request::from_prompt("hi")).await.unwrap();
        assert!(!resp.content.is_empty());
        assert_eq!(mock.attempts(), 4);
        assert_eq!(
            *log.lock(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    // ── Test 2: rate-limit retry-after replaces the computed delay ───────

    #[tokio::test]
    async fn rate_limit_retry_after_is_used() {
        let mock = Arc::new(
            MockProvider::new("mock-model")
                .with_failures(1)
                .with_error_kind(ErrorKind::RateLimit)
                .with_retry_after(Duration::from_secs(30)),
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        let p = wrap(mock.clone(), policy(2), log.clone());

        p.generate(&Request::from_prompt("hi")).await.unwrap();
        // clamped to max_delay_ms
        assert_eq!(*log.lock(), vec![Duration::from_millis(1_000)]);
    }

    // ── Test 3: validation failures do not trip the breaker ──────────────

    #[tokio::test]
    async fn validation_errors_are_neutral_for_breaker() {
        let mock = Arc::new(
            MockProvider::new("mock-model")
                .with_error_rate(1.0)
                .with_error_kind(ErrorKind::Validation),
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut p = ReliableProvider::new(
            mock.clone(),
            policy(3),
            CircuitConfig {
                failure_threshold: 1,
                ..CircuitConfig::default()
            },
        );
        p.sleep_fn = Some(recording_sleep(log.clone()));

        for _ in 0..3 {
            let err = p.generate(&Request::from_prompt("hi")).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        assert_eq!(mock.attempts(), 3);
        assert_eq!(p.breaker().state(), CircuitState::Closed);
        assert!(log.lock().is_empty());
    }

    // ── Test 4: stream setup is retried ──────────────────────────────────

    #[tokio::test]
    async fn stream_setup_is_retried() {
        let mock = Arc::new(MockProvider::new("mock-model").with_failures(1));
        let log = Arc::new(Mutex::new(Vec::new()));
        let p = wrap(mock.clone(), policy(2), log);

        let (initial, mut handler) = p.generate_stream(&Request::from_prompt("hi")).await.unwrap();
        assert!(initial.content.is_empty());
        let resp = handler.collect().await.unwrap();
        assert!(!resp.content.is_empty());
        assert_eq!(mock.attempts(), 2);
    }

    // ── Test 5: a resumable break mid-stream restarts without repeats ────

    fn quick(max_retries: u32) -> RetryConfig {
        RetryConfig {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            ..policy(max_retries)
        }
    }

    #[tokio::test]
    async fn resumable_mid_stream_break_is_restarted() {
        let mock = Arc::new(
            MockProvider::new("mock-model")
                .with_reply("abcdefghij")
                .with_fragment_chars(3)
                .with_stream_breaks(1),
        );
        let p = ReliableProvider::new(mock.clone(), quick(2), CircuitConfig::lenient());

        let (_, mut handler) = p.generate_stream(&Request::from_prompt("hi")).await.unwrap();
        let mut deltas = Vec::new();
        let resp = handler
            .process_stream(|delta, _| deltas.push(delta.to_string()))
            .await
            .unwrap();
        assert_eq!(deltas.concat(), "abcdefghij");
        assert_eq!(resp.content, "abcdefghij");
        assert_eq!(resp.finish_reason, Some(switchyard_core::FinishReason::Stop));
        assert_eq!(mock.attempts(), 2);
    }

    #[tokio::test]
    async fn mid_stream_breaks_beyond_budget_surface() {
        let mock = Arc::new(
            MockProvider::new("mock-model")
                .with_reply("abcdefghij")
                .with_fragment_chars(3)
                .with_stream_breaks(10),
        );
        let p = ReliableProvider::new(mock.clone(), quick(1), CircuitConfig::lenient());

        let (_, mut handler) = p.generate_stream(&Request::from_prompt("hi")).await.unwrap();
        let mut seen = String::new();
        let err = handler
            .process_stream(|delta, _| seen.push_str(delta))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Stream);
        assert_eq!(seen, "abc");
        assert_eq!(mock.attempts(), 2);
    }

    // ── Test 6: an abandoned half-open trial does not jam the breaker ────

    #[tokio::test]
    async fn abandoned_trial_call_releases_breaker() {
        let mock = Arc::new(
            MockProvider::new("mock-model")
                .with_failures(1)
                .with_latency(Duration::from_millis(100)),
        );
        let p = ReliableProvider::new(
            mock.clone(),
            RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            },
            CircuitConfig {
                failure_threshold: 1,
                recovery_timeout_ms: 20,
                half_open_max: 1,
                reset_timeout_ms: 0,
            },
        );
        let req = Request::from_prompt("hi");

        assert!(p.generate(&req).await.is_err());
        assert_eq!(p.breaker().state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(40)).await;

        let abandoned = tokio::time::timeout(Duration::from_millis(5), p.generate(&req)).await;
        assert!(abandoned.is_err());
        assert_eq!(p.breaker().state(), CircuitState::HalfOpen);

        let resp = p.generate(&req).await.unwrap();
        assert!(!resp.content.is_empty());
        assert_eq!(p.breaker().state(), CircuitState::Closed);
        assert_eq!(mock.attempts(), 3);
    }
}
