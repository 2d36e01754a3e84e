//! Restarting a stream that broke with a resumable error.

use super::circuit::CircuitBreaker;
use super::retry::RetryConfig;
use crate::provider::Provider;
use async_trait::async_trait;
use std::sync::Arc;
use switchyard_core::{GatewayError, GatewayResult, Request};
use switchyard_stream::{Fragment, FragmentSource, HandlerSource, StreamHandler};
use tracing::{info, warn};

/// Reads a backend stream and, when it fails with a resumable error, opens
/// a new one for the same request.
///
/// The restarted reply is regenerated from the start, so the characters
/// already passed downstream are skipped. At most `max_retries` restarts are
/// made over the life of the stream.
pub(crate) struct ResumingSource {
    inner: Arc<dyn Provider>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    request: Request,
    current: HandlerSource,
    restarts: u32,
    delivered: usize,
    skip: usize,
}

impl ResumingSource {
    pub(crate) fn new(
        inner: Arc<dyn Provider>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryConfig,
        request: Request,
        first: StreamHandler,
    ) -> Self {
        Self {
            inner,
            breaker,
            retry,
            request,
            current: first.into_source(),
            restarts: 0,
            delivered: 0,
            skip: 0,
        }
    }

    fn can_restart(&self, err: &GatewayError) -> bool {
        matches!(err, GatewayError::Stream { resumable: true, .. })
            && self.retry.should_retry(err)
            && self.restarts < self.retry.max_retries
    }

    /// Drops the part of `delta` the reader has already seen.
    fn trim_replayed(&mut self, fragment: &mut Fragment) {
        if self.skip == 0 {
            return;
        }
        let chars = fragment.delta.chars().count();
        if chars <= self.skip {
            self.skip -= chars;
            fragment.delta.clear();
        } else {
            fragment.delta = fragment.delta.chars().skip(self.skip).collect();
            self.skip = 0;
        }
    }

    /// Opens a replacement stream after `cause`, retrying setup failures
    /// within the remaining budget.
    async fn restart(&mut self, mut cause: GatewayError) -> GatewayResult<()> {
        let provider = self.inner.name().to_string();
        self.breaker.record_failure();
        loop {
            let delay = self.retry.delay_for(self.restarts, &cause);
            self.restarts += 1;
            info!(
                provider = %provider,
                restart = self.restarts,
                delivered_chars = self.delivered,
                delay_ms = delay.as_millis() as u64,
                error = %cause,
                "stream broke, restarting"
            );
            tokio::time::sleep(delay).await;

            let Some(permit) = self.breaker.acquire() else {
                warn!(provider = %provider, "circuit open, stream not restarted");
                return Err(GatewayError::CircuitOpen { provider });
            };
            match self.inner.generate_stream(&self.request).await {
                Ok((_, handler)) => {
                    permit.success();
                    self.current = handler.into_source();
                    self.skip = self.delivered;
                    return Ok(());
                }
                Err(e) => {
                    if e.kind().counts_as_backend_failure() {
                        permit.failure();
                    } else {
                        permit.neutral();
                    }
                    if !self.retry.should_retry(&e) || self.restarts >= self.retry.max_retries {
                        warn!(provider = %provider, error = %e, "stream restart failed");
                        return Err(e);
                    }
                    cause = e;
                }
            }
        }
    }
}

#[async_trait]
impl FragmentSource for ResumingSource {
    async fn next_fragment(&mut self) -> Option<GatewayResult<Fragment>> {
        loop {
            match self.current.next_fragment().await {
                Some(Ok(mut fragment)) => {
                    self.trim_replayed(&mut fragment);
                    self.delivered += fragment.delta.chars().count();
                    return Some(Ok(fragment));
                }
                Some(Err(e)) if self.can_restart(&e) => {
                    if let Err(fatal) = self.restart(e).await {
                        return Some(Err(fatal));
                    }
                }
                other => return other,
            }
        }
    }

    async fn close(&mut self) -> GatewayResult<()> {
        self.current.close().await
    }
}
