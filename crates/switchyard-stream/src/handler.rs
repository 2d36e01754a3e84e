//! The push-model stream handler.
//!
//! [`StreamHandler::spawn`] starts a worker task that pulls fragments from a
//! [`FragmentSource`] and writes their text into a [`FragmentBuffer`] in
//! emission order. The caller reads deltas back out of the buffer, either by
//! pulling ([`StreamHandler::next_delta`], [`StreamHandler::into_stream`]) or
//! with a callback ([`StreamHandler::process_stream`]). The worker finalizes
//! usage and cost once, when the stream reaches a terminal state.

use crate::buffer::{FragmentBuffer, DEFAULT_POLL_INTERVAL};
use crate::config::BufferConfig;
use crate::control::{StreamControl, StreamState};
use crate::source::{Fragment, FragmentSource};
use async_trait::async_trait;
use futures_util::Stream;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{
    FinishReason, GatewayError, GatewayResult, Pricing, Request, Response, TokenUsage,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Worker parameters that do not come from the buffer.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Fail with a timeout if the source yields nothing for this long.
    pub idle_timeout: Option<Duration>,
    /// Rates used to price the final usage.
    pub pricing: Pricing,
    /// Prompt text, used to estimate input tokens when the backend reports
    /// no usage.
    pub prompt_text: String,
    /// How long a reader waits on the buffer before re-checking state.
    pub poll_interval: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            pricing: Pricing::free(),
            prompt_text: String::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl StreamSettings {
    /// Settings for `request`: its prompt text and idle timeout.
    pub fn for_request(request: &Request, pricing: Pricing) -> Self {
        Self {
            idle_timeout: request
                .metadata
                .stream
                .idle_timeout_ms
                .map(Duration::from_millis),
            pricing,
            prompt_text: request.prompt_text(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Cloneable pause/resume/cancel handle for a running stream.
#[derive(Clone)]
pub struct StreamController {
    control: Arc<StreamControl>,
    buffer: Arc<dyn FragmentBuffer>,
}

impl StreamController {
    /// Current state.
    pub fn state(&self) -> StreamState {
        self.control.state()
    }

    /// Suspends delivery. The worker keeps consuming until the buffer is
    /// full. Returns `false` unless the stream was Active.
    pub fn pause(&self) -> bool {
        let ok = self.control.pause();
        if ok {
            self.buffer.pause();
        }
        ok
    }

    /// Resumes delivery. Returns `false` unless the stream was Paused.
    pub fn resume(&self) -> bool {
        let ok = self.control.resume();
        if ok {
            self.buffer.resume();
        }
        ok
    }

    /// Stops the stream, discarding undelivered text. Returns `false` if the
    /// stream was not Active or Paused, including on a second call.
    pub fn cancel(&self) -> bool {
        let ok = self.control.cancel();
        if ok {
            self.buffer.abort();
        }
        ok
    }
}

impl std::fmt::Debug for StreamController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamController")
            .field("state", &self.state())
            .finish()
    }
}

/// A streaming reply in progress.
///
/// Dropping a handler that has not reached a terminal state cancels it,
/// which closes the backend connection.
pub struct StreamHandler {
    initial: Response,
    controller: StreamController,
    worker: Option<JoinHandle<GatewayResult<Response>>>,
    delivered: String,
    poll_interval: Duration,
}

impl StreamHandler {
    /// Starts the worker for `source` on the current tokio runtime.
    pub fn spawn(
        initial: Response,
        source: Box<dyn FragmentSource>,
        buffer: Arc<dyn FragmentBuffer>,
        settings: StreamSettings,
    ) -> Self {
        let control = Arc::new(StreamControl::new());
        // Active before the caller sees the handler, so pause() works at once.
        control.start();
        let poll_interval = settings.poll_interval;
        let worker = tokio::spawn(run_worker(
            initial.clone(),
            source,
            control.clone(),
            buffer.clone(),
            settings,
        ));
        Self {
            initial,
            controller: StreamController { control, buffer },
            worker: Some(worker),
            delivered: String::new(),
            poll_interval,
        }
    }

    /// Starts a stream for `request`, with the buffer its stream options ask
    /// for.
    pub fn from_request(
        initial: Response,
        source: Box<dyn FragmentSource>,
        request: &Request,
        pricing: Pricing,
    ) -> Self {
        let buffer = BufferConfig::from_options(&request.metadata.stream).build();
        Self::spawn(
            initial,
            source,
            buffer,
            StreamSettings::for_request(request, pricing),
        )
    }

    /// The empty response handed out when the stream started.
    pub fn initial_response(&self) -> &Response {
        &self.initial
    }

    /// Text delivered to this handler's reader so far.
    pub fn delivered(&self) -> &str {
        &self.delivered
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.controller.state()
    }

    /// A handle for controlling the stream from another task.
    pub fn controller(&self) -> StreamController {
        self.controller.clone()
    }

    /// See [`StreamController::pause`].
    pub fn pause(&self) -> bool {
        self.controller.pause()
    }

    /// See [`StreamController::resume`].
    pub fn resume(&self) -> bool {
        self.controller.resume()
    }

    /// See [`StreamController::cancel`].
    pub fn cancel(&self) -> bool {
        self.controller.cancel()
    }

    /// Traffic counters of the underlying buffer.
    pub fn buffer_metrics(&self) -> crate::buffer::BufferMetrics {
        self.controller.buffer.metrics()
    }

    /// Waits for the next delivered delta. Returns `None` once the stream
    /// has ended and everything deliverable has been read. While paused this
    /// waits until the stream is resumed or cancelled.
    pub async fn next_delta(&mut self) -> Option<String> {
        let buffer = self.controller.buffer.clone();
        loop {
            if let Some(delta) = buffer.get(self.poll_interval).await {
                self.delivered.push_str(&delta);
                return Some(delta);
            }
            if buffer.is_drained() {
                return None;
            }
            let worker_gone = self.worker.as_ref().map_or(true, JoinHandle::is_finished);
            if worker_gone && buffer.queue().is_empty() {
                return None;
            }
        }
    }

    /// Drains the stream on the caller's task, calling `callback` with each
    /// delta and the response accumulated so far, then returns the final
    /// response.
    pub async fn process_stream<F>(&mut self, mut callback: F) -> GatewayResult<Response>
    where
        F: FnMut(&str, &Response),
    {
        let mut so_far = self.initial.clone();
        while let Some(delta) = self.next_delta().await {
            so_far.content.push_str(&delta);
            callback(&delta, &so_far);
        }
        self.finish().await
    }

    /// Drains the stream without a callback.
    pub async fn collect(&mut self) -> GatewayResult<Response> {
        self.process_stream(|_, _| {}).await
    }

    /// Runs the stream to its end without a callback and returns the final
    /// response. A paused stream is resumed first, and remaining deltas are
    /// drained so the worker never waits on a full buffer. On cancellation
    /// only what this handler delivered counts.
    pub async fn join(mut self) -> GatewayResult<Response> {
        if self.state() == StreamState::Paused {
            self.resume();
        }
        while self.next_delta().await.is_some() {}
        self.finish().await
    }

    /// Turns this handler into a [`FragmentSource`]: its deltas, then one
    /// closing fragment with the final usage and finish reason.
    pub fn into_source(self) -> HandlerSource {
        HandlerSource {
            handler: Some(self),
        }
    }

    /// The deltas as a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = String> + Send {
        async_stream::stream! {
            let mut handler = self;
            while let Some(delta) = handler.next_delta().await {
                yield delta;
            }
        }
    }

    async fn finish(&mut self) -> GatewayResult<Response> {
        let Some(worker) = self.worker.take() else {
            return Err(GatewayError::stream(
                self.initial.provider.clone(),
                "stream already finished",
                false,
            ));
        };
        let mut response = match worker.await {
            Ok(result) => result?,
            Err(e) => {
                return Err(GatewayError::stream(
                    self.initial.provider.clone(),
                    format!("stream worker failed: {e}"),
                    false,
                ))
            }
        };
        if self.state() == StreamState::Cancelled {
            response.content = self.delivered.clone();
        }
        Ok(response)
    }
}

impl Drop for StreamHandler {
    fn drop(&mut self) {
        if !self.controller.control.is_terminal() && self.controller.cancel() {
            debug!(provider = %self.initial.provider, "stream dropped before completion, cancelled");
        }
    }
}

impl std::fmt::Debug for StreamHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandler")
            .field("id", &self.initial.id)
            .field("provider", &self.initial.provider)
            .field("model", &self.initial.model)
            .field("state", &self.state())
            .finish()
    }
}

/// A running [`StreamHandler`] read as a [`FragmentSource`], so a stream can
/// feed another one.
pub struct HandlerSource {
    handler: Option<StreamHandler>,
}

#[async_trait]
impl FragmentSource for HandlerSource {
    async fn next_fragment(&mut self) -> Option<GatewayResult<Fragment>> {
        let handler = self.handler.as_mut()?;
        if let Some(delta) = handler.next_delta().await {
            return Some(Ok(Fragment::text(delta)));
        }
        let mut handler = self.handler.take()?;
        let result = handler.finish().await.map(|resp| {
            let mut last = Fragment::default().with_usage(resp.usage);
            if let Some(reason) = resp.finish_reason {
                last = last.with_finish_reason(reason);
            }
            if let Some(raw) = resp.raw {
                last = last.with_raw(raw);
            }
            last
        });
        Some(result)
    }

    async fn close(&mut self) -> GatewayResult<()> {
        // dropping an unfinished handler cancels it
        self.handler.take();
        Ok(())
    }
}

enum Outcome {
    Exhausted,
    Cancelled,
    Failed(GatewayError),
}

struct Collected {
    content: String,
    usage: Option<TokenUsage>,
    finish_reason: Option<FinishReason>,
    raw: Option<serde_json::Value>,
}

impl Collected {
    fn absorb(&mut self, fragment: &mut Fragment) {
        if let Some(usage) = fragment.usage.take() {
            self.usage = Some(usage);
        }
        if let Some(reason) = fragment.finish_reason.take() {
            self.finish_reason = Some(reason);
        }
        if let Some(raw) = fragment.raw.take() {
            self.raw = Some(raw);
        }
    }
}

async fn run_worker(
    mut response: Response,
    mut source: Box<dyn FragmentSource>,
    control: Arc<StreamControl>,
    buffer: Arc<dyn FragmentBuffer>,
    settings: StreamSettings,
) -> GatewayResult<Response> {
    let provider = response.provider.clone();
    let mut state_rx = control.subscribe();
    let mut collected = Collected {
        content: String::new(),
        usage: None,
        finish_reason: None,
        raw: None,
    };

    let mut outcome = loop {
        let next = tokio::select! {
            biased;
            _ = wait_for_cancel(&mut state_rx) => break Outcome::Cancelled,
            next = pull(source.as_mut(), settings.idle_timeout, &provider) => next,
        };
        match next {
            None => break Outcome::Exhausted,
            Some(Err(e)) => break Outcome::Failed(e),
            Some(Ok(mut fragment)) => {
                collected.absorb(&mut fragment);
                let delta = fragment.delta;
                if delta.is_empty() {
                    continue;
                }
                collected.content.push_str(&delta);
                if !write_all(buffer.as_ref(), &control, &delta).await {
                    break Outcome::Cancelled;
                }
            }
        }
    };

    if matches!(outcome, Outcome::Exhausted) && !await_completion(&control, &mut state_rx).await {
        outcome = Outcome::Cancelled;
    }

    if let Err(e) = source.close().await {
        warn!(provider = %provider, error = %e, "failed to close stream source");
    }

    let usage = collected
        .usage
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| TokenUsage::estimate(&settings.prompt_text, &collected.content));
    response.cost = settings.pricing.estimate(&usage);
    response.usage = usage;
    response.raw = collected.raw;

    match outcome {
        Outcome::Exhausted => {
            buffer.close();
            response.finish_reason = Some(collected.finish_reason.unwrap_or(FinishReason::Stop));
            response.content = collected.content;
            info!(
                provider = %provider,
                model = %response.model,
                chars = response.content.chars().count(),
                output_tokens = response.usage.output_tokens,
                "stream completed"
            );
            Ok(response)
        }
        Outcome::Cancelled => {
            buffer.abort();
            response.finish_reason = Some(FinishReason::Cancelled);
            response.content = collected.content;
            info!(provider = %provider, model = %response.model, "stream cancelled");
            Ok(response)
        }
        Outcome::Failed(e) => {
            control.fail(e.to_string());
            // text received before the failure stays readable
            buffer.resume();
            buffer.close();
            warn!(provider = %provider, error = %e, "stream failed");
            Err(e)
        }
    }
}

async fn pull(
    source: &mut dyn FragmentSource,
    idle_timeout: Option<Duration>,
    provider: &str,
) -> Option<GatewayResult<Fragment>> {
    match idle_timeout {
        None => source.next_fragment().await,
        Some(limit) => match tokio::time::timeout(limit, source.next_fragment()).await {
            Ok(next) => next,
            Err(_) => Some(Err(GatewayError::timeout(
                provider,
                format!("no stream data for {} ms", limit.as_millis()),
            ))),
        },
    }
}

async fn wait_for_cancel(rx: &mut watch::Receiver<StreamState>) {
    loop {
        if *rx.borrow_and_update() == StreamState::Cancelled {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Once the source is exhausted, a paused stream stays open until it is
/// resumed or cancelled. Returns `false` if it was cancelled.
async fn await_completion(control: &StreamControl, rx: &mut watch::Receiver<StreamState>) -> bool {
    loop {
        if control.complete() {
            return true;
        }
        match control.state() {
            StreamState::Cancelled => return false,
            StreamState::Paused => {
                if rx.changed().await.is_err() {
                    return false;
                }
            }
            // Error and Completed are only set by this worker
            _ => return false,
        }
    }
}

/// Writes `text` in full, waiting for room when the buffer is full.
/// Returns `false` if the stream was cancelled first.
async fn write_all(buffer: &dyn FragmentBuffer, control: &StreamControl, text: &str) -> bool {
    let queue = buffer.queue();
    let mut rest = text;
    loop {
        if control.state() == StreamState::Cancelled {
            return false;
        }
        let room = queue.remaining_capacity();
        if room == 0 {
            queue.wait_for_space().await;
            continue;
        }
        let split = rest
            .char_indices()
            .nth(room)
            .map_or(rest.len(), |(idx, _)| idx);
        let (head, tail) = rest.split_at(split);
        if !buffer.add(head) {
            return false;
        }
        if tail.is_empty() {
            return true;
        }
        rest = tail;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::buffer::StreamBuffer;

    #[tokio::test]
    async fn test_write_all_splits_on_char_boundaries() {
        let buffer: Arc<dyn FragmentBuffer> = Arc::new(StreamBuffer::new(2));
        let control = Arc::new(StreamControl::new());
        control.start();

        let writer = {
            let buffer = buffer.clone();
            let control = control.clone();
            tokio::spawn(async move { write_all(buffer.as_ref(), &control, "héllo").await })
        };
        let mut out = String::new();
        while out.chars().count() < 5 {
            if let Some(part) = buffer.get(Duration::from_millis(100)).await {
                assert!(part.chars().count() <= 2);
                out.push_str(&part);
            }
        }
        assert!(writer.await.unwrap());
        assert_eq!(out, "héllo");
    }

    #[tokio::test]
    async fn test_write_all_stops_on_cancel() {
        let buffer: Arc<dyn FragmentBuffer> = Arc::new(StreamBuffer::new(1));
        let control = Arc::new(StreamControl::new());
        control.start();
        let writer = {
            let buffer = buffer.clone();
            let control = control.clone();
            tokio::spawn(async move { write_all(buffer.as_ref(), &control, "abc").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        control.cancel();
        buffer.abort();
        assert!(!writer.await.unwrap());
    }
}
