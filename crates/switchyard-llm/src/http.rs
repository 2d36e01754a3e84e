//! Shared HTTP plumbing for the hosted and local adapters.

use parking_lot::Mutex;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, RequestBuilder};
use std::time::Duration;
use switchyard_core::{GatewayError, GatewayResult};
use tracing::debug;

/// Connection parameters of one adapter instance.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Base URL without a trailing slash.
    pub base_url: String,
    /// TCP/TLS connect deadline.
    pub connect_timeout: Duration,
    /// Deadline for a blocking call, and for the headers of a streamed one.
    pub request_timeout: Duration,
}

/// A lazily built `reqwest::Client` plus status classification.
///
/// The client is created on first use under a mutex and then shared by every
/// call made through this transport.
pub struct HttpTransport {
    provider: String,
    settings: HttpSettings,
    client: Mutex<Option<reqwest::Client>>,
}

impl HttpTransport {
    /// A transport for `provider`. No client is built yet.
    pub fn new(provider: impl Into<String>, mut settings: HttpSettings) -> Self {
        settings.base_url = settings.base_url.trim_end_matches('/').to_string();
        Self {
            provider: provider.into(),
            settings,
            client: Mutex::new(None),
        }
    }

    /// Base URL requests are sent to.
    pub fn base_url(&self) -> &str {
        &self.settings.base_url
    }

    /// Whether the client has been built.
    pub fn is_connected(&self) -> bool {
        self.client.lock().is_some()
    }

    fn client(&self) -> GatewayResult<reqwest::Client> {
        let mut guard = self.client.lock();
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .connect_timeout(self.settings.connect_timeout)
            .build()
            .map_err(|e| {
                GatewayError::Config(format!("{}: cannot build HTTP client: {e}", self.provider))
            })?;
        debug!(provider = %self.provider, base_url = %self.settings.base_url, "HTTP client built");
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Starts a request to `path` under the base URL.
    pub fn request(&self, method: Method, path: &str) -> GatewayResult<RequestBuilder> {
        let url = format!("{}{path}", self.settings.base_url);
        Ok(self.client()?.request(method, url))
    }

    /// Sends the request and classifies a non-success status.
    ///
    /// Blocking calls get the full request timeout; streamed calls only wait
    /// that long for the response headers, so a long reply is not cut off.
    pub async fn send(&self, builder: RequestBuilder, streaming: bool) -> GatewayResult<reqwest::Response> {
        let timeout = self.settings.request_timeout;
        let response = if streaming {
            match tokio::time::timeout(timeout, builder.send()).await {
                Ok(result) => result.map_err(|e| transport_error(&self.provider, &e))?,
                Err(_) => {
                    return Err(GatewayError::timeout(
                        &self.provider,
                        format!("no response headers within {} ms", timeout.as_millis()),
                    ))
                }
            }
        } else {
            builder
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| transport_error(&self.provider, &e))?
        };
        check_status(&self.provider, response).await
    }

    /// Reads a successful response body as JSON.
    pub async fn read_json(&self, response: reqwest::Response) -> GatewayResult<serde_json::Value> {
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(&self.provider, &e))?;
        serde_json::from_str(&text).map_err(|e| GatewayError::Provider {
            provider: self.provider.clone(),
            status: None,
            message: format!("malformed response body: {e}"),
        })
    }
}

/// Returns the response unchanged on success, otherwise the classified error.
pub async fn check_status(provider: &str, response: reqwest::Response) -> GatewayResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::from_status(provider, status.as_u16(), &body, retry_after))
}

/// Seconds from a `retry-after` header. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let secs: f64 = raw.parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

/// Maps a transport-level failure: deadlines become Timeout, connection
/// failures Server, anything else a generic Provider error.
pub fn transport_error(provider: &str, err: &reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::timeout(provider, err.to_string())
    } else if err.is_connect() {
        GatewayError::server(provider, format!("connection failed: {err}"))
    } else {
        GatewayError::Provider {
            provider: provider.to_string(),
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}
