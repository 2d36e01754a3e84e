use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A convenience `Result` alias using [`GatewayError`].
pub type GatewayResult<T> = Result<T, GatewayError>;

/// The failure vocabulary shared by every adapter, wrapper and group.
///
/// `ErrorKind` is the policy-facing view of a [`GatewayError`]: retry
/// configurations hold sets of kinds, not concrete errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad or missing credential.
    Authentication,
    /// Backend throttling.
    RateLimit,
    /// Backend 5xx or an unreachable backend.
    Server,
    /// The call exceeded its deadline.
    Timeout,
    /// Malformed request or options.
    Validation,
    /// A failure in the middle of a streamed reply.
    Stream,
    /// Unresolvable selection or missing configuration field.
    Config,
    /// Backend quota or credit exhausted.
    QuotaExceeded,
    /// Rejected locally by an open circuit breaker.
    CircuitOpen,
    /// Any other backend-reported failure.
    Provider,
    /// A payload could not be encoded or decoded.
    Serialization,
}

impl ErrorKind {
    /// Whether this kind is retried under the default policy.
    ///
    /// `Stream` is listed as retryable here; the concrete error decides
    /// through its `resumable` flag (see [`GatewayError::is_retryable`]).
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::Server
                | ErrorKind::Timeout
                | ErrorKind::Stream
                | ErrorKind::Provider
        )
    }

    /// Whether a failure of this kind says something about backend health
    /// and should therefore count toward a circuit breaker.
    pub fn counts_as_backend_failure(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::Server
                | ErrorKind::Timeout
                | ErrorKind::Stream
                | ErrorKind::Provider
        )
    }

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Server => "server",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::Stream => "stream",
            ErrorKind::Config => "config",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Provider => "provider",
            ErrorKind::Serialization => "serialization",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for the gateway.
///
/// Every variant produced at a backend boundary carries the provider name and,
/// where one exists, the HTTP status that caused it.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    /// Bad or missing credential. Never retried.
    #[error("[{provider}] authentication failed: {message}")]
    Authentication {
        /// Provider that rejected the call.
        provider: String,
        /// HTTP status, when the failure came from a response.
        status: Option<u16>,
        /// Backend or local message.
        message: String,
    },

    /// Backend throttling. Retried, honoring `retry_after`.
    #[error("[{provider}] rate limited: {message}")]
    RateLimit {
        /// Provider that throttled the call.
        provider: String,
        /// HTTP status, when the failure came from a response.
        status: Option<u16>,
        /// Backend message.
        message: String,
        /// Delay requested by the backend, if any.
        retry_after: Option<Duration>,
    },

    /// Backend 5xx or connection failure. Retried.
    #[error("[{provider}] server error: {message}")]
    Server {
        /// Provider that failed.
        provider: String,
        /// HTTP status, when the failure came from a response.
        status: Option<u16>,
        /// Backend message.
        message: String,
    },

    /// The call exceeded its deadline. Retried.
    #[error("[{provider}] timed out: {message}")]
    Timeout {
        /// Provider that timed out.
        provider: String,
        /// HTTP status (408), when the backend reported it.
        status: Option<u16>,
        /// Description of the deadline that was exceeded.
        message: String,
    },

    /// Malformed request or options. Never retried.
    #[error("[{provider}] invalid request: {message}")]
    Validation {
        /// Provider that rejected the request.
        provider: String,
        /// HTTP status, when the failure came from a response.
        status: Option<u16>,
        /// Backend or local message.
        message: String,
    },

    /// Mid-stream failure. Retried only when `resumable`.
    #[error("[{provider}] stream failed: {message}")]
    Stream {
        /// Provider whose stream failed.
        provider: String,
        /// What went wrong.
        message: String,
        /// Whether restarting the stream is expected to help.
        resumable: bool,
    },

    /// Unresolvable selection or invalid configuration. Fatal at construction.
    #[error("Config error: {0}")]
    Config(String),

    /// Backend quota exhausted. Never retried automatically.
    #[error("[{provider}] quota exceeded: {message}")]
    QuotaExceeded {
        /// Provider whose quota is exhausted.
        provider: String,
        /// HTTP status, when the failure came from a response.
        status: Option<u16>,
        /// Backend message.
        message: String,
    },

    /// A circuit breaker rejected the call without contacting the backend.
    #[error("[{provider}] circuit open: calls are suspended until the recovery timeout elapses")]
    CircuitOpen {
        /// Provider guarded by the open breaker.
        provider: String,
    },

    /// Any other backend-reported failure.
    #[error("[{provider}] provider error: {message}")]
    Provider {
        /// Provider that failed.
        provider: String,
        /// HTTP status, when the failure came from a response.
        status: Option<u16>,
        /// Backend message.
        message: String,
    },

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl GatewayError {
    /// The policy-facing kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Authentication { .. } => ErrorKind::Authentication,
            GatewayError::RateLimit { .. } => ErrorKind::RateLimit,
            GatewayError::Server { .. } => ErrorKind::Server,
            GatewayError::Timeout { .. } => ErrorKind::Timeout,
            GatewayError::Validation { .. } => ErrorKind::Validation,
            GatewayError::Stream { .. } => ErrorKind::Stream,
            GatewayError::Config(_) => ErrorKind::Config,
            GatewayError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            GatewayError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            GatewayError::Provider { .. } => ErrorKind::Provider,
            GatewayError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Name of the provider the error is attributed to, if any.
    pub fn provider(&self) -> Option<&str> {
        match self {
            GatewayError::Authentication { provider, .. }
            | GatewayError::RateLimit { provider, .. }
            | GatewayError::Server { provider, .. }
            | GatewayError::Timeout { provider, .. }
            | GatewayError::Validation { provider, .. }
            | GatewayError::Stream { provider, .. }
            | GatewayError::QuotaExceeded { provider, .. }
            | GatewayError::CircuitOpen { provider }
            | GatewayError::Provider { provider, .. } => Some(provider),
            GatewayError::Config(_) | GatewayError::Serialization(_) => None,
        }
    }

    /// HTTP status that caused the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Authentication { status, .. }
            | GatewayError::RateLimit { status, .. }
            | GatewayError::Server { status, .. }
            | GatewayError::Timeout { status, .. }
            | GatewayError::Validation { status, .. }
            | GatewayError::QuotaExceeded { status, .. }
            | GatewayError::Provider { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether the default policy would retry this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Stream { resumable, .. } => *resumable,
            other => other.kind().default_retryable(),
        }
    }

    /// Delay requested by the backend before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classify a non-success HTTP response.
    ///
    /// 401/403 → Authentication, 402 → QuotaExceeded, 408 → Timeout,
    /// 429 → RateLimit (QuotaExceeded when the body names an exhausted quota),
    /// 400 → Validation (same quota check), 5xx → Server, anything else →
    /// Provider.
    pub fn from_status(
        provider: &str,
        status: u16,
        body: &str,
        retry_after: Option<Duration>,
    ) -> Self {
        let provider = provider.to_string();
        let message = if body.trim().is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {}", body.trim())
        };
        let status_code = Some(status);

        match status {
            401 | 403 => GatewayError::Authentication {
                provider,
                status: status_code,
                message,
            },
            402 => GatewayError::QuotaExceeded {
                provider,
                status: status_code,
                message,
            },
            408 => GatewayError::Timeout {
                provider,
                status: status_code,
                message,
            },
            400 | 429 if mentions_quota(body) => GatewayError::QuotaExceeded {
                provider,
                status: status_code,
                message,
            },
            429 => GatewayError::RateLimit {
                provider,
                status: status_code,
                message,
                retry_after,
            },
            400 => GatewayError::Validation {
                provider,
                status: status_code,
                message,
            },
            500..=599 => GatewayError::Server {
                provider,
                status: status_code,
                message,
            },
            _ => GatewayError::Provider {
                provider,
                status: status_code,
                message,
            },
        }
    }

    /// Build a [`GatewayError::Server`] with no HTTP status.
    pub fn server(provider: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::Server {
            provider: provider.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Build a [`GatewayError::Validation`] with no HTTP status.
    pub fn validation(provider: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::Validation {
            provider: provider.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Build a [`GatewayError::Timeout`] with no HTTP status.
    pub fn timeout(provider: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::Timeout {
            provider: provider.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Build a [`GatewayError::Authentication`] with no HTTP status.
    pub fn authentication(provider: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::Authentication {
            provider: provider.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Build a [`GatewayError::Stream`].
    pub fn stream(provider: impl Into<String>, message: impl Into<String>, resumable: bool) -> Self {
        GatewayError::Stream {
            provider: provider.into(),
            message: message.into(),
            resumable,
        }
    }

    /// Collapse a list of field errors into one [`GatewayError::Config`].
    pub fn from_field_errors(errors: &[FieldError]) -> Self {
        let joined = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        GatewayError::Config(joined)
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

fn mentions_quota(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("insufficient_quota")
        || lower.contains("quota exceeded")
        || lower.contains("exceeded your current quota")
        || lower.contains("credit balance is too low")
}

/// A single invalid configuration field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Dotted path of the offending field, e.g. `providers.openai.api_key`.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl FieldError {
    /// Creates a new field error.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
