use crate::reliability::{CircuitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use switchyard_core::{FieldError, GatewayError, GatewayResult};

/// Names of the built-in backends.
pub const ANTHROPIC: &str = "anthropic";
/// OpenAI chat completions.
pub const OPENAI: &str = "openai";
/// Local Ollama server.
pub const OLLAMA: &str = "ollama";
/// In-memory mock.
pub const MOCK: &str = "mock";

/// Default base URL of a built-in provider.
pub fn default_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        ANTHROPIC => Some("https://api.anthropic.com"),
        OPENAI => Some("https://api.openai.com"),
        OLLAMA => Some("http://localhost:11434"),
        MOCK => Some("mock://local"),
        _ => None,
    }
}

/// Per-provider connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Opaque credential.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Endpoint override.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Connect deadline in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Request deadline in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Model used for this provider when nothing else names one.
    #[serde(default)]
    pub default_model: Option<String>,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            default_model: None,
        }
    }
}

impl ProviderSettings {
    /// Connect deadline.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Request deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The credential, or an empty string.
    pub fn api_key_or_empty(&self) -> String {
        self.api_key.clone().unwrap_or_default()
    }
}

/// Gateway configuration, loadable from TOML and overlaid from the
/// environment.
///
/// ```toml
/// default_provider = "anthropic"
/// default_capability = "balanced"
/// default_max_tokens = 2048
///
/// [providers.anthropic]
/// api_key = "sk-ant-..."
/// request_timeout_secs = 60
///
/// [retry]
/// max_retries = 2
///
/// [circuit]
/// failure_threshold = 3
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Provider used when a selection names none.
    #[serde(default)]
    pub default_provider: Option<String>,
    /// Model used when a selection names none.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Capability tag used when a selection names neither model nor tag.
    #[serde(default)]
    pub default_capability: Option<String>,
    /// Max tokens when a selection does not set it.
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
    /// Settings keyed by provider name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
    /// Retry policy for reliable providers.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Circuit-breaker policy for reliable providers.
    #[serde(default)]
    pub circuit: CircuitConfig,
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_provider: None,
            default_model: None,
            default_capability: None,
            default_max_tokens: default_max_tokens(),
            providers: BTreeMap::new(),
            retry: RetryConfig::default(),
            circuit: CircuitConfig::default(),
        }
    }
}

/// Environment variable prefix of each built-in provider, and the variable
/// holding its endpoint.
const PROVIDER_ENV: &[(&str, &str, &str)] = &[
    (ANTHROPIC, "ANTHROPIC", "ANTHROPIC_BASE_URL"),
    (OPENAI, "OPENAI", "OPENAI_BASE_URL"),
    (OLLAMA, "OLLAMA", "OLLAMA_HOST"),
];

impl GatewayConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(raw: &str) -> GatewayResult<Self> {
        toml::from_str(raw).map_err(|e| GatewayError::Config(format!("invalid config: {e}")))
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Defaults overlaid with the process environment, then validated.
    pub fn from_env() -> Result<Self, Vec<FieldError>> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_env_map(&vars)
    }

    /// Defaults overlaid with `vars`, then validated.
    pub fn from_env_map(vars: &HashMap<String, String>) -> Result<Self, Vec<FieldError>> {
        let mut config = Self::default();
        let mut errors = config.apply_env(vars);
        if let Err(more) = config.validate() {
            errors.extend(more);
        }
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }

    /// Overlays recognised variables from `vars`. Returns the variables that
    /// could not be parsed; the matching fields are left unchanged.
    pub fn apply_env(&mut self, vars: &HashMap<String, String>) -> Vec<FieldError> {
        let mut errors = Vec::new();
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("SWITCHYARD_PROVIDER") {
            self.default_provider = Some(v.to_lowercase());
        }
        if let Some(v) = get("SWITCHYARD_MODEL") {
            self.default_model = Some(v);
        }
        if let Some(v) = get("SWITCHYARD_CAPABILITY") {
            self.default_capability = Some(v.to_lowercase());
        }
        if let Some(v) = get("SWITCHYARD_MAX_TOKENS") {
            match v.parse::<u32>() {
                Ok(n) => self.default_max_tokens = n,
                Err(_) => errors.push(FieldError::new(
                    "SWITCHYARD_MAX_TOKENS",
                    format!("not a positive integer: {v}"),
                )),
            }
        }

        for (provider, prefix, url_var) in PROVIDER_ENV {
            let key_var = format!("{prefix}_API_KEY");
            let connect_var = format!("{prefix}_CONNECT_TIMEOUT");
            let request_var = format!("{prefix}_REQUEST_TIMEOUT");

            let api_key = get(key_var.as_str());
            let base_url = get(*url_var);
            let connect = get(connect_var.as_str());
            let request = get(request_var.as_str());
            if api_key.is_none() && base_url.is_none() && connect.is_none() && request.is_none() {
                continue;
            }

            let settings = self.providers.entry((*provider).to_string()).or_default();
            if let Some(key) = api_key {
                settings.api_key = Some(key);
            }
            if let Some(url) = base_url {
                settings.base_url = Some(normalize_host(&url));
            }
            for (var, value, slot) in [
                (&connect_var, connect, &mut settings.connect_timeout_secs),
                (&request_var, request, &mut settings.request_timeout_secs),
            ] {
                if let Some(v) = value {
                    match v.parse::<u64>() {
                        Ok(secs) => *slot = secs,
                        Err(_) => errors.push(FieldError::new(
                            var.as_str(),
                            format!("not a whole number of seconds: {v}"),
                        )),
                    }
                }
            }
        }
        errors
    }

    /// Checks every field. Lists all problems instead of stopping at the
    /// first.
    pub fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        if self.default_max_tokens == 0 {
            errors.push(FieldError::new("default_max_tokens", "must be at least 1"));
        }
        for (field, value) in [
            ("default_provider", &self.default_provider),
            ("default_model", &self.default_model),
            ("default_capability", &self.default_capability),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                errors.push(FieldError::new(field, "must not be empty when set"));
            }
        }

        for (name, settings) in &self.providers {
            let prefix = format!("providers.{name}");
            if settings.connect_timeout_secs == 0 {
                errors.push(FieldError::new(
                    format!("{prefix}.connect_timeout_secs"),
                    "must be at least 1",
                ));
            }
            if settings.request_timeout_secs == 0 {
                errors.push(FieldError::new(
                    format!("{prefix}.request_timeout_secs"),
                    "must be at least 1",
                ));
            }
            if let Some(url) = &settings.base_url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    errors.push(FieldError::new(
                        format!("{prefix}.base_url"),
                        format!("must be an http(s) URL: {url}"),
                    ));
                }
            }
        }

        errors.extend(self.retry.validate("retry"));
        errors.extend(self.circuit.validate("circuit"));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Settings for `provider`, defaults when none are configured.
    pub fn provider_settings(&self, provider: &str) -> ProviderSettings {
        self.providers.get(provider).cloned().unwrap_or_default()
    }
}

/// `OLLAMA_HOST` is commonly given as `host:port`.
fn normalize_host(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// A partially specified provider selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderOptions {
    /// Provider name.
    #[serde(default)]
    pub provider: Option<String>,
    /// Model name.
    #[serde(default)]
    pub model: Option<String>,
    /// Capability tag, e.g. `"premium"` or `"code"`.
    #[serde(default)]
    pub capability: Option<String>,
    /// Max tokens per reply.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Endpoint override.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Adapter-specific extras, passed through.
    #[serde(default)]
    pub extras: HashMap<String, serde_json::Value>,
}

impl ProviderOptions {
    /// An empty selection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the provider.
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Sets the model.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the capability tag.
    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    /// Sets max tokens.
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Sets the endpoint override.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Adds an extra.
    pub fn extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }
}

/// A fully specified provider selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedOptions {
    /// Provider name.
    pub provider: String,
    /// Model name.
    pub model: String,
    /// Max tokens per reply.
    pub max_tokens: u32,
    /// Base URL of the backend.
    pub endpoint: String,
    /// Adapter-specific extras.
    #[serde(default)]
    pub extras: HashMap<String, serde_json::Value>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_toml_defaults_and_overrides() {
        let cfg = GatewayConfig::from_toml_str(
            r#"
            default_provider = "openai"
            default_capability = "efficient"

            [providers.openai]
            api_key = "sk-test"
            request_timeout_secs = 30

            [retry]
            max_retries = 1

            [circuit]
            failure_threshold = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.default_provider.as_deref(), Some("openai"));
        assert_eq!(cfg.default_max_tokens, 4096);
        let openai = cfg.provider_settings("openai");
        assert_eq!(openai.api_key.as_deref(), Some("sk-test"));
        assert_eq!(openai.connect_timeout(), Duration::from_secs(10));
        assert_eq!(openai.request_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.retry.max_retries, 1);
        assert_eq!(cfg.retry.initial_delay_ms, 500);
        assert_eq!(cfg.circuit.failure_threshold, 2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = GatewayConfig::from_toml_str("default_max_tokens = \"many\"").unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_env_overlay() {
        let cfg = GatewayConfig::from_env_map(&vars(&[
            ("SWITCHYARD_PROVIDER", "Anthropic"),
            ("SWITCHYARD_MAX_TOKENS", "1024"),
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("ANTHROPIC_REQUEST_TIMEOUT", "45"),
            ("OLLAMA_HOST", "gpu-box:11434"),
            ("UNRELATED", "x"),
        ]))
        .unwrap();
        assert_eq!(cfg.default_provider.as_deref(), Some("anthropic"));
        assert_eq!(cfg.default_max_tokens, 1024);
        let anthropic = cfg.provider_settings("anthropic");
        assert_eq!(anthropic.api_key.as_deref(), Some("sk-ant"));
        assert_eq!(anthropic.request_timeout_secs, 45);
        assert_eq!(
            cfg.provider_settings("ollama").base_url.as_deref(),
            Some("http://gpu-box:11434")
        );
        assert!(!cfg.providers.contains_key("openai"));
    }

    #[test]
    fn test_env_errors_are_collected() {
        let errors = GatewayConfig::from_env_map(&vars(&[
            ("SWITCHYARD_MAX_TOKENS", "lots"),
            ("OPENAI_CONNECT_TIMEOUT", "-1"),
            ("OPENAI_REQUEST_TIMEOUT", "0"),
        ]))
        .unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "SWITCHYARD_MAX_TOKENS",
                "OPENAI_CONNECT_TIMEOUT",
                "providers.openai.request_timeout_secs"
            ]
        );
    }

    #[test]
    fn test_validate_lists_every_problem() {
        let mut cfg = GatewayConfig {
            default_max_tokens: 0,
            default_model: Some("  ".into()),
            ..GatewayConfig::default()
        };
        cfg.providers.insert(
            "openai".into(),
            ProviderSettings {
                base_url: Some("ftp://example.com".into()),
                ..ProviderSettings::default()
            },
        );
        cfg.circuit.half_open_max = 0;
        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.field == "providers.openai.base_url"));
    }

    #[test]
    fn test_options_builder() {
        let opts = ProviderOptions::new()
            .provider("mock")
            .capability("premium")
            .max_tokens(10)
            .extra("reply", serde_json::json!("hi"));
        assert_eq!(opts.provider.as_deref(), Some("mock"));
        assert_eq!(opts.extras["reply"], "hi");
    }
}
