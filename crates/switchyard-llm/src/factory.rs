//! Name → constructor registry for backends, with a cache of reliable
//! instances.

use crate::backends::anthropic::AnthropicProvider;
use crate::backends::mock::MockProvider;
use crate::backends::ollama::OllamaProvider;
use crate::backends::openai::OpenAiProvider;
use crate::capability;
use crate::config::{
    default_base_url, GatewayConfig, ProviderOptions, ResolvedOptions, ANTHROPIC, MOCK, OLLAMA,
    OPENAI,
};
use crate::group::{GroupStrategy, ProviderGroup};
use crate::provider::Provider;
use crate::reliability::ReliableProvider;
use crate::resolver::Resolver;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use switchyard_core::{GatewayError, GatewayResult};
use tracing::{debug, info};

/// Builds a backend from resolved options.
pub type Constructor =
    Arc<dyn Fn(&ResolvedOptions, &GatewayConfig) -> GatewayResult<Arc<dyn Provider>> + Send + Sync>;

/// What the registry knows about one backend.
#[derive(Clone)]
pub struct ProviderDescriptor {
    name: String,
    default_endpoint: String,
    models: Vec<String>,
    prefixes: Vec<String>,
    tagged_names: bool,
    constructor: Constructor,
}

impl ProviderDescriptor {
    /// A backend called `name`, reached at `default_endpoint`.
    pub fn new(
        name: impl Into<String>,
        default_endpoint: impl Into<String>,
        constructor: Constructor,
    ) -> Self {
        Self {
            name: name.into(),
            default_endpoint: default_endpoint.into(),
            models: Vec::new(),
            prefixes: Vec::new(),
            tagged_names: false,
            constructor,
        }
    }

    /// Models the backend is known to serve.
    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models.extend(models.into_iter().map(Into::into));
        self
    }

    /// Model-name prefixes the backend accepts.
    pub fn with_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefixes.extend(prefixes.into_iter().map(Into::into));
        self
    }

    /// Also accept any `name:tag` model.
    pub fn with_tagged_names(mut self) -> Self {
        self.tagged_names = true;
        self
    }

    /// Registry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint used when neither options nor config give one.
    pub fn default_endpoint(&self) -> &str {
        &self.default_endpoint
    }

    /// Known models, in registration order.
    pub fn models(&self) -> &[String] {
        &self.models
    }

    fn longest_prefix(&self, model: &str) -> Option<usize> {
        self.prefixes
            .iter()
            .filter(|p| model.starts_with(p.as_str()))
            .map(String::len)
            .max()
    }

    fn accepts_tagged(&self, model: &str) -> bool {
        self.tagged_names
            && model
                .split_once(':')
                .is_some_and(|(name, tag)| !name.is_empty() && !tag.is_empty() && !tag.contains(':'))
    }

    fn accepts(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
            || self.longest_prefix(model).is_some()
            || self.accepts_tagged(model)
    }
}

impl std::fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("name", &self.name)
            .field("default_endpoint", &self.default_endpoint)
            .field("models", &self.models)
            .field("prefixes", &self.prefixes)
            .field("tagged_names", &self.tagged_names)
            .finish_non_exhaustive()
    }
}

/// Provider, model, endpoint, max tokens and the extras in key order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    provider: String,
    model: String,
    endpoint: String,
    max_tokens: u32,
    extras: String,
}

impl CacheKey {
    fn new(resolved: &ResolvedOptions) -> Self {
        let extras: BTreeMap<&String, &serde_json::Value> = resolved.extras.iter().collect();
        Self {
            provider: resolved.provider.clone(),
            model: resolved.model.clone(),
            endpoint: resolved.endpoint.clone(),
            max_tokens: resolved.max_tokens,
            extras: serde_json::to_string(&extras).unwrap_or_default(),
        }
    }
}

/// Process-scoped registry of backends.
///
/// Built explicitly and passed by reference. Holds the validated
/// configuration, the constructors, and a cache of reliable providers keyed
/// by the full resolved selection.
pub struct ProviderRegistry {
    config: GatewayConfig,
    descriptors: RwLock<BTreeMap<String, ProviderDescriptor>>,
    cache: RwLock<HashMap<CacheKey, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    /// An empty registry. Fails with every field error of `config`.
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        config
            .validate()
            .map_err(|errors| GatewayError::from_field_errors(&errors))?;
        Ok(Self {
            config,
            descriptors: RwLock::new(BTreeMap::new()),
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// A registry with the built-in backends registered.
    pub fn with_defaults(config: GatewayConfig) -> GatewayResult<Self> {
        let registry = Self::new(config)?;
        for descriptor in builtin_descriptors() {
            registry.register(descriptor);
        }
        Ok(registry)
    }

    /// Adds or replaces a backend. Cached instances of it are dropped.
    pub fn register(&self, descriptor: ProviderDescriptor) {
        let name = descriptor.name.clone();
        self.cache.write().retain(|key, _| key.provider != name);
        debug!(provider = %name, "registered provider");
        self.descriptors.write().insert(name, descriptor);
    }

    /// The validated configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Registered backend names, sorted.
    pub fn providers(&self) -> Vec<String> {
        self.descriptors.read().keys().cloned().collect()
    }

    /// The descriptor registered under `provider`.
    pub fn descriptor(&self, provider: &str) -> Option<ProviderDescriptor> {
        self.descriptors.read().get(provider).cloned()
    }

    /// Whether `provider` is registered and accepts `model`: a known model,
    /// a known prefix, or (for backends with tagged names) `name:tag`.
    pub fn is_compatible(&self, provider: &str, model: &str) -> bool {
        self.descriptors
            .read()
            .get(provider)
            .is_some_and(|d| d.accepts(model))
    }

    /// The backend that serves `model`: an exact model match first, then
    /// the longest prefix, then a `name:tag` heuristic.
    pub fn infer_provider(&self, model: &str) -> Option<String> {
        let descriptors = self.descriptors.read();
        if let Some(d) = descriptors.values().find(|d| d.models.iter().any(|m| m == model)) {
            return Some(d.name.clone());
        }
        if let Some((d, _)) = descriptors
            .values()
            .filter_map(|d| d.longest_prefix(model).map(|len| (d, len)))
            .max_by_key(|(_, len)| *len)
        {
            return Some(d.name.clone());
        }
        descriptors
            .values()
            .find(|d| d.accepts_tagged(model))
            .map(|d| d.name.clone())
    }

    /// Completes `options` into a concrete selection.
    pub fn resolve(&self, options: &ProviderOptions) -> GatewayResult<ResolvedOptions> {
        Resolver::new(self).resolve(options)
    }

    /// Builds a bare backend for `options`.
    pub fn create(&self, options: &ProviderOptions) -> GatewayResult<Arc<dyn Provider>> {
        let resolved = self.resolve(options)?;
        self.create_resolved(&resolved)
    }

    /// Builds a bare backend for an already resolved selection.
    pub fn create_resolved(&self, resolved: &ResolvedOptions) -> GatewayResult<Arc<dyn Provider>> {
        let constructor = self
            .descriptors
            .read()
            .get(&resolved.provider)
            .map(|d| d.constructor.clone())
            .ok_or_else(|| {
                GatewayError::Config(format!("unknown provider '{}'", resolved.provider))
            })?;
        info!(provider = %resolved.provider, model = %resolved.model, endpoint = %resolved.endpoint, "creating provider");
        constructor(resolved, &self.config)
    }

    /// Builds a backend wrapped in the configured retry and circuit policies.
    pub fn create_reliable(&self, options: &ProviderOptions) -> GatewayResult<Arc<ReliableProvider>> {
        let inner = self.create(options)?;
        Ok(Arc::new(self.wrap(inner)))
    }

    fn wrap(&self, inner: Arc<dyn Provider>) -> ReliableProvider {
        ReliableProvider::new(inner, self.config.retry.clone(), self.config.circuit.clone())
    }

    /// A cached reliable backend for `options`; callers whose selections
    /// resolve identically (provider, model, endpoint, max tokens, extras)
    /// share one instance and one breaker.
    pub fn get_or_create(&self, options: &ProviderOptions) -> GatewayResult<Arc<dyn Provider>> {
        let resolved = self.resolve(options)?;
        let key = CacheKey::new(&resolved);
        if let Some(hit) = self.cache.read().get(&key) {
            return Ok(hit.clone());
        }

        let created: Arc<dyn Provider> = Arc::new(self.wrap(self.create_resolved(&resolved)?));
        let mut cache = self.cache.write();
        // another caller may have raced us here
        let entry = cache.entry(key).or_insert(created);
        Ok(entry.clone())
    }

    /// A group of cached reliable backends, in the given order.
    pub fn group(
        &self,
        members: &[ProviderOptions],
        strategy: GroupStrategy,
    ) -> GatewayResult<ProviderGroup> {
        let providers = members
            .iter()
            .map(|options| self.get_or_create(options))
            .collect::<GatewayResult<Vec<_>>>()?;
        ProviderGroup::new(providers, strategy)
    }

    /// Cached instances.
    pub fn cached(&self) -> usize {
        self.cache.read().len()
    }

    /// Drops every cached instance.
    pub fn clear(&self) {
        self.cache.write().clear();
    }
}

fn builtin_descriptors() -> Vec<ProviderDescriptor> {
    let endpoint = |name: &str| default_base_url(name).unwrap_or_default().to_string();

    vec![
        ProviderDescriptor::new(
            ANTHROPIC,
            endpoint(ANTHROPIC),
            Arc::new(|o: &ResolvedOptions, c: &GatewayConfig| -> GatewayResult<Arc<dyn Provider>> {
                Ok(Arc::new(AnthropicProvider::new(o, c)) as Arc<dyn Provider>)
            }),
        )
        .with_models(capability::table_models(ANTHROPIC))
        .with_prefixes(["claude-"]),
        ProviderDescriptor::new(
            OPENAI,
            endpoint(OPENAI),
            Arc::new(|o: &ResolvedOptions, c: &GatewayConfig| -> GatewayResult<Arc<dyn Provider>> {
                Ok(Arc::new(OpenAiProvider::new(o, c)) as Arc<dyn Provider>)
            }),
        )
        .with_models(capability::table_models(OPENAI))
        .with_prefixes(["gpt-", "chatgpt-", "o1", "o3", "o4"]),
        ProviderDescriptor::new(
            OLLAMA,
            endpoint(OLLAMA),
            Arc::new(|o: &ResolvedOptions, c: &GatewayConfig| -> GatewayResult<Arc<dyn Provider>> {
                Ok(Arc::new(OllamaProvider::new(o, c)) as Arc<dyn Provider>)
            }),
        )
        .with_models(capability::table_models(OLLAMA))
        .with_prefixes([
            "llama", "qwen", "mistral", "mixtral", "codellama", "deepseek", "phi", "gemma",
        ])
        .with_tagged_names(),
        ProviderDescriptor::new(
            MOCK,
            endpoint(MOCK),
            Arc::new(|o: &ResolvedOptions, _: &GatewayConfig| -> GatewayResult<Arc<dyn Provider>> {
                Ok(Arc::new(MockProvider::from_options(o)?) as Arc<dyn Provider>)
            }),
        )
        .with_models(capability::table_models(MOCK))
        .with_prefixes([MOCK]),
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::with_defaults(GatewayConfig::default()).unwrap()
    }

    #[test]
    fn test_builtins_registered() {
        assert_eq!(
            registry().providers(),
            vec!["anthropic", "mock", "ollama", "openai"]
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = GatewayConfig {
            default_max_tokens: 0,
            ..GatewayConfig::default()
        };
        let err = ProviderRegistry::with_defaults(config).err().unwrap();
        assert!(err.to_string().contains("default_max_tokens"));
    }

    #[test]
    fn test_is_compatible() {
        let r = registry();
        assert!(r.is_compatible("anthropic", "claude-3-5-sonnet-20241022"));
        assert!(r.is_compatible("openai", "gpt-4o-mini"));
        assert!(r.is_compatible("openai", "o3-mini"));
        assert!(r.is_compatible("ollama", "llama3.1:70b"));
        assert!(r.is_compatible("ollama", "my-finetune:latest"));
        assert!(r.is_compatible("mock", "mock-anything"));
        assert!(!r.is_compatible("openai", "claude-3-opus"));
        assert!(!r.is_compatible("ollama", "gpt-4o"));
        assert!(!r.is_compatible("acme", "gpt-4o"));
    }

    #[test]
    fn test_infer_provider() {
        let r = registry();
        assert_eq!(r.infer_provider("claude-opus-4-20250514").as_deref(), Some("anthropic"));
        assert_eq!(r.infer_provider("gpt-4.1").as_deref(), Some("openai"));
        assert_eq!(r.infer_provider("qwen2.5-coder:7b").as_deref(), Some("ollama"));
        assert_eq!(r.infer_provider("custom:q4").as_deref(), Some("ollama"));
        assert_eq!(r.infer_provider("mock-model").as_deref(), Some("mock"));
        assert_eq!(r.infer_provider("something-else"), None);
    }

    #[test]
    fn test_get_or_create_caches_and_clear_empties() {
        let r = registry();
        let options = ProviderOptions::new().provider("mock");
        let a = r.get_or_create(&options).unwrap();
        let b = r.get_or_create(&options).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(r.cached(), 1);

        let c = r
            .get_or_create(&ProviderOptions::new().model("mock-other"))
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(r.cached(), 2);

        r.clear();
        assert_eq!(r.cached(), 0);
        let d = r.get_or_create(&options).unwrap();
        assert!(!Arc::ptr_eq(&a, &d));
    }

    #[tokio::test]
    async fn test_differing_selections_get_distinct_instances() {
        let r = registry();
        let first = r
            .get_or_create(
                &ProviderOptions::new()
                    .provider("mock")
                    .extra("reply", serde_json::json!("AAA")),
            )
            .unwrap();
        let second = r
            .get_or_create(
                &ProviderOptions::new()
                    .provider("mock")
                    .max_tokens(7)
                    .extra("reply", serde_json::json!("BBB")),
            )
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(r.cached(), 2);

        let req = switchyard_core::Request::from_prompt("hi");
        assert_eq!(first.generate(&req).await.unwrap().content, "AAA");
        assert_eq!(second.generate(&req).await.unwrap().content, "BBB");

        // same selection with extras given in another order still hits
        let a = r
            .get_or_create(
                &ProviderOptions::new()
                    .provider("mock")
                    .extra("reply", serde_json::json!("CCC"))
                    .extra("latency_ms", serde_json::json!(0)),
            )
            .unwrap();
        let b = r
            .get_or_create(
                &ProviderOptions::new()
                    .provider("mock")
                    .extra("latency_ms", serde_json::json!(0))
                    .extra("reply", serde_json::json!("CCC")),
            )
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_register_custom_provider() {
        let r = registry();
        r.register(
            ProviderDescriptor::new(
                "local-mock",
                "mock://elsewhere",
                Arc::new(|o: &ResolvedOptions, _: &GatewayConfig| -> GatewayResult<Arc<dyn Provider>> {
                    Ok(Arc::new(MockProvider::new(o.model.clone()).with_reply("custom"))
                        as Arc<dyn Provider>)
                }),
            )
            .with_models(["house-model"]),
        );
        assert!(r.is_compatible("local-mock", "house-model"));
        let p = r
            .create(&ProviderOptions::new().provider("local-mock"))
            .unwrap();
        assert_eq!(p.model_name(), "house-model");
    }
}
