//! Completes partial provider selections.
//!
//! Priority, highest first:
//! 1. an explicit model (it also overrides a conflicting provider);
//! 2. provider plus capability tag, looked up in the provider's table;
//! 3. configuration defaults;
//! 4. the provider's built-in default model.

use crate::capability;
use crate::config::{ProviderOptions, ResolvedOptions, ANTHROPIC};
use crate::factory::ProviderRegistry;
use switchyard_core::{GatewayError, GatewayResult};
use tracing::{debug, warn};

/// Provider used when neither options nor configuration name one.
pub const DEFAULT_PROVIDER: &str = ANTHROPIC;

/// Fills in [`ProviderOptions`] against a registry and its configuration.
pub struct Resolver<'a> {
    registry: &'a ProviderRegistry,
}

impl<'a> Resolver<'a> {
    /// A resolver over `registry`.
    pub fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Resolves `options` to a concrete provider, model, max tokens and
    /// endpoint. Unknown providers, unknown capability tags and models the
    /// provider cannot serve are Config errors.
    pub fn resolve(&self, options: &ProviderOptions) -> GatewayResult<ResolvedOptions> {
        let config = self.registry.config();
        let requested = normalized(options.provider.as_deref()).map(str::to_ascii_lowercase);
        let model = normalized(options.model.as_deref());
        let capability = normalized(options.capability.as_deref()).map(str::to_ascii_lowercase);

        if let Some(provider) = &requested {
            self.ensure_registered(provider)?;
        }
        if let Some(tag) = &capability {
            if !capability::is_known_tag(tag) {
                return Err(GatewayError::Config(format!(
                    "unknown capability '{tag}', expected one of: {}",
                    capability::CAPABILITY_TAGS.join(", ")
                )));
            }
        }

        let (provider, model) = match (requested, model) {
            (Some(provider), Some(model)) => self.provider_for_model(Some(provider), model)?,
            (None, Some(model)) => self.provider_for_model(None, model)?,
            (Some(provider), None) => {
                let model = self.model_for_provider(&provider, capability.as_deref())?;
                (provider, model)
            }
            (None, None) => {
                let provider = self.default_provider()?;
                self.ensure_default_model_fits(&provider)?;
                let model = self.model_for_provider(&provider, capability.as_deref())?;
                (provider, model)
            }
        };

        if !self.registry.is_compatible(&provider, &model) {
            return Err(GatewayError::Config(format!(
                "model '{model}' is not served by provider '{provider}'"
            )));
        }

        let max_tokens = options.max_tokens.unwrap_or(config.default_max_tokens);
        if max_tokens == 0 {
            return Err(GatewayError::Config("max_tokens must be at least 1".into()));
        }

        let endpoint = match normalized(options.endpoint.as_deref()) {
            Some(endpoint) => endpoint.to_string(),
            None => match config.provider_settings(&provider).base_url {
                Some(url) => url,
                None => self
                    .registry
                    .descriptor(&provider)
                    .map(|d| d.default_endpoint().to_string())
                    .unwrap_or_default(),
            },
        };

        debug!(%provider, %model, max_tokens, %endpoint, "resolved provider options");
        Ok(ResolvedOptions {
            provider,
            model,
            max_tokens,
            endpoint,
            extras: options.extras.clone(),
        })
    }

    fn ensure_registered(&self, provider: &str) -> GatewayResult<()> {
        if self.registry.descriptor(provider).is_some() {
            return Ok(());
        }
        Err(GatewayError::Config(format!(
            "unknown provider '{provider}', registered: {}",
            self.registry.providers().join(", ")
        )))
    }

    /// An explicit model decides the provider. A requested provider that
    /// cannot serve it is overridden when another one can.
    fn provider_for_model(
        &self,
        requested: Option<String>,
        model: &str,
    ) -> GatewayResult<(String, String)> {
        if let Some(provider) = &requested {
            if self.registry.is_compatible(provider, model) {
                return Ok((provider.clone(), model.to_string()));
            }
        }
        match (self.registry.infer_provider(model), requested) {
            (Some(inferred), Some(requested)) => {
                warn!(
                    model,
                    requested = %requested,
                    using = %inferred,
                    "model does not belong to the requested provider, overriding provider"
                );
                Ok((inferred, model.to_string()))
            }
            (Some(inferred), None) => Ok((inferred, model.to_string())),
            (None, Some(requested)) => Err(GatewayError::Config(format!(
                "model '{model}' is not served by provider '{requested}'"
            ))),
            (None, None) => Err(GatewayError::Config(format!(
                "cannot tell which provider serves model '{model}', name the provider"
            ))),
        }
    }

    fn default_provider(&self) -> GatewayResult<String> {
        let config = self.registry.config();
        if let Some(provider) = normalized(config.default_provider.as_deref()) {
            let provider = provider.to_ascii_lowercase();
            self.ensure_registered(&provider)?;
            return Ok(provider);
        }
        if let Some(model) = normalized(config.default_model.as_deref()) {
            if let Some(provider) = self.registry.infer_provider(model) {
                return Ok(provider);
            }
        }
        Ok(DEFAULT_PROVIDER.to_string())
    }

    /// With nothing requested, the configured default model has to be served
    /// by the default provider; a mismatch is a configuration error rather
    /// than a reason to pick another model.
    fn ensure_default_model_fits(&self, provider: &str) -> GatewayResult<()> {
        let config = self.registry.config();
        match normalized(config.default_model.as_deref()) {
            Some(model) if !self.registry.is_compatible(provider, model) => {
                Err(GatewayError::Config(format!(
                    "configured default model '{model}' is not served by default provider '{provider}'"
                )))
            }
            _ => Ok(()),
        }
    }

    fn model_for_provider(&self, provider: &str, capability: Option<&str>) -> GatewayResult<String> {
        let config = self.registry.config();

        if let Some(tag) = capability {
            return self.model_for_capability(provider, tag);
        }
        if let Some(model) = normalized(config.provider_settings(provider).default_model.as_deref()) {
            return Ok(model.to_string());
        }
        if let Some(model) = normalized(config.default_model.as_deref()) {
            if self.registry.is_compatible(provider, model) {
                return Ok(model.to_string());
            }
        }
        if let Some(tag) = normalized(config.default_capability.as_deref()) {
            return self.model_for_capability(provider, &tag.to_ascii_lowercase());
        }
        if let Some(model) = capability::default_model(provider) {
            return Ok(model.to_string());
        }
        self.registry
            .descriptor(provider)
            .and_then(|d| d.models().first().cloned())
            .ok_or_else(|| {
                GatewayError::Config(format!("provider '{provider}' has no default model"))
            })
    }

    fn model_for_capability(&self, provider: &str, tag: &str) -> GatewayResult<String> {
        if let Some(model) = capability::model_for(provider, tag) {
            return Ok(model.to_string());
        }
        if !capability::is_known_tag(tag) {
            return Err(GatewayError::Config(format!("unknown capability '{tag}'")));
        }
        // custom providers have no capability table
        self.registry
            .descriptor(provider)
            .and_then(|d| d.models().first().cloned())
            .ok_or_else(|| {
                GatewayError::Config(format!(
                    "provider '{provider}' has no model for capability '{tag}'"
                ))
            })
    }
}

fn normalized(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
