//! Provider layer of the Switchyard gateway.
//!
//! Backends implement one [`Provider`] trait. A [`ProviderRegistry`] maps
//! names to constructors, completes partial selections through the
//! [`Resolver`], and hands out providers wrapped in a [`ReliableProvider`]
//! (retries plus a circuit breaker). A [`ProviderGroup`] spreads calls over
//! several providers.
//!
//! ```no_run
//! use switchyard_core::Request;
//! use switchyard_llm::{GatewayConfig, Provider, ProviderOptions, ProviderRegistry};
//!
//! # async fn run() -> switchyard_core::GatewayResult<()> {
//! let registry = ProviderRegistry::with_defaults(GatewayConfig::default())?;
//! let provider = registry.get_or_create(&ProviderOptions::new().provider("mock"))?;
//! let reply = provider.generate(&Request::from_prompt("hello")).await?;
//! println!("{}", reply.content);
//! # Ok(())
//! # }
//! ```

/// Backend adapters.
pub mod backends;
pub mod capability;
/// Gateway configuration and provider selections.
pub mod config;
pub mod factory;
pub mod group;
pub mod http;
pub mod pricing;
/// The backend contract.
pub mod provider;
pub mod reliability;
pub mod resolver;
pub mod sse;
/// Usage extraction from backend payloads.
pub mod usage;

pub use backends::anthropic::AnthropicProvider;
pub use backends::mock::MockProvider;
pub use backends::ollama::OllamaProvider;
pub use backends::openai::OpenAiProvider;
pub use config::{GatewayConfig, ProviderOptions, ProviderSettings, ResolvedOptions};
pub use factory::{Constructor, ProviderDescriptor, ProviderRegistry};
pub use group::{GroupStrategy, ProviderGroup};
pub use provider::Provider;
pub use reliability::{
    BreakerPermit, CircuitBreaker, CircuitConfig, CircuitState, ReliableProvider, RetryConfig,
};
pub use resolver::Resolver;
pub use usage::UsageStrategy;
