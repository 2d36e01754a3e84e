use async_trait::async_trait;
use switchyard_core::{CostEstimate, GatewayResult, Request, Response, TokenUsage};
use switchyard_stream::StreamHandler;

/// The contract every backend adapter, wrapper and group implements.
///
/// To add a backend:
/// 1. Create a module in `backends/`
/// 2. Implement `Provider` for your struct
/// 3. Register a constructor with [`crate::ProviderRegistry::register`]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry name of the backend, e.g. `"anthropic"`.
    fn name(&self) -> &str;

    /// Model this instance calls.
    fn model_name(&self) -> &str;

    /// Generates a complete reply. The caller awaits the whole call.
    async fn generate(&self, request: &Request) -> GatewayResult<Response>;

    /// Starts a streamed reply.
    ///
    /// Returns once the backend has accepted the request; fragments are
    /// produced on a spawned task and read through the handler.
    async fn generate_stream(&self, request: &Request) -> GatewayResult<(Response, StreamHandler)>;

    /// Models the backend offers.
    async fn available_models(&self) -> GatewayResult<Vec<String>>;

    /// Checks that the configured credential is accepted.
    async fn validate_credential(&self) -> GatewayResult<()>;

    /// Prices `usage` for `model`, or for this instance's model.
    fn calculate_cost(&self, usage: &TokenUsage, model: Option<&str>) -> CostEstimate;

    /// How well this instance handles `capability`, from 0 (not at all) to 4.
    fn capability_strength(&self, capability: &str) -> u8;
}
