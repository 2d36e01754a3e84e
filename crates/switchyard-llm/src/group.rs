//! A [`Provider`] that spreads calls over several members.

use crate::provider::Provider;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use switchyard_core::{
    CostEstimate, GatewayError, GatewayResult, Request, Response, TokenUsage,
};
use switchyard_stream::StreamHandler;
use tracing::{info, warn};

/// Output tokens assumed when pricing a request that sets no max tokens.
const DEFAULT_OUTPUT_ESTIMATE: u64 = 256;

/// How a [`ProviderGroup`] orders its members for a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStrategy {
    /// Members in the order given.
    #[default]
    Failover,
    /// A rotating starting member.
    RoundRobin,
    /// A fresh shuffle per call.
    Random,
    /// Cheapest estimated cost first.
    CostOptimized,
    /// Strongest at the request's task type first.
    TaskAware,
}

impl GroupStrategy {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            GroupStrategy::Failover => "failover",
            GroupStrategy::RoundRobin => "round_robin",
            GroupStrategy::Random => "random",
            GroupStrategy::CostOptimized => "cost_optimized",
            GroupStrategy::TaskAware => "task_aware",
        }
    }
}

impl fmt::Display for GroupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupStrategy {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "failover" | "fallback" => Ok(GroupStrategy::Failover),
            "round_robin" => Ok(GroupStrategy::RoundRobin),
            "random" => Ok(GroupStrategy::Random),
            "cost_optimized" | "cost" => Ok(GroupStrategy::CostOptimized),
            "task_aware" | "task" => Ok(GroupStrategy::TaskAware),
            other => Err(GatewayError::Config(format!(
                "unknown group strategy '{other}'"
            ))),
        }
    }
}

/// Ordered members plus a strategy.
///
/// Each call tries candidates in strategy order, moving on after a failure,
/// and tries every member at most once. When all fail, the last error is
/// returned. Members are usually reliable providers, so each attempt here
/// already includes that member's retries.
pub struct ProviderGroup {
    members: Vec<Arc<dyn Provider>>,
    strategy: GroupStrategy,
    cursor: AtomicUsize,
}

impl ProviderGroup {
    /// A group over `members`, which must not be empty.
    pub fn new(members: Vec<Arc<dyn Provider>>, strategy: GroupStrategy) -> GatewayResult<Self> {
        if members.is_empty() {
            return Err(GatewayError::Config(
                "a provider group needs at least one member".into(),
            ));
        }
        Ok(Self {
            members,
            strategy,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Members in configured order.
    pub fn members(&self) -> &[Arc<dyn Provider>] {
        &self.members
    }

    /// The ordering strategy.
    pub fn strategy(&self) -> GroupStrategy {
        self.strategy
    }

    /// Member indices in the order a call for `request` would try them.
    pub fn candidate_order(&self, request: &Request) -> Vec<usize> {
        let n = self.members.len();
        let mut order: Vec<usize> = (0..n).collect();
        match self.strategy {
            GroupStrategy::Failover => {}
            GroupStrategy::RoundRobin => {
                let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
                order.rotate_left(start);
            }
            GroupStrategy::Random => order.shuffle(&mut rand::thread_rng()),
            GroupStrategy::CostOptimized => {
                let task = request.task_type();
                let output = request
                    .max_tokens
                    .map_or(DEFAULT_OUTPUT_ESTIMATE, u64::from);
                let usage = TokenUsage::new(request.estimated_input_tokens(), output);
                let scored: Vec<(f64, u8)> = self
                    .members
                    .iter()
                    .map(|m| {
                        (
                            m.calculate_cost(&usage, None).total_cost,
                            m.capability_strength(task.as_str()),
                        )
                    })
                    .collect();
                order.sort_by(|&a, &b| {
                    scored[a]
                        .0
                        .partial_cmp(&scored[b].0)
                        .unwrap_or(CmpOrdering::Equal)
                        .then(scored[b].1.cmp(&scored[a].1))
                });
            }
            GroupStrategy::TaskAware => {
                let task = request.task_type();
                let scores: Vec<u8> = self
                    .members
                    .iter()
                    .map(|m| m.capability_strength(task.as_str()))
                    .collect();
                if scores.iter().any(|s| *s > 0) {
                    // stable: equal scores keep configured order
                    order.sort_by(|&a, &b| scores[b].cmp(&scores[a]));
                }
            }
        }
        order
    }

    async fn first_success<T, F, Fut>(&self, request: &Request, operation: &'static str, call: F) -> GatewayResult<T>
    where
        F: Fn(Arc<dyn Provider>) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = GatewayResult<T>> + Send,
        T: Send,
    {
        let order = self.candidate_order(request);
        let mut last_err = None;
        for (tried, idx) in order.into_iter().enumerate() {
            let member = self.members[idx].clone();
            let name = member.name().to_string();
            let model = member.model_name().to_string();
            match call(member).await {
                Ok(value) => {
                    if tried > 0 {
                        info!(provider = %name, model = %model, operation, tried, "group call served by fallback member");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    warn!(provider = %name, model = %model, operation, error = %e, "group member failed, trying next");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            GatewayError::Config("a provider group needs at least one member".into())
        }))
    }
}

#[async_trait]
impl Provider for ProviderGroup {
    fn name(&self) -> &str {
        "group"
    }

    /// The first configured member's model.
    fn model_name(&self) -> &str {
        self.members[0].model_name()
    }

    async fn generate(&self, request: &Request) -> GatewayResult<Response> {
        self.first_success(request, "generate", |member| async move {
            member.generate(request).await
        })
        .await
    }

    async fn generate_stream(&self, request: &Request) -> GatewayResult<(Response, StreamHandler)> {
        self.first_success(request, "generate_stream", |member| async move {
            member.generate_stream(request).await
        })
        .await
    }

    async fn available_models(&self) -> GatewayResult<Vec<String>> {
        let mut models: Vec<String> = Vec::new();
        let mut last_err = None;
        let mut any_ok = false;
        for member in &self.members {
            match member.available_models().await {
                Ok(list) => {
                    any_ok = true;
                    for model in list {
                        if !models.contains(&model) {
                            models.push(model);
                        }
                    }
                }
                Err(e) => {
                    warn!(provider = %member.name(), error = %e, "listing models failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if !any_ok => Err(e),
            _ => Ok(models),
        }
    }

    async fn validate_credential(&self) -> GatewayResult<()> {
        let mut last_err = None;
        for member in &self.members {
            match member.validate_credential().await {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            GatewayError::Config("a provider group needs at least one member".into())
        }))
    }

    /// Priced by the member serving `model`, or the first member.
    fn calculate_cost(&self, usage: &TokenUsage, model: Option<&str>) -> CostEstimate {
        let member = model
            .and_then(|m| self.members.iter().find(|p| p.model_name() == m))
            .unwrap_or(&self.members[0]);
        member.calculate_cost(usage, model)
    }

    fn capability_strength(&self, capability: &str) -> u8 {
        self.members
            .iter()
            .map(|m| m.capability_strength(capability))
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backends::mock::MockProvider;
    use switchyard_core::{Pricing, TaskType};

    fn arc(p: MockProvider) -> Arc<dyn Provider> {
        Arc::new(p)
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("round-robin".parse::<GroupStrategy>().unwrap(), GroupStrategy::RoundRobin);
        assert_eq!("Task_Aware".parse::<GroupStrategy>().unwrap(), GroupStrategy::TaskAware);
        assert!("best".parse::<GroupStrategy>().is_err());
        assert_eq!(GroupStrategy::CostOptimized.to_string(), "cost_optimized");
    }

    #[test]
    fn test_empty_group_is_rejected() {
        assert!(ProviderGroup::new(Vec::new(), GroupStrategy::Failover).is_err());
    }

    #[test]
    fn test_round_robin_rotates() {
        let g = ProviderGroup::new(
            vec![arc(MockProvider::new("a")), arc(MockProvider::new("b")), arc(MockProvider::new("c"))],
            GroupStrategy::RoundRobin,
        )
        .unwrap();
        let req = Request::from_prompt("x");
        assert_eq!(g.candidate_order(&req), vec![0, 1, 2]);
        assert_eq!(g.candidate_order(&req), vec![1, 2, 0]);
        assert_eq!(g.candidate_order(&req), vec![2, 0, 1]);
        assert_eq!(g.candidate_order(&req), vec![0, 1, 2]);
    }

    #[test]
    fn test_random_is_a_permutation() {
        let g = ProviderGroup::new(
            vec![arc(MockProvider::new("a")), arc(MockProvider::new("b")), arc(MockProvider::new("c"))],
            GroupStrategy::Random,
        )
        .unwrap();
        let mut order = g.candidate_order(&Request::from_prompt("x"));
        order.sort_unstable();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_cost_optimized_prefers_cheap_then_strong() {
        let g = ProviderGroup::new(
            vec![
                arc(MockProvider::new("pricey").with_pricing(Pricing::new(10.0, 30.0))),
                arc(MockProvider::new("free-weak")),
                arc(MockProvider::new("free-strong").with_strength("code", 4)),
            ],
            GroupStrategy::CostOptimized,
        )
        .unwrap();
        let req = Request::from_prompt("x").with_task_type(TaskType::Code);
        assert_eq!(g.candidate_order(&req), vec![2, 1, 0]);
    }

    #[test]
    fn test_task_aware_sorts_by_strength_or_falls_back() {
        let g = ProviderGroup::new(
            vec![
                arc(MockProvider::new("generalist").with_strength("code", 1)),
                arc(MockProvider::new("coder").with_strength("code", 4)),
            ],
            GroupStrategy::TaskAware,
        )
        .unwrap();
        let code = Request::from_prompt("x").with_task_type(TaskType::Code);
        assert_eq!(g.candidate_order(&code), vec![1, 0]);

        let g = ProviderGroup::new(
            vec![
                arc(MockProvider::new("zz-a").with_strength("creative", 0)),
                arc(MockProvider::new("zz-b").with_strength("creative", 0)),
            ],
            GroupStrategy::TaskAware,
        )
        .unwrap();
        let creative = Request::from_prompt("x").with_task_type(TaskType::Creative);
        assert_eq!(g.candidate_order(&creative), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_strength_and_models_aggregate() {
        let g = ProviderGroup::new(
            vec![
                arc(MockProvider::new("a").with_strength("reasoning", 2)),
                arc(MockProvider::new("b").with_strength("reasoning", 3)),
                arc(MockProvider::new("a")),
            ],
            GroupStrategy::Failover,
        )
        .unwrap();
        assert_eq!(g.capability_strength("reasoning"), 3);
        assert_eq!(g.available_models().await.unwrap(), vec!["a", "b"]);
        assert!(g.validate_credential().await.is_ok());
        assert_eq!(g.model_name(), "a");
    }
}
