//! The three built-in derivations: cost, content usage, and health.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::debug;

use grounding_core::models::ChangeEvent;

use super::{Consumer, CostEntry, HealthSample, MetricsSink, UsageSample};
use crate::config::{AnalyticsConfig, ModelPricing};

/// Pricing entry used when a model has no entry of its own.
pub const DEFAULT_PRICING_KEY: &str = "default";

/// Prices each interaction's token usage by model.
pub struct CostConsumer {
    pricing: BTreeMap<String, ModelPricing>,
    sink: Arc<dyn MetricsSink>,
}

impl CostConsumer {
    pub fn new(pricing: BTreeMap<String, ModelPricing>, sink: Arc<dyn MetricsSink>) -> Self {
        Self { pricing, sink }
    }

    /// USD cost of a usage record. Zero tokens cost nothing whatever the
    /// model; otherwise an unpriced model is an error.
    pub fn price(&self, model_id: &str, prompt_tokens: u64, completion_tokens: u64) -> Result<f64> {
        if prompt_tokens == 0 && completion_tokens == 0 {
            return Ok(0.0);
        }
        let p = match self
            .pricing
            .get(model_id)
            .or_else(|| self.pricing.get(DEFAULT_PRICING_KEY))
        {
            Some(p) => p,
            None => bail!("no pricing for model '{}' and no default entry", model_id),
        };
        Ok(prompt_tokens as f64 / 1000.0 * p.input_per_1k
            + completion_tokens as f64 / 1000.0 * p.output_per_1k)
    }
}

#[async_trait]
impl Consumer for CostConsumer {
    fn name(&self) -> &str {
        "cost"
    }

    async fn process(&self, event: &ChangeEvent) -> Result<()> {
        let r = &event.record;
        let usage = &r.raw_usage;
        let cost_usd = self.price(&usage.model_id, usage.prompt_tokens, usage.completion_tokens)?;
        let entry = CostEntry {
            interaction_id: r.interaction_id.clone(),
            tenant_id: r.tenant_id.clone(),
            model_id: usage.model_id.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cost_usd,
            day: usage.timestamp.date_naive(),
        };
        if !self.sink.record_cost(&entry).await? {
            debug!(interaction_id = %r.interaction_id, "cost already recorded");
        }
        Ok(())
    }
}

/// Counts fragment citations and queries per tenant.
pub struct ContentConsumer {
    sink: Arc<dyn MetricsSink>,
}

impl ContentConsumer {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Consumer for ContentConsumer {
    fn name(&self) -> &str {
        "content"
    }

    async fn process(&self, event: &ChangeEvent) -> Result<()> {
        let r = &event.record;
        let fragment_ids: Vec<String> = r
            .fragments_used
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let sample = UsageSample {
            interaction_id: r.interaction_id.clone(),
            tenant_id: r.tenant_id.clone(),
            fragment_ids,
        };
        if !self.sink.record_usage(&sample).await? {
            debug!(interaction_id = %r.interaction_id, "usage already recorded");
        }
        Ok(())
    }
}

/// Per-tenant, per-day outcome counts and latency.
pub struct HealthConsumer {
    sink: Arc<dyn MetricsSink>,
}

impl HealthConsumer {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Consumer for HealthConsumer {
    fn name(&self) -> &str {
        "health"
    }

    async fn process(&self, event: &ChangeEvent) -> Result<()> {
        let r = &event.record;
        let sample = HealthSample {
            interaction_id: r.interaction_id.clone(),
            tenant_id: r.tenant_id.clone(),
            day: r.raw_usage.timestamp.date_naive(),
            outcome: r.outcome,
            latency_ms: r.raw_usage.latency_ms,
        };
        if !self.sink.record_health(&sample).await? {
            debug!(interaction_id = %r.interaction_id, "health already recorded");
        }
        Ok(())
    }
}

/// `cost`, `content`, and `health`, all writing to `sink`.
pub fn default_consumers(config: &AnalyticsConfig, sink: Arc<dyn MetricsSink>) -> Vec<Arc<dyn Consumer>> {
    vec![
        Arc::new(CostConsumer::new(config.pricing.clone(), sink.clone())),
        Arc::new(ContentConsumer::new(sink.clone())),
        Arc::new(HealthConsumer::new(sink)),
    ]
}
