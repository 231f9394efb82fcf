//! Change-stream analytics processor.
//!
//! Each registered [`Consumer`] (cost, content, health) reads the
//! interaction change stream through its own cursor and moves through
//! `Reading → Processing → Committed | RetryScheduled | Poisoned`:
//!
//! - **Reading**: load the consumer's checkpoint and pull the next batch.
//! - **Processing**: run the consumer on one event. Failures are retried
//!   after `base × attempt`; other consumers are unaffected.
//! - **Committed**: the checkpoint moves past the event.
//! - **Poisoned**: after `max_retries` retries the event and its error go
//!   to the [`PoisonStore`] once, and the checkpoint still moves past it.
//!   A stream row that cannot be decoded is poisoned on first sight.
//!
//! Delivery is at-least-once: a crash between processing and checkpoint
//! re-delivers the event, so sinks are idempotent on
//! `(consumer, interaction_id)`.
//!
//! [`Processor::run`] supervises one task per consumer. A failed cycle is
//! logged and the loop carries on; a panicking consumer counts as a
//! processing failure for that event.

pub mod consumers;
pub mod memory;
pub mod sqlite;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use grounding_core::models::{ChangeEvent, ContinuationToken, InteractionOutcome, PoisonedEvent};

use crate::interactions::{ChangeFeed, FeedEntry};
use crate::retry::{retry_with, RetryPolicy};

/// One derivation over the change stream.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Stable name; keys the checkpoint and poison entries.
    fn name(&self) -> &str;
    async fn process(&self, event: &ChangeEvent) -> Result<()>;
}

/// Per-consumer cursor persistence.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The consumer's position, or [`ContinuationToken::START`].
    async fn load(&self, consumer: &str) -> Result<ContinuationToken>;
    async fn save(&self, consumer: &str, token: ContinuationToken) -> Result<()>;
}

/// Quarantine for events that exhausted their retry budget.
#[async_trait]
pub trait PoisonStore: Send + Sync {
    /// Quarantine a stream entry for a consumer. Quarantining the same
    /// `(consumer, interaction_id)` again returns the existing entry.
    async fn quarantine(
        &self,
        consumer: &str,
        entry: &FeedEntry,
        error_message: &str,
        retry_count: u32,
    ) -> Result<PoisonedEvent>;
    async fn list(&self) -> Result<Vec<PoisonedEvent>>;
    async fn get(&self, id: i64) -> Result<Option<PoisonedEvent>>;
    /// Delete an entry. Returns whether it existed.
    async fn remove(&self, id: i64) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEntry {
    pub interaction_id: String,
    pub tenant_id: String,
    pub model_id: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    pub day: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSample {
    pub interaction_id: String,
    pub tenant_id: String,
    /// Distinct fragment ids cited by the interaction.
    pub fragment_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSample {
    pub interaction_id: String,
    pub tenant_id: String,
    pub day: NaiveDate,
    pub outcome: InteractionOutcome,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TenantCost {
    pub tenant_id: String,
    pub interactions: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthRow {
    pub tenant_id: String,
    pub day: String,
    pub grounded: u64,
    pub ungrounded: u64,
    pub generation_timeout: u64,
    pub generation_failed: u64,
    pub latency_ms_sum: u64,
}

impl HealthRow {
    pub fn total(&self) -> u64 {
        self.grounded + self.ungrounded + self.generation_timeout + self.generation_failed
    }

    pub(crate) fn add(&mut self, outcome: InteractionOutcome, latency_ms: u64) {
        match outcome {
            InteractionOutcome::Grounded => self.grounded += 1,
            InteractionOutcome::Ungrounded => self.ungrounded += 1,
            InteractionOutcome::GenerationTimeout => self.generation_timeout += 1,
            InteractionOutcome::GenerationFailed => self.generation_failed += 1,
        }
        self.latency_ms_sum += latency_ms;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FragmentUsage {
    pub fragment_id: String,
    pub tenant_id: String,
    pub uses: u64,
}

/// Snapshot of the derived analytics tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalyticsReport {
    pub costs: Vec<TenantCost>,
    /// `(tenant_id, queries)`, sorted by tenant.
    pub queries: Vec<(String, u64)>,
    pub health: Vec<HealthRow>,
    /// Most-cited fragments, most uses first.
    pub top_fragments: Vec<FragmentUsage>,
}

/// Derived-metrics storage. Each `record_*` call is applied at most once
/// per interaction and returns `false` when it was already applied.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record_cost(&self, entry: &CostEntry) -> Result<bool>;
    async fn record_usage(&self, sample: &UsageSample) -> Result<bool>;
    async fn record_health(&self, sample: &HealthSample) -> Result<bool>;
    async fn report(&self, top_fragments: usize) -> Result<AnalyticsReport>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorParams {
    pub batch_size: usize,
    /// Linear retry: delay is `base_delay × attempt`.
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    /// Consumers allowed to process a batch at the same time.
    pub workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ConsumerState {
    Idle,
    Reading,
    Processing,
    RetryScheduled { attempt: u32 },
    Committed,
    Poisoned,
}

/// Counts from one read-process-checkpoint cycle (or a sum of cycles).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub read: usize,
    pub committed: usize,
    pub poisoned: usize,
}

impl std::ops::AddAssign for CycleReport {
    fn add_assign(&mut self, other: Self) {
        self.read += other.read;
        self.committed += other.committed;
        self.poisoned += other.poisoned;
    }
}

pub struct Processor {
    feed: Arc<dyn ChangeFeed>,
    checkpoints: Arc<dyn CheckpointStore>,
    poison: Arc<dyn PoisonStore>,
    consumers: Vec<Arc<dyn Consumer>>,
    params: ProcessorParams,
    permits: Arc<Semaphore>,
    states: Mutex<HashMap<String, ConsumerState>>,
}

impl Processor {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        checkpoints: Arc<dyn CheckpointStore>,
        poison: Arc<dyn PoisonStore>,
        consumers: Vec<Arc<dyn Consumer>>,
        params: ProcessorParams,
    ) -> Self {
        let states = consumers
            .iter()
            .map(|c| (c.name().to_string(), ConsumerState::Idle))
            .collect();
        Self {
            feed,
            checkpoints,
            poison,
            consumers,
            permits: Arc::new(Semaphore::new(params.workers.max(1))),
            params,
            states: Mutex::new(states),
        }
    }

    pub fn consumer_names(&self) -> Vec<String> {
        self.consumers.iter().map(|c| c.name().to_string()).collect()
    }

    /// Last state reported by a consumer.
    pub fn state(&self, consumer: &str) -> Option<ConsumerState> {
        self.states.lock().ok()?.get(consumer).copied()
    }

    fn set_state(&self, consumer: &str, state: ConsumerState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(consumer.to_string(), state);
        }
    }

    fn consumer(&self, name: &str) -> Option<&Arc<dyn Consumer>> {
        self.consumers.iter().find(|c| c.name() == name)
    }

    /// Run one event through a consumer with the retry policy. A panic in
    /// the consumer is reported as an error.
    async fn process_with_retry(&self, consumer: &Arc<dyn Consumer>, event: &ChangeEvent) -> Result<()> {
        let name = consumer.name();
        let policy = self.params.retry;
        retry_with(&policy, |_| true, |attempt| {
            let c = consumer.clone();
            let ev = event.clone();
            async move {
                let state = if attempt == 0 {
                    ConsumerState::Processing
                } else {
                    ConsumerState::RetryScheduled { attempt }
                };
                self.set_state(name, state);
                let result = match tokio::spawn(async move { c.process(&ev).await }).await {
                    Ok(r) => r,
                    Err(join) => Err(anyhow!("consumer panicked: {}", join)),
                };
                if let Err(e) = &result {
                    warn!(
                        consumer = name,
                        interaction_id = %event.record.interaction_id,
                        attempt = attempt + 1,
                        error = %e,
                        "event processing failed"
                    );
                }
                result
            }
        })
        .await
    }

    /// One read-process-checkpoint cycle for one consumer.
    ///
    /// Returns `Err` only when the feed, checkpoint, or poison store
    /// fails; the unconfirmed events are then re-delivered next cycle.
    pub async fn run_cycle(&self, consumer: &Arc<dyn Consumer>) -> Result<CycleReport> {
        let name = consumer.name();
        self.set_state(name, ConsumerState::Reading);
        let mut token = self.checkpoints.load(name).await?;
        let entries = self.feed.read_batch(token, self.params.batch_size).await?;
        let mut report = CycleReport {
            read: entries.len(),
            ..Default::default()
        };
        if entries.is_empty() {
            self.set_state(name, ConsumerState::Idle);
            return Ok(report);
        }

        let _permit = self.permits.acquire().await?;
        for entry in &entries {
            if entry.token() <= token {
                continue;
            }
            // An undecodable row reads the same on every attempt; it is
            // quarantined without retries.
            let outcome = match entry {
                FeedEntry::Event(event) => self
                    .process_with_retry(consumer, event)
                    .await
                    .map_err(|e| (e, self.params.retry.max_retries)),
                FeedEntry::Undecodable { error, .. } => {
                    Err((anyhow!("undecodable change event: {}", error), 0))
                }
            };
            match outcome {
                Ok(()) => {
                    report.committed += 1;
                    self.set_state(name, ConsumerState::Committed);
                }
                Err((e, retries)) => {
                    let poisoned = self
                        .poison
                        .quarantine(name, entry, &format!("{:#}", e), retries)
                        .await?;
                    error!(
                        consumer = name,
                        interaction_id = %entry.interaction_id(),
                        poison_id = poisoned.id,
                        "event quarantined"
                    );
                    report.poisoned += 1;
                    self.set_state(name, ConsumerState::Poisoned);
                }
            }
            self.checkpoints.save(name, entry.token()).await?;
            token = entry.token();
        }

        debug!(consumer = name, read = report.read, committed = report.committed, poisoned = report.poisoned, checkpoint = %token, "cycle complete");
        self.set_state(name, ConsumerState::Idle);
        Ok(report)
    }

    /// Run every consumer until it has caught up with the stream head.
    pub async fn drain(&self) -> Result<BTreeMap<String, CycleReport>> {
        let runs = self.consumers.iter().map(|c| async move {
            let mut total = CycleReport::default();
            loop {
                let r = self.run_cycle(c).await?;
                total += r;
                if r.read < self.params.batch_size {
                    break;
                }
            }
            Ok::<_, anyhow::Error>((c.name().to_string(), total))
        });
        join_all(runs).await.into_iter().collect()
    }

    /// Supervise one task per consumer until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(consumers = ?self.consumer_names(), workers = self.params.workers, "analytics processor started");
        let handles: Vec<_> = self
            .consumers
            .iter()
            .cloned()
            .map(|c| tokio::spawn(self.clone().supervise(c, shutdown.clone())))
            .collect();
        for h in handles {
            if let Err(e) = h.await {
                error!(error = %e, "analytics supervisor task ended abnormally");
            }
        }
        info!("analytics processor stopped");
        Ok(())
    }

    async fn supervise(self: Arc<Self>, consumer: Arc<dyn Consumer>, mut shutdown: watch::Receiver<bool>) {
        let name = consumer.name().to_string();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let this = self.clone();
            let c = consumer.clone();
            let idle = match tokio::spawn(async move { this.run_cycle(&c).await }).await {
                Ok(Ok(r)) => r.read < self.params.batch_size,
                Ok(Err(e)) => {
                    error!(consumer = %name, error = %e, "analytics cycle failed, continuing");
                    true
                }
                Err(e) => {
                    error!(consumer = %name, error = %e, "analytics cycle panicked, continuing");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.params.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        self.set_state(&name, ConsumerState::Idle);
    }

    /// Re-run a quarantined event through its consumer. On success the
    /// entry is removed; on failure it stays and the error is returned.
    pub async fn replay(&self, poison_id: i64) -> Result<()> {
        let entry = match self.poison.get(poison_id).await? {
            Some(e) => e,
            None => bail!("No poisoned event with id {}", poison_id),
        };
        let consumer = self
            .consumer(&entry.consumer)
            .ok_or_else(|| anyhow!("Unknown consumer '{}'", entry.consumer))?
            .clone();
        let event = match entry.original_event {
            Some(event) => event,
            None => self.reread(entry.token, &entry.interaction_id).await?,
        };
        self.process_with_retry(&consumer, &event).await?;
        self.poison.remove(poison_id).await?;
        info!(consumer = %entry.consumer, poison_id, interaction_id = %entry.interaction_id, "poisoned event replayed");
        Ok(())
    }

    /// Read a quarantined position from the stream again. Succeeds once
    /// the stored row decodes.
    async fn reread(&self, token: ContinuationToken, interaction_id: &str) -> Result<ChangeEvent> {
        let after = ContinuationToken(token.seq() - 1);
        match self.feed.read_batch(after, 1).await?.into_iter().next() {
            Some(FeedEntry::Event(event)) if event.token == token => Ok(event),
            Some(FeedEntry::Undecodable { token: t, error, .. }) if t == token => {
                bail!("interaction {} still cannot be decoded: {}", interaction_id, error)
            }
            _ => bail!("interaction {} is no longer in the change stream", interaction_id),
        }
    }

    /// Drop a quarantined event without processing it.
    pub async fn discard(&self, poison_id: i64) -> Result<bool> {
        let removed = self.poison.remove(poison_id).await?;
        if removed {
            info!(poison_id, "poisoned event discarded");
        }
        Ok(removed)
    }
}
