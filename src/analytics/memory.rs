//! In-process feed, checkpoint, poison, and metrics stores.
//!
//! Used by tests and by embedders that do not want SQLite. Semantics match
//! the SQLite implementations: appends and `record_*` calls are idempotent
//! per interaction, poison entries are unique per `(consumer, interaction)`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use grounding_core::models::{ChangeEvent, ContinuationToken, InteractionRecord, PoisonedEvent};

use super::{
    AnalyticsReport, CheckpointStore, CostEntry, FragmentUsage, HealthRow, HealthSample, MetricsSink,
    PoisonStore, TenantCost, UsageSample,
};
use crate::interactions::{ChangeFeed, FeedEntry, InteractionLog};

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[derive(Default)]
pub struct MemoryFeed {
    entries: Mutex<Vec<FeedEntry>>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a position whose record cannot be decoded.
    pub fn push_undecodable(&self, interaction_id: &str, error: &str) -> Result<ContinuationToken> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        let token = ContinuationToken(entries.len() as i64 + 1);
        entries.push(FeedEntry::Undecodable {
            token,
            interaction_id: interaction_id.to_string(),
            error: error.to_string(),
        });
        Ok(token)
    }
}

#[async_trait]
impl InteractionLog for MemoryFeed {
    async fn append(&self, record: &InteractionRecord) -> Result<ContinuationToken> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        if let Some(existing) = entries
            .iter()
            .find(|e| e.interaction_id() == record.interaction_id)
        {
            return Ok(existing.token());
        }
        let token = ContinuationToken(entries.len() as i64 + 1);
        entries.push(FeedEntry::Event(ChangeEvent {
            token,
            record: record.clone(),
        }));
        Ok(token)
    }
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn read_batch(&self, after: ContinuationToken, limit: usize) -> Result<Vec<FeedEntry>> {
        let entries = self.entries.lock().map_err(poisoned)?;
        Ok(entries
            .iter()
            .filter(|e| e.token() > after)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn head(&self) -> Result<ContinuationToken> {
        let entries = self.entries.lock().map_err(poisoned)?;
        Ok(entries.last().map(|e| e.token()).unwrap_or(ContinuationToken::START))
    }
}

#[derive(Default)]
pub struct MemoryCheckpoints {
    tokens: Mutex<HashMap<String, ContinuationToken>>,
}

impl MemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoints {
    async fn load(&self, consumer: &str) -> Result<ContinuationToken> {
        let tokens = self.tokens.lock().map_err(poisoned)?;
        Ok(tokens.get(consumer).copied().unwrap_or(ContinuationToken::START))
    }

    async fn save(&self, consumer: &str, token: ContinuationToken) -> Result<()> {
        self.tokens
            .lock()
            .map_err(poisoned)?
            .insert(consumer.to_string(), token);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPoisonStore {
    entries: Mutex<BTreeMap<i64, PoisonedEvent>>,
    next_id: Mutex<i64>,
}

impl MemoryPoisonStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PoisonStore for MemoryPoisonStore {
    async fn quarantine(
        &self,
        consumer: &str,
        entry: &FeedEntry,
        error_message: &str,
        retry_count: u32,
    ) -> Result<PoisonedEvent> {
        let mut entries = self.entries.lock().map_err(poisoned)?;
        if let Some(existing) = entries
            .values()
            .find(|p| p.consumer == consumer && p.interaction_id == entry.interaction_id())
        {
            return Ok(existing.clone());
        }
        let mut next_id = self.next_id.lock().map_err(poisoned)?;
        *next_id += 1;
        let poisoned_event = PoisonedEvent {
            id: *next_id,
            consumer: consumer.to_string(),
            interaction_id: entry.interaction_id().to_string(),
            token: entry.token(),
            original_event: entry.event().cloned(),
            error_message: error_message.to_string(),
            retry_count,
            quarantined_at: Utc::now(),
        };
        entries.insert(poisoned_event.id, poisoned_event.clone());
        Ok(poisoned_event)
    }

    async fn list(&self) -> Result<Vec<PoisonedEvent>> {
        Ok(self.entries.lock().map_err(poisoned)?.values().cloned().collect())
    }

    async fn get(&self, id: i64) -> Result<Option<PoisonedEvent>> {
        Ok(self.entries.lock().map_err(poisoned)?.get(&id).cloned())
    }

    async fn remove(&self, id: i64) -> Result<bool> {
        Ok(self.entries.lock().map_err(poisoned)?.remove(&id).is_some())
    }
}

#[derive(Default)]
struct SinkState {
    applied: HashSet<(&'static str, String)>,
    costs: BTreeMap<String, TenantCost>,
    queries: BTreeMap<String, u64>,
    fragments: HashMap<String, FragmentUsage>,
    health: BTreeMap<(String, String), HealthRow>,
}

impl SinkState {
    /// Marks `(kind, interaction_id)` applied; `false` if it already was.
    fn first_time(&mut self, kind: &'static str, interaction_id: &str) -> bool {
        self.applied.insert((kind, interaction_id.to_string()))
    }
}

#[derive(Default)]
pub struct MemorySink {
    state: Mutex<SinkState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricsSink for MemorySink {
    async fn record_cost(&self, entry: &CostEntry) -> Result<bool> {
        let mut state = self.state.lock().map_err(poisoned)?;
        if !state.first_time("cost", &entry.interaction_id) {
            return Ok(false);
        }
        let row = state
            .costs
            .entry(entry.tenant_id.clone())
            .or_insert_with(|| TenantCost {
                tenant_id: entry.tenant_id.clone(),
                ..Default::default()
            });
        row.interactions += 1;
        row.cost_usd += entry.cost_usd;
        Ok(true)
    }

    async fn record_usage(&self, sample: &UsageSample) -> Result<bool> {
        let mut state = self.state.lock().map_err(poisoned)?;
        if !state.first_time("content", &sample.interaction_id) {
            return Ok(false);
        }
        *state.queries.entry(sample.tenant_id.clone()).or_default() += 1;
        for id in &sample.fragment_ids {
            state
                .fragments
                .entry(id.clone())
                .or_insert_with(|| FragmentUsage {
                    fragment_id: id.clone(),
                    tenant_id: sample.tenant_id.clone(),
                    uses: 0,
                })
                .uses += 1;
        }
        Ok(true)
    }

    async fn record_health(&self, sample: &HealthSample) -> Result<bool> {
        let mut state = self.state.lock().map_err(poisoned)?;
        if !state.first_time("health", &sample.interaction_id) {
            return Ok(false);
        }
        let day = sample.day.to_string();
        state
            .health
            .entry((sample.tenant_id.clone(), day.clone()))
            .or_insert_with(|| HealthRow {
                tenant_id: sample.tenant_id.clone(),
                day,
                ..Default::default()
            })
            .add(sample.outcome, sample.latency_ms);
        Ok(true)
    }

    async fn report(&self, top_fragments: usize) -> Result<AnalyticsReport> {
        let state = self.state.lock().map_err(poisoned)?;
        let mut top: Vec<FragmentUsage> = state.fragments.values().cloned().collect();
        top.sort_by(|a, b| b.uses.cmp(&a.uses).then_with(|| a.fragment_id.cmp(&b.fragment_id)));
        top.truncate(top_fragments);
        Ok(AnalyticsReport {
            costs: state.costs.values().cloned().collect(),
            queries: state.queries.iter().map(|(t, n)| (t.clone(), *n)).collect(),
            health: state.health.values().cloned().collect(),
            top_fragments: top,
        })
    }
}
