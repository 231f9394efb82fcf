//! SQLite-backed checkpoints, poison queue, and metrics tables.
//!
//! Every `record_*` call runs in one transaction that first claims the
//! `(consumer, interaction_id)` row in `processed`; if the row already
//! exists the derived tables are left untouched.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use grounding_core::models::{ChangeEvent, ContinuationToken, PoisonedEvent};

use super::{
    AnalyticsReport, CheckpointStore, CostEntry, FragmentUsage, HealthRow, HealthSample, MetricsSink,
    PoisonStore, TenantCost, UsageSample,
};
use crate::interactions::FeedEntry;

#[derive(Clone)]
pub struct SqliteAnalytics {
    pool: SqlitePool,
}

impl SqliteAnalytics {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Begin a transaction and claim the idempotency marker. Returns `None`
    /// when the interaction was already applied for `consumer`.
    async fn claim(&self, consumer: &str, interaction_id: &str) -> Result<Option<Transaction<'static, Sqlite>>> {
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query(
            "INSERT OR IGNORE INTO processed (consumer, interaction_id, processed_at) VALUES (?, ?, ?)",
        )
        .bind(consumer)
        .bind(interaction_id)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if claimed == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        Ok(Some(tx))
    }
}

fn row_to_poisoned(row: &SqliteRow) -> Result<PoisonedEvent> {
    let id: i64 = row.get("id");
    let event_json: String = row.get("event_json");
    let quarantined_at: String = row.get("quarantined_at");
    let original_event: Option<ChangeEvent> = serde_json::from_str(&event_json)
        .with_context(|| format!("bad event_json for poisoned event {}", id))?;
    Ok(PoisonedEvent {
        id,
        consumer: row.get("consumer"),
        interaction_id: row.get("interaction_id"),
        token: ContinuationToken(row.get("seq")),
        original_event,
        error_message: row.get("error_message"),
        retry_count: row.get::<i64, _>("retry_count") as u32,
        quarantined_at: DateTime::parse_from_rfc3339(&quarantined_at)
            .with_context(|| format!("bad quarantined_at for poisoned event {}", id))?
            .with_timezone(&Utc),
    })
}

#[async_trait]
impl CheckpointStore for SqliteAnalytics {
    async fn load(&self, consumer: &str) -> Result<ContinuationToken> {
        let token: Option<i64> = sqlx::query_scalar("SELECT token FROM checkpoints WHERE consumer = ?")
            .bind(consumer)
            .fetch_optional(&self.pool)
            .await?;
        Ok(token.map(ContinuationToken).unwrap_or(ContinuationToken::START))
    }

    async fn save(&self, consumer: &str, token: ContinuationToken) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (consumer, token, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(consumer) DO UPDATE SET token = excluded.token, updated_at = excluded.updated_at
            "#,
        )
        .bind(consumer)
        .bind(token.seq())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PoisonStore for SqliteAnalytics {
    async fn quarantine(
        &self,
        consumer: &str,
        entry: &FeedEntry,
        error_message: &str,
        retry_count: u32,
    ) -> Result<PoisonedEvent> {
        sqlx::query(
            r#"
            INSERT INTO poisoned_events (consumer, interaction_id, seq, event_json, error_message,
                                         retry_count, quarantined_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(consumer, interaction_id) DO NOTHING
            "#,
        )
        .bind(consumer)
        .bind(entry.interaction_id())
        .bind(entry.token().seq())
        .bind(serde_json::to_string(&entry.event())?)
        .bind(error_message)
        .bind(retry_count as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM poisoned_events WHERE consumer = ? AND interaction_id = ?")
            .bind(consumer)
            .bind(entry.interaction_id())
            .fetch_one(&self.pool)
            .await?;
        row_to_poisoned(&row)
    }

    async fn list(&self) -> Result<Vec<PoisonedEvent>> {
        let rows = sqlx::query("SELECT * FROM poisoned_events ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_poisoned).collect()
    }

    async fn get(&self, id: i64) -> Result<Option<PoisonedEvent>> {
        let row = sqlx::query("SELECT * FROM poisoned_events WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_poisoned).transpose()
    }

    async fn remove(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM poisoned_events WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl MetricsSink for SqliteAnalytics {
    async fn record_cost(&self, entry: &CostEntry) -> Result<bool> {
        let Some(mut tx) = self.claim("cost", &entry.interaction_id).await? else {
            return Ok(false);
        };
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO cost_metrics (interaction_id, tenant_id, model_id, prompt_tokens,
                                                 completion_tokens, cost_usd, day)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.interaction_id)
        .bind(&entry.tenant_id)
        .bind(&entry.model_id)
        .bind(entry.prompt_tokens as i64)
        .bind(entry.completion_tokens as i64)
        .bind(entry.cost_usd)
        .bind(entry.day.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn record_usage(&self, sample: &UsageSample) -> Result<bool> {
        let Some(mut tx) = self.claim("content", &sample.interaction_id).await? else {
            return Ok(false);
        };
        sqlx::query(
            r#"
            INSERT INTO tenant_query_counts (tenant_id, queries) VALUES (?, 1)
            ON CONFLICT(tenant_id) DO UPDATE SET queries = queries + 1
            "#,
        )
        .bind(&sample.tenant_id)
        .execute(&mut *tx)
        .await?;
        for id in &sample.fragment_ids {
            sqlx::query(
                r#"
                INSERT INTO fragment_usage (fragment_id, tenant_id, uses) VALUES (?, ?, 1)
                ON CONFLICT(fragment_id) DO UPDATE SET uses = uses + 1
                "#,
            )
            .bind(id)
            .bind(&sample.tenant_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn record_health(&self, sample: &HealthSample) -> Result<bool> {
        let Some(mut tx) = self.claim("health", &sample.interaction_id).await? else {
            return Ok(false);
        };
        let mut row = HealthRow::default();
        row.add(sample.outcome, sample.latency_ms);
        sqlx::query(
            r#"
            INSERT INTO health_metrics (tenant_id, day, grounded, ungrounded, generation_timeout,
                                        generation_failed, latency_ms_sum)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id, day) DO UPDATE SET
                grounded = grounded + excluded.grounded,
                ungrounded = ungrounded + excluded.ungrounded,
                generation_timeout = generation_timeout + excluded.generation_timeout,
                generation_failed = generation_failed + excluded.generation_failed,
                latency_ms_sum = latency_ms_sum + excluded.latency_ms_sum
            "#,
        )
        .bind(&sample.tenant_id)
        .bind(sample.day.to_string())
        .bind(row.grounded as i64)
        .bind(row.ungrounded as i64)
        .bind(row.generation_timeout as i64)
        .bind(row.generation_failed as i64)
        .bind(row.latency_ms_sum as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn report(&self, top_fragments: usize) -> Result<AnalyticsReport> {
        let costs: Vec<TenantCost> = sqlx::query(
            r#"
            SELECT tenant_id, COUNT(*) AS interactions, SUM(cost_usd) AS cost_usd
            FROM cost_metrics GROUP BY tenant_id ORDER BY tenant_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| TenantCost {
            tenant_id: r.get("tenant_id"),
            interactions: r.get::<i64, _>("interactions") as u64,
            cost_usd: r.get("cost_usd"),
        })
        .collect();

        let queries: Vec<(String, u64)> = sqlx::query("SELECT tenant_id, queries FROM tenant_query_counts ORDER BY tenant_id")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|r| (r.get("tenant_id"), r.get::<i64, _>("queries") as u64))
            .collect();

        let health: Vec<HealthRow> = sqlx::query("SELECT * FROM health_metrics ORDER BY tenant_id, day")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|r| HealthRow {
                tenant_id: r.get("tenant_id"),
                day: r.get("day"),
                grounded: r.get::<i64, _>("grounded") as u64,
                ungrounded: r.get::<i64, _>("ungrounded") as u64,
                generation_timeout: r.get::<i64, _>("generation_timeout") as u64,
                generation_failed: r.get::<i64, _>("generation_failed") as u64,
                latency_ms_sum: r.get::<i64, _>("latency_ms_sum") as u64,
            })
            .collect();

        let top_fragments: Vec<FragmentUsage> = sqlx::query(
            "SELECT fragment_id, tenant_id, uses FROM fragment_usage ORDER BY uses DESC, fragment_id LIMIT ?",
        )
        .bind(top_fragments as i64)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| FragmentUsage {
            fragment_id: r.get("fragment_id"),
            tenant_id: r.get("tenant_id"),
            uses: r.get::<i64, _>("uses") as u64,
        })
        .collect();

        Ok(AnalyticsReport {
            costs,
            queries,
            health,
            top_fragments,
        })
    }
}
