//! Interaction log and its change stream.
//!
//! Every answered request appends one [`InteractionRecord`]. The store
//! assigns a monotonically increasing sequence number, and that number is
//! the stream position: [`ChangeFeed::read_batch`] replays everything
//! after a [`ContinuationToken`], in order, as many times as asked.
//!
//! Rows are decoded one at a time. A row that no longer decodes is
//! delivered as [`FeedEntry::Undecodable`] at its own position, so the
//! rows behind it still reach consumers.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use grounding_core::models::{
    ChangeEvent, ContinuationToken, InteractionOutcome, InteractionRecord, RawUsage,
};

/// One position in the change stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEntry {
    Event(ChangeEvent),
    /// A stored row that failed to decode.
    Undecodable {
        token: ContinuationToken,
        interaction_id: String,
        error: String,
    },
}

impl FeedEntry {
    pub fn token(&self) -> ContinuationToken {
        match self {
            FeedEntry::Event(e) => e.token,
            FeedEntry::Undecodable { token, .. } => *token,
        }
    }

    pub fn interaction_id(&self) -> &str {
        match self {
            FeedEntry::Event(e) => &e.record.interaction_id,
            FeedEntry::Undecodable { interaction_id, .. } => interaction_id,
        }
    }

    pub fn event(&self) -> Option<&ChangeEvent> {
        match self {
            FeedEntry::Event(e) => Some(e),
            FeedEntry::Undecodable { .. } => None,
        }
    }
}

impl From<ChangeEvent> for FeedEntry {
    fn from(event: ChangeEvent) -> Self {
        FeedEntry::Event(event)
    }
}

/// Append side of the interaction log.
#[async_trait]
pub trait InteractionLog: Send + Sync {
    /// Append a record and return its stream position. Appending the same
    /// `interaction_id` twice keeps the first record and returns its
    /// position.
    async fn append(&self, record: &InteractionRecord) -> Result<ContinuationToken>;
}

/// Ordered, replayable read side of the interaction log.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Up to `limit` entries strictly after `after`, in stream order.
    async fn read_batch(&self, after: ContinuationToken, limit: usize) -> Result<Vec<FeedEntry>>;

    /// Position of the newest entry, or [`ContinuationToken::START`].
    async fn head(&self) -> Result<ContinuationToken>;
}

/// SQLite implementation over the `interactions` table.
#[derive(Clone)]
pub struct SqliteInteractionLog {
    pool: SqlitePool,
}

impl SqliteInteractionLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch one record by id.
    pub async fn get(&self, interaction_id: &str) -> Result<Option<ChangeEvent>> {
        let row = sqlx::query("SELECT * FROM interactions WHERE interaction_id = ?")
            .bind(interaction_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_event).transpose()
    }
}

fn row_to_event(row: &SqliteRow) -> Result<ChangeEvent> {
    let interaction_id: String = row.try_get("interaction_id")?;
    let fragments_json: String = row.try_get("fragments_used_json")?;
    let created_at: String = row.try_get("created_at")?;
    let outcome: String = row.try_get("outcome")?;

    let record = InteractionRecord {
        fragments_used: serde_json::from_str(&fragments_json)
            .with_context(|| format!("bad fragments_used_json for {}", interaction_id))?,
        tenant_id: row.try_get("tenant_id")?,
        session_id: row.try_get("session_id")?,
        query_text: row.try_get("query_text")?,
        response_text: row.try_get("response_text")?,
        raw_usage: RawUsage {
            prompt_tokens: row.try_get::<i64, _>("prompt_tokens")? as u64,
            completion_tokens: row.try_get::<i64, _>("completion_tokens")? as u64,
            model_id: row.try_get("model_id")?,
            timestamp: DateTime::parse_from_rfc3339(&created_at)
                .with_context(|| format!("bad created_at for {}", interaction_id))?
                .with_timezone(&Utc),
            latency_ms: row.try_get::<i64, _>("latency_ms")? as u64,
        },
        outcome: outcome
            .parse::<InteractionOutcome>()
            .map_err(|e| anyhow!("bad outcome for {}: {}", interaction_id, e))?,
        interaction_id,
    };
    Ok(ChangeEvent {
        token: ContinuationToken(row.try_get("seq")?),
        record,
    })
}

/// Decode a row, keeping its position when the rest of it is unreadable.
fn row_to_entry(row: &SqliteRow) -> Result<FeedEntry> {
    let seq: i64 = row.try_get("seq")?;
    match row_to_event(row) {
        Ok(event) => Ok(FeedEntry::Event(event)),
        Err(e) => {
            let interaction_id = row
                .try_get::<String, _>("interaction_id")
                .unwrap_or_else(|_| format!("seq-{}", seq));
            warn!(seq, interaction_id = %interaction_id, error = %format!("{:#}", e), "undecodable interaction row");
            Ok(FeedEntry::Undecodable {
                token: ContinuationToken(seq),
                interaction_id,
                error: format!("{:#}", e),
            })
        }
    }
}

#[async_trait]
impl InteractionLog for SqliteInteractionLog {
    async fn append(&self, record: &InteractionRecord) -> Result<ContinuationToken> {
        sqlx::query(
            r#"
            INSERT INTO interactions (interaction_id, tenant_id, session_id, query_text,
                                      response_text, fragments_used_json, prompt_tokens,
                                      completion_tokens, model_id, created_at, latency_ms, outcome)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(interaction_id) DO NOTHING
            "#,
        )
        .bind(&record.interaction_id)
        .bind(&record.tenant_id)
        .bind(&record.session_id)
        .bind(&record.query_text)
        .bind(&record.response_text)
        .bind(serde_json::to_string(&record.fragments_used)?)
        .bind(record.raw_usage.prompt_tokens as i64)
        .bind(record.raw_usage.completion_tokens as i64)
        .bind(&record.raw_usage.model_id)
        .bind(record.raw_usage.timestamp.to_rfc3339())
        .bind(record.raw_usage.latency_ms as i64)
        .bind(record.outcome.as_str())
        .execute(&self.pool)
        .await?;

        let seq: i64 = sqlx::query_scalar("SELECT seq FROM interactions WHERE interaction_id = ?")
            .bind(&record.interaction_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(ContinuationToken(seq))
    }
}

#[async_trait]
impl ChangeFeed for SqliteInteractionLog {
    async fn read_batch(&self, after: ContinuationToken, limit: usize) -> Result<Vec<FeedEntry>> {
        let rows = sqlx::query("SELECT * FROM interactions WHERE seq > ? ORDER BY seq LIMIT ?")
            .bind(after.seq())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn head(&self) -> Result<ContinuationToken> {
        let seq: Option<i64> = sqlx::query_scalar("SELECT MAX(seq) FROM interactions")
            .fetch_one(&self.pool)
            .await?;
        Ok(ContinuationToken(seq.unwrap_or(0)))
    }
}
