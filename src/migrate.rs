use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the database and apply the schema. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply the schema to an open pool.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Fragments, one row per fragment version.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fragments (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            source_id TEXT NOT NULL,
            partition_key TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            embedding_model_id TEXT NOT NULL,
            citation TEXT NOT NULL,
            topic_tags_json TEXT NOT NULL DEFAULT '[]',
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Interaction log; `seq` is the change-stream position.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS interactions (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            interaction_id TEXT NOT NULL UNIQUE,
            tenant_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            query_text TEXT NOT NULL,
            response_text TEXT NOT NULL,
            fragments_used_json TEXT NOT NULL DEFAULT '[]',
            prompt_tokens INTEGER NOT NULL,
            completion_tokens INTEGER NOT NULL,
            model_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            latency_ms INTEGER NOT NULL DEFAULT 0,
            outcome TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One cursor per analytics consumer.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            consumer TEXT PRIMARY KEY,
            token INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS poisoned_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            consumer TEXT NOT NULL,
            interaction_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            event_json TEXT NOT NULL,
            error_message TEXT NOT NULL,
            retry_count INTEGER NOT NULL,
            quarantined_at TEXT NOT NULL,
            UNIQUE(consumer, interaction_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Idempotency markers: an interaction is applied at most once per consumer.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed (
            consumer TEXT NOT NULL,
            interaction_id TEXT NOT NULL,
            processed_at INTEGER NOT NULL,
            PRIMARY KEY (consumer, interaction_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cost_metrics (
            interaction_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            model_id TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL,
            completion_tokens INTEGER NOT NULL,
            cost_usd REAL NOT NULL,
            day TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fragment_usage (
            fragment_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            uses INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tenant_query_counts (
            tenant_id TEXT PRIMARY KEY,
            queries INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS health_metrics (
            tenant_id TEXT NOT NULL,
            day TEXT NOT NULL,
            grounded INTEGER NOT NULL DEFAULT 0,
            ungrounded INTEGER NOT NULL DEFAULT 0,
            generation_timeout INTEGER NOT NULL DEFAULT 0,
            generation_failed INTEGER NOT NULL DEFAULT 0,
            latency_ms_sum INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (tenant_id, day)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_fragments_partition ON fragments(partition_key)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_fragments_tenant ON fragments(tenant_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_poisoned_consumer ON poisoned_events(consumer)")
        .execute(pool)
        .await?;

    Ok(())
}
