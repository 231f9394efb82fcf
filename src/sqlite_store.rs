//! SQLite-backed [`VectorStore`] implementation.
//!
//! Every fragment row carries its `partition_key`, and every read filters
//! on it through `idx_fragments_partition`, so a partition search never
//! scans another tenant's or source's rows. Cosine ranking happens in Rust
//! over the partition's vectors.

use std::collections::BTreeSet;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use grounding_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use grounding_core::error::RetrievalError;
use grounding_core::models::{Fragment, FragmentHit, FragmentSummary};
use grounding_core::search::rank_hits;
use grounding_core::store::VectorStore;

/// SQLite implementation of [`VectorStore`] over the `fragments` table.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Fragment counts per partition for one tenant, sorted by key.
    pub async fn partition_sizes(&self, tenant_id: &str) -> Result<Vec<(String, i64)>, RetrievalError> {
        let rows = sqlx::query(
            "SELECT partition_key, COUNT(*) AS n FROM fragments WHERE tenant_id = ? GROUP BY partition_key ORDER BY partition_key",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("partition_key"), r.get::<i64, _>("n")))
            .collect())
    }
}

/// Classify a database error. Lock contention and pool exhaustion are
/// worth retrying; everything else is not.
pub(crate) fn map_sqlx(e: sqlx::Error) -> RetrievalError {
    match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            RetrievalError::TransientRetrieval(e.to_string())
        }
        sqlx::Error::Database(db) => {
            let msg = db.message().to_ascii_lowercase();
            if msg.contains("locked") || msg.contains("busy") {
                RetrievalError::TransientRetrieval(e.to_string())
            } else {
                RetrievalError::Storage(e.to_string())
            }
        }
        _ => RetrievalError::Storage(e.to_string()),
    }
}

fn row_to_fragment(row: &SqliteRow) -> Result<Fragment, RetrievalError> {
    let blob: Vec<u8> = row.get("embedding");
    let tags_json: String = row.get("topic_tags_json");
    let topic_tags: BTreeSet<String> = serde_json::from_str(&tags_json)
        .map_err(|e| RetrievalError::Storage(format!("bad topic_tags_json: {}", e)))?;
    Ok(Fragment {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        source_id: row.get("source_id"),
        partition_key: row.get("partition_key"),
        ordinal: row.get("ordinal"),
        start: row.get::<i64, _>("start_offset") as usize,
        end: row.get::<i64, _>("end_offset") as usize,
        text: row.get("text"),
        hash: row.get("hash"),
        embedding: blob_to_vec(&blob),
        embedding_model_id: row.get("embedding_model_id"),
        citation: row.get("citation"),
        topic_tags,
    })
}

const FRAGMENT_COLUMNS: &str = "id, tenant_id, source_id, partition_key, ordinal, start_offset, \
end_offset, text, hash, embedding, embedding_model_id, citation, topic_tags_json";

#[async_trait]
impl VectorStore for SqliteStore {
    async fn upsert(&self, fragment: &Fragment) -> Result<(), RetrievalError> {
        let now = chrono::Utc::now().timestamp();
        let tags = serde_json::to_string(&fragment.topic_tags)
            .map_err(|e| RetrievalError::Validation(e.to_string()))?;

        // Embedding shape is fixed for the life of an id: the update only
        // applies when model and dims agree with the stored row.
        let result = sqlx::query(
            r#"
            INSERT INTO fragments (id, tenant_id, source_id, partition_key, ordinal,
                                   start_offset, end_offset, text, hash, embedding, dims,
                                   embedding_model_id, citation, topic_tags_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                ordinal = excluded.ordinal,
                end_offset = excluded.end_offset,
                text = excluded.text,
                hash = excluded.hash,
                embedding = excluded.embedding,
                citation = excluded.citation,
                topic_tags_json = excluded.topic_tags_json,
                updated_at = excluded.updated_at
            WHERE fragments.dims = excluded.dims
              AND fragments.embedding_model_id = excluded.embedding_model_id
            "#,
        )
        .bind(&fragment.id)
        .bind(&fragment.tenant_id)
        .bind(&fragment.source_id)
        .bind(&fragment.partition_key)
        .bind(fragment.ordinal)
        .bind(fragment.start as i64)
        .bind(fragment.end as i64)
        .bind(&fragment.text)
        .bind(&fragment.hash)
        .bind(vec_to_blob(&fragment.embedding))
        .bind(fragment.dims() as i64)
        .bind(&fragment.embedding_model_id)
        .bind(&fragment.citation)
        .bind(&tags)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            let stored: Option<i64> = sqlx::query_scalar("SELECT dims FROM fragments WHERE id = ?")
                .bind(&fragment.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)?;
            return Err(RetrievalError::DimensionMismatch {
                expected: stored.unwrap_or_default() as usize,
                actual: fragment.dims(),
            });
        }
        Ok(())
    }

    async fn get(&self, fragment_id: &str) -> Result<Option<Fragment>, RetrievalError> {
        let row = sqlx::query(&format!("SELECT {} FROM fragments WHERE id = ?", FRAGMENT_COLUMNS))
            .bind(fragment_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(row_to_fragment).transpose()
    }

    async fn search_within_partition(
        &self,
        partition_key: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<FragmentHit>, RetrievalError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM fragments WHERE partition_key = ? AND dims = ?",
            FRAGMENT_COLUMNS
        ))
        .bind(partition_key)
        .bind(query.len() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let fragment = row_to_fragment(row)?;
            let score = cosine_similarity(query, &fragment.embedding) as f64;
            hits.push(fragment.to_hit(score));
        }
        Ok(rank_hits(hits, k))
    }

    async fn list_partition(
        &self,
        partition_key: &str,
    ) -> Result<Vec<FragmentSummary>, RetrievalError> {
        let rows = sqlx::query(
            "SELECT id, ordinal, hash, embedding_model_id FROM fragments WHERE partition_key = ? ORDER BY ordinal, id",
        )
        .bind(partition_key)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(rows
            .iter()
            .map(|r| FragmentSummary {
                id: r.get("id"),
                ordinal: r.get("ordinal"),
                hash: r.get("hash"),
                embedding_model_id: r.get("embedding_model_id"),
            })
            .collect())
    }

    async fn list_sources(&self, tenant_id: &str) -> Result<Vec<String>, RetrievalError> {
        sqlx::query_scalar(
            "SELECT DISTINCT source_id FROM fragments WHERE tenant_id = ? ORDER BY source_id",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)
    }

    async fn delete(&self, fragment_id: &str) -> Result<bool, RetrievalError> {
        let result = sqlx::query("DELETE FROM fragments WHERE id = ?")
            .bind(fragment_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_schema;
    use grounding_core::models::{content_hash, fragment_id, partition_key};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn frag(tenant: &str, source: &str, ordinal: i64, text: &str, embedding: Vec<f32>) -> Fragment {
        let start = ordinal as usize * 100;
        Fragment {
            id: fragment_id(tenant, source, start, "test-model"),
            tenant_id: tenant.to_string(),
            source_id: source.to_string(),
            partition_key: partition_key(tenant, source),
            ordinal,
            start,
            end: start + text.len(),
            text: text.to_string(),
            hash: content_hash(text),
            embedding,
            embedding_model_id: "test-model".to_string(),
            citation: format!("{} #{}", source, ordinal + 1),
            topic_tags: ["virtue".to_string()].into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn test_upsert_get_roundtrip() {
        let store = store().await;
        let f = frag("sage", "meditations", 0, "patience is a virtue", vec![0.6, 0.8]);
        store.upsert(&f).await.unwrap();
        store.upsert(&f).await.unwrap();

        let loaded = store.get(&f.id).await.unwrap().unwrap();
        assert_eq!(loaded, f);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fragments")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_upsert_rejects_dimension_change() {
        let store = store().await;
        let f = frag("sage", "meditations", 0, "text", vec![1.0, 0.0]);
        store.upsert(&f).await.unwrap();
        let mut wider = f.clone();
        wider.embedding = vec![1.0, 0.0, 0.0];
        let err = store.upsert(&wider).await.unwrap_err();
        assert_eq!(
            err,
            RetrievalError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        );
    }

    #[tokio::test]
    async fn test_search_within_partition_orders_and_isolates() {
        let store = store().await;
        let a0 = frag("sage", "a", 0, "a0", vec![1.0, 0.0]);
        let a1 = frag("sage", "a", 1, "a1", vec![0.6, 0.8]);
        let b0 = frag("sage", "b", 0, "b0", vec![1.0, 0.0]);
        for f in [&a0, &a1, &b0] {
            store.upsert(f).await.unwrap();
        }

        let hits = store
            .search_within_partition(&partition_key("sage", "a"), &[1.0, 0.0], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, a0.id);
        assert!(hits[0].score >= hits[1].score);
        assert!(hits.iter().all(|h| h.source_id == "a"));
    }

    #[tokio::test]
    async fn test_list_sources_delete_and_sizes() {
        let store = store().await;
        let f = frag("sage", "b", 0, "x", vec![1.0]);
        store.upsert(&f).await.unwrap();
        store.upsert(&frag("sage", "a", 0, "y", vec![1.0])).await.unwrap();
        store.upsert(&frag("coach", "c", 0, "z", vec![1.0])).await.unwrap();

        assert_eq!(store.list_sources("sage").await.unwrap(), vec!["a", "b"]);
        assert_eq!(
            store.partition_sizes("sage").await.unwrap(),
            vec![("sage::a".to_string(), 1), ("sage::b".to_string(), 1)]
        );

        assert!(store.delete(&f.id).await.unwrap());
        assert!(!store.delete(&f.id).await.unwrap());
        assert_eq!(store.list_sources("sage").await.unwrap(), vec!["a"]);
        assert!(store
            .list_partition(&partition_key("sage", "b"))
            .await
            .unwrap()
            .is_empty());
    }
}
