//! Similarity ranking and scatter-gather search across partitions.
//!
//! The algorithm operates entirely through the [`VectorStore`] trait. The
//! calling application embeds the query, resolves the tenant's source
//! list, and passes the partition keys here.
//!
//! # Algorithm
//!
//! 1. Fan out one `search_within_partition(key, query, k)` per partition,
//!    at most `max_fanout` in flight.
//! 2. Concatenate the per-partition top-k lists.
//! 3. Re-sort globally by score (desc), then fragment id (asc).
//! 4. Truncate to `top_k`.
//! 5. Drop hits below `min_score`. If nothing survives, the outcome is
//!    ungrounded and carries no fragments.
//!
//! Partition failures never abort the search: they are listed in
//! [`SearchOutcome::partial_failures`], and when every partition fails the
//! outcome carries `error_code = "retrieval_unavailable"`.

use std::cmp::Ordering;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::error::RetrievalError;
use crate::models::FragmentHit;
use crate::store::VectorStore;

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    /// Number of fragments to return after merging.
    pub top_k: usize,
    /// Hits scoring below this are treated as not relevant.
    pub min_score: f64,
    /// Maximum concurrent partition sub-queries.
    pub max_fanout: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.25,
            max_fanout: 8,
        }
    }
}

/// A partition whose sub-query failed.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PartitionFailure {
    pub partition_key: String,
    pub code: String,
    pub message: String,
}

/// Result of a tenant-wide search.
///
/// `grounded == false` means downstream assembly must not present any
/// fragment as supporting evidence; `fragments` is empty in that case.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchOutcome {
    pub fragments: Vec<FragmentHit>,
    pub grounded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub partial_failures: Vec<PartitionFailure>,
}

impl SearchOutcome {
    /// An ungrounded outcome with no fragments.
    pub fn ungrounded(error_code: Option<String>) -> Self {
        Self {
            fragments: Vec::new(),
            grounded: false,
            error_code,
            partial_failures: Vec::new(),
        }
    }
}

/// Total order used for every ranked list: score desc, then id asc.
///
/// NaN scores sort last.
pub fn compare_hits(a: &FragmentHit, b: &FragmentHit) -> Ordering {
    match (a.score.is_nan(), b.score.is_nan()) {
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.id.cmp(&b.id))
}

/// Sort hits with [`compare_hits`] and keep the first `k`.
pub fn rank_hits(mut hits: Vec<FragmentHit>, k: usize) -> Vec<FragmentHit> {
    hits.sort_by(compare_hits);
    hits.truncate(k);
    hits
}

/// Merge per-partition top-k lists into one global top-k.
///
/// The same fragment id appearing twice keeps only its first occurrence
/// after sorting.
pub fn merge_partition_results(per_partition: Vec<Vec<FragmentHit>>, k: usize) -> Vec<FragmentHit> {
    let mut all: Vec<FragmentHit> = per_partition.into_iter().flatten().collect();
    all.sort_by(compare_hits);
    all.dedup_by(|later, earlier| later.id == earlier.id);
    all.truncate(k);
    all
}

/// Keep only hits with `score >= min_score`.
pub fn apply_threshold(hits: Vec<FragmentHit>, min_score: f64) -> Vec<FragmentHit> {
    hits.into_iter().filter(|h| h.score >= min_score).collect()
}

/// Scatter-gather search over the given partitions.
pub async fn search_partitions<S: VectorStore + ?Sized>(
    store: &S,
    partition_keys: &[String],
    query: &[f32],
    params: &SearchParams,
) -> SearchOutcome {
    if partition_keys.is_empty() || params.top_k == 0 {
        return SearchOutcome::ungrounded(None);
    }

    let k = params.top_k;
    let results: Vec<(String, Result<Vec<FragmentHit>, RetrievalError>)> =
        stream::iter(partition_keys.iter().cloned())
            .map(|key| async move {
                let res = store.search_within_partition(&key, query, k).await;
                (key, res)
            })
            .buffer_unordered(params.max_fanout.max(1))
            .collect()
            .await;

    let mut per_partition = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    for (key, res) in results {
        match res {
            Ok(hits) => per_partition.push(hits),
            Err(e) => failures.push(PartitionFailure {
                partition_key: key,
                code: e.code().to_string(),
                message: e.to_string(),
            }),
        }
    }
    failures.sort_by(|a, b| a.partition_key.cmp(&b.partition_key));

    if per_partition.is_empty() {
        let mut outcome = SearchOutcome::ungrounded(Some("retrieval_unavailable".to_string()));
        outcome.partial_failures = failures;
        return outcome;
    }

    let merged = merge_partition_results(per_partition, k);
    let kept = apply_threshold(merged, params.min_score);
    SearchOutcome {
        grounded: !kept.is_empty(),
        fragments: kept,
        error_code: None,
        partial_failures: failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{fragment_id, partition_key, Fragment};
    use crate::store::memory::InMemoryStore;
    use crate::store::VectorStore;
    use crate::models::FragmentSummary;
    use async_trait::async_trait;

    fn hit(id: &str, score: f64) -> FragmentHit {
        FragmentHit {
            id: id.to_string(),
            tenant_id: "t".to_string(),
            source_id: "s".to_string(),
            ordinal: 0,
            start: 0,
            end: 0,
            text: String::new(),
            citation: String::new(),
            topic_tags: Default::default(),
            score,
        }
    }

    fn frag(tenant: &str, source: &str, ordinal: i64, embedding: Vec<f32>) -> Fragment {
        Fragment {
            id: fragment_id(tenant, source, ordinal as usize, "m"),
            tenant_id: tenant.to_string(),
            source_id: source.to_string(),
            partition_key: partition_key(tenant, source),
            ordinal,
            start: 0,
            end: 0,
            text: String::new(),
            hash: String::new(),
            embedding,
            embedding_model_id: "m".to_string(),
            citation: String::new(),
            topic_tags: Default::default(),
        }
    }

    #[test]
    fn test_rank_descending_with_id_tiebreak() {
        let ranked = rank_hits(
            vec![hit("c", 0.5), hit("a", 0.9), hit("b", 0.5), hit("d", 0.1)],
            10,
        );
        let ids: Vec<&str> = ranked.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        for pair in ranked.windows(2) {
            assert!(pair[0].score >= pair[1].score);
            if pair[0].score == pair[1].score {
                assert!(pair[0].id < pair[1].id);
            }
        }
    }

    #[test]
    fn test_rank_nan_sorts_last() {
        let ranked = rank_hits(vec![hit("a", f64::NAN), hit("b", -0.5)], 10);
        assert_eq!(ranked[0].id, "b");
    }

    #[test]
    fn test_merge_resorts_and_truncates() {
        let merged = merge_partition_results(
            vec![
                vec![hit("a1", 0.9), hit("a2", 0.2)],
                vec![hit("b1", 0.8), hit("b2", 0.7)],
            ],
            3,
        );
        let ids: Vec<&str> = merged.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "b1", "b2"]);
    }

    #[test]
    fn test_merge_drops_duplicate_ids() {
        let merged = merge_partition_results(vec![vec![hit("x", 0.5)], vec![hit("x", 0.5)]], 5);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let kept = apply_threshold(vec![hit("a", 0.3), hit("b", 0.29)], 0.3);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "a");
    }

    #[tokio::test]
    async fn test_search_partitions_fans_out_and_merges() {
        let store = InMemoryStore::new();
        store.upsert(&frag("sage", "a", 0, vec![1.0, 0.0])).await.unwrap();
        store.upsert(&frag("sage", "a", 1, vec![0.0, 1.0])).await.unwrap();
        store.upsert(&frag("sage", "b", 0, vec![0.8, 0.6])).await.unwrap();

        let keys = vec![partition_key("sage", "a"), partition_key("sage", "b")];
        let params = SearchParams {
            top_k: 2,
            min_score: 0.1,
            max_fanout: 2,
        };
        let outcome = search_partitions(&store, &keys, &[1.0, 0.0], &params).await;
        assert!(outcome.grounded);
        assert_eq!(outcome.fragments.len(), 2);
        assert_eq!(outcome.fragments[0].source_id, "a");
        assert_eq!(outcome.fragments[1].source_id, "b");
    }

    #[tokio::test]
    async fn test_search_below_threshold_is_ungrounded() {
        let store = InMemoryStore::new();
        store.upsert(&frag("sage", "a", 0, vec![0.0, 1.0])).await.unwrap();
        let keys = vec![partition_key("sage", "a")];
        let params = SearchParams {
            top_k: 3,
            min_score: 0.5,
            max_fanout: 1,
        };
        let outcome = search_partitions(&store, &keys, &[1.0, 0.0], &params).await;
        assert!(!outcome.grounded);
        assert!(outcome.fragments.is_empty());
        assert!(outcome.error_code.is_none());
    }

    #[tokio::test]
    async fn test_search_no_partitions_is_ungrounded() {
        let store = InMemoryStore::new();
        let outcome = search_partitions(&store, &[], &[1.0], &SearchParams::default()).await;
        assert!(!outcome.grounded);
    }

    struct FailingStore;

    #[async_trait]
    impl VectorStore for FailingStore {
        async fn upsert(&self, _f: &Fragment) -> Result<(), RetrievalError> {
            Ok(())
        }
        async fn get(&self, _id: &str) -> Result<Option<Fragment>, RetrievalError> {
            Ok(None)
        }
        async fn search_within_partition(
            &self,
            key: &str,
            _q: &[f32],
            _k: usize,
        ) -> Result<Vec<FragmentHit>, RetrievalError> {
            if key.ends_with("::bad") {
                Err(RetrievalError::TransientRetrieval("timeout".to_string()))
            } else {
                let mut h = hit("ok", 0.9);
                h.source_id = "good".to_string();
                Ok(vec![h])
            }
        }
        async fn list_partition(&self, _k: &str) -> Result<Vec<FragmentSummary>, RetrievalError> {
            Ok(Vec::new())
        }
        async fn list_sources(&self, _t: &str) -> Result<Vec<String>, RetrievalError> {
            Ok(Vec::new())
        }
        async fn delete(&self, _id: &str) -> Result<bool, RetrievalError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_partial_failure_is_reported_not_thrown() {
        let keys = vec!["t::good".to_string(), "t::bad".to_string()];
        let outcome = search_partitions(&FailingStore, &keys, &[1.0], &SearchParams::default()).await;
        assert!(outcome.grounded);
        assert_eq!(outcome.fragments.len(), 1);
        assert_eq!(outcome.partial_failures.len(), 1);
        assert_eq!(outcome.partial_failures[0].partition_key, "t::bad");
        assert_eq!(outcome.partial_failures[0].code, "retrieval_unavailable");
    }

    #[tokio::test]
    async fn test_all_partitions_failing_sets_error_code() {
        let keys = vec!["t::bad".to_string()];
        let outcome = search_partitions(&FailingStore, &keys, &[1.0], &SearchParams::default()).await;
        assert!(!outcome.grounded);
        assert_eq!(outcome.error_code.as_deref(), Some("retrieval_unavailable"));
    }
}
