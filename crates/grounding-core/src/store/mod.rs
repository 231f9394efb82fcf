//! Partitioned vector store abstraction.
//!
//! Fragments live under the composite partition key `tenant_id::source_id`.
//! Every search is partition-local; multi-source queries fan out one
//! [`VectorStore::search_within_partition`] call per source and merge the
//! results (see [`crate::search`]).
//!
//! Writes are idempotent upserts keyed by fragment id, so concurrent
//! upserts of the same id are last-write-wins and need no extra locking.
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;

use crate::error::RetrievalError;
use crate::models::{Fragment, FragmentHit, FragmentSummary};

/// Abstract storage backend for embedded fragments.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorStore::upsert) | Insert or replace a fragment by id |
/// | [`get`](VectorStore::get) | Fetch a fragment by id |
/// | [`search_within_partition`](VectorStore::search_within_partition) | Top-k cosine search inside one partition |
/// | [`list_partition`](VectorStore::list_partition) | Summaries of every fragment in a partition |
/// | [`list_sources`](VectorStore::list_sources) | Source ids holding fragments for a tenant |
/// | [`delete`](VectorStore::delete) | Remove a fragment by id |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace a fragment by its id.
    async fn upsert(&self, fragment: &Fragment) -> Result<(), RetrievalError>;

    async fn get(&self, fragment_id: &str) -> Result<Option<Fragment>, RetrievalError>;

    /// Rank the partition's fragments against `query` and return the best
    /// `k`, sorted by descending score then ascending id.
    ///
    /// Fragments whose embedding dimension differs from the query's are
    /// skipped.
    async fn search_within_partition(
        &self,
        partition_key: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<FragmentHit>, RetrievalError>;

    /// Fragment summaries for one partition, ordered by ordinal.
    async fn list_partition(&self, partition_key: &str)
        -> Result<Vec<FragmentSummary>, RetrievalError>;

    /// Distinct source ids with at least one fragment for `tenant_id`, sorted.
    async fn list_sources(&self, tenant_id: &str) -> Result<Vec<String>, RetrievalError>;

    /// Delete a fragment. Returns whether it existed.
    async fn delete(&self, fragment_id: &str) -> Result<bool, RetrievalError>;
}

#[async_trait]
impl<S: VectorStore + ?Sized> VectorStore for std::sync::Arc<S> {
    async fn upsert(&self, fragment: &Fragment) -> Result<(), RetrievalError> {
        (**self).upsert(fragment).await
    }

    async fn get(&self, fragment_id: &str) -> Result<Option<Fragment>, RetrievalError> {
        (**self).get(fragment_id).await
    }

    async fn search_within_partition(
        &self,
        partition_key: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<FragmentHit>, RetrievalError> {
        (**self).search_within_partition(partition_key, query, k).await
    }

    async fn list_partition(
        &self,
        partition_key: &str,
    ) -> Result<Vec<FragmentSummary>, RetrievalError> {
        (**self).list_partition(partition_key).await
    }

    async fn list_sources(&self, tenant_id: &str) -> Result<Vec<String>, RetrievalError> {
        (**self).list_sources(tenant_id).await
    }

    async fn delete(&self, fragment_id: &str) -> Result<bool, RetrievalError> {
        (**self).delete(fragment_id).await
    }
}
