//! In-memory [`VectorStore`] implementation for testing and embedding in
//! other hosts.
//!
//! Fragments are grouped per partition key in a `HashMap` behind
//! `std::sync::RwLock`, so searches only ever touch one partition.
//! Similarity is brute-force cosine over the partition.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::RetrievalError;
use crate::models::{Fragment, FragmentHit, FragmentSummary};
use crate::search::rank_hits;

use super::VectorStore;

#[derive(Default)]
struct Inner {
    /// partition key → fragment id → fragment
    partitions: HashMap<String, HashMap<String, Fragment>>,
    /// fragment id → partition key
    index: HashMap<String, String>,
}

/// In-memory partitioned store.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Total number of stored fragments across all partitions.
    pub fn len(&self) -> usize {
        self.read().map(|g| g.index.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fragments in one partition.
    pub fn partition_len(&self, partition_key: &str) -> usize {
        self.read()
            .ok()
            .and_then(|g| g.partitions.get(partition_key).map(|p| p.len()))
            .unwrap_or(0)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, RetrievalError> {
        self.inner
            .read()
            .map_err(|_| RetrievalError::Storage("store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, RetrievalError> {
        self.inner
            .write()
            .map_err(|_| RetrievalError::Storage("store lock poisoned".to_string()))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn upsert(&self, fragment: &Fragment) -> Result<(), RetrievalError> {
        let mut inner = self.write()?;
        if let Some(old_key) = inner.index.get(&fragment.id).cloned() {
            if let Some(existing) = inner.partitions.get(&old_key).and_then(|p| p.get(&fragment.id)) {
                if existing.dims() != fragment.dims()
                    || existing.embedding_model_id != fragment.embedding_model_id
                {
                    return Err(RetrievalError::DimensionMismatch {
                        expected: existing.dims(),
                        actual: fragment.dims(),
                    });
                }
            }
            if old_key != fragment.partition_key {
                if let Some(p) = inner.partitions.get_mut(&old_key) {
                    p.remove(&fragment.id);
                }
            }
        }
        inner
            .index
            .insert(fragment.id.clone(), fragment.partition_key.clone());
        inner
            .partitions
            .entry(fragment.partition_key.clone())
            .or_default()
            .insert(fragment.id.clone(), fragment.clone());
        Ok(())
    }

    async fn get(&self, fragment_id: &str) -> Result<Option<Fragment>, RetrievalError> {
        let inner = self.read()?;
        Ok(inner
            .index
            .get(fragment_id)
            .and_then(|key| inner.partitions.get(key))
            .and_then(|p| p.get(fragment_id))
            .cloned())
    }

    async fn search_within_partition(
        &self,
        partition_key: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<FragmentHit>, RetrievalError> {
        let inner = self.read()?;
        let partition = match inner.partitions.get(partition_key) {
            Some(p) => p,
            None => return Ok(Vec::new()),
        };
        let hits: Vec<FragmentHit> = partition
            .values()
            .filter(|f| f.dims() == query.len())
            .map(|f| f.to_hit(cosine_similarity(query, &f.embedding) as f64))
            .collect();
        Ok(rank_hits(hits, k))
    }

    async fn list_partition(
        &self,
        partition_key: &str,
    ) -> Result<Vec<FragmentSummary>, RetrievalError> {
        let inner = self.read()?;
        let mut out: Vec<FragmentSummary> = inner
            .partitions
            .get(partition_key)
            .map(|p| {
                p.values()
                    .map(|f| FragmentSummary {
                        id: f.id.clone(),
                        ordinal: f.ordinal,
                        hash: f.hash.clone(),
                        embedding_model_id: f.embedding_model_id.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| a.ordinal.cmp(&b.ordinal).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn list_sources(&self, tenant_id: &str) -> Result<Vec<String>, RetrievalError> {
        let inner = self.read()?;
        let sources: BTreeSet<String> = inner
            .partitions
            .iter()
            .filter(|(_, p)| !p.is_empty())
            .filter_map(|(_, p)| p.values().next())
            .filter(|f| f.tenant_id == tenant_id)
            .map(|f| f.source_id.clone())
            .collect();
        Ok(sources.into_iter().collect())
    }

    async fn delete(&self, fragment_id: &str) -> Result<bool, RetrievalError> {
        let mut inner = self.write()?;
        let key = match inner.index.remove(fragment_id) {
            Some(k) => k,
            None => return Ok(false),
        };
        if let Some(p) = inner.partitions.get_mut(&key) {
            p.remove(fragment_id);
            if p.is_empty() {
                inner.partitions.remove(&key);
            }
        }
        Ok(true)
    }
}
