//! Tenant-scoped similarity search.
//!
//! Resolves the tenant's sources (registry first, store as fallback),
//! embeds the query once, and scatter-gathers one partition-local search
//! per source. Store and embedding failures come back as flags on the
//! [`SearchOutcome`]; only malformed requests are errors.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use grounding_core::embedding::Embedder;
use grounding_core::error::RetrievalError;
use grounding_core::models::partition_key;
use grounding_core::search::{search_partitions, SearchOutcome, SearchParams};
use grounding_core::store::VectorStore;
use grounding_core::tenant::{TenantDirectory, TenantProfile, TenantTable};

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub tenant_id: String,
    pub query_text: String,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Clone)]
pub struct Retriever {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    directory: Arc<dyn TenantDirectory>,
    tenants: Arc<TenantTable>,
    defaults: SearchParams,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        directory: Arc<dyn TenantDirectory>,
        tenants: Arc<TenantTable>,
        defaults: SearchParams,
    ) -> Self {
        Self {
            store,
            embedder,
            directory,
            tenants,
            defaults,
        }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn tenants(&self) -> &TenantTable {
        &self.tenants
    }

    /// Effective parameters for a tenant: the tenant's threshold wins over
    /// the global one; `top_k` from the request wins over the default.
    pub fn params_for(&self, profile: &TenantProfile, top_k: Option<usize>) -> SearchParams {
        SearchParams {
            top_k: top_k.unwrap_or(self.defaults.top_k),
            min_score: profile.min_score.unwrap_or(self.defaults.min_score),
            max_fanout: self.defaults.max_fanout,
        }
    }

    /// Source ids to fan out over for `tenant_id`.
    pub async fn sources_for(&self, tenant_id: &str) -> Result<Vec<String>, RetrievalError> {
        match self.directory.tenant(tenant_id).await {
            Ok(Some(tenant)) => return Ok(tenant.associated_source_ids),
            Ok(None) => {}
            Err(e) => warn!(tenant_id, error = %e, "tenant registry lookup failed, using stored sources"),
        }
        self.store.list_sources(tenant_id).await
    }

    pub async fn search(&self, req: &QueryRequest) -> Result<SearchOutcome, RetrievalError> {
        validate(req)?;
        let profile = self.tenants.resolve(&req.tenant_id);
        let params = self.params_for(&profile, req.top_k);

        let sources = match self.sources_for(&req.tenant_id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(tenant_id = %req.tenant_id, error = %e, "could not resolve tenant sources");
                return Ok(SearchOutcome::ungrounded(Some(e.code().to_string())));
            }
        };
        if sources.is_empty() {
            debug!(tenant_id = %req.tenant_id, "tenant has no sources");
            return Ok(SearchOutcome::ungrounded(None));
        }

        let query = match self.embedder.embed(&req.query_text).await {
            Ok(q) => q,
            Err(e) => {
                warn!(tenant_id = %req.tenant_id, error = %e, "query embedding failed");
                return Ok(SearchOutcome::ungrounded(Some("embedding_unavailable".to_string())));
            }
        };

        let keys: Vec<String> = sources
            .iter()
            .map(|s| partition_key(&req.tenant_id, s))
            .collect();
        let outcome = search_partitions(self.store.as_ref(), &keys, &query, &params).await;

        for failure in &outcome.partial_failures {
            warn!(
                tenant_id = %req.tenant_id,
                partition_key = %failure.partition_key,
                code = %failure.code,
                "partition search failed"
            );
        }
        debug!(
            tenant_id = %req.tenant_id,
            partitions = keys.len(),
            hits = outcome.fragments.len(),
            grounded = outcome.grounded,
            "search complete"
        );
        Ok(outcome)
    }
}

fn validate(req: &QueryRequest) -> Result<(), RetrievalError> {
    if req.tenant_id.trim().is_empty() {
        return Err(RetrievalError::Validation("tenant_id must not be empty".to_string()));
    }
    if req.query_text.trim().is_empty() {
        return Err(RetrievalError::Validation("query_text must not be empty".to_string()));
    }
    if req.top_k == Some(0) {
        return Err(RetrievalError::Validation("top_k must be >= 1".to_string()));
    }
    Ok(())
}
