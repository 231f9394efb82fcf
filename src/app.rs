//! Service wiring shared by the CLI and the HTTP server.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;

use grounding_core::embedding::Embedder;
use grounding_core::store::VectorStore;

use crate::analytics::consumers::default_consumers;
use crate::analytics::sqlite::SqliteAnalytics;
use crate::analytics::Processor;
use crate::answer::AnswerService;
use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::generation::GenerationAdapter;
use crate::ingest::Ingestor;
use crate::interactions::SqliteInteractionLog;
use crate::migrate::apply_schema;
use crate::query::Retriever;
use crate::retry::RetryingStore;
use crate::sqlite_store::SqliteStore;

/// Every service built from one [`Config`] over one database pool.
#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub store: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub ingestor: Ingestor,
    pub answers: AnswerService,
    pub interactions: SqliteInteractionLog,
    pub analytics: SqliteAnalytics,
    fragments: SqliteStore,
}

/// One row of the tenant listing.
#[derive(Debug, Clone, Serialize)]
pub struct TenantSummary {
    pub tenant_id: String,
    pub display_name: String,
    pub configured: bool,
    /// `(partition_key, fragments)` per stored partition.
    pub partitions: Vec<(String, i64)>,
}

impl App {
    /// Connect, apply the schema, and build the services.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        apply_schema(&pool).await?;
        Self::with_pool(config, pool)
    }

    pub fn with_pool(config: &Config, pool: SqlitePool) -> Result<Self> {
        let config = Arc::new(config.clone());
        let fragments = SqliteStore::new(pool.clone());
        let store: Arc<dyn VectorStore> =
            Arc::new(RetryingStore::new(fragments.clone(), config.retrieval_retry()));
        let embedder = create_embedder(&config.embedding)?;
        let ingestor = Ingestor::new(store.clone(), embedder.clone(), config.chunk_params());
        let retriever = Retriever::new(
            store.clone(),
            embedder.clone(),
            Arc::new(config.tenant_directory()),
            Arc::new(config.tenant_table()),
            config.search_params(),
        );
        let interactions = SqliteInteractionLog::new(pool.clone());
        let answers = AnswerService::new(
            retriever,
            config.assembly_params(),
            GenerationAdapter::from_config(&config)?,
            Arc::new(interactions.clone()),
            config.generation.fallback_message.clone(),
        );
        Ok(Self {
            analytics: SqliteAnalytics::new(pool.clone()),
            config,
            pool,
            store,
            embedder,
            ingestor,
            answers,
            interactions,
            fragments,
        })
    }

    pub fn retriever(&self) -> &Retriever {
        self.answers.retriever()
    }

    /// Analytics processor over the interaction log with the built-in
    /// consumers.
    pub fn processor(&self) -> Processor {
        let analytics = Arc::new(self.analytics.clone());
        Processor::new(
            Arc::new(self.interactions.clone()),
            analytics.clone(),
            analytics.clone(),
            default_consumers(&self.config.analytics, analytics),
            self.config.processor_params(),
        )
    }

    /// Configured tenants plus any tenant that only exists in the store.
    pub async fn tenants(&self) -> Result<Vec<TenantSummary>> {
        let table = self.retriever().tenants();
        let mut ids: Vec<String> = table.profiles().iter().map(|p| p.tenant_id.clone()).collect();
        let stored: Vec<String> = sqlx::query_scalar("SELECT DISTINCT tenant_id FROM fragments ORDER BY tenant_id")
            .fetch_all(&self.pool)
            .await?;
        for id in stored {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids.sort();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let profile = table.resolve(&id);
            out.push(TenantSummary {
                configured: table.get(&id).is_some(),
                partitions: self.fragments.partition_sizes(&id).await?,
                display_name: profile.display_name,
                tenant_id: id,
            });
        }
        Ok(out)
    }
}
