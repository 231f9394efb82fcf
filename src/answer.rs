//! Grounded answering: search, assemble, generate, log.
//!
//! The request path never retries past the generation deadline. A timeout
//! returns the configured fallback reply with outcome
//! `generation_timeout`; any other generation failure is logged with
//! outcome `generation_failed` and returned as an error. Either way an
//! [`InteractionRecord`] is appended for the analytics stream.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use grounding_core::assemble::{assemble, AssemblyParams, Citation};
use grounding_core::error::RetrievalError;
use grounding_core::models::{FragmentHit, InteractionOutcome, InteractionRecord, RawUsage};

use crate::generation::{GenerationAdapter, GenerationError, Usage};
use crate::interactions::InteractionLog;
use crate::query::{QueryRequest, Retriever};

#[derive(Debug, Clone, Deserialize)]
pub struct AnswerRequest {
    pub tenant_id: String,
    /// Conversation id; a fresh one is minted when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    pub query_text: String,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerResponse {
    pub interaction_id: String,
    pub session_id: String,
    pub answer: String,
    pub grounded: bool,
    pub outcome: InteractionOutcome,
    pub citations: Vec<Citation>,
    /// Cited fragment ids confirmed to exist in the store.
    pub fragments_used: Vec<String>,
    pub usage: Option<Usage>,
    pub error_code: Option<String>,
}

#[derive(Debug, Error)]
pub enum AnswerError {
    #[error(transparent)]
    Invalid(#[from] RetrievalError),

    /// Generation failed for a reason other than the deadline. The
    /// interaction was still logged under `interaction_id`.
    #[error("{source}")]
    Generation {
        interaction_id: String,
        source: GenerationError,
    },
}

#[derive(Clone)]
pub struct AnswerService {
    retriever: Retriever,
    assembly: AssemblyParams,
    adapter: GenerationAdapter,
    log: Arc<dyn InteractionLog>,
    fallback_message: String,
}

impl AnswerService {
    pub fn new(
        retriever: Retriever,
        assembly: AssemblyParams,
        adapter: GenerationAdapter,
        log: Arc<dyn InteractionLog>,
        fallback_message: impl Into<String>,
    ) -> Self {
        Self {
            retriever,
            assembly,
            adapter,
            log,
            fallback_message: fallback_message.into(),
        }
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub async fn answer(&self, req: &AnswerRequest) -> Result<AnswerResponse, AnswerError> {
        let started = Instant::now();
        let search = self
            .retriever
            .search(&QueryRequest {
                tenant_id: req.tenant_id.clone(),
                query_text: req.query_text.clone(),
                top_k: req.top_k,
            })
            .await?;

        // Cited fragments must exist when the prompt is built.
        let hits = self.verified_hits(search.fragments).await;
        let grounded = search.grounded && !hits.is_empty();
        let profile = self.retriever.tenants().resolve(&req.tenant_id);
        let prompt = assemble(&profile, &hits, grounded, &req.query_text, &self.assembly);

        let interaction_id = uuid::Uuid::new_v4().to_string();
        let session_id = req
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let (answer, usage, outcome, failure) = match self.adapter.generate(&prompt).await {
            Ok(generation) => {
                let outcome = if prompt.grounded {
                    InteractionOutcome::Grounded
                } else {
                    InteractionOutcome::Ungrounded
                };
                (generation.text, Some(generation.usage), outcome, None)
            }
            Err(e @ GenerationError::Timeout { .. }) => {
                warn!(tenant_id = %req.tenant_id, %interaction_id, error = %e, "generation timed out, returning fallback");
                (
                    self.fallback_message.clone(),
                    None,
                    InteractionOutcome::GenerationTimeout,
                    Some(e),
                )
            }
            Err(e) => {
                warn!(tenant_id = %req.tenant_id, %interaction_id, error = %e, "generation failed");
                (String::new(), None, InteractionOutcome::GenerationFailed, Some(e))
            }
        };

        let fragments_used = prompt.fragment_ids();
        let latency_ms = started.elapsed().as_millis() as u64;
        let record = InteractionRecord {
            interaction_id: interaction_id.clone(),
            tenant_id: req.tenant_id.clone(),
            session_id: session_id.clone(),
            query_text: req.query_text.clone(),
            response_text: answer.clone(),
            fragments_used: fragments_used.clone(),
            raw_usage: RawUsage {
                prompt_tokens: usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
                completion_tokens: usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
                model_id: usage
                    .as_ref()
                    .map(|u| u.model.clone())
                    .unwrap_or_else(|| self.adapter.model_name().to_string()),
                timestamp: Utc::now(),
                latency_ms,
            },
            outcome,
        };
        if let Err(e) = self.log.append(&record).await {
            warn!(%interaction_id, error = %e, "failed to log interaction");
        }
        info!(
            tenant_id = %req.tenant_id,
            %interaction_id,
            outcome = outcome.as_str(),
            fragments = fragments_used.len(),
            latency_ms,
            "answered"
        );

        match failure {
            Some(source) if outcome == InteractionOutcome::GenerationFailed => {
                Err(AnswerError::Generation {
                    interaction_id,
                    source,
                })
            }
            failure => Ok(AnswerResponse {
                interaction_id,
                session_id,
                answer,
                grounded: prompt.grounded,
                outcome,
                citations: prompt.citations,
                fragments_used,
                usage,
                error_code: failure
                    .map(|e| e.code().to_string())
                    .or(search.error_code),
            }),
        }
    }

    /// Keep only hits the store can still resolve.
    async fn verified_hits(&self, hits: Vec<FragmentHit>) -> Vec<FragmentHit> {
        let mut kept = Vec::with_capacity(hits.len());
        for hit in hits {
            match self.retriever.store().get(&hit.id).await {
                Ok(Some(_)) => kept.push(hit),
                Ok(None) => warn!(fragment_id = %hit.id, "search hit no longer exists, dropping"),
                Err(e) => warn!(fragment_id = %hit.id, error = %e, "could not verify search hit, dropping"),
            }
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::memory::MemoryFeed;
    use crate::generation::{EchoGenerator, Generation, Generator, ECHO_UNGROUNDED_REPLY};
    use crate::ingest::{IngestMetadata, Ingestor};
    use crate::interactions::ChangeFeed;
    use crate::retry::{Backoff, RetryPolicy};
    use async_trait::async_trait;
    use grounding_core::assemble::AssembledPrompt;
    use grounding_core::chunk::ChunkParams;
    use grounding_core::embedding::{Embedder, HashingEmbedder};
    use grounding_core::models::{ChangeEvent, ContinuationToken, Fragment, FragmentSummary};
    use grounding_core::search::SearchParams;
    use grounding_core::store::memory::InMemoryStore;
    use grounding_core::store::VectorStore;
    use grounding_core::tenant::{StaticDirectory, TenantTable};
    use std::time::Duration;

    struct Stalls;

    #[async_trait]
    impl Generator for Stalls {
        fn model_name(&self) -> &str {
            "stalls"
        }
        async fn generate(&self, _prompt: &AssembledPrompt) -> Result<Generation, GenerationError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(GenerationError::Fatal("unreachable".to_string()))
        }
    }

    struct Refuses;

    #[async_trait]
    impl Generator for Refuses {
        fn model_name(&self) -> &str {
            "refuses"
        }
        async fn generate(&self, _prompt: &AssembledPrompt) -> Result<Generation, GenerationError> {
            Err(GenerationError::Fatal("insufficient_quota".to_string()))
        }
    }

    /// Searches normally but can no longer resolve any fragment by id, as
    /// if every hit were deleted right after the search.
    struct Forgetful(InMemoryStore);

    #[async_trait]
    impl VectorStore for Forgetful {
        async fn upsert(&self, fragment: &Fragment) -> Result<(), RetrievalError> {
            self.0.upsert(fragment).await
        }
        async fn get(&self, _id: &str) -> Result<Option<Fragment>, RetrievalError> {
            Ok(None)
        }
        async fn search_within_partition(
            &self,
            partition_key: &str,
            query: &[f32],
            k: usize,
        ) -> Result<Vec<FragmentHit>, RetrievalError> {
            self.0.search_within_partition(partition_key, query, k).await
        }
        async fn list_partition(&self, partition_key: &str) -> Result<Vec<FragmentSummary>, RetrievalError> {
            self.0.list_partition(partition_key).await
        }
        async fn list_sources(&self, tenant_id: &str) -> Result<Vec<String>, RetrievalError> {
            self.0.list_sources(tenant_id).await
        }
        async fn delete(&self, id: &str) -> Result<bool, RetrievalError> {
            self.0.delete(id).await
        }
    }

    async fn service(generator: Arc<dyn Generator>) -> (AnswerService, Arc<MemoryFeed>) {
        service_with(Arc::new(InMemoryStore::new()), generator).await
    }

    async fn service_with(
        store: Arc<dyn VectorStore>,
        generator: Arc<dyn Generator>,
    ) -> (AnswerService, Arc<MemoryFeed>) {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(384));
        let ing = Ingestor::new(store.clone(), embedder.clone(), ChunkParams::new(200, 20));
        let meta = IngestMetadata::default();
        ing.ingest("sage", "virtues", "patience is a virtue", &meta).await.unwrap();
        ing.ingest("sage", "freedom", "discipline brings freedom", &meta).await.unwrap();

        let retriever = Retriever::new(
            store,
            embedder,
            Arc::new(StaticDirectory::default()),
            Arc::new(TenantTable::new("You are a sage.")),
            SearchParams {
                top_k: 5,
                min_score: 0.3,
                max_fanout: 4,
            },
        );
        let adapter = GenerationAdapter::new(
            generator,
            RetryPolicy {
                max_retries: 1,
                base_delay: Duration::ZERO,
                backoff: Backoff::Exponential,
            },
            Duration::from_millis(50),
        );
        let feed = Arc::new(MemoryFeed::new());
        let svc = AnswerService::new(
            retriever,
            AssemblyParams::default(),
            adapter,
            feed.clone(),
            "Sorry, try again.",
        );
        (svc, feed)
    }

    async fn logged(feed: &MemoryFeed) -> Vec<ChangeEvent> {
        feed.read_batch(ContinuationToken::START, 10)
            .await
            .unwrap()
            .iter()
            .filter_map(|e| e.event().cloned())
            .collect()
    }

    fn ask(text: &str) -> AnswerRequest {
        AnswerRequest {
            tenant_id: "sage".to_string(),
            session_id: Some("s1".to_string()),
            query_text: text.to_string(),
            top_k: None,
        }
    }

    #[tokio::test]
    async fn test_grounded_answer_is_logged() {
        let (svc, feed) = service(Arc::new(EchoGenerator)).await;
        let resp = svc.answer(&ask("tell me about discipline")).await.unwrap();
        assert!(resp.grounded);
        assert_eq!(resp.outcome, InteractionOutcome::Grounded);
        assert_eq!(resp.fragments_used.len(), 1);
        assert!(resp.answer.contains("discipline brings freedom"));
        assert!(resp.error_code.is_none());

        let events = logged(&feed).await;
        assert_eq!(events.len(), 1);
        let rec = &events[0].record;
        assert_eq!(rec.interaction_id, resp.interaction_id);
        assert_eq!(rec.session_id, "s1");
        assert_eq!(rec.fragments_used, resp.fragments_used);
        assert_eq!(rec.outcome, InteractionOutcome::Grounded);
    }

    #[tokio::test]
    async fn test_ungrounded_answer_says_so() {
        let (svc, feed) = service(Arc::new(EchoGenerator)).await;
        let resp = svc.answer(&ask("quantum chromodynamics")).await.unwrap();
        assert!(!resp.grounded);
        assert_eq!(resp.outcome, InteractionOutcome::Ungrounded);
        assert_eq!(resp.answer, ECHO_UNGROUNDED_REPLY);
        assert!(resp.fragments_used.is_empty());
        assert_eq!(feed.head().await.unwrap(), ContinuationToken(1));
    }

    #[tokio::test]
    async fn test_unresolvable_hits_are_never_cited() {
        let store: Arc<dyn VectorStore> = Arc::new(Forgetful(InMemoryStore::new()));
        let (svc, feed) = service_with(store, Arc::new(EchoGenerator)).await;
        let found = svc
            .retriever()
            .search(&QueryRequest {
                tenant_id: "sage".to_string(),
                query_text: "tell me about discipline".to_string(),
                top_k: None,
            })
            .await
            .unwrap();
        assert!(found.grounded);

        let resp = svc.answer(&ask("tell me about discipline")).await.unwrap();
        assert!(!resp.grounded);
        assert_eq!(resp.outcome, InteractionOutcome::Ungrounded);
        assert_eq!(resp.answer, ECHO_UNGROUNDED_REPLY);
        assert!(resp.citations.is_empty());
        assert!(resp.fragments_used.is_empty());
        assert!(logged(&feed).await[0].record.fragments_used.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_returns_fallback() {
        let (svc, feed) = service(Arc::new(Stalls)).await;
        let resp = svc.answer(&ask("tell me about discipline")).await.unwrap();
        assert_eq!(resp.outcome, InteractionOutcome::GenerationTimeout);
        assert_eq!(resp.answer, "Sorry, try again.");
        assert_ne!(resp.answer, ECHO_UNGROUNDED_REPLY);
        assert_eq!(resp.error_code.as_deref(), Some("generation_timeout"));

        let events = logged(&feed).await;
        assert_eq!(events[0].record.outcome, InteractionOutcome::GenerationTimeout);
        assert_eq!(events[0].record.raw_usage.model_id, "stalls");
    }

    #[tokio::test]
    async fn test_fatal_generation_is_an_error_but_logged() {
        let (svc, feed) = service(Arc::new(Refuses)).await;
        let err = svc.answer(&ask("tell me about discipline")).await.unwrap_err();
        let logged_id = match err {
            AnswerError::Generation { interaction_id, .. } => interaction_id,
            other => panic!("unexpected error: {other}"),
        };
        let events = logged(&feed).await;
        assert_eq!(events[0].record.interaction_id, logged_id);
        assert_eq!(events[0].record.outcome, InteractionOutcome::GenerationFailed);
    }

    #[tokio::test]
    async fn test_invalid_request() {
        let (svc, feed) = service(Arc::new(EchoGenerator)).await;
        assert!(matches!(
            svc.answer(&ask("   ")).await,
            Err(AnswerError::Invalid(RetrievalError::Validation(_)))
        ));
        assert_eq!(feed.head().await.unwrap(), ContinuationToken::START);
    }
}
