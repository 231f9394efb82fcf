//! Ingestion pipeline: text → spans → embeddings → store.
//!
//! Fragment ids are deterministic (tenant, source, byte offset, model), so
//! re-ingesting a source is an idempotent upsert. Spans whose stored hash
//! and model already match are not re-embedded. Embedding or storage
//! failures fail only the affected fragment; the [`IngestReport`] lists
//! every fragment with its status.
//!
//! Once every span of a source is stored under the current model, rows of
//! that partition that the new split no longer produces (trailing spans of
//! a shortened source, versions under a previous model) are deleted.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use grounding_core::chunk::{split_text, verse_marker, ChunkParams, TextSpan};
use grounding_core::embedding::Embedder;
use grounding_core::error::RetrievalError;
use grounding_core::models::{fragment_id, partition_key, Fragment, PARTITION_SEPARATOR};
use grounding_core::store::VectorStore;

/// Optional descriptive data attached to an ingested source.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct IngestMetadata {
    /// Title used in citations; defaults to the source id.
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub topic_tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FragmentStatus {
    /// Embedded and written.
    Stored,
    /// Already stored with the same text and model.
    Unchanged,
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FragmentResult {
    pub fragment_id: String,
    pub ordinal: i64,
    pub status: FragmentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IngestReport {
    pub tenant_id: String,
    pub source_id: String,
    pub fragments: Vec<FragmentResult>,
    /// Superseded fragments removed from the partition.
    pub pruned: usize,
}

impl IngestReport {
    fn count(&self, status: FragmentStatus) -> usize {
        self.fragments.iter().filter(|f| f.status == status).count()
    }

    pub fn stored(&self) -> usize {
        self.count(FragmentStatus::Stored)
    }

    pub fn unchanged(&self) -> usize {
        self.count(FragmentStatus::Unchanged)
    }

    pub fn failed(&self) -> usize {
        self.count(FragmentStatus::Failed)
    }

    /// `"ok"`, `"partial"` or `"failed"`.
    pub fn status(&self) -> &'static str {
        match (self.failed(), self.fragments.len()) {
            (0, _) => "ok",
            (f, n) if f == n => "failed",
            _ => "partial",
        }
    }

    pub fn fragment_ids(&self) -> Vec<String> {
        self.fragments.iter().map(|f| f.fragment_id.clone()).collect()
    }
}

/// `"Title 12:3"` or `"Title, §4"` when the passage opens with a marker,
/// otherwise the fragment's position in the source.
fn citation(title: &str, span: &TextSpan) -> String {
    match verse_marker(&span.text) {
        Some(reference) if reference.starts_with('§') => format!("{}, {}", title, reference),
        Some(reference) => format!("{} {}", title, reference),
        None => format!("{}, §{}", title, span.ordinal + 1),
    }
}

/// Turns raw source text into stored fragments.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    params: ChunkParams,
}

impl Ingestor {
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn Embedder>, params: ChunkParams) -> Self {
        Self {
            store,
            embedder,
            params,
        }
    }

    /// Ingest one source for one tenant.
    ///
    /// Returns `Err` only for invalid input or a failure to read the
    /// partition; per-fragment problems are reported in the result.
    pub async fn ingest(
        &self,
        tenant_id: &str,
        source_id: &str,
        text: &str,
        metadata: &IngestMetadata,
    ) -> Result<IngestReport, RetrievalError> {
        validate(tenant_id, source_id, text)?;

        let model = self.embedder.model_name().to_string();
        let key = partition_key(tenant_id, source_id);
        let spans = split_text(text, &self.params);

        let existing: HashMap<String, (String, String)> = self
            .store
            .list_partition(&key)
            .await?
            .into_iter()
            .map(|s| (s.id, (s.hash, s.embedding_model_id)))
            .collect();

        let mut results: Vec<FragmentResult> = Vec::with_capacity(spans.len());
        let mut pending: Vec<(usize, &TextSpan)> = Vec::new();
        for span in &spans {
            let id = fragment_id(tenant_id, source_id, span.start, &model);
            let fresh = matches!(existing.get(&id), Some((hash, m)) if *hash == span.hash && *m == model);
            results.push(FragmentResult {
                fragment_id: id,
                ordinal: span.ordinal,
                status: if fresh {
                    FragmentStatus::Unchanged
                } else {
                    FragmentStatus::Stored
                },
                error: None,
            });
            if !fresh {
                pending.push((results.len() - 1, span));
            }
        }

        let texts: Vec<String> = pending.iter().map(|(_, s)| s.text.clone()).collect();
        let vectors = self.embed_each(&texts).await;

        let title = metadata.title.as_deref().unwrap_or(source_id);
        for ((idx, span), vector) in pending.into_iter().zip(vectors) {
            let outcome = match vector {
                Ok(embedding) => {
                    let fragment = Fragment {
                        id: results[idx].fragment_id.clone(),
                        tenant_id: tenant_id.to_string(),
                        source_id: source_id.to_string(),
                        partition_key: key.clone(),
                        ordinal: span.ordinal,
                        start: span.start,
                        end: span.end,
                        text: span.text.clone(),
                        hash: span.hash.clone(),
                        embedding,
                        embedding_model_id: model.clone(),
                        citation: citation(title, &span),
                        topic_tags: metadata.topic_tags.clone(),
                    };
                    self.store.upsert(&fragment).await.map_err(|e| e.to_string())
                }
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                warn!(tenant_id, source_id, ordinal = span.ordinal, error = %e, "fragment failed");
                results[idx].status = FragmentStatus::Failed;
                results[idx].error = Some(e);
            }
        }

        let mut pruned = 0;
        if results.iter().all(|r| r.status != FragmentStatus::Failed) {
            let current: HashSet<&str> = results.iter().map(|r| r.fragment_id.as_str()).collect();
            for id in existing.keys().filter(|id| !current.contains(id.as_str())) {
                match self.store.delete(id).await {
                    Ok(true) => pruned += 1,
                    Ok(false) => {}
                    Err(e) => warn!(fragment_id = %id, error = %e, "failed to prune fragment"),
                }
            }
        }

        let report = IngestReport {
            tenant_id: tenant_id.to_string(),
            source_id: source_id.to_string(),
            fragments: results,
            pruned,
        };
        info!(
            tenant_id,
            source_id,
            stored = report.stored(),
            unchanged = report.unchanged(),
            failed = report.failed(),
            pruned,
            "ingested source"
        );
        Ok(report)
    }

    /// Embed texts in one batch call; if the batch fails, fall back to one
    /// call per text so a single bad input fails only its own fragment.
    async fn embed_each(&self, texts: &[String]) -> Vec<Result<Vec<f32>, String>> {
        if texts.is_empty() {
            return Vec::new();
        }
        let dims = self.embedder.dims();
        let check = |v: Vec<f32>| {
            if v.len() == dims {
                Ok(v)
            } else {
                Err(RetrievalError::DimensionMismatch {
                    expected: dims,
                    actual: v.len(),
                }
                .to_string())
            }
        };

        match self.embedder.embed_batch(texts).await {
            Ok(vectors) if vectors.len() == texts.len() => vectors.into_iter().map(check).collect(),
            batch => {
                if let Err(e) = batch {
                    warn!(error = %e, count = texts.len(), "batch embedding failed, retrying per fragment");
                }
                let mut out = Vec::with_capacity(texts.len());
                for text in texts {
                    out.push(match self.embedder.embed(text).await {
                        Ok(v) => check(v),
                        Err(e) => Err(format!("embedding failed: {}", e)),
                    });
                }
                out
            }
        }
    }

    /// Ingest every `.txt` and `.md` file under `dir` as its own source.
    ///
    /// The source id is the path relative to `dir` with `/` separators;
    /// the citation title is the file stem. Files that fail validation
    /// (e.g. empty) are skipped with a warning.
    pub async fn ingest_directory(&self, tenant_id: &str, dir: &Path) -> Result<Vec<IngestReport>> {
        if !dir.is_dir() {
            anyhow::bail!("Not a directory: {}", dir.display());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let ext = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase());
            if matches!(ext.as_deref(), Some("txt") | Some("md")) {
                files.push(entry.into_path());
            }
        }
        files.sort();

        let mut reports = Vec::with_capacity(files.len());
        for path in files {
            let rel = path.strip_prefix(dir).unwrap_or(&path);
            let source_id = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let metadata = IngestMetadata {
                title: path.file_stem().map(|s| s.to_string_lossy().into_owned()),
                topic_tags: BTreeSet::new(),
            };
            match self.ingest(tenant_id, &source_id, &text, &metadata).await {
                Ok(report) => reports.push(report),
                Err(RetrievalError::Validation(msg)) => {
                    warn!(tenant_id, source_id = %source_id, "skipping file: {}", msg);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(reports)
    }
}

fn validate(tenant_id: &str, source_id: &str, text: &str) -> Result<(), RetrievalError> {
    if tenant_id.trim().is_empty() {
        return Err(RetrievalError::Validation("tenant_id must not be empty".to_string()));
    }
    if tenant_id.contains(PARTITION_SEPARATOR) {
        return Err(RetrievalError::Validation(format!(
            "tenant_id must not contain '{}'",
            PARTITION_SEPARATOR
        )));
    }
    if source_id.trim().is_empty() {
        return Err(RetrievalError::Validation("source_id must not be empty".to_string()));
    }
    if text.trim().is_empty() {
        return Err(RetrievalError::Validation("text must not be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use grounding_core::embedding::HashingEmbedder;
    use grounding_core::store::memory::InMemoryStore;

    fn ingestor(store: Arc<InMemoryStore>) -> Ingestor {
        Ingestor::new(store, Arc::new(HashingEmbedder::new(64)), ChunkParams::new(8, 1))
    }

    const TEXT: &str = "Discipline brings freedom.\n\nPatience is a virtue.\n\nThe obstacle is the way.";

    #[tokio::test]
    async fn test_ingest_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let ing = ingestor(store.clone());
        let meta = IngestMetadata::default();

        let first = ing.ingest("sage", "meditations", TEXT, &meta).await.unwrap();
        assert_eq!(first.status(), "ok");
        assert!(first.stored() > 0);
        let count = store.len();

        let second = ing.ingest("sage", "meditations", TEXT, &meta).await.unwrap();
        assert_eq!(second.fragment_ids(), first.fragment_ids());
        assert_eq!(second.stored(), 0);
        assert_eq!(second.unchanged(), first.fragments.len());
        assert_eq!(store.len(), count);
    }

    #[tokio::test]
    async fn test_shortened_source_prunes_orphans() {
        let store = Arc::new(InMemoryStore::new());
        let ing = ingestor(store.clone());
        let meta = IngestMetadata::default();

        let full = ing.ingest("sage", "m", TEXT, &meta).await.unwrap();
        assert!(full.fragments.len() > 1);
        let short = ing
            .ingest("sage", "m", "Discipline brings freedom.", &meta)
            .await
            .unwrap();
        assert_eq!(short.fragments.len(), 1);
        assert_eq!(short.pruned, full.fragments.len() - 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_citations_follow_verse_markers() {
        let store = Arc::new(InMemoryStore::new());
        let ing = ingestor(store.clone());
        let meta = IngestMetadata {
            title: Some("Psalms".to_string()),
            ..Default::default()
        };
        let report = ing
            .ingest("sage", "psalms", "12:3 Be still and know.\n12:4 The wise are silent.", &meta)
            .await
            .unwrap();
        assert_eq!(report.fragments.len(), 2);
        let first = store.get(&report.fragments[0].fragment_id).await.unwrap().unwrap();
        let second = store.get(&report.fragments[1].fragment_id).await.unwrap().unwrap();
        assert_eq!(first.citation, "Psalms 12:3");
        assert_eq!(second.citation, "Psalms 12:4");

        let report = ing.ingest("sage", "anger", "§ 4 Of anger.", &IngestMetadata::default()).await.unwrap();
        let f = store.get(&report.fragments[0].fragment_id).await.unwrap().unwrap();
        assert_eq!(f.citation, "anger, §4");

        let report = ing.ingest("sage", "plain", "Discipline brings freedom.", &meta).await.unwrap();
        let f = store.get(&report.fragments[0].fragment_id).await.unwrap().unwrap();
        assert_eq!(f.citation, "Psalms, §1");
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let ing = ingestor(Arc::new(InMemoryStore::new()));
        let meta = IngestMetadata::default();
        for (t, s, x) in [("", "s", "x"), ("a::b", "s", "x"), ("t", " ", "x"), ("t", "s", "  \n")] {
            let err = ing.ingest(t, s, x, &meta).await.unwrap_err();
            assert!(matches!(err, RetrievalError::Validation(_)));
        }
    }

    /// Fails any text containing "poison".
    struct PickyEmbedder(HashingEmbedder);

    #[async_trait]
    impl Embedder for PickyEmbedder {
        fn model_name(&self) -> &str {
            "picky"
        }
        fn dims(&self) -> usize {
            self.0.dims()
        }
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t.contains("poison")) {
                anyhow::bail!("embedding service rejected input");
            }
            Ok(texts.iter().map(|t| self.0.embed_sync(t)).collect())
        }
    }

    #[tokio::test]
    async fn test_embedding_failure_is_per_fragment() {
        let store = Arc::new(InMemoryStore::new());
        let ing = Ingestor::new(
            store.clone(),
            Arc::new(PickyEmbedder(HashingEmbedder::new(32))),
            ChunkParams::new(8, 0),
        );
        let text = "Discipline brings freedom.\n\nThis paragraph is poison.\n\nPatience is a virtue.";
        let report = ing
            .ingest("sage", "m", text, &IngestMetadata::default())
            .await
            .unwrap();
        assert_eq!(report.status(), "partial");
        assert_eq!(report.failed(), 1);
        assert_eq!(report.stored(), report.fragments.len() - 1);
        assert_eq!(store.len(), report.stored());
        let failed = report
            .fragments
            .iter()
            .find(|f| f.status == FragmentStatus::Failed)
            .unwrap();
        assert!(failed.error.as_deref().unwrap().contains("embedding failed"));
    }

    #[tokio::test]
    async fn test_ingest_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("letters")).unwrap();
        std::fs::write(tmp.path().join("meditations.txt"), "Discipline brings freedom.").unwrap();
        std::fs::write(tmp.path().join("letters/one.md"), "Patience is a virtue.").unwrap();
        std::fs::write(tmp.path().join("empty.txt"), "   ").unwrap();
        std::fs::write(tmp.path().join("image.png"), "not text").unwrap();

        let store = Arc::new(InMemoryStore::new());
        let reports = ingestor(store.clone())
            .ingest_directory("sage", tmp.path())
            .await
            .unwrap();
        let sources: Vec<&str> = reports.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(sources, vec!["letters/one.md", "meditations.txt"]);
        assert_eq!(
            store.list_sources("sage").await.unwrap(),
            vec!["letters/one.md", "meditations.txt"]
        );
    }
}
