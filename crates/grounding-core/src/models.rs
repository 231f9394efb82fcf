//! Core data models shared by the retrieval engine and the analytics
//! pipeline.
//!
//! Fragments are the unit of storage and search. Interaction records are
//! written once per answered request and travel through the change stream
//! wrapped in [`ChangeEvent`]s.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Separator between the tenant and source halves of a partition key.
pub const PARTITION_SEPARATOR: &str = "::";

/// Build the composite partition key `tenant_id::source_id`.
///
/// Partitioning by source as well as tenant bounds each partition to the
/// size of a single source document.
pub fn partition_key(tenant_id: &str, source_id: &str) -> String {
    format!("{}{}{}", tenant_id, PARTITION_SEPARATOR, source_id)
}

/// Split a partition key back into `(tenant_id, source_id)`.
///
/// The tenant half never contains the separator, so the first occurrence
/// is the split point; source ids may contain `::`.
pub fn split_partition_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(PARTITION_SEPARATOR)
}

/// Deterministic fragment id.
///
/// Hashes tenant, source, byte offset within the source, and the
/// embedding model id. Re-ingesting unchanged text yields the same ids;
/// re-embedding under a different model yields new fragment versions.
pub fn fragment_id(tenant_id: &str, source_id: &str, offset: usize, model_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(source_id.as_bytes());
    hasher.update([0u8]);
    hasher.update((offset as u64).to_le_bytes());
    hasher.update([0u8]);
    hasher.update(model_id.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("frag_{}", &digest[..32])
}

/// SHA-256 hex digest of fragment text, used for staleness detection.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A single embedded, citable unit of source content.
///
/// `embedding` and `embedding_model_id` are fixed for the life of a
/// fragment id; a different model produces a different id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fragment {
    pub id: String,
    pub tenant_id: String,
    pub source_id: String,
    pub partition_key: String,
    /// Position of the fragment within its source (0, 1, 2, ...).
    pub ordinal: i64,
    /// Byte range of `text` within the original source text.
    pub start: usize,
    pub end: usize,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
    pub embedding: Vec<f32>,
    pub embedding_model_id: String,
    /// Human-readable source reference, e.g. `"Meditations, §4"`.
    pub citation: String,
    pub topic_tags: BTreeSet<String>,
}

impl Fragment {
    pub fn dims(&self) -> usize {
        self.embedding.len()
    }

    /// Project to a search hit with the given score.
    pub fn to_hit(&self, score: f64) -> FragmentHit {
        FragmentHit {
            id: self.id.clone(),
            tenant_id: self.tenant_id.clone(),
            source_id: self.source_id.clone(),
            ordinal: self.ordinal,
            start: self.start,
            end: self.end,
            text: self.text.clone(),
            citation: self.citation.clone(),
            topic_tags: self.topic_tags.clone(),
            score,
        }
    }
}

/// Lightweight fragment listing used for staleness checks and pruning.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentSummary {
    pub id: String,
    pub ordinal: i64,
    pub hash: String,
    pub embedding_model_id: String,
}

/// A ranked search result. Carries no embedding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FragmentHit {
    pub id: String,
    pub tenant_id: String,
    pub source_id: String,
    pub ordinal: i64,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub citation: String,
    pub topic_tags: BTreeSet<String>,
    /// Cosine similarity to the query embedding.
    pub score: f64,
}

/// A tenant (personality) as seen from the admin registry.
///
/// Owned by the admin collaborator; the retrieval engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Tenant {
    pub tenant_id: String,
    #[serde(default)]
    pub display_config: serde_json::Value,
    #[serde(default)]
    pub associated_source_ids: Vec<String>,
}

/// How an answered request ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InteractionOutcome {
    Grounded,
    Ungrounded,
    GenerationTimeout,
    GenerationFailed,
}

impl InteractionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionOutcome::Grounded => "grounded",
            InteractionOutcome::Ungrounded => "ungrounded",
            InteractionOutcome::GenerationTimeout => "generation_timeout",
            InteractionOutcome::GenerationFailed => "generation_failed",
        }
    }
}

impl std::str::FromStr for InteractionOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grounded" => Ok(InteractionOutcome::Grounded),
            "ungrounded" => Ok(InteractionOutcome::Ungrounded),
            "generation_timeout" => Ok(InteractionOutcome::GenerationTimeout),
            "generation_failed" => Ok(InteractionOutcome::GenerationFailed),
            other => Err(format!("unknown interaction outcome: {}", other)),
        }
    }
}

/// Token counts and model metadata reported by the generation service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub model_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub latency_ms: u64,
}

/// One answered request, logged on the synchronous path and immutable
/// afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionRecord {
    pub interaction_id: String,
    pub tenant_id: String,
    pub session_id: String,
    pub query_text: String,
    pub response_text: String,
    pub fragments_used: Vec<String>,
    pub raw_usage: RawUsage,
    pub outcome: InteractionOutcome,
}

/// Opaque, ordered position in the change stream.
///
/// Tokens compare by sequence number; the empty token sits before the
/// first event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ContinuationToken(pub i64);

impl ContinuationToken {
    pub const START: ContinuationToken = ContinuationToken(0);

    pub fn seq(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ContinuationToken {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(ContinuationToken::START);
        }
        s.parse::<i64>().map(ContinuationToken)
    }
}

/// Replayable change-stream envelope around an [`InteractionRecord`].
///
/// `token` is the position *after* this event: a consumer that has
/// processed the event checkpoints `token`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub token: ContinuationToken,
    pub record: InteractionRecord,
}

/// A change event that exhausted its retry budget for one consumer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoisonedEvent {
    pub id: i64,
    pub consumer: String,
    pub interaction_id: String,
    /// Stream position of the quarantined event.
    pub token: ContinuationToken,
    /// `None` when the stored row could not be decoded at all.
    pub original_event: Option<ChangeEvent>,
    pub error_message: String,
    pub retry_count: u32,
    pub quarantined_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_key_roundtrip() {
        let key = partition_key("sage", "letters::seneca");
        assert_eq!(key, "sage::letters::seneca");
        assert_eq!(split_partition_key(&key), Some(("sage", "letters::seneca")));
    }

    #[test]
    fn test_fragment_id_deterministic() {
        let a = fragment_id("sage", "meditations", 120, "hashing-v1");
        let b = fragment_id("sage", "meditations", 120, "hashing-v1");
        assert_eq!(a, b);
        assert!(a.starts_with("frag_"));
    }

    #[test]
    fn test_fragment_id_varies_by_component() {
        let base = fragment_id("sage", "meditations", 0, "m1");
        assert_ne!(base, fragment_id("coach", "meditations", 0, "m1"));
        assert_ne!(base, fragment_id("sage", "letters", 0, "m1"));
        assert_ne!(base, fragment_id("sage", "meditations", 1, "m1"));
        assert_ne!(base, fragment_id("sage", "meditations", 0, "m2"));
    }

    #[test]
    fn test_fragment_id_no_concatenation_collision() {
        assert_ne!(fragment_id("ab", "c", 0, "m"), fragment_id("a", "bc", 0, "m"));
    }

    #[test]
    fn test_continuation_token_parse() {
        assert_eq!("".parse::<ContinuationToken>().unwrap(), ContinuationToken::START);
        assert_eq!("42".parse::<ContinuationToken>().unwrap(), ContinuationToken(42));
        assert!("x".parse::<ContinuationToken>().is_err());
    }

    #[test]
    fn test_outcome_str_roundtrip() {
        for o in [
            InteractionOutcome::Grounded,
            InteractionOutcome::Ungrounded,
            InteractionOutcome::GenerationTimeout,
            InteractionOutcome::GenerationFailed,
        ] {
            assert_eq!(o.as_str().parse::<InteractionOutcome>().unwrap(), o);
        }
    }
}
