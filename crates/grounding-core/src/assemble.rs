//! Grounded prompt assembly.
//!
//! Turns ranked fragments into a prompt with numbered passages and a
//! parallel citation list, headed by the tenant's system preamble.
//!
//! # Rules
//!
//! - Overlapping fragments from the same source (neighbouring chunks share
//!   an overlap region) are de-duplicated by byte range before inclusion;
//!   identical passages are included once.
//! - Fragments are added in rank order until `budget_chars` is reached.
//!   The fragment that crosses the budget is truncated and assembly stops;
//!   a lower-ranked fragment is never included in place of a higher-ranked
//!   one. The top-ranked fragment is always included, truncated if needed.
//! - When search reported no grounding, the prompt instructs the generator
//!   to say so explicitly instead of answering from general knowledge.

use serde::Serialize;

use crate::models::FragmentHit;
use crate::tenant::TenantProfile;

/// Instruction placed above the passages of a grounded prompt.
pub const GROUNDED_INSTRUCTION: &str = "Answer the question using only the numbered passages \
below. Cite the passages you rely on as [n]. If the passages do not answer the question, say so \
plainly.";

/// Instruction used when search found nothing relevant.
pub const NO_GROUNDING_INSTRUCTION: &str = "No grounded passages were found for this question. \
Tell the user explicitly that you do not have a grounded answer from your sources. Do not invent \
quotations, citations, or facts.";

/// Shortest truncated passage worth including after the first one.
const MIN_TRUNCATED_CHARS: usize = 40;

/// Assembly limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyParams {
    /// Maximum characters of passage text (headers included).
    pub budget_chars: usize,
}

impl Default for AssemblyParams {
    fn default() -> Self {
        Self { budget_chars: 6000 }
    }
}

/// One entry of the citation list, parallel to the included passages.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Citation {
    /// The `[n]` marker used in the prompt, starting at 1.
    pub marker: usize,
    pub fragment_id: String,
    pub source_id: String,
    /// Human-readable reference (source, chapter/section).
    pub reference: String,
    pub score: f64,
}

/// A prompt ready for the generation adapter.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AssembledPrompt {
    pub tenant_id: String,
    /// Tenant system preamble.
    pub system: String,
    /// Instruction, passages, and question.
    pub prompt: String,
    pub citations: Vec<Citation>,
    pub grounded: bool,
    /// True if a passage was cut to fit the budget.
    pub truncated: bool,
}

impl AssembledPrompt {
    /// Ids of the fragments included in the prompt, in marker order.
    pub fn fragment_ids(&self) -> Vec<String> {
        self.citations.iter().map(|c| c.fragment_id.clone()).collect()
    }

    /// System preamble and prompt joined for single-string generators.
    pub fn full_prompt(&self) -> String {
        format!("{}\n\n{}", self.system, self.prompt)
    }
}

/// Build the prompt for `query` from ranked `hits`.
///
/// `grounded` is the search stage's flag; when false the hits are ignored.
pub fn assemble(
    profile: &TenantProfile,
    hits: &[FragmentHit],
    grounded: bool,
    query: &str,
    params: &AssemblyParams,
) -> AssembledPrompt {
    if !grounded || hits.is_empty() {
        return AssembledPrompt {
            tenant_id: profile.tenant_id.clone(),
            system: profile.preamble.clone(),
            prompt: format!("{}\n\nQuestion: {}", NO_GROUNDING_INSTRUCTION, query.trim()),
            citations: Vec::new(),
            grounded: false,
            truncated: false,
        };
    }

    let passages = dedupe(hits);
    let mut blocks: Vec<String> = Vec::new();
    let mut citations: Vec<Citation> = Vec::new();
    let mut used = 0usize;
    let mut truncated = false;

    for (hit, text) in passages {
        let marker = citations.len() + 1;
        let reference = reference_for(hit);
        let header = format!("[{}] {}\n", marker, reference);
        let full_len = header.len() + text.len();

        let body = if used + full_len <= params.budget_chars {
            text
        } else {
            let room = params.budget_chars.saturating_sub(used + header.len());
            if citations.is_empty() {
                truncated = true;
                truncate_text(&text, room.max(MIN_TRUNCATED_CHARS))
            } else if room >= MIN_TRUNCATED_CHARS {
                truncated = true;
                truncate_text(&text, room)
            } else {
                truncated = true;
                break;
            }
        };

        used += header.len() + body.len();
        blocks.push(format!("{}{}", header, body));
        citations.push(Citation {
            marker,
            fragment_id: hit.id.clone(),
            source_id: hit.source_id.clone(),
            reference,
            score: hit.score,
        });

        if truncated {
            break;
        }
    }

    let prompt = format!(
        "{}\n\nPassages:\n{}\n\nQuestion: {}",
        GROUNDED_INSTRUCTION,
        blocks.join("\n\n"),
        query.trim()
    );

    AssembledPrompt {
        tenant_id: profile.tenant_id.clone(),
        system: profile.preamble.clone(),
        prompt,
        citations,
        grounded: true,
        truncated,
    }
}

fn reference_for(hit: &FragmentHit) -> String {
    if hit.citation.trim().is_empty() {
        format!("{} #{}", hit.source_id, hit.ordinal + 1)
    } else {
        hit.citation.clone()
    }
}

/// Drop repeated passages and strip byte ranges already covered by a
/// higher-ranked fragment of the same source.
fn dedupe(hits: &[FragmentHit]) -> Vec<(&FragmentHit, String)> {
    let mut kept: Vec<(&FragmentHit, String)> = Vec::new();

    for hit in hits {
        if kept.iter().any(|(k, _)| k.id == hit.id) {
            continue;
        }

        let (mut s, mut e) = (hit.start, hit.end);
        for (k, _) in &kept {
            if k.tenant_id != hit.tenant_id || k.source_id != hit.source_id {
                continue;
            }
            if !(k.start < e && s < k.end) {
                continue;
            }
            if k.start <= s && k.end >= e {
                s = e;
            } else if k.start <= s {
                s = k.end;
            } else if k.end >= e {
                e = k.start;
            }
        }

        let text = if s >= e {
            String::new()
        } else {
            hit.text
                .get((s - hit.start)..(e - hit.start))
                .unwrap_or(&hit.text)
                .trim()
                .to_string()
        };
        if text.is_empty() {
            continue;
        }
        if kept.iter().any(|(_, t)| *t == text) {
            continue;
        }
        kept.push((hit, text));
    }

    kept
}

/// Cut `text` to at most `max_bytes`, preferring a word boundary, and
/// mark the cut with an ellipsis.
fn truncate_text(text: &str, max_bytes: usize) -> String {
    const ELLIPSIS: &str = "…";
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let limit = max_bytes.saturating_sub(ELLIPSIS.len());
    let mut cut = limit.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    if let Some(ws) = text[..cut].rfind(char::is_whitespace) {
        if ws > cut / 2 {
            cut = ws;
        }
    }
    format!("{}{}", text[..cut].trim_end(), ELLIPSIS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> TenantProfile {
        TenantProfile {
            tenant_id: "sage".to_string(),
            display_name: "Sage".to_string(),
            preamble: "You are a stoic sage.".to_string(),
            min_score: None,
        }
    }

    fn hit(id: &str, source: &str, ordinal: i64, start: usize, text: &str, score: f64) -> FragmentHit {
        FragmentHit {
            id: id.to_string(),
            tenant_id: "sage".to_string(),
            source_id: source.to_string(),
            ordinal,
            start,
            end: start + text.len(),
            text: text.to_string(),
            citation: format!("{} §{}", source, ordinal + 1),
            topic_tags: Default::default(),
            score,
        }
    }

    #[test]
    fn test_grounded_prompt_has_preamble_passages_and_citations() {
        let hits = vec![
            hit("f1", "meditations", 0, 0, "Discipline brings freedom.", 0.8),
            hit("f2", "letters", 3, 0, "Patience is a virtue.", 0.6),
        ];
        let p = assemble(&profile(), &hits, true, "tell me about discipline", &AssemblyParams::default());
        assert!(p.grounded);
        assert_eq!(p.system, "You are a stoic sage.");
        assert!(p.prompt.starts_with(GROUNDED_INSTRUCTION));
        assert!(p.prompt.contains("[1] meditations §1\nDiscipline brings freedom."));
        assert!(p.prompt.contains("[2] letters §4\nPatience is a virtue."));
        assert!(p.prompt.ends_with("Question: tell me about discipline"));
        assert_eq!(p.fragment_ids(), vec!["f1", "f2"]);
        assert_eq!(p.citations[1].marker, 2);
        assert!(!p.truncated);
    }

    #[test]
    fn test_ungrounded_prompt_instructs_explicit_refusal() {
        let hits = vec![hit("f1", "m", 0, 0, "Something weak.", 0.1)];
        let p = assemble(&profile(), &hits, false, "what is the capital of Peru?", &AssemblyParams::default());
        assert!(!p.grounded);
        assert!(p.citations.is_empty());
        assert!(p.prompt.contains(NO_GROUNDING_INSTRUCTION));
        assert!(!p.prompt.contains("Something weak."));
    }

    #[test]
    fn test_overlap_with_higher_ranked_neighbour_is_stripped() {
        let source = "Alpha beta gamma.\n\nDelta epsilon zeta.\n\nEta theta iota.";
        // Chunk 0 covers the first two paragraphs, chunk 1 the last two.
        let c0 = &source[0..38];
        let c1_start = 19;
        let c1 = &source[c1_start..];
        let hits = vec![
            hit("f0", "s", 0, 0, c0, 0.9),
            hit("f1", "s", 1, c1_start, c1, 0.8),
        ];
        let p = assemble(&profile(), &hits, true, "q", &AssemblyParams::default());
        assert_eq!(p.citations.len(), 2);
        assert_eq!(p.prompt.matches("Delta epsilon zeta.").count(), 1);
        assert!(p.prompt.contains("[2] s §2\nEta theta iota."));
    }

    #[test]
    fn test_fully_covered_fragment_is_dropped() {
        let hits = vec![
            hit("big", "s", 0, 0, "one two three four", 0.9),
            hit("small", "s", 1, 4, "two three", 0.8),
        ];
        let p = assemble(&profile(), &hits, true, "q", &AssemblyParams::default());
        assert_eq!(p.fragment_ids(), vec!["big"]);
    }

    #[test]
    fn test_identical_text_across_sources_included_once() {
        let hits = vec![
            hit("a", "s1", 0, 0, "Know thyself.", 0.9),
            hit("b", "s2", 0, 0, "Know thyself.", 0.9),
        ];
        let p = assemble(&profile(), &hits, true, "q", &AssemblyParams::default());
        assert_eq!(p.fragment_ids(), vec!["a"]);
    }

    #[test]
    fn test_budget_truncates_and_never_skips_ahead() {
        let long = "word ".repeat(60);
        let hits = vec![
            hit("top", "s1", 0, 0, long.trim(), 0.9),
            hit("second", "s2", 0, 0, "tiny", 0.5),
        ];
        let params = AssemblyParams { budget_chars: 100 };
        let p = assemble(&profile(), &hits, true, "q", &params);
        assert!(p.truncated);
        assert_eq!(p.fragment_ids(), vec!["top"]);
        assert!(p.prompt.contains('…'));
    }

    #[test]
    fn test_top_fragment_always_included_under_tiny_budget() {
        let hits = vec![hit("top", "s", 0, 0, "A fairly long passage that cannot fit.", 0.9)];
        let p = assemble(&profile(), &hits, true, "q", &AssemblyParams { budget_chars: 5 });
        assert_eq!(p.fragment_ids(), vec!["top"]);
    }

    #[test]
    fn test_stops_when_next_fragment_does_not_fit() {
        let hits = vec![
            hit("a", "s1", 0, 0, "First passage fits.", 0.9),
            hit("b", "s2", 0, 0, &"x".repeat(500), 0.8),
            hit("c", "s3", 0, 0, "Would fit but ranks lower.", 0.7),
        ];
        let p = assemble(&profile(), &hits, true, "q", &AssemblyParams { budget_chars: 60 });
        assert_eq!(p.fragment_ids(), vec!["a"]);
        assert!(p.truncated);
    }

    #[test]
    fn test_truncate_text_respects_char_boundaries() {
        let t = truncate_text("ééééééééééééé", 10);
        assert!(t.ends_with('…'));
        assert!(t.len() <= 10);
    }
}
