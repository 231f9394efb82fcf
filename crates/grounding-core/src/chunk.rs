//! Verse- and paragraph-boundary text splitter.
//!
//! Splits raw source text into [`TextSpan`]s that respect a configurable
//! `max_tokens` limit, with a small overlap between consecutive spans so
//! that context crossing a boundary is not lost.
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` / `overlap_tokens` to characters (4 chars ≈ 1 token).
//! 2. Cut the text into *units*: runs of non-blank lines, where a line that
//!    opens with a verse marker (`3:16`, `[12]`, `§ 4`) starts a new unit.
//! 3. Hard-split any unit longer than `max_chars` at whitespace.
//! 4. Greedily pack consecutive units into spans of at most `max_chars`.
//! 5. Start the next span on the trailing units of the previous one whose
//!    combined length fits in `overlap_chars`.
//!
//! Every span's text is an exact slice of the source (`&text[start..end]`),
//! which lets the prompt assembler strip overlaps by byte range.
//!
//! # Example
//!
//! ```rust
//! use grounding_core::chunk::{split_text, ChunkParams};
//!
//! let spans = split_text("Hello world.\n\nSecond paragraph.", &ChunkParams::new(700, 0));
//! assert_eq!(spans.len(), 1);
//! assert_eq!(spans[0].ordinal, 0);
//! ```

use crate::models::content_hash;

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Chunking limits, in tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl ChunkParams {
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Self {
        Self {
            max_tokens,
            overlap_tokens,
        }
    }

    fn max_chars(&self) -> usize {
        (self.max_tokens * CHARS_PER_TOKEN).max(1)
    }

    fn overlap_chars(&self) -> usize {
        self.overlap_tokens * CHARS_PER_TOKEN
    }
}

/// A contiguous slice of the source text destined to become one fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    /// Position among the spans of this source, starting at 0.
    pub ordinal: i64,
    /// Byte offset of the span in the source.
    pub start: usize,
    pub end: usize,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// Split `text` into overlapping spans on verse/paragraph boundaries.
///
/// Returns an empty vector for empty or whitespace-only text. Ordinals are
/// contiguous from 0, and `start` offsets are strictly increasing.
pub fn split_text(text: &str, params: &ChunkParams) -> Vec<TextSpan> {
    let max_chars = params.max_chars();
    let overlap_chars = params.overlap_chars();
    let units = boundary_units(text, max_chars);

    let mut spans = Vec::new();
    let mut first = 0;

    while first < units.len() {
        let mut last = first;
        while last + 1 < units.len() && units[last + 1].1 - units[first].0 <= max_chars {
            last += 1;
        }
        spans.push(make_span(
            text,
            spans.len() as i64,
            units[first].0,
            units[last].1,
        ));

        let next = last + 1;
        if next >= units.len() {
            break;
        }

        // Earliest trailing unit that fits the overlap and still leaves
        // room for the next new unit.
        let mut new_first = next;
        for k in (first + 1)..=last {
            if units[last].1 - units[k].0 <= overlap_chars
                && units[next].1 - units[k].0 <= max_chars
            {
                new_first = k;
                break;
            }
        }
        first = new_first;
    }

    spans
}

/// Returns true if the line opens with a verse or section marker.
pub fn is_verse_marker(line: &str) -> bool {
    verse_marker(line).is_some()
}

/// The reference carried by a leading verse or section marker.
///
/// `3:16` is returned as is; `[12]` and `§ 4` become `§12` and `§4`.
pub fn verse_marker(line: &str) -> Option<String> {
    let line = line.trim_start();
    if let Some(rest) = line.strip_prefix('§') {
        let digits = leading_digits(rest.trim_start());
        return (!digits.is_empty()).then(|| format!("§{}", digits));
    }
    if let Some(rest) = line.strip_prefix('[') {
        let digits = leading_digits(rest);
        return (!digits.is_empty() && rest[digits.len()..].starts_with(']'))
            .then(|| format!("§{}", digits));
    }
    let chapter = leading_digits(line);
    if chapter.is_empty() {
        return None;
    }
    let verse = leading_digits(line[chapter.len()..].strip_prefix(':')?);
    (!verse.is_empty()).then(|| format!("{}:{}", chapter, verse))
}

fn leading_digits(s: &str) -> &str {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    &s[..end]
}

/// Cut the text into byte ranges of trimmed, non-empty units.
fn boundary_units(text: &str, max_chars: usize) -> Vec<(usize, usize)> {
    let mut raw: Vec<(usize, usize)> = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        let trimmed = line.trim();
        if trimmed.is_empty() {
            if let Some(unit) = current.take() {
                raw.push(unit);
            }
            continue;
        }

        let lead = line.len() - line.trim_start().len();
        let content_start = line_start + lead;
        let content_end = line_start + line.trim_end().len();

        if is_verse_marker(trimmed) {
            if let Some(unit) = current.take() {
                raw.push(unit);
            }
        }

        current = match current {
            Some((s, _)) => Some((s, content_end)),
            None => Some((content_start, content_end)),
        };
    }
    if let Some(unit) = current.take() {
        raw.push(unit);
    }

    let mut units = Vec::with_capacity(raw.len());
    for (start, end) in raw {
        if end - start > max_chars {
            hard_split(text, start, end, max_chars, &mut units);
        } else {
            units.push((start, end));
        }
    }
    units
}

/// Split an oversized unit at whitespace into pieces of at most `max_chars`.
fn hard_split(text: &str, start: usize, end: usize, max_chars: usize, out: &mut Vec<(usize, usize)>) {
    let mut s = start;
    while s < end {
        let mut cut = snap_to_char_boundary(text, (s + max_chars).min(end));
        if cut < end {
            if let Some(p) = text[s..cut].rfind(char::is_whitespace) {
                if p > 0 {
                    cut = s + p;
                }
            }
        }
        if cut <= s {
            cut = text[s..]
                .chars()
                .next()
                .map(|c| s + c.len_utf8())
                .unwrap_or(end);
        }

        let piece = &text[s..cut];
        let lead = piece.len() - piece.trim_start().len();
        let piece_end = s + piece.trim_end().len();
        if s + lead < piece_end {
            out.push((s + lead, piece_end));
        }
        s = cut;
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn make_span(text: &str, ordinal: i64, start: usize, end: usize) -> TextSpan {
    let slice = &text[start..end];
    TextSpan {
        ordinal,
        start,
        end,
        text: slice.to_string(),
        hash: content_hash(slice),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(max_tokens: usize, overlap_tokens: usize) -> ChunkParams {
        ChunkParams::new(max_tokens, overlap_tokens)
    }

    #[test]
    fn test_small_text_single_span() {
        let spans = split_text("Hello, world!", &params(700, 0));
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].ordinal, 0);
        assert_eq!(spans[0].text, "Hello, world!");
    }

    #[test]
    fn test_empty_and_blank_text() {
        assert!(split_text("", &params(700, 0)).is_empty());
        assert!(split_text("  \n\n \t\n", &params(700, 0)).is_empty());
    }

    #[test]
    fn test_spans_are_exact_source_slices() {
        let text = "  First paragraph.\n\nSecond paragraph.  \n\n\nThird one.\n";
        for span in split_text(text, &params(5, 2)) {
            assert_eq!(&text[span.start..span.end], span.text);
            assert_eq!(span.text, span.text.trim());
        }
    }

    #[test]
    fn test_paragraphs_packed_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let spans = split_text(text, &params(700, 0));
        assert_eq!(spans.len(), 1);
        assert!(spans[0].text.contains("First paragraph."));
        assert!(spans[0].text.contains("Third paragraph."));
    }

    #[test]
    fn test_ordinals_contiguous() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let spans = split_text(&text, &params(10, 3));
        assert!(spans.len() > 1);
        for (i, s) in spans.iter().enumerate() {
            assert_eq!(s.ordinal, i as i64, "ordinal mismatch at position {}", i);
        }
    }

    #[test]
    fn test_span_size_bounded() {
        let text = (0..40)
            .map(|i| format!("Sentence {} talks about something.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        for s in split_text(&text, &params(20, 5)) {
            assert!(s.text.len() <= 80, "span too long: {}", s.text.len());
        }
    }

    #[test]
    fn test_overlap_repeats_trailing_unit() {
        let text = "aaaa aaaa\n\nbbbb bbbb\n\ncccc cccc\n\ndddd dddd";
        // 24 chars per span, 12 chars of overlap: each span is two units
        // and the second unit is carried into the next span.
        let spans = split_text(text, &params(6, 3));
        assert!(spans.len() >= 3);
        assert!(spans[0].text.ends_with("bbbb bbbb"));
        assert!(spans[1].text.starts_with("bbbb bbbb"));
        for pair in spans.windows(2) {
            assert!(pair[1].start > pair[0].start);
            assert!(pair[1].start < pair[0].end, "expected overlapping ranges");
        }
    }

    #[test]
    fn test_no_overlap_ranges_disjoint() {
        let text = "aaaa aaaa\n\nbbbb bbbb\n\ncccc cccc\n\ndddd dddd";
        let spans = split_text(text, &params(6, 0));
        for pair in spans.windows(2) {
            assert!(pair[1].start >= pair[0].end);
        }
    }

    #[test]
    fn test_verse_markers_start_units() {
        assert!(is_verse_marker("3:16 For God so loved"));
        assert!(is_verse_marker("[12] The twelfth saying"));
        assert!(is_verse_marker("§ 4 Of anger"));
        assert!(!is_verse_marker("3 apples"));
        assert!(!is_verse_marker("Note: nothing here"));
        assert!(!is_verse_marker("[a] lettered"));
        assert!(!is_verse_marker("12: twelve"));

        let text = "1:1 In the beginning.\n1:2 And the earth.\n1:3 And there was light.";
        let spans = split_text(text, &params(6, 0));
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[1].text, "1:2 And the earth.");
    }

    #[test]
    fn test_verse_marker_reference() {
        assert_eq!(verse_marker("12:3 Be still").as_deref(), Some("12:3"));
        assert_eq!(verse_marker("  [7] The seventh").as_deref(), Some("§7"));
        assert_eq!(verse_marker("§ 4 Of anger").as_deref(), Some("§4"));
        assert_eq!(verse_marker("§4"), Some("§4".to_string()));
        assert_eq!(verse_marker("discipline brings freedom"), None);
        assert_eq!(verse_marker("§ of nothing"), None);
    }

    #[test]
    fn test_oversized_unit_hard_split() {
        let text = "word ".repeat(100);
        let spans = split_text(&text, &params(5, 0));
        assert!(spans.len() > 1);
        for s in &spans {
            assert!(s.text.len() <= 20);
            assert!(!s.text.is_empty());
        }
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let spans = split_text(text, &params(3, 1));
        assert!(!spans.is_empty());
        for s in &spans {
            assert_eq!(&text[s.start..s.end], s.text);
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let a = split_text(text, &params(3, 1));
        let b = split_text(text, &params(3, 1));
        assert_eq!(a, b);
    }
}
