//! Token-window chunking for extracted document text.
//!
//! Text is tokenized into a stream of byte spans and cut into sliding windows of `max_tokens`
//! tokens, each window starting `max_tokens - overlap_tokens` tokens after the previous one. The
//! last window may be shorter. A chunk is the slice of the source text its window covers, so
//! chunk text is never re-decoded. BPE tokens can end partway through a multi-byte character;
//! window edges are moved back onto the nearest character boundary.
//! Chunk boundaries depend only on the text, the tokenizer, and the two budgets, so
//! reprocessing a document reproduces the same chunk set.
//!
//! Token counting prefers `tiktoken-rs` encodings. When the tokenizer cannot be built or fails
//! on the input, the engine falls back to a coarser split driven by `semchunk-rs` with a
//! whitespace word counter, so the document still yields usable chunks.

use anyhow::{Error as TokenizerError, anyhow};
use semchunk_rs::Chunker;
use std::ops::Range;
use std::sync::Arc;
use tiktoken_rs::{CoreBPE, cl100k_base, get_bpe_from_model, o200k_base, p50k_base, r50k_base};

use super::types::ChunkingError;

/// Splits text into tokens.
pub trait Tokenizer: Send + Sync {
    /// Byte range of every token in `text`, in order and non-overlapping.
    fn token_spans(&self, text: &str) -> Result<Vec<Range<usize>>, ChunkingError>;

    /// Number of tokens in `text`.
    fn count_tokens(&self, text: &str) -> Result<usize, ChunkingError> {
        self.token_spans(text).map(|spans| spans.len())
    }
}

/// BPE tokenizer backed by a tiktoken encoding.
pub struct TiktokenTokenizer {
    name: String,
    bpe: CoreBPE,
}

impl TiktokenTokenizer {
    /// Load the encoding by encoding name (`cl100k_base`) or model name (`gpt-4o`).
    pub fn new(name: &str) -> Result<Self, ChunkingError> {
        let normalized = name.trim();
        let target = if normalized.is_empty() {
            "cl100k_base"
        } else {
            normalized
        };
        let bpe = resolve_encoding(target).map_err(|source| ChunkingError::Tokenizer {
            encoding: target.to_string(),
            source,
        })?;
        Ok(Self {
            name: target.to_string(),
            bpe,
        })
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn token_spans(&self, text: &str) -> Result<Vec<Range<usize>>, ChunkingError> {
        let tokens = self.bpe.encode_ordinary(text);
        let mut spans = Vec::with_capacity(tokens.len());
        let mut offset = 0;
        // Ordinary encodings are byte-lossless, so token bytes tile the input.
        for bytes in self.bpe._decode_native_and_split(tokens) {
            let end = offset + bytes.len();
            if text.as_bytes().get(offset..end) != Some(bytes.as_slice()) {
                return Err(ChunkingError::Tokenizer {
                    encoding: self.name.clone(),
                    source: anyhow!("token bytes diverge from the input at byte {offset}"),
                });
            }
            spans.push(offset..end);
            offset = end;
        }
        if offset != text.len() {
            return Err(ChunkingError::Tokenizer {
                encoding: self.name.clone(),
                source: anyhow!("tokens cover {offset} of {} bytes", text.len()),
            });
        }
        Ok(spans)
    }

    fn count_tokens(&self, text: &str) -> Result<usize, ChunkingError> {
        Ok(self.bpe.encode_ordinary(text).len())
    }
}

fn resolve_encoding(name: &str) -> Result<CoreBPE, TokenizerError> {
    match name {
        "cl100k_base" => cl100k_base(),
        "o200k_base" => o200k_base(),
        "p50k_base" => p50k_base(),
        "r50k_base" | "gpt2" => r50k_base(),
        model => get_bpe_from_model(model),
    }
}

/// Whitespace word tokenizer.
///
/// Every maximal run of non-whitespace characters is one token. Stateless, so one instance can
/// serve any number of concurrent workers.
#[derive(Debug, Default, Clone, Copy)]
pub struct WordTokenizer;

impl WordTokenizer {
    /// Create a word tokenizer.
    pub fn new() -> Self {
        Self
    }
}

impl Tokenizer for WordTokenizer {
    fn token_spans(&self, text: &str) -> Result<Vec<Range<usize>>, ChunkingError> {
        let mut spans = Vec::new();
        let mut word_start = None;
        for (index, ch) in text.char_indices() {
            match (ch.is_whitespace(), word_start) {
                (true, Some(start)) => {
                    spans.push(start..index);
                    word_start = None;
                }
                (false, None) => word_start = Some(index),
                _ => {}
            }
        }
        if let Some(start) = word_start {
            spans.push(start..text.len());
        }
        Ok(spans)
    }
}

/// Splits document text into overlapping token-bounded chunks.
#[derive(Clone)]
pub struct ChunkingEngine {
    tokenizer: Option<Arc<dyn Tokenizer>>,
}

impl ChunkingEngine {
    /// Build an engine around an explicit tokenizer.
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            tokenizer: Some(tokenizer),
        }
    }

    /// Build an engine over a tiktoken encoding.
    ///
    /// When the encoding cannot be loaded the engine is still usable and always takes the
    /// fallback split; the failure is logged at `warn` level.
    pub fn from_encoding(name: &str) -> Self {
        match TiktokenTokenizer::new(name) {
            Ok(tokenizer) => Self::new(Arc::new(tokenizer)),
            Err(error) => {
                tracing::warn!(
                    encoding = name,
                    error = %error,
                    "Tokenizer unavailable; chunking will use the fallback splitter"
                );
                Self::without_tokenizer()
            }
        }
    }

    /// Build an engine that always uses the fallback splitter.
    pub fn without_tokenizer() -> Self {
        Self { tokenizer: None }
    }

    /// Split `text` into windows of at most `max_tokens` tokens sharing `overlap_tokens`.
    ///
    /// Returns an empty vector when the input is blank. Chunk texts are trimmed; windows
    /// that cover only whitespace are kept so ordinals stay aligned with window positions.
    pub fn split(
        &self,
        text: &str,
        max_tokens: usize,
        overlap_tokens: usize,
    ) -> Result<Vec<String>, ChunkingError> {
        if max_tokens == 0 {
            return Err(ChunkingError::InvalidChunkSize);
        }
        if overlap_tokens >= max_tokens {
            return Err(ChunkingError::InvalidOverlap {
                overlap: overlap_tokens,
                max_tokens,
            });
        }
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let Some(tokenizer) = self.tokenizer.as_ref() else {
            return Ok(fallback_split(text, max_tokens));
        };

        match window_split(tokenizer.as_ref(), text, max_tokens, overlap_tokens) {
            Ok(chunks) => Ok(chunks),
            Err(error) => {
                tracing::warn!(
                    error = %error,
                    "Token window split failed; using fallback splitter"
                );
                Ok(fallback_split(text, max_tokens))
            }
        }
    }
}

fn window_split(
    tokenizer: &dyn Tokenizer,
    text: &str,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Result<Vec<String>, ChunkingError> {
    window_ranges(tokenizer, text, max_tokens, overlap_tokens)?
        .into_iter()
        .map(|range| {
            let offset = range.start;
            text.get(range)
                .map(|chunk| chunk.trim().to_string())
                .ok_or(ChunkingError::SplitCharacter { offset })
        })
        .collect()
}

/// Byte ranges of the token windows over `text`, each starting and ending on a character
/// boundary.
fn window_ranges(
    tokenizer: &dyn Tokenizer,
    text: &str,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Result<Vec<Range<usize>>, ChunkingError> {
    let spans = tokenizer.token_spans(text)?;
    if spans.is_empty() {
        return Ok(Vec::new());
    }

    let starts_cleanly = |index: usize| text.is_char_boundary(spans[index].start);
    let ends_cleanly = |end: usize| text.is_char_boundary(spans[end - 1].end);

    let step = max_tokens - overlap_tokens;
    let mut windows = Vec::with_capacity(spans.len() / step + 1);
    let mut start = 0;
    while start < spans.len() {
        let mut end = (start + max_tokens).min(spans.len());
        while end > start + 1 && !ends_cleanly(end) {
            end -= 1;
        }
        // One character wider than the whole window.
        while end < spans.len() && !ends_cleanly(end) {
            end += 1;
        }
        windows.push(spans[start].start..spans[end - 1].end);
        if end == spans.len() {
            break;
        }

        let preferred = end.saturating_sub(overlap_tokens).max(start + 1);
        start = (start + 1..=preferred)
            .rev()
            .find(|&index| starts_cleanly(index))
            .or_else(|| (preferred..end).find(|&index| starts_cleanly(index)))
            .unwrap_or(end);
    }

    tracing::debug!(
        tokens = spans.len(),
        chunks = windows.len(),
        max_tokens,
        overlap_tokens,
        "Split text into token windows"
    );
    Ok(windows)
}

/// Sentence-aware split bounded by a whitespace word budget.
fn fallback_split(text: &str, max_words: usize) -> Vec<String> {
    let chunker = Chunker::new(max_words, Box::new(count_words));
    chunker
        .chunk(text)
        .into_iter()
        .map(|chunk| chunk.trim().to_string())
        .filter(|chunk| !chunk.is_empty())
        .collect()
}

fn count_words(segment: &str) -> usize {
    let words = segment.split_whitespace().count();
    if words == 0 && !segment.is_empty() {
        1
    } else {
        words
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn word_engine() -> ChunkingEngine {
        ChunkingEngine::new(Arc::new(WordTokenizer::new()))
    }

    fn numbered_words(count: usize) -> String {
        (0..count)
            .map(|index| format!("w{index}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    struct BrokenTokenizer;

    impl Tokenizer for BrokenTokenizer {
        fn token_spans(&self, _text: &str) -> Result<Vec<Range<usize>>, ChunkingError> {
            Err(ChunkingError::Tokenizer {
                encoding: "broken".into(),
                source: anyhow!("no vocabulary"),
            })
        }
    }

    fn cl100k() -> TiktokenTokenizer {
        TiktokenTokenizer::new("cl100k_base").expect("encoding")
    }

    fn japanese_text() -> String {
        "東京都の天気は晴れです。私は寿司が好きです。🍣🍣 ".repeat(30)
    }

    #[test]
    fn three_thousand_tokens_yield_four_windows() {
        let text = numbered_words(3000);
        let chunks = word_engine().split(&text, 1024, 200).expect("split");

        assert_eq!(chunks.len(), 4);
        let sizes: Vec<usize> = chunks
            .iter()
            .map(|chunk| chunk.split_whitespace().count())
            .collect();
        assert_eq!(sizes, vec![1024, 1024, 1024, 528]);
        assert!(chunks[1].starts_with("w824 "));
        assert!(chunks[3].ends_with("w2999"));
    }

    #[test]
    fn blank_input_yields_no_chunks() {
        let engine = word_engine();
        assert!(engine.split("", 8, 2).expect("split").is_empty());
        assert!(engine.split(" \n\t ", 8, 2).expect("split").is_empty());
    }

    #[test]
    fn rejects_zero_budget_and_oversized_overlap() {
        let engine = word_engine();
        assert!(matches!(
            engine.split("hello", 0, 0),
            Err(ChunkingError::InvalidChunkSize)
        ));
        assert!(matches!(
            engine.split("hello", 4, 4),
            Err(ChunkingError::InvalidOverlap { .. })
        ));
    }

    #[test]
    fn input_shorter_than_window_is_one_chunk() {
        let chunks = word_engine().split("one two three", 8, 2).expect("split");
        assert_eq!(chunks, vec!["one two three"]);
    }

    #[test]
    fn tokenizer_failure_falls_back_to_coarse_split() {
        let engine = ChunkingEngine::new(Arc::new(BrokenTokenizer));
        let text = "First sentence here. Second sentence follows. Third one ends it.";
        let chunks = engine.split(text, 4, 1).expect("fallback split");

        assert!(!chunks.is_empty());
        let rejoined: Vec<&str> = chunks.iter().flat_map(|c| c.split_whitespace()).collect();
        let original: Vec<&str> = text.split_whitespace().collect();
        assert_eq!(rejoined, original);
        for chunk in &chunks {
            assert!(count_words(chunk) <= 4);
        }
    }

    #[test]
    fn missing_tokenizer_is_deterministic() {
        let engine = ChunkingEngine::without_tokenizer();
        let text = numbered_words(57);
        let first = engine.split(&text, 10, 2).expect("split");
        let second = engine.split(&text, 10, 2).expect("split");
        assert_eq!(first, second);
    }

    #[test]
    fn tiktoken_windows_respect_budget() {
        let tokenizer = Arc::new(cl100k());
        let engine = ChunkingEngine::new(tokenizer.clone());
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(40);
        let chunks = engine.split(&text, 32, 8).expect("split");

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(tokenizer.count_tokens(chunk).expect("count") <= 33);
        }
        assert_eq!(chunks, engine.split(&text, 32, 8).expect("split"));
    }

    #[test]
    fn tiktoken_spans_tile_multibyte_text() {
        let text = japanese_text();
        let spans = cl100k().token_spans(&text).expect("spans");

        assert_eq!(spans.first().map(|span| span.start), Some(0));
        assert_eq!(spans.last().map(|span| span.end), Some(text.len()));
        assert!(spans.windows(2).all(|pair| pair[0].end == pair[1].start));
        // Some tokens end inside a character; windows must not.
        assert!(spans.iter().any(|span| !text.is_char_boundary(span.end)));
    }

    #[test]
    fn multibyte_windows_stay_on_character_boundaries() {
        let tokenizer = cl100k();
        let text = japanese_text();
        let spans = tokenizer.token_spans(&text).expect("spans");
        let windows = window_ranges(&tokenizer, &text, 16, 4).expect("windows");

        assert!(windows.len() >= spans.len() / 16, "got {} windows", windows.len());
        assert_eq!(windows.first().map(|window| window.start), Some(0));
        assert_eq!(windows.last().map(|window| window.end), Some(text.len()));
        for window in &windows {
            assert!(text.is_char_boundary(window.start));
            assert!(text.is_char_boundary(window.end));
            let inside = spans
                .iter()
                .filter(|span| span.start >= window.start && span.end <= window.end)
                .count();
            assert!(inside <= 16, "window {window:?} holds {inside} tokens");
        }
        for pair in windows.windows(2) {
            assert!(pair[1].start > pair[0].start);
            assert!(pair[1].start < pair[0].end, "adjacent windows must overlap");
        }
    }

    #[test]
    fn multibyte_text_uses_token_windows_not_fallback() {
        let tokenizer = Arc::new(cl100k());
        let engine = ChunkingEngine::new(tokenizer.clone());
        let text = japanese_text();
        let chunks = engine.split(&text, 16, 4).expect("split");

        let total = tokenizer.count_tokens(&text).expect("count");
        assert!(chunks.len() * 16 >= total, "{} chunks for {total} tokens", chunks.len());
        for chunk in &chunks {
            assert!(text.contains(chunk.as_str()));
            assert!(tokenizer.count_tokens(chunk).expect("count") <= 17);
        }
    }

    #[test]
    fn character_wider_than_window_is_kept_whole() {
        let engine = ChunkingEngine::new(Arc::new(cl100k()));
        let chunks = engine.split("🍣", 1, 0).expect("split");
        assert_eq!(chunks, vec!["🍣"]);
    }

    #[test]
    fn word_spans_point_into_the_source() {
        let text = "  alpha\tbeta\n\ngamma  ";
        let spans = WordTokenizer::new().token_spans(text).expect("spans");
        let words: Vec<&str> = spans.iter().map(|span| &text[span.clone()]).collect();
        assert_eq!(words, vec!["alpha", "beta", "gamma"]);
    }

    proptest! {
        #[test]
        fn windows_cover_every_token_once_overlap_is_removed(
            words in proptest::collection::vec("[a-z]{1,6}", 1..400),
            max_tokens in 2usize..64,
            overlap_seed in 0usize..64,
        ) {
            let overlap = overlap_seed % max_tokens;
            let text = words.join(" ");
            let chunks = word_engine().split(&text, max_tokens, overlap).expect("split");

            let mut covered: Vec<String> = Vec::new();
            for (ordinal, chunk) in chunks.iter().enumerate() {
                let tokens: Vec<&str> = chunk.split_whitespace().collect();
                prop_assert!(tokens.len() <= max_tokens);
                let skip = if ordinal == 0 { 0 } else { overlap };
                covered.extend(tokens.into_iter().skip(skip).map(str::to_string));
            }
            prop_assert_eq!(covered, words);
        }
    }
}
