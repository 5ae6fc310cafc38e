//! Corpus-size driven engine tuning.
//!
//! Everything here is a pure function of corpus size, requested result
//! count and query or document length, so it can be tested without an
//! engine.

use serde::{Deserialize, Serialize};

/// Corpora smaller than this are indexed with the widest bit-width.
pub const SMALL_CORPUS: usize = 5_000;
/// Corpora at least this large are indexed with the narrowest bit-width.
pub const MEDIUM_CORPUS: usize = 10_000;
pub const LARGE_CORPUS: usize = 100_000;

/// Candidate documents examined per query unless k demands more.
pub const BASE_NDOCS: usize = 1024;
pub const BASE_NCELLS: usize = 16;
pub const FAST_NDOCS: usize = 256;

/// Words-to-tokens expansion used for query and document length estimates.
const TOKENS_PER_WORD: f64 = 1.35;

/// Quantization and clustering settings for a full build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTuning {
    pub nbits: u8,
    pub kmeans_niters: usize,
    pub batch_size: usize,
}

impl BuildTuning {
    /// Small corpora keep more bits and more k-means iterations; both shrink
    /// as the corpus grows.
    pub fn for_corpus(passages: usize, batch_size: usize) -> Self {
        let nbits = if passages < SMALL_CORPUS {
            8
        } else if passages < MEDIUM_CORPUS {
            4
        } else {
            2
        };

        let kmeans_niters = if passages > LARGE_CORPUS {
            4
        } else if passages > 50_000 {
            10
        } else {
            20
        };

        Self {
            nbits,
            kmeans_niters,
            batch_size,
        }
    }
}

/// Recall parameters of a search session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    pub ncells: usize,
    pub ndocs: usize,
    /// `None` keeps the engine's own default.
    pub centroid_score_threshold: Option<f32>,
}

impl SearchParams {
    pub const FAST: SearchParams = SearchParams {
        ncells: 1,
        ndocs: FAST_NDOCS,
        centroid_score_threshold: Some(0.5),
    };
}

/// Base parameters chosen once per session from the corpus size.
pub fn base_search_params(corpus_size: usize, fast: bool) -> SearchParams {
    if fast {
        return SearchParams::FAST;
    }

    let (ncells, centroid_score_threshold) = if corpus_size < MEDIUM_CORPUS {
        (8, Some(0.4))
    } else if corpus_size < LARGE_CORPUS {
        (4, Some(0.45))
    } else {
        (BASE_NCELLS, None)
    };

    SearchParams {
        ncells,
        ndocs: BASE_NDOCS,
        centroid_score_threshold,
    }
}

/// Parameters for one query, derived from the base parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryPlan {
    /// Effective result count after clamping to the corpus size.
    pub k: usize,
    pub params: SearchParams,
    /// The requested k exceeded the corpus and was lowered.
    pub clamped: bool,
}

/// Derive per-query parameters. `fast` replaces the base with the fastest
/// settings regardless of corpus size.
pub fn tune(
    corpus_size: usize,
    k: usize,
    base: SearchParams,
    fast: bool,
) -> QueryPlan {
    let base = if fast { SearchParams::FAST } else { base };

    let clamped = k > corpus_size;
    let k = k.min(corpus_size);

    let mut params = base;
    if k > 32 * base.ncells {
        params.ncells = (k / 32 + 2).min(base.ncells);
    }
    params.ndocs = (k * 4).max(base.ndocs);

    QueryPlan { k, params, clamped }
}

/// Whitespace-separated word count, counting empty runs like a plain split.
fn word_count(text: &str) -> usize {
    text.split(' ').count()
}

/// Token budget for encoding one query: at least `min_len`, scaled with the
/// query's word count, never above `max_tokens`.
pub fn query_maxlen(query: &str, min_len: usize, max_tokens: usize) -> usize {
    let estimate = (word_count(query) as f64 * TOKENS_PER_WORD) as usize;
    estimate.max(min_len).min(max_tokens)
}

/// Token budget for a batch of queries, sized by the longest one.
pub fn batch_query_maxlen<S: AsRef<str>>(
    queries: &[S],
    min_len: usize,
    max_tokens: usize,
) -> usize {
    queries
        .iter()
        .map(|q| query_maxlen(q.as_ref(), min_len, max_tokens))
        .max()
        .unwrap_or(min_len.min(max_tokens))
}

/// Documents estimated above this many tokens get a slowness warning.
pub const LONG_DOCUMENT_TOKENS: usize = 300;
const MIN_DOCUMENT_TOKENS: usize = 256;

/// Document encoding length for an in-memory batch.
///
/// Takes the 90th percentile of word counts, converts to tokens, rounds up
/// to a multiple of 32 with 10% headroom, and caps at `max_tokens`. Never
/// returns less than 256.
pub fn document_maxlen<S: AsRef<str>>(documents: &[S], max_tokens: usize) -> usize {
    let mut counts: Vec<usize> =
        documents.iter().map(|d| word_count(d.as_ref())).collect();
    if counts.is_empty() {
        return MIN_DOCUMENT_TOKENS;
    }
    counts.sort_unstable();

    let p90 = percentile(&counts, 0.9);
    let rounded = ((p90 * TOKENS_PER_WORD) / 32.0).ceil() * 32.0;
    let with_headroom = (rounded * 1.1).floor() as usize;
    with_headroom.min(max_tokens).max(MIN_DOCUMENT_TOKENS)
}

/// Linear-interpolated percentile of an ascending slice.
fn percentile(sorted: &[usize], q: f64) -> f64 {
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] as f64 + (sorted[hi] as f64 - sorted[lo] as f64) * frac
}
