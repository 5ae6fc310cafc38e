use std::collections::HashSet;

use candle_core::Tensor;
use rayon::prelude::*;
use serde::Serialize;
use tracing::warn;

use crate::{
    collection::Passage,
    embedding::{EncodeOptions, encode_passages, matrix_to_tensor},
    embedding_db::EmbeddingMatrix,
    engine::{RankedPassage, rank_top_k},
    error::{Error, Result},
    identity::PassageId,
    model_manager::{ModelManager, candle_err},
    tuning,
};

/// Batches above this size get a slowness warning.
pub const LARGE_RERANK_BATCH: usize = 1_000;

/// Score every candidate against the query in parallel and keep the top `k`.
/// The first candidate that cannot be scored (for instance a matrix from a
/// checkpoint with a different dimension) fails the whole call.
pub fn score_candidates(
    query_embedding: &Tensor,
    candidates: &[(PassageId, EmbeddingMatrix)],
    k: usize,
) -> Result<Vec<RankedPassage>> {
    let scored = candidates
        .par_iter()
        .map(|(pid, matrix)| {
            let doc = matrix_to_tensor(matrix)?;
            let score = maxsim(query_embedding, &doc).map_err(|e| {
                Error::Engine(format!("cannot score passage {pid}: {e}"))
            })?;
            Ok((*pid, score))
        })
        .collect::<Result<Vec<(PassageId, f32)>>>()?;

    Ok(rank_top_k(scored, k))
}

/// MaxSim between a query `[Q, D]` and a document `[T, D]`: for every query
/// token take its best dot product over document tokens, then sum.
pub fn maxsim(query_embedding: &Tensor, doc_embedding: &Tensor) -> Result<f32> {
    let sim_matrix = query_embedding
        .matmul(&doc_embedding.t().map_err(candle_err)?)
        .map_err(candle_err)?;

    sim_matrix
        .max(1)
        .and_then(|row_maxes| row_maxes.sum_all())
        .and_then(|total| total.to_scalar::<f32>())
        .map_err(candle_err)
}

/// Settings for an index-free rerank, derived from the batch itself.
#[derive(Debug, Clone, PartialEq)]
pub struct RerankPlan {
    pub k: usize,
    pub doc_maxlen: usize,
    pub warnings: Vec<String>,
}

/// Work out k and the document encoding length for a rerank batch,
/// collecting the soft warnings the caller should see.
pub fn plan_rerank(documents: &[String], k: usize, max_tokens: usize) -> RerankPlan {
    let mut warnings = Vec::new();

    let k = if k > documents.len() {
        warnings.push(format!(
            "k ({k}) is larger than the number of documents ({}), lowering it",
            documents.len()
        ));
        documents.len()
    } else {
        k
    };

    if documents.len() > LARGE_RERANK_BATCH {
        warnings.push(format!(
            "reranking {} documents in memory may be slow; consider building an index",
            documents.len()
        ));
    }

    let mut seen = HashSet::with_capacity(documents.len());
    let duplicates = documents.iter().filter(|d| !seen.insert(d.as_str())).count();
    if duplicates > 0 {
        warnings.push(format!(
            "{duplicates} duplicate documents in the batch; they will receive identical scores"
        ));
    }

    let doc_maxlen = tuning::document_maxlen(documents, max_tokens);
    if doc_maxlen > tuning::LONG_DOCUMENT_TOKENS {
        warnings.push(format!(
            "documents are long ({doc_maxlen} tokens at the 90th percentile estimate); \
             reranking may be slow, consider shorter chunks"
        ));
    }

    RerankPlan {
        k,
        doc_maxlen,
        warnings,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RerankHit {
    pub content: String,
    pub score: f32,
    pub rank: usize,
    /// Position of the document in the input batch.
    pub result_index: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RerankReport {
    pub hits: Vec<RerankHit>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct RerankOptions {
    pub k: usize,
    pub zero_index_ranks: bool,
    pub min_query_length: usize,
    pub max_tokens: usize,
    pub batch_size: usize,
}

/// Rank an in-memory list of documents against a query without an index.
pub fn rerank(
    model: &mut ModelManager,
    query: &str,
    documents: &[String],
    options: RerankOptions,
) -> Result<RerankReport> {
    let plan = plan_rerank(documents, options.k, options.max_tokens);
    for warning in &plan.warnings {
        warn!("{warning}");
    }
    if plan.k == 0 {
        return Ok(RerankReport {
            hits: Vec::new(),
            warnings: plan.warnings,
        });
    }

    let passages: Vec<Passage> = documents
        .iter()
        .enumerate()
        .map(|(i, content)| Passage {
            passage_id: i as PassageId,
            content: content.clone(),
        })
        .collect();
    let encoded = encode_passages(
        model,
        &passages,
        EncodeOptions {
            batch_size: options.batch_size,
            doc_maxlen: plan.doc_maxlen,
            progress: false,
        },
    )?;

    let query_maxlen =
        tuning::query_maxlen(query, options.min_query_length, options.max_tokens);
    let query_embedding = model.encode_query(query, query_maxlen)?;

    let hits = score_candidates(&query_embedding, &encoded, plan.k)?
        .into_iter()
        .map(|ranked| {
            let idx = ranked.passage_id as usize;
            RerankHit {
                content: documents[idx].clone(),
                score: ranked.score,
                rank: if options.zero_index_ranks {
                    ranked.rank - 1
                } else {
                    ranked.rank
                },
                result_index: idx,
            }
        })
        .collect();

    Ok(RerankReport {
        hits,
        warnings: plan.warnings,
    })
}
