//! The vector-engine seam.
//!
//! The lifecycle controller only talks to an engine through
//! [`VectorEngine`] and its [`SearchSession`]. [`ColbertEngine`] is the
//! model-backed implementation; [`MemoryEngine`] keeps everything in RAM and
//! scores by term overlap, which is enough to exercise the identity and
//! lifecycle logic without a model.
//!
//! [`ColbertEngine`]: crate::colbert_engine::ColbertEngine

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};

use crate::{
    collection::Passage,
    error::{Error, Result},
    identity::PassageId,
    tuning::{BuildTuning, SearchParams},
};

pub const INDEX_TYPE: &str = "PLAID";

/// What to do when an index directory already exists at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverwritePolicy {
    /// Keep the existing engine files.
    Reuse,
    #[default]
    Overwrite,
    /// Overwrite without logging.
    ForceSilentOverwrite,
}

/// Engine-opaque state of a built index, stored under the `colbertdb` key
/// of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexHandle {
    pub checkpoint: String,
    pub index_root: PathBuf,
    pub index_name: String,
    pub nbits: u8,
    pub kmeans_niters: usize,
    pub doc_maxlen: usize,
    pub index_bsize: usize,
    #[serde(default = "default_index_type")]
    pub index_type: String,
}

fn default_index_type() -> String {
    INDEX_TYPE.to_string()
}

impl IndexHandle {
    pub fn new(request: &BuildRequest<'_>) -> Self {
        Self {
            checkpoint: request.checkpoint.to_string(),
            index_root: request.index_root.to_path_buf(),
            index_name: request.index_name.to_string(),
            nbits: request.tuning.nbits,
            kmeans_niters: request.tuning.kmeans_niters,
            doc_maxlen: request.doc_maxlen,
            index_bsize: request.tuning.batch_size,
            index_type: default_index_type(),
        }
    }

    pub fn index_dir(&self) -> PathBuf {
        self.index_root.join(&self.index_name)
    }
}

/// Everything an engine needs for a full build.
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub checkpoint: &'a str,
    pub index_root: &'a Path,
    pub index_name: &'a str,
    pub passages: &'a [Passage],
    pub overwrite: OverwritePolicy,
    pub tuning: BuildTuning,
    pub doc_maxlen: usize,
}

/// One engine result, before passage ids are translated to documents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedPassage {
    pub passage_id: PassageId,
    /// 1-based position in the result list.
    pub rank: usize,
    pub score: f32,
}

/// A live search session over one index. Sessions are also the handle
/// through which incremental updates reach the index.
pub trait SearchSession: Send {
    fn params(&self) -> SearchParams;

    fn configure(&mut self, params: SearchParams);

    fn set_query_maxlen(&mut self, maxlen: usize);

    fn num_passages(&self) -> usize;

    /// Top-`k` passages for `query`. `allowed` restricts the candidates to
    /// the given passage ids.
    fn search(
        &mut self,
        query: &str,
        k: usize,
        allowed: Option<&[PassageId]>,
    ) -> Result<Vec<RankedPassage>>;

    fn batch_search(
        &mut self,
        queries: &[String],
        k: usize,
    ) -> Result<Vec<Vec<RankedPassage>>> {
        queries.iter().map(|q| self.search(q, k, None)).collect()
    }
}

pub trait VectorEngine: Send + Sync {
    type Session: SearchSession;

    /// Encode and index every passage, replacing whatever the index
    /// directory held according to the overwrite policy.
    fn build(&self, request: BuildRequest<'_>) -> Result<IndexHandle>;

    fn open_session(
        &self,
        handle: &IndexHandle,
        passages: &[Passage],
    ) -> Result<Self::Session>;

    /// Encode and insert only the given passages into an open session.
    fn incremental_add(
        &self,
        session: &mut Self::Session,
        passages: &[Passage],
    ) -> Result<()>;

    fn remove(
        &self,
        session: &mut Self::Session,
        passage_ids: &[PassageId],
    ) -> Result<()>;

    /// Flush updates made through the session to the index directory.
    fn persist(&self, session: &mut Self::Session) -> Result<()>;
}

/// Turn scored candidates into a ranked top-`k` list. Higher scores first,
/// ties broken by the lower passage id.
pub fn rank_top_k(
    mut scored: Vec<(PassageId, f32)>,
    k: usize,
) -> Vec<RankedPassage> {
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored
        .into_iter()
        .take(k)
        .enumerate()
        .map(|(i, (passage_id, score))| RankedPassage {
            passage_id,
            rank: i + 1,
            score,
        })
        .collect()
}

/// Calls observed by a [`MemoryEngine`], in order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Build { index_name: String, passages: usize, nbits: u8 },
    Open { index_name: String, passages: usize },
    Configure(SearchParams),
    Search { k: usize, params: SearchParams, query_maxlen: usize },
    IncrementalAdd(Vec<PassageId>),
    Remove(Vec<PassageId>),
    Persist,
}

pub type CallLog = Arc<Mutex<Vec<EngineCall>>>;

fn record(log: &CallLog, call: EngineCall) {
    if let Ok(mut calls) = log.lock() {
        calls.push(call);
    }
}

/// In-RAM engine scoring passages by how many distinct query terms they
/// contain.
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    calls: CallLog,
    fail_builds: bool,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine whose builds always fail.
    pub fn failing() -> Self {
        Self {
            fail_builds: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }
}

#[derive(Debug)]
pub struct MemorySession {
    passages: Vec<Passage>,
    params: SearchParams,
    query_maxlen: usize,
    calls: CallLog,
}

impl MemorySession {
    pub fn passage_ids(&self) -> Vec<PassageId> {
        self.passages.iter().map(|p| p.passage_id).collect()
    }
}

fn terms(text: &str) -> BTreeSet<String> {
    text.split_whitespace()
        .map(|t| {
            t.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

impl SearchSession for MemorySession {
    fn params(&self) -> SearchParams {
        self.params
    }

    fn configure(&mut self, params: SearchParams) {
        self.params = params;
        record(&self.calls, EngineCall::Configure(params));
    }

    fn set_query_maxlen(&mut self, maxlen: usize) {
        self.query_maxlen = maxlen;
    }

    fn num_passages(&self) -> usize {
        self.passages.len()
    }

    fn search(
        &mut self,
        query: &str,
        k: usize,
        allowed: Option<&[PassageId]>,
    ) -> Result<Vec<RankedPassage>> {
        record(
            &self.calls,
            EngineCall::Search {
                k,
                params: self.params,
                query_maxlen: self.query_maxlen,
            },
        );

        let query_terms = terms(query);
        let allowed: Option<BTreeSet<PassageId>> =
            allowed.map(|ids| ids.iter().copied().collect());

        let scored = self
            .passages
            .iter()
            .filter(|p| {
                allowed.as_ref().is_none_or(|a| a.contains(&p.passage_id))
            })
            .map(|p| {
                let overlap =
                    terms(&p.content).intersection(&query_terms).count();
                (p.passage_id, overlap as f32)
            })
            .collect();

        Ok(rank_top_k(scored, k))
    }
}

impl VectorEngine for MemoryEngine {
    type Session = MemorySession;

    fn build(&self, request: BuildRequest<'_>) -> Result<IndexHandle> {
        if self.fail_builds {
            return Err(Error::Build("memory engine configured to fail".into()));
        }

        let handle = IndexHandle::new(&request);
        let dir = handle.index_dir();
        if request.overwrite != OverwritePolicy::Reuse && dir.exists() {
            let metadata = dir.join(crate::data_dir::ENGINE_METADATA_FILE);
            if metadata.exists() {
                std::fs::remove_file(&metadata)?;
            }
        }
        std::fs::create_dir_all(&dir)?;

        let engine_metadata = serde_json::json!({
            "engine": "memory",
            "num_passages": request.passages.len(),
            "nbits": request.tuning.nbits,
        });
        std::fs::write(
            dir.join(crate::data_dir::ENGINE_METADATA_FILE),
            serde_json::to_vec_pretty(&engine_metadata)?,
        )?;

        record(
            &self.calls,
            EngineCall::Build {
                index_name: request.index_name.to_string(),
                passages: request.passages.len(),
                nbits: request.tuning.nbits,
            },
        );
        Ok(handle)
    }

    fn open_session(
        &self,
        handle: &IndexHandle,
        passages: &[Passage],
    ) -> Result<MemorySession> {
        record(
            &self.calls,
            EngineCall::Open {
                index_name: handle.index_name.clone(),
                passages: passages.len(),
            },
        );
        Ok(MemorySession {
            passages: passages.to_vec(),
            params: crate::tuning::base_search_params(passages.len(), false),
            query_maxlen: 32,
            calls: Arc::clone(&self.calls),
        })
    }

    fn incremental_add(
        &self,
        session: &mut MemorySession,
        passages: &[Passage],
    ) -> Result<()> {
        record(
            &self.calls,
            EngineCall::IncrementalAdd(
                passages.iter().map(|p| p.passage_id).collect(),
            ),
        );
        session.passages.extend_from_slice(passages);
        Ok(())
    }

    fn remove(
        &self,
        session: &mut MemorySession,
        passage_ids: &[PassageId],
    ) -> Result<()> {
        record(&self.calls, EngineCall::Remove(passage_ids.to_vec()));
        session
            .passages
            .retain(|p| !passage_ids.contains(&p.passage_id));
        Ok(())
    }

    fn persist(&self, _session: &mut MemorySession) -> Result<()> {
        record(&self.calls, EngineCall::Persist);
        Ok(())
    }
}
