//! Model-backed engine: passages are encoded with a ColBERT checkpoint,
//! their token matrices live in a redb file inside the index directory,
//! and queries are scored exhaustively with MaxSim.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::{
    collection::Passage,
    data_dir::ENGINE_METADATA_FILE,
    embedding::{EncodeOptions, embed_and_store},
    embedding_db::{EMBEDDINGS_FILE, EmbeddingDb, EmbeddingMatrix},
    engine::{
        BuildRequest, IndexHandle, OverwritePolicy, RankedPassage, SearchSession,
        VectorEngine,
    },
    error::{Error, Result},
    identity::PassageId,
    model_manager::ModelManager,
    reranker::score_candidates,
    tuning::{self, SearchParams},
};

type SharedModel = Arc<Mutex<ModelManager>>;

const DEFAULT_QUERY_MAXLEN: usize = 32;

fn lock_model(model: &SharedModel) -> Result<MutexGuard<'_, ModelManager>> {
    model.lock().map_err(|_| Error::LockPoisoned("model"))
}

/// Swap in a different checkpoint if the index asks for one.
fn select_checkpoint(model: &mut ModelManager, checkpoint: &str) {
    if model.model_id() != checkpoint {
        info!(from = model.model_id(), to = checkpoint, "switching model checkpoint");
        *model = ModelManager::with_model_id(checkpoint.to_string());
    }
}

pub struct ColbertEngine {
    model: SharedModel,
    progress: bool,
}

impl ColbertEngine {
    pub fn new(model: ModelManager) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
            progress: false,
        }
    }

    /// Show a progress bar while encoding.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn model_id(&self) -> Result<String> {
        Ok(lock_model(&self.model)?.model_id().to_string())
    }

    fn encode_into(
        &self,
        db: &EmbeddingDb,
        checkpoint: &str,
        passages: &[Passage],
        doc_maxlen: usize,
        batch_size: usize,
    ) -> Result<usize> {
        let mut model = lock_model(&self.model)?;
        select_checkpoint(&mut model, checkpoint);
        embed_and_store(
            &mut model,
            db,
            passages,
            EncodeOptions {
                batch_size,
                doc_maxlen,
                progress: self.progress,
            },
        )
    }
}

fn write_engine_metadata(index_dir: &Path, update: Map<String, Value>) -> Result<()> {
    let path = index_dir.join(ENGINE_METADATA_FILE);
    let mut metadata = match std::fs::read(&path) {
        Ok(bytes) => match serde_json::from_slice(&bytes)? {
            Value::Object(map) => map,
            _ => Map::new(),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
        Err(e) => return Err(e.into()),
    };
    metadata.extend(update);
    std::fs::write(&path, serde_json::to_vec_pretty(&Value::Object(metadata))?)?;
    Ok(())
}

fn engine_metadata(request: &BuildRequest<'_>) -> Map<String, Value> {
    let value = json!({
        "engine": "colbert-maxsim",
        "checkpoint": request.checkpoint,
        "num_passages": request.passages.len(),
        "nbits": request.tuning.nbits,
        "kmeans_niters": request.tuning.kmeans_niters,
        "doc_maxlen": request.doc_maxlen,
        "index_bsize": request.tuning.batch_size,
    });
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub struct ColbertSession {
    model: SharedModel,
    checkpoint: String,
    index_dir: PathBuf,
    db: EmbeddingDb,
    candidates: Vec<(PassageId, EmbeddingMatrix)>,
    params: SearchParams,
    query_maxlen: usize,
    doc_maxlen: usize,
    batch_size: usize,
}

impl SearchSession for ColbertSession {
    fn params(&self) -> SearchParams {
        self.params
    }

    fn configure(&mut self, params: SearchParams) {
        self.params = params;
    }

    fn set_query_maxlen(&mut self, maxlen: usize) {
        self.query_maxlen = maxlen;
    }

    fn num_passages(&self) -> usize {
        self.candidates.len()
    }

    fn search(
        &mut self,
        query: &str,
        k: usize,
        allowed: Option<&[PassageId]>,
    ) -> Result<Vec<RankedPassage>> {
        let query_embedding = {
            let mut model = lock_model(&self.model)?;
            select_checkpoint(&mut model, &self.checkpoint);
            model.encode_query(query, self.query_maxlen)?
        };
        debug!(
            k,
            ncells = self.params.ncells,
            ndocs = self.params.ndocs,
            query_maxlen = self.query_maxlen,
            "scoring query"
        );

        let ranked = match allowed {
            Some(ids) => {
                let ids: BTreeSet<PassageId> = ids.iter().copied().collect();
                let subset: Vec<(PassageId, EmbeddingMatrix)> = self
                    .candidates
                    .iter()
                    .filter(|(pid, _)| ids.contains(pid))
                    .cloned()
                    .collect();
                score_candidates(&query_embedding, &subset, k)?
            }
            None => score_candidates(&query_embedding, &self.candidates, k)?,
        };
        Ok(ranked)
    }
}

impl VectorEngine for ColbertEngine {
    type Session = ColbertSession;

    fn build(&self, request: BuildRequest<'_>) -> Result<IndexHandle> {
        let handle = IndexHandle::new(&request);
        let index_dir = handle.index_dir();
        let db_path = index_dir.join(EMBEDDINGS_FILE);

        if db_path.exists() {
            match request.overwrite {
                OverwritePolicy::Reuse => {
                    info!(index = request.index_name, "reusing existing embeddings");
                }
                OverwritePolicy::Overwrite => {
                    info!(index = request.index_name, "overwriting existing index");
                    std::fs::remove_file(&db_path)?;
                }
                OverwritePolicy::ForceSilentOverwrite => {
                    std::fs::remove_file(&db_path)?;
                }
            }
        }
        std::fs::create_dir_all(&index_dir)?;

        let db = EmbeddingDb::open(&db_path)?;
        let pending: Vec<Passage> = if request.overwrite == OverwritePolicy::Reuse {
            let stored: BTreeSet<PassageId> =
                db.load_all()?.into_iter().map(|(pid, _)| pid).collect();
            request
                .passages
                .iter()
                .filter(|p| !stored.contains(&p.passage_id))
                .cloned()
                .collect()
        } else {
            request.passages.to_vec()
        };

        let encoded = self.encode_into(
            &db,
            request.checkpoint,
            &pending,
            request.doc_maxlen,
            request.tuning.batch_size,
        )?;
        write_engine_metadata(&index_dir, engine_metadata(&request))?;
        info!(
            index = request.index_name,
            encoded,
            total = request.passages.len(),
            "built index"
        );
        Ok(handle)
    }

    fn open_session(
        &self,
        handle: &IndexHandle,
        passages: &[Passage],
    ) -> Result<ColbertSession> {
        let index_dir = handle.index_dir();
        let db_path = index_dir.join(EMBEDDINGS_FILE);
        if !db_path.is_file() {
            return Err(Error::Engine(format!(
                "no embeddings found at {}",
                db_path.display()
            )));
        }

        let db = EmbeddingDb::open(&db_path)?;
        let live: BTreeSet<PassageId> = passages.iter().map(|p| p.passage_id).collect();
        let candidates: Vec<(PassageId, EmbeddingMatrix)> = db
            .load_all()?
            .into_iter()
            .filter(|(pid, _)| live.contains(pid))
            .collect();
        if candidates.len() != live.len() {
            warn!(
                index = %handle.index_name,
                missing = live.len() - candidates.len(),
                "some passages have no stored embeddings"
            );
        }

        Ok(ColbertSession {
            model: Arc::clone(&self.model),
            checkpoint: handle.checkpoint.clone(),
            index_dir,
            db,
            params: tuning::base_search_params(candidates.len(), false),
            candidates,
            query_maxlen: DEFAULT_QUERY_MAXLEN,
            doc_maxlen: handle.doc_maxlen,
            batch_size: handle.index_bsize,
        })
    }

    fn incremental_add(
        &self,
        session: &mut ColbertSession,
        passages: &[Passage],
    ) -> Result<()> {
        self.encode_into(
            &session.db,
            &session.checkpoint,
            passages,
            session.doc_maxlen,
            session.batch_size,
        )?;
        for passage in passages {
            match session.db.load(passage.passage_id)? {
                Some(matrix) => session.candidates.push((passage.passage_id, matrix)),
                None => {
                    return Err(Error::Engine(format!(
                        "passage {} was not stored",
                        passage.passage_id
                    )));
                }
            }
        }
        Ok(())
    }

    fn remove(
        &self,
        session: &mut ColbertSession,
        passage_ids: &[PassageId],
    ) -> Result<()> {
        let removed = session.db.remove_batch(passage_ids)?;
        let ids: BTreeSet<PassageId> = passage_ids.iter().copied().collect();
        session.candidates.retain(|(pid, _)| !ids.contains(pid));
        debug!(requested = passage_ids.len(), removed, "removed passage embeddings");
        Ok(())
    }

    fn persist(&self, session: &mut ColbertSession) -> Result<()> {
        let mut update = Map::new();
        update.insert("num_passages".into(), json!(session.candidates.len()));
        write_engine_metadata(&session.index_dir, update)
    }
}
