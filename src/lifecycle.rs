//! Index lifecycle: build, load, add, delete, destroy and search.
//!
//! The controller owns the loaded [`CollectionStore`] and the engine's
//! [`IndexHandle`]. Every mutation works on a staged copy of the store and
//! only swaps it in once the engine and the on-disk files agree, so callers
//! never observe a half-applied add or delete.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    collection::{CollectionStore, Document, PassageBatch},
    data_dir::{DEFAULT_STORE, DataDir, IndexLayout},
    doc_id::DocumentId,
    engine::{BuildRequest, IndexHandle, OverwritePolicy, RankedPassage, VectorEngine},
    error::{Error, Result},
    identity::PassageId,
    persistence,
    searcher::{Queries, QueryLimits, SearcherCache, SessionBinding, run_tuned},
    tuning::BuildTuning,
};

pub const EXPERIMENTAL_DELETE_WARNING: &str = "deleting documents is experimental: the index is not compacted or rebuilt and \
     retrieval quality may degrade after many deletions";

/// Tunables of the lifecycle controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Below this total size an add always rebuilds.
    pub rebuild_floor: usize,
    /// An add larger than this fraction of the current size rebuilds.
    pub rebuild_ratio: f64,
    pub index_batch_size: usize,
    pub max_document_length: usize,
    pub base_model_max_tokens: usize,
    pub min_query_length: usize,
    pub default_k: usize,
    pub store: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            rebuild_floor: 5_000,
            rebuild_ratio: 0.05,
            index_batch_size: 32,
            max_document_length: 256,
            base_model_max_tokens: 510,
            min_query_length: 32,
            default_k: 10,
            store: DEFAULT_STORE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    Rebuild,
    Incremental,
}

/// Rebuild when the result stays small, or when the delta is large relative
/// to what is already indexed. Otherwise only the new passages are encoded.
pub fn choose_strategy(
    current: usize,
    incoming: usize,
    floor: usize,
    ratio: f64,
) -> UpdateStrategy {
    if current + incoming < floor || incoming as f64 > current as f64 * ratio {
        UpdateStrategy::Rebuild
    } else {
        UpdateStrategy::Incremental
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Uninitialized,
    Built,
    Ready,
    Deleted,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Uninitialized => "uninitialized",
            Phase::Built => "built",
            Phase::Ready => "ready",
            Phase::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub index_name: String,
    pub passages: usize,
    pub documents: usize,
    pub nbits: u8,
    pub kmeans_niters: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddReport {
    /// `None` when every incoming document was already indexed.
    pub strategy: Option<UpdateStrategy>,
    pub added_passages: usize,
    pub skipped_documents: Vec<DocumentId>,
    pub total_passages: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub removed_passages: usize,
    pub removed_documents: Vec<DocumentId>,
    pub unknown_documents: Vec<DocumentId>,
    pub total_passages: usize,
    pub warning: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub index_name: String,
    pub phase: Phase,
    pub passages: usize,
    pub documents: usize,
    pub metadata_entries: Option<usize>,
    pub checkpoint: String,
    pub nbits: u8,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Index to search; defaults to the loaded one.
    pub index_name: Option<String>,
    /// Defaults to the configured k. Zero also means the default.
    pub k: Option<usize>,
    pub fast: bool,
    pub zero_index_ranks: bool,
    /// Restrict results to passages of these documents.
    pub filter: Option<Vec<DocumentId>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub content: String,
    pub score: f32,
    pub rank: usize,
    pub document_id: DocumentId,
    pub passage_id: PassageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    pub hits: Vec<SearchHit>,
    /// Result count actually used.
    pub k: usize,
    /// The requested k exceeded the corpus size.
    pub clamped: bool,
}

#[derive(Debug)]
struct LoadedIndex {
    store: CollectionStore,
    handle: IndexHandle,
}

impl LoadedIndex {
    fn binding(&self) -> SessionBinding {
        SessionBinding {
            checkpoint: self.handle.checkpoint.clone(),
            index_name: self.handle.index_name.clone(),
        }
    }
}

#[derive(Debug)]
struct State {
    phase: Phase,
    index: Option<LoadedIndex>,
}

impl State {
    fn loaded(&self, name: &str, operation: &'static str) -> Result<&LoadedIndex> {
        match &self.index {
            Some(index)
                if self.phase == Phase::Ready && index.handle.index_name == name =>
            {
                Ok(index)
            }
            _ => Err(Error::InvalidState {
                state: self.phase.as_str(),
                operation,
            }),
        }
    }

    fn loaded_mut(
        &mut self,
        name: &str,
        operation: &'static str,
    ) -> Result<&mut LoadedIndex> {
        let phase = self.phase;
        match &mut self.index {
            Some(index) if phase == Phase::Ready && index.handle.index_name == name => {
                Ok(index)
            }
            _ => Err(Error::InvalidState {
                state: phase.as_str(),
                operation,
            }),
        }
    }
}

type WriterLocks = Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>;

static WRITER_LOCKS: LazyLock<WriterLocks> = LazyLock::new(WriterLocks::default);

/// Process-wide mutex serializing mutations of one index directory, shared
/// by every controller in the process.
fn writer_lock(index_dir: &Path) -> Result<Arc<Mutex<()>>> {
    let mut locks = WRITER_LOCKS
        .lock()
        .map_err(|_| Error::LockPoisoned("writer lock registry"))?;
    Ok(Arc::clone(locks.entry(index_dir.to_path_buf()).or_default()))
}

fn as_build_error(err: Error) -> Error {
    match err {
        Error::Build(_) => err,
        other => Error::Build(other.to_string()),
    }
}

pub struct IndexController<E: VectorEngine> {
    engine: E,
    data_dir: DataDir,
    checkpoint: String,
    config: IndexConfig,
    state: RwLock<State>,
    searcher: SearcherCache<E::Session>,
}

impl<E: VectorEngine> IndexController<E> {
    pub fn new(
        engine: E,
        data_dir: DataDir,
        checkpoint: impl Into<String>,
        config: IndexConfig,
    ) -> Self {
        Self {
            engine,
            data_dir,
            checkpoint: checkpoint.into(),
            config,
            state: RwLock::new(State {
                phase: Phase::Uninitialized,
                index: None,
            }),
            searcher: SearcherCache::new(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn phase(&self) -> Result<Phase> {
        Ok(self.read_state()?.phase)
    }

    /// Name of the loaded index, if any.
    pub fn active_index(&self) -> Result<Option<String>> {
        Ok(self
            .read_state()?
            .index
            .as_ref()
            .map(|i| i.handle.index_name.clone()))
    }

    /// Paths of the named index. Fails for names that are not a single
    /// plain path component.
    pub fn layout(&self, name: &str) -> Result<IndexLayout> {
        self.data_dir.layout(&self.config.store, name)
    }

    pub fn list_indexes(&self) -> Result<Vec<String>> {
        self.data_dir.list_indexes(&self.config.store)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.layout(name).is_ok_and(|layout| layout.exists())
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| Error::LockPoisoned("index state"))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| Error::LockPoisoned("index state"))
    }

    fn limits(&self) -> QueryLimits {
        QueryLimits {
            min_len: self.config.min_query_length,
            max_tokens: self.config.base_model_max_tokens,
        }
    }

    fn effective_k(&self, k: Option<usize>) -> usize {
        match k {
            Some(k) if k > 0 => k,
            _ => self.config.default_k,
        }
    }

    /// Build a new index from documents, generating ids where missing.
    pub fn create_from_documents(
        &self,
        name: &str,
        documents: Vec<Document>,
        overwrite: OverwritePolicy,
    ) -> Result<BuildReport> {
        let batch = PassageBatch::from_documents(documents)?;
        self.create(name, batch, overwrite)
    }

    /// Build a new index with passage ids `0..N-1` and make it the loaded
    /// index.
    pub fn create(
        &self,
        name: &str,
        batch: PassageBatch,
        overwrite: OverwritePolicy,
    ) -> Result<BuildReport> {
        batch.validate()?;
        if batch.is_empty() {
            return Err(Error::Validation(
                "cannot build an index without passages".into(),
            ));
        }

        let layout = self.layout(name)?;
        let lock = writer_lock(&layout.index_dir())?;
        let _writer = lock
            .lock()
            .map_err(|_| Error::LockPoisoned("index writer"))?;

        let mut store = CollectionStore::from_batch(batch)?;
        store.reconcile_metadata();

        let passages = store.passages();
        let tuning =
            BuildTuning::for_corpus(passages.len(), self.config.index_batch_size);
        info!(
            index = name,
            passages = passages.len(),
            nbits = tuning.nbits,
            kmeans_niters = tuning.kmeans_niters,
            "building index"
        );

        // Held through the build so no search reopens a session over the
        // old passages before the swap.
        let mut state = self.write_state()?;
        self.searcher.invalidate()?;
        let handle = self
            .engine
            .build(BuildRequest {
                checkpoint: &self.checkpoint,
                index_root: layout.indexes_dir(),
                index_name: name,
                passages: &passages,
                overwrite,
                tuning,
                doc_maxlen: self.config.max_document_length,
            })
            .map_err(as_build_error)?;

        let report = BuildReport {
            index_name: name.to_string(),
            passages: store.len(),
            documents: store.identity().document_count(),
            nbits: tuning.nbits,
            kmeans_niters: tuning.kmeans_niters,
        };

        let saved = persistence::save(&layout, &store, &handle);
        state.index = Some(LoadedIndex { store, handle });
        state.phase = Phase::Built;
        saved?;
        state.phase = Phase::Ready;
        Ok(report)
    }

    /// Load a persisted index and make it the active one.
    pub fn load(&self, name: &str) -> Result<()> {
        let layout = self.layout(name)?;
        let lock = writer_lock(&layout.index_dir())?;
        let _writer = lock
            .lock()
            .map_err(|_| Error::LockPoisoned("index writer"))?;

        let persisted = persistence::load(&layout)?;
        if persisted.handle.checkpoint != self.checkpoint {
            warn!(
                index = name,
                built_with = %persisted.handle.checkpoint,
                configured = %self.checkpoint,
                "index was built with a different model, using the index's model"
            );
        }
        info!(
            index = name,
            passages = persisted.store.len(),
            documents = persisted.store.identity().document_count(),
            "loaded index"
        );

        let mut state = self.write_state()?;
        self.searcher.invalidate()?;
        state.index = Some(LoadedIndex {
            store: persisted.store,
            handle: persisted.handle,
        });
        state.phase = Phase::Ready;
        Ok(())
    }

    fn resolve_name(&self, explicit: Option<&str>) -> Result<Option<String>> {
        match explicit {
            Some(name) => Ok(Some(name.to_string())),
            None => self.active_index(),
        }
    }

    fn ensure_loaded(&self, name: &str) -> Result<()> {
        let loaded = {
            let state = self.read_state()?;
            state.phase == Phase::Ready
                && state
                    .index
                    .as_ref()
                    .is_some_and(|i| i.handle.index_name == name)
        };
        if !loaded {
            self.load(name)?;
        }
        Ok(())
    }

    pub fn add_documents(&self, documents: Vec<Document>) -> Result<AddReport> {
        self.add(PassageBatch::from_documents(documents)?)
    }

    /// Add passages to the loaded index. Passages of documents already in
    /// the index are dropped; their metadata is still merged.
    pub fn add(&self, batch: PassageBatch) -> Result<AddReport> {
        batch.validate()?;
        let Some(name) = self.active_index()? else {
            let phase = self.phase()?;
            return Err(Error::InvalidState {
                state: phase.as_str(),
                operation: "add",
            });
        };

        let layout = self.layout(&name)?;
        let lock = writer_lock(&layout.index_dir())?;
        let _writer = lock
            .lock()
            .map_err(|_| Error::LockPoisoned("index writer"))?;
        let mut state = self.write_state()?;
        let index = state.loaded_mut(&name, "add")?;

        // Both kinds render to the same JSON key, so "5" and 5 would
        // collide in the persisted metadata map.
        let existing = index.store.identity().id_kind();
        let incoming = batch.document_ids.first().map(DocumentId::kind);
        match (existing, incoming) {
            (Some(existing), Some(incoming)) if existing != incoming => {
                return Err(Error::Validation(format!(
                    "index {name} uses {existing} document ids, got {incoming} ids"
                )));
            }
            _ => {}
        }

        let parts = index.store.partition(batch);
        if !parts.duplicates.is_empty() {
            warn!(
                index = %name,
                count = parts.duplicates.len(),
                "skipping documents that are already indexed"
            );
        }

        let mut staged = index.store.clone();
        let incoming = parts.fresh.len();
        let current = staged.len();

        let strategy = (incoming > 0).then(|| {
            choose_strategy(
                current,
                incoming,
                self.config.rebuild_floor,
                self.config.rebuild_ratio,
            )
        });

        let mut handle = index.handle.clone();
        match strategy {
            None => staged.merge_metadata(parts.fresh.metadata),
            Some(UpdateStrategy::Rebuild) => {
                staged.append(parts.fresh);
                staged.renumber();
                let passages = staged.passages();
                let tuning = BuildTuning::for_corpus(
                    passages.len(),
                    self.config.index_batch_size,
                );
                info!(
                    index = %name,
                    current,
                    incoming,
                    nbits = tuning.nbits,
                    "rebuilding index"
                );
                self.searcher.invalidate()?;
                handle = self
                    .engine
                    .build(BuildRequest {
                        checkpoint: &index.handle.checkpoint,
                        index_root: layout.indexes_dir(),
                        index_name: &name,
                        passages: &passages,
                        overwrite: OverwritePolicy::ForceSilentOverwrite,
                        tuning,
                        doc_maxlen: index.handle.doc_maxlen,
                    })
                    .map_err(as_build_error)?;
            }
            Some(UpdateStrategy::Incremental) => {
                let appended = staged.append(parts.fresh);
                info!(index = %name, current, incoming, "updating index incrementally");
                let updated = self.searcher.with_session(
                    &index.binding(),
                    false,
                    || self.engine.open_session(&index.handle, &index.store.passages()),
                    |session, _| {
                        self.engine.incremental_add(session, &appended)?;
                        self.engine.persist(session)
                    },
                );
                if let Err(e) = updated {
                    self.searcher.invalidate()?;
                    return Err(e);
                }
            }
        }

        staged.reconcile_metadata();
        persistence::save(&layout, &staged, &handle)?;

        let report = AddReport {
            strategy,
            added_passages: incoming,
            skipped_documents: parts.duplicates,
            total_passages: staged.len(),
        };
        index.store = staged;
        index.handle = handle;
        debug!(index = %name, ?report, "add complete");
        Ok(report)
    }

    /// Remove every passage of the given documents.
    ///
    /// Returns `Ok(None)` when no index name is given and none is loaded.
    pub fn delete(
        &self,
        index_name: Option<&str>,
        documents: &[DocumentId],
    ) -> Result<Option<DeleteReport>> {
        let Some(name) = self.resolve_name(index_name)? else {
            warn!("delete requested without an index name and no index is loaded");
            return Ok(None);
        };
        self.ensure_loaded(&name)?;
        warn!(index = %name, "{EXPERIMENTAL_DELETE_WARNING}");

        let layout = self.layout(&name)?;
        let lock = writer_lock(&layout.index_dir())?;
        let _writer = lock
            .lock()
            .map_err(|_| Error::LockPoisoned("index writer"))?;
        let mut state = self.write_state()?;
        let index = state.loaded_mut(&name, "delete")?;

        let (removed_documents, unknown_documents): (Vec<_>, Vec<_>) = documents
            .iter()
            .cloned()
            .partition(|doc| index.store.identity().contains_document(doc));

        let mut staged = index.store.clone();
        let pids = staged.remove_documents(&removed_documents);
        if !pids.is_empty() {
            let pids: Vec<PassageId> = pids.into_iter().collect();
            let removed = self.searcher.with_session(
                &index.binding(),
                false,
                || self.engine.open_session(&index.handle, &index.store.passages()),
                |session, _| {
                    self.engine.remove(session, &pids)?;
                    self.engine.persist(session)
                },
            );
            if let Err(e) = removed {
                self.searcher.invalidate()?;
                return Err(e);
            }
        }

        staged.reconcile_metadata();
        persistence::save(&layout, &staged, &index.handle)?;

        let report = DeleteReport {
            removed_passages: index.store.len() - staged.len(),
            removed_documents,
            unknown_documents,
            total_passages: staged.len(),
            warning: EXPERIMENTAL_DELETE_WARNING,
        };
        index.store = staged;
        info!(
            index = %name,
            removed_passages = report.removed_passages,
            "deleted documents"
        );
        Ok(Some(report))
    }

    /// Remove an index from disk. Removing an index that does not exist is
    /// not an error. Returns whether anything was removed.
    pub fn destroy(&self, name: &str) -> Result<bool> {
        let layout = self.layout(name)?;
        let lock = writer_lock(&layout.index_dir())?;
        let _writer = lock
            .lock()
            .map_err(|_| Error::LockPoisoned("index writer"))?;

        let mut state = self.write_state()?;
        if state
            .index
            .as_ref()
            .is_some_and(|i| i.handle.index_name == name)
        {
            self.searcher.invalidate()?;
            state.index = None;
            state.phase = Phase::Deleted;
        }

        let removed = persistence::remove(&layout)?;
        info!(index = name, removed, "destroyed index");
        Ok(removed)
    }

    pub fn status(&self) -> Result<Option<IndexStatus>> {
        let state = self.read_state()?;
        Ok(state.index.as_ref().map(|index| IndexStatus {
            index_name: index.handle.index_name.clone(),
            phase: state.phase,
            passages: index.store.len(),
            documents: index.store.identity().document_count(),
            metadata_entries: index
                .store
                .metadata()
                .is_tracked()
                .then(|| index.store.metadata().len()),
            checkpoint: index.handle.checkpoint.clone(),
            nbits: index.handle.nbits,
        }))
    }

    /// Search one query. Returns `Ok(None)` when no index name is given and
    /// none is loaded.
    pub fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Option<SearchReport>> {
        let Some(name) = self.resolve_name(options.index_name.as_deref())? else {
            warn!("search requested without an index name and no index is loaded");
            return Ok(None);
        };
        self.ensure_loaded(&name)?;

        let state = self.read_state()?;
        let index = state.loaded(&name, "search")?;
        let k = self.effective_k(options.k);

        let allowed: Option<Vec<PassageId>> = match &options.filter {
            Some(docs) => {
                let pids = index.store.identity().resolve_documents(docs);
                if pids.is_empty() {
                    debug!(index = %name, "document filter matches no passages");
                    return Ok(Some(SearchReport {
                        hits: Vec::new(),
                        k,
                        clamped: false,
                    }));
                }
                Some(pids.into_iter().collect())
            }
            None => None,
        };

        let tuned = self.searcher.with_session(
            &index.binding(),
            options.fast,
            || self.engine.open_session(&index.handle, &index.store.passages()),
            |session, base| {
                run_tuned(
                    session,
                    base,
                    k,
                    Queries::One {
                        text: query,
                        allowed: allowed.as_deref(),
                    },
                    self.limits(),
                )
            },
        )?;

        let ranked = tuned.results.into_iter().next().unwrap_or_default();
        Ok(Some(SearchReport {
            hits: to_hits(index, ranked, options.zero_index_ranks)?,
            k: tuned.plan.k,
            clamped: tuned.plan.clamped,
        }))
    }

    /// Search several queries at once. Document filters are not supported
    /// in batch mode.
    pub fn search_batch(
        &self,
        queries: &[String],
        options: &SearchOptions,
    ) -> Result<Option<Vec<SearchReport>>> {
        if options.filter.is_some() {
            return Err(Error::Validation(
                "document filters are not supported for batch search".into(),
            ));
        }
        let Some(name) = self.resolve_name(options.index_name.as_deref())? else {
            warn!("search requested without an index name and no index is loaded");
            return Ok(None);
        };
        self.ensure_loaded(&name)?;

        let state = self.read_state()?;
        let index = state.loaded(&name, "search")?;
        let k = self.effective_k(options.k);

        let tuned = self.searcher.with_session(
            &index.binding(),
            options.fast,
            || self.engine.open_session(&index.handle, &index.store.passages()),
            |session, base| {
                run_tuned(session, base, k, Queries::Batch(queries), self.limits())
            },
        )?;

        let plan = tuned.plan;
        tuned
            .results
            .into_iter()
            .map(|ranked| {
                Ok(SearchReport {
                    hits: to_hits(index, ranked, options.zero_index_ranks)?,
                    k: plan.k,
                    clamped: plan.clamped,
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }
}

fn to_hits(
    index: &LoadedIndex,
    ranked: Vec<RankedPassage>,
    zero_index: bool,
) -> Result<Vec<SearchHit>> {
    ranked
        .into_iter()
        .map(|r| {
            let document_id = index.store.identity().translate(r.passage_id)?.clone();
            let content = index.store.content_at(r.passage_id)?.to_string();
            let document_metadata = index.store.metadata().get(&document_id).cloned();
            Ok(SearchHit {
                content,
                score: r.score,
                rank: if zero_index { r.rank - 1 } else { r.rank },
                document_id,
                passage_id: r.passage_id,
                document_metadata,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc,
        },
        time::Duration,
    };

    use super::*;
    use crate::{
        engine::{EngineCall, MemoryEngine, MemorySession},
        metadata::MetadataMap,
    };

    fn controller(root: &Path) -> IndexController<MemoryEngine> {
        IndexController::new(
            MemoryEngine::new(),
            DataDir::resolve(Some(root)).unwrap(),
            "test-model",
            IndexConfig::default(),
        )
    }

    fn batch(items: &[(&str, &str)]) -> PassageBatch {
        PassageBatch::new(
            items.iter().map(|(_, c)| c.to_string()).collect(),
            items.iter().map(|(d, _)| DocumentId::from(*d)).collect(),
            None,
        )
        .unwrap()
    }

    fn seeded(root: &Path) -> IndexController<MemoryEngine> {
        let c = controller(root);
        c.create(
            "notes",
            batch(&[
                ("a", "rust ownership rules"),
                ("a", "rust borrowing rules"),
                ("b", "python garbage collection"),
                ("c", "go goroutines and channels"),
            ]),
            OverwritePolicy::Overwrite,
        )
        .unwrap();
        c
    }

    fn hit_docs(report: &SearchReport) -> Vec<String> {
        report.hits.iter().map(|h| h.document_id.to_string()).collect()
    }

    #[test]
    fn rebuild_rule() {
        assert_eq!(choose_strategy(4_000, 2_000, 5_000, 0.05), UpdateStrategy::Rebuild);
        assert_eq!(
            choose_strategy(100_000, 1_000, 5_000, 0.05),
            UpdateStrategy::Incremental
        );
        assert_eq!(choose_strategy(100_000, 6_000, 5_000, 0.05), UpdateStrategy::Rebuild);
        assert_eq!(choose_strategy(100_000, 5_000, 5_000, 0.05), UpdateStrategy::Incremental);
    }

    #[test]
    fn create_moves_to_ready() {
        let tmp = tempfile::tempdir().unwrap();
        let c = controller(tmp.path());
        assert_eq!(c.phase().unwrap(), Phase::Uninitialized);

        let c = seeded(tmp.path());
        assert_eq!(c.phase().unwrap(), Phase::Ready);
        assert!(c.exists("notes"));
        let status = c.status().unwrap().unwrap();
        assert_eq!(status.passages, 4);
        assert_eq!(status.documents, 3);
        assert_eq!(status.nbits, 8);
    }

    #[test]
    fn create_rejects_invalid_ids_before_engine() {
        let tmp = tempfile::tempdir().unwrap();
        let c = controller(tmp.path());
        let bad = PassageBatch {
            contents: vec!["x".into(), "y".into()],
            document_ids: vec![DocumentId::from("a"), DocumentId::from(1)],
            metadata: None,
        };
        let err = c.create("bad", bad, OverwritePolicy::Overwrite).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(c.engine().calls().is_empty());
    }

    #[test]
    fn failed_build_leaves_nothing_loaded() {
        let tmp = tempfile::tempdir().unwrap();
        let c = IndexController::new(
            MemoryEngine::failing(),
            DataDir::resolve(Some(tmp.path())).unwrap(),
            "m",
            IndexConfig::default(),
        );
        let err = c
            .create("x", batch(&[("a", "text")]), OverwritePolicy::Overwrite)
            .unwrap_err();
        assert!(matches!(err, Error::Build(_)));
        assert_eq!(c.phase().unwrap(), Phase::Uninitialized);
        assert!(!c.exists("x"));
    }

    #[test]
    fn search_translates_passages_to_documents() {
        let tmp = tempfile::tempdir().unwrap();
        let c = seeded(tmp.path());

        let report = c
            .search("python collection", &SearchOptions { k: Some(1), ..Default::default() })
            .unwrap()
            .unwrap();
        assert_eq!(hit_docs(&report), vec!["b"]);
        assert_eq!(report.hits[0].rank, 1);
        assert_eq!(report.hits[0].content, "python garbage collection");
    }

    #[test]
    fn zero_indexed_ranks() {
        let tmp = tempfile::tempdir().unwrap();
        let c = seeded(tmp.path());
        let report = c
            .search(
                "rust",
                &SearchOptions {
                    k: Some(2),
                    zero_index_ranks: true,
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(report.hits[0].rank, 0);
        assert_eq!(report.hits[1].rank, 1);
    }

    #[test]
    fn search_without_index_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let c = controller(tmp.path());
        assert!(c.search("anything", &SearchOptions::default()).unwrap().is_none());
        assert!(c.delete(None, &[DocumentId::from("a")]).unwrap().is_none());
    }

    #[test]
    fn k_above_corpus_is_clamped_and_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let c = seeded(tmp.path());
        let report = c
            .search("rust", &SearchOptions { k: Some(50), ..Default::default() })
            .unwrap()
            .unwrap();
        assert!(report.clamped);
        assert_eq!(report.k, 4);
        assert_eq!(report.hits.len(), 4);
    }

    #[test]
    fn filter_restricts_and_unknown_filter_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let c = seeded(tmp.path());

        let report = c
            .search(
                "rust",
                &SearchOptions {
                    filter: Some(vec![DocumentId::from("c")]),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(hit_docs(&report), vec!["c"]);

        c.engine().clear_calls();
        let report = c
            .search(
                "rust",
                &SearchOptions {
                    filter: Some(vec![DocumentId::from("nope")]),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert!(report.hits.is_empty());
        assert!(c.engine().calls().is_empty());
    }

    #[test]
    fn duplicate_documents_are_not_reindexed() {
        let tmp = tempfile::tempdir().unwrap();
        let c = seeded(tmp.path());
        c.engine().clear_calls();

        let report = c.add(batch(&[("b", "python again")])).unwrap();
        assert_eq!(report.strategy, None);
        assert_eq!(report.skipped_documents, vec![DocumentId::from("b")]);
        assert_eq!(report.total_passages, 4);
        assert!(c.engine().calls().is_empty());

        let hits = c
            .search("python", &SearchOptions { k: Some(1), ..Default::default() })
            .unwrap()
            .unwrap();
        assert_eq!(hits.hits[0].content, "python garbage collection");
    }

    #[test]
    fn small_add_rebuilds_and_renumbers() {
        let tmp = tempfile::tempdir().unwrap();
        let c = seeded(tmp.path());
        c.delete(None, &[DocumentId::from("a")]).unwrap();
        c.engine().clear_calls();

        let report = c.add(batch(&[("d", "haskell monads")])).unwrap();
        assert_eq!(report.strategy, Some(UpdateStrategy::Rebuild));
        assert_eq!(report.total_passages, 3);
        assert!(matches!(
            c.engine().calls()[0],
            EngineCall::Build { passages: 3, .. }
        ));

        let persisted = persistence::load(&c.layout("notes").unwrap()).unwrap();
        let ids: Vec<PassageId> =
            persisted.store.identity().forward().keys().copied().collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn large_base_adds_incrementally() {
        let tmp = tempfile::tempdir().unwrap();
        let config = IndexConfig {
            rebuild_floor: 2,
            rebuild_ratio: 0.5,
            ..IndexConfig::default()
        };
        let c = IndexController::new(
            MemoryEngine::new(),
            DataDir::resolve(Some(tmp.path())).unwrap(),
            "m",
            config,
        );
        c.create(
            "big",
            batch(&[("a", "one"), ("b", "two"), ("c", "three"), ("d", "four")]),
            OverwritePolicy::Overwrite,
        )
        .unwrap();
        c.engine().clear_calls();

        let report = c.add(batch(&[("e", "five")])).unwrap();
        assert_eq!(report.strategy, Some(UpdateStrategy::Incremental));
        let calls = c.engine().calls();
        assert!(calls.contains(&EngineCall::IncrementalAdd(vec![4])));
        assert!(calls.contains(&EngineCall::Persist));
        assert!(!calls.iter().any(|call| matches!(call, EngineCall::Build { .. })));

        let report = c
            .search("five", &SearchOptions { k: Some(1), ..Default::default() })
            .unwrap()
            .unwrap();
        assert_eq!(hit_docs(&report), vec!["e"]);
        assert_eq!(report.hits[0].passage_id, 4);
    }

    #[test]
    fn delete_removes_exactly_the_documents_passages() {
        let tmp = tempfile::tempdir().unwrap();
        let c = seeded(tmp.path());

        let report = c
            .delete(None, &[DocumentId::from("a"), DocumentId::from("b"), DocumentId::from("zz")])
            .unwrap()
            .unwrap();
        assert_eq!(report.removed_passages, 3);
        assert_eq!(report.total_passages, 1);
        assert_eq!(report.unknown_documents, vec![DocumentId::from("zz")]);
        assert_eq!(report.warning, EXPERIMENTAL_DELETE_WARNING);

        let hits = c.search("rust python go", &SearchOptions::default()).unwrap().unwrap();
        assert_eq!(hit_docs(&hits), vec!["c"]);
        assert!(c
            .engine()
            .calls()
            .contains(&EngineCall::Remove(vec![0, 1, 2])));
    }

    #[test]
    fn metadata_merges_and_follows_deletes() {
        let tmp = tempfile::tempdir().unwrap();
        let c = seeded(tmp.path());

        let mut update = batch(&[("e", "elixir processes")]);
        update.metadata = Some(MetadataMap::from([
            (DocumentId::from("e"), json!({"lang": "elixir"})),
            (DocumentId::from("b"), json!({"lang": "python"})),
        ]));
        c.add(update).unwrap();

        let hit = c
            .search("python", &SearchOptions { k: Some(1), ..Default::default() })
            .unwrap()
            .unwrap();
        assert_eq!(hit.hits[0].document_metadata, Some(json!({"lang": "python"})));

        c.delete(None, &[DocumentId::from("b")]).unwrap();
        let persisted = persistence::load(&c.layout("notes").unwrap()).unwrap();
        assert_eq!(persisted.store.metadata().len(), 1);
        assert!(persisted.store.metadata().get(&DocumentId::from("e")).is_some());
    }

    #[test]
    fn add_without_index_is_invalid_state() {
        let tmp = tempfile::tempdir().unwrap();
        let c = controller(tmp.path());
        let err = c.add(batch(&[("a", "x")])).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                state: "uninitialized",
                operation: "add"
            }
        ));
    }

    #[test]
    fn destroy_is_idempotent_and_terminal() {
        let tmp = tempfile::tempdir().unwrap();
        let c = seeded(tmp.path());

        assert!(c.destroy("notes").unwrap());
        assert_eq!(c.phase().unwrap(), Phase::Deleted);
        assert!(!c.exists("notes"));
        assert!(!c.destroy("notes").unwrap());
        assert!(c.search("rust", &SearchOptions::default()).unwrap().is_none());
        assert!(matches!(
            c.add(batch(&[("z", "zz")])),
            Err(Error::InvalidState { state: "deleted", .. })
        ));
    }

    #[test]
    fn search_by_name_loads_index() {
        let tmp = tempfile::tempdir().unwrap();
        seeded(tmp.path());

        let fresh = controller(tmp.path());
        let report = fresh
            .search(
                "goroutines",
                &SearchOptions {
                    index_name: Some("notes".into()),
                    k: Some(1),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(hit_docs(&report), vec!["c"]);
        assert_eq!(fresh.active_index().unwrap().as_deref(), Some("notes"));
    }

    #[test]
    fn search_params_restored_between_queries() {
        let tmp = tempfile::tempdir().unwrap();
        let c = seeded(tmp.path());

        c.search("rust", &SearchOptions { k: Some(500), ..Default::default() }).unwrap();
        c.engine().clear_calls();
        c.search("rust", &SearchOptions::default()).unwrap();

        let params: Vec<_> = c
            .engine()
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::Search { params, .. } => Some(params),
                _ => None,
            })
            .collect();
        assert_eq!(params, vec![crate::tuning::base_search_params(4, false)]);
    }

    #[test]
    fn batch_search_returns_report_per_query() {
        let tmp = tempfile::tempdir().unwrap();
        let c = seeded(tmp.path());
        let queries = vec!["python".to_string(), "goroutines".to_string()];

        let reports = c
            .search_batch(&queries, &SearchOptions { k: Some(1), ..Default::default() })
            .unwrap()
            .unwrap();
        assert_eq!(hit_docs(&reports[0]), vec!["b"]);
        assert_eq!(hit_docs(&reports[1]), vec!["c"]);

        let err = c
            .search_batch(
                &queries,
                &SearchOptions {
                    filter: Some(vec![]),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn unsafe_index_names_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let c = seeded(tmp.path());

        for name in ["", ".", "..", "a/../notes", "../default"] {
            assert!(
                matches!(c.destroy(name), Err(Error::Validation(_))),
                "destroy({name:?})"
            );
            assert!(!c.exists(name));
        }
        assert!(matches!(
            c.create("x/y", batch(&[("a", "x")]), OverwritePolicy::Overwrite),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            c.search(
                "rust",
                &SearchOptions {
                    index_name: Some("..".into()),
                    ..Default::default()
                }
            ),
            Err(Error::Validation(_))
        ));

        assert!(c.exists("notes"));
        assert_eq!(c.list_indexes().unwrap(), vec!["notes"]);
    }

    #[test]
    fn add_rejects_other_id_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let c = controller(tmp.path());
        let mut meta = MetadataMap::new();
        meta.insert(DocumentId::from(5), json!("int"));
        c.create(
            "notes",
            PassageBatch::new(vec!["five".into()], vec![DocumentId::from(5)], Some(meta))
                .unwrap(),
            OverwritePolicy::Overwrite,
        )
        .unwrap();
        c.engine().clear_calls();

        let mut meta = MetadataMap::new();
        meta.insert(DocumentId::from("5"), json!("str"));
        let err = c
            .add(
                PassageBatch::new(vec!["cinq".into()], vec![DocumentId::from("5")], Some(meta))
                    .unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(c.engine().calls().is_empty());

        let persisted = persistence::load(&c.layout("notes").unwrap()).unwrap();
        assert_eq!(persisted.store.len(), 1);
        assert_eq!(
            persisted.store.metadata().get(&DocumentId::from(5)),
            Some(&json!("int"))
        );
    }

    #[test]
    fn writer_lock_is_shared_per_index_dir() {
        let a = writer_lock(Path::new("/tmp/colbertdb-locks/a")).unwrap();
        let again = writer_lock(Path::new("/tmp/colbertdb-locks/a")).unwrap();
        let b = writer_lock(Path::new("/tmp/colbertdb-locks/b")).unwrap();

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn mutations_wait_for_the_writer_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let c = seeded(tmp.path());
        let lock = writer_lock(&c.layout("notes").unwrap().index_dir()).unwrap();
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            let held = lock.lock().unwrap();
            let adder = scope.spawn(|| {
                let report = c.add(batch(&[("d", "zig comptime")]));
                done.store(true, Ordering::SeqCst);
                report
            });

            std::thread::sleep(Duration::from_millis(100));
            assert!(!done.load(Ordering::SeqCst));
            drop(held);

            let report = adder.join().unwrap().unwrap();
            assert_eq!(report.total_passages, 5);
        });
    }

    #[test]
    fn concurrent_adds_all_land() {
        let tmp = tempfile::tempdir().unwrap();
        let c = seeded(tmp.path());

        std::thread::scope(|scope| {
            for i in 0..4 {
                let c = &c;
                scope.spawn(move || {
                    let doc = format!("new-{i}");
                    c.add(batch(&[(doc.as_str(), "fresh text")])).unwrap();
                });
            }
        });

        let persisted = persistence::load(&c.layout("notes").unwrap()).unwrap();
        assert_eq!(persisted.store.len(), 8);
        assert_eq!(persisted.store.identity().document_count(), 7);
        persisted.store.check_invariants().unwrap();
    }

    #[test]
    fn readers_wait_behind_a_writer() {
        let tmp = tempfile::tempdir().unwrap();
        let c = seeded(tmp.path());
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            let writer = c.state.write().unwrap();
            let reader = scope.spawn(|| {
                let report = c.search("rust", &SearchOptions::default());
                done.store(true, Ordering::SeqCst);
                report
            });

            std::thread::sleep(Duration::from_millis(100));
            assert!(!done.load(Ordering::SeqCst));
            drop(writer);

            assert!(reader.join().unwrap().unwrap().is_some());
        });
    }

    /// Wraps a [`MemoryEngine`] and parks the next build until released.
    struct GatedEngine {
        inner: MemoryEngine,
        entered: Mutex<Option<mpsc::Sender<()>>>,
        release: Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl VectorEngine for GatedEngine {
        type Session = MemorySession;

        fn build(&self, request: BuildRequest<'_>) -> Result<IndexHandle> {
            let entered = self.entered.lock().unwrap().take();
            if let Some(entered) = entered {
                entered.send(()).unwrap();
                let release = self.release.lock().unwrap().take().unwrap();
                release.recv().unwrap();
            }
            self.inner.build(request)
        }

        fn open_session(
            &self,
            handle: &IndexHandle,
            passages: &[crate::collection::Passage],
        ) -> Result<MemorySession> {
            self.inner.open_session(handle, passages)
        }

        fn incremental_add(
            &self,
            session: &mut MemorySession,
            passages: &[crate::collection::Passage],
        ) -> Result<()> {
            self.inner.incremental_add(session, passages)
        }

        fn remove(&self, session: &mut MemorySession, passage_ids: &[PassageId]) -> Result<()> {
            self.inner.remove(session, passage_ids)
        }

        fn persist(&self, session: &mut MemorySession) -> Result<()> {
            self.inner.persist(session)
        }
    }

    #[test]
    fn search_during_rebuild_sees_the_new_corpus() {
        let tmp = tempfile::tempdir().unwrap();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let c = IndexController::new(
            GatedEngine {
                inner: MemoryEngine::new(),
                entered: Mutex::new(None),
                release: Mutex::new(None),
            },
            DataDir::resolve(Some(tmp.path())).unwrap(),
            "test-model",
            IndexConfig::default(),
        );
        c.create(
            "notes",
            batch(&[("old", "rust ownership rules")]),
            OverwritePolicy::Overwrite,
        )
        .unwrap();
        assert!(c.search("rust", &SearchOptions::default()).unwrap().is_some());

        *c.engine().entered.lock().unwrap() = Some(entered_tx);
        *c.engine().release.lock().unwrap() = Some(release_rx);
        let searched = AtomicBool::new(false);

        std::thread::scope(|scope| {
            let builder = scope.spawn(|| {
                c.create(
                    "notes",
                    batch(&[("new-a", "go channels"), ("new-b", "rust traits")]),
                    OverwritePolicy::Overwrite,
                )
            });
            entered_rx.recv().unwrap();

            let searcher = scope.spawn(|| {
                let report = c.search(
                    "rust",
                    &SearchOptions {
                        index_name: Some("notes".into()),
                        ..Default::default()
                    },
                );
                searched.store(true, Ordering::SeqCst);
                report
            });
            std::thread::sleep(Duration::from_millis(100));
            assert!(!searched.load(Ordering::SeqCst));

            release_tx.send(()).unwrap();
            builder.join().unwrap().unwrap();
            let report = searcher.join().unwrap().unwrap().unwrap();
            assert_eq!(hit_docs(&report)[0], "new-b");
        });

        let report = c.search("rust", &SearchOptions::default()).unwrap().unwrap();
        assert_eq!(hit_docs(&report), vec!["new-b", "new-a"]);
    }
}
