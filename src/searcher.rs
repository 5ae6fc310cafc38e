//! Cached search session and scoped per-query parameter overrides.

use std::{
    ops::{Deref, DerefMut},
    sync::Mutex,
};

use tracing::{debug, info, warn};

use crate::{
    engine::{RankedPassage, SearchSession},
    error::{Error, Result},
    identity::PassageId,
    tuning::{self, QueryPlan, SearchParams},
};

/// Identity of the index a session was opened for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    pub checkpoint: String,
    pub index_name: String,
}

struct Cached<S> {
    binding: SessionBinding,
    session: S,
    base: SearchParams,
    fast: bool,
}

/// Holds at most one live session. The mutex serializes both session use
/// and reloads, so concurrent callers wanting the same index wait for and
/// reuse a single session.
pub struct SearcherCache<S> {
    inner: Mutex<Option<Cached<S>>>,
}

impl<S> Default for SearcherCache<S> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }
}

impl<S: SearchSession> SearcherCache<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the session bound to `binding`, opening one with
    /// `open` if nothing is cached or a different index is bound. `f`
    /// receives the session and its base parameters.
    pub fn with_session<R>(
        &self,
        binding: &SessionBinding,
        fast: bool,
        open: impl FnOnce() -> Result<S>,
        f: impl FnOnce(&mut S, SearchParams) -> Result<R>,
    ) -> Result<R> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| Error::LockPoisoned("searcher cache"))?;

        let stale = guard.as_ref().is_none_or(|c| &c.binding != binding);
        if stale {
            if let Some(old) = guard.take() {
                debug!(index = %old.binding.index_name, "dropping search session");
            }
            let mut session = open()?;
            let base = tuning::base_search_params(session.num_passages(), fast);
            session.configure(base);
            info!(
                index = %binding.index_name,
                passages = session.num_passages(),
                ncells = base.ncells,
                ndocs = base.ndocs,
                "loaded search session"
            );
            *guard = Some(Cached {
                binding: binding.clone(),
                session,
                base,
                fast,
            });
        }

        let Some(cached) = guard.as_mut() else {
            return Err(Error::InvalidState {
                state: "unloaded",
                operation: "search",
            });
        };
        if cached.fast != fast {
            cached.base =
                tuning::base_search_params(cached.session.num_passages(), fast);
            cached.fast = fast;
            cached.session.configure(cached.base);
        }

        f(&mut cached.session, cached.base)
    }

    /// Drop the cached session; the next use reopens it.
    pub fn invalidate(&self) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| Error::LockPoisoned("searcher cache"))?;
        *guard = None;
        Ok(())
    }

    pub fn bound(&self) -> Result<Option<SessionBinding>> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| Error::LockPoisoned("searcher cache"))?;
        Ok(guard.as_ref().map(|c| c.binding.clone()))
    }
}

/// Applies query parameters to a session and restores the base parameters
/// when dropped, on every exit path.
pub struct ScopedParams<'a, S: SearchSession> {
    session: &'a mut S,
    base: SearchParams,
}

impl<'a, S: SearchSession> ScopedParams<'a, S> {
    pub fn apply(session: &'a mut S, base: SearchParams, params: SearchParams) -> Self {
        if params != base {
            session.configure(params);
        }
        Self { session, base }
    }
}

impl<S: SearchSession> Deref for ScopedParams<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.session
    }
}

impl<S: SearchSession> DerefMut for ScopedParams<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.session
    }
}

impl<S: SearchSession> Drop for ScopedParams<'_, S> {
    fn drop(&mut self) {
        if self.session.params() != self.base {
            self.session.configure(self.base);
        }
    }
}

/// Queries for one tuned engine call.
#[derive(Debug, Clone, Copy)]
pub enum Queries<'a> {
    One {
        text: &'a str,
        allowed: Option<&'a [PassageId]>,
    },
    Batch(&'a [String]),
}

impl Queries<'_> {
    fn len(&self) -> usize {
        match self {
            Queries::One { .. } => 1,
            Queries::Batch(qs) => qs.len(),
        }
    }
}

/// Query encoding length bounds.
#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    pub min_len: usize,
    pub max_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct TunedResults {
    pub plan: QueryPlan,
    /// One ranked list per query.
    pub results: Vec<Vec<RankedPassage>>,
}

/// Tune parameters for `k`, run the queries, and restore the base
/// parameters afterwards.
pub fn run_tuned<S: SearchSession>(
    session: &mut S,
    base: SearchParams,
    k: usize,
    queries: Queries<'_>,
    limits: QueryLimits,
) -> Result<TunedResults> {
    let corpus = session.num_passages();
    let plan = tuning::tune(corpus, k, base, false);
    if plan.clamped {
        warn!(
            requested = k,
            corpus, "k is larger than the number of passages in the index, lowering it"
        );
    }
    if plan.k == 0 {
        return Ok(TunedResults {
            plan,
            results: vec![Vec::new(); queries.len()],
        });
    }

    let mut scoped = ScopedParams::apply(session, base, plan.params);
    let results = match queries {
        Queries::One { text, allowed } => {
            scoped.set_query_maxlen(tuning::query_maxlen(
                text,
                limits.min_len,
                limits.max_tokens,
            ));
            vec![scoped.search(text, plan.k, allowed)?]
        }
        Queries::Batch(texts) => {
            scoped.set_query_maxlen(tuning::batch_query_maxlen(
                texts,
                limits.min_len,
                limits.max_tokens,
            ));
            scoped.batch_search(texts, plan.k)?
        }
    };

    Ok(TunedResults { plan, results })
}

#[cfg(test)]
mod tests {
    use std::{
        cell::Cell,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{
        collection::Passage,
        engine::{BuildRequest, MemoryEngine, MemorySession, OverwritePolicy, VectorEngine},
        tuning::BuildTuning,
    };

    const LIMITS: QueryLimits = QueryLimits {
        min_len: 32,
        max_tokens: 510,
    };

    fn open(engine: &MemoryEngine, root: &std::path::Path, name: &str, n: usize) -> MemorySession {
        let passages: Vec<Passage> = (0..n)
            .map(|i| Passage {
                passage_id: i as PassageId,
                content: format!("passage number {i}"),
            })
            .collect();
        let handle = engine
            .build(BuildRequest {
                checkpoint: "m",
                index_root: root,
                index_name: name,
                passages: &passages,
                overwrite: OverwritePolicy::Overwrite,
                tuning: BuildTuning::for_corpus(n, 32),
                doc_maxlen: 256,
            })
            .unwrap();
        engine.open_session(&handle, &passages).unwrap()
    }

    fn binding(name: &str) -> SessionBinding {
        SessionBinding {
            checkpoint: "m".into(),
            index_name: name.into(),
        }
    }

    #[test]
    fn same_binding_reuses_session() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new();
        let cache = SearcherCache::new();
        let opens = Cell::new(0);

        for _ in 0..3 {
            cache
                .with_session(
                    &binding("a"),
                    false,
                    || {
                        opens.set(opens.get() + 1);
                        Ok(open(&engine, tmp.path(), "a", 4))
                    },
                    |_, _| Ok(()),
                )
                .unwrap();
        }
        assert_eq!(opens.get(), 1);
    }

    #[test]
    fn concurrent_reloads_open_one_session() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new();
        let cache = SearcherCache::new();
        let opens = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    cache
                        .with_session(
                            &binding("a"),
                            false,
                            || {
                                opens.fetch_add(1, Ordering::SeqCst);
                                Ok(open(&engine, tmp.path(), "a", 4))
                            },
                            |s, _| Ok(s.num_passages()),
                        )
                        .unwrap()
                });
            }
        });

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(cache.bound().unwrap(), Some(binding("a")));
    }

    #[test]
    fn poisoned_cache_reports_lock_error() {
        let cache: SearcherCache<MemorySession> = SearcherCache::new();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = cache.inner.lock().unwrap();
            panic!("poison the cache");
        }));

        assert!(matches!(cache.bound(), Err(Error::LockPoisoned(_))));
        assert!(matches!(cache.invalidate(), Err(Error::LockPoisoned(_))));
    }

    #[test]
    fn different_index_name_reloads() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new();
        let cache = SearcherCache::new();

        let n = cache
            .with_session(&binding("a"), false, || Ok(open(&engine, tmp.path(), "a", 4)), |s, _| {
                Ok(s.num_passages())
            })
            .unwrap();
        assert_eq!(n, 4);

        let n = cache
            .with_session(&binding("b"), false, || Ok(open(&engine, tmp.path(), "b", 7)), |s, _| {
                Ok(s.num_passages())
            })
            .unwrap();
        assert_eq!(n, 7);
        assert_eq!(cache.bound().unwrap(), Some(binding("b")));
    }

    #[test]
    fn fast_flag_reconfigures_base() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new();
        let cache = SearcherCache::new();
        let open_a = || Ok(open(&engine, tmp.path(), "a", 4));

        let base = cache.with_session(&binding("a"), false, open_a, |_, b| Ok(b)).unwrap();
        assert_eq!(base.ncells, 8);

        let (base, live) = cache
            .with_session(&binding("a"), true, open_a, |s, b| Ok((b, s.params())))
            .unwrap();
        assert_eq!(base, SearchParams::FAST);
        assert_eq!(live, SearchParams::FAST);
    }

    #[test]
    fn params_restored_after_large_k() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new();
        let mut session = open(&engine, tmp.path(), "a", 2_000);
        let base = tuning::base_search_params(2_000, false);
        session.configure(base);

        let out = run_tuned(&mut session, base, 1_500, Queries::One { text: "passage", allowed: None }, LIMITS)
            .unwrap();
        assert_eq!(out.plan.params.ndocs, 6_000);
        assert_eq!(session.params(), base);

        let out = run_tuned(&mut session, base, 10, Queries::One { text: "passage", allowed: None }, LIMITS)
            .unwrap();
        assert_eq!(out.plan.params.ncells, base.ncells);
        assert_eq!(session.params(), base);
    }

    #[test]
    fn params_restored_when_search_fails() {
        struct Failing(SearchParams);
        impl SearchSession for Failing {
            fn params(&self) -> SearchParams {
                self.0
            }
            fn configure(&mut self, params: SearchParams) {
                self.0 = params;
            }
            fn set_query_maxlen(&mut self, _: usize) {}
            fn num_passages(&self) -> usize {
                10_000
            }
            fn search(&mut self, _: &str, _: usize, _: Option<&[PassageId]>) -> Result<Vec<RankedPassage>> {
                Err(Error::Engine("boom".into()))
            }
        }

        let base = tuning::base_search_params(10_000, false);
        let mut session = Failing(base);
        let err = run_tuned(&mut session, base, 5_000, Queries::One { text: "q", allowed: None }, LIMITS)
            .unwrap_err();
        assert!(matches!(err, Error::Engine(_)));
        assert_eq!(session.params(), base);
    }

    #[test]
    fn k_clamped_to_corpus() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new();
        let mut session = open(&engine, tmp.path(), "a", 3);
        let base = session.params();

        let out = run_tuned(&mut session, base, 10, Queries::One { text: "passage", allowed: None }, LIMITS)
            .unwrap();
        assert!(out.plan.clamped);
        assert_eq!(out.results[0].len(), 3);
    }

    #[test]
    fn batch_returns_one_list_per_query() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = MemoryEngine::new();
        let mut session = open(&engine, tmp.path(), "a", 5);
        let base = session.params();
        let queries = vec!["number 1".to_string(), "number 2".to_string()];

        let out = run_tuned(&mut session, base, 2, Queries::Batch(&queries), LIMITS).unwrap();
        assert_eq!(out.results.len(), 2);
        assert_eq!(out.results[0][0].passage_id, 1);
        assert_eq!(out.results[1][0].passage_id, 2);
    }
}
