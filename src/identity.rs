//! Bidirectional passage id ↔ document id mapping.
//!
//! The forward view (`passage -> document`) is authoritative. The inverse
//! view is always recomputed from it with [`IdentityMap::invert`] after a
//! mutation or a load, so the two can never drift apart.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    doc_id::{DocumentId, IdKind},
    error::{Error, Result},
};

/// Positional identifier of a passage inside the engine's passage array.
pub type PassageId = u64;

pub type ForwardMap = BTreeMap<PassageId, DocumentId>;
pub type InverseMap = BTreeMap<DocumentId, BTreeSet<PassageId>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityMap {
    forward: ForwardMap,
    inverse: InverseMap,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an authoritative forward map, deriving the inverse.
    pub fn from_forward(forward: ForwardMap) -> Self {
        let inverse = Self::invert(&forward);
        Self { forward, inverse }
    }

    /// Derive `document -> passages` from `passage -> document` in one scan.
    pub fn invert(forward: &ForwardMap) -> InverseMap {
        let mut inverse: InverseMap = BTreeMap::new();
        for (&pid, doc) in forward {
            inverse.entry(doc.clone()).or_default().insert(pid);
        }
        inverse
    }

    pub fn forward(&self) -> &ForwardMap {
        &self.forward
    }

    pub fn inverse(&self) -> &InverseMap {
        &self.inverse
    }

    /// Number of passages.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn document_count(&self) -> usize {
        self.inverse.len()
    }

    /// Resolve a passage id returned by the engine.
    pub fn translate(&self, pid: PassageId) -> Result<&DocumentId> {
        self.forward.get(&pid).ok_or(Error::UnknownPassage(pid))
    }

    /// Passages belonging to a document. Unknown documents yield an empty
    /// set: a search restricted to them simply has no candidates.
    pub fn passages_for(&self, doc: &DocumentId) -> BTreeSet<PassageId> {
        self.inverse.get(doc).cloned().unwrap_or_default()
    }

    /// Kind of the ids already mapped; `None` while empty. Every batch
    /// validates to a single kind, so the first document speaks for all.
    pub fn id_kind(&self) -> Option<IdKind> {
        self.inverse.keys().next().map(DocumentId::kind)
    }

    pub fn contains_document(&self, doc: &DocumentId) -> bool {
        self.inverse.contains_key(doc)
    }

    pub fn max_passage_id(&self) -> Option<PassageId> {
        self.forward.keys().next_back().copied()
    }

    /// The id the next appended passage receives.
    pub fn next_passage_id(&self) -> PassageId {
        self.max_passage_id().map_or(0, |max| max + 1)
    }

    /// Append passages for the given documents with contiguous ids starting
    /// at [`next_passage_id`](Self::next_passage_id). Returns the assigned ids.
    pub fn append<'a, I>(&mut self, docs: I) -> Vec<PassageId>
    where
        I: IntoIterator<Item = &'a DocumentId>,
    {
        let mut next = self.next_passage_id();
        let mut assigned = Vec::new();
        for doc in docs {
            self.forward.insert(next, doc.clone());
            assigned.push(next);
            next += 1;
        }
        self.inverse = Self::invert(&self.forward);
        assigned
    }

    /// Drop the given passages from both views.
    pub fn remove_passages(&mut self, pids: &BTreeSet<PassageId>) {
        self.forward.retain(|pid, _| !pids.contains(pid));
        self.inverse = Self::invert(&self.forward);
    }

    /// All passages belonging to any of the given documents.
    pub fn resolve_documents<'a, I>(&self, docs: I) -> BTreeSet<PassageId>
    where
        I: IntoIterator<Item = &'a DocumentId>,
    {
        docs.into_iter()
            .filter_map(|doc| self.inverse.get(doc))
            .flatten()
            .copied()
            .collect()
    }

    /// Same documents, passage ids reassigned `0..N-1` in ascending order.
    pub fn renumbered(&self) -> Self {
        let forward: ForwardMap = self
            .forward
            .values()
            .enumerate()
            .map(|(pid, doc)| (pid as PassageId, doc.clone()))
            .collect();
        Self::from_forward(forward)
    }

    /// Verify that the inverse view is exactly the inverse of the forward view.
    pub fn check_consistency(&self) -> Result<()> {
        if self.inverse != Self::invert(&self.forward) {
            return Err(Error::CorruptIndex(
                "document -> passage map is not the inverse of passage -> document"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
