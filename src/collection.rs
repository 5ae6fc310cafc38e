//! The ordered passage store, kept positionally aligned with the identity map.
//!
//! `contents[i]` is the text of the i-th smallest live passage id. After a
//! delete the id sequence may have gaps while the content array stays dense,
//! so lookups go through the id order rather than indexing by raw id.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    doc_id::{self, DocumentId},
    error::{Error, Result},
    identity::{IdentityMap, PassageId},
    metadata::{DocumentMetadata, MetadataMap},
};

/// A chunk of document text addressed by its passage id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    pub passage_id: PassageId,
    pub content: String,
}

/// A caller-supplied document. One document becomes one passage; splitting
/// long documents happens before they reach this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub id: Option<DocumentId>,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Passages to index, each owned by the document at the same position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassageBatch {
    pub contents: Vec<String>,
    pub document_ids: Vec<DocumentId>,
    pub metadata: Option<MetadataMap>,
}

impl PassageBatch {
    pub fn new(
        contents: Vec<String>,
        document_ids: Vec<DocumentId>,
        metadata: Option<MetadataMap>,
    ) -> Result<Self> {
        let batch = Self {
            contents,
            document_ids,
            metadata,
        };
        batch.validate()?;
        Ok(batch)
    }

    /// Turn whole documents into a batch, generating ids for documents that
    /// come without one. Supplied ids must be unique, non-empty and of one kind.
    pub fn from_documents(documents: Vec<Document>) -> Result<Self> {
        let ids: Vec<DocumentId> = documents
            .iter()
            .map(|d| d.id.clone().unwrap_or_else(DocumentId::generate))
            .collect();
        doc_id::validate_unique(&ids)?;

        let mut metadata: Option<MetadataMap> = None;
        let mut contents = Vec::with_capacity(documents.len());
        for (doc, id) in documents.into_iter().zip(&ids) {
            if let Some(meta) = doc.metadata {
                metadata.get_or_insert_with(MetadataMap::new).insert(id.clone(), meta);
            }
            contents.push(doc.content);
        }

        Ok(Self {
            contents,
            document_ids: ids,
            metadata,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.contents.len() != self.document_ids.len() {
            return Err(Error::Validation(format!(
                "document ids must be the same length as the passages ({} ids for {} passages)",
                self.document_ids.len(),
                self.contents.len()
            )));
        }
        doc_id::validate_kinds(&self.document_ids)
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }
}

/// Result of splitting an incoming batch against the current index.
#[derive(Debug, Default)]
pub struct Partitioned {
    /// Passages whose document is new to the index.
    pub fresh: PassageBatch,
    /// Documents already present; their passages are dropped.
    pub duplicates: Vec<DocumentId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionStore {
    contents: Vec<String>,
    order: Vec<PassageId>,
    identity: IdentityMap,
    metadata: DocumentMetadata,
}

impl CollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh collection with passage ids `0..N-1`.
    pub fn from_batch(batch: PassageBatch) -> Result<Self> {
        batch.validate()?;
        let mut store = Self::new();
        store.metadata.merge(batch.metadata);
        store.identity.append(batch.document_ids.iter());
        store.contents = batch.contents;
        store.refresh_order();
        Ok(store)
    }

    /// Reassemble a store from persisted parts, checking alignment.
    pub fn from_parts(
        contents: Vec<String>,
        identity: IdentityMap,
        metadata: DocumentMetadata,
    ) -> Result<Self> {
        let mut store = Self {
            contents,
            order: Vec::new(),
            identity,
            metadata,
        };
        store.refresh_order();
        store.check_invariants()?;
        Ok(store)
    }

    fn refresh_order(&mut self) {
        self.order = self.identity.forward().keys().copied().collect();
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    pub fn contents(&self) -> &[String] {
        &self.contents
    }

    pub fn identity(&self) -> &IdentityMap {
        &self.identity
    }

    pub fn metadata(&self) -> &DocumentMetadata {
        &self.metadata
    }

    /// Every live passage with its id, in id order.
    pub fn passages(&self) -> Vec<Passage> {
        self.order
            .iter()
            .zip(&self.contents)
            .map(|(&passage_id, content)| Passage {
                passage_id,
                content: content.clone(),
            })
            .collect()
    }

    /// Separate passages of documents already in the index from new ones.
    /// Metadata travels with the fresh batch untouched, duplicates included.
    pub fn partition(&self, batch: PassageBatch) -> Partitioned {
        let mut fresh = PassageBatch {
            metadata: batch.metadata,
            ..PassageBatch::default()
        };
        let mut duplicates = Vec::new();

        for (content, doc) in batch.contents.into_iter().zip(batch.document_ids) {
            if self.identity.contains_document(&doc) {
                if !duplicates.contains(&doc) {
                    duplicates.push(doc);
                }
            } else {
                fresh.contents.push(content);
                fresh.document_ids.push(doc);
            }
        }

        Partitioned { fresh, duplicates }
    }

    /// Append passages with ids continuing from the current maximum.
    /// Returns the appended passages with their ids.
    pub fn append(&mut self, batch: PassageBatch) -> Vec<Passage> {
        let assigned = self.identity.append(batch.document_ids.iter());
        let passages = assigned
            .iter()
            .zip(&batch.contents)
            .map(|(&passage_id, content)| Passage {
                passage_id,
                content: content.clone(),
            })
            .collect();

        self.contents.extend(batch.contents);
        self.refresh_order();
        self.metadata.merge(batch.metadata);
        passages
    }

    /// Remove passages by id, preserving the order of the rest.
    /// Returns how many were removed.
    pub fn remove_by_passage_ids(&mut self, pids: &BTreeSet<PassageId>) -> usize {
        let before = self.contents.len();
        let kept: Vec<String> = self
            .order
            .iter()
            .zip(std::mem::take(&mut self.contents))
            .filter(|(pid, _)| !pids.contains(pid))
            .map(|(_, content)| content)
            .collect();
        self.contents = kept;
        self.identity.remove_passages(pids);
        self.refresh_order();
        before - self.contents.len()
    }

    /// Remove every passage of the given documents along with their metadata.
    /// Returns the removed passage ids.
    pub fn remove_documents(&mut self, docs: &[DocumentId]) -> BTreeSet<PassageId> {
        let pids = self.identity.resolve_documents(docs);
        self.remove_by_passage_ids(&pids);
        self.metadata.remove_documents(docs);
        pids
    }

    /// Text of a passage returned by the engine.
    pub fn content_at(&self, pid: PassageId) -> Result<&str> {
        let len = self.contents.len();
        match self.identity.max_passage_id() {
            Some(max) if pid <= max => {}
            _ => return Err(Error::OutOfRange { passage_id: pid, len }),
        }

        let pos = self
            .order
            .binary_search(&pid)
            .map_err(|_| Error::UnknownPassage(pid))?;
        self.contents
            .get(pos)
            .map(String::as_str)
            .ok_or(Error::OutOfRange { passage_id: pid, len })
    }

    /// Reassign passage ids `0..N-1`, as a full rebuild does.
    pub fn renumber(&mut self) {
        self.identity = self.identity.renumbered();
        self.refresh_order();
    }

    pub fn merge_metadata(&mut self, incoming: Option<MetadataMap>) {
        self.metadata.merge(incoming);
    }

    /// Drop metadata of documents that no longer have passages.
    pub fn reconcile_metadata(&mut self) -> Vec<DocumentId> {
        self.metadata.reconcile(&self.identity)
    }

    /// Collection length equals mapping size, the inverse is exact, and no
    /// metadata refers to an unknown document.
    pub fn check_invariants(&self) -> Result<()> {
        if self.contents.len() != self.identity.len() {
            return Err(Error::CorruptIndex(format!(
                "collection has {} passages but the id mapping has {} entries",
                self.contents.len(),
                self.identity.len()
            )));
        }
        self.identity.check_consistency()?;
        if let Some(entries) = self.metadata.entries()
            && let Some(orphan) =
                entries.keys().find(|doc| !self.identity.contains_document(doc))
        {
            return Err(Error::CorruptIndex(format!(
                "metadata present for unknown document '{orphan}'"
            )));
        }
        Ok(())
    }
}
