use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tracing::warn;

use crate::{doc_id::DocumentId, identity::IdentityMap};

pub type MetadataMap = BTreeMap<DocumentId, Value>;

/// Optional per-document metadata.
///
/// `None` means the index does not track metadata at all (no
/// `docid_metadata_map.json` on disk). Merging never materializes entries
/// for documents the caller did not mention.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentMetadata {
    entries: Option<MetadataMap>,
}

impl DocumentMetadata {
    pub fn new(entries: Option<MetadataMap>) -> Self {
        Self { entries }
    }

    pub fn untracked() -> Self {
        Self { entries: None }
    }

    pub fn is_tracked(&self) -> bool {
        self.entries.is_some()
    }

    pub fn entries(&self) -> Option<&MetadataMap> {
        self.entries.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, doc: &DocumentId) -> Option<&Value> {
        self.entries.as_ref()?.get(doc)
    }

    /// Merge incoming metadata. On a duplicate document id the incoming
    /// value wins; `None` leaves the current state untouched.
    pub fn merge(&mut self, incoming: Option<MetadataMap>) {
        let Some(incoming) = incoming else {
            return;
        };
        self.entries.get_or_insert_with(BTreeMap::new).extend(incoming);
    }

    pub fn remove_documents<'a, I>(&mut self, docs: I)
    where
        I: IntoIterator<Item = &'a DocumentId>,
    {
        if let Some(entries) = self.entries.as_mut() {
            for doc in docs {
                entries.remove(doc);
            }
        }
    }

    /// Drop entries whose document has no passages. Returns what was dropped.
    pub fn reconcile(&mut self, identity: &IdentityMap) -> Vec<DocumentId> {
        let Some(entries) = self.entries.as_mut() else {
            return Vec::new();
        };

        let orphans: Vec<DocumentId> = entries
            .keys()
            .filter(|doc| !identity.contains_document(doc))
            .cloned()
            .collect();
        for doc in &orphans {
            entries.remove(doc);
        }
        if !orphans.is_empty() {
            warn!(
                count = orphans.len(),
                "dropping metadata for documents with no passages"
            );
        }
        orphans
    }

    /// JSON-object form: keys are the display form of the document id.
    pub fn to_keyed(&self) -> Option<BTreeMap<String, Value>> {
        self.entries.as_ref().map(|entries| {
            entries
                .iter()
                .map(|(doc, value)| (doc.as_key(), value.clone()))
                .collect()
        })
    }

    /// Inverse of [`to_keyed`](Self::to_keyed). Keys are matched against the
    /// documents known to `identity`; keys that match nothing are kept as
    /// string ids so [`reconcile`](Self::reconcile) can report them.
    pub fn from_keyed(
        keyed: BTreeMap<String, Value>,
        identity: &IdentityMap,
    ) -> Self {
        let known: HashMap<String, &DocumentId> = identity
            .inverse()
            .keys()
            .map(|doc| (doc.as_key(), doc))
            .collect();

        let entries = keyed
            .into_iter()
            .map(|(key, value)| {
                let doc = match known.get(&key) {
                    Some(doc) => (*doc).clone(),
                    None => DocumentId::String(key),
                };
                (doc, value)
            })
            .collect();

        Self {
            entries: Some(entries),
        }
    }
}
