//! On-disk form of an index's identity state.
//!
//! Each file is written to a temporary sibling, synced, and renamed over the
//! target. The mapping file is written last so that an index only becomes
//! loadable once its collection is in place.

use std::{
    collections::BTreeMap,
    io::Write,
    path::Path,
};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    collection::CollectionStore,
    data_dir::IndexLayout,
    engine::IndexHandle,
    error::{Error, Result},
    identity::{ForwardMap, IdentityMap},
    metadata::DocumentMetadata,
};

/// Key under which this crate's state is merged into the engine's
/// `metadata.json`.
pub const METADATA_KEY: &str = "colbertdb";

#[derive(Debug, Clone)]
pub struct PersistedIndex {
    pub store: CollectionStore,
    pub handle: IndexHandle,
}

fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        serde_json::to_writer(&mut file, value)?;
        file.flush()?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn incompatible(layout: &IndexLayout, reason: impl Into<String>) -> Error {
    Error::IncompatibleIndexFormat {
        path: layout.index_dir(),
        reason: reason.into(),
    }
}

/// Merge the index configuration into the engine's metadata file, keeping
/// every key the engine wrote.
fn save_index_config(layout: &IndexLayout, handle: &IndexHandle) -> Result<()> {
    let path = layout.engine_metadata();
    let mut engine_metadata: Map<String, Value> = if path.exists() {
        match serde_json::from_slice(&std::fs::read(&path)?)? {
            Value::Object(map) => map,
            _ => {
                return Err(Error::CorruptIndex(format!(
                    "{} is not a JSON object",
                    path.display()
                )));
            }
        }
    } else {
        Map::new()
    };

    let mut index_config = serde_json::to_value(handle)?;
    if let Value::Object(config) = &mut index_config {
        config.insert("index_name".into(), Value::String(layout.name().into()));
    }
    engine_metadata.insert(
        METADATA_KEY.into(),
        serde_json::json!({ "index_config": index_config }),
    );

    write_json_atomic(&path, &engine_metadata)
}

/// Write the complete identity state of an index.
pub fn save(
    layout: &IndexLayout,
    store: &CollectionStore,
    handle: &IndexHandle,
) -> Result<()> {
    store.check_invariants()?;

    save_index_config(layout, handle)?;
    write_json_atomic(&layout.collection(), store.contents())?;
    if let Some(keyed) = store.metadata().to_keyed() {
        write_json_atomic(&layout.docid_metadata_map(), &keyed)?;
    }
    write_json_atomic(&layout.pid_docid_map(), store.identity().forward())?;

    debug!(
        index = layout.name(),
        passages = store.len(),
        documents = store.identity().document_count(),
        "saved index state"
    );
    Ok(())
}

/// Read an index back, rebuilding the inverse map and checking alignment.
pub fn load(layout: &IndexLayout) -> Result<PersistedIndex> {
    let dir = layout.index_dir();
    if !dir.is_dir() {
        return Err(Error::NotFound {
            kind: "index",
            name: layout.name().to_string(),
        });
    }

    let pid_map_path = layout.pid_docid_map();
    if !pid_map_path.is_file() {
        return Err(incompatible(
            layout,
            "could not load pid_docid_map.json from the index",
        ));
    }
    let forward: ForwardMap = serde_json::from_slice(&std::fs::read(&pid_map_path)?)?;
    let identity = IdentityMap::from_forward(forward);

    let collection_path = layout.collection();
    if !collection_path.is_file() {
        return Err(incompatible(layout, "collection.json is missing"));
    }
    let contents: Vec<String> =
        serde_json::from_slice(&std::fs::read(&collection_path)?)?;

    let handle = load_index_config(layout)?;

    let metadata_path = layout.docid_metadata_map();
    let mut metadata = if metadata_path.is_file() {
        let keyed: BTreeMap<String, Value> =
            serde_json::from_slice(&std::fs::read(&metadata_path)?)?;
        DocumentMetadata::from_keyed(keyed, &identity)
    } else {
        DocumentMetadata::untracked()
    };
    let orphans = metadata.reconcile(&identity);
    if !orphans.is_empty() {
        warn!(
            index = layout.name(),
            count = orphans.len(),
            "ignoring persisted metadata for unknown documents"
        );
    }

    let store = CollectionStore::from_parts(contents, identity, metadata)?;
    Ok(PersistedIndex { store, handle })
}

fn load_index_config(layout: &IndexLayout) -> Result<IndexHandle> {
    let path = layout.engine_metadata();
    if !path.is_file() {
        return Err(incompatible(layout, "metadata.json is missing"));
    }

    let mut engine_metadata: Value = serde_json::from_slice(&std::fs::read(&path)?)?;
    let config = engine_metadata
        .get_mut(METADATA_KEY)
        .and_then(|v| v.get_mut("index_config"))
        .map(Value::take)
        .ok_or_else(|| {
            incompatible(layout, "metadata.json has no colbertdb index configuration")
        })?;

    let mut handle: IndexHandle = serde_json::from_value(config)
        .map_err(|e| incompatible(layout, format!("unreadable index configuration: {e}")))?;
    // The directory may have been moved since it was written.
    handle.index_root = layout.indexes_dir().to_path_buf();
    handle.index_name = layout.name().to_string();
    Ok(handle)
}

/// Remove an index directory. Returns whether anything was removed; an
/// index that is already gone is not an error.
pub fn remove(layout: &IndexLayout) -> Result<bool> {
    match std::fs::remove_dir_all(layout.index_dir()) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;

    use super::*;
    use crate::{
        collection::PassageBatch,
        doc_id::DocumentId,
        metadata::MetadataMap,
    };

    fn layout(root: &Path) -> IndexLayout {
        IndexLayout::new(root.join("default").join("indexes"), "notes").unwrap()
    }

    fn handle(layout: &IndexLayout) -> IndexHandle {
        IndexHandle {
            checkpoint: "answerdotai/answerai-colbert-small-v1".into(),
            index_root: layout.indexes_dir().to_path_buf(),
            index_name: "notes".into(),
            nbits: 8,
            kmeans_niters: 20,
            doc_maxlen: 256,
            index_bsize: 32,
            index_type: "PLAID".into(),
        }
    }

    fn store() -> CollectionStore {
        let batch = PassageBatch::new(
            vec!["first".into(), "second".into(), "third".into()],
            vec![DocumentId::from(10), DocumentId::from(10), DocumentId::from(11)],
            Some(MetadataMap::from([(DocumentId::from(11), json!({"tag": "x"}))])),
        )
        .unwrap();
        CollectionStore::from_batch(batch).unwrap()
    }

    #[test]
    fn save_then_load_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        let original = store();

        save(&layout, &original, &handle(&layout)).unwrap();
        let loaded = load(&layout).unwrap();

        assert_eq!(loaded.store.identity().forward(), original.identity().forward());
        assert!(loaded.store.identity().check_consistency().is_ok());
        assert_eq!(loaded.store, original);
        assert_eq!(loaded.handle, handle(&layout));
    }

    #[test]
    fn pid_map_keys_are_strings_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        save(&layout, &store(), &handle(&layout)).unwrap();

        let raw: Value =
            serde_json::from_slice(&std::fs::read(layout.pid_docid_map()).unwrap()).unwrap();
        assert_eq!(raw, json!({"0": 10, "1": 10, "2": 11}));
    }

    #[test]
    fn save_keeps_engine_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        std::fs::create_dir_all(layout.index_dir()).unwrap();
        std::fs::write(layout.engine_metadata(), r#"{"config": {"dim": 96}}"#).unwrap();

        save(&layout, &store(), &handle(&layout)).unwrap();

        let raw: Value =
            serde_json::from_slice(&std::fs::read(layout.engine_metadata()).unwrap()).unwrap();
        assert_eq!(raw["config"]["dim"], 96);
        assert_eq!(raw["colbertdb"]["index_config"]["index_name"], "notes");
        assert_eq!(raw["colbertdb"]["index_config"]["index_type"], "PLAID");
    }

    #[test]
    fn untracked_metadata_writes_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        let batch = PassageBatch::new(vec!["a".into()], vec![DocumentId::from("a")], None)
            .unwrap();
        let s = CollectionStore::from_batch(batch).unwrap();

        save(&layout, &s, &handle(&layout)).unwrap();
        assert!(!layout.docid_metadata_map().exists());
        assert!(!load(&layout).unwrap().store.metadata().is_tracked());
    }

    #[test]
    fn missing_pid_map_is_incompatible() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        save(&layout, &store(), &handle(&layout)).unwrap();
        std::fs::remove_file(layout.pid_docid_map()).unwrap();

        let err = load(&layout).unwrap_err();
        assert!(matches!(err, Error::IncompatibleIndexFormat { .. }));
    }

    #[test]
    fn missing_directory_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = load(&layout(tmp.path())).unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "index", .. }));
    }

    #[test]
    fn misaligned_collection_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        save(&layout, &store(), &handle(&layout)).unwrap();
        std::fs::write(layout.collection(), r#"["only one"]"#).unwrap();

        assert!(load(&layout).unwrap_err().is_corruption());
    }

    #[test]
    fn loaded_handle_follows_moved_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let old = layout(tmp.path());
        save(&old, &store(), &handle(&old)).unwrap();

        let moved_root = tmp.path().join("elsewhere");
        std::fs::create_dir_all(&moved_root).unwrap();
        std::fs::rename(old.index_dir(), moved_root.join("renamed")).unwrap();

        let moved = IndexLayout::new(moved_root.clone(), "renamed").unwrap();
        let loaded = load(&moved).unwrap();
        assert_eq!(loaded.handle.index_root, PathBuf::from(&moved_root));
        assert_eq!(loaded.handle.index_name, "renamed");
    }

    #[test]
    fn remove_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path());
        save(&layout, &store(), &handle(&layout)).unwrap();

        assert!(remove(&layout).unwrap());
        assert!(!layout.index_dir().exists());
        assert!(!remove(&layout).unwrap());
    }
}
