use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DEFAULT_STORE: &str = "default";

pub const COLLECTION_FILE: &str = "collection.json";
pub const PID_DOCID_MAP_FILE: &str = "pid_docid_map.json";
pub const DOCID_METADATA_MAP_FILE: &str = "docid_metadata_map.json";
pub const ENGINE_METADATA_FILE: &str = "metadata.json";

/// Check that `name` is a single plain path component, so joining it onto a
/// parent directory can never address the parent itself or escape it.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(Error::Validation(format!("invalid {kind} name {name:?}: {reason}")))
    };
    if name.trim().is_empty() {
        return invalid("must not be empty");
    }
    if name == "." || name == ".." {
        return invalid("must not be a relative path component");
    }
    if name.contains(['/', '\\']) || Path::new(name).components().count() != 1 {
        return invalid("must not contain path separators");
    }
    if name.contains('\0') {
        return invalid("must not contain NUL bytes");
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The COLBERTDB_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/colbertdb/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var("COLBERTDB_DATA_DIR") {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("colbertdb")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<store>/indexes`, where every named index of a store lives.
    pub fn indexes_dir(&self, store: &str) -> Result<PathBuf> {
        validate_name("store", store)?;
        Ok(self.root.join(store).join("indexes"))
    }

    pub fn layout(&self, store: &str, index_name: &str) -> Result<IndexLayout> {
        IndexLayout::new(self.indexes_dir(store)?, index_name)
    }

    /// Names of the indexes of a store that carry an identity map.
    pub fn list_indexes(&self, store: &str) -> Result<Vec<String>> {
        let dir = self.indexes_dir(store)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string)
            else {
                continue;
            };
            if IndexLayout::new(dir.clone(), &name).is_ok_and(|l| l.exists()) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// File paths of one named index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexLayout {
    indexes_dir: PathBuf,
    name: String,
}

impl IndexLayout {
    pub fn new(indexes_dir: PathBuf, name: &str) -> Result<Self> {
        validate_name("index", name)?;
        Ok(Self {
            indexes_dir,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The root the engine receives; the index itself is `<root>/<name>`.
    pub fn indexes_dir(&self) -> &Path {
        &self.indexes_dir
    }

    pub fn index_dir(&self) -> PathBuf {
        self.indexes_dir.join(&self.name)
    }

    pub fn collection(&self) -> PathBuf {
        self.index_dir().join(COLLECTION_FILE)
    }

    pub fn pid_docid_map(&self) -> PathBuf {
        self.index_dir().join(PID_DOCID_MAP_FILE)
    }

    pub fn docid_metadata_map(&self) -> PathBuf {
        self.index_dir().join(DOCID_METADATA_MAP_FILE)
    }

    pub fn engine_metadata(&self) -> PathBuf {
        self.index_dir().join(ENGINE_METADATA_FILE)
    }

    /// Whether an index of this crate's format lives here.
    pub fn exists(&self) -> bool {
        self.pid_docid_map().is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_with_explicit_path() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();

        assert_eq!(dir.root(), tmp.path());
        assert_eq!(
            dir.indexes_dir("default").unwrap(),
            tmp.path().join("default").join("indexes")
        );
    }

    #[test]
    fn layout_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let layout = dir.layout("default", "notes").unwrap();
        let index = tmp.path().join("default/indexes/notes");

        assert_eq!(layout.index_dir(), index);
        assert_eq!(layout.collection(), index.join("collection.json"));
        assert_eq!(layout.pid_docid_map(), index.join("pid_docid_map.json"));
        assert_eq!(
            layout.docid_metadata_map(),
            index.join("docid_metadata_map.json")
        );
        assert!(!layout.exists());
    }

    #[test]
    fn list_indexes_skips_foreign_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();
        assert!(dir.list_indexes("default").unwrap().is_empty());

        let good = dir.layout("default", "good").unwrap();
        std::fs::create_dir_all(good.index_dir()).unwrap();
        std::fs::write(good.pid_docid_map(), "{}").unwrap();
        std::fs::create_dir_all(dir.layout("default", "stray").unwrap().index_dir())
            .unwrap();

        assert_eq!(dir.list_indexes("default").unwrap(), vec!["good"]);
    }

    #[test]
    fn rejects_names_that_escape_the_index_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();

        for name in ["", " ", ".", "..", "a/b", "a/../b", "../other", "/abs", "a\\b"] {
            let err = dir.layout("default", name).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{name:?}: {err}");
        }
        for store in ["", "..", "x/y"] {
            assert!(matches!(
                dir.layout(store, "notes").unwrap_err(),
                Error::Validation(_)
            ));
            assert!(dir.list_indexes(store).is_err());
        }

        assert!(dir.layout("default", "notes.v2").is_ok());
        assert!(dir.layout("default", "..notes").is_ok());
    }
}
