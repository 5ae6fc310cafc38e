use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("model error: {0}")]
    Model(#[from] pylate_rs::ColbertError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),

    #[error(
        "incompatible index format at {}: {reason}; the index was probably written by an older version and must be rebuilt",
        path.display()
    )]
    IncompatibleIndexFormat { path: PathBuf, reason: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("engine returned unknown passage id {0}")]
    UnknownPassage(u64),

    #[error("passage id {passage_id} is outside the collection (len {len})")]
    OutOfRange { passage_id: u64, len: usize },

    #[error("index build failed: {0}")]
    Build(String),

    #[error("vector engine error: {0}")]
    Engine(String),

    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("cannot {operation} an index in state {state}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

impl Error {
    /// Whether the error points at internal mapping corruption rather than
    /// bad input or an I/O failure.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::UnknownPassage(_)
                | Error::OutOfRange { .. }
                | Error::CorruptIndex(_)
        )
    }
}
