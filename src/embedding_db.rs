use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};

use crate::{
    error::{Error, Result},
    identity::PassageId,
};

const EMBEDDINGS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("passage_embeddings");

/// Header size: 4 bytes token count + 4 bytes dimension.
const HEADER_SIZE: usize = 8;

/// File name of the embedding store inside an index directory.
pub const EMBEDDINGS_FILE: &str = "embeddings.redb";

/// Per-token embedding matrices keyed by passage id.
///
/// Binary format per entry:
/// - 4 bytes: token count T (u32 LE)
/// - 4 bytes: embedding dimension D (u32 LE)
/// - T * D * 4 bytes: f32 LE values in row-major order
pub struct EmbeddingDb {
    db: Database,
}

/// A retrieved embedding matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingMatrix {
    pub num_tokens: u32,
    pub dimension: u32,
    /// Row-major: `data[token * dimension + dim]`.
    pub data: Vec<f32>,
}

impl EmbeddingMatrix {
    pub fn new(num_tokens: u32, dimension: u32, data: Vec<f32>) -> Result<Self> {
        if data.len() != num_tokens as usize * dimension as usize {
            return Err(Error::Validation(format!(
                "embedding has {} values, expected {num_tokens} tokens x {dimension} dims",
                data.len()
            )));
        }
        Ok(Self {
            num_tokens,
            dimension,
            data,
        })
    }

    pub fn token_embedding(&self, token_idx: u32) -> &[f32] {
        let start = (token_idx * self.dimension) as usize;
        &self.data[start..start + self.dimension as usize]
    }

    fn encoded_len(&self) -> usize {
        HEADER_SIZE + std::mem::size_of_val(self.data.as_slice())
    }

    fn write_to(&self, dest: &mut [u8]) {
        dest[0..4].copy_from_slice(&self.num_tokens.to_le_bytes());
        dest[4..8].copy_from_slice(&self.dimension.to_le_bytes());
        dest[HEADER_SIZE..].copy_from_slice(bytemuck::cast_slice(&self.data));
    }

    /// `None` for a truncated or mis-sized entry.
    fn decode(bytes: &[u8]) -> Option<Self> {
        let header = bytes.get(..HEADER_SIZE)?;
        let num_tokens = u32::from_le_bytes(header[0..4].try_into().ok()?);
        let dimension = u32::from_le_bytes(header[4..8].try_into().ok()?);

        let expected = HEADER_SIZE + num_tokens as usize * dimension as usize * 4;
        if bytes.len() != expected {
            return None;
        }

        let data: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes[HEADER_SIZE..]);
        Some(Self {
            num_tokens,
            dimension,
            data,
        })
    }
}

impl EmbeddingDb {
    /// Open or create an embeddings database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(EMBEDDINGS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Store matrices for many passages in one transaction.
    ///
    /// Uses `insert_reserve` to write each entry in place.
    pub fn store_batch(&self, entries: &[(PassageId, EmbeddingMatrix)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(EMBEDDINGS)?;
            for (pid, matrix) in entries {
                let mut guard = table.insert_reserve(*pid, matrix.encoded_len())?;
                matrix.write_to(guard.as_mut());
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn store(&self, pid: PassageId, matrix: &EmbeddingMatrix) -> Result<()> {
        self.store_batch(std::slice::from_ref(&(pid, matrix.clone())))
    }

    pub fn load(&self, pid: PassageId) -> Result<Option<EmbeddingMatrix>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;
        Ok(table
            .get(pid)?
            .and_then(|guard| EmbeddingMatrix::decode(guard.value())))
    }

    /// Every stored matrix in passage id order. Malformed entries are
    /// skipped.
    pub fn load_all(&self) -> Result<Vec<(PassageId, EmbeddingMatrix)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            match EmbeddingMatrix::decode(value.value()) {
                Some(matrix) => result.push((key.value(), matrix)),
                None => tracing::warn!(
                    passage_id = key.value(),
                    "skipping malformed embedding entry"
                ),
            }
        }
        Ok(result)
    }

    /// Remove many entries in one transaction. Returns how many existed.
    pub fn remove_batch(&self, pids: &[PassageId]) -> Result<usize> {
        if pids.is_empty() {
            return Ok(0);
        }
        let txn = self.db.begin_write()?;
        let mut removed = 0;
        {
            let mut table = txn.open_table(EMBEDDINGS)?;
            for &pid in pids {
                if table.remove(pid)?.is_some() {
                    removed += 1;
                }
            }
        }
        txn.commit()?;
        Ok(removed)
    }

    pub fn len(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl std::fmt::Debug for EmbeddingDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingDb").finish_non_exhaustive()
    }
}
