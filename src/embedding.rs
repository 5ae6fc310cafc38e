use candle_core::{Device, Tensor};
use kdam::{BarExt, tqdm};

use crate::{
    collection::Passage,
    embedding_db::{EmbeddingDb, EmbeddingMatrix},
    error::{Error, Result},
    identity::PassageId,
    model_manager::{ModelManager, candle_err, truncate_rows},
};

/// Encoding parameters for passages.
#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    pub batch_size: usize,
    /// Token rows kept per passage.
    pub doc_maxlen: usize,
    pub progress: bool,
}

/// Encode passages in batches of `options.batch_size`.
pub fn encode_passages(
    model: &mut ModelManager,
    passages: &[Passage],
    options: EncodeOptions,
) -> Result<Vec<(PassageId, EmbeddingMatrix)>> {
    let mut out = Vec::with_capacity(passages.len());
    if passages.is_empty() {
        return Ok(out);
    }

    let mut bar = options
        .progress
        .then(|| tqdm!(total = passages.len(), desc = "Encoding passages"));

    for chunk in passages.chunks(options.batch_size.max(1)) {
        let texts: Vec<String> = chunk.iter().map(|p| p.content.clone()).collect();
        let embeddings = model.encode_documents(&texts)?;

        // [batch, tokens, dim]
        let (batch, _, _) = embeddings.dims3().map_err(|e| {
            Error::Engine(format!("unexpected embedding tensor shape: {e}"))
        })?;
        if batch != chunk.len() {
            return Err(Error::Engine(format!(
                "model returned {batch} embeddings for {} passages",
                chunk.len()
            )));
        }

        for (i, passage) in chunk.iter().enumerate() {
            let rows = embeddings.get(i).map_err(candle_err)?;
            let rows = truncate_rows(rows, options.doc_maxlen)?;
            out.push((passage.passage_id, tensor_to_matrix(&rows)?));
        }

        if let Some(bar) = bar.as_mut() {
            bar.update(chunk.len())?;
        }
    }

    if let Some(bar) = bar.as_mut() {
        bar.refresh()?;
    }
    Ok(out)
}

/// Encode passages and write their matrices to the store.
/// Returns the number of passages stored.
pub fn embed_and_store(
    model: &mut ModelManager,
    db: &EmbeddingDb,
    passages: &[Passage],
    options: EncodeOptions,
) -> Result<usize> {
    let encoded = encode_passages(model, passages, options)?;
    db.store_batch(&encoded)?;
    Ok(encoded.len())
}

/// Convert a 2D `[tokens, dim]` tensor into a stored matrix.
pub fn tensor_to_matrix(tensor: &Tensor) -> Result<EmbeddingMatrix> {
    let (tokens, dim) = tensor.dims2().map_err(candle_err)?;
    let data = tensor
        .flatten_all()
        .and_then(|t| t.to_dtype(candle_core::DType::F32))
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(candle_err)?;
    EmbeddingMatrix::new(tokens as u32, dim as u32, data)
}

/// Rebuild a `[tokens, dim]` CPU tensor from a stored matrix.
pub fn matrix_to_tensor(matrix: &EmbeddingMatrix) -> Result<Tensor> {
    Tensor::from_slice(
        &matrix.data,
        (matrix.num_tokens as usize, matrix.dimension as usize),
        &Device::Cpu,
    )
    .map_err(candle_err)
}
