use candle_core::{Device, Tensor};
use pylate_rs::ColBERT;

use crate::error::{Error, Result};

pub const DEFAULT_MODEL_ID: &str = "lightonai/colbertv2.0";
pub const MODEL_ENV_VAR: &str = "COLBERTDB_MODEL";

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// Resolve the checkpoint to use: an explicit id, else `COLBERTDB_MODEL`,
/// else [`DEFAULT_MODEL_ID`].
pub fn resolve_model_id(explicit: Option<&str>) -> String {
    match explicit {
        Some(id) => id.to_string(),
        None => std::env::var(MODEL_ENV_VAR)
            .unwrap_or_else(|_| DEFAULT_MODEL_ID.to_string()),
    }
}

/// Lazily loaded ColBERT checkpoint.
pub struct ModelManager {
    model: Option<ColBERT>,
    model_id: String,
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelManager {
    /// Creates a manager for the checkpoint named by `COLBERTDB_MODEL`, or
    /// the default one. Nothing is downloaded until the first encode.
    pub fn new() -> Self {
        Self::with_model_id(resolve_model_id(None))
    }

    pub fn with_model_id(model_id: String) -> Self {
        Self {
            model: None,
            model_id,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Ensures the model is loaded, downloading from HuggingFace Hub if needed.
    fn ensure_loaded(&mut self) -> Result<&mut ColBERT> {
        if self.model.is_none() {
            tracing::info!(model = %self.model_id, "loading ColBERT model");
            let colbert: ColBERT = ColBERT::from(&self.model_id)
                .with_device(default_device())
                .try_into()?;
            self.model = Some(colbert);
        }

        self.model
            .as_mut()
            .ok_or_else(|| Error::Config("model failed to load".into()))
    }

    /// Encodes passages into token-level embeddings, `[batch, tokens, dim]`.
    pub fn encode_documents(&mut self, texts: &[String]) -> Result<Tensor> {
        let model = self.ensure_loaded()?;
        Ok(model.encode(texts, false)?)
    }

    /// Encodes a query into a `[tokens, dim]` matrix, keeping at most
    /// `max_tokens` rows.
    pub fn encode_query(&mut self, query: &str, max_tokens: usize) -> Result<Tensor> {
        let model = self.ensure_loaded()?;
        let embeddings = model.encode(&[query.to_string()], true)?;
        // [1, Q, D] -> [Q, D]
        let embeddings = embeddings.squeeze(0).map_err(candle_err)?;
        truncate_rows(embeddings, max_tokens)
    }
}

/// Keep at most `max_rows` leading rows of a 2D tensor.
pub fn truncate_rows(tensor: Tensor, max_rows: usize) -> Result<Tensor> {
    let rows = tensor.dim(0).map_err(candle_err)?;
    if rows <= max_rows {
        return Ok(tensor);
    }
    tensor.narrow(0, 0, max_rows).map_err(candle_err)
}

pub(crate) fn candle_err(e: candle_core::Error) -> Error {
    Error::Engine(format!("tensor computation error: {e}"))
}
