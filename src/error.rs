//! Error type shared by the pipeline and safety-checker adapters
//!
//! Failures raised by the tensor backend (device or memory exhaustion, shape
//! mismatches) are carried unmodified in [`Error::Candle`].

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A generation parameter violates a hard constraint of the model
    #[error("invalid parameter `{field}`: {reason}")]
    InvalidParameter { field: &'static str, reason: String },

    /// Anything raised by candle (device, memory, shape, dtype)
    #[error("tensor backend error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("failed to parse {}: {source}", path.display())]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("required artifact missing: {0}")]
    MissingArtifact(&'static str),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("LoRA layer `{layer}` does not fit `{target}`: delta {delta:?} vs weight {weight:?}")]
    LoraShape {
        layer: String,
        target: String,
        delta: Vec<usize>,
        weight: Vec<usize>,
    },

    #[error("classifier produced {actual} flags for {expected} images")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("hub download failed: {0}")]
    Hub(#[from] hf_hub::api::tokio::ApiError),

    #[error(transparent)]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn tokenizer(err: impl std::fmt::Display) -> Self {
        Self::Tokenizer(err.to_string())
    }
}

/// Read and deserialize a JSON config file, keeping the path in the error
pub(crate) fn read_json<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|source| Error::ConfigFile {
        path: path.to_path_buf(),
        source,
    })
}
