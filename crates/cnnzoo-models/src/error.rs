use cnnzoo_core::TensorError;
use thiserror::Error;

/// Errors raised while resolving or loading a model configuration.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid model configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown model '{name}', expected one of: {known}")]
    UnknownModel { name: String, known: String },

    #[error("Invalid VGG stage '{0}': expected a channel width or \"M\"")]
    InvalidStage(String),

    #[error(transparent)]
    Tensor(#[from] TensorError),
}
