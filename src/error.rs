// src/error.rs
// Error type for the inference layer: weight resolution, model loading,
// tensor pre/post-processing and image codecs. The HTTP layer maps these
// onto status codes in `web::error`.

use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InferenceError {
    // Client-side problems with the requested parameters
    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // Weights and model construction
    #[error("Model weights not found: {0}")]
    WeightsNotFound(String),
    #[error("Failed to download model weights: {0}")]
    Download(String),
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    // Source image retrieval
    #[error("Failed to fetch source image: {0}")]
    Fetch(String),

    // Per-request processing
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl InferenceError {
    /// True for errors caused by the request's parameters rather than by the
    /// service or its models.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            InferenceError::UnsupportedModel(_) | InferenceError::InvalidParameter(_)
        )
    }
}

// Helper for locking mutexes, converting PoisonError to InferenceError
pub fn lock_mutex<'a, T>(
    mutex: &'a Mutex<T>,
    operation_name: &str,
) -> Result<MutexGuard<'a, T>, InferenceError> {
    mutex.lock().map_err(|e| {
        InferenceError::Internal(format!(
            "Failed to acquire lock for {}: {}",
            operation_name, e
        ))
    })
}
