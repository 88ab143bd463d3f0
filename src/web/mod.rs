// HTTP surface: background removal and upscaling endpoints plus health and
// model listing.

mod app;
mod error;
mod extract_request_data;
mod handlers;
mod headers;
mod listeners;
mod models;

pub use app::create_app;
pub use listeners::create_listener;

use crate::pipeline::{RemoveBgPipeline, UpscalePipeline};
use crate::weights::WeightStore;
use std::sync::Arc;

// Maximum allowed size for uploaded and fetched images
pub const MAX_IMAGE_SIZE_BYTES: usize = 100 * 1024 * 1024; // 100MB

#[derive(Clone)]
pub struct AppState {
    pub upscaler: Arc<UpscalePipeline>,
    pub remover: Arc<RemoveBgPipeline>,
    pub weights: Arc<WeightStore>,
    /// Client for fetching source images given by URL.
    pub http_client: reqwest::Client,
}
