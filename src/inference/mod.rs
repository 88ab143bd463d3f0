// Model objects used by the pipelines and the seams between them and the
// networks that do the actual work.
//
// Each model object (Upsampler, FaceEnhancer, BackgroundRemover) owns the
// image-side logic of its wrapper: padding, alpha handling, crops, masks.
// The networks behind them are trait objects so that ONNX sessions can be
// swapped for in-memory stand-ins.

mod background_remover;
mod face_enhancer;
mod onnx;
mod upsampler;

pub use background_remover::{BackgroundRemover, SegmentationNet};
pub use face_enhancer::{FaceBox, FaceDetector, FaceEnhancer, FaceRestorationNet};
pub use onnx::OnnxModelLoader;
pub use upsampler::{SuperResolutionNet, Upsampler};

use crate::error::InferenceError;
use crate::models::UpsamplerKey;

/// Builds model objects on cache misses. Implementations do the expensive
/// part (reading weights, creating sessions on the device) and are only
/// called from blocking contexts.
pub trait ModelLoader: Send + Sync {
    fn load_upsampler(&self, key: &UpsamplerKey) -> Result<Upsampler, InferenceError>;

    fn load_face_enhancer(&self, outscale: u32) -> Result<FaceEnhancer, InferenceError>;

    fn load_background_remover(&self) -> Result<BackgroundRemover, InferenceError>;

    /// Weight files the upscaling path needs for `key`, with or without
    /// face enhancement. Loaders that do not read weight files need none.
    fn upscale_weights(&self, _key: &UpsamplerKey, _face_enhance: bool) -> Vec<&'static str> {
        Vec::new()
    }

    fn remover_weights(&self) -> Vec<&'static str> {
        Vec::new()
    }
}
