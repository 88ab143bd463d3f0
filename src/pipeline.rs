// The two inference pipelines. Each one owns its model caches and runs
// strictly in sequence: decode, normalise channels, fetch model handles,
// infer, convert, encode. Everything here is blocking and is called from
// tokio's blocking pool.

use crate::error::InferenceError;
use crate::image_codec::{EncodedImage, OutputFormat, decode_input_image, encode_image};
use crate::inference::{BackgroundRemover, FaceEnhancer, ModelLoader, Upsampler};
use crate::model_cache::ModelCache;
use crate::models::{InferenceRequest, UpsamplerKey};
use image::DynamicImage;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub struct UpscalePipeline {
    loader: Arc<dyn ModelLoader>,
    upsamplers: ModelCache<UpsamplerKey, Upsampler>,
    // Keyed by outscale; the background upsampler is supplied per request.
    face_enhancers: ModelCache<u32, FaceEnhancer>,
}

impl UpscalePipeline {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            upsamplers: ModelCache::new("upsamplers"),
            face_enhancers: ModelCache::new("face enhancers"),
        }
    }

    /// Weight files `request` needs before it can run.
    pub fn required_weights(&self, request: &InferenceRequest) -> Vec<&'static str> {
        self.loader
            .upscale_weights(&request.upsampler_key(), request.face_enhance)
    }

    pub fn loaded_upsamplers(&self) -> Vec<UpsamplerKey> {
        self.upsamplers.loaded_keys()
    }

    pub fn run(
        &self,
        request: &InferenceRequest,
        format: OutputFormat,
    ) -> Result<EncodedImage, InferenceError> {
        let started = Instant::now();

        let decoded = decode_input_image(&request.image_bytes, request.content_type.as_deref())?;
        let had_alpha = decoded.color().has_alpha();
        let input = decoded.into_rgba8();
        debug!(
            "Decoded {}x{} input (alpha: {})",
            input.width(),
            input.height(),
            had_alpha
        );

        let key = request.upsampler_key();
        let upsampler = self
            .upsamplers
            .get_or_create(&key, || self.loader.load_upsampler(&key))?;

        let output = if request.face_enhance {
            let enhancer = self
                .face_enhancers
                .get_or_create(&request.outscale, || {
                    self.loader.load_face_enhancer(request.outscale)
                })?;
            enhancer.enhance(&input, &upsampler)?
        } else {
            upsampler.enhance(&input, request.outscale)?
        };

        let output = DynamicImage::ImageRgba8(output);
        let output = if had_alpha && format.supports_alpha() {
            output
        } else {
            DynamicImage::ImageRgb8(output.into_rgb8())
        };

        let encoded = encode_image(&output, format)?;
        debug!(
            "Upscaled to {}x{} in {:.2}s",
            encoded.width,
            encoded.height,
            started.elapsed().as_secs_f64()
        );
        Ok(encoded)
    }
}

pub struct RemoveBgPipeline {
    loader: Arc<dyn ModelLoader>,
    remover: ModelCache<(), BackgroundRemover>,
}

impl RemoveBgPipeline {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            remover: ModelCache::new("background remover"),
        }
    }

    pub fn required_weights(&self) -> Vec<&'static str> {
        self.loader.remover_weights()
    }

    /// Builds the remover ahead of the first request.
    pub fn preload(&self) -> Result<(), InferenceError> {
        self.handle().map(|_| ())
    }

    pub fn is_loaded(&self) -> bool {
        self.remover.get(&()).is_some()
    }

    fn handle(&self) -> Result<Arc<BackgroundRemover>, InferenceError> {
        self.remover
            .get_or_create(&(), || self.loader.load_background_remover())
    }

    pub fn run(
        &self,
        image_bytes: &[u8],
        content_type: Option<&str>,
        format: OutputFormat,
    ) -> Result<EncodedImage, InferenceError> {
        let started = Instant::now();

        let input = decode_input_image(image_bytes, content_type)?.into_rgb8();
        let remover = self.handle()?;
        let output = remover.remove(&input)?;

        let encoded = encode_image(&DynamicImage::ImageRgba8(output), format)?;
        debug!(
            "Removed background of {}x{} image in {:.2}s",
            encoded.width,
            encoded.height,
            started.elapsed().as_secs_f64()
        );
        Ok(encoded)
    }
}
