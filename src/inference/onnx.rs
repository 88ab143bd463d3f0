// ONNX Runtime backed networks and the loader that builds model objects
// from the weight directory.

use super::{
    BackgroundRemover, FaceBox, FaceDetector, FaceEnhancer, FaceRestorationNet, ModelLoader,
    SegmentationNet, SuperResolutionNet, Upsampler,
};
use crate::error::InferenceError;
use crate::models::{BIREFNET_WEIGHTS, FACE_DETECTOR_WEIGHTS, GFPGAN_WEIGHTS, UpsamplerKey};
use crate::weights::WeightStore;
use image::{
    RgbImage,
    imageops::{self, FilterType},
};
use ndarray::{Array2, Array4};
use ort::session::{Session, builder::GraphOptimizationLevel};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const FACE_RESTORER_INPUT_SIZE: u32 = 512;
const FACE_DETECTOR_INPUT_SIZE: u32 = 640;

fn model_load_error<E: fmt::Display>(path: &Path) -> impl Fn(E) -> InferenceError + '_ {
    move |e| InferenceError::ModelLoad(format!("{}: {}", path.display(), e))
}

fn inference_error<E: fmt::Display>(e: E) -> InferenceError {
    InferenceError::Inference(e.to_string())
}

#[derive(Debug, Clone, Copy)]
enum OutputSelect {
    First,
    Last,
}

/// How pixel values map to tensor values.
#[derive(Debug, Clone, Copy)]
enum PixelRange {
    /// 0..=255 -> 0.0..=1.0
    Unit,
    /// 0..=255 -> -1.0..=1.0
    Signed,
}

impl PixelRange {
    fn encode(self, value: u8) -> f32 {
        let unit = f32::from(value) / 255.0;
        match self {
            PixelRange::Unit => unit,
            PixelRange::Signed => unit * 2.0 - 1.0,
        }
    }

    fn decode(self, value: f32) -> u8 {
        let unit = match self {
            PixelRange::Unit => value,
            PixelRange::Signed => (value + 1.0) / 2.0,
        };
        (unit * 255.0).clamp(0.0, 255.0).round() as u8
    }
}

/// One ONNX Runtime session. `Session::run` needs exclusive access, so
/// concurrent callers of the same session take turns.
struct OnnxSession {
    session: Mutex<Session>,
    input_name: String,
}

impl OnnxSession {
    fn load(path: &Path) -> Result<Self, InferenceError> {
        let builder = Session::builder()
            .map_err(model_load_error(path))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(model_load_error(path))?;

        #[cfg(feature = "cuda")]
        let builder = builder
            .with_execution_providers([
                ort::execution_providers::CUDAExecutionProvider::default().build(),
            ])
            .map_err(model_load_error(path))?;

        let session = builder
            .commit_from_file(path)
            .map_err(model_load_error(path))?;

        let input_name = session
            .inputs
            .first()
            .map_or_else(|| "input".to_string(), |i| i.name.clone());
        debug!("Loaded {} (input '{}')", path.display(), input_name);

        Ok(Self {
            session: Mutex::new(session),
            input_name,
        })
    }

    /// Runs the session and copies the selected output out as (shape, data).
    fn run(
        &self,
        input: &Array4<f32>,
        select: OutputSelect,
    ) -> Result<(Vec<usize>, Vec<f32>), InferenceError> {
        let input = input.as_standard_layout().into_owned();
        let input_ref =
            ort::value::TensorRef::from_array_view(&input).map_err(inference_error)?;

        // A run that panicked leaves no partial state in the session.
        let mut session = self.session.lock().unwrap_or_else(|poisoned| {
            warn!("ONNX session lock was poisoned by a panicked run, reusing it");
            self.session.clear_poison();
            poisoned.into_inner()
        });
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => input_ref])
            .map_err(inference_error)?;

        let selected = match select {
            OutputSelect::First => outputs.iter().next(),
            OutputSelect::Last => outputs.iter().last(),
        };
        let (_, output) = selected
            .ok_or_else(|| InferenceError::Inference("Model produced no output".to_string()))?;

        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e: ort::Error| InferenceError::Inference(e.to_string()))?;

        let dims = shape
            .iter()
            .map(|&d| {
                usize::try_from(d).map_err(|_| {
                    InferenceError::Inference(format!("Invalid output dimension {}", d))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok((dims, data.to_vec()))
    }
}

fn image_to_tensor(image: &RgbImage, range: PixelRange) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        for (c, &value) in pixel.0.iter().enumerate() {
            tensor[[0, c, y as usize, x as usize]] = range.encode(value);
        }
    }
    tensor
}

fn tensor_to_image(
    shape: &[usize],
    data: &[f32],
    range: PixelRange,
) -> Result<RgbImage, InferenceError> {
    let &[1, 3, height, width] = shape else {
        return Err(InferenceError::Inference(format!(
            "Expected a [1, 3, H, W] output, got {:?}",
            shape
        )));
    };
    let plane = height * width;
    if data.len() != 3 * plane {
        return Err(InferenceError::Inference(format!(
            "Output has {} values for shape {:?}",
            data.len(),
            shape
        )));
    }

    let mut pixels = Vec::with_capacity(3 * plane);
    for idx in 0..plane {
        for c in 0..3 {
            pixels.push(range.decode(data[c * plane + idx]));
        }
    }

    let (width, height) = (
        u32::try_from(width).map_err(|_| InferenceError::Inference("Output too wide".to_string()))?,
        u32::try_from(height).map_err(|_| InferenceError::Inference("Output too tall".to_string()))?,
    );
    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| InferenceError::Inference("Failed to create image".to_string()))
}

/// Real-ESRGAN network: RGB in [0, 1], NCHW, output `scale` times larger.
struct OnnxSuperResolution {
    session: OnnxSession,
    scale: u32,
}

impl SuperResolutionNet for OnnxSuperResolution {
    fn scale(&self) -> u32 {
        self.scale
    }

    fn forward(&self, input: &RgbImage) -> Result<RgbImage, InferenceError> {
        let tensor = image_to_tensor(input, PixelRange::Unit);
        let (shape, data) = self.session.run(&tensor, OutputSelect::First)?;
        tensor_to_image(&shape, &data, PixelRange::Unit)
    }
}

/// BiRefNet: the last output holds the finest mask logits.
struct OnnxSegmentation {
    session: OnnxSession,
}

impl SegmentationNet for OnnxSegmentation {
    fn forward(&self, input: &Array4<f32>) -> Result<Array2<f32>, InferenceError> {
        let (shape, data) = self.session.run(input, OutputSelect::Last)?;
        let (height, width) = match shape.as_slice() {
            [.., h, w] if h * w == data.len() => (*h, *w),
            _ => {
                return Err(InferenceError::Inference(format!(
                    "Unexpected mask shape {:?}",
                    shape
                )));
            }
        };
        Array2::from_shape_vec((height, width), data)
            .map_err(|e| InferenceError::Inference(e.to_string()))
    }
}

/// GFPGAN: RGB in [-1, 1], 512x512 in and out.
struct OnnxFaceRestoration {
    session: OnnxSession,
}

impl FaceRestorationNet for OnnxFaceRestoration {
    fn input_size(&self) -> u32 {
        FACE_RESTORER_INPUT_SIZE
    }

    fn forward(&self, face: &RgbImage) -> Result<RgbImage, InferenceError> {
        let tensor = image_to_tensor(face, PixelRange::Signed);
        let (shape, data) = self.session.run(&tensor, OutputSelect::First)?;
        tensor_to_image(&shape, &data, PixelRange::Signed)
    }
}

/// Face detector exported with its post-processing: takes RGB in [0, 1] at
/// 640x640 and returns rows of (x1, y1, x2, y2, score) in input pixels.
struct OnnxFaceDetector {
    session: OnnxSession,
}

impl FaceDetector for OnnxFaceDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<FaceBox>, InferenceError> {
        let size = FACE_DETECTOR_INPUT_SIZE;
        let resized = imageops::resize(image, size, size, FilterType::Triangle);
        let tensor = image_to_tensor(&resized, PixelRange::Unit);
        let (shape, data) = self.session.run(&tensor, OutputSelect::First)?;

        if shape.last() != Some(&5) {
            return Err(InferenceError::Inference(format!(
                "Unexpected detection shape {:?}",
                shape
            )));
        }

        let scale_x = image.width() as f32 / size as f32;
        let scale_y = image.height() as f32 / size as f32;
        Ok(parse_detections(&data, scale_x, scale_y))
    }
}

fn parse_detections(data: &[f32], scale_x: f32, scale_y: f32) -> Vec<FaceBox> {
    data.chunks_exact(5)
        .map(|row| FaceBox {
            x1: row[0] * scale_x,
            y1: row[1] * scale_y,
            x2: row[2] * scale_x,
            y2: row[3] * scale_y,
            score: row[4],
        })
        .collect()
}

/// Builds model objects from ONNX files in the weight store.
pub struct OnnxModelLoader {
    weights: Arc<WeightStore>,
}

impl OnnxModelLoader {
    pub fn new(weights: Arc<WeightStore>) -> Self {
        Self { weights }
    }

    fn session(&self, file: &str) -> Result<OnnxSession, InferenceError> {
        let path = self.weights.resolve(file)?;
        info!("Creating ONNX session for {}", file);
        OnnxSession::load(&path)
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load_upsampler(&self, key: &UpsamplerKey) -> Result<Upsampler, InferenceError> {
        let model = key.model;
        let primary = OnnxSuperResolution {
            session: self.session(model.weight_file())?,
            scale: model.net_scale(),
        };

        let denoise = key.denoise_strength();
        match model.denoise_weight_file() {
            Some(wdn_file) if denoise != 1.0 => {
                let wdn = OnnxSuperResolution {
                    session: self.session(wdn_file)?,
                    scale: model.net_scale(),
                };
                Upsampler::interpolated(Box::new(primary), Box::new(wdn), [denoise, 1.0 - denoise])
            }
            _ => Ok(Upsampler::new(Box::new(primary))),
        }
    }

    fn load_face_enhancer(&self, outscale: u32) -> Result<FaceEnhancer, InferenceError> {
        let detector = OnnxFaceDetector {
            session: self.session(FACE_DETECTOR_WEIGHTS)?,
        };
        let restorer = OnnxFaceRestoration {
            session: self.session(GFPGAN_WEIGHTS)?,
        };
        Ok(FaceEnhancer::new(
            Box::new(detector),
            Box::new(restorer),
            outscale,
        ))
    }

    fn load_background_remover(&self) -> Result<BackgroundRemover, InferenceError> {
        let net = OnnxSegmentation {
            session: self.session(BIREFNET_WEIGHTS)?,
        };
        Ok(BackgroundRemover::new(Box::new(net)))
    }

    fn upscale_weights(&self, key: &UpsamplerKey, face_enhance: bool) -> Vec<&'static str> {
        let mut files = key.model.weight_files(key.denoise_strength());
        if face_enhance {
            files.extend([FACE_DETECTOR_WEIGHTS, GFPGAN_WEIGHTS]);
        }
        files
    }

    fn remover_weights(&self) -> Vec<&'static str> {
        vec![BIREFNET_WEIGHTS]
    }
}
