// GFPGAN style face enhancement: the whole frame is enlarged by a background
// upsampler, then every detected face is cropped from the input, restored by
// the face network and blended back over the enlarged frame.

use super::upsampler::Upsampler;
use crate::error::InferenceError;
use image::{
    DynamicImage, Rgb, RgbImage, RgbaImage,
    imageops::{self, FilterType},
};
use tracing::debug;

/// Detections below this confidence are ignored.
pub const FACE_SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU_THRESHOLD: f32 = 0.4;
/// Context kept around a face box, relative to its longer side.
const FACE_MARGIN: f32 = 0.2;
/// Faces smaller than this (in input pixels) are left to the background upsampler.
const MIN_FACE_SIZE: u32 = 4;

/// A face detection in input pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
}

impl FaceBox {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &FaceBox) -> f32 {
        let ix = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let iy = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let intersection = ix * iy;
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 { 0.0 } else { intersection / union }
    }
}

pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<FaceBox>, InferenceError>;
}

/// Restores a square face crop of `input_size` pixels and returns an image
/// of the same size.
pub trait FaceRestorationNet: Send + Sync {
    fn input_size(&self) -> u32 {
        512
    }

    fn forward(&self, face: &RgbImage) -> Result<RgbImage, InferenceError>;
}

pub struct FaceEnhancer {
    detector: Box<dyn FaceDetector>,
    restorer: Box<dyn FaceRestorationNet>,
    upscale: u32,
}

impl FaceEnhancer {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        restorer: Box<dyn FaceRestorationNet>,
        upscale: u32,
    ) -> Self {
        Self {
            detector,
            restorer,
            upscale,
        }
    }

    /// Enlarges `image` by the enhancer's upscale factor using `bg_upsampler`
    /// for the frame and the restoration network for the faces.
    ///
    /// The background upsampler is passed per call, so one enhancer serves
    /// every model at its upscale factor.
    pub fn enhance(
        &self,
        image: &RgbaImage,
        bg_upsampler: &Upsampler,
    ) -> Result<RgbaImage, InferenceError> {
        let mut output = bg_upsampler.enhance(image, self.upscale)?;

        let rgb = DynamicImage::ImageRgba8(image.clone()).into_rgb8();
        let (width, height) = rgb.dimensions();
        let faces = self.detect_faces(&rgb)?;
        debug!("Detected {} face(s) in {}x{} image", faces.len(), width, height);

        let net_size = self.restorer.input_size();
        for face in &faces {
            let Some(region) = square_region(face, width, height) else {
                continue;
            };

            let crop = imageops::crop_imm(&rgb, region.x, region.y, region.size, region.size)
                .to_image();
            let net_input = imageops::resize(&crop, net_size, net_size, FilterType::Triangle);
            let restored = self.restorer.forward(&net_input)?;

            let target = region.size * self.upscale;
            let restored = imageops::resize(&restored, target, target, FilterType::Lanczos3);
            paste_feathered(
                &mut output,
                &restored,
                region.x * self.upscale,
                region.y * self.upscale,
            );
        }

        Ok(output)
    }

    fn detect_faces(&self, image: &RgbImage) -> Result<Vec<FaceBox>, InferenceError> {
        let candidates: Vec<FaceBox> = self
            .detector
            .detect(image)?
            .into_iter()
            .filter(|face| face.score >= FACE_SCORE_THRESHOLD)
            .collect();
        Ok(non_max_suppression(candidates, NMS_IOU_THRESHOLD))
    }
}

fn non_max_suppression(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<FaceBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[derive(Debug, PartialEq, Eq)]
struct Region {
    x: u32,
    y: u32,
    size: u32,
}

// Square crop centred on the face, grown by the margin and kept inside the image.
fn square_region(face: &FaceBox, width: u32, height: u32) -> Option<Region> {
    let box_w = face.x2 - face.x1;
    let box_h = face.y2 - face.y1;
    if !(box_w > 0.0 && box_h > 0.0) {
        return None;
    }

    let side = (box_w.max(box_h) * (1.0 + FACE_MARGIN)).round() as u32;
    let side = side.min(width).min(height);
    if side < MIN_FACE_SIZE {
        return None;
    }

    let cx = (face.x1 + face.x2) / 2.0;
    let cy = (face.y1 + face.y2) / 2.0;
    let half = side as f32 / 2.0;
    let x = (cx - half).round().clamp(0.0, (width - side) as f32) as u32;
    let y = (cy - half).round().clamp(0.0, (height - side) as f32) as u32;

    Some(Region { x, y, size: side })
}

// Blends `patch` over `dst` at (x0, y0) with a linear ramp towards the patch
// border. Destination alpha is kept.
fn paste_feathered(dst: &mut RgbaImage, patch: &RgbImage, x0: u32, y0: u32) {
    let (pw, ph) = patch.dimensions();
    let feather = (pw.min(ph) / 10).max(1);

    for (px, py, pixel) in patch.enumerate_pixels() {
        let (x, y) = (x0 + px, y0 + py);
        if x >= dst.width() || y >= dst.height() {
            continue;
        }

        let edge_distance = px.min(py).min(pw - 1 - px).min(ph - 1 - py);
        let weight = ((edge_distance + 1) as f32 / feather as f32).min(1.0);
        let Rgb(src) = *pixel;
        let target = dst.get_pixel_mut(x, y);
        for c in 0..3 {
            let blended = f32::from(src[c]) * weight + f32::from(target.0[c]) * (1.0 - weight);
            target.0[c] = blended.round().clamp(0.0, 255.0) as u8;
        }
    }
}
