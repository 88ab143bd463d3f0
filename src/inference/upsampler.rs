// Real-ESRGAN style upsampler: runs a fixed-scale super-resolution network
// over the colour planes of an RGBA image and brings the result to the
// requested output scale.

use crate::error::InferenceError;
use image::{
    GrayImage, Luma, RgbImage, Rgba, RgbaImage,
    imageops::{self, FilterType},
};
use tracing::debug;

/// Reflect padding added to the right and bottom edges before inference.
/// It keeps border artefacts of the network out of the cropped result.
pub const DEFAULT_PRE_PAD: u32 = 10;

/// A super-resolution network with a fixed integer scale.
/// Input and output are RGB; the output is `scale` times the input size.
pub trait SuperResolutionNet: Send + Sync {
    fn scale(&self) -> u32;

    fn forward(&self, input: &RgbImage) -> Result<RgbImage, InferenceError>;
}

pub struct Upsampler {
    // Networks and their interpolation weights. More than one entry means
    // the outputs are blended (denoise strength).
    nets: Vec<(Box<dyn SuperResolutionNet>, f32)>,
    scale: u32,
    pre_pad: u32,
}

impl Upsampler {
    pub fn new(net: Box<dyn SuperResolutionNet>) -> Self {
        let scale = net.scale();
        Self {
            nets: vec![(net, 1.0)],
            scale,
            pre_pad: DEFAULT_PRE_PAD,
        }
    }

    /// Upsampler whose output is `weights[0] * first + weights[1] * second`.
    pub fn interpolated(
        first: Box<dyn SuperResolutionNet>,
        second: Box<dyn SuperResolutionNet>,
        weights: [f32; 2],
    ) -> Result<Self, InferenceError> {
        if first.scale() != second.scale() {
            return Err(InferenceError::ModelLoad(format!(
                "Cannot interpolate networks of scale {} and {}",
                first.scale(),
                second.scale()
            )));
        }

        let scale = first.scale();
        Ok(Self {
            nets: vec![(first, weights[0]), (second, weights[1])],
            scale,
            pre_pad: DEFAULT_PRE_PAD,
        })
    }

    /// Enlarges `image` to exactly `outscale` times its size.
    ///
    /// The network sees the RGB planes only; a non-opaque alpha plane is
    /// resized separately and merged back afterwards.
    pub fn enhance(&self, image: &RgbaImage, outscale: u32) -> Result<RgbaImage, InferenceError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(InferenceError::Inference("Image has no pixels".to_string()));
        }
        if outscale == 0 {
            return Err(InferenceError::InvalidParameter(
                "Scale must be at least 1".to_string(),
            ));
        }

        let (rgb, alpha) = split_alpha(image);

        let pad_right = self.pre_pad + self.mod_pad(width + self.pre_pad);
        let pad_bottom = self.pre_pad + self.mod_pad(height + self.pre_pad);
        let padded = reflect_pad(&rgb, pad_right, pad_bottom);

        let output = self.forward(&padded)?;
        let expected = (padded.width() * self.scale, padded.height() * self.scale);
        if output.dimensions() != expected {
            return Err(InferenceError::Inference(format!(
                "Network returned {}x{}, expected {}x{}",
                output.width(),
                output.height(),
                expected.0,
                expected.1
            )));
        }

        let (net_width, net_height) = (width * self.scale, height * self.scale);
        let rgb_out = imageops::crop_imm(&output, 0, 0, net_width, net_height).to_image();
        let alpha_out =
            alpha.map(|a| imageops::resize(&a, net_width, net_height, FilterType::Lanczos3));
        let mut result = merge_alpha(&rgb_out, alpha_out.as_ref());

        if outscale != self.scale {
            debug!(
                "Resizing network output {}x{} to {}x{}",
                net_width,
                net_height,
                width * outscale,
                height * outscale
            );
            result = imageops::resize(
                &result,
                width * outscale,
                height * outscale,
                FilterType::Lanczos3,
            );
        }

        Ok(result)
    }

    // Extra padding so the padded size is a multiple of what the network's
    // pixel-unshuffle stage expects (scale 2 -> multiple of 2, scale 1 -> 4).
    fn mod_pad(&self, len: u32) -> u32 {
        let modulus = match self.scale {
            1 => 4,
            2 => 2,
            _ => return 0,
        };
        (modulus - len % modulus) % modulus
    }

    fn forward(&self, input: &RgbImage) -> Result<RgbImage, InferenceError> {
        let mut nets = self.nets.iter();
        let Some((first, first_weight)) = nets.next() else {
            return Err(InferenceError::Internal(
                "Upsampler has no network".to_string(),
            ));
        };

        let first_out = first.forward(input)?;
        if self.nets.len() == 1 {
            return Ok(first_out);
        }

        let dimensions = first_out.dimensions();
        let mut blended: Vec<f32> = first_out
            .as_raw()
            .iter()
            .map(|&v| f32::from(v) * first_weight)
            .collect();

        for (net, weight) in nets {
            let out = net.forward(input)?;
            if out.dimensions() != dimensions {
                return Err(InferenceError::Inference(format!(
                    "Interpolated networks disagree on output size: {:?} vs {:?}",
                    dimensions,
                    out.dimensions()
                )));
            }
            for (acc, &v) in blended.iter_mut().zip(out.as_raw().iter()) {
                *acc += f32::from(v) * weight;
            }
        }

        let pixels = blended
            .into_iter()
            .map(|v| v.round().clamp(0.0, 255.0) as u8)
            .collect();
        RgbImage::from_raw(dimensions.0, dimensions.1, pixels).ok_or_else(|| {
            InferenceError::Internal("Blended buffer has the wrong size".to_string())
        })
    }
}

// Splits RGBA into RGB and alpha; the alpha plane is dropped when fully opaque.
fn split_alpha(image: &RgbaImage) -> (RgbImage, Option<GrayImage>) {
    let (width, height) = image.dimensions();
    let rgb = RgbImage::from_fn(width, height, |x, y| {
        let [r, g, b, _] = image.get_pixel(x, y).0;
        image::Rgb([r, g, b])
    });

    let opaque = image.pixels().all(|p| p.0[3] == u8::MAX);
    let alpha = (!opaque).then(|| GrayImage::from_fn(width, height, |x, y| Luma([image.get_pixel(x, y).0[3]])));

    (rgb, alpha)
}

fn merge_alpha(rgb: &RgbImage, alpha: Option<&GrayImage>) -> RgbaImage {
    RgbaImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let a = alpha.map_or(u8::MAX, |plane| plane.get_pixel(x, y).0[0]);
        Rgba([r, g, b, a])
    })
}

fn reflect_pad(image: &RgbImage, right: u32, bottom: u32) -> RgbImage {
    if right == 0 && bottom == 0 {
        return image.clone();
    }
    let (width, height) = image.dimensions();
    RgbImage::from_fn(width + right, height + bottom, |x, y| {
        *image.get_pixel(reflect_index(x, width), reflect_index(y, height))
    })
}

// Mirror index without repeating the edge pixel: for len 3, 0 1 2 1 0 1 2 ...
fn reflect_index(i: u32, len: u32) -> u32 {
    if len <= 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let m = i % period;
    if m < len { m } else { period - m }
}
