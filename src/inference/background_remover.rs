// BiRefNet background removal: predicts a foreground mask at the network's
// fixed resolution and attaches it to the original image as alpha.

use crate::error::InferenceError;
use image::{
    GrayImage, Luma, RgbImage, Rgba, RgbaImage,
    imageops::{self, FilterType},
};
use ndarray::{Array2, Array4};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// A dichotomous segmentation network.
pub trait SegmentationNet: Send + Sync {
    /// Width and height the network expects.
    fn input_size(&self) -> (u32, u32) {
        (1024, 1024)
    }

    /// Takes a normalised NCHW batch of one and returns the mask logits
    /// as a (height, width) array.
    fn forward(&self, input: &Array4<f32>) -> Result<Array2<f32>, InferenceError>;
}

pub struct BackgroundRemover {
    net: Box<dyn SegmentationNet>,
}

impl BackgroundRemover {
    pub fn new(net: Box<dyn SegmentationNet>) -> Self {
        Self { net }
    }

    /// Returns `image` with the predicted foreground mask as its alpha channel.
    /// The output has the same dimensions as the input.
    pub fn remove(&self, image: &RgbImage) -> Result<RgbaImage, InferenceError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(InferenceError::Inference("Image has no pixels".to_string()));
        }

        let input = preprocess(image, self.net.input_size());
        let logits = self.net.forward(&input)?;
        let mask = mask_from_logits(&logits)?;
        Ok(attach_alpha(image, &mask))
    }
}

fn preprocess(image: &RgbImage, (width, height): (u32, u32)) -> Array4<f32> {
    let resized = imageops::resize(image, width, height, FilterType::Triangle);
    Array4::from_shape_fn(
        (1, 3, height as usize, width as usize),
        |(_, c, y, x)| {
            let value = f32::from(resized.get_pixel(x as u32, y as u32).0[c]) / 255.0;
            (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c]
        },
    )
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn mask_from_logits(logits: &Array2<f32>) -> Result<GrayImage, InferenceError> {
    let (height, width) = logits.dim();
    if height == 0 || width == 0 {
        return Err(InferenceError::Inference(
            "Segmentation network returned an empty mask".to_string(),
        ));
    }

    Ok(GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let p = sigmoid(logits[[y as usize, x as usize]]);
        Luma([(p * 255.0) as u8])
    }))
}

fn attach_alpha(image: &RgbImage, mask: &GrayImage) -> RgbaImage {
    let (width, height) = image.dimensions();
    let mask = if mask.dimensions() == (width, height) {
        mask.clone()
    } else {
        imageops::resize(mask, width, height, FilterType::CatmullRom)
    };

    RgbaImage::from_fn(width, height, |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        Rgba([r, g, b, mask.get_pixel(x, y).0[0]])
    })
}
