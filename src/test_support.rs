// Shared helpers for unit tests: a throwaway HTTP server, small encoded
// images, and in-memory stand-ins for the ONNX networks.

use crate::error::InferenceError;
use crate::inference::{
    BackgroundRemover, FaceBox, FaceDetector, FaceEnhancer, FaceRestorationNet, ModelLoader,
    SegmentationNet, SuperResolutionNet, Upsampler,
};
use crate::models::UpsamplerKey;
use axum::Router;
use image::{DynamicImage, ImageFormat, RgbImage, imageops};
use ndarray::{Array2, Array4};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Serves `router` on an ephemeral localhost port.
pub async fn spawn_server(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// A gradient image encoded in `format`.
pub fn encoded_image(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 20 % 256) as u8, (y * 20 % 256) as u8, 128])
    });
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buffer, format)
        .unwrap();
    buffer.into_inner()
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    encoded_image(width, height, ImageFormat::Png)
}

/// Nearest-neighbour enlargement standing in for a super-resolution network.
pub struct NearestNet {
    pub scale: u32,
    pub tint: Option<[u8; 3]>,
}

impl NearestNet {
    pub fn new(scale: u32) -> Self {
        Self { scale, tint: None }
    }

    /// Produces a solid colour instead of the enlarged input, so blends
    /// between two nets are observable.
    pub fn solid(scale: u32, color: [u8; 3]) -> Self {
        Self {
            scale,
            tint: Some(color),
        }
    }
}

impl SuperResolutionNet for NearestNet {
    fn scale(&self) -> u32 {
        self.scale
    }

    fn forward(&self, input: &RgbImage) -> Result<RgbImage, InferenceError> {
        let (w, h) = input.dimensions();
        Ok(match self.tint {
            Some(color) => RgbImage::from_pixel(w * self.scale, h * self.scale, image::Rgb(color)),
            None => imageops::resize(
                input,
                w * self.scale,
                h * self.scale,
                imageops::FilterType::Nearest,
            ),
        })
    }
}

/// Segmentation stand-in: foreground on the left half, background on the right.
pub struct HalfMaskNet {
    pub size: u32,
}

impl SegmentationNet for HalfMaskNet {
    fn input_size(&self) -> (u32, u32) {
        (self.size, self.size)
    }

    fn forward(&self, input: &Array4<f32>) -> Result<Array2<f32>, InferenceError> {
        let shape = input.shape();
        assert_eq!(shape, &[1, 3, self.size as usize, self.size as usize]);
        let half = self.size as usize / 2;
        Ok(Array2::from_shape_fn(
            (self.size as usize, self.size as usize),
            |(_, x)| if x < half { 12.0 } else { -12.0 },
        ))
    }
}

/// Detector returning a fixed set of boxes.
pub struct FixedFaces(pub Vec<FaceBox>);

impl FaceDetector for FixedFaces {
    fn detect(&self, _image: &RgbImage) -> Result<Vec<FaceBox>, InferenceError> {
        Ok(self.0.clone())
    }
}

/// Restoration stand-in that paints every face a single colour.
pub struct PaintFace(pub [u8; 3]);

impl FaceRestorationNet for PaintFace {
    fn input_size(&self) -> u32 {
        32
    }

    fn forward(&self, face: &RgbImage) -> Result<RgbImage, InferenceError> {
        Ok(RgbImage::from_pixel(
            face.width(),
            face.height(),
            image::Rgb(self.0),
        ))
    }
}

/// Model loader backed by the stand-in networks, counting how often each
/// kind of model gets built.
#[derive(Default)]
pub struct CountingLoader {
    pub upsamplers: AtomicUsize,
    pub face_enhancers: AtomicUsize,
    pub removers: AtomicUsize,
    pub load_delay: Option<Duration>,
}

impl CountingLoader {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            load_delay: Some(delay),
            ..Self::default()
        }
    }

    fn pause(&self) {
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
    }

    pub fn upsampler_loads(&self) -> usize {
        self.upsamplers.load(Ordering::SeqCst)
    }
}

impl ModelLoader for CountingLoader {
    fn load_upsampler(&self, key: &UpsamplerKey) -> Result<Upsampler, InferenceError> {
        self.upsamplers.fetch_add(1, Ordering::SeqCst);
        self.pause();
        Ok(Upsampler::new(Box::new(NearestNet::new(key.model.net_scale()))))
    }

    fn load_face_enhancer(&self, outscale: u32) -> Result<FaceEnhancer, InferenceError> {
        self.face_enhancers.fetch_add(1, Ordering::SeqCst);
        self.pause();
        Ok(FaceEnhancer::new(
            Box::new(FixedFaces(vec![FaceBox {
                x1: 2.0,
                y1: 2.0,
                x2: 6.0,
                y2: 6.0,
                score: 0.9,
            }])),
            Box::new(PaintFace([255, 0, 0])),
            outscale,
        ))
    }

    fn load_background_remover(&self) -> Result<BackgroundRemover, InferenceError> {
        self.removers.fetch_add(1, Ordering::SeqCst);
        self.pause();
        Ok(BackgroundRemover::new(Box::new(HalfMaskNet { size: 16 })))
    }
}
