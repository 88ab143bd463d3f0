// Domain types shared by the pipelines and the HTTP layer: the supported
// upscaler models with their weight files, cache keys, and the validated
// upscaling request.

use crate::error::InferenceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_MODEL: UpscalerModel = UpscalerModel::RealEsrganX4plusAnime6B;
pub const DEFAULT_DENOISE_STRENGTH: f32 = 0.5;
pub const DEFAULT_OUTSCALE: u32 = 4;
pub const MIN_OUTSCALE: u32 = 1;
pub const MAX_OUTSCALE: u32 = 6;

pub const GFPGAN_WEIGHTS: &str = "GFPGANv1.3.onnx";
pub const FACE_DETECTOR_WEIGHTS: &str = "face_detector.onnx";
pub const BIREFNET_WEIGHTS: &str = "BiRefNet.onnx";

/// Upscaling networks the service can load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpscalerModel {
    #[serde(rename = "RealESRGAN_x4plus")]
    RealEsrganX4plus,
    #[serde(rename = "RealESRNet_x4plus")]
    RealEsrnetX4plus,
    #[serde(rename = "RealESRGAN_x4plus_anime_6B")]
    RealEsrganX4plusAnime6B,
    #[serde(rename = "RealESRGAN_x2plus")]
    RealEsrganX2plus,
    #[serde(rename = "realesr-general-x4v3")]
    RealEsrGeneralX4v3,
}

impl UpscalerModel {
    pub const ALL: [UpscalerModel; 5] = [
        UpscalerModel::RealEsrganX4plus,
        UpscalerModel::RealEsrnetX4plus,
        UpscalerModel::RealEsrganX4plusAnime6B,
        UpscalerModel::RealEsrganX2plus,
        UpscalerModel::RealEsrGeneralX4v3,
    ];

    pub fn name(self) -> &'static str {
        match self {
            UpscalerModel::RealEsrganX4plus => "RealESRGAN_x4plus",
            UpscalerModel::RealEsrnetX4plus => "RealESRNet_x4plus",
            UpscalerModel::RealEsrganX4plusAnime6B => "RealESRGAN_x4plus_anime_6B",
            UpscalerModel::RealEsrganX2plus => "RealESRGAN_x2plus",
            UpscalerModel::RealEsrGeneralX4v3 => "realesr-general-x4v3",
        }
    }

    /// Native upscale factor of the network.
    pub fn net_scale(self) -> u32 {
        match self {
            UpscalerModel::RealEsrganX2plus => 2,
            _ => 4,
        }
    }

    /// Main weight file of the network.
    pub fn weight_file(self) -> &'static str {
        match self {
            UpscalerModel::RealEsrganX4plus => "RealESRGAN_x4plus.onnx",
            UpscalerModel::RealEsrnetX4plus => "RealESRNet_x4plus.onnx",
            UpscalerModel::RealEsrganX4plusAnime6B => "RealESRGAN_x4plus_anime_6B.onnx",
            UpscalerModel::RealEsrganX2plus => "RealESRGAN_x2plus.onnx",
            UpscalerModel::RealEsrGeneralX4v3 => "realesr-general-x4v3.onnx",
        }
    }

    /// Weight file of the denoising variant, blended with the main weights
    /// according to the denoise strength.
    pub fn denoise_weight_file(self) -> Option<&'static str> {
        match self {
            UpscalerModel::RealEsrGeneralX4v3 => Some("realesr-general-wdn-x4v3.onnx"),
            _ => None,
        }
    }

    /// Weight files needed to build an upsampler with the given denoise strength.
    pub fn weight_files(self, denoise_strength: f32) -> Vec<&'static str> {
        let mut files = vec![self.weight_file()];
        if let Some(wdn) = self.denoise_weight_file() {
            if denoise_strength != 1.0 {
                files.push(wdn);
            }
        }
        files
    }
}

impl fmt::Display for UpscalerModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for UpscalerModel {
    type Err = InferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UpscalerModel::ALL
            .into_iter()
            .find(|model| model.name() == s.trim())
            .ok_or_else(|| InferenceError::UnsupportedModel(s.to_string()))
    }
}

/// Every weight file the service may need, for bootstrapping the weight directory.
pub fn all_weight_files() -> Vec<&'static str> {
    let mut files: Vec<&'static str> = UpscalerModel::ALL
        .into_iter()
        .flat_map(|model| model.weight_files(0.0))
        .collect();
    files.extend([GFPGAN_WEIGHTS, FACE_DETECTOR_WEIGHTS, BIREFNET_WEIGHTS]);
    files
}

/// Denoise strengths are keyed on a grid of this step, so the number of
/// upsamplers one model can pin stays small.
pub const DENOISE_STEP: f32 = 0.05;

/// Cache key of an upsampler: the model and the denoise strength it was
/// built with. The strength is kept as raw bits so the key can be hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpsamplerKey {
    pub model: UpscalerModel,
    denoise_bits: u32,
}

impl UpsamplerKey {
    /// Models without denoise weights ignore the strength and always get
    /// `1.0`. Other strengths are snapped to the nearest `DENOISE_STEP`.
    pub fn new(model: UpscalerModel, denoise_strength: f32) -> Self {
        let strength = if model.denoise_weight_file().is_none() {
            1.0
        } else {
            let steps = (1.0 / DENOISE_STEP).round();
            ((denoise_strength * steps).round() / steps).clamp(0.0, 1.0)
        };
        // -0.0 and 0.0 must land on the same entry
        let normalized = if strength == 0.0 { 0.0 } else { strength };
        Self {
            model,
            denoise_bits: normalized.to_bits(),
        }
    }

    pub fn denoise_strength(&self) -> f32 {
        f32::from_bits(self.denoise_bits)
    }
}

/// A validated upscaling request.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub image_bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub model: UpscalerModel,
    pub denoise_strength: f32,
    pub face_enhance: bool,
    pub outscale: u32,
}

impl InferenceRequest {
    pub fn upsampler_key(&self) -> UpsamplerKey {
        UpsamplerKey::new(self.model, self.denoise_strength)
    }
}

pub fn validate_outscale(outscale: u32) -> Result<u32, InferenceError> {
    if (MIN_OUTSCALE..=MAX_OUTSCALE).contains(&outscale) {
        Ok(outscale)
    } else {
        Err(InferenceError::InvalidParameter(format!(
            "Scale must be between {} and {}, got {}",
            MIN_OUTSCALE, MAX_OUTSCALE, outscale
        )))
    }
}

pub fn validate_denoise_strength(strength: f32) -> Result<f32, InferenceError> {
    if strength.is_finite() && (0.0..=1.0).contains(&strength) {
        Ok(strength)
    } else {
        Err(InferenceError::InvalidParameter(format!(
            "Denoise strength must be between 0 and 1, got {}",
            strength
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_names_round_trip_through_from_str() {
        for model in UpscalerModel::ALL {
            assert_eq!(model.name().parse::<UpscalerModel>().unwrap(), model);
            assert_eq!(model.to_string(), model.name());
        }
    }

    #[test]
    fn unknown_model_is_rejected() {
        let err = "RealESRGAN_x8plus".parse::<UpscalerModel>().unwrap_err();
        assert!(matches!(err, InferenceError::UnsupportedModel(name) if name == "RealESRGAN_x8plus"));
    }

    #[test]
    fn serde_uses_upstream_model_names() {
        let json = serde_json::to_string(&UpscalerModel::RealEsrGeneralX4v3).unwrap();
        assert_eq!(json, "\"realesr-general-x4v3\"");
        let model: UpscalerModel = serde_json::from_str("\"RealESRGAN_x2plus\"").unwrap();
        assert_eq!(model, UpscalerModel::RealEsrganX2plus);
    }

    #[test]
    fn only_x2plus_has_scale_two() {
        assert_eq!(UpscalerModel::RealEsrganX2plus.net_scale(), 2);
        assert_eq!(UpscalerModel::RealEsrganX4plusAnime6B.net_scale(), 4);
    }

    #[test]
    fn general_model_needs_denoise_weights_unless_strength_is_one() {
        let model = UpscalerModel::RealEsrGeneralX4v3;
        assert_eq!(
            model.weight_files(0.5),
            vec!["realesr-general-x4v3.onnx", "realesr-general-wdn-x4v3.onnx"]
        );
        assert_eq!(model.weight_files(1.0), vec!["realesr-general-x4v3.onnx"]);
        assert_eq!(
            UpscalerModel::RealEsrganX4plus.weight_files(0.5),
            vec!["RealESRGAN_x4plus.onnx"]
        );
    }

    #[test]
    fn all_weight_files_are_unique() {
        let files = all_weight_files();
        let mut deduped = files.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(files.len(), deduped.len());
        assert_eq!(files.len(), 9);
    }

    #[test]
    fn key_treats_signed_zero_as_equal() {
        let a = UpsamplerKey::new(UpscalerModel::RealEsrGeneralX4v3, 0.0);
        let b = UpsamplerKey::new(UpscalerModel::RealEsrGeneralX4v3, -0.0);
        assert_eq!(a, b);
        assert_eq!(a.denoise_strength(), 0.0);
    }

    #[test]
    fn key_ignores_strength_for_models_without_denoise_weights() {
        for strength in [0.0, 0.013, 0.5, 0.999, 1.0] {
            let key = UpsamplerKey::new(UpscalerModel::RealEsrganX4plus, strength);
            assert_eq!(key, UpsamplerKey::new(UpscalerModel::RealEsrganX4plus, 0.5));
            assert_eq!(key.denoise_strength(), 1.0);
        }
    }

    #[test]
    fn key_snaps_general_strengths_to_grid() {
        let model = UpscalerModel::RealEsrGeneralX4v3;
        assert_eq!(UpsamplerKey::new(model, 0.26), UpsamplerKey::new(model, 0.25));
        assert_eq!(UpsamplerKey::new(model, 0.74).denoise_strength(), 0.75);
        assert_eq!(UpsamplerKey::new(model, 0.01).denoise_strength(), 0.0);
        assert_eq!(UpsamplerKey::new(model, 0.99).denoise_strength(), 1.0);

        let keys: std::collections::HashSet<_> = (0..=1000)
            .map(|i| UpsamplerKey::new(model, i as f32 / 1000.0))
            .collect();
        assert_eq!(keys.len(), 21);
    }

    #[test]
    fn key_distinguishes_strengths_and_models() {
        let a = UpsamplerKey::new(UpscalerModel::RealEsrGeneralX4v3, 0.5);
        let b = UpsamplerKey::new(UpscalerModel::RealEsrGeneralX4v3, 0.25);
        let c = UpsamplerKey::new(UpscalerModel::RealEsrganX4plus, 0.5);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(b.denoise_strength(), 0.25);
    }

    #[test]
    fn outscale_bounds() {
        assert!(validate_outscale(0).is_err());
        assert_eq!(validate_outscale(1).unwrap(), 1);
        assert_eq!(validate_outscale(6).unwrap(), 6);
        assert!(validate_outscale(7).is_err());
    }

    #[test]
    fn denoise_bounds() {
        assert!(validate_denoise_strength(-0.1).is_err());
        assert!(validate_denoise_strength(f32::NAN).is_err());
        assert!(validate_denoise_strength(1.5).is_err());
        assert_eq!(validate_denoise_strength(0.0).unwrap(), 0.0);
        assert_eq!(validate_denoise_strength(1.0).unwrap(), 1.0);
    }
}
