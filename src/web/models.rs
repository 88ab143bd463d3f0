// API-specific data models for the web server

use serde::{Deserialize, Deserializer, Serialize, de::Error as _};

/// JSON body of `/remove` and `/upscale` in URL mode.
/// `/remove` only reads `url`.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct JsonImageRequest {
    pub url: Option<String>,
    pub model: Option<String>,
    pub face_enhance: Option<bool>,
    #[serde(default, deserialize_with = "whole_number")]
    pub scale: Option<u32>,
    pub denoise_strength: Option<f32>,
}

// JSON clients often send `2.0` for 2; fractional values are still rejected.
fn whole_number<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(value) = Option::<f64>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if value.fract() == 0.0 && (0.0..=f64::from(u32::MAX)).contains(&value) {
        Ok(Some(value as u32))
    } else {
        Err(D::Error::custom(format!(
            "scale must be a whole number, got {}",
            value
        )))
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Serialize, Debug, Clone)]
pub struct UpscalerModelInfo {
    pub name: &'static str,
    pub net_scale: u32,
    /// Denoise strengths this model currently has a handle for.
    pub loaded_denoise_strengths: Vec<f32>,
}

#[derive(Serialize, Debug, Clone)]
pub struct BackgroundRemoverInfo {
    pub loaded: bool,
}

#[derive(Serialize, Debug, Clone)]
pub struct ModelsResponse {
    pub default_model: &'static str,
    pub upscalers: Vec<UpscalerModelInfo>,
    pub background_remover: BackgroundRemoverInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> Result<JsonImageRequest, serde_json::Error> {
        serde_json::from_str(body)
    }

    #[test]
    fn scale_accepts_integral_numbers() {
        assert_eq!(parse(r#"{"url": "u", "scale": 2}"#).unwrap().scale, Some(2));
        assert_eq!(parse(r#"{"url": "u", "scale": 3.0}"#).unwrap().scale, Some(3));
        assert_eq!(parse(r#"{"url": "u"}"#).unwrap().scale, None);
        assert_eq!(parse(r#"{"url": "u", "scale": null}"#).unwrap().scale, None);
    }

    #[test]
    fn fractional_or_negative_scale_is_rejected() {
        let err = parse(r#"{"url": "u", "scale": 2.5}"#).unwrap_err();
        assert!(err.to_string().contains("scale must be a whole number"));
        assert!(parse(r#"{"url": "u", "scale": -1}"#).is_err());
    }
}
