use super::{MAX_IMAGE_SIZE_BYTES, error::ApiError, models::JsonImageRequest};
use crate::error::InferenceError;
use crate::models::{
    DEFAULT_DENOISE_STRENGTH, DEFAULT_MODEL, DEFAULT_OUTSCALE, InferenceRequest, UpscalerModel,
    validate_denoise_strength, validate_outscale,
};
use axum::{
    body,
    extract::{FromRequest, Multipart, Request},
    http::{HeaderMap, header},
};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

/// Where the image of a request comes from.
#[derive(Debug)]
pub enum ImageSource {
    Upload {
        data: Vec<u8>,
        content_type: Option<String>,
    },
    Url(String),
}

/// Upscaling parameters as sent by the client, not yet validated.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RawParams {
    pub model: Option<String>,
    pub face_enhance: Option<bool>,
    pub scale: Option<u32>,
    pub denoise_strength: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpscaleParams {
    pub model: UpscalerModel,
    pub face_enhance: bool,
    pub outscale: u32,
    pub denoise_strength: f32,
}

#[derive(Debug)]
pub struct ImagePayload {
    pub source: ImageSource,
    pub params: RawParams,
}

impl RawParams {
    /// Applies defaults and checks ranges.
    pub fn validate(&self) -> Result<UpscaleParams, InferenceError> {
        let model = match self.model.as_deref() {
            Some(name) => name.parse::<UpscalerModel>()?,
            None => DEFAULT_MODEL,
        };
        Ok(UpscaleParams {
            model,
            face_enhance: self.face_enhance.unwrap_or(false),
            outscale: validate_outscale(self.scale.unwrap_or(DEFAULT_OUTSCALE))?,
            denoise_strength: validate_denoise_strength(
                self.denoise_strength.unwrap_or(DEFAULT_DENOISE_STRENGTH),
            )?,
        })
    }
}

impl UpscaleParams {
    pub fn into_request(self, image_bytes: Vec<u8>, content_type: Option<String>) -> InferenceRequest {
        InferenceRequest {
            image_bytes,
            content_type,
            model: self.model,
            denoise_strength: self.denoise_strength,
            face_enhance: self.face_enhance,
            outscale: self.outscale,
        }
    }
}

impl ImagePayload {
    /// Resolves the image bytes, fetching them when the request named a URL.
    pub async fn into_image(
        self,
        client: &reqwest::Client,
    ) -> Result<(Vec<u8>, Option<String>), ApiError> {
        let (data, content_type) = match self.source {
            ImageSource::Upload { data, content_type } => (data, content_type),
            ImageSource::Url(url) => fetch_image(client, &url).await?,
        };

        if data.is_empty() {
            return Err(ApiError::BadRequest("Empty image data".to_string()));
        }
        Ok((data, content_type))
    }
}

/// Splits a request into image source and parameters. JSON bodies name a
/// URL, multipart forms carry an `image` (or `file`) field, and any other
/// body is the image itself with parameters in `X-*` headers.
pub async fn extract_image_payload(request: Request) -> Result<ImagePayload, ApiError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.contains("application/json") {
        extract_json_payload(request).await
    } else if content_type.starts_with("multipart/form-data") {
        extract_multipart_payload(request).await
    } else {
        extract_binary_payload(request, &content_type).await
    }
}

async fn read_body(request: Request) -> Result<body::Bytes, ApiError> {
    body::to_bytes(request.into_body(), MAX_IMAGE_SIZE_BYTES)
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read request body: {}", e)))
}

async fn extract_json_payload(request: Request) -> Result<ImagePayload, ApiError> {
    let bytes = read_body(request).await?;
    let body: JsonImageRequest = serde_json::from_slice(&bytes)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))?;

    let url = body
        .url
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("JSON body must contain 'url' field".to_string()))?;

    Ok(ImagePayload {
        source: ImageSource::Url(url),
        params: RawParams {
            model: body.model,
            face_enhance: body.face_enhance,
            scale: body.scale,
            denoise_strength: body.denoise_strength,
        },
    })
}

async fn extract_binary_payload(
    request: Request,
    content_type: &str,
) -> Result<ImagePayload, ApiError> {
    let params = params_from_headers(request.headers())?;
    let data = read_body(request).await?.to_vec();

    Ok(ImagePayload {
        source: ImageSource::Upload {
            data,
            content_type: (!content_type.is_empty()).then(|| content_type.to_string()),
        },
        params,
    })
}

async fn extract_multipart_payload(request: Request) -> Result<ImagePayload, ApiError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to process multipart request: {}", e)))?;

    let mut image: Option<(Vec<u8>, Option<String>)> = None;
    let mut params = RawParams::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to process multipart field: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "image" | "file" => {
                if image.is_some() {
                    warn!("Multiple image fields found in multipart request, using the last one");
                }
                let content_type = field.content_type().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read image data: {}", e)))?
                    .to_vec();
                image = Some((data, content_type));
            }
            "model" | "scale" | "face_enhance" | "denoise_strength" => {
                let text = field.text().await.map_err(|e| {
                    ApiError::BadRequest(format!("Failed to read field '{}': {}", name, e))
                })?;
                let text = text.trim();
                match name.as_str() {
                    "model" => params.model = Some(text.to_string()),
                    "scale" => params.scale = Some(parse_param("scale", text)?),
                    "face_enhance" => {
                        params.face_enhance =
                            Some(matches!(text.to_lowercase().as_str(), "true" | "1"))
                    }
                    _ => params.denoise_strength = Some(parse_param("denoise_strength", text)?),
                }
            }
            other => debug!("Ignoring multipart field: {}", other),
        }
    }

    let (data, content_type) = image.ok_or_else(|| {
        ApiError::BadRequest("Missing 'image' field in multipart request".to_string())
    })?;

    Ok(ImagePayload {
        source: ImageSource::Upload { data, content_type },
        params,
    })
}

fn parse_param<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ApiError> {
    value
        .parse::<T>()
        .map_err(|_| ApiError::BadRequest(format!("Invalid {}: '{}'", name, value)))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, ApiError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map(str::trim)
                .map_err(|_| ApiError::BadRequest(format!("Header {} is not valid text", name)))
        })
        .transpose()
}

fn params_from_headers(headers: &HeaderMap) -> Result<RawParams, ApiError> {
    Ok(RawParams {
        model: header_str(headers, "x-model")?.map(str::to_string),
        face_enhance: header_str(headers, "x-face-enhance")?
            .map(|value| value.to_lowercase() == "true"),
        scale: header_str(headers, "x-scale")?
            .map(|value| parse_param("X-Scale header", value))
            .transpose()?,
        denoise_strength: header_str(headers, "x-denoise-strength")?
            .map(|value| parse_param("X-Denoise-Strength header", value))
            .transpose()?,
    })
}

/// Downloads a source image, following redirects. Non-success statuses and
/// bodies over the upload limit are errors.
pub async fn fetch_image(
    client: &reqwest::Client,
    url: &str,
) -> Result<(Vec<u8>, Option<String>), InferenceError> {
    info!("Fetching source image from {}", url);

    let response = client
        .get(url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| InferenceError::Fetch(e.to_string()))?;

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let too_large = || {
        InferenceError::Fetch(format!(
            "{} exceeds the {} byte image limit",
            url, MAX_IMAGE_SIZE_BYTES
        ))
    };
    if response
        .content_length()
        .is_some_and(|length| length > MAX_IMAGE_SIZE_BYTES as u64)
    {
        return Err(too_large());
    }

    let mut data = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| InferenceError::Fetch(format!("{}: {}", url, e)))?;
        if data.len() + chunk.len() > MAX_IMAGE_SIZE_BYTES {
            return Err(too_large());
        }
        data.extend_from_slice(&chunk);
    }

    debug!("Fetched {} bytes ({:?}) from {}", data.len(), content_type, url);
    Ok((data, content_type))
}
