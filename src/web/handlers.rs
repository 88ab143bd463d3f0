// API handlers for the web server

use super::{
    AppState,
    error::ApiError,
    extract_request_data::extract_image_payload,
    headers::{Accept, negotiate_format},
    models::*,
};
use crate::image_codec::{DEFAULT_JPEG_QUALITY, EncodedImage, OutputFormat};
use crate::models::{DEFAULT_MODEL, UpscalerModel};
use axum::{
    Json,
    extract::{Request, State},
    http::header,
    response::{IntoResponse, Response},
};
use axum_extra::TypedHeader;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

fn image_response(encoded: EncodedImage) -> Response {
    ([(header::CONTENT_TYPE, encoded.content_type)], encoded.bytes).into_response()
}

// --- GET /health ---
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// --- GET /models ---
// Lists the upscaler models and which model handles are currently loaded
pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let loaded = state.upscaler.loaded_upsamplers();

    let upscalers = UpscalerModel::ALL
        .into_iter()
        .map(|model| {
            let mut loaded_denoise_strengths: Vec<f32> = loaded
                .iter()
                .filter(|key| key.model == model)
                .map(|key| key.denoise_strength())
                .collect();
            loaded_denoise_strengths.sort_by(f32::total_cmp);

            UpscalerModelInfo {
                name: model.name(),
                net_scale: model.net_scale(),
                loaded_denoise_strengths,
            }
        })
        .collect();

    Json(ModelsResponse {
        default_model: DEFAULT_MODEL.name(),
        upscalers,
        background_remover: BackgroundRemoverInfo {
            loaded: state.remover.is_loaded(),
        },
    })
}

// --- POST /remove ---
// Returns the image with its background made transparent
pub async fn remove_background(
    State(state): State<AppState>,
    accept: Option<TypedHeader<Accept>>,
    request: Request,
) -> Result<Response, ApiError> {
    let request_id = Uuid::new_v4();
    let format = negotiate_format(accept.as_ref().map(|h| &h.0), OutputFormat::Png, true);

    let payload = extract_image_payload(request).await?;
    let (image_bytes, content_type) = payload.into_image(&state.http_client).await?;
    info!(
        "Remove background request: request_id={}, size={} bytes, output={}",
        request_id,
        image_bytes.len(),
        format.content_type()
    );

    state
        .weights
        .ensure(&state.remover.required_weights())
        .await?;

    let started = Instant::now();
    let pipeline = state.remover.clone();
    let encoded = tokio::task::spawn_blocking(move || {
        pipeline.run(&image_bytes, content_type.as_deref(), format)
    })
    .await
    .map_err(|e| ApiError::InternalServerError(format!("Background removal task failed: {}", e)))??;

    info!(
        "Remove background completed: request_id={}, {}x{} in {} ms",
        request_id,
        encoded.width,
        encoded.height,
        started.elapsed().as_millis()
    );

    Ok(image_response(encoded))
}

// --- POST /upscale ---
// Enlarges the image, optionally restoring faces
pub async fn upscale_image(
    State(state): State<AppState>,
    accept: Option<TypedHeader<Accept>>,
    request: Request,
) -> Result<Response, ApiError> {
    let request_id = Uuid::new_v4();
    let format = negotiate_format(
        accept.as_ref().map(|h| &h.0),
        OutputFormat::Jpeg {
            quality: DEFAULT_JPEG_QUALITY,
        },
        false,
    );

    let payload = extract_image_payload(request).await?;
    // Parameters are checked before any image is fetched.
    let params = payload.params.validate()?;
    let (image_bytes, content_type) = payload.into_image(&state.http_client).await?;

    info!(
        "Upscale request: request_id={}, model={}, scale={}, face_enhance={}, denoise_strength={}, size={} bytes",
        request_id,
        params.model,
        params.outscale,
        params.face_enhance,
        params.denoise_strength,
        image_bytes.len()
    );

    let inference_request = params.into_request(image_bytes, content_type);
    state
        .weights
        .ensure(&state.upscaler.required_weights(&inference_request))
        .await?;

    let started = Instant::now();
    let pipeline = state.upscaler.clone();
    let encoded = tokio::task::spawn_blocking(move || pipeline.run(&inference_request, format))
        .await
        .map_err(|e| ApiError::InternalServerError(format!("Upscale task failed: {}", e)))??;

    info!(
        "Upscale completed: request_id={}, {}x{} {} in {} ms",
        request_id,
        encoded.width,
        encoded.height,
        encoded.content_type,
        started.elapsed().as_millis()
    );

    Ok(image_response(encoded))
}
