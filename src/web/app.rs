use super::{AppState, MAX_IMAGE_SIZE_BYTES, handlers};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::Level;

pub fn create_app(state: AppState, max_concurrent_requests: usize) -> Router {
    // Inference endpoints share one in-flight limit; health and model
    // listing stay responsive while it is saturated.
    let inference = Router::new()
        .route("/remove", post(handlers::remove_background))
        .route("/upscale", post(handlers::upscale_image))
        .route_layer(GlobalConcurrencyLimitLayer::new(max_concurrent_requests));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/models", get(handlers::list_models))
        .merge(inference)
        // Apply a layer to limit the maximum size of request bodies
        .layer(DefaultBodyLimit::max(MAX_IMAGE_SIZE_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new().level(Level::INFO)))
        .with_state(state)
}
