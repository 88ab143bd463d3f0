// Main entry point for nijika-worker.
// Parses configuration, prepares the weight store and inference pipelines,
// configures the Axum router, and starts the HTTP server.

mod error;
mod image_codec;
mod inference;
mod model_cache;
mod models;
mod pipeline;
mod shutdown_signal;
mod weights;
mod web;

#[cfg(test)]
mod test_support;

use clap::Parser;
use inference::{ModelLoader, OnnxModelLoader};
use pipeline::{RemoveBgPipeline, UpscalePipeline};
use shutdown_signal::shutdown_signal;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use weights::WeightStore;

/// Command line arguments for nijika-worker
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct AppConfig {
    /// Hostname/IP to bind the server to.
    /// If this option is specified without value, it will default to "*", meaning the server will listen on all interfaces.
    #[arg(long, env = "NIJIKA_WORKER_HOST", default_value = "localhost", num_args = 0..=1, default_missing_value = "*")]
    host: String,

    /// Port number to listen on.
    #[arg(short, long, env = "NIJIKA_WORKER_PORT", default_value_t = 8000)]
    port: u16,

    /// Directory holding the ONNX weight files.
    #[arg(long, env = "NIJIKA_WORKER_WEIGHTS_DIR", default_value = "weights")]
    weights_dir: String,

    /// Base URL missing weight files are downloaded from (`<url>/<file>`).
    /// Without it, weights have to be present in the weights directory.
    #[arg(long, env = "NIJIKA_WORKER_WEIGHTS_URL")]
    weights_url: Option<String>,

    /// Download every weight file before accepting requests.
    #[arg(long, env = "NIJIKA_WORKER_PREFETCH_WEIGHTS", action = clap::ArgAction::SetTrue)]
    prefetch_weights: bool,

    /// Maximum number of inference requests processed at the same time.
    #[arg(long, env = "NIJIKA_WORKER_MAX_CONCURRENT_REQUESTS", default_value_t = 8, value_parser = clap::value_parser!(u32).range(1..))]
    max_concurrent_requests: u32,

    /// Build the background remover at startup instead of on first use.
    #[arg(long, env = "NIJIKA_WORKER_PRELOAD_REMOVER", action = clap::ArgAction::SetTrue)]
    preload_remover: bool,
}

fn fatal(message: &str, error: impl std::fmt::Display) -> ! {
    tracing::error!("FATAL: {}: {}", message, error);
    eprintln!("FATAL: {}. Error: {}. Exiting.", message, error);
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    // Parse command line args and environment variables
    let config = AppConfig::parse();

    // Logs go to stdout, filtered by RUST_LOG (default: info).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("Starting nijika-worker...");

    let http_client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(10))
        .user_agent(concat!("nijika-worker/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|e| fatal("Failed to build HTTP client", e));

    // --- Weights ---
    let weights = Arc::new(WeightStore::new(
        &config.weights_dir,
        config.weights_url.clone(),
        http_client.clone(),
    ));
    tracing::info!("Weight directory set to: {}", weights.dir().display());
    match &config.weights_url {
        Some(url) => tracing::info!("Missing weights will be downloaded from {}", url),
        None => tracing::info!("No weights URL configured; weights must be provisioned locally"),
    }

    if config.prefetch_weights {
        let files = models::all_weight_files();
        match weights.ensure(&files).await {
            Ok(downloaded) => tracing::info!(
                "Weights ready ({} of {} files downloaded)",
                downloaded,
                files.len()
            ),
            Err(e) => fatal("Failed to prefetch weights", e),
        }
    }

    // --- Pipelines ---
    let loader: Arc<dyn ModelLoader> = Arc::new(OnnxModelLoader::new(weights.clone()));
    let upscaler = Arc::new(UpscalePipeline::new(loader.clone()));
    let remover = Arc::new(RemoveBgPipeline::new(loader));

    if config.preload_remover {
        if let Err(e) = weights.ensure(&remover.required_weights()).await {
            fatal("Failed to fetch background remover weights", e);
        }
        let preload_target = remover.clone();
        match tokio::task::spawn_blocking(move || preload_target.preload()).await {
            Ok(Ok(())) => tracing::info!("Background remover preloaded"),
            Ok(Err(e)) => fatal("Failed to preload background remover", e),
            Err(e) => fatal("Background remover preload task failed", e),
        }
    }

    // --- Build Axum Application Router ---
    let state = web::AppState {
        upscaler,
        remover,
        weights,
        http_client,
    };
    let app = web::create_app(state, config.max_concurrent_requests as usize);
    tracing::info!(
        "Axum router configured (max {} concurrent inference requests).",
        config.max_concurrent_requests
    );

    // --- Start HTTP Server ---
    let listener = match web::create_listener(&config.host, config.port).await {
        Ok((addr, l)) => {
            tracing::info!("Server successfully bound. Listening on {}", addr);
            l
        }
        Err(e) => fatal("Could not bind server", e),
    };

    if let Err(e) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server run error: {}", e);
        eprintln!("ERROR: Server shut down unexpectedly. Error: {}", e);
    }

    tracing::info!("nijika-worker has shut down.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AppConfig::try_parse_from(["nijika-worker"]).unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 8000);
        assert_eq!(config.weights_dir, "weights");
        assert_eq!(config.weights_url, None);
        assert_eq!(config.max_concurrent_requests, 8);
        assert!(!config.prefetch_weights);
        assert!(!config.preload_remover);
    }

    #[test]
    fn bare_host_flag_means_all_interfaces() {
        let config = AppConfig::try_parse_from(["nijika-worker", "--host", "-p", "9000"]).unwrap();
        assert_eq!(config.host, "*");
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(AppConfig::try_parse_from(["nijika-worker", "--max-concurrent-requests", "0"]).is_err());
    }
}
