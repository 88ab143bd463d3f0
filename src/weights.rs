// Local store of model weight files.
// Weights live in a single directory that survives restarts (a mounted cache
// volume in production). Missing files are downloaded from a base URL when
// one is configured; otherwise they have to be provisioned out of band.

use crate::error::InferenceError;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct WeightStore {
    dir: PathBuf,
    base_url: Option<String>,
    client: reqwest::Client,
    // Serialises downloads so two requests never write the same file.
    download_lock: Mutex<()>,
}

impl WeightStore {
    pub fn new(dir: impl Into<PathBuf>, base_url: Option<String>, client: reqwest::Client) -> Self {
        Self {
            dir: dir.into(),
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
            client,
            download_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Path of a weight file that must already be present.
    pub fn resolve(&self, file: &str) -> Result<PathBuf, InferenceError> {
        let path = self.path_of(file);
        if path.is_file() {
            Ok(path)
        } else {
            Err(InferenceError::WeightsNotFound(format!(
                "'{}' is not present in {}",
                file,
                self.dir.display()
            )))
        }
    }

    pub fn missing<'a>(&self, files: &[&'a str]) -> Vec<&'a str> {
        files
            .iter()
            .copied()
            .filter(|file| !self.path_of(file).is_file())
            .collect()
    }

    /// Makes sure every file in `files` is present, downloading the missing
    /// ones. Returns the number of files downloaded.
    pub async fn ensure(&self, files: &[&str]) -> Result<usize, InferenceError> {
        if self.missing(files).is_empty() {
            return Ok(0);
        }

        let Some(base_url) = self.base_url.as_deref() else {
            return Err(InferenceError::WeightsNotFound(format!(
                "{} missing from {} and no weights URL is configured",
                self.missing(files).join(", "),
                self.dir.display()
            )));
        };

        let _guard = self.download_lock.lock().await;

        // Another request may have fetched them while we waited for the lock.
        let missing = self.missing(files);
        for file in &missing {
            let url = format!("{}/{}", base_url, file);
            info!("Downloading {} from {}", file, url);
            let bytes = self.download(&url, file).await?;
            info!("Downloaded {} ({} bytes)", file, bytes);
        }

        Ok(missing.len())
    }

    async fn download(&self, url: &str, file: &str) -> Result<u64, InferenceError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| InferenceError::Download(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(InferenceError::Download(format!(
                "{}: HTTP status {}",
                url,
                response.status()
            )));
        }

        tokio::fs::create_dir_all(&self.dir).await?;

        // Write next to the target and rename at the end, so an interrupted
        // download never leaves a truncated weight file behind.
        let target = self.path_of(file);
        let partial = self.path_of(&format!("{}.part", file));

        let downloaded = match write_partial(&partial, url, response).await {
            Ok(downloaded) => downloaded,
            Err(e) => {
                discard_partial(&partial).await;
                return Err(e);
            }
        };

        if downloaded == 0 {
            discard_partial(&partial).await;
            return Err(InferenceError::Download(format!(
                "{}: response body is empty",
                url
            )));
        }

        tokio::fs::rename(&partial, &target).await?;
        debug!("Stored {} at {}", file, target.display());
        Ok(downloaded)
    }
}

/// Streams the response body into `partial`. The file is flushed before
/// returning, so write errors surface here and not on drop.
async fn write_partial(
    partial: &Path,
    url: &str,
    response: reqwest::Response,
) -> Result<u64, InferenceError> {
    let mut out = tokio::fs::File::create(partial).await?;

    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| InferenceError::Download(format!("{}: {}", url, e)))?;
        out.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
    }

    out.flush().await?;
    Ok(downloaded)
}

async fn discard_partial(partial: &Path) {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", partial.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_server;
    use axum::{Router, http::StatusCode, routing::get};

    fn weights_router() -> Router {
        Router::new()
            .route("/weights/model.onnx", get(|| async { vec![7u8; 1024] }))
            .route("/weights/empty.onnx", get(|| async { Vec::<u8>::new() }))
    }

    #[tokio::test]
    async fn present_files_need_no_base_url() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.onnx"), b"weights").unwrap();
        let store = WeightStore::new(dir.path(), None, reqwest::Client::new());

        assert_eq!(store.ensure(&["model.onnx"]).await.unwrap(), 0);
        assert_eq!(
            store.resolve("model.onnx").unwrap(),
            dir.path().join("model.onnx")
        );
    }

    #[tokio::test]
    async fn missing_files_without_base_url_fail() {
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(dir.path(), None, reqwest::Client::new());

        let err = store.ensure(&["model.onnx"]).await.unwrap_err();
        assert!(matches!(err, InferenceError::WeightsNotFound(_)));
        assert!(err.to_string().contains("model.onnx"));
        assert!(store.resolve("model.onnx").is_err());
    }

    #[tokio::test]
    async fn missing_files_are_downloaded_once() {
        let addr = spawn_server(weights_router()).await;
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(
            dir.path().join("cache"),
            Some(format!("http://{}/weights/", addr)),
            reqwest::Client::new(),
        );

        assert_eq!(store.ensure(&["model.onnx"]).await.unwrap(), 1);
        let stored = std::fs::read(dir.path().join("cache").join("model.onnx")).unwrap();
        assert_eq!(stored, vec![7u8; 1024]);
        assert!(!dir.path().join("cache").join("model.onnx.part").exists());

        assert_eq!(store.ensure(&["model.onnx"]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn http_errors_are_reported() {
        let addr = spawn_server(weights_router()).await;
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(
            dir.path(),
            Some(format!("http://{}/weights", addr)),
            reqwest::Client::new(),
        );

        let err = store.ensure(&["absent.onnx"]).await.unwrap_err();
        assert!(matches!(err, InferenceError::Download(_)));
        assert!(err.to_string().contains(StatusCode::NOT_FOUND.as_str()));
        assert!(!dir.path().join("absent.onnx").exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn failed_writes_leave_no_partial_file() {
        let device_full = Path::new("/dev/full");
        if !device_full.exists() {
            return;
        }
        let addr = spawn_server(weights_router()).await;
        let dir = tempfile::tempdir().unwrap();
        // Every write through this path fails with ENOSPC.
        let partial = dir.path().join("model.onnx.part");
        std::os::unix::fs::symlink(device_full, &partial).unwrap();
        let store = WeightStore::new(
            dir.path(),
            Some(format!("http://{}/weights", addr)),
            reqwest::Client::new(),
        );

        let err = store.ensure(&["model.onnx"]).await.unwrap_err();
        assert!(matches!(err, InferenceError::Io(_)));
        assert!(std::fs::symlink_metadata(&partial).is_err());
        assert!(!dir.path().join("model.onnx").exists());
    }

    #[tokio::test]
    async fn empty_downloads_are_discarded() {
        let addr = spawn_server(weights_router()).await;
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(
            dir.path(),
            Some(format!("http://{}/weights", addr)),
            reqwest::Client::new(),
        );

        assert!(store.ensure(&["empty.onnx"]).await.is_err());
        assert!(!dir.path().join("empty.onnx").exists());
        assert!(!dir.path().join("empty.onnx.part").exists());
    }
}
