use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::error::ComposeError;

/// Observes download progress. The core never constructs a terminal
/// progress bar itself — an external driver can implement this to show one.
pub trait ProgressSink: Send + Sync {
    fn on_chunk(&self, downloaded: u64, total: u64);
}

/// A sink that does nothing, for callers that don't care about progress.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn on_chunk(&self, _downloaded: u64, _total: u64) {}
}

async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    total: u64,
    sink: &dyn ProgressSink,
) -> Result<(), ComposeError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| ComposeError::Io {
            context: format!("creating temp file {}", path.display()),
            source: e,
        })?;

    let mut downloaded = 0u64;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ComposeError::ImageDownload {
            message: "error reading response body".into(),
            source: Box::new(e),
        })?;
        file.write_all(&chunk).await.map_err(|e| ComposeError::Io {
            context: "writing image data".into(),
            source: e,
        })?;
        downloaded += chunk.len() as u64;
        sink.on_chunk(downloaded, total);
    }

    file.flush().await.map_err(|e| ComposeError::Io {
        context: "flushing image file".into(),
        source: e,
    })?;

    Ok(())
}

/// Resolve an image reference (local path or `http(s)://` URL) to a cached
/// file, downloading it if needed. A second caller that finds the final
/// file already present is a no-op unless `force` is set.
pub async fn ensure_base_image(
    image_ref: &str,
    cache_dir: &Path,
    force: bool,
    sink: &dyn ProgressSink,
) -> Result<PathBuf, ComposeError> {
    if !image_ref.starts_with("http://") && !image_ref.starts_with("https://") {
        let path = PathBuf::from(image_ref);
        if !path.exists() {
            return Err(ComposeError::ImageNotPulled {
                url: image_ref.to_string(),
            });
        }
        return Ok(path);
    }

    let filename = image_ref.rsplit('/').next().unwrap_or("image.img");

    tokio::fs::create_dir_all(cache_dir)
        .await
        .map_err(|e| ComposeError::Io {
            context: format!("creating cache dir {}", cache_dir.display()),
            source: e,
        })?;

    let dest = cache_dir.join(filename);
    if dest.exists() && !force {
        tracing::info!(path = %dest.display(), "using cached base image");
        return Ok(dest);
    }

    tracing::info!(url = %image_ref, "downloading base image");

    let response = reqwest::get(image_ref)
        .await
        .map_err(|e| ComposeError::ImageDownload {
            message: format!("request to {image_ref} failed"),
            source: Box::new(e),
        })?;

    if !response.status().is_success() {
        return Err(ComposeError::ImageDownload {
            message: format!("HTTP {} from {image_ref}", response.status()),
            source: format!("HTTP {}", response.status()).into(),
        });
    }

    let total_size = response.content_length().unwrap_or(0);
    let tmp_path = dest.with_extension("part");

    // Remove any stale .part file left by a previous failed download.
    let _ = tokio::fs::remove_file(&tmp_path).await;

    if let Err(e) = download_to_file(&tmp_path, response, total_size, sink).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    tokio::fs::rename(&tmp_path, &dest)
        .await
        .map_err(|e| ComposeError::Io {
            context: format!("renaming {} to {}", tmp_path.display(), dest.display()),
            source: e,
        })?;

    tracing::info!(path = %dest.display(), "base image cached");
    Ok(dest)
}

/// List cached images under the given cache directory.
pub fn list_cached(cache_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(cache_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_none_or(|ext| ext != "part"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_base_image_rejects_missing_local_path() {
        let result = ensure_base_image("/nonexistent/image.qcow2", Path::new("/tmp"), false, &NullProgress).await;
        assert!(result.is_err());
    }

    #[test]
    fn list_cached_skips_partial_downloads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("done.qcow2"), b"x").unwrap();
        std::fs::write(dir.path().join("inflight.part"), b"x").unwrap();
        let found = list_cached(dir.path());
        assert_eq!(found.len(), 1);
    }
}
