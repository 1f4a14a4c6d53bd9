use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use plugin_mirror::artifact;
use plugin_mirror::{ArtifactFetcher, ContentHasher, FetchError, FetchRequest, FetchedArtifact};
use reqwest::StatusCode;
use reqwest::header::CONTENT_DISPOSITION;
use tokio::io::AsyncWriteExt;

use crate::disposition;

/// Streams artifacts over HTTP into the store's staging directory.
pub struct HttpArtifactFetcher {
    client: reqwest::Client,
}

impl HttpArtifactFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::with_client(client)
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpArtifactFetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a non-success status onto the retry taxonomy.
pub fn classify_status(status: StatusCode, url: &str) -> FetchError {
    let message = format!("HTTP {status} from {url}");
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        FetchError::Transient(message)
    } else {
        FetchError::Permanent(message)
    }
}

fn classify_transport(error: reqwest::Error) -> FetchError {
    if error.is_builder() {
        FetchError::Permanent(error.to_string())
    } else {
        FetchError::Transient(error.to_string())
    }
}

fn storage(error: impl std::fmt::Display) -> FetchError {
    FetchError::Storage(error.to_string())
}

#[async_trait::async_trait]
impl ArtifactFetcher for HttpArtifactFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        staging: &Path,
    ) -> Result<FetchedArtifact, FetchError> {
        tracing::debug!(artifact = %request.key, url = %request.url, "downloading");

        let response = self
            .client
            .get(&request.url)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, &request.url));
        }

        let file_name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(disposition::from_header)
            .or_else(|| disposition::from_url(response.url()))
            .unwrap_or_else(|| disposition::fallback(&request.key));

        // Dropping `staged` on any early return deletes the partial file.
        let (file, staged) = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(staging)
            .map_err(storage)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut hasher = ContentHasher::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(classify_transport)?;
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(storage)?;
        }
        file.flush().await.map_err(storage)?;
        file.sync_all().await.map_err(storage)?;
        drop(file);

        let (checksum, size) = hasher.finish();
        artifact::verify(request, &checksum, size)?;

        tracing::debug!(artifact = %request.key, size, file = %file_name, "download verified");
        Ok(FetchedArtifact {
            key: request.key.clone(),
            staged,
            file_name,
            checksum,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let url = "http://upstream.test/x";
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, url).is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, url).is_retryable());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, url).is_retryable());
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, url),
            FetchError::Permanent(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, url),
            FetchError::Permanent(_)
        ));
    }
}
