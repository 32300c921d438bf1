use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::io::Write;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Staging failure surfaced through the owning task's result path.
///
/// Cloneable so every waiter coalesced onto one in-flight fetch
/// observes the identical error.
#[derive(Debug, Clone, Error)]
pub enum StagingError {
    #[error("source fetch failed for {url}: {message}")]
    Network { url: String, message: String },

    #[error("unexpected staging response: {0}")]
    Protocol(String),

    #[error("source archive unpack failed: {0}")]
    Archive(String),

    #[error("source cache i/o failed at {path}: {message}")]
    Io { path: String, message: String },
}

impl StagingError {
    pub(crate) fn io(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        StagingError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

/// Server answer to a posted hash manifest.
///
/// Archives spill to temp files so a large bundle never sits in memory;
/// the spill file is reclaimed on drop.
pub enum SourceUpdate {
    /// HTTP 204: the cache already matches the remote tree
    Unchanged,
    /// Full snapshot archive, returned when the manifest was empty
    Full { archive: NamedTempFile },
    /// Changed/added files plus paths deleted remotely
    Partial {
        updates: Option<NamedTempFile>,
        removed: Vec<String>,
    },
}

/// Boundary to the external source-of-truth service
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// POST the manifest and decode the full/partial/no-change answer
    async fn fetch(&self, url: &str, manifest: &str) -> Result<SourceUpdate, StagingError>;
}

/// Production client speaking the staging protocol over HTTP
pub struct HttpSourceClient {
    http: reqwest::Client,
}

impl HttpSourceClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpSourceClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn fetch(&self, url: &str, manifest: &str) -> Result<SourceUpdate, StagingError> {
        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "text/plain")
            .body(manifest.to_string())
            .send()
            .await
            .map_err(|e| StagingError::Network {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(SourceUpdate::Unchanged);
        }
        if !status.is_success() {
            return Err(StagingError::Network {
                url: url.to_string(),
                message: format!("staging server answered {}", status),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("application/zip") {
            let archive = spill_stream(response.bytes_stream().boxed()).await?;
            Ok(SourceUpdate::Full { archive })
        } else if content_type.starts_with("multipart/") {
            decode_multipart(&content_type, response).await
        } else {
            Err(StagingError::Protocol(format!(
                "unsupported content type `{}`",
                content_type
            )))
        }
    }
}

async fn decode_multipart(
    content_type: &str,
    response: reqwest::Response,
) -> Result<SourceUpdate, StagingError> {
    let boundary = multer::parse_boundary(content_type)
        .map_err(|e| StagingError::Protocol(format!("bad multipart boundary: {}", e)))?;
    let mut multipart = multer::Multipart::new(response.bytes_stream(), boundary);

    let mut updates = None;
    let mut removed = Vec::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| StagingError::Protocol(format!("bad multipart body: {}", e)))?
    {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("updates") => {
                let mut spill = NamedTempFile::new()
                    .map_err(|e| StagingError::Protocol(format!("spill file: {}", e)))?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| StagingError::Protocol(format!("bad updates part: {}", e)))?
                {
                    spill
                        .write_all(&chunk)
                        .map_err(|e| StagingError::Protocol(format!("spill write: {}", e)))?;
                }
                updates = Some(spill);
            }
            Some("removed-paths") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| StagingError::Protocol(format!("bad removed-paths part: {}", e)))?;
                removed = serde_json::from_str(&text).map_err(|e| {
                    StagingError::Protocol(format!("removed-paths is not a JSON array: {}", e))
                })?;
            }
            other => {
                tracing::debug!(part = ?other, "ignoring unknown staging response part");
                while field
                    .chunk()
                    .await
                    .map_err(|e| StagingError::Protocol(format!("bad multipart part: {}", e)))?
                    .is_some()
                {}
            }
        }
    }

    Ok(SourceUpdate::Partial { updates, removed })
}

async fn spill_stream(
    mut stream: impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin,
) -> Result<NamedTempFile, StagingError> {
    let mut spill =
        NamedTempFile::new().map_err(|e| StagingError::Protocol(format!("spill file: {}", e)))?;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| StagingError::Protocol(format!("truncated body: {}", e)))?;
        spill
            .write_all(&chunk)
            .map_err(|e| StagingError::Protocol(format!("spill write: {}", e)))?;
    }
    Ok(spill)
}
