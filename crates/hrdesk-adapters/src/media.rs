use std::sync::Arc;

use async_trait::async_trait;
use hrdesk_core::MediaFailure;
use hrdesk_storage::{FetchRequest, HttpFetcher, ObjectStore};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::AdapterContext;

pub const DEFAULT_MAX_MEDIA_BYTES: usize = 10 * 1024 * 1024;

const DRIVE_HOST: &str = "drive.google.com";

const HEIF_BRANDS: &[&[u8]] = &[b"heic", b"heix", b"heif", b"mif1"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("transient media failure: {0}")]
    Transient(String),
    #[error("permanent media failure: {0}")]
    Permanent(String),
}

impl MediaError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Permanent(msg) => msg,
        }
    }

    pub fn to_failure(&self) -> MediaFailure {
        MediaFailure {
            message: self.message().to_string(),
            permanent: self.is_permanent(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, ctx: &AdapterContext, reference: &str) -> Result<FetchedMedia, MediaError>;
}

/// Writes a fetched blob to durable storage and returns its stable public URL.
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload(&self, issue_id: Uuid, media: &FetchedMedia) -> Result<String, MediaError>;
}

fn drive_file_id(rest: &str) -> Option<&str> {
    let id = rest
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .next()
        .unwrap_or_default();
    (!id.is_empty()).then_some(id)
}

/// Rewrites shared-drive viewer links into direct-download links. Anything else, including
/// links already in `uc?export=download` form, is returned unchanged.
pub fn normalize_media_link(reference: &str) -> String {
    let reference = reference.trim();
    let Some((_, after_host)) = reference.split_once(DRIVE_HOST) else {
        return reference.to_string();
    };
    let id = after_host
        .strip_prefix("/file/d/")
        .or_else(|| after_host.strip_prefix("/open?id="))
        .and_then(drive_file_id);
    match id {
        Some(id) => format!("https://{DRIVE_HOST}/uc?export=download&id={id}"),
        None => reference.to_string(),
    }
}

/// File extension guessed from magic bytes.
pub fn sniff_extension(bytes: &[u8]) -> &'static str {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => "jpg",
        [0x89, b'P', b'N', b'G', ..] => "png",
        [b'G', b'I', b'F', b'8', ..] => "gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "webp",
        [_, _, _, _, b'f', b't', b'y', b'p', brand @ ..] if HEIF_BRANDS.iter().any(|b| brand.starts_with(b)) => "heic",
        _ => "bin",
    }
}

/// Extension for an image payload. Non-image bodies, such as the HTML sign-in page served for a
/// drive file that is not shared publicly, are permanent failures.
pub fn image_extension(media: &FetchedMedia) -> Result<&'static str, MediaError> {
    let content_type = media.content_type.as_deref().unwrap_or("unknown type");
    let html = content_type.trim().to_ascii_lowercase().starts_with("text/html");
    match sniff_extension(&media.bytes) {
        ext if ext != "bin" && !html => Ok(ext),
        _ => Err(MediaError::Permanent(format!(
            "media is not an image ({content_type}, {} bytes)",
            media.bytes.len()
        ))),
    }
}

/// Downloads media over the shared [`HttpFetcher`], classifying failures for the retry ledger.
#[derive(Debug, Clone)]
pub struct HttpMediaFetcher {
    http: Arc<HttpFetcher>,
    max_bytes: usize,
}

impl HttpMediaFetcher {
    pub fn new(http: Arc<HttpFetcher>, max_bytes: usize) -> Self {
        Self { http, max_bytes }
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, ctx: &AdapterContext, reference: &str) -> Result<FetchedMedia, MediaError> {
        let url = normalize_media_link(reference);
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(MediaError::Permanent(format!("unsupported media reference `{reference}`")));
        }
        let response = self
            .http
            .get(ctx.run_id, FetchRequest::get(&url).max_bytes(self.max_bytes))
            .await
            .map_err(|err| {
                if err.is_retryable() {
                    MediaError::Transient(err.to_string())
                } else {
                    MediaError::Permanent(err.to_string())
                }
            })?;

        if response.bytes.is_empty() {
            return Err(MediaError::Permanent(format!("empty media body from {url}")));
        }
        Ok(FetchedMedia {
            bytes: response.bytes,
            content_type: response.content_type,
        })
    }
}

/// Stores media under `issues/<issue_id>/` in an [`ObjectStore`] served from `base_url`.
#[derive(Debug, Clone)]
pub struct ObjectStoreUploader {
    store: ObjectStore,
    base_url: String,
}

impl ObjectStoreUploader {
    pub fn new(store: ObjectStore, base_url: impl Into<String>) -> Self {
        Self {
            store,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl MediaUploader for ObjectStoreUploader {
    async fn upload(&self, issue_id: Uuid, media: &FetchedMedia) -> Result<String, MediaError> {
        let extension = image_extension(media)?;
        let stored = self
            .store
            .put(&format!("issues/{issue_id}"), extension, &media.bytes)
            .await
            .map_err(|err| MediaError::Transient(format!("{err:#}")))?;
        Ok(format!("{}/{}", self.base_url.trim_end_matches('/'), stored.key))
    }
}

/// Fetch-then-upload for one issue's media.
#[derive(Clone)]
pub struct MediaTransfer {
    fetcher: Arc<dyn MediaFetcher>,
    uploader: Arc<dyn MediaUploader>,
}

impl MediaTransfer {
    pub fn new(fetcher: Arc<dyn MediaFetcher>, uploader: Arc<dyn MediaUploader>) -> Self {
        Self { fetcher, uploader }
    }

    pub async fn transfer(&self, ctx: &AdapterContext, issue_id: Uuid, reference: &str) -> Result<String, MediaError> {
        let media = self.fetcher.fetch(ctx, reference).await?;
        let url = self.uploader.upload(issue_id, &media).await?;
        debug!(run_id = %ctx.run_id, %issue_id, bytes = media.bytes.len(), %url, "media uploaded");
        Ok(url)
    }
}
