//! Front-end side of the bridge: what a web request handler calls.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::*;

use crate::cache::{ImageCache, ResultCache};
use crate::gateway::{RpcError, RpcGateway};
use crate::handlers::upload::UploadResult;
use crate::{FetchRequest, ImagePayload, Transport, UploadRequest};

pub const IMAGE_CACHE_CONTROL: &str = "public, max-age=86400";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Image not found: {0}")]
    NotFound(String),
    #[error("worker reported failure: {0}")]
    Failed(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("malformed worker reply: {0}")]
    MalformedReply(String),
}

impl ClientError {
    /// HTTP status a web layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ClientError::NotFound(_) => 404,
            ClientError::Rpc(err) if err.is_timeout() => 504,
            ClientError::Failed(_) | ClientError::Rpc(_) | ClientError::MalformedReply(_) => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageResponse {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub cache_control: &'static str,
}

impl ImageResponse {
    fn from_payload(payload: &ImagePayload) -> Result<Self, ClientError> {
        let bytes = payload
            .decode_body()
            .map_err(|err| ClientError::MalformedReply(err.to_string()))?;
        Ok(ImageResponse {
            bytes,
            content_type: payload.content_type.clone(),
            cache_control: IMAGE_CACHE_CONTROL,
        })
    }
}

/// Cache-aside image read path: cache first, then an RPC to the fetch
/// workers, then populate the cache with the successful result.
pub struct ImageProxy<T, C> {
    gateway: RpcGateway<T>,
    cache: ImageCache<C>,
    queue: String,
    timeout: Duration,
}

impl<T: Transport, C: ResultCache> ImageProxy<T, C> {
    pub fn new(gateway: RpcGateway<T>, cache: ImageCache<C>, queue: impl Into<String>, timeout: Duration) -> Self {
        ImageProxy {
            gateway,
            cache,
            queue: queue.into(),
            timeout,
        }
    }

    pub fn cache(&self) -> &ImageCache<C> {
        &self.cache
    }

    #[instrument(name = "proxy.show", skip(self))]
    pub async fn show(&self, file_id: &str) -> Result<ImageResponse, ClientError> {
        if let Some(cached) = self.cache.get_image(file_id).await {
            return ImageResponse::from_payload(&cached);
        }

        let reply = self
            .gateway
            .call(
                &self.queue,
                &FetchRequest {
                    file_id: file_id.to_owned(),
                },
                self.timeout,
            )
            .await?;

        if !reply.success {
            warn!(file_id, error = reply.error_message(), "Image fetch failed");
            return Err(ClientError::NotFound(file_id.to_owned()));
        }

        let payload: ImagePayload = reply
            .parse()
            .map_err(|err| ClientError::MalformedReply(err.to_string()))?;
        let response = ImageResponse::from_payload(&payload)?;
        self.cache.put_image(file_id, payload).await;
        Ok(response)
    }
}

/// Progress report returned to the uploading browser after each image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadProgress {
    pub success: bool,
    pub file_id: String,
    pub filename: String,
    pub uploaded: u32,
    pub total: u32,
    pub progress: String,
    pub completed: bool,
}

impl UploadProgress {
    /// Images are uploaded in index order, so image `image_index` finishing
    /// means `image_index + 1` are done.
    fn after(result: UploadResult, total: u32) -> Self {
        let uploaded = result.image_index.saturating_add(1);
        UploadProgress {
            success: true,
            file_id: result.file_id,
            filename: result.filename,
            uploaded,
            total,
            progress: format!("{uploaded} of {total}"),
            completed: uploaded >= total,
        }
    }
}

pub struct GalleryUploads<T> {
    gateway: RpcGateway<T>,
    queue: String,
    timeout: Duration,
}

impl<T: Transport> GalleryUploads<T> {
    pub fn new(gateway: RpcGateway<T>, queue: impl Into<String>, timeout: Duration) -> Self {
        GalleryUploads {
            gateway,
            queue: queue.into(),
            timeout,
        }
    }

    #[instrument(name = "uploads.upload", skip_all, fields(filename = %request.filename, index = request.image_index))]
    pub async fn upload(&self, request: &UploadRequest, total_images: u32) -> Result<UploadProgress, ClientError> {
        let reply = self.gateway.call(&self.queue, request, self.timeout).await?;

        if !reply.success {
            return Err(ClientError::Failed(reply.error_message().to_owned()));
        }

        let result: UploadResult = reply
            .parse()
            .map_err(|err| ClientError::MalformedReply(err.to_string()))?;
        Ok(UploadProgress::after(result, total_images))
    }
}
