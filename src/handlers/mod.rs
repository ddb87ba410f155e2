//! Domain work executed by workers.
//!
//! A [`JobHandler`] turns a decoded job body into a [`Reply`]. Failures are
//! returned as [`HandlerError`]s and the worker renders them into
//! `{"success": false, "error": ...}` replies.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::Reply;

pub mod fetch;
pub mod upload;

pub use fetch::{DriveImageFetcher, FetchJob, FetchedImage, ImageSource};
pub use upload::{DriveApiUploader, DriveUploader, UploadJob, UploadedFile};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Failed to fetch image from Google Drive")]
    NotFound { file_id: String },
    #[error("Failed to read file data")]
    InvalidFileData(#[source] base64::DecodeError),
    #[error("{0}")]
    Upload(String),
    #[error("failed to encode reply: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Job body. Bodies that do not deserialize are answered with
    /// "Missing required fields" and never reach [`JobHandler::handle`].
    type Request: DeserializeOwned + Send;

    async fn handle(&self, request: Self::Request) -> Result<Reply, HandlerError>;
}
