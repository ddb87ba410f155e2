use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::*;
use uuid::Uuid;

use super::{HandlerError, JobHandler};
use crate::{Reply, UploadRequest};

pub const DEFAULT_API_URL: &str = "https://www.googleapis.com";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub file_id: String,
    pub url: String,
}

/// Reply body of a successful upload job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResult {
    pub success: bool,
    pub filename: String,
    pub file_id: String,
    pub url: String,
    pub image_index: u32,
}

#[async_trait]
pub trait DriveUploader: Send + Sync {
    /// Stores `content` as `filename` inside `folder_id` on behalf of `user_id`.
    async fn upload(
        &self,
        user_id: u64,
        content: Vec<u8>,
        filename: &str,
        folder_id: &str,
    ) -> Result<UploadedFile, HandlerError>;
}

pub fn mime_type(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("tiff" | "tif") => "image/tiff",
        _ => "application/octet-stream",
    }
}

pub fn public_url(file_id: &str) -> String {
    format!("https://drive.usercontent.google.com/download?id={file_id}&export=view&authuser=0")
}

#[derive(Deserialize)]
struct CreatedFile {
    id: String,
}

/// Uploads through the Drive v3 REST API with a pre-issued access token,
/// then makes the file readable by anyone with the link.
pub struct DriveApiUploader {
    client: Client,
    api_url: String,
    access_token: String,
}

impl DriveApiUploader {
    pub fn new(api_url: impl Into<String>, access_token: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(120)).build()?;
        Ok(DriveApiUploader {
            client,
            api_url: api_url.into().trim_end_matches('/').to_owned(),
            access_token: access_token.into(),
        })
    }

    async fn create_file(&self, content: Vec<u8>, filename: &str, folder_id: &str) -> Result<String, HandlerError> {
        let boundary = format!("imageq-{}", Uuid::new_v4().simple());
        let metadata = json!({ "name": filename, "parents": [folder_id] });

        let mut body = Vec::with_capacity(content.len() + 512);
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n\
                 --{boundary}\r\nContent-Type: {}\r\n\r\n",
                mime_type(filename)
            )
            .as_bytes(),
        );
        body.extend_from_slice(&content);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let created: CreatedFile = self
            .client
            .post(format!(
                "{}/upload/drive/v3/files?uploadType=multipart&fields=id",
                self.api_url
            ))
            .bearer_auth(&self.access_token)
            .header(CONTENT_TYPE, format!("multipart/related; boundary={boundary}"))
            .body(body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| HandlerError::Upload(format!("Drive upload failed: {err}")))?
            .json()
            .await
            .map_err(|err| HandlerError::Upload(format!("Drive upload returned no file id: {err}")))?;

        Ok(created.id)
    }

    async fn make_public(&self, file_id: &str) -> Result<(), HandlerError> {
        self.client
            .post(format!("{}/drive/v3/files/{file_id}/permissions", self.api_url))
            .bearer_auth(&self.access_token)
            .json(&json!({ "type": "anyone", "role": "reader" }))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| HandlerError::Upload(format!("Drive permission update failed: {err}")))?;
        Ok(())
    }
}

#[async_trait]
impl DriveUploader for DriveApiUploader {
    #[instrument(name = "upload.drive", skip_all, fields(filename = %filename, size = content.len()))]
    async fn upload(
        &self,
        user_id: u64,
        content: Vec<u8>,
        filename: &str,
        folder_id: &str,
    ) -> Result<UploadedFile, HandlerError> {
        let file_id = self.create_file(content, filename, folder_id).await?;
        self.make_public(&file_id).await?;
        debug!(user_id, file_id = %file_id, folder_id, "Drive file created and shared");

        Ok(UploadedFile {
            url: public_url(&file_id),
            file_id,
        })
    }
}

pub struct UploadJob<U> {
    uploader: U,
}

impl<U: DriveUploader> UploadJob<U> {
    pub fn new(uploader: U) -> Self {
        UploadJob { uploader }
    }
}

#[async_trait]
impl<U: DriveUploader> JobHandler for UploadJob<U> {
    type Request = UploadRequest;

    async fn handle(&self, request: UploadRequest) -> Result<Reply, HandlerError> {
        let content = STANDARD
            .decode(request.file_data.as_bytes())
            .map_err(HandlerError::InvalidFileData)?;

        let uploaded = self
            .uploader
            .upload(request.user_id, content, &request.filename, &request.folder_id)
            .await?;
        info!(
            filename = %request.filename,
            gallery_id = request.gallery_id,
            file_id = %uploaded.file_id,
            "Image uploaded"
        );

        Ok(Reply::from_object(&UploadResult {
            success: true,
            filename: request.filename,
            file_id: uploaded.file_id,
            url: uploaded.url,
            image_index: request.image_index,
        })?)
    }
}
