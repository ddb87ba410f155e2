use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{
    de::{DeserializeOwned, Error as _},
    Deserialize, Deserializer, Serialize,
};
use serde_json::{Map, Value};

pub mod broker;
pub mod cache;
pub mod client;
pub mod config;
pub mod gateway;
pub mod handlers;
pub mod telemetry;
pub mod worker;

pub use broker::{BrokerError, Delivery, Message, Transport};
pub use gateway::{RpcError, RpcGateway};

/// Body of an image fetch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub file_id: String,
}

/// Body of an image upload job. `file_data` is the base64 encoded image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub user_id: u64,
    pub gallery_id: u64,
    pub filename: String,
    pub file_data: String,
    pub folder_id: String,
    /// Form-posting front ends send this as a string, or leave it null.
    #[serde(default, deserialize_with = "lenient_index")]
    pub image_index: u32,
}

fn lenient_index<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Index {
        Number(u32),
        Text(String),
    }

    match Option::<Index>::deserialize(deserializer)? {
        None => Ok(0),
        Some(Index::Number(index)) => Ok(index),
        Some(Index::Text(text)) => text
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid image_index `{text}`"))),
    }
}

/// Reply to a job: `{"success": bool, "error"?: string, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Reply {
    pub fn failure(error: impl Into<String>) -> Self {
        Reply {
            success: false,
            error: Some(error.into()),
            fields: Map::new(),
        }
    }

    /// Builds a reply from any serializable object; its `success` and
    /// `error` keys (if present) land in the matching reply fields.
    pub fn from_object<T: Serialize>(object: &T) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(object)?)
    }

    /// Reads the reply back as a typed payload.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(self)?)
    }

    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("Unknown error")
    }
}

/// A fetched image as it travels in replies and sits in the result cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub success: bool,
    pub body: String,
    pub content_type: String,
}

impl ImagePayload {
    pub fn new(bytes: &[u8], content_type: impl Into<String>) -> Self {
        ImagePayload {
            success: true,
            body: STANDARD.encode(bytes),
            content_type: content_type.into(),
        }
    }

    pub fn decode_body(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.body)
    }
}
