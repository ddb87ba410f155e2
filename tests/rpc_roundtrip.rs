use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use imageq::broker::{MemoryBroker, Message};
use imageq::cache::{ImageCache, MemoryCache, ResultCache};
use imageq::client::{GalleryUploads, ImageProxy};
use imageq::handlers::{
    DriveUploader, FetchJob, FetchedImage, HandlerError, ImageSource, UploadJob, UploadedFile,
};
use imageq::{worker, ImagePayload, RpcGateway, Transport, UploadRequest};

const FETCH_QUEUE: &str = "image_fetch_queue";
const UPLOAD_QUEUE: &str = "image_upload_queue";
const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct CountingSource {
    calls: AtomicUsize,
}

#[async_trait]
impl ImageSource for CountingSource {
    async fn fetch_image(&self, _file_id: &str) -> Result<FetchedImage, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(FetchedImage {
            bytes: b"\xff\xd8\xffjpeg".to_vec(),
            content_type: "image/jpeg".into(),
        })
    }
}

struct FixedUploader;

#[async_trait]
impl DriveUploader for FixedUploader {
    async fn upload(
        &self,
        _user_id: u64,
        _content: Vec<u8>,
        _filename: &str,
        _folder_id: &str,
    ) -> Result<UploadedFile, HandlerError> {
        Ok(UploadedFile {
            file_id: "drive-file".into(),
            url: "https://drive.usercontent.google.com/download?id=drive-file&export=view&authuser=0"
                .into(),
        })
    }
}

#[tokio::test]
async fn fetch_is_served_by_worker_then_from_cache() {
    let broker = MemoryBroker::new();
    let source = Arc::new(CountingSource::default());
    let worker_cache = Arc::new(MemoryCache::new());
    let cancel_token = CancellationToken::new();

    let worker = {
        let broker = broker.clone();
        let cancel_token = cancel_token.clone();
        let handler = FetchJob::new(source.clone(), ImageCache::new(worker_cache.clone()));
        tokio::spawn(async move {
            let transport = broker.connect();
            worker::start(cancel_token, &transport, FETCH_QUEUE, &handler).await
        })
    };

    let front_cache = Arc::new(MemoryCache::new());
    let proxy = ImageProxy::new(
        RpcGateway::new(broker.connect()),
        ImageCache::new(front_cache.clone()),
        FETCH_QUEUE,
        TIMEOUT,
    );

    let first = proxy.show("abc123").await.unwrap();
    assert_eq!(first.bytes, b"\xff\xd8\xffjpeg");
    assert_eq!(first.content_type, "image/jpeg");
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);

    let expected = ImagePayload::new(b"\xff\xd8\xffjpeg", "image/jpeg");
    assert_eq!(
        front_cache.get("gdrive_image_abc123").await.unwrap(),
        Some(expected.clone())
    );
    assert_eq!(
        worker_cache.get("gdrive_image_abc123").await.unwrap(),
        Some(expected)
    );

    // Stop the worker: a second read must not need it.
    cancel_token.cancel();
    worker.await.unwrap().unwrap();

    let second = proxy.show("abc123").await.unwrap();
    assert_eq!(second, first);
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.queue_depth(FETCH_QUEUE), Some(0));
}

#[tokio::test]
async fn upload_missing_filename_is_answered_and_consumed() {
    let broker = MemoryBroker::new();
    let client = broker.connect();
    client.declare_work_queue(UPLOAD_QUEUE).await.unwrap();

    let reply_queue = client.declare_reply_queue().await.unwrap();
    let mut replies = client.consume_replies(&reply_queue).await.unwrap();
    client
        .publish(
            UPLOAD_QUEUE,
            Message {
                correlation_id: Some("rpc_upload_1".into()),
                reply_to: Some(reply_queue.clone()),
                persistent: true,
                body: serde_json::to_vec(&json!({
                    "user_id": 1,
                    "gallery_id": 2,
                    "file_data": "cG5n",
                    "folder_id": "folder",
                    "image_index": 0
                }))
                .unwrap(),
            },
        )
        .await
        .unwrap();
    assert_eq!(broker.queue_depth(UPLOAD_QUEUE), Some(1));

    let worker_connection = broker.connect();
    let mut jobs = worker_connection
        .consume_work(UPLOAD_QUEUE, worker::PREFETCH)
        .await
        .unwrap();
    let job = jobs.next().await.unwrap().unwrap();
    worker::process(&worker_connection, &UploadJob::new(FixedUploader), job)
        .await
        .unwrap();

    let reply = replies.next().await.unwrap().unwrap().message;
    assert_eq!(reply.correlation_id.as_deref(), Some("rpc_upload_1"));
    assert_eq!(
        serde_json::from_slice::<Value>(&reply.body).unwrap(),
        json!({"success": false, "error": "Missing required fields"})
    );
    assert_eq!(broker.queue_depth(UPLOAD_QUEUE), Some(0));
    assert_eq!(broker.in_flight(UPLOAD_QUEUE), Some(0));
}

#[tokio::test]
async fn upload_reports_progress() {
    let broker = MemoryBroker::new();
    let cancel_token = CancellationToken::new();

    let worker = {
        let broker = broker.clone();
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move {
            let transport = broker.connect();
            let handler = UploadJob::new(FixedUploader);
            worker::start(cancel_token, &transport, UPLOAD_QUEUE, &handler).await
        })
    };

    let uploads = GalleryUploads::new(RpcGateway::new(broker.connect()), UPLOAD_QUEUE, TIMEOUT);
    let request = UploadRequest {
        user_id: 1,
        gallery_id: 2,
        filename: "beach.jpg".into(),
        file_data: "cG5n".into(),
        folder_id: "folder".into(),
        image_index: 1,
    };

    let progress = uploads.upload(&request, 4).await.unwrap();
    cancel_token.cancel();
    worker.await.unwrap().unwrap();

    assert!(progress.success);
    assert_eq!(progress.file_id, "drive-file");
    assert_eq!(progress.filename, "beach.jpg");
    assert_eq!(progress.progress, "2 of 4");
    assert!(!progress.completed);
}

#[tokio::test]
async fn upload_accepts_form_encoded_index() {
    let broker = MemoryBroker::new();
    let client = broker.connect();
    client.declare_work_queue(UPLOAD_QUEUE).await.unwrap();
    let worker_connection = broker.connect();
    let mut jobs = worker_connection
        .consume_work(UPLOAD_QUEUE, worker::PREFETCH)
        .await
        .unwrap();

    for (index, expected) in [(json!("3"), 3), (Value::Null, 0)] {
        let reply_queue = client.declare_reply_queue().await.unwrap();
        let mut replies = client.consume_replies(&reply_queue).await.unwrap();
        client
            .publish(
                UPLOAD_QUEUE,
                Message {
                    correlation_id: Some(format!("rpc_form_{expected}")),
                    reply_to: Some(reply_queue),
                    persistent: true,
                    body: serde_json::to_vec(&json!({
                        "user_id": 1,
                        "gallery_id": 2,
                        "filename": "beach.jpg",
                        "file_data": "cG5n",
                        "folder_id": "folder",
                        "image_index": index
                    }))
                    .unwrap(),
                },
            )
            .await
            .unwrap();

        let job = jobs.next().await.unwrap().unwrap();
        worker::process(&worker_connection, &UploadJob::new(FixedUploader), job)
            .await
            .unwrap();

        let reply: Value = serde_json::from_slice(&replies.next().await.unwrap().unwrap().message.body).unwrap();
        assert_eq!(reply["success"], json!(true));
        assert_eq!(reply["image_index"], json!(expected));
    }
}
