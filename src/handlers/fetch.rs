use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{redirect, Client, StatusCode};
use tracing::*;

use super::{HandlerError, JobHandler};
use crate::cache::{ImageCache, ResultCache};
use crate::{FetchRequest, ImagePayload, Reply};

/// Public Drive endpoints that serve an image by file id, best first.
pub const SOURCE_TEMPLATES: [&str; 3] = [
    "https://drive.google.com/thumbnail?id={id}&sz=w1920",
    "https://lh3.googleusercontent.com/d/{id}=w1920",
    "https://drive.google.com/uc?export=view&id={id}",
];

const USER_AGENT: &str = "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";
const DEFAULT_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch_image(&self, file_id: &str) -> Result<FetchedImage, HandlerError>;
}

#[async_trait]
impl<S: ImageSource + ?Sized> ImageSource for Arc<S> {
    async fn fetch_image(&self, file_id: &str) -> Result<FetchedImage, HandlerError> {
        (**self).fetch_image(file_id).await
    }
}

/// Fetches images over HTTP, trying each URL template in order.
pub struct DriveImageFetcher {
    client: Client,
    templates: Vec<String>,
}

impl DriveImageFetcher {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_templates(SOURCE_TEMPLATES.iter().map(|t| t.to_string()).collect())
    }

    /// Templates use `{id}` as the file id placeholder.
    pub fn with_templates(templates: Vec<String>) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("image/*,*/*;q=0.8"));

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .redirect(redirect::Policy::limited(10))
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()?;

        Ok(DriveImageFetcher { client, templates })
    }

    async fn try_fetch(&self, url: &str) -> Option<FetchedImage> {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(url, error = %err, "Image source unreachable");
                return None;
            }
        };

        if response.status() != StatusCode::OK {
            debug!(url, status = %response.status(), "Image source refused");
            return None;
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_owned);
        // Drive answers with an HTML interstitial for files it will not serve.
        if content_type
            .as_deref()
            .is_some_and(|value| value.contains("text/html"))
        {
            debug!(url, "Image source returned HTML");
            return None;
        }

        let bytes = match response.bytes().await {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => return None,
            Err(err) => {
                debug!(url, error = %err, "Image body read failed");
                return None;
            }
        };

        Some(FetchedImage {
            bytes: bytes.to_vec(),
            content_type: content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned()),
        })
    }
}

#[async_trait]
impl ImageSource for DriveImageFetcher {
    #[instrument(name = "fetch.image", skip(self))]
    async fn fetch_image(&self, file_id: &str) -> Result<FetchedImage, HandlerError> {
        for template in &self.templates {
            let url = template.replace("{id}", file_id);
            if let Some(image) = self.try_fetch(&url).await {
                return Ok(image);
            }
        }

        warn!(file_id, "Image fetch failed for all source URLs");
        Err(HandlerError::NotFound {
            file_id: file_id.to_owned(),
        })
    }
}

/// Fetch job: answer from the result cache when possible, otherwise fetch
/// from the source and cache the successful result.
pub struct FetchJob<S, C> {
    source: S,
    cache: ImageCache<C>,
}

impl<S: ImageSource, C: ResultCache> FetchJob<S, C> {
    pub fn new(source: S, cache: ImageCache<C>) -> Self {
        FetchJob { source, cache }
    }
}

#[async_trait]
impl<S: ImageSource, C: ResultCache> JobHandler for FetchJob<S, C> {
    type Request = FetchRequest;

    async fn handle(&self, request: FetchRequest) -> Result<Reply, HandlerError> {
        let file_id = request.file_id;

        if let Some(cached) = self.cache.get_image(&file_id).await {
            info!(file_id, "Cache hit");
            return Ok(Reply::from_object(&cached)?);
        }

        let image = self.source.fetch_image(&file_id).await?;
        let payload = ImagePayload::new(&image.bytes, image.content_type);
        self.cache.put_image(&file_id, payload.clone()).await;

        info!(file_id, "Fetched and cached image");
        Ok(Reply::from_object(&payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use httpmock::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubSource {
        calls: AtomicUsize,
        image: Option<FetchedImage>,
    }

    impl StubSource {
        fn serving(image: Option<FetchedImage>) -> Self {
            StubSource {
                calls: AtomicUsize::new(0),
                image,
            }
        }
    }

    #[async_trait]
    impl ImageSource for StubSource {
        async fn fetch_image(&self, file_id: &str) -> Result<FetchedImage, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.image.clone().ok_or_else(|| HandlerError::NotFound {
                file_id: file_id.to_owned(),
            })
        }
    }

    fn jpeg() -> FetchedImage {
        FetchedImage {
            bytes: b"jpeg-bytes".to_vec(),
            content_type: "image/jpeg".into(),
        }
    }

    #[tokio::test]
    async fn falls_through_templates_in_order() {
        let server = MockServer::start_async().await;
        let missing = server.mock(|when, then| {
            when.method(GET).path("/thumbnail/abc123");
            then.status(404);
        });
        let html = server.mock(|when, then| {
            when.method(GET).path("/d/abc123");
            then.status(200)
                .header("content-type", "text/html; charset=utf-8")
                .body("<html>sign in</html>");
        });
        let image = server.mock(|when, then| {
            when.method(GET).path("/uc/abc123");
            then.status(200)
                .header("content-type", "image/png")
                .body("png-bytes");
        });

        let fetcher = DriveImageFetcher::with_templates(vec![
            format!("{}/thumbnail/{{id}}", server.base_url()),
            format!("{}/d/{{id}}", server.base_url()),
            format!("{}/uc/{{id}}", server.base_url()),
        ])
        .unwrap();

        let fetched = fetcher.fetch_image("abc123").await.unwrap();
        assert_eq!(fetched.bytes, b"png-bytes");
        assert_eq!(fetched.content_type, "image/png");
        missing.assert();
        html.assert();
        image.assert();
    }

    #[tokio::test]
    async fn exhausting_templates_is_not_found() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET);
            then.status(403);
        });

        let fetcher = DriveImageFetcher::with_templates(vec![
            format!("{}/a/{{id}}", server.base_url()),
            format!("{}/b/{{id}}", server.base_url()),
        ])
        .unwrap();

        let err = fetcher.fetch_image("gone").await.unwrap_err();
        assert!(matches!(err, HandlerError::NotFound { ref file_id } if file_id == "gone"));
        assert_eq!(err.to_string(), "Failed to fetch image from Google Drive");
    }

    #[tokio::test]
    async fn miss_fetches_and_populates_cache() {
        let cache = Arc::new(MemoryCache::new());
        let job = FetchJob::new(StubSource::serving(Some(jpeg())), ImageCache::new(cache.clone()));

        let reply = job
            .handle(FetchRequest {
                file_id: "abc123".into(),
            })
            .await
            .unwrap();

        let expected = ImagePayload::new(b"jpeg-bytes", "image/jpeg");
        assert_eq!(reply.parse::<ImagePayload>().unwrap(), expected);
        assert_eq!(
            cache.get("gdrive_image_abc123").await.unwrap(),
            Some(expected)
        );
    }

    #[tokio::test]
    async fn hit_skips_the_source() {
        let cache = ImageCache::new(MemoryCache::new());
        let cached = ImagePayload::new(b"cached", "image/webp");
        cache.put_image("abc123", cached.clone()).await;
        let job = FetchJob::new(StubSource::serving(Some(jpeg())), cache);

        let reply = job
            .handle(FetchRequest {
                file_id: "abc123".into(),
            })
            .await
            .unwrap();

        assert_eq!(reply.parse::<ImagePayload>().unwrap(), cached);
        assert_eq!(job.source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let job = FetchJob::new(StubSource::serving(None), ImageCache::new(MemoryCache::new()));

        let err = job
            .handle(FetchRequest {
                file_id: "missing".into(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::NotFound { .. }));
        assert!(job.cache.store().is_empty().await);
    }
}
