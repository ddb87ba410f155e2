use std::env;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Error};
use base64::{engine::general_purpose::STANDARD, Engine};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, Instrument};

use imageq::broker::AmqpTransport;
use imageq::cache::{ImageCache, MemoryCache};
use imageq::client::{GalleryUploads, ImageProxy};
use imageq::config::{BrokerConfig, QueueConfig};
use imageq::handlers::upload::DEFAULT_API_URL;
use imageq::handlers::{DriveApiUploader, DriveImageFetcher, FetchJob, UploadJob};
use imageq::{telemetry, worker, RpcGateway, Transport, UploadRequest};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about)]
pub struct ConfigContext {
    #[command(flatten)]
    broker: BrokerConfig,

    #[command(flatten)]
    queues: QueueConfig,

    #[arg(
        long = "jaeger-endpoint",
        env = "JAEGER_ENDPOINT",
        help = "Jaeger collector endpoint; traces are only exported when set"
    )]
    jaeger_endpoint: Option<String>,

    #[arg(
        long = "image-cache-capacity",
        env = "IMAGE_CACHE_CAPACITY",
        help = "Most images kept in the in-process result cache",
        default_value = "512"
    )]
    image_cache_capacity: NonZeroUsize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Debug, PartialEq)]
enum Command {
    /// Serve image fetch jobs
    ImageWorker,
    /// Serve image upload jobs
    UploadWorker {
        #[arg(long, env = "GOOGLE_DRIVE_ACCESS_TOKEN", hide_env_values = true)]
        drive_access_token: String,

        #[arg(long, env = "GOOGLE_DRIVE_API_URL", default_value = DEFAULT_API_URL)]
        drive_api_url: String,
    },
    /// Fetch one image through the workers and write it to a file
    Fetch {
        file_id: String,

        #[arg(short, long)]
        output: PathBuf,
    },
    /// Upload one image through the workers and print the progress report
    Upload {
        #[arg(long)]
        user_id: u64,

        #[arg(long)]
        gallery_id: u64,

        #[arg(long)]
        folder_id: String,

        #[arg(long, default_value = "0")]
        image_index: u32,

        #[arg(long, default_value = "1")]
        total_images: u32,

        file: PathBuf,
    },
}

#[instrument(skip_all)]
async fn setup(config: ConfigContext, cancel_token: CancellationToken) -> Result<(), Error> {
    let transport = Arc::new(AmqpTransport::new(config.broker.clone()));
    transport.connect().await?;

    let result = run(&config, transport.clone(), cancel_token).await;

    if let Err(err) = transport.close().await {
        error!("Error closing broker connection: {}", err);
    }
    result
}

async fn run(
    config: &ConfigContext,
    transport: Arc<AmqpTransport>,
    cancel_token: CancellationToken,
) -> Result<(), Error> {
    let queues = &config.queues;

    match &config.command {
        Command::ImageWorker => {
            let cache = MemoryCache::with_capacity(config.image_cache_capacity);
            let handler = FetchJob::new(DriveImageFetcher::new()?, ImageCache::new(cache));
            worker::start(cancel_token, &transport, &queues.image_queue, &handler)
                .instrument(info_span!("worker", queue = %queues.image_queue))
                .await?;
        }
        Command::UploadWorker {
            drive_access_token,
            drive_api_url,
        } => {
            let handler = UploadJob::new(DriveApiUploader::new(
                drive_api_url.as_str(),
                drive_access_token.as_str(),
            )?);
            worker::start(cancel_token, &transport, &queues.upload_queue, &handler)
                .instrument(info_span!("worker", queue = %queues.upload_queue))
                .await?;
        }
        Command::Fetch { file_id, output } => {
            let proxy = ImageProxy::new(
                RpcGateway::new(transport),
                ImageCache::new(MemoryCache::with_capacity(config.image_cache_capacity)),
                queues.image_queue.as_str(),
                queues.rpc_timeout(),
            );
            let image = tokio::select! {
                _ = cancel_token.cancelled() => return Err(anyhow!("cancelled")),
                image = proxy.show(file_id) => image?,
            };
            tokio::fs::write(output, &image.bytes).await?;
            info!(
                file_id = %file_id,
                content_type = %image.content_type,
                size = image.bytes.len(),
                "Image written to {}",
                output.display()
            );
        }
        Command::Upload {
            user_id,
            gallery_id,
            folder_id,
            image_index,
            total_images,
            file,
        } => {
            let filename = file
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| anyhow!("{} has no usable file name", file.display()))?
                .to_owned();
            let request = UploadRequest {
                user_id: *user_id,
                gallery_id: *gallery_id,
                filename,
                file_data: STANDARD.encode(tokio::fs::read(file).await?),
                folder_id: folder_id.clone(),
                image_index: *image_index,
            };

            let uploads = GalleryUploads::new(
                RpcGateway::new(transport),
                queues.upload_queue.as_str(),
                queues.rpc_timeout(),
            );
            let progress = tokio::select! {
                _ = cancel_token.cancelled() => return Err(anyhow!("cancelled")),
                progress = uploads.upload(&request, *total_images) => progress?,
            };
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "imageq=DEBUG");
    }

    let config = ConfigContext::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(config, cloned_token));

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(err), _) | (_, Err(err)) => {
                    error!("Failed to install signal handlers: {}", err);
                    return;
                }
            };
        tokio::select! {
            _ = sigterm.recv() => {info!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {info!("Received SIGINT"); token.cancel()},
        }
    });

    let result = app.await?;
    info!("Shutting down.");
    telemetry::shutdown();
    result?;

    Ok(())
}
