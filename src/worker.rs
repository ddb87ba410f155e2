use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::broker::{BrokerError, Delivery, Message, Transport};
use crate::handlers::JobHandler;
use crate::Reply;

/// One unacknowledged job per worker; the next one is not pulled until the
/// current one is acked.
pub const PREFETCH: u16 = 1;

pub const MISSING_FIELDS: &str = "Missing required fields";

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("failed to encode reply: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("delivery stream for `{0}` closed")]
    StreamClosed(String),
}

/// Drains `queue` one job at a time until `cancel_token` fires.
///
/// Returns an error when the broker fails underneath the loop; the job being
/// handled at that moment stays unacked and is redelivered by the broker.
pub async fn start<T, H>(
    cancel_token: CancellationToken,
    transport: &T,
    queue: &str,
    handler: &H,
) -> Result<(), WorkerError>
where
    T: Transport,
    H: JobHandler,
{
    transport.declare_work_queue(queue).await?;
    let mut deliveries = transport.consume_work(queue, PREFETCH).await?;
    info!(queue, "Worker started, waiting for jobs");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker Cancelled");
                break;
            },
            delivery = deliveries.next() => {
                match delivery {
                    None => {
                        error!(queue, "Delivery stream closed, exiting");
                        return Err(WorkerError::StreamClosed(queue.to_owned()));
                    },
                    Some(Err(err)) => {
                        error!(message = "Error receiving job by worker, exiting", error = ?err);
                        return Err(err.into());
                    },
                    Some(Ok(delivery)) => {
                        process(transport, handler, delivery).await?;
                    }
                }
            }
        }
    }
    info!("Worker stopped.");
    Ok(())
}

/// Handles one delivery: decode, run the handler, publish the reply, ack.
///
/// Every job ends in exactly one reply and one ack whatever the handler does;
/// only broker failures are returned.
#[instrument(skip_all, fields(correlation_id = ?delivery.message.correlation_id))]
pub async fn process<T, H>(transport: &T, handler: &H, delivery: Delivery) -> Result<Reply, WorkerError>
where
    T: Transport,
    H: JobHandler,
{
    let reply = respond(handler, &delivery.message.body).await;

    match delivery.message.reply_to.as_deref() {
        Some(reply_to) => {
            let body = serde_json::to_vec(&reply)?;
            transport
                .publish(
                    reply_to,
                    Message {
                        correlation_id: delivery.message.correlation_id.clone(),
                        reply_to: None,
                        persistent: false,
                        body,
                    },
                )
                .await?;
        }
        None => warn!("Job has no reply_to, reply dropped"),
    }

    delivery.ack().await?;
    Ok(reply)
}

async fn respond<H: JobHandler>(handler: &H, body: &[u8]) -> Reply {
    let request = match serde_json::from_slice::<H::Request>(body) {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "Job payload missing required fields");
            return Reply::failure(MISSING_FIELDS);
        }
    };

    match handler.handle(request).await {
        Ok(reply) => {
            debug!("Job completed");
            reply
        }
        Err(err) => {
            warn!(error = %err, "Job failed");
            Reply::failure(err.to_string())
        }
    }
}
