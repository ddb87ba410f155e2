//! Synchronous request/reply over a work queue.
//!
//! Every call declares its own exclusive, auto-deleted reply queue, publishes
//! a persistent request carrying `reply_to` and a fresh `correlation_id`, and
//! then waits for the matching reply until the deadline passes. A timed out
//! call does not cancel the job: the worker still replies, into a queue that
//! no longer exists, and the broker drops it.

use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tracing::*;
use uuid::Uuid;

use crate::broker::{BrokerError, Deliveries, Message, Transport};
use crate::Reply;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("no reply from `{queue}` within {timeout:?}")]
    Timeout { queue: String, timeout: Duration },
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed reply: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("reply queue closed before a reply arrived")]
    ReplyStreamClosed,
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

pub fn new_correlation_id() -> String {
    format!("rpc_{}", Uuid::new_v4().simple())
}

pub struct RpcGateway<T> {
    transport: T,
}

impl<T: Transport> RpcGateway<T> {
    pub fn new(transport: T) -> Self {
        RpcGateway { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Publishes `payload` to `queue` and waits up to `timeout` for the reply.
    ///
    /// A handler-reported failure comes back as `Ok` with `success == false`;
    /// `Err` is reserved for broker failures and the deadline passing.
    #[instrument(name = "rpc.call", skip(self, payload), fields(correlation_id))]
    pub async fn call<P>(&self, queue: &str, payload: &P, timeout: Duration) -> Result<Reply, RpcError>
    where
        P: Serialize + Sync + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(RpcError::Encode)?;

        self.transport.declare_work_queue(queue).await?;

        let correlation_id = new_correlation_id();
        Span::current().record("correlation_id", correlation_id.as_str());

        let reply_queue = self.transport.declare_reply_queue().await?;
        let outcome = self
            .exchange(queue, body, &correlation_id, &reply_queue, timeout)
            .await;

        if let Err(err) = self.transport.release_reply_queue(&reply_queue).await {
            debug!(reply_queue, error = %err, "Failed to release reply queue");
        }
        outcome
    }

    async fn exchange(
        &self,
        queue: &str,
        body: Vec<u8>,
        correlation_id: &str,
        reply_queue: &str,
        timeout: Duration,
    ) -> Result<Reply, RpcError> {
        let replies = self.transport.consume_replies(reply_queue).await?;

        self.transport
            .publish(
                queue,
                Message {
                    correlation_id: Some(correlation_id.to_owned()),
                    reply_to: Some(reply_queue.to_owned()),
                    persistent: true,
                    body,
                },
            )
            .await?;
        debug!(queue, reply_queue, "Request published");

        match tokio::time::timeout(timeout, await_reply(replies, correlation_id)).await {
            Ok(reply) => reply,
            Err(_) => {
                warn!(queue, ?timeout, "RPC timed out waiting for reply");
                Err(RpcError::Timeout {
                    queue: queue.to_owned(),
                    timeout,
                })
            }
        }
    }
}

async fn await_reply(mut replies: Deliveries, correlation_id: &str) -> Result<Reply, RpcError> {
    while let Some(delivery) = replies.next().await {
        let message = delivery?.message;
        if message.correlation_id.as_deref() != Some(correlation_id) {
            debug!(
                expected = correlation_id,
                received = ?message.correlation_id,
                "Discarding reply with foreign correlation id"
            );
            continue;
        }
        return serde_json::from_slice(&message.body).map_err(RpcError::Decode);
    }
    Err(RpcError::ReplyStreamClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, MemoryConnection};
    use serde_json::{json, Value};
    use std::time::Instant;

    async fn reply_to(worker: &MemoryConnection, request: &Message, body: Value) {
        worker
            .publish(
                request.reply_to.as_deref().unwrap(),
                Message {
                    correlation_id: request.correlation_id.clone(),
                    body: serde_json::to_vec(&body).unwrap(),
                    ..Message::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn request_carries_reply_properties() {
        let broker = MemoryBroker::new();
        let gateway = RpcGateway::new(broker.connect());

        let responder = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let worker = broker.connect();
                worker.declare_work_queue("jobs").await.unwrap();
                let mut jobs = worker.consume_work("jobs", 1).await.unwrap();
                let job = jobs.next().await.unwrap().unwrap();
                let request = job.message.clone();
                reply_to(&worker, &request, json!({"success": true, "echo": "hi"})).await;
                job.ack().await.unwrap();
                request
            })
        };

        let reply = gateway
            .call("jobs", &json!({"file_id": "abc"}), Duration::from_secs(5))
            .await
            .unwrap();
        let request = responder.await.unwrap();

        assert!(reply.success);
        assert_eq!(reply.fields["echo"], json!("hi"));
        assert!(request.persistent);
        assert!(request.correlation_id.unwrap().starts_with("rpc_"));
        let reply_queue = request.reply_to.unwrap();
        assert!(!broker.has_queue(&reply_queue));
        assert_eq!(
            serde_json::from_slice::<Value>(&request.body).unwrap(),
            json!({"file_id": "abc"})
        );
    }

    #[tokio::test]
    async fn late_reply_times_out_and_is_dropped() {
        let broker = MemoryBroker::new();
        let gateway = RpcGateway::new(broker.connect());

        let slow_worker = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let worker = broker.connect();
                worker.declare_work_queue("jobs").await.unwrap();
                let mut jobs = worker.consume_work("jobs", 1).await.unwrap();
                let job = jobs.next().await.unwrap().unwrap();
                tokio::time::sleep(Duration::from_millis(300)).await;
                let request = job.message.clone();
                reply_to(&worker, &request, json!({"success": true})).await;
                job.ack().await.unwrap();
                request.reply_to.unwrap()
            })
        };

        let started = Instant::now();
        let err = gateway
            .call("jobs", &json!({"file_id": "slow"}), Duration::from_millis(100))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout(), "unexpected error: {err}");
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(300));

        let reply_queue = slow_worker.await.unwrap();
        assert!(!broker.has_queue(&reply_queue));
        assert_eq!(broker.queue_depth("jobs"), Some(0));
    }

    #[tokio::test]
    async fn concurrent_calls_only_see_their_own_reply() {
        let broker = MemoryBroker::new();
        let first = RpcGateway::new(broker.connect());
        let second = RpcGateway::new(broker.connect());

        let responder = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let worker = broker.connect();
                worker.declare_work_queue("jobs").await.unwrap();
                let mut jobs = worker.consume_work("jobs", 2).await.unwrap();
                let a = jobs.next().await.unwrap().unwrap();
                let b = jobs.next().await.unwrap().unwrap();
                // Answer in reverse arrival order.
                for job in [b, a] {
                    let request = job.message.clone();
                    let asked: Value = serde_json::from_slice(&request.body).unwrap();
                    reply_to(&worker, &request, json!({"success": true, "id": asked["id"]})).await;
                    job.ack().await.unwrap();
                }
            })
        };

        let timeout = Duration::from_secs(5);
        let (ask_one, ask_two) = (json!({"id": 1}), json!({"id": 2}));
        let (one, two) = tokio::join!(
            first.call("jobs", &ask_one, timeout),
            second.call("jobs", &ask_two, timeout),
        );
        responder.await.unwrap();

        assert_eq!(one.unwrap().fields["id"], json!(1));
        assert_eq!(two.unwrap().fields["id"], json!(2));
    }

    #[tokio::test]
    async fn foreign_correlation_ids_are_ignored() {
        let broker = MemoryBroker::new();
        let gateway = RpcGateway::new(broker.connect());

        let responder = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let worker = broker.connect();
                worker.declare_work_queue("jobs").await.unwrap();
                let mut jobs = worker.consume_work("jobs", 1).await.unwrap();
                let job = jobs.next().await.unwrap().unwrap();
                let mut stray = job.message.clone();
                stray.correlation_id = Some("rpc_someone_else".into());
                reply_to(&worker, &stray, json!({"success": false, "error": "not yours"})).await;
                reply_to(&worker, &job.message, json!({"success": true})).await;
                job.ack().await.unwrap();
            })
        };

        let reply = gateway
            .call("jobs", &json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        responder.await.unwrap();
        assert!(reply.success);
    }

    #[tokio::test]
    async fn closed_connection_fails_immediately() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        connection.close().await.unwrap();
        let gateway = RpcGateway::new(connection);

        let err = gateway
            .call("jobs", &json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Broker(ref broker) if broker.is_connection_error()));
    }

    #[test]
    fn correlation_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| new_correlation_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
