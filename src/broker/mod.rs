//! Broker access for the RPC bridge.
//!
//! [`Transport`] is the seam between the gateway / worker and the broker.
//! [`amqp::AmqpTransport`] speaks AMQP 0-9-1 and is what the binaries use;
//! [`memory::MemoryBroker`] keeps queues in-process with the same
//! semantics (durable work queues, exclusive auto-deleted reply queues,
//! redelivery of unacknowledged jobs).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use lapin::options::BasicAckOptions;
use thiserror::Error;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpTransport;
pub use memory::{MemoryBroker, MemoryConnection};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Connection(String),
    #[error("timed out connecting to broker after {0:?}")]
    ConnectTimeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("queue `{0}` not found")]
    QueueNotFound(String),
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
}

impl BrokerError {
    /// True when the broker could not be reached at all.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::ConnectTimeout(_) | BrokerError::Closed
        )
    }
}

/// A message as published to, or delivered from, a queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Delivery mode 2 when set.
    pub persistent: bool,
    pub body: Vec<u8>,
}

/// A received message together with the means to acknowledge it.
pub struct Delivery {
    pub message: Message,
    acker: Acker,
}

pub(crate) enum Acker {
    Amqp(lapin::acker::Acker),
    Memory(memory::Unacked),
    /// Consumed in no-ack mode.
    Auto,
}

impl Delivery {
    pub(crate) fn new(message: Message, acker: Acker) -> Self {
        Delivery { message, acker }
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        match self.acker {
            Acker::Amqp(acker) => {
                acker.ack(BasicAckOptions::default()).await?;
            }
            Acker::Memory(unacked) => unacked.ack(),
            Acker::Auto => {}
        }
        Ok(())
    }
}

pub type Deliveries = BoxStream<'static, Result<Delivery, BrokerError>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Declares a named, durable, non-exclusive, non-auto-delete queue.
    async fn declare_work_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Declares a server-named, exclusive, auto-delete queue and returns its name.
    async fn declare_reply_queue(&self) -> Result<String, BrokerError>;

    /// Publishes on the default exchange, routed by queue name.
    async fn publish(&self, queue: &str, message: Message) -> Result<(), BrokerError>;

    /// Consumes with manual acknowledgement and the given prefetch count.
    async fn consume_work(&self, queue: &str, prefetch: u16) -> Result<Deliveries, BrokerError>;

    /// Consumes a reply queue in no-ack mode.
    async fn consume_replies(&self, queue: &str) -> Result<Deliveries, BrokerError>;

    /// Stops consuming a reply queue so the broker can reclaim it.
    async fn release_reply_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Closes channel and connection. Safe to call more than once.
    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn declare_work_queue(&self, name: &str) -> Result<(), BrokerError> {
        (**self).declare_work_queue(name).await
    }

    async fn declare_reply_queue(&self) -> Result<String, BrokerError> {
        (**self).declare_reply_queue().await
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<(), BrokerError> {
        (**self).publish(queue, message).await
    }

    async fn consume_work(&self, queue: &str, prefetch: u16) -> Result<Deliveries, BrokerError> {
        (**self).consume_work(queue, prefetch).await
    }

    async fn consume_replies(&self, queue: &str) -> Result<Deliveries, BrokerError> {
        (**self).consume_replies(queue).await
    }

    async fn release_reply_queue(&self, queue: &str) -> Result<(), BrokerError> {
        (**self).release_reply_queue(queue).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        (**self).close().await
    }
}
