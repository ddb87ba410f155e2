use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::*;

use super::{Acker, BrokerError, Deliveries, Delivery, Message, Transport};
use crate::config::BrokerConfig;

const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

struct Link {
    connection: Connection,
    channel: Channel,
}

/// AMQP connection and channel, opened on first use and reopened lazily
/// when the cached ones are found dead before an operation.
pub struct AmqpTransport {
    config: BrokerConfig,
    link: Mutex<Option<Link>>,
}

impl AmqpTransport {
    pub fn new(config: BrokerConfig) -> Self {
        AmqpTransport {
            config,
            link: Mutex::new(None),
        }
    }

    /// Opens (or reuses) the connection and channel.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.ensure_channel().await.map(|_| ())
    }

    #[instrument(name = "amqp.ensure_channel", skip(self))]
    async fn ensure_channel(&self) -> Result<Channel, BrokerError> {
        let mut link = self.link.lock().await;

        if let Some(current) = link.as_ref() {
            if current.connection.status().connected() && current.channel.status().connected() {
                return Ok(current.channel.clone());
            }
        }

        let connection = match link.take() {
            Some(stale) if stale.connection.status().connected() => {
                debug!("Channel dropped, reopening on live connection");
                stale.connection
            }
            _ => self.open_connection().await?,
        };
        let channel = connection.create_channel().await?;

        *link = Some(Link {
            connection,
            channel: channel.clone(),
        });
        Ok(channel)
    }

    async fn open_connection(&self) -> Result<Connection, BrokerError> {
        let timeout = self.config.connect_timeout();
        trace!(host = %self.config.host, port = self.config.port, "Connecting to broker");

        match tokio::time::timeout(
            timeout,
            Connection::connect(&self.config.uri(), ConnectionProperties::default()),
        )
        .await
        {
            Ok(Ok(connection)) => {
                info!(host = %self.config.host, "Connected to broker");
                Ok(connection)
            }
            Ok(Err(err)) => Err(BrokerError::Connection(err.to_string())),
            Err(_) => Err(BrokerError::ConnectTimeout(timeout)),
        }
    }
}

/// Named work queue: survives broker restarts, shared by every worker.
fn work_queue_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        exclusive: false,
        auto_delete: false,
        ..QueueDeclareOptions::default()
    }
}

/// Server-named reply queue, private to the declaring connection.
fn reply_queue_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: false,
        exclusive: true,
        auto_delete: true,
        ..QueueDeclareOptions::default()
    }
}

fn to_properties(message: &Message) -> BasicProperties {
    let mut properties = BasicProperties::default();
    if let Some(correlation_id) = &message.correlation_id {
        properties = properties.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(reply_to) = &message.reply_to {
        properties = properties.with_reply_to(reply_to.as_str().into());
    }
    if message.persistent {
        properties = properties.with_delivery_mode(PERSISTENT);
    }
    properties
}

fn to_message(properties: &BasicProperties, body: Vec<u8>) -> Message {
    Message {
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_owned()),
        reply_to: properties
            .reply_to()
            .as_ref()
            .map(|queue| queue.as_str().to_owned()),
        persistent: *properties.delivery_mode() == Some(PERSISTENT),
        body,
    }
}

fn to_delivery(delivery: lapin::message::Delivery, auto_ack: bool) -> Delivery {
    let message = to_message(&delivery.properties, delivery.data);
    let acker = if auto_ack {
        Acker::Auto
    } else {
        Acker::Amqp(delivery.acker)
    };
    Delivery::new(message, acker)
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_work_queue(&self, name: &str) -> Result<(), BrokerError> {
        let channel = self.ensure_channel().await?;
        channel
            .queue_declare(name, work_queue_options(), FieldTable::default())
            .await?;
        Ok(())
    }

    async fn declare_reply_queue(&self) -> Result<String, BrokerError> {
        let channel = self.ensure_channel().await?;
        let queue = channel
            .queue_declare("", reply_queue_options(), FieldTable::default())
            .await?;
        Ok(queue.name().as_str().to_owned())
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<(), BrokerError> {
        let channel = self.ensure_channel().await?;
        let properties = to_properties(&message);

        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn consume_work(&self, queue: &str, prefetch: u16) -> Result<Deliveries, BrokerError> {
        let channel = self.ensure_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let consumer = channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| -> Result<Delivery, BrokerError> {
                Ok(to_delivery(delivery?, false))
            })
            .boxed())
    }

    async fn consume_replies(&self, queue: &str) -> Result<Deliveries, BrokerError> {
        let channel = self.ensure_channel().await?;
        // The reply queue name doubles as consumer tag so the consumer can be
        // cancelled by name on release.
        let consumer = channel
            .basic_consume(
                queue,
                queue,
                BasicConsumeOptions {
                    no_ack: true,
                    exclusive: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| -> Result<Delivery, BrokerError> {
                Ok(to_delivery(delivery?, true))
            })
            .boxed())
    }

    async fn release_reply_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let channel = match self.link.lock().await.as_ref() {
            Some(link) if link.channel.status().connected() => link.channel.clone(),
            // Exclusive queues die with their channel's connection.
            _ => return Ok(()),
        };
        channel
            .basic_cancel(queue, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    #[instrument(name = "amqp.close", skip(self))]
    async fn close(&self) -> Result<(), BrokerError> {
        let Some(link) = self.link.lock().await.take() else {
            return Ok(());
        };

        if link.channel.status().connected() {
            if let Err(err) = link.channel.close(REPLY_SUCCESS, "closing").await {
                warn!(error = %err, "Failed to close channel");
            }
        }
        if link.connection.status().connected() {
            link.connection.close(REPLY_SUCCESS, "closing").await?;
        }
        info!("Broker connection closed");
        Ok(())
    }
}
