use std::time::Duration;

use clap::Args;

/// Connection settings for the AMQP broker.
#[derive(Args, Clone, Debug, PartialEq)]
pub struct BrokerConfig {
    #[arg(long = "rabbitmq-host", env = "RABBITMQ_HOST", default_value = "localhost")]
    pub host: String,

    #[arg(long = "rabbitmq-port", env = "RABBITMQ_PORT", default_value = "5672")]
    pub port: u16,

    #[arg(long = "rabbitmq-user", env = "RABBITMQ_USER", default_value = "guest")]
    pub user: String,

    #[arg(
        long = "rabbitmq-password",
        env = "RABBITMQ_PASSWORD",
        default_value = "guest",
        hide_env_values = true
    )]
    pub password: String,

    #[arg(long = "rabbitmq-vhost", env = "RABBITMQ_VHOST", default_value = "/")]
    pub vhost: String,

    #[arg(
        long = "rabbitmq-connection-timeout",
        env = "RABBITMQ_CONNECTION_TIMEOUT",
        help = "Seconds to wait for the broker before giving up",
        default_value = "10.0"
    )]
    pub connection_timeout: f64,

    #[arg(
        long = "rabbitmq-heartbeat",
        env = "RABBITMQ_HEARTBEAT",
        help = "Heartbeat interval in seconds",
        default_value = "60"
    )]
    pub heartbeat: u16,
}

impl BrokerConfig {
    /// AMQP URI for this configuration. Credentials and vhost are
    /// percent-encoded, so the default vhost `/` becomes `%2F`.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}",
            urlencoding::encode(&self.user),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost),
            self.heartbeat
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connection_timeout.max(0.0))
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: "localhost".into(),
            port: 5672,
            user: "guest".into(),
            password: "guest".into(),
            vhost: "/".into(),
            connection_timeout: 10.0,
            heartbeat: 60,
        }
    }
}

/// Work queue names and the RPC deadline.
#[derive(Args, Clone, Debug, PartialEq)]
pub struct QueueConfig {
    #[arg(long = "image-queue", env = "RABBITMQ_IMAGE_QUEUE", default_value = "image_fetch_queue")]
    pub image_queue: String,

    #[arg(long = "upload-queue", env = "RABBITMQ_UPLOAD_QUEUE", default_value = "image_upload_queue")]
    pub upload_queue: String,

    #[arg(
        long = "rpc-timeout",
        env = "RABBITMQ_RPC_TIMEOUT",
        help = "Seconds to wait for a worker reply",
        default_value = "30"
    )]
    pub rpc_timeout: u64,
}

impl QueueConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            image_queue: "image_fetch_queue".into(),
            upload_queue: "image_upload_queue".into(),
            rpc_timeout: 30,
        }
    }
}
