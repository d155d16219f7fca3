//! Broker connection and queue subscription.
//!
//! The consumer is registered with automatic acknowledgement: the broker
//! considers a notification consumed the moment it is delivered, before
//! the controller has looked at it.  A notification whose handling fails,
//! or that is in flight when the process dies, is lost and never
//! redelivered.  Record creation and removal are idempotent, so the
//! missing retry only ever leaves DNS stale until the next update for the
//! same address.  Switching to manual acks changes these delivery
//! semantics to at-least-once and is not a drop-in change.

use amqprs::callbacks::{DefaultChannelCallback, DefaultConnectionCallback};
use amqprs::channel::{BasicConsumeArguments, Channel, ConsumerMessage, QueueDeclareArguments};
use amqprs::connection::{Connection, OpenConnectionArguments};
use amqprs::tls::TlsAdaptor;
use async_trait::async_trait;
use log::{info, warn};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::{split_host_port, AmqpConfig};
use crate::error::BrokerError;
use crate::tls::TlsSettings;

/// Queue Neutron publishes its info notifications to.
pub const QUEUE_NAME: &str = "notifications.info";

/// Tag the consumer registers under.
pub const CONSUMER_TAG: &str = "coredns-record-creator";

const AMQP_PORT: u16 = 5672;
const AMQPS_PORT: u16 = 5671;

/// Broker endpoint parsed from `host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    /// Parses `addr`, defaulting the port by scheme when none is given.
    pub fn parse(addr: &str, secure: bool) -> Result<Self, BrokerError> {
        let (host, port) = split_host_port(addr);
        if host.is_empty() {
            return Err(BrokerError::InvalidAddress(addr.to_string()));
        }
        let port = match port {
            Some(p) => p
                .parse()
                .map_err(|_| BrokerError::InvalidAddress(addr.to_string()))?,
            None if secure => AMQPS_PORT,
            None => AMQP_PORT,
        };
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// `amqp[s]://user:<redacted>@host:port/`, for logging.
pub fn connection_uri(user: &str, address: &BrokerAddress, secure: bool) -> String {
    let scheme = if secure { "amqps" } else { "amqp" };
    let host = if address.host.contains(':') {
        format!("[{}]", address.host)
    } else {
        address.host.clone()
    };
    format!("{}://{}:<redacted>@{}:{}/", scheme, user, host, address.port)
}

/// A source of raw notification bodies.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery body, or `None` once the stream is closed.
    async fn next_body(&mut self) -> Option<Vec<u8>>;
}

/// Deliveries of the registered consumer.
pub struct Deliveries {
    rx: UnboundedReceiver<ConsumerMessage>,
}

#[async_trait]
impl DeliveryStream for Deliveries {
    async fn next_body(&mut self) -> Option<Vec<u8>> {
        while let Some(msg) = self.rx.recv().await {
            match msg.content {
                Some(body) => return Some(body),
                None => warn!("Skipping delivery without content body"),
            }
        }
        None
    }
}

/// An open connection with one channel consuming [`QUEUE_NAME`].
pub struct BrokerSession {
    connection: Connection,
    channel: Channel,
}

impl BrokerSession {
    /// Connects, declares the queue and registers the auto-ack consumer.
    /// Any failure here is fatal to startup.
    pub async fn open(
        config: &AmqpConfig,
        tls: Option<TlsSettings>,
    ) -> Result<(Self, Deliveries), BrokerError> {
        let secure = tls.is_some();
        let address = BrokerAddress::parse(&config.host, secure)?;
        info!(
            "Connecting to {}",
            connection_uri(&config.user, &address, secure)
        );

        let mut args =
            OpenConnectionArguments::new(&address.host, address.port, &config.user, &config.pass);
        if let Some(tls) = tls {
            info!(
                "Using mutual TLS, expecting broker identity {}",
                tls.server_identity()
            );
            args.tls_adaptor(TlsAdaptor::new(
                tls.connector(),
                tls.server_host().to_string(),
            ));
        }

        let connection = Connection::open(&args).await?;
        connection
            .register_callback(DefaultConnectionCallback)
            .await?;

        let channel = connection.open_channel(None).await?;
        channel.register_callback(DefaultChannelCallback).await?;

        // new() leaves durable, exclusive and auto_delete unset, no arguments
        let (queue, _, _) = channel
            .queue_declare(QueueDeclareArguments::new(QUEUE_NAME))
            .await?
            .ok_or_else(|| BrokerError::QueueNotDeclared(QUEUE_NAME.to_string()))?;

        let consume = BasicConsumeArguments::new(&queue, CONSUMER_TAG)
            .manual_ack(false)
            .finish();
        let (consumer_tag, rx) = channel.basic_consume_rx(consume).await?;
        info!("Consuming '{}' as '{}'", queue, consumer_tag);

        Ok((
            Self {
                connection,
                channel,
            },
            Deliveries { rx },
        ))
    }

    /// Closes the channel, then the connection.
    pub async fn close(self) {
        if let Err(e) = self.channel.close().await {
            warn!("Error closing amqp channel: {}", e);
        }
        if let Err(e) = self.connection.close().await {
            warn!("Error closing amqp connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_address_with_port() {
        let addr = BrokerAddress::parse("rabbit.example.com:5673", false).unwrap();
        assert_eq!(addr.host, "rabbit.example.com");
        assert_eq!(addr.port, 5673);
    }

    #[test]
    fn default_port_follows_scheme() {
        assert_eq!(BrokerAddress::parse("rabbit", false).unwrap().port, 5672);
        assert_eq!(BrokerAddress::parse("rabbit", true).unwrap().port, 5671);
        assert_eq!(BrokerAddress::parse("[fd00::5]", true).unwrap().host, "fd00::5");
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(matches!(
            BrokerAddress::parse("", false),
            Err(BrokerError::InvalidAddress(_))
        ));
        assert!(matches!(
            BrokerAddress::parse("rabbit:amqp", false),
            Err(BrokerError::InvalidAddress(_))
        ));
    }

    #[test]
    fn uri_embeds_user_and_hides_password() {
        let addr = BrokerAddress::parse("rabbit:5671", true).unwrap();
        assert_eq!(
            connection_uri("nova", &addr, true),
            "amqps://nova:<redacted>@rabbit:5671/"
        );
        let addr = BrokerAddress::parse("[fd00::5]:5672", false).unwrap();
        assert_eq!(
            connection_uri("nova", &addr, false),
            "amqp://nova:<redacted>@[fd00::5]:5672/"
        );
    }
}
