//! Broker access as seen by the hub workers.
//!
//! Workers only talk to these traits. [`crate::amqp`] implements them on top
//! of RabbitMQ; [`crate::memory`] implements them in-process for tests.
//!
//! Naming follows the site messaging layout:
//! - our queues are `cmk.app.<app>.<queue>`, bound to `cmk.local` with
//!   routing key `<app>.<queue>`
//! - messages for another site go to `cmk.intersite` with routing key
//!   `<site>.<app>.<routing>`; the broker's `<site>.#` bindings carry them
//!   over to that site

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub const LOCAL_EXCHANGE: &str = "cmk.local";
pub const INTERSITE_EXCHANGE: &str = "cmk.intersite";

/// Every broker failure is worth a reconnect: certificates may be in the
/// middle of a rotation, the broker may be restarting.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("certificate problem: {0}")]
    Certificate(String),
    #[error("broker connection failed: {0}")]
    Connection(String),
}

impl BrokerError {
    /// Whether `error` (anywhere in its chain) is a broker failure.
    pub fn is_in(error: &anyhow::Error) -> bool {
        error.chain().any(|cause| cause.is::<BrokerError>())
    }
}

/// A queue the hub consumes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Short name, e.g. `payload`. Also the binding routing suffix.
    pub name: String,
    /// Message TTL. None = never expire.
    pub ttl: Option<Duration>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            ttl,
        }
    }

    /// Full broker-side queue name for `app`.
    pub fn full_name(&self, app: &str) -> String {
        format!("cmk.app.{app}.{}", self.name)
    }

    /// Routing key binding this queue to [`LOCAL_EXCHANGE`].
    pub fn binding_key(&self, app: &str) -> String {
        local_routing_key(app, &self.name)
    }
}

pub fn local_routing_key(app: &str, routing: &str) -> String {
    format!("{app}.{routing}")
}

pub fn intersite_routing_key(site: &str, app: &str, routing: &str) -> String {
    format!("{site}.{app}.{routing}")
}

/// One message handed out by [`Channel::consume`]. Not acknowledged yet.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
}

/// Stream of deliveries. Ends, or yields an error, when the connection drops.
pub type Deliveries = BoxStream<'static, Result<Delivery, BrokerError>>;

/// An open channel on a broker connection.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare `queue` and bind it for local delivery.
    async fn queue_declare(&self, queue: &QueueSpec) -> Result<(), BrokerError>;

    /// Start consuming `queue` with manual acknowledgement.
    async fn consume(&self, queue: &QueueSpec) -> Result<Deliveries, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Publish `body` to our own app on another site.
    async fn publish_for_site(
        &self,
        site: &str,
        routing: &str,
        body: &[u8],
    ) -> Result<(), BrokerError>;

    /// Publish `body` to our own app on this site.
    async fn publish_locally(&self, routing: &str, body: &[u8]) -> Result<(), BrokerError>;
}

/// Single connection attempt. Callers own the retry loop.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Channel>, BrokerError>;
}
