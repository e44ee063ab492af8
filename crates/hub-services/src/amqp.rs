//! RabbitMQ implementation of the broker traits.
//!
//! Every [`AmqpConnector::connect`] re-reads the site certificates from
//! `etc/rabbitmq/ssl`, since they may have been rotated since the last
//! attempt. Authentication is by client certificate (SASL EXTERNAL); the
//! PEM pair is bundled into an in-memory PKCS#12 identity for native-tls.
//!
//! Channels run in confirm mode, so a publish returns only once the broker
//! has taken responsibility for the message.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Connection, ConnectionProperties};
use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::stack::Stack;
use openssl::x509::X509;

use hub_core::paths::{broker_ssl_dir, site_conf_path};
use hub_core::settings::BrokerSettings;

use crate::broker::{
    intersite_routing_key, local_routing_key, BrokerError, Channel, Connector, Deliveries,
    Delivery, QueueSpec, INTERSITE_EXCHANGE, LOCAL_EXCHANGE,
};

/// Used when neither the settings nor site.conf name a port.
pub const DEFAULT_PORT: u16 = 5671;

const HEARTBEAT_SECS: u16 = 30;

/// Protects the PKCS#12 bundle, which never leaves the process.
const IDENTITY_PASSWORD: &str = "piggyback-hub";

/// Opens TLS connections to the site broker on behalf of one app.
pub struct AmqpConnector {
    app: String,
    root: PathBuf,
    site: String,
    host: String,
    port: Option<u16>,
}

impl AmqpConnector {
    pub fn new(root: impl Into<PathBuf>, site: impl Into<String>, broker: &BrokerSettings) -> Self {
        Self {
            app: broker.app.clone(),
            root: root.into(),
            site: site.into(),
            host: broker.host.clone(),
            port: broker.port,
        }
    }

    fn uri(&self) -> String {
        let port = self.port.unwrap_or_else(|| site_broker_port(&self.root));
        format!(
            "amqps://{}:{port}/%2f?auth_mechanism=external&heartbeat={HEARTBEAT_SECS}",
            self.host
        )
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let tls = SiteCertificates::load(&self.root)?.into_tls_config()?;
        let uri = self.uri();
        let properties = ConnectionProperties::default()
            .with_connection_name(format!("{}@{}", self.app, self.site).into());

        let connection = Connection::connect_with_config(&uri, properties, tls)
            .await
            .map_err(|e| classify_connect_error(&uri, &e))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to open channel: {e}")))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to enable confirms: {e}")))?;

        tracing::debug!(app = %self.app, site = %self.site, "broker connection established");

        Ok(Arc::new(AmqpChannel {
            _connection: connection,
            channel,
            app: self.app.clone(),
        }))
    }
}

/// A lapin channel plus the connection keeping it alive.
pub struct AmqpChannel {
    _connection: Connection,
    channel: lapin::Channel,
    app: String,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn queue_declare(&self, queue: &QueueSpec) -> Result<(), BrokerError> {
        let name = queue.full_name(&self.app);
        let mut arguments = FieldTable::default();
        if let Some(ttl) = queue.ttl {
            let millis = u32::try_from(ttl.as_millis()).unwrap_or(u32::MAX);
            arguments.insert("x-message-ttl".into(), AMQPValue::LongUInt(millis));
        }

        self.channel
            .queue_declare(
                &name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await
            .map_err(|e| connection_error("queue declare", &name, e))?;

        self.channel
            .queue_bind(
                &name,
                LOCAL_EXCHANGE,
                &queue.binding_key(&self.app),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| connection_error("queue bind", &name, e))?;

        Ok(())
    }

    async fn consume(&self, queue: &QueueSpec) -> Result<Deliveries, BrokerError> {
        let name = queue.full_name(&self.app);
        let consumer = self
            .channel
            .basic_consume(
                &name,
                &format!("{}.{}", self.app, queue.name),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| connection_error("consume", &name, e))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|d| Delivery {
                        delivery_tag: d.delivery_tag,
                        body: d.data,
                    })
                    .map_err(|e| BrokerError::Connection(format!("delivery failed: {e}")))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("ack {delivery_tag} failed: {e}")))
    }

    async fn publish_for_site(
        &self,
        site: &str,
        routing: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let key = intersite_routing_key(site, &self.app, routing);
        self.publish(INTERSITE_EXCHANGE, &key, body).await
    }

    async fn publish_locally(&self, routing: &str, body: &[u8]) -> Result<(), BrokerError> {
        let key = local_routing_key(&self.app, routing);
        self.publish(LOCAL_EXCHANGE, &key, body).await
    }
}

impl AmqpChannel {
    async fn publish(&self, exchange: &str, key: &str, body: &[u8]) -> Result<(), BrokerError> {
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| connection_error("publish", key, e))?
            .await
            .map_err(|e| connection_error("publish confirm", key, e))?;
        check_confirmation(&confirmation, key)?;
        tracing::trace!(exchange, routing_key = key, bytes = body.len(), "published");
        Ok(())
    }
}

fn connection_error(operation: &str, target: &str, e: lapin::Error) -> BrokerError {
    BrokerError::Connection(format!("{operation} {target}: {e}"))
}

/// A nacked publish was not taken over by the broker and must be retried.
fn check_confirmation(confirmation: &Confirmation, key: &str) -> Result<(), BrokerError> {
    match confirmation {
        Confirmation::Nack(_) => Err(BrokerError::Connection(format!(
            "publish {key}: rejected by broker"
        ))),
        _ => Ok(()),
    }
}

fn classify_connect_error(uri: &str, e: &lapin::Error) -> BrokerError {
    if is_tls_failure(e) {
        BrokerError::Certificate(format!("{uri}: {e}"))
    } else {
        BrokerError::Connection(format!("{uri}: {e}"))
    }
}

/// True if anything in the error chain reports a TLS handshake or
/// certificate problem.
fn is_tls_failure(error: &(dyn std::error::Error + 'static)) -> bool {
    const MARKERS: [&str; 4] = ["certificate", "handshake", "ssl", "tls"];

    let mut current = Some(error);
    while let Some(e) = current {
        let text = e.to_string().to_ascii_lowercase();
        if MARKERS.iter().any(|m| text.contains(m)) {
            return true;
        }
        current = e.source();
    }
    false
}

// ── Certificates ──────────────────────────────────────────────────────────────

/// PEM material read from `etc/rabbitmq/ssl`.
#[derive(Debug)]
pub struct SiteCertificates {
    pub trusted_cas: String,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl SiteCertificates {
    pub fn load(root: &Path) -> Result<Self, BrokerError> {
        let dir = broker_ssl_dir(root);
        let trusted_cas = String::from_utf8(read_pem(&dir.join("trusted_cas.pem"))?)
            .map_err(|_| BrokerError::Certificate("trusted_cas.pem is not valid UTF-8".into()))?;
        Ok(Self {
            trusted_cas,
            cert: read_pem(&dir.join("cert.pem"))?,
            key: read_pem(&dir.join("key.pem"))?,
        })
    }

    /// Bundle key and certificate chain into a PKCS#12 client identity.
    pub fn into_tls_config(self) -> Result<OwnedTLSConfig, BrokerError> {
        let invalid = |what: &str, e: openssl::error::ErrorStack| {
            BrokerError::Certificate(format!("{what}: {e}"))
        };

        if X509::stack_from_pem(self.trusted_cas.as_bytes())
            .map_err(|e| invalid("trusted_cas.pem", e))?
            .is_empty()
        {
            return Err(BrokerError::Certificate("trusted_cas.pem: no certificates".into()));
        }

        let mut chain = X509::stack_from_pem(&self.cert)
            .map_err(|e| invalid("cert.pem", e))?
            .into_iter();
        let cert = chain
            .next()
            .ok_or_else(|| BrokerError::Certificate("cert.pem: no certificate".into()))?;
        let pkey = PKey::private_key_from_pem(&self.key).map_err(|e| invalid("key.pem", e))?;

        let mut builder = Pkcs12::builder();
        builder.name("piggyback-hub").pkey(&pkey).cert(&cert);
        let intermediates: Vec<X509> = chain.collect();
        if !intermediates.is_empty() {
            let mut stack = Stack::new().map_err(|e| invalid("cert.pem", e))?;
            for ca in intermediates {
                stack.push(ca).map_err(|e| invalid("cert.pem", e))?;
            }
            builder.ca(stack);
        }
        let der = builder
            .build2(IDENTITY_PASSWORD)
            .and_then(|bundle| bundle.to_der())
            .map_err(|e| invalid("client identity", e))?;

        Ok(OwnedTLSConfig {
            identity: Some(OwnedIdentity {
                der,
                password: IDENTITY_PASSWORD.to_string(),
            }),
            cert_chain: Some(self.trusted_cas),
        })
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, BrokerError> {
    let data = std::fs::read(path)
        .map_err(|e| BrokerError::Certificate(format!("{}: {e}", path.display())))?;
    if data.iter().all(u8::is_ascii_whitespace) {
        return Err(BrokerError::Certificate(format!("{}: empty", path.display())));
    }
    Ok(data)
}

// ── Port ──────────────────────────────────────────────────────────────────────

/// Broker port from `CONFIG_RABBITMQ_PORT` in site.conf, else [`DEFAULT_PORT`].
pub fn site_broker_port(root: &Path) -> u16 {
    std::fs::read_to_string(site_conf_path(root))
        .ok()
        .and_then(|text| parse_site_conf(&text).get("CONFIG_RABBITMQ_PORT")?.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

/// `KEY='value'` lines as written by `omd config`.
fn parse_site_conf(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once('=')?;
            let value = value.trim().trim_matches(|c| c == '\'' || c == '"');
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}
