//! What the receiving workers do with each message.
//!
//! Both handlers acknowledge only after the message had its effect, so a
//! failure leaves it on the broker for redelivery.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::mpsc;

use hub_core::message::{ConfigMessage, ConfigType, PiggybackPayload, RoutingConfig};
use hub_core::store;
use hub_services::piggyback::store_payload;
use hub_services::{Channel, ReloadSignal};

use crate::receive_worker::MessageHandler;

/// Stores piggyback data relayed from other sites.
pub struct PayloadHandler {
    root: PathBuf,
}

impl PayloadHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl MessageHandler for PayloadHandler {
    type Message = PiggybackPayload;

    async fn handle(
        &self,
        channel: &dyn Channel,
        delivery_tag: u64,
        payload: PiggybackPayload,
    ) -> anyhow::Result<()> {
        store_payload(&payload, &self.root)
            .with_context(|| format!("failed to store payload from {}", payload.source_host))?;
        channel.ack(delivery_tag).await?;
        tracing::debug!(
            source = %payload.source_host,
            hosts = payload.raw_data.len(),
            "payload stored"
        );
        Ok(())
    }
}

/// Applies routing config updates.
///
/// Persisted configs replace the stored config and raise the reload signal
/// for the sending worker. One-shot configs go straight to the sending
/// worker and leave the stored config alone.
pub struct ConfigHandler {
    root: PathBuf,
    reload: ReloadSignal,
    oneshot_tx: mpsc::Sender<RoutingConfig>,
}

impl ConfigHandler {
    pub fn new(
        root: impl Into<PathBuf>,
        reload: ReloadSignal,
        oneshot_tx: mpsc::Sender<RoutingConfig>,
    ) -> Self {
        Self {
            root: root.into(),
            reload,
            oneshot_tx,
        }
    }
}

#[async_trait]
impl MessageHandler for ConfigHandler {
    type Message = ConfigMessage;

    async fn handle(
        &self,
        channel: &dyn Channel,
        delivery_tag: u64,
        message: ConfigMessage,
    ) -> anyhow::Result<()> {
        let config_type = message.config_type;
        let config = message.into_routing_config();
        let hosts = config.locations.len();

        match config_type {
            ConfigType::Persisted => {
                store::save(&self.root, &config).context("failed to persist routing config")?;
                self.reload.set();
            }
            ConfigType::Oneshot => {
                self.oneshot_tx
                    .send(config)
                    .await
                    .map_err(|_| anyhow::anyhow!("sending worker is gone, cannot run one-shot config"))?;
            }
        }

        channel.ack(delivery_tag).await?;
        tracing::info!(?config_type, hosts, "routing config received");
        Ok(())
    }
}
