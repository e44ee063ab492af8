//! Pushing routing configs to sites.
//!
//! Each site gets its own config message on its `config` queue: our own
//! site through the local exchange, every other site through the intersite
//! exchange.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;

use hub_core::message::{ConfigMessage, RoutingConfig, SiteId};
use hub_services::Channel;

use crate::CONFIG_QUEUE;

/// Routing configs to distribute, keyed by destination site.
pub type SiteConfigs = BTreeMap<SiteId, RoutingConfig>;

/// Read `{<site>: {"locations": {...}}, ...}` from `path`.
pub fn read_site_configs(path: &Path) -> anyhow::Result<SiteConfigs> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

/// Publish one config message per site. Returns the sites in publish order.
pub async fn distribute(
    channel: &dyn Channel,
    own_site: &str,
    configs: &SiteConfigs,
    oneshot: bool,
) -> anyhow::Result<Vec<SiteId>> {
    let mut sent = Vec::with_capacity(configs.len());
    for (site, config) in configs {
        let message = if oneshot {
            ConfigMessage::oneshot(config.clone())
        } else {
            ConfigMessage::persisted(config.clone())
        };
        let body = serde_json::to_vec(&message).context("failed to encode config message")?;

        if site == own_site {
            channel.publish_locally(CONFIG_QUEUE, &body).await
        } else {
            channel.publish_for_site(site, CONFIG_QUEUE, &body).await
        }
        .with_context(|| format!("failed to send routing config to {site}"))?;

        tracing::info!(%site, hosts = config.locations.len(), oneshot, "routing config sent");
        sent.push(site.clone());
    }
    Ok(sent)
}
