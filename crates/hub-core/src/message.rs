//! Messages exchanged between hub instances over the broker.
//!
//! Every model rejects unknown fields and missing required fields, so a
//! malformed message fails to deserialize instead of yielding a half-filled
//! struct.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub type HostName = String;
pub type SiteId = String;

/// Which site owns which host, for piggyback routing purposes.
///
/// A host that is not listed belongs to the local site.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingConfig {
    pub locations: BTreeMap<HostName, SiteId>,
}

impl RoutingConfig {
    pub fn new(locations: impl IntoIterator<Item = (HostName, SiteId)>) -> Self {
        Self {
            locations: locations.into_iter().collect(),
        }
    }

    /// Site owning `host`, falling back to `own_site`.
    pub fn site_for<'a>(&'a self, host: &str, own_site: &'a str) -> &'a str {
        self.locations
            .get(host)
            .map(String::as_str)
            .unwrap_or(own_site)
    }

    /// Site data for `host` has to be forwarded to, or `None` if it stays local.
    pub fn destination<'a>(&'a self, host: &str, own_site: &str) -> Option<&'a str> {
        self.locations
            .get(host)
            .map(String::as_str)
            .filter(|site| *site != own_site)
    }
}

/// How a receiving hub treats a config message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    /// Replace the stored routing config and reload the sender.
    #[default]
    Persisted,
    /// Send the current piggyback data of the listed hosts right away.
    /// Nothing is stored.
    Oneshot,
}

/// Body of a message on the `config` queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigMessage {
    #[serde(rename = "type", default)]
    pub config_type: ConfigType,
    pub locations: BTreeMap<HostName, SiteId>,
}

impl ConfigMessage {
    pub fn persisted(config: RoutingConfig) -> Self {
        Self {
            config_type: ConfigType::Persisted,
            locations: config.locations,
        }
    }

    pub fn oneshot(config: RoutingConfig) -> Self {
        Self {
            config_type: ConfigType::Oneshot,
            locations: config.locations,
        }
    }

    pub fn into_routing_config(self) -> RoutingConfig {
        RoutingConfig {
            locations: self.locations,
        }
    }
}

/// Piggyback data relayed to the site owning the piggybacked hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PiggybackPayload {
    /// Host that collected the data.
    pub source_host: HostName,

    /// Raw agent output blocks per piggybacked host. Base64 on the wire.
    #[serde(with = "raw_blocks")]
    pub raw_data: BTreeMap<HostName, Vec<Bytes>>,

    /// Epoch seconds at which the source produced the data.
    pub message_timestamp: i64,

    /// Epoch seconds of the last successful contact with the source, if known.
    pub contact_timestamp: Option<i64>,
}

mod raw_blocks {
    use std::collections::BTreeMap;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &BTreeMap<String, Vec<Bytes>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(data.len()))?;
        for (host, blocks) in data {
            let encoded: Vec<String> = blocks.iter().map(|b| STANDARD.encode(b)).collect();
            map.serialize_entry(host, &encoded)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<Bytes>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = BTreeMap::<String, Vec<String>>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(host, blocks)| {
                let decoded = blocks
                    .iter()
                    .map(|b| {
                        STANDARD
                            .decode(b)
                            .map(Bytes::from)
                            .map_err(serde::de::Error::custom)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((host, decoded))
            })
            .collect()
    }
}
