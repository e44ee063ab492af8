//! Multi-site harness.
//!
//! Every site gets its own root directory and its own in-memory broker. A
//! background pump plays the intersite federation: whatever a site
//! publishes for another site lands on that site's queue, local publishes
//! land on the publisher's own queue.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use hub_core::message::RoutingConfig;
use hub_core::{store, HubSettings};
use hub_services::memory::MemoryBroker;
use hub_services::piggyback::{get_messages_for, store_piggyback_raw_data};
use hub_services::{Connector, CrashReportStore, PiggybackMessage};
use piggyback_hubd::distribute::{distribute, SiteConfigs};
use piggyback_hubd::supervisor::Hub;
pub use piggyback_hubd::supervisor::HubExit;
use piggyback_hubd::{CONFIG_QUEUE, PAYLOAD_QUEUE};

pub const WAIT: Duration = Duration::from_secs(10);

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn routing(pairs: &[(&str, &str)]) -> RoutingConfig {
    RoutingConfig::new(pairs.iter().map(|(h, s)| (h.to_string(), s.to_string())))
}

fn fast_settings() -> HubSettings {
    let mut settings = HubSettings::default();
    settings.retry.short_interval_secs = 0;
    settings.retry.long_interval_secs = 0;
    settings.watcher.rescan_interval_ms = 2_000;
    settings.supervisor.shutdown_grace_secs = 2;
    settings
}

pub struct Site {
    pub name: String,
    pub root: tempfile::TempDir,
    pub broker: MemoryBroker,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<HubExit>>,
}

impl Site {
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Store piggyback data as the local fetcher would.
    pub fn store_piggyback(&self, source: &str, host: &str, data: &str, timestamp: i64) {
        let raw = BTreeMap::from([(host.to_string(), vec![Bytes::from(data.to_string())])]);
        store_piggyback_raw_data(source, &raw, timestamp, Some(timestamp), self.root()).unwrap();
    }

    pub fn messages_for(&self, host: &str) -> Vec<PiggybackMessage> {
        get_messages_for(host, self.root()).unwrap()
    }

    pub fn routing_config(&self) -> RoutingConfig {
        store::load_for_site(self.root()).unwrap()
    }

    /// Payloads this site published, as (destination site, piggybacked host).
    pub fn sent_payloads(&self) -> Vec<(String, String)> {
        self.broker
            .published()
            .iter()
            .filter(|p| p.routing == PAYLOAD_QUEUE)
            .map(|p| {
                let payload: hub_core::PiggybackPayload = p.json().unwrap();
                let host = payload.raw_data.keys().next().cloned().unwrap_or_default();
                (p.site.clone().unwrap_or_default(), host)
            })
            .collect()
    }

    pub fn crash_reports(&self) -> usize {
        std::fs::read_dir(hub_core::paths::crash_dir(self.root()))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    /// Whether both receiving workers are consuming.
    pub fn is_up(&self) -> bool {
        self.broker.is_consuming(PAYLOAD_QUEUE) && self.broker.is_consuming(CONFIG_QUEUE)
    }
}

pub struct Network {
    sites: HashMap<String, Site>,
    pump: JoinHandle<()>,
}

impl Network {
    pub fn new(names: &[&str]) -> Self {
        let sites: HashMap<String, Site> = names
            .iter()
            .map(|name| {
                let site = Site {
                    name: name.to_string(),
                    root: tempfile::tempdir().unwrap(),
                    broker: MemoryBroker::new(),
                    stop: None,
                    task: None,
                };
                (name.to_string(), site)
            })
            .collect();

        let brokers: HashMap<String, MemoryBroker> = sites
            .iter()
            .map(|(name, site)| (name.clone(), site.broker.clone()))
            .collect();
        let pump = tokio::spawn(pump(brokers));

        Self { sites, pump }
    }

    pub fn site(&self, name: &str) -> &Site {
        &self.sites[name]
    }

    /// Start the hub of `name` and wait until it consumes both queues.
    pub async fn start(&mut self, name: &str) {
        self.launch(name);
        let site = &self.sites[name];
        assert!(wait_until(WAIT, || site.is_up()).await, "{name} did not come up");
        // Let the watcher take its initial inventory.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Start the hub of `name` without waiting for it.
    pub fn launch(&mut self, name: &str) {
        let site = self.sites.get_mut(name).unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let hub = Hub {
            root: site.root.path().to_path_buf(),
            site: site.name.clone(),
            settings: fast_settings(),
            connector: Arc::new(site.broker.clone()),
            crash: Arc::new(CrashReportStore::new(site.root.path())),
        };
        site.task = Some(tokio::spawn(hub.run(async {
            let _ = stop_rx.await;
        })));
        site.stop = Some(stop_tx);
    }

    /// Terminate the hub of `name` and return how it ended.
    pub async fn stop(&mut self, name: &str) -> HubExit {
        let site = self.sites.get_mut(name).unwrap();
        if let Some(stop) = site.stop.take() {
            let _ = stop.send(());
        }
        self.exit_of(name).await
    }

    /// Wait for the hub of `name` to end.
    pub async fn exit_of(&mut self, name: &str) -> HubExit {
        let site = self.sites.get_mut(name).unwrap();
        let task = site.task.take().expect("hub not running");
        tokio::time::timeout(WAIT, task)
            .await
            .expect("hub did not stop")
            .unwrap()
    }

    /// Send routing configs through the broker of `from`, as the operator CLI does.
    pub async fn distribute(&self, from: &str, configs: &[(&str, RoutingConfig)], oneshot: bool) {
        let configs: SiteConfigs = configs
            .iter()
            .map(|(site, config)| (site.to_string(), config.clone()))
            .collect();
        let channel = self.site(from).broker.connect().await.unwrap();
        distribute(channel.as_ref(), from, &configs, oneshot).await.unwrap();
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.pump.abort();
        for site in self.sites.values() {
            if let Some(task) = &site.task {
                task.abort();
            }
        }
    }
}

async fn pump(brokers: HashMap<String, MemoryBroker>) {
    let mut forwarded: HashMap<String, usize> = HashMap::new();
    loop {
        for (name, broker) in &brokers {
            let published = broker.published();
            let done = forwarded.entry(name.clone()).or_default();
            for message in &published[*done..] {
                let destination = message.site.as_deref().unwrap_or(name);
                if let Some(target) = brokers.get(destination) {
                    target.deliver(&message.routing, message.body.clone());
                }
            }
            *done = published.len();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
