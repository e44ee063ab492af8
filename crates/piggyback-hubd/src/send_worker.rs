//! Sending worker: forwards locally produced piggyback data to the site
//! that monitors the piggybacked host.
//!
//! Messages come from the piggyback watcher. Before each one, a pending
//! reload is honoured by re-reading the routing config from disk. A message
//! whose publish fails with a broker error stays at the head of the queue
//! and is retried on the next connection, after the backoff delay, before
//! anything newer is sent.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{broadcast, mpsc};

use hub_core::message::{RoutingConfig, SiteId};
use hub_core::{store, RetryPolicy};
use hub_services::piggyback::get_messages_for;
use hub_services::{BrokerError, Channel, Connector, CrashReporter, PiggybackMessage, ReloadSignal};

use crate::connect::{connect_with_retry, Backoff};
use crate::PAYLOAD_QUEUE;

const NAME: &str = "sender";

#[derive(Debug)]
struct Outgoing {
    site: SiteId,
    message: PiggybackMessage,
}

pub struct SendingWorker {
    root: PathBuf,
    site: SiteId,
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    reload: ReloadSignal,
    crash: Arc<dyn CrashReporter>,
    messages: mpsc::Receiver<PiggybackMessage>,
    oneshots: mpsc::Receiver<RoutingConfig>,
    shutdown: broadcast::Receiver<()>,
    config: RoutingConfig,
    pending: VecDeque<Outgoing>,
}

impl SendingWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: impl Into<PathBuf>,
        site: impl Into<SiteId>,
        connector: Arc<dyn Connector>,
        retry: RetryPolicy,
        reload: ReloadSignal,
        crash: Arc<dyn CrashReporter>,
        messages: mpsc::Receiver<PiggybackMessage>,
        oneshots: mpsc::Receiver<RoutingConfig>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            root: root.into(),
            site: site.into(),
            connector,
            backoff: Backoff::new(retry),
            reload,
            crash,
            messages,
            oneshots,
            shutdown,
            config: RoutingConfig::default(),
            pending: VecDeque::new(),
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        match self.serve().await {
            Ok(()) => {
                tracing::info!(worker = NAME, "sending worker shutting down");
                Ok(())
            }
            Err(e) => {
                tracing::error!(worker = NAME, error = %format!("{e:#}"), "sending worker failed");
                self.crash.report(NAME, &e);
                Err(e)
            }
        }
    }

    // Ok(()) only on shutdown.
    async fn serve(&mut self) -> anyhow::Result<()> {
        self.load_config()?;
        let Some(mut channel) = self.connect().await else {
            return Ok(());
        };
        let mut oneshots_open = true;

        loop {
            if self.pending.is_empty() {
                tokio::select! {
                    _ = self.shutdown.recv() => return Ok(()),

                    message = self.messages.recv() => {
                        let message = message.context("piggyback message source closed")?;
                        if self.reload.take() {
                            self.load_config()?;
                        }
                        self.route(message);
                    }

                    config = self.oneshots.recv(), if oneshots_open => match config {
                        Some(config) => self.queue_oneshot(&config)?,
                        None => oneshots_open = false,
                    },
                }
            }

            let Some(outgoing) = self.pending.front() else {
                continue;
            };
            match send(channel.as_ref(), outgoing).await {
                Ok(()) => {
                    self.pending.pop_front();
                    self.backoff.reset();
                }
                Err(e) if BrokerError::is_in(&e) => {
                    tracing::warn!(
                        worker = NAME,
                        error = %format!("{e:#}"),
                        pending = self.pending.len(),
                        retry_in_secs = self.backoff.next_delay().as_secs_f32(),
                        "publish failed, reconnecting"
                    );
                    if !self.backoff.pause(&mut self.shutdown).await {
                        return Ok(());
                    }
                    match self.connect().await {
                        Some(reconnected) => channel = reconnected,
                        None => return Ok(()),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn connect(&mut self) -> Option<Arc<dyn Channel>> {
        connect_with_retry(self.connector.as_ref(), &mut self.backoff, NAME, &mut self.shutdown).await
    }

    fn load_config(&mut self) -> anyhow::Result<()> {
        self.config = store::load_for_site(&self.root).context("failed to load routing config")?;
        tracing::info!(
            worker = NAME,
            hosts = self.config.locations.len(),
            "routing config loaded"
        );
        Ok(())
    }

    fn route(&mut self, message: PiggybackMessage) {
        match self.config.destination(&message.meta.piggybacked, &self.site) {
            Some(site) => self.pending.push_back(Outgoing {
                site: site.to_string(),
                message,
            }),
            None => tracing::trace!(
                piggybacked = %message.meta.piggybacked,
                "piggybacked host is local"
            ),
        }
    }

    fn queue_oneshot(&mut self, config: &RoutingConfig) -> anyhow::Result<()> {
        let before = self.pending.len();
        for (host, site) in &config.locations {
            if *site == self.site {
                continue;
            }
            let messages = get_messages_for(host, &self.root)
                .with_context(|| format!("failed to read piggyback data for {host}"))?;
            self.pending.extend(messages.into_iter().map(|message| Outgoing {
                site: site.clone(),
                message,
            }));
        }
        tracing::info!(
            worker = NAME,
            hosts = config.locations.len(),
            messages = self.pending.len() - before,
            "one-shot config queued"
        );
        Ok(())
    }
}

async fn send(channel: &dyn Channel, outgoing: &Outgoing) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&outgoing.message.to_payload())
        .context("failed to encode piggyback payload")?;
    channel.publish_for_site(&outgoing.site, PAYLOAD_QUEUE, &body).await?;
    tracing::debug!(
        site = %outgoing.site,
        source = %outgoing.message.meta.source,
        piggybacked = %outgoing.message.meta.piggybacked,
        "piggyback data sent"
    );
    Ok(())
}
