//! Receiving worker: consumes one queue forever, across broker outages.
//!
//! Broker errors (connect, consume, ack) send the worker back to the
//! connect-retry loop after the backoff delay; the broker redelivers
//! whatever was not acknowledged.
//! Any other error, including a message that does not deserialize, is
//! fatal: it is crash-reported and returned to the supervisor.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use hub_core::RetryPolicy;
use hub_services::{BrokerError, Channel, Connector, CrashReporter, QueueSpec};

use crate::connect::{connect_with_retry, Backoff};

/// Processes one typed message. Responsible for acknowledging it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    type Message: DeserializeOwned + Send;

    async fn handle(
        &self,
        channel: &dyn Channel,
        delivery_tag: u64,
        message: Self::Message,
    ) -> anyhow::Result<()>;
}

pub struct ReceivingWorker<H> {
    name: &'static str,
    queue: QueueSpec,
    connector: Arc<dyn Connector>,
    handler: H,
    backoff: Backoff,
    crash: Arc<dyn CrashReporter>,
    shutdown: broadcast::Receiver<()>,
}

impl<H: MessageHandler> ReceivingWorker<H> {
    pub fn new(
        name: &'static str,
        queue: QueueSpec,
        connector: Arc<dyn Connector>,
        handler: H,
        retry: RetryPolicy,
        crash: Arc<dyn CrashReporter>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name,
            queue,
            connector,
            handler,
            backoff: Backoff::new(retry),
            crash,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            let Some(channel) = connect_with_retry(
                self.connector.as_ref(),
                &mut self.backoff,
                self.name,
                &mut self.shutdown,
            )
            .await
            else {
                break;
            };

            match self.consume(channel).await {
                Ok(()) => break,
                Err(e) if BrokerError::is_in(&e) => {
                    tracing::warn!(
                        worker = self.name,
                        error = %format!("{e:#}"),
                        retry_in_secs = self.backoff.next_delay().as_secs_f32(),
                        "lost broker connection, reconnecting"
                    );
                    if !self.backoff.pause(&mut self.shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        worker = self.name,
                        error = %format!("{e:#}"),
                        "receiving worker failed"
                    );
                    self.crash.report(self.name, &e);
                    return Err(e);
                }
            }
        }

        tracing::info!(worker = self.name, "receiving worker shutting down");
        Ok(())
    }

    // Ok(()) only on shutdown.
    async fn consume(&mut self, channel: Arc<dyn Channel>) -> anyhow::Result<()> {
        channel.queue_declare(&self.queue).await?;
        let mut deliveries = channel.consume(&self.queue).await?;
        tracing::info!(worker = self.name, queue = %self.queue.name, "consuming");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => return Ok(()),

                delivery = deliveries.next() => {
                    let delivery = match delivery {
                        Some(delivery) => delivery?,
                        None => {
                            return Err(BrokerError::Connection("consumer cancelled".into()).into())
                        }
                    };
                    let message: H::Message = serde_json::from_slice(&delivery.body)
                        .with_context(|| format!("malformed message on queue {}", self.queue.name))?;
                    self.handler
                        .handle(channel.as_ref(), delivery.delivery_tag, message)
                        .await?;
                    self.backoff.reset();
                }
            }
        }
    }
}
