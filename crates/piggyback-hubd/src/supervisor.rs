//! Runs the three workers and decides when the hub is done.
//!
//! Workers are tasks with their own `JoinHandle`; the supervisor waits on
//! all of them and on the termination future at once. A worker that ends
//! on its own, with or without an error, takes the hub down: the others are
//! aborted, and gone by the time the hub returns, and the exit code is 1. Termination broadcasts shutdown, gives
//! the workers `shutdown_grace` to stop, and exits with 0.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle};

use hub_core::message::SiteId;
use hub_core::HubSettings;
use hub_services::{
    Connector, CrashReporter, PiggybackMessage, PiggybackWatcher, QueueSpec, ReloadSignal,
};

use crate::handlers::{ConfigHandler, PayloadHandler};
use crate::receive_worker::ReceivingWorker;
use crate::send_worker::SendingWorker;
use crate::{CONFIG_QUEUE, PAYLOAD_QUEUE};

pub const PAYLOAD_RECEIVER: &str = "payload receiver";
pub const CONFIG_RECEIVER: &str = "config receiver";
pub const SENDER: &str = "sender";

const MESSAGE_BUFFER: usize = 1024;
const ONESHOT_BUFFER: usize = 16;

/// How the hub ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubExit {
    Terminated,
    WorkerDied(&'static str),
}

impl HubExit {
    pub fn code(self) -> u8 {
        match self {
            HubExit::Terminated => 0,
            HubExit::WorkerDied(_) => 1,
        }
    }
}

pub struct Hub {
    pub root: PathBuf,
    pub site: SiteId,
    pub settings: HubSettings,
    pub connector: Arc<dyn Connector>,
    pub crash: Arc<dyn CrashReporter>,
}

type WorkerHandle = JoinHandle<anyhow::Result<()>>;

impl Hub {
    /// Run with the piggyback directory watcher as message source.
    pub async fn run(self, terminate: impl Future<Output = ()>) -> HubExit {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_BUFFER);
        let watcher = tokio::spawn(
            PiggybackWatcher::new(
                self.root.clone(),
                self.settings.watcher.rescan_interval(),
                message_tx,
                shutdown_tx.subscribe(),
            )
            .run(),
        );

        let exit = self.supervise(message_rx, shutdown_tx, terminate).await;
        watcher.abort();
        let _ = watcher.await;
        exit
    }

    /// Run with an explicit message source instead of the watcher.
    pub async fn run_with_source(
        self,
        messages: mpsc::Receiver<PiggybackMessage>,
        terminate: impl Future<Output = ()>,
    ) -> HubExit {
        let (shutdown_tx, _) = broadcast::channel(1);
        self.supervise(messages, shutdown_tx, terminate).await
    }

    async fn supervise(
        self,
        messages: mpsc::Receiver<PiggybackMessage>,
        shutdown_tx: broadcast::Sender<()>,
        terminate: impl Future<Output = ()>,
    ) -> HubExit {
        let reload = ReloadSignal::new();
        let (oneshot_tx, oneshot_rx) = mpsc::channel(ONESHOT_BUFFER);
        let retry = self.settings.retry.policy();
        let queues = &self.settings.queues;

        let mut payload_task: WorkerHandle = tokio::spawn(
            ReceivingWorker::new(
                PAYLOAD_RECEIVER,
                QueueSpec::new(PAYLOAD_QUEUE, queues.payload_ttl()),
                self.connector.clone(),
                PayloadHandler::new(self.root.clone()),
                retry,
                self.crash.clone(),
                shutdown_tx.subscribe(),
            )
            .run(),
        );

        let mut config_task: WorkerHandle = tokio::spawn(
            ReceivingWorker::new(
                CONFIG_RECEIVER,
                QueueSpec::new(CONFIG_QUEUE, queues.config_ttl()),
                self.connector.clone(),
                ConfigHandler::new(self.root.clone(), reload.clone(), oneshot_tx),
                retry,
                self.crash.clone(),
                shutdown_tx.subscribe(),
            )
            .run(),
        );

        let mut sending_task: WorkerHandle = tokio::spawn(
            SendingWorker::new(
                self.root.clone(),
                self.site.clone(),
                self.connector.clone(),
                retry,
                reload,
                self.crash.clone(),
                messages,
                oneshot_rx,
                shutdown_tx.subscribe(),
            )
            .run(),
        );

        tracing::info!(site = %self.site, root = %self.root.display(), "piggyback hub running");

        tokio::pin!(terminate);
        let died = tokio::select! {
            _ = &mut terminate => None,
            result = &mut payload_task => Some((PAYLOAD_RECEIVER, result)),
            result = &mut config_task => Some((CONFIG_RECEIVER, result)),
            result = &mut sending_task => Some((SENDER, result)),
        };

        let mut tasks = [
            (PAYLOAD_RECEIVER, payload_task),
            (CONFIG_RECEIVER, config_task),
            (SENDER, sending_task),
        ];

        match died {
            Some((worker, result)) => {
                self.report_death(worker, result);
                for (name, task) in &mut tasks {
                    if *name == worker {
                        continue;
                    }
                    task.abort();
                    let _ = (&mut *task).await;
                }
                HubExit::WorkerDied(worker)
            }
            None => {
                tracing::info!("termination requested, stopping workers");
                let _ = shutdown_tx.send(());

                let deadline = tokio::time::Instant::now() + self.settings.supervisor.shutdown_grace();
                for (worker, task) in &mut tasks {
                    match tokio::time::timeout_at(deadline, &mut *task).await {
                        Ok(Ok(Ok(()))) => {}
                        Ok(Ok(Err(e))) => tracing::warn!(
                            worker = *worker,
                            error = %format!("{e:#}"),
                            "worker failed while stopping"
                        ),
                        Ok(Err(e)) => tracing::warn!(worker = *worker, error = %e, "worker panicked while stopping"),
                        Err(_) => {
                            tracing::warn!(worker = *worker, "worker did not stop in time, aborting");
                            task.abort();
                        }
                    }
                }
                HubExit::Terminated
            }
        }
    }

    fn report_death(&self, worker: &'static str, result: Result<anyhow::Result<()>, JoinError>) {
        match result {
            Ok(Ok(())) => {
                tracing::error!(worker, "worker exited unexpectedly, stopping hub");
            }
            // The worker wrote its own crash report.
            Ok(Err(e)) => {
                tracing::error!(worker, error = %format!("{e:#}"), "worker crashed, stopping hub");
            }
            Err(e) if e.is_panic() => {
                tracing::error!(worker, error = %e, "worker panicked, stopping hub");
                self.crash.report(worker, &anyhow::anyhow!("worker panicked: {e}"));
            }
            Err(e) => {
                tracing::error!(worker, error = %e, "worker was cancelled, stopping hub");
            }
        }
    }
}
