//! In-process broker for tests.
//!
//! Behaves like a single site broker: queues hold messages until consumed,
//! unacknowledged messages are redelivered after a connection loss, and
//! every publish is recorded. Connection refusals, queue declare and
//! publish failures and connection drops can be scripted.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::broker::{BrokerError, Channel, Connector, Deliveries, Delivery, QueueSpec};

/// A message published through a [`MemoryBroker`] channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Destination site; None for local publishes.
    pub site: Option<String>,
    pub routing: String,
    pub body: Vec<u8>,
}

impl Published {
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

type Sink = mpsc::UnboundedSender<Result<Delivery, BrokerError>>;

#[derive(Default)]
struct State {
    connects: usize,
    refuse_connects: usize,
    fail_publishes: usize,
    fail_declares: usize,
    declared: Vec<QueueSpec>,
    published: Vec<Published>,
    acked: Vec<u64>,
    next_tag: u64,
    backlog: HashMap<String, VecDeque<Vec<u8>>>,
    consumers: HashMap<String, Sink>,
    unacked: BTreeMap<u64, (String, Vec<u8>)>,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connections(&self, n: usize) {
        self.state().refuse_connects = n;
    }

    /// Fail the next `n` publishes with a connection error.
    pub fn fail_publishes(&self, n: usize) {
        self.state().fail_publishes = n;
    }

    /// Fail the next `n` queue declarations with a connection error.
    pub fn fail_declares(&self, n: usize) {
        self.state().fail_declares = n;
    }

    /// Put a message on `queue` (short name, e.g. `config`).
    pub fn deliver(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let mut state = self.state();
        let body = body.into();
        let sink = state.consumers.get(queue).cloned();
        match sink {
            Some(sink) => {
                let tag = state.take_tag();
                state.unacked.insert(tag, (queue.to_string(), body.clone()));
                if sink.send(Ok(Delivery { delivery_tag: tag, body: body.clone() })).is_err() {
                    state.unacked.remove(&tag);
                    state.consumers.remove(queue);
                    state.backlog.entry(queue.to_string()).or_default().push_back(body);
                }
            }
            None => state.backlog.entry(queue.to_string()).or_default().push_back(body),
        }
    }

    /// Simulate losing every connection: consumers see an error and
    /// unacknowledged messages go back to the front of their queue.
    pub fn drop_connections(&self) {
        let mut state = self.state();
        for (_, sink) in state.consumers.drain() {
            let _ = sink.send(Err(BrokerError::Connection("connection reset by broker".into())));
        }
        let unacked = std::mem::take(&mut state.unacked);
        for (_, (queue, body)) in unacked.into_iter().rev() {
            state.backlog.entry(queue).or_default().push_front(body);
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.state().published.clone()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state().acked.clone()
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn declared(&self) -> Vec<QueueSpec> {
        self.state().declared.clone()
    }

    /// Whether a live consumer is attached to `queue`.
    pub fn is_consuming(&self, queue: &str) -> bool {
        self.state()
            .consumers
            .get(queue)
            .is_some_and(|sink| !sink.is_closed())
    }

    /// Poll `condition` until it holds or `timeout` passes.
    pub async fn wait_for(&self, timeout: Duration, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition(self)
    }
}

impl State {
    fn take_tag(&mut self) -> u64 {
        self.next_tag += 1;
        self.next_tag
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let mut state = self.state();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(BrokerError::Connection("connection refused".into()));
        }
        state.connects += 1;
        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
        }))
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn queue_declare(&self, queue: &QueueSpec) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        if state.fail_declares > 0 {
            state.fail_declares -= 1;
            return Err(BrokerError::Connection("queue declare failed: channel closed".into()));
        }
        state.declared.push(queue.clone());
        Ok(())
    }

    async fn consume(&self, queue: &QueueSpec) -> Result<Deliveries, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.state();
            let backlog = state.backlog.remove(&queue.name).unwrap_or_default();
            for body in backlog {
                let tag = state.take_tag();
                state.unacked.insert(tag, (queue.name.clone(), body.clone()));
                let _ = tx.send(Ok(Delivery { delivery_tag: tag, body }));
            }
            state.consumers.insert(queue.name.clone(), tx);
        }

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state.unacked.remove(&delivery_tag);
        state.acked.push(delivery_tag);
        Ok(())
    }

    async fn publish_for_site(
        &self,
        site: &str,
        routing: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        self.record(Some(site), routing, body)
    }

    async fn publish_locally(&self, routing: &str, body: &[u8]) -> Result<(), BrokerError> {
        self.record(None, routing, body)
    }
}

impl MemoryChannel {
    fn record(&self, site: Option<&str>, routing: &str, body: &[u8]) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(BrokerError::Connection("publish failed: channel closed".into()));
        }
        state.published.push(Published {
            site: site.map(str::to_string),
            routing: routing.to_string(),
            body: body.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn backlog_is_delivered_on_consume() {
        let broker = MemoryBroker::new();
        broker.deliver("config", b"one".to_vec());

        let channel = broker.connect().await.unwrap();
        let mut deliveries = channel.consume(&QueueSpec::new("config", None)).await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.body, b"one");
    }

    #[tokio::test]
    async fn unacked_messages_are_redelivered_after_drop() {
        let broker = MemoryBroker::new();
        let queue = QueueSpec::new("payload", None);

        let channel = broker.connect().await.unwrap();
        let mut deliveries = channel.consume(&queue).await.unwrap();
        broker.deliver("payload", b"a".to_vec());
        broker.deliver("payload", b"b".to_vec());
        let a = deliveries.next().await.unwrap().unwrap();
        channel.ack(a.delivery_tag).await.unwrap();
        let _b = deliveries.next().await.unwrap().unwrap();

        broker.drop_connections();
        assert!(deliveries.next().await.unwrap().is_err());
        assert!(!broker.is_consuming("payload"));

        let channel = broker.connect().await.unwrap();
        let mut deliveries = channel.consume(&queue).await.unwrap();
        assert!(broker.is_consuming("payload"));
        assert_eq!(deliveries.next().await.unwrap().unwrap().body, b"b");

        drop(deliveries);
        assert!(!broker.is_consuming("payload"));
    }

    #[tokio::test]
    async fn scripted_failures_run_out() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(1);
        assert!(broker.connect().await.is_err());

        let channel = broker.connect().await.unwrap();
        broker.fail_publishes(1);
        assert!(channel.publish_for_site("b", "payload", b"x").await.is_err());
        channel.publish_for_site("b", "payload", b"x").await.unwrap();
        assert_eq!(broker.published().len(), 1);

        broker.fail_declares(1);
        let queue = QueueSpec::new("config", None);
        assert!(channel.queue_declare(&queue).await.is_err());
        channel.queue_declare(&queue).await.unwrap();
        assert_eq!(broker.declared(), vec![queue]);
    }
}
