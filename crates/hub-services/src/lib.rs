//! hub-services: the collaborators hub workers are built on: broker
//! access, the local piggyback store, the reload signal and crash reports.

pub mod amqp;
pub mod broker;
pub mod crash;
pub mod piggyback;
pub mod reload;
pub mod watcher;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

pub use amqp::AmqpConnector;
pub use broker::{BrokerError, Channel, Connector, Deliveries, Delivery, QueueSpec};
pub use crash::{CrashReportStore, CrashReporter};
pub use piggyback::{PiggybackMessage, PiggybackMeta, StoreError};
pub use reload::ReloadSignal;
pub use watcher::PiggybackWatcher;
