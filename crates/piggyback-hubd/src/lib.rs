//! piggyback-hubd: relays piggyback data between sites over the broker and
//! keeps the local routing config in sync.
//!
//! Three workers run side by side under [`supervisor::Hub`]:
//! - payload receiver: stores piggyback data other sites sent us
//! - config receiver: stores routing config updates, or triggers one-shot sends
//! - sender: forwards locally produced piggyback data to the owning site

pub mod cli;
pub mod connect;
pub mod daemon;
pub mod distribute;
pub mod handlers;
pub mod logging;
pub mod receive_worker;
pub mod send_worker;
pub mod supervisor;

/// Queue and routing key for relayed piggyback data.
pub const PAYLOAD_QUEUE: &str = "payload";
/// Queue and routing key for routing config updates.
pub const CONFIG_QUEUE: &str = "config";
