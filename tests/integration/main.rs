//! Piggyback hub integration tests.
//!
//! Whole hubs (supervisor, workers, watcher, stores) run against in-memory
//! brokers wired into a small site federation by `infra`:
//!
//!   cargo test --test integration

mod infra;
mod relay;
mod resilience;
