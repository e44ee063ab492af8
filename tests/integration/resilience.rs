//! Broker outages, crashes and termination.

use std::time::Duration;

use piggyback_hubd::supervisor::{PAYLOAD_RECEIVER, SENDER};
use piggyback_hubd::{CONFIG_QUEUE, PAYLOAD_QUEUE};

use crate::infra::*;

async fn configured(net: &Network, from: &str, to: &str, host: &str) {
    net.distribute(from, &[(from, routing(&[(host, to)]))], false).await;
    let site = net.site(from);
    assert!(wait_until(WAIT, || site.routing_config() == routing(&[(host, to)])).await);
}

#[tokio::test]
async fn hub_waits_for_broker_to_come_up() {
    let mut net = Network::new(&["central"]);
    net.site("central").broker.refuse_connections(10);

    net.start("central").await;
    assert!(net.site("central").broker.connects() >= 2);
    assert_eq!(net.stop("central").await, HubExit::Terminated);
}

/// A failed publish is retried after reconnecting, before anything newer.
#[tokio::test]
async fn failed_publish_is_retried_in_order() {
    let mut net = Network::new(&["central", "remote"]);
    net.start("central").await;
    net.start("remote").await;
    configured(&net, "central", "remote", "hostX").await;

    let central = net.site("central");
    let connects = central.broker.connects();
    central.broker.fail_publishes(1);
    central.store_piggyback("source1", "hostX", "one", 100);
    central.store_piggyback("source2", "hostX", "two", 200);

    let remote = net.site("remote");
    assert!(wait_until(WAIT, || remote.messages_for("hostX").len() == 2).await);
    let sources: Vec<String> = central
        .broker
        .published()
        .iter()
        .filter(|p| p.routing == PAYLOAD_QUEUE)
        .map(|p| p.json::<hub_core::PiggybackPayload>().unwrap().source_host)
        .collect();
    assert_eq!(sources, vec!["source1", "source2"]);
    assert_eq!(central.broker.connects(), connects + 1);
}

/// Receivers survive a dropped connection and get unacknowledged messages again.
#[tokio::test]
async fn receivers_recover_from_connection_loss() {
    let mut net = Network::new(&["central", "remote"]);
    net.start("central").await;
    net.start("remote").await;
    configured(&net, "central", "remote", "hostX").await;

    let remote = net.site("remote");
    remote.broker.drop_connections();
    remote.broker.refuse_connections(2);

    net.site("central").store_piggyback("source1", "hostX", "after outage", 100);
    assert!(wait_until(WAIT, || !remote.messages_for("hostX").is_empty()).await);
    assert!(remote.is_up());
    assert_eq!(net.stop("remote").await, HubExit::Terminated);
}

/// A payload that cannot be decoded is fatal for the whole hub: the other
/// workers are stopped along with the failed one.
#[tokio::test]
async fn malformed_payload_stops_the_hub() {
    let mut net = Network::new(&["remote"]);
    net.start("remote").await;
    configured(&net, "remote", "central", "hostX").await;

    let remote = net.site("remote");
    remote.store_piggyback("source1", "hostX", "before", 100);
    assert!(wait_until(WAIT, || remote.sent_payloads().len() == 1).await);
    let acked = remote.broker.acked().len();

    remote
        .broker
        .deliver(PAYLOAD_QUEUE, br#"{"source_host": "s"}"#.to_vec());

    let exit = net.exit_of("remote").await;
    assert_eq!(exit, HubExit::WorkerDied(PAYLOAD_RECEIVER));
    assert_eq!(exit.code(), 1);

    let remote = net.site("remote");
    assert_eq!(remote.crash_reports(), 1);
    assert_eq!(remote.broker.acked().len(), acked);
    assert!(
        wait_until(WAIT, || !remote.broker.is_consuming(PAYLOAD_QUEUE)
            && !remote.broker.is_consuming(CONFIG_QUEUE))
        .await,
        "receivers still consuming after the hub stopped"
    );

    // Neither the watcher nor the sender outlive the hub.
    remote.store_piggyback("source1", "hostX", "after", 200);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(remote.sent_payloads().len(), 1);
}

/// A sender that cannot read its routing config takes the hub down.
#[tokio::test]
async fn broken_routing_config_stops_the_hub() {
    let mut net = Network::new(&["central"]);
    let path = hub_core::paths::routing_config_path(net.site("central").root());
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{\"locations\": 42}\n").unwrap();

    net.launch("central");
    let exit = net.exit_of("central").await;
    assert_eq!(exit, HubExit::WorkerDied(SENDER));
    assert_eq!(net.site("central").crash_reports(), 1);
}

#[tokio::test]
async fn termination_is_a_clean_exit() {
    let mut net = Network::new(&["central"]);
    net.start("central").await;

    let exit = net.stop("central").await;
    assert_eq!(exit, HubExit::Terminated);
    assert_eq!(exit.code(), 0);
    assert_eq!(net.site("central").crash_reports(), 0);
}
