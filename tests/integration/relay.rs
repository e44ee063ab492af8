//! Routing of piggyback data between sites.

use crate::infra::*;

/// Data for a host monitored elsewhere travels to that site.
#[tokio::test]
async fn data_for_remote_host_reaches_owning_site() {
    let mut net = Network::new(&["central", "remote"]);
    net.start("central").await;
    net.start("remote").await;

    net.distribute("central", &[("central", routing(&[("hostX", "remote")]))], false)
        .await;
    let central = net.site("central");
    assert!(wait_until(WAIT, || central.routing_config() == routing(&[("hostX", "remote")])).await);

    central.store_piggyback("source1", "hostX", "<<<local>>>\nhello", 1_700_000_000);

    let remote = net.site("remote");
    assert!(wait_until(WAIT, || !remote.messages_for("hostX").is_empty()).await);
    let stored = remote.messages_for("hostX").remove(0);
    assert_eq!(stored.meta.source, "source1");
    assert_eq!(stored.meta.message_timestamp, 1_700_000_000);
    assert_eq!(stored.meta.contact_timestamp, Some(1_700_000_000));
    assert_eq!(&stored.raw_data[..], b"<<<local>>>\nhello\n");

    assert_eq!(net.stop("central").await, HubExit::Terminated);
    assert_eq!(net.stop("remote").await, HubExit::Terminated);
}

/// Unlisted hosts and hosts mapped to the own site stay where they are.
#[tokio::test]
async fn local_hosts_are_not_sent() {
    let mut net = Network::new(&["central", "remote"]);
    net.start("central").await;
    net.start("remote").await;

    net.distribute(
        "central",
        &[("central", routing(&[("hostX", "remote"), ("hostZ", "central")]))],
        false,
    )
    .await;
    let central = net.site("central");
    assert!(wait_until(WAIT, || central.routing_config().locations.len() == 2).await);

    central.store_piggyback("source1", "hostY", "unlisted", 100);
    central.store_piggyback("source1", "hostZ", "own site", 101);
    central.store_piggyback("source1", "hostX", "remote", 102);

    let remote = net.site("remote");
    assert!(wait_until(WAIT, || !remote.messages_for("hostX").is_empty()).await);
    assert_eq!(
        central.sent_payloads(),
        vec![("remote".to_string(), "hostX".to_string())]
    );
    assert!(remote.messages_for("hostY").is_empty());
    assert!(remote.messages_for("hostZ").is_empty());
}

/// The latest persisted config wins, and it is applied before the next message.
#[tokio::test]
async fn config_updates_redirect_later_messages() {
    let mut net = Network::new(&["central", "remote1", "remote2"]);
    for site in ["central", "remote1", "remote2"] {
        net.start(site).await;
    }

    net.distribute("central", &[("central", routing(&[("hostX", "remote1")]))], false)
        .await;
    let central = net.site("central");
    assert!(wait_until(WAIT, || central.routing_config() == routing(&[("hostX", "remote1")])).await);
    central.store_piggyback("source1", "hostX", "first", 100);
    assert!(wait_until(WAIT, || !net.site("remote1").messages_for("hostX").is_empty()).await);

    net.distribute("central", &[("central", routing(&[("hostX", "remote1")]))], false)
        .await;
    net.distribute("central", &[("central", routing(&[("hostX", "remote2")]))], false)
        .await;
    assert!(wait_until(WAIT, || central.routing_config() == routing(&[("hostX", "remote2")])).await);
    central.store_piggyback("source1", "hostX", "second", 200);

    let remote2 = net.site("remote2");
    assert!(wait_until(WAIT, || !remote2.messages_for("hostX").is_empty()).await);
    assert_eq!(&remote2.messages_for("hostX")[0].raw_data[..], b"second\n");
    assert_eq!(
        &net.site("remote1").messages_for("hostX")[0].raw_data[..],
        b"first\n"
    );
}

/// Configs for other sites travel over the intersite exchange and are
/// persisted there.
#[tokio::test]
async fn distributed_config_is_persisted_on_each_site() {
    let mut net = Network::new(&["central", "remote"]);
    net.start("central").await;
    net.start("remote").await;

    net.distribute(
        "central",
        &[
            ("central", routing(&[("hostX", "remote")])),
            ("remote", routing(&[("hostY", "central")])),
        ],
        false,
    )
    .await;

    let remote = net.site("remote");
    assert!(wait_until(WAIT, || remote.routing_config() == routing(&[("hostY", "central")])).await);
    assert_eq!(net.site("central").routing_config(), routing(&[("hostX", "remote")]));
}

/// A one-shot config sends what is stored right now and leaves the stored
/// config alone.
#[tokio::test]
async fn oneshot_sends_existing_data_once() {
    let mut net = Network::new(&["central", "remote"]);
    net.site("central").store_piggyback("source1", "hostX", "already here", 100);
    net.site("central").store_piggyback("source2", "hostX", "also here", 101);
    net.start("central").await;
    net.start("remote").await;

    net.distribute("central", &[("central", routing(&[("hostX", "remote")]))], true)
        .await;

    let remote = net.site("remote");
    assert!(wait_until(WAIT, || remote.messages_for("hostX").len() == 2).await);
    assert_eq!(net.site("central").routing_config(), routing(&[]));
    assert_eq!(net.site("central").sent_payloads().len(), 2);
}
