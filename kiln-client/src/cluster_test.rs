use std::sync::Arc;

use serde_json::json;

use kiln_core::NodeState;

use crate::cluster::ClusterProxy;
use crate::fixtures::{inbound_frame, RecordingConnectionObserver, RecordingListObserver, RecordingOverlay};
use crate::overlay::{OverlayEvent, OverlayFrame, BROADCAST_ADDR, PROTO_MASTER, PROTO_NODE};
use crate::subscriber::SubscriberKey;

const KEY: SubscriberKey = SubscriberKey::new(11);

#[test]
fn connection_established_notifies_and_searches_both_protocols() {
    let overlay = RecordingOverlay::new();
    let mut cluster = ClusterProxy::new(overlay.clone());
    let observer = Arc::new(RecordingConnectionObserver::default());
    cluster.subscribe_to_connection_state(KEY, observer.clone());

    cluster.connect().unwrap();
    cluster.handle_event(OverlayEvent::Established);

    assert_eq!(observer.log.take(), vec!["established"]);
    let docs = overlay.take_docs();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].0, json!({ "action": "identify" }));
    assert_eq!(docs[1].0, json!({ "cmd": "identify" }));
    assert!(docs.iter().all(|(_, dst, _)| *dst == BROADCAST_ADDR));
    assert_eq!(docs[0].2, PROTO_NODE);
    assert_eq!(docs[1].2, PROTO_MASTER);
}

#[test]
fn connection_failures_reach_observers_with_the_reason() {
    let overlay = RecordingOverlay::new();
    let mut cluster = ClusterProxy::new(overlay);
    let observer = Arc::new(RecordingConnectionObserver::default());
    cluster.subscribe_to_connection_state(KEY, observer.clone());

    cluster.handle_event(OverlayEvent::Failed("connection refused".into()));
    cluster.handle_event(OverlayEvent::Lost);

    assert_eq!(observer.log.take(), vec!["failed:connection refused", "lost"]);
}

#[test]
fn discovery_creates_a_node_proxy_and_notifies_after_parsing() {
    let overlay = RecordingOverlay::new();
    let mut cluster = ClusterProxy::new(overlay.clone());
    let list_observer = Arc::new(RecordingListObserver::default());
    cluster.subscribe_to_node_list(KEY, list_observer.clone());

    cluster.handle_event(inbound_frame(
        PROTO_NODE,
        0x0102_0304,
        json!({ "identity": "node-a", "state": "idle" }),
    ));

    assert_eq!(list_observer.changes(), 1);
    assert_eq!(cluster.list_node_identities(), vec!["node-a".to_string()]);
    let node = cluster.get_node("node-a").expect("node proxy must exist");
    assert_eq!(node.state(), NodeState::Idle, "the triggering message must be parsed into the new proxy");
    assert!(node.is_responding());
    assert_eq!(node.overlay_address(), 0x0102_0304);
}

#[test]
fn rediscovery_updates_the_address_instead_of_duplicating() {
    let overlay = RecordingOverlay::new();
    let mut cluster = ClusterProxy::new(overlay.clone());
    let list_observer = Arc::new(RecordingListObserver::default());
    cluster.subscribe_to_node_list(KEY, list_observer.clone());

    cluster.handle_event(inbound_frame(PROTO_NODE, 0x0102_0304, json!({ "identity": "node-a", "state": "idle" })));
    overlay.take();

    cluster.handle_event(inbound_frame(PROTO_NODE, 0x0908_0706, json!({ "identity": "node-a" })));

    assert_eq!(list_observer.changes(), 1, "rediscovery must not fire list-changed");
    assert_eq!(cluster.list_node_identities().len(), 1);
    assert_eq!(cluster.get_node("node-a").unwrap().overlay_address(), 0x0908_0706);

    // The node may have restarted behind the same identity.
    let docs = overlay.take_docs();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].0["action"], "get_status");
    assert_eq!(docs[0].1, 0x0908_0706);
}

#[test]
fn master_discovery_mirrors_the_node_path() {
    let overlay = RecordingOverlay::new();
    let mut cluster = ClusterProxy::new(overlay.clone());
    let list_observer = Arc::new(RecordingListObserver::default());
    cluster.subscribe_to_master_list(KEY, list_observer.clone());

    cluster.handle_event(inbound_frame(
        PROTO_MASTER,
        0x0A0B_0C0D,
        json!({ "identity": "m1", "state": "idle" }),
    ));

    assert_eq!(list_observer.changes(), 1);
    assert_eq!(cluster.list_master_identities(), vec!["m1".to_string()]);
    let master = cluster.get_master("m1").expect("master proxy must exist");
    assert!(master.is_responding());
}

#[test]
fn malformed_and_anonymous_messages_are_dropped() {
    let overlay = RecordingOverlay::new();
    let mut cluster = ClusterProxy::new(overlay);
    let list_observer = Arc::new(RecordingListObserver::default());
    cluster.subscribe_to_node_list(KEY, list_observer.clone());

    cluster.handle_event(OverlayEvent::Frame(OverlayFrame {
        source: 1,
        destination: 2,
        protocol: PROTO_NODE,
        payload: b"{ not json".to_vec(),
    }));
    cluster.handle_event(inbound_frame(PROTO_NODE, 1, json!({ "state": "idle" })));
    cluster.handle_event(inbound_frame(PROTO_NODE, 1, json!({ "identity": 42 })));
    cluster.handle_event(inbound_frame(9999, 1, json!({ "identity": "node-a" })));

    assert_eq!(list_observer.changes(), 0);
    assert!(cluster.list_node_identities().is_empty());
}

#[test]
fn discovery_rebroadcasts_every_thirty_seconds() {
    let overlay = RecordingOverlay::new();
    let mut cluster = ClusterProxy::new(overlay.clone());

    for _ in 0..29 {
        cluster.tick();
    }
    assert!(overlay.take().is_empty());

    cluster.tick();
    let docs = overlay.take_docs();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].0["action"], "identify");
    assert_eq!(docs[1].0["cmd"], "identify");

    // The counters reset; the next broadcast is another thirty ticks out.
    for _ in 0..29 {
        cluster.tick();
    }
    assert!(overlay.take().is_empty());
    cluster.tick();
    assert_eq!(overlay.take().len(), 2);
}

#[test]
fn search_now_broadcasts_immediately_and_resets_the_cadence() {
    let overlay = RecordingOverlay::new();
    let mut cluster = ClusterProxy::new(overlay.clone());

    for _ in 0..29 {
        cluster.tick();
    }
    overlay.take();

    cluster.search_now();
    assert_eq!(overlay.take().len(), 2);

    // The forced search pushed the periodic broadcast back out.
    cluster.tick();
    assert!(overlay.take().is_empty());
}

#[test]
fn tick_ages_every_peer_proxy() {
    let overlay = RecordingOverlay::new();
    let mut cluster = ClusterProxy::new(overlay.clone());

    cluster.handle_event(inbound_frame(PROTO_NODE, 3, json!({ "identity": "node-a", "state": "idle" })));
    cluster.handle_event(inbound_frame(PROTO_MASTER, 4, json!({ "identity": "m1", "state": "idle" })));
    assert!(cluster.get_node("node-a").unwrap().is_responding());
    assert!(cluster.get_master("m1").unwrap().is_responding());

    for _ in 0..30 {
        cluster.tick();
    }

    assert!(!cluster.get_node("node-a").unwrap().is_responding());
    assert!(!cluster.get_master("m1").unwrap().is_responding());
}

#[test]
fn node_and_master_namespaces_are_independent() {
    let overlay = RecordingOverlay::new();
    let mut cluster = ClusterProxy::new(overlay);

    cluster.handle_event(inbound_frame(PROTO_NODE, 3, json!({ "identity": "shared", "state": "idle" })));
    cluster.handle_event(inbound_frame(PROTO_MASTER, 4, json!({ "identity": "shared", "state": "idle" })));

    assert!(cluster.get_node("shared").is_some());
    assert!(cluster.get_master("shared").is_some());
    assert_eq!(cluster.list_node_identities().len(), 1);
    assert_eq!(cluster.list_master_identities().len(), 1);
}
