use std::sync::Arc;

use serde_json::json;

use kiln_core::NodeState;

use crate::fixtures::{RecordingNodeObserver, RecordingOverlay, RecordingSink};
use crate::node::NodeProxy;
use crate::overlay::PROTO_NODE;
use crate::subscriber::SubscriberKey;
use crate::wire;

const KEY: SubscriberKey = SubscriberKey::new(7);

fn test_node(overlay: &Arc<RecordingOverlay>) -> NodeProxy {
    NodeProxy::new(overlay.clone(), "node-a".into(), 0x0102_0304)
}

#[test]
fn starts_unknown_and_responding() {
    let overlay = RecordingOverlay::new();
    let node = test_node(&overlay);

    assert_eq!(node.identity(), "node-a");
    assert_eq!(node.state(), NodeState::Unknown);
    assert!(node.is_responding());
    assert!(overlay.take().is_empty());
}

#[test]
fn status_update_mirrors_fields_and_notifies_once() {
    let overlay = RecordingOverlay::new();
    let mut node = test_node(&overlay);
    let observer = Arc::new(RecordingNodeObserver::default());
    node.subscribe_to_state(KEY, observer.clone());

    node.handle_message(&json!({
        "identity": "node-a",
        "state": "building",
        "name": "zlib",
        "arch": "amd64",
        "version": "1.2.11",
    }));

    assert_eq!(node.state(), NodeState::Building);
    assert_eq!(node.pkg_name(), "zlib");
    assert_eq!(node.pkg_arch(), "amd64");
    assert_eq!(node.pkg_version(), "1.2.11");
    assert_eq!(node.fail_reason(), "");
    assert_eq!(observer.log.take(), vec!["state:building"]);

    // The identical status again changes nothing.
    node.handle_message(&json!({
        "identity": "node-a",
        "state": "building",
        "name": "zlib",
        "arch": "amd64",
        "version": "1.2.11",
    }));
    assert!(observer.log.take().is_empty());
}

#[test]
fn resubscribing_with_the_same_key_replaces_the_observer() {
    let overlay = RecordingOverlay::new();
    let mut node = test_node(&overlay);
    let old = Arc::new(RecordingNodeObserver::default());
    let new = Arc::new(RecordingNodeObserver::default());

    node.subscribe_to_state(KEY, old.clone());
    node.subscribe_to_state(KEY, new.clone());
    node.handle_message(&json!({ "identity": "node-a", "state": "idle" }));

    assert!(old.log.take().is_empty(), "the replaced observer must not fire");
    assert_eq!(new.log.take(), vec!["state:idle"]);

    node.unsubscribe_from_state(KEY);
    node.handle_message(&json!({ "identity": "node-a", "state": "building" }));
    assert!(new.log.take().is_empty());
}

#[test]
fn unknown_state_string_is_rejected() {
    let overlay = RecordingOverlay::new();
    let mut node = test_node(&overlay);
    let observer = Arc::new(RecordingNodeObserver::default());
    node.subscribe_to_state(KEY, observer.clone());

    node.handle_message(&json!({ "identity": "node-a", "state": "idle" }));
    observer.log.take();

    node.handle_message(&json!({ "identity": "node-a", "state": "exploded" }));
    assert_eq!(node.state(), NodeState::Idle, "prior state must be retained");
    assert!(observer.log.take().is_empty());
}

#[test]
fn error_field_fires_after_state() {
    let overlay = RecordingOverlay::new();
    let mut node = test_node(&overlay);
    let observer = Arc::new(RecordingNodeObserver::default());
    node.subscribe_to_state(KEY, observer.clone());

    node.handle_message(&json!({
        "identity": "node-a",
        "state": "failed",
        "reason": "node/abort",
        "err": "Action `start_build' not applicable in state failed.",
    }));

    assert_eq!(
        observer.log.take(),
        vec![
            "state:failed".to_string(),
            "error:Action `start_build' not applicable in state failed.".to_string(),
        ]
    );
    assert_eq!(node.fail_reason(), "node/abort");
}

#[test]
fn responsiveness_flips_after_silence_and_back_on_message() {
    let overlay = RecordingOverlay::new();
    let mut node = test_node(&overlay);
    let observer = Arc::new(RecordingNodeObserver::default());
    node.subscribe_to_state(KEY, observer.clone());

    for _ in 0..29 {
        node.tick();
    }
    assert!(node.is_responding());
    assert!(observer.log.take().iter().all(|e| !e.starts_with("responding")));

    node.tick();
    assert!(!node.is_responding());
    assert_eq!(
        observer.log.take().into_iter().filter(|e| e.starts_with("responding")).collect::<Vec<_>>(),
        vec!["responding:false"]
    );

    node.handle_message(&json!({ "identity": "node-a", "state": "idle" }));
    assert!(node.is_responding());
    let events = observer.log.take();
    assert_eq!(events[0], "responding:true", "responding fires before state, got {:?}", events);
}

#[test]
fn stale_status_is_requeried() {
    let overlay = RecordingOverlay::new();
    let mut node = test_node(&overlay);

    for _ in 0..20 {
        node.tick();
    }
    assert!(overlay.take().is_empty());

    node.tick();
    let sent = overlay.take_docs();
    assert_eq!(sent.len(), 1);
    let (doc, destination, protocol) = &sent[0];
    assert_eq!(doc["action"], "get_status");
    assert_eq!(*destination, 0x0102_0304);
    assert_eq!(*protocol, PROTO_NODE);
}

#[test]
fn address_change_triggers_a_fresh_status_query() {
    let overlay = RecordingOverlay::new();
    let mut node = test_node(&overlay);

    node.set_overlay_addr(0x0102_0304);
    assert!(overlay.take().is_empty(), "unchanged address must not query");

    node.set_overlay_addr(0x0908_0706);
    assert_eq!(node.overlay_address(), 0x0908_0706);
    let sent = overlay.take_docs();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0["action"], "get_status");
    assert_eq!(sent[0].1, 0x0908_0706, "query must go to the new address");
}

#[test]
fn build_commands_carry_the_action_verb() {
    let overlay = RecordingOverlay::new();
    let node = test_node(&overlay);

    node.request_start_build("zlib", "amd64", "1.2.11");
    node.request_abort_build();
    node.request_reset();
    node.request_enable_maintenance();
    node.request_disable_maintenance();

    let docs = overlay.take_docs();
    let actions: Vec<_> = docs.iter().map(|(doc, _, _)| doc["action"].as_str().unwrap().to_string()).collect();
    assert_eq!(
        actions,
        vec!["start_build", "abort_build", "reset", "enable_maintenance", "disable_maintenance"]
    );
    assert_eq!(docs[0].0["name"], "zlib");
    assert_eq!(docs[0].0["arch"], "amd64");
    assert_eq!(docs[0].0["version"], "1.2.11");
    assert!(docs.iter().all(|(_, dst, proto)| *dst == 0x0102_0304 && *proto == PROTO_NODE));
}

#[test]
fn console_subscription_and_input_use_the_streaming_envelope() {
    let overlay = RecordingOverlay::new();
    let mut node = test_node(&overlay);
    let sink = RecordingSink::new();

    let subscription = node.subscribe_to_console(sink.clone(), Some(KEY));
    assert!(subscription.is_active());
    let docs = overlay.take_docs();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].0["console_streaming"]["msg"], "request_updates");
    assert_eq!(docs[1].0["console_streaming"]["msg"], "request");
    assert_eq!(docs[1].0["console_streaming"]["start"], 0);
    assert_eq!(docs[1].0["console_streaming"]["end"], 0xFFFF_FFFFu32);

    node.handle_message(&json!({
        "identity": "node-a",
        "console_streaming": {
            "msg": "update",
            "mdata": [[1, 5]],
            "blob": wire::encode_base64(b"hello"),
        },
    }));
    assert_eq!(sink.received(), b"hello");
    let docs = overlay.take_docs();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].0["console_streaming"]["msg"], "ack");

    node.send_console_input(b"ls\n");
    let docs = overlay.take_docs();
    assert_eq!(docs[0].0["console_streaming"]["msg"], "input");
    assert_eq!(docs[0].0["console_streaming"]["data"], wire::encode_base64(b"ls\n"));
}
