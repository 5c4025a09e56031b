//! Build node proxy.
//!
//! One `NodeProxy` exists per discovered build node, keyed by the node's
//! identity string. The proxy mirrors the node's reported state, derives a
//! responsiveness flag from the age of the last status message, exposes the
//! build-control command surface and hosts the node's console stream.

use std::sync::Arc;

use serde_json::{json, Value};

use kiln_core::NodeState;

use crate::console::{ConsoleCommand, ConsoleReassembler, ConsoleSink, ConsoleSubscription};
use crate::overlay::{Overlay, OverlayAddr, PROTO_NODE};
use crate::subscriber::{SubscriberKey, SubscriberSet};
use crate::wire;

/// Seconds without a status message after which a node counts as
/// unresponsive.
const RESPONSE_TIMEOUT: u64 = 30;

/// Status age in seconds beyond which a fresh `get_status` query is issued.
const STATUS_QUERY_AGE: u64 = 20;

/// An observer of a build node proxy's state.
///
/// The default method bodies ignore the notification, so implementations
/// override only the channels they care about.
pub trait NodeObserver: Send + Sync {
    /// The node's derived responsiveness flag flipped.
    fn on_responding_changed(&self, _responding: bool) {}
    /// Any part of the node's reported state changed.
    fn on_state_changed(&self, _state: NodeState) {}
    /// The node reported an error message. Does not mutate proxy state.
    fn on_error_received(&self, _error: &str) {}
}

/// Client-side representation of one build node.
pub struct NodeProxy {
    identity: String,
    overlay: Arc<dyn Overlay>,
    current_address: OverlayAddr,

    state: NodeState,
    pkg_name: String,
    pkg_arch: String,
    pkg_version: String,
    fail_reason: String,

    /// Seconds since the last message from the node.
    last_state_update: u64,

    subscribers: SubscriberSet<dyn NodeObserver>,
    console: ConsoleReassembler,
}

impl NodeProxy {
    pub(crate) fn new(overlay: Arc<dyn Overlay>, identity: String, address: OverlayAddr) -> Self {
        Self {
            identity,
            overlay,
            current_address: address,
            state: NodeState::Unknown,
            pkg_name: String::new(),
            pkg_arch: String::new(),
            pkg_version: String::new(),
            fail_reason: String::new(),
            last_state_update: 0,
            subscribers: SubscriberSet::default(),
            console: ConsoleReassembler::default(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn overlay_address(&self) -> OverlayAddr {
        self.current_address
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Name of the package the node is working on; empty when unknown.
    pub fn pkg_name(&self) -> &str {
        &self.pkg_name
    }

    /// Architecture of the package the node is working on; empty when
    /// unknown. Kept as the opaque wire string.
    pub fn pkg_arch(&self) -> &str {
        &self.pkg_arch
    }

    /// Version of the package the node is working on; empty when unknown.
    pub fn pkg_version(&self) -> &str {
        &self.pkg_version
    }

    /// Why the last build failed; empty when unknown.
    pub fn fail_reason(&self) -> &str {
        &self.fail_reason
    }

    /// Whether the node has reported within the response timeout.
    pub fn is_responding(&self) -> bool {
        self.last_state_update < RESPONSE_TIMEOUT
    }

    pub fn subscribe_to_state(&mut self, key: SubscriberKey, observer: Arc<dyn NodeObserver>) {
        self.subscribers.insert(key, observer);
    }

    pub fn unsubscribe_from_state(&mut self, key: SubscriberKey) {
        self.subscribers.remove(key);
    }

    /// Update the node's overlay address.
    ///
    /// An address change means the node may have restarted behind the same
    /// identity, so its state is queried afresh.
    pub(crate) fn set_overlay_addr(&mut self, address: OverlayAddr) {
        if address != self.current_address {
            self.current_address = address;
            self.query_status();
        }
    }

    /// Interpret a message from the node.
    pub(crate) fn handle_message(&mut self, doc: &Value) {
        let was_responding = self.is_responding();
        self.last_state_update = 0;
        if !was_responding {
            for observer in self.subscribers.snapshot() {
                observer.on_responding_changed(true);
            }
        }

        if let Some(state_str) = wire::str_field(doc, "state") {
            match NodeState::from_wire(state_str) {
                Some(state) => self.apply_status(state, doc),
                None => {
                    tracing::debug!(identity = %self.identity, state = state_str, "node reported unknown state");
                }
            }
        }

        if let Some(error) = wire::str_field(doc, "err") {
            for observer in self.subscribers.snapshot() {
                observer.on_error_received(error);
            }
        }

        if let Some(cs) = doc.get("console_streaming") {
            let commands = self.console.handle_message(cs);
            self.send_console_commands(commands);
        }
    }

    /// Diff a status message against the mirrored state and notify once if
    /// anything changed.
    fn apply_status(&mut self, state: NodeState, doc: &Value) {
        let pkg_name = wire::str_field(doc, "name").unwrap_or("");
        let pkg_arch = wire::str_field(doc, "arch").unwrap_or("");
        let pkg_version = wire::str_field(doc, "version").unwrap_or("");
        let fail_reason = wire::str_field(doc, "reason").unwrap_or("");

        let changed = state != self.state
            || pkg_name != self.pkg_name
            || pkg_arch != self.pkg_arch
            || pkg_version != self.pkg_version
            || fail_reason != self.fail_reason;

        self.state = state;
        self.pkg_name = pkg_name.to_string();
        self.pkg_arch = pkg_arch.to_string();
        self.pkg_version = pkg_version.to_string();
        self.fail_reason = fail_reason.to_string();

        if changed {
            for observer in self.subscribers.snapshot() {
                observer.on_state_changed(state);
            }
        }
    }

    /// Age the liveness counter; called once per second.
    pub(crate) fn tick(&mut self) {
        let was_responding = self.is_responding();
        self.last_state_update += 1;
        if self.last_state_update > STATUS_QUERY_AGE {
            self.query_status();
        }
        if was_responding && !self.is_responding() {
            for observer in self.subscribers.snapshot() {
                observer.on_responding_changed(false);
            }
        }
    }

    pub fn request_start_build(&self, name: &str, arch: &str, version: &str) {
        self.send(json!({
            "action": "start_build",
            "name": name,
            "arch": arch,
            "version": version,
        }));
    }

    pub fn request_abort_build(&self) {
        self.send(json!({ "action": "abort_build" }));
    }

    pub fn request_reset(&self) {
        self.send(json!({ "action": "reset" }));
    }

    pub fn request_enable_maintenance(&self) {
        self.send(json!({ "action": "enable_maintenance" }));
    }

    pub fn request_disable_maintenance(&self) {
        self.send(json!({ "action": "disable_maintenance" }));
    }

    /// Subscribe to the node's console output. A missing key yields an
    /// inert handle.
    pub fn subscribe_to_console(&mut self, sink: Arc<dyn ConsoleSink>, key: Option<SubscriberKey>) -> ConsoleSubscription {
        let (subscription, commands) = self.console.subscribe(sink, key);
        self.send_console_commands(commands);
        subscription
    }

    pub fn unsubscribe_from_console(&mut self, subscription: ConsoleSubscription) {
        self.console.unsubscribe(subscription);
    }

    /// Replay the console stream from the beginning for every
    /// subscription.
    pub fn console_reconnect(&mut self) {
        let commands = self.console.reconnect();
        self.send_console_commands(commands);
    }

    /// Forward terminal input to the process running on the node.
    pub fn send_console_input(&self, data: &[u8]) {
        self.send(json!({
            "console_streaming": {
                "msg": "input",
                "data": wire::encode_base64(data),
            }
        }));
    }

    fn query_status(&self) {
        self.send(json!({ "action": "get_status" }));
    }

    fn send_console_commands(&self, commands: Vec<ConsoleCommand>) {
        for command in commands {
            self.send(json!({ "console_streaming": command.to_wire() }));
        }
    }

    fn send(&self, doc: Value) {
        self.overlay.send(wire::encode_document(&doc), self.current_address, PROTO_NODE);
    }
}
