//! Build master proxy.
//!
//! One `MasterProxy` exists per discovered build master. It mirrors the
//! master's package queues, node lists and control state, runs the
//! subscription handshake with the master-side protocol, and hosts the
//! master's console stream.
//!
//! The master channel is a broadcast topic: commands sent by other clients
//! are reflected to everyone. Inbound documents carrying a `cmd` field are
//! therefore ignored wholesale; only documents without one are server
//! responses.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};

use kiln_core::{AppError, Architecture, MasterState, Package};

use crate::console::{ConsoleCommand, ConsoleReassembler, ConsoleSink, ConsoleSubscription};
use crate::overlay::{Overlay, OverlayAddr, PROTO_MASTER};
use crate::subscriber::{SubscriberKey, SubscriberSet};
use crate::wire;

/// Seconds without a response after which a master counts as unresponsive.
const RESPONSE_TIMEOUT: u64 = 30;

/// Seconds between refreshes.
const REFRESH_INTERVAL: u64 = 10;

/// Initial counter value: far past every threshold, so a fresh proxy is
/// unresponsive until its first message.
const NEVER_RESPONDED: u64 = 10_000;

/// The scalar control state of a build master, delivered with state-change
/// notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MasterControlState {
    pub state: MasterState,
    pub architecture: Architecture,
    /// Latched error flag.
    pub error: bool,
    /// Admission valve: when closed, no new packages enter the build queue.
    pub valve: bool,
}

impl Default for MasterControlState {
    fn default() -> Self {
        Self {
            state: MasterState::Off,
            architecture: Architecture::I386,
            error: false,
            valve: false,
        }
    }
}

/// An observer of a build master proxy.
///
/// For one inbound message the notifications fire in a fixed order:
/// responding, remaining, build queue, building set, nodes, state, error.
/// The default method bodies ignore the notification.
pub trait MasterObserver: Send + Sync {
    fn on_responding_changed(&self, _responding: bool) {}
    fn on_remaining_changed(&self, _remaining: &BTreeSet<Package>) {}
    fn on_build_queue_changed(&self, _queue: &[Package]) {}
    fn on_building_set_changed(&self, _building: &BTreeSet<Package>) {}
    fn on_nodes_changed(&self, _idle: &[String], _busy: &[String]) {}
    fn on_state_changed(&self, _control: MasterControlState) {}
    /// The master reported an error message. Does not mutate proxy state.
    fn on_error_received(&self, _error: &str) {}
}

/// Client-side representation of one build master.
pub struct MasterProxy {
    identity: String,
    overlay: Arc<dyn Overlay>,
    current_address: OverlayAddr,

    remaining: BTreeSet<Package>,
    build_queue: Vec<Package>,
    building_set: BTreeSet<Package>,
    idle_nodes: Vec<String>,
    busy_nodes: Vec<String>,
    control: MasterControlState,

    /// Seconds since the last response from the master.
    last_response: u64,
    /// Seconds since the last refresh was sent.
    last_refresh_sent: u64,

    subscribers: SubscriberSet<dyn MasterObserver>,
    console: ConsoleReassembler,
}

impl MasterProxy {
    pub(crate) fn new(overlay: Arc<dyn Overlay>, identity: String, address: OverlayAddr) -> Self {
        let mut master = Self {
            identity,
            overlay,
            current_address: address,
            remaining: BTreeSet::new(),
            build_queue: Vec::new(),
            building_set: BTreeSet::new(),
            idle_nodes: Vec::new(),
            busy_nodes: Vec::new(),
            control: MasterControlState::default(),
            last_response: NEVER_RESPONDED,
            last_refresh_sent: NEVER_RESPONDED,
            subscribers: SubscriberSet::default(),
            console: ConsoleReassembler::default(),
        };
        master.refresh();
        master
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn overlay_address(&self) -> OverlayAddr {
        self.current_address
    }

    pub fn remaining(&self) -> &BTreeSet<Package> {
        &self.remaining
    }

    /// The queue of packages to build next; the front builds first.
    pub fn build_queue(&self) -> &[Package] {
        &self.build_queue
    }

    pub fn building_set(&self) -> &BTreeSet<Package> {
        &self.building_set
    }

    pub fn idle_nodes(&self) -> &[String] {
        &self.idle_nodes
    }

    pub fn busy_nodes(&self) -> &[String] {
        &self.busy_nodes
    }

    pub fn control_state(&self) -> MasterControlState {
        self.control
    }

    /// Whether the master has responded within the response timeout.
    pub fn is_responding(&self) -> bool {
        self.last_response < RESPONSE_TIMEOUT
    }

    /// Attach an observer.
    ///
    /// The first observer switches the proxy from bare `identify` pings to
    /// the full subscription handshake with the master.
    pub fn subscribe(&mut self, key: SubscriberKey, observer: Arc<dyn MasterObserver>) {
        let first = self.subscribers.is_empty();
        self.subscribers.insert(key, observer);
        if first {
            self.refresh();
        }
    }

    pub fn unsubscribe(&mut self, key: SubscriberKey) {
        self.subscribers.remove(key);
    }

    /// Update the master's overlay address.
    ///
    /// An address change means the master may have restarted behind the
    /// same identity, so everything is refreshed.
    pub(crate) fn set_overlay_addr(&mut self, address: OverlayAddr) {
        if address != self.current_address {
            self.current_address = address;
            self.refresh();
        }
    }

    /// Interpret a message from the master channel.
    pub(crate) fn handle_message(&mut self, doc: &Value) {
        // Reflections of other clients' commands on the broadcast topic.
        if doc.get("cmd").is_some() {
            return;
        }

        let was_responding = self.is_responding();
        self.last_response = 0;
        let responding_changed = !was_responding;

        let remaining_changed = match wire::package_pairs(doc, "remaining") {
            Some(pairs) => {
                let set: BTreeSet<Package> = pairs.into_iter().collect();
                let changed = set != self.remaining;
                self.remaining = set;
                changed
            }
            None => false,
        };

        let build_queue_changed = match wire::package_pairs(doc, "build-queue") {
            Some(queue) => {
                let changed = queue != self.build_queue;
                self.build_queue = queue;
                changed
            }
            None => false,
        };

        let building_set_changed = match wire::package_pairs(doc, "building-set") {
            Some(pairs) => {
                let set: BTreeSet<Package> = pairs.into_iter().collect();
                let changed = set != self.building_set;
                self.building_set = set;
                changed
            }
            None => false,
        };

        let mut nodes_changed = false;
        if let Some(idle) = wire::string_items(doc, "idle-nodes") {
            nodes_changed |= idle != self.idle_nodes;
            self.idle_nodes = idle;
        }
        if let Some(busy) = wire::string_items(doc, "busy-nodes") {
            nodes_changed |= busy != self.busy_nodes;
            self.busy_nodes = busy;
        }

        let state_changed = self.apply_control_fields(doc);

        // The error field is polymorphic: a bool feeds the latched flag
        // above, a string is a human-readable message. Both may appear and
        // are read independently.
        let error_msg = wire::str_field(doc, "error").map(str::to_string);

        let subscribers = self.subscribers.snapshot();
        if responding_changed {
            for observer in &subscribers {
                observer.on_responding_changed(true);
            }
        }
        if remaining_changed {
            for observer in &subscribers {
                observer.on_remaining_changed(&self.remaining);
            }
        }
        if build_queue_changed {
            for observer in &subscribers {
                observer.on_build_queue_changed(&self.build_queue);
            }
        }
        if building_set_changed {
            for observer in &subscribers {
                observer.on_building_set_changed(&self.building_set);
            }
        }
        if nodes_changed {
            for observer in &subscribers {
                observer.on_nodes_changed(&self.idle_nodes, &self.busy_nodes);
            }
        }
        if state_changed {
            for observer in &subscribers {
                observer.on_state_changed(self.control);
            }
        }
        if let Some(error) = error_msg {
            for observer in &subscribers {
                observer.on_error_received(&error);
            }
        }

        if let Some(cs) = doc.get("console_streaming") {
            let commands = self.console.handle_message(cs);
            self.send_console_commands(commands);
        }
    }

    /// Read the scalar control fields, each independently, keeping prior
    /// values on parse failures.
    fn apply_control_fields(&mut self, doc: &Value) -> bool {
        let mut control = self.control;
        if let Some(state_str) = wire::str_field(doc, "state") {
            match MasterState::from_wire(state_str) {
                Some(state) => control.state = state,
                None => {
                    tracing::debug!(identity = %self.identity, state = state_str, "master reported unknown state");
                }
            }
        }
        if let Some(arch_str) = wire::str_field(doc, "arch") {
            match Architecture::from_wire(arch_str) {
                Some(arch) => control.architecture = arch,
                None => {
                    tracing::debug!(identity = %self.identity, arch = arch_str, "master reported unknown architecture");
                }
            }
        }
        if let Some(error) = wire::bool_field(doc, "error") {
            control.error = error;
        }
        if let Some(valve) = wire::bool_field(doc, "valve") {
            control.valve = valve;
        }
        let changed = control != self.control;
        self.control = control;
        changed
    }

    /// Age the liveness counters; called once per second.
    pub(crate) fn tick(&mut self) {
        let was_responding = self.is_responding();
        self.last_response += 1;
        self.last_refresh_sent += 1;
        if self.last_refresh_sent > REFRESH_INTERVAL {
            self.refresh();
        }
        if was_responding && !self.is_responding() {
            for observer in self.subscribers.snapshot() {
                observer.on_responding_changed(false);
            }
        }
    }

    /// Re-query the master.
    ///
    /// With observers attached this runs the full subscription handshake;
    /// without any it is a bare `identify` ping, which keeps the liveness
    /// signal without the cost of state transfer.
    pub fn refresh(&mut self) {
        if self.subscribers.is_empty() {
            self.send_cmd("identify");
        } else {
            self.send_cmd("subscribe");
            self.send_cmd("get-state");
            self.send_cmd("get-remaining");
            self.send_cmd("get-build-queue");
            self.send_cmd("get-building-set");
            self.send_cmd("get-nodes");
        }
        self.last_refresh_sent = 0;
    }

    /// Start building for the given architecture.
    pub fn start(&self, arch: Architecture) -> Result<(), AppError> {
        if arch == Architecture::Invalid {
            return Err(AppError::InvalidArchitecture);
        }
        self.send(json!({
            "identity": self.identity,
            "cmd": "start",
            "arch": arch.as_str(),
        }));
        Ok(())
    }

    pub fn stop(&self) {
        self.send_cmd("stop");
    }

    /// Open the admission valve.
    pub fn open(&self) {
        self.send_cmd("open");
    }

    /// Close the admission valve.
    pub fn close(&self) {
        self.send_cmd("close");
    }

    /// Subscribe to the master's console output. A missing key yields an
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

    fn send_cmd(&self, cmd: &str) {
        self.send(json!({
            "identity": self.identity,
            "cmd": cmd,
        }));
    }

    fn send_console_commands(&self, commands: Vec<ConsoleCommand>) {
        for command in commands {
            self.send(json!({
                "identity": self.identity,
                "console_streaming": command.to_wire(),
            }));
        }
    }

    fn send(&self, doc: Value) {
        self.overlay.send(wire::encode_document(&doc), self.current_address, PROTO_MASTER);
    }
}
