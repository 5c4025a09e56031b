//! Test fixtures: a recording overlay and recording observers.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::Value;

use kiln_core::{NodeState, Package};

use crate::cluster::{ConnectionObserver, ListObserver};
use crate::console::ConsoleSink;
use crate::master::{MasterControlState, MasterObserver};
use crate::node::NodeObserver;
use crate::overlay::{Overlay, OverlayAddr, OverlayEvent, OverlayFrame};

/// One payload captured from the proxy's outbound path.
#[derive(Clone, Debug)]
pub struct SentMessage {
    pub payload: Vec<u8>,
    pub destination: OverlayAddr,
    pub protocol: u16,
}

impl SentMessage {
    pub fn doc(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// An overlay stub that records every send.
#[derive(Default)]
pub struct RecordingOverlay {
    sent: Mutex<Vec<SentMessage>>,
}

impl RecordingOverlay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drain and return everything sent so far.
    pub fn take(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// Drain sends, parsed as JSON documents.
    pub fn take_docs(&self) -> Vec<(Value, OverlayAddr, u16)> {
        self.take()
            .into_iter()
            .map(|msg| {
                let doc = msg.doc().expect("recorded payload is JSON");
                (doc, msg.destination, msg.protocol)
            })
            .collect()
    }
}

impl Overlay for RecordingOverlay {
    fn connect(&self) -> Result<()> {
        Ok(())
    }

    fn send(&self, payload: Vec<u8>, destination: OverlayAddr, protocol: u16) {
        self.sent.lock().unwrap().push(SentMessage {
            payload,
            destination,
            protocol,
        });
    }
}

/// Build an inbound frame event carrying a JSON document.
pub fn inbound_frame(protocol: u16, source: OverlayAddr, doc: Value) -> OverlayEvent {
    OverlayEvent::Frame(OverlayFrame {
        source,
        destination: 1,
        protocol,
        payload: serde_json::to_vec(&doc).expect("test documents serialize"),
    })
}

/// An event log shared by the recording observers.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<String>>,
}

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

/// Records node observer notifications as `kind:value` strings.
#[derive(Default)]
pub struct RecordingNodeObserver {
    pub log: EventLog,
}

impl NodeObserver for RecordingNodeObserver {
    fn on_responding_changed(&self, responding: bool) {
        self.log.push(format!("responding:{}", responding));
    }

    fn on_state_changed(&self, state: NodeState) {
        self.log.push(format!("state:{}", state));
    }

    fn on_error_received(&self, error: &str) {
        self.log.push(format!("error:{}", error));
    }
}

/// Records master observer notifications in arrival order.
#[derive(Default)]
pub struct RecordingMasterObserver {
    pub log: EventLog,
}

impl MasterObserver for RecordingMasterObserver {
    fn on_responding_changed(&self, responding: bool) {
        self.log.push(format!("responding:{}", responding));
    }

    fn on_remaining_changed(&self, remaining: &std::collections::BTreeSet<Package>) {
        self.log.push(format!("remaining:{}", remaining.len()));
    }

    fn on_build_queue_changed(&self, queue: &[Package]) {
        self.log.push(format!("build-queue:{}", queue.len()));
    }

    fn on_building_set_changed(&self, building: &std::collections::BTreeSet<Package>) {
        self.log.push(format!("building-set:{}", building.len()));
    }

    fn on_nodes_changed(&self, idle: &[String], busy: &[String]) {
        self.log.push(format!("nodes:{}/{}", idle.len(), busy.len()));
    }

    fn on_state_changed(&self, control: MasterControlState) {
        self.log.push(format!("state:{}", control.state));
    }

    fn on_error_received(&self, error: &str) {
        self.log.push(format!("error:{}", error));
    }
}

/// Records connection lifecycle notifications.
#[derive(Default)]
pub struct RecordingConnectionObserver {
    pub log: EventLog,
}

impl ConnectionObserver for RecordingConnectionObserver {
    fn on_established(&self) {
        self.log.push("established");
    }

    fn on_lost(&self) {
        self.log.push("lost");
    }

    fn on_failed(&self, error: &str) {
        self.log.push(format!("failed:{}", error));
    }
}

/// Counts list-changed notifications.
#[derive(Default)]
pub struct RecordingListObserver {
    changes: Mutex<u32>,
}

impl RecordingListObserver {
    pub fn changes(&self) -> u32 {
        *self.changes.lock().unwrap()
    }
}

impl ListObserver for RecordingListObserver {
    fn on_list_changed(&self) {
        *self.changes.lock().unwrap() += 1;
    }
}

/// Collects console deliveries.
#[derive(Default)]
pub struct RecordingSink {
    chunks: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deliveries(&self) -> Vec<Vec<u8>> {
        self.chunks.lock().unwrap().clone()
    }

    /// Everything delivered so far, concatenated.
    pub fn received(&self) -> Vec<u8> {
        self.chunks.lock().unwrap().concat()
    }
}

impl ConsoleSink for RecordingSink {
    fn on_data(&self, data: &[u8]) {
        self.chunks.lock().unwrap().push(data.to_vec());
    }
}

/// Default observer implementations are no-ops; used to assert they keep
/// proxies usable without overriding anything.
pub struct SilentMasterObserver;

impl MasterObserver for SilentMasterObserver {}
