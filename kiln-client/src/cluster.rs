//! Cluster proxy: the binding point to the overlay and owner of all peer
//! proxies.
//!
//! The cluster proxy runs discovery over both protocol channels, routes
//! inbound messages to the peer proxy matching the sender's identity
//! (creating proxies lazily for previously unseen identities), and ages
//! every peer's liveness through the one-second tick. Peer proxies are
//! owned exclusively by the cluster proxy and live until it is dropped;
//! an unresponsive peer is flagged, never removed.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use crate::master::MasterProxy;
use crate::node::NodeProxy;
use crate::overlay::{Overlay, OverlayEvent, OverlayFrame, BROADCAST_ADDR, PROTO_MASTER, PROTO_NODE};
use crate::subscriber::{SubscriberKey, SubscriberSet};
use crate::wire;

/// Seconds between discovery broadcasts.
const SEARCH_INTERVAL: u64 = 30;

/// An observer of the overlay connection lifecycle.
///
/// The default method bodies ignore the notification.
pub trait ConnectionObserver: Send + Sync {
    fn on_established(&self) {}
    fn on_lost(&self) {}
    fn on_failed(&self, _error: &str) {}
}

/// An observer of the set of known peers of one class.
pub trait ListObserver: Send + Sync {
    fn on_list_changed(&self);
}

/// The long-lived in-process representation of the remote build cluster.
pub struct ClusterProxy {
    overlay: Arc<dyn Overlay>,

    /// Known build nodes, in discovery order.
    nodes: Vec<NodeProxy>,
    /// Known build masters, in discovery order.
    masters: Vec<MasterProxy>,

    connection_subscribers: SubscriberSet<dyn ConnectionObserver>,
    node_list_subscribers: SubscriberSet<dyn ListObserver>,
    master_list_subscribers: SubscriberSet<dyn ListObserver>,

    nodes_last_searched: u64,
    masters_last_searched: u64,
}

impl ClusterProxy {
    pub fn new(overlay: Arc<dyn Overlay>) -> Self {
        Self {
            overlay,
            nodes: Vec::new(),
            masters: Vec::new(),
            connection_subscribers: SubscriberSet::default(),
            node_list_subscribers: SubscriberSet::default(),
            master_list_subscribers: SubscriberSet::default(),
            nodes_last_searched: 0,
            masters_last_searched: 0,
        }
    }

    /// Attempt to establish the overlay connection. Idempotent; subsequent
    /// calls re-attempt. Asynchronous connection failures surface through
    /// the connection observers instead.
    pub fn connect(&mut self) -> Result<()> {
        self.overlay.connect()
    }

    pub fn subscribe_to_connection_state(&mut self, key: SubscriberKey, observer: Arc<dyn ConnectionObserver>) {
        self.connection_subscribers.insert(key, observer);
    }

    pub fn unsubscribe_from_connection_state(&mut self, key: SubscriberKey) {
        self.connection_subscribers.remove(key);
    }

    pub fn subscribe_to_node_list(&mut self, key: SubscriberKey, observer: Arc<dyn ListObserver>) {
        self.node_list_subscribers.insert(key, observer);
    }

    pub fn unsubscribe_from_node_list(&mut self, key: SubscriberKey) {
        self.node_list_subscribers.remove(key);
    }

    pub fn subscribe_to_master_list(&mut self, key: SubscriberKey, observer: Arc<dyn ListObserver>) {
        self.master_list_subscribers.insert(key, observer);
    }

    pub fn unsubscribe_from_master_list(&mut self, key: SubscriberKey) {
        self.master_list_subscribers.remove(key);
    }

    pub fn list_node_identities(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.identity().to_string()).collect()
    }

    pub fn list_master_identities(&self) -> Vec<String> {
        self.masters.iter().map(|m| m.identity().to_string()).collect()
    }

    pub fn get_node(&self, identity: &str) -> Option<&NodeProxy> {
        self.nodes.iter().find(|n| n.identity() == identity)
    }

    pub fn get_node_mut(&mut self, identity: &str) -> Option<&mut NodeProxy> {
        self.nodes.iter_mut().find(|n| n.identity() == identity)
    }

    pub fn get_master(&self, identity: &str) -> Option<&MasterProxy> {
        self.masters.iter().find(|m| m.identity() == identity)
    }

    pub fn get_master_mut(&mut self, identity: &str) -> Option<&mut MasterProxy> {
        self.masters.iter_mut().find(|m| m.identity() == identity)
    }

    /// Force an immediate discovery broadcast on both protocols.
    pub fn search_now(&mut self) {
        self.search_for_nodes();
        self.search_for_masters();
    }

    /// Feed one overlay event into the proxy.
    pub fn handle_event(&mut self, event: OverlayEvent) {
        match event {
            OverlayEvent::Established => {
                for observer in self.connection_subscribers.snapshot() {
                    observer.on_established();
                }
                self.search_for_nodes();
                self.search_for_masters();
            }
            OverlayEvent::Lost => {
                for observer in self.connection_subscribers.snapshot() {
                    observer.on_lost();
                }
            }
            OverlayEvent::Failed(error) => {
                for observer in self.connection_subscribers.snapshot() {
                    observer.on_failed(&error);
                }
            }
            OverlayEvent::Frame(frame) => match frame.protocol {
                PROTO_NODE => self.handle_node_frame(frame),
                PROTO_MASTER => self.handle_master_frame(frame),
                other => tracing::trace!(protocol = other, "ignoring frame for unregistered protocol"),
            },
        }
    }

    /// Age discovery counters and every peer proxy; called once per second.
    pub fn tick(&mut self) {
        self.nodes_last_searched += 1;
        if self.nodes_last_searched >= SEARCH_INTERVAL {
            self.search_for_nodes();
        }
        self.masters_last_searched += 1;
        if self.masters_last_searched >= SEARCH_INTERVAL {
            self.search_for_masters();
        }

        for node in &mut self.nodes {
            node.tick();
        }
        for master in &mut self.masters {
            master.tick();
        }
    }

    #[tracing::instrument(level = "trace", skip(self, frame))]
    fn handle_node_frame(&mut self, frame: OverlayFrame) {
        let doc = match wire::parse_document(&frame.payload) {
            Some(doc) => doc,
            None => return,
        };
        let identity = match wire::str_field(&doc, "identity") {
            Some(identity) => identity.to_string(),
            None => {
                tracing::debug!("dropping node message without identity");
                return;
            }
        };

        match self.nodes.iter_mut().find(|n| n.identity() == identity) {
            Some(node) => {
                node.set_overlay_addr(frame.source);
                node.handle_message(&doc);
            }
            None => {
                tracing::debug!(identity = %identity, source = format_args!("{:#010x}", frame.source), "discovered build node");
                let mut node = NodeProxy::new(self.overlay.clone(), identity, frame.source);
                node.handle_message(&doc);
                self.nodes.push(node);
                // Observers run only once the list reflects the new peer.
                for observer in self.node_list_subscribers.snapshot() {
                    observer.on_list_changed();
                }
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, frame))]
    fn handle_master_frame(&mut self, frame: OverlayFrame) {
        let doc = match wire::parse_document(&frame.payload) {
            Some(doc) => doc,
            None => return,
        };
        let identity = match wire::str_field(&doc, "identity") {
            Some(identity) => identity.to_string(),
            None => {
                tracing::debug!("dropping master message without identity");
                return;
            }
        };

        match self.masters.iter_mut().find(|m| m.identity() == identity) {
            Some(master) => {
                master.set_overlay_addr(frame.source);
                master.handle_message(&doc);
            }
            None => {
                tracing::debug!(identity = %identity, source = format_args!("{:#010x}", frame.source), "discovered build master");
                let mut master = MasterProxy::new(self.overlay.clone(), identity, frame.source);
                master.handle_message(&doc);
                self.masters.push(master);
                // Observers run only once the list reflects the new peer.
                for observer in self.master_list_subscribers.snapshot() {
                    observer.on_list_changed();
                }
            }
        }
    }

    fn search_for_nodes(&mut self) {
        self.overlay
            .send(wire::encode_document(&json!({ "action": "identify" })), BROADCAST_ADDR, PROTO_NODE);
        self.nodes_last_searched = 0;
    }

    fn search_for_masters(&mut self) {
        self.overlay
            .send(wire::encode_document(&json!({ "cmd": "identify" })), BROADCAST_ADDR, PROTO_MASTER);
        self.masters_last_searched = 0;
    }
}
