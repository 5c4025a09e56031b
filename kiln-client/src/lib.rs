//! Client-side proxy core for the kiln build cluster.
//!
//! The cluster consists of build nodes (execute package builds), build
//! masters (coordinate build queues across nodes) and clients like this one
//! (monitor and control). All communication is brokered through the yamb
//! message-bus overlay, which offers best-effort addressed datagram delivery
//! between registered endpoints.
//!
//! The [`ClusterProxy`] is a long-lived in-process representation of the
//! remote cluster. It discovers peers, tracks their liveness, dispatches
//! commands, mirrors peer state and fans out change notifications to
//! subscribers. Per-peer console output is reassembled into an ordered byte
//! stream from lossy chunked transport by the console subsystem.
//!
//! All proxy state belongs to a single owner and is driven from one logical
//! event loop: feed [`ClusterProxy::handle_event`] with overlay events and
//! call [`ClusterProxy::tick`] once per second. There are no locks; observer
//! callbacks run synchronously on that loop.

mod cluster;
#[cfg(test)]
mod cluster_test;
mod console;
#[cfg(test)]
mod fixtures;
mod master;
mod node;
#[cfg(test)]
mod node_test;
pub mod overlay;
mod subscriber;
mod wire;

pub use cluster::{ClusterProxy, ConnectionObserver, ListObserver};
pub use console::{ConsoleSink, ConsoleSubscription};
pub use master::{MasterControlState, MasterObserver, MasterProxy};
pub use node::{NodeObserver, NodeProxy};
pub use overlay::yamb::{YambNode, DEFAULT_HUB_PORT};
pub use overlay::{Overlay, OverlayAddr, OverlayEvent, OverlayFrame, BROADCAST_ADDR, PROTO_MASTER, PROTO_NODE};
pub use subscriber::SubscriberKey;
