//! The watch monitor: follow everything the cluster reports.

use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};

use kiln_client::{
    ClusterProxy, ConnectionObserver, ListObserver, MasterControlState, MasterObserver, NodeObserver, SubscriberKey,
    YambNode,
};
use kiln_core::{NodeState, Package};

/// Key used for all of the monitor's subscriptions; the monitor attaches at
/// most one observer per proxy and kind.
const WATCH_KEY: SubscriberKey = SubscriberKey::new(1);

pub async fn run(hub: &str) -> Result<()> {
    let (node, mut events) = YambNode::new(hub).context("error creating yamb node")?;
    let mut cluster = ClusterProxy::new(Arc::new(node));

    cluster.subscribe_to_connection_state(WATCH_KEY, Arc::new(ConnectionPrinter));
    cluster.subscribe_to_node_list(WATCH_KEY, Arc::new(ListPrinter { class: "build node" }));
    cluster.subscribe_to_master_list(WATCH_KEY, Arc::new(ListPrinter { class: "build master" }));
    cluster.connect().context("error connecting to yamb hub")?;
    tracing::info!(hub, "watching the build cluster");

    let mut known_nodes = HashSet::new();
    let mut known_masters = HashSet::new();
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    cluster.handle_event(event);
                    attach_new_peers(&mut cluster, &mut known_nodes, &mut known_masters);
                }
                None => break,
            },
            _ = tick.tick() => cluster.tick(),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("watch finished");
    Ok(())
}

/// Subscribe a printer to every peer discovered since the last call.
fn attach_new_peers(cluster: &mut ClusterProxy, known_nodes: &mut HashSet<String>, known_masters: &mut HashSet<String>) {
    for identity in cluster.list_node_identities() {
        if known_nodes.insert(identity.clone()) {
            if let Some(node) = cluster.get_node_mut(&identity) {
                node.subscribe_to_state(WATCH_KEY, Arc::new(NodePrinter { identity: identity.clone() }));
            }
        }
    }
    for identity in cluster.list_master_identities() {
        if known_masters.insert(identity.clone()) {
            if let Some(master) = cluster.get_master_mut(&identity) {
                master.subscribe(WATCH_KEY, Arc::new(MasterPrinter { identity: identity.clone() }));
            }
        }
    }
}

struct ConnectionPrinter;

impl ConnectionObserver for ConnectionPrinter {
    fn on_established(&self) {
        tracing::info!("hub connection established");
    }

    fn on_lost(&self) {
        tracing::warn!("hub connection lost");
    }

    fn on_failed(&self, error: &str) {
        tracing::error!(error, "hub connection failed");
    }
}

struct ListPrinter {
    class: &'static str,
}

impl ListObserver for ListPrinter {
    fn on_list_changed(&self) {
        tracing::info!("{} list changed", self.class);
    }
}

struct NodePrinter {
    identity: String,
}

impl NodeObserver for NodePrinter {
    fn on_responding_changed(&self, responding: bool) {
        if responding {
            tracing::info!(node = %self.identity, "node is responding");
        } else {
            tracing::warn!(node = %self.identity, "node stopped responding");
        }
    }

    fn on_state_changed(&self, state: NodeState) {
        tracing::info!(node = %self.identity, state = %state, "node state changed");
    }

    fn on_error_received(&self, error: &str) {
        tracing::warn!(node = %self.identity, error, "node reported an error");
    }
}

struct MasterPrinter {
    identity: String,
}

impl MasterObserver for MasterPrinter {
    fn on_responding_changed(&self, responding: bool) {
        if responding {
            tracing::info!(master = %self.identity, "master is responding");
        } else {
            tracing::warn!(master = %self.identity, "master stopped responding");
        }
    }

    fn on_remaining_changed(&self, remaining: &BTreeSet<Package>) {
        tracing::info!(master = %self.identity, remaining = remaining.len(), "remaining set changed");
    }

    fn on_build_queue_changed(&self, queue: &[Package]) {
        let front = queue.first().map(ToString::to_string).unwrap_or_else(|| "-".into());
        tracing::info!(master = %self.identity, queued = queue.len(), next = %front, "build queue changed");
    }

    fn on_building_set_changed(&self, building: &BTreeSet<Package>) {
        tracing::info!(master = %self.identity, building = building.len(), "building set changed");
    }

    fn on_nodes_changed(&self, idle: &[String], busy: &[String]) {
        tracing::info!(master = %self.identity, idle = idle.len(), busy = busy.len(), "node assignment changed");
    }

    fn on_state_changed(&self, control: MasterControlState) {
        tracing::info!(
            master = %self.identity,
            state = %control.state,
            arch = %control.architecture,
            error = control.error,
            valve_open = control.valve,
            "master state changed"
        );
    }

    fn on_error_received(&self, error: &str) {
        tracing::warn!(master = %self.identity, error, "master reported an error");
    }
}
