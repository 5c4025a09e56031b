//! One-shot commands against a single peer.
//!
//! A command run discovers the target peer, issues the command at its
//! current overlay address and lingers briefly so error replies still reach
//! the terminal before the process exits.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use structopt::StructOpt;
use tokio::sync::mpsc;

use kiln_client::{ClusterProxy, MasterObserver, NodeObserver, OverlayEvent, SubscriberKey, YambNode};
use kiln_core::Architecture;

/// How long discovery may take before the command fails.
const DISCOVERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// How long to keep listening for a reply after sending the command.
const LINGER: std::time::Duration = std::time::Duration::from_secs(2);

const CMD_KEY: SubscriberKey = SubscriberKey::new(1);

#[derive(StructOpt)]
pub enum MasterCmd {
    /// Start building for the given architecture.
    #[structopt(name = "start")]
    Start {
        /// Target architecture: i386 or amd64.
        arch: String,
    },
    /// Stop the master.
    #[structopt(name = "stop")]
    Stop,
    /// Open the admission valve.
    #[structopt(name = "open")]
    Open,
    /// Close the admission valve.
    #[structopt(name = "close")]
    Close,
}

#[derive(StructOpt)]
pub enum NodeCmd {
    /// Start building a package on the node.
    #[structopt(name = "start-build")]
    StartBuild {
        name: String,
        arch: String,
        version: String,
    },
    /// Abort the running build.
    #[structopt(name = "abort-build")]
    AbortBuild,
    /// Reset the node back to idle.
    #[structopt(name = "reset")]
    Reset,
    /// Take the node out of rotation.
    #[structopt(name = "enable-maintenance")]
    EnableMaintenance,
    /// Put the node back into rotation.
    #[structopt(name = "disable-maintenance")]
    DisableMaintenance,
}

pub async fn run_master(hub: &str, identity: &str, cmd: MasterCmd) -> Result<()> {
    let arch = match &cmd {
        MasterCmd::Start { arch } => match Architecture::from_wire(arch) {
            Some(arch) => Some(arch),
            None => bail!("unknown architecture `{}`, expected i386 or amd64", arch),
        },
        _ => None,
    };

    let (mut cluster, mut events) = connect(hub)?;
    discover(&mut cluster, &mut events, |c| c.get_master(identity).is_some())
        .await
        .with_context(|| format!("build master `{}` did not answer discovery", identity))?;

    let master = cluster.get_master_mut(identity).expect("discovered master exists");
    master.subscribe(CMD_KEY, Arc::new(ReplyPrinter));
    match cmd {
        MasterCmd::Start { .. } => master.start(arch.expect("arch parsed above"))?,
        MasterCmd::Stop => master.stop(),
        MasterCmd::Open => master.open(),
        MasterCmd::Close => master.close(),
    }
    tracing::info!(master = identity, "command sent");

    linger(&mut cluster, &mut events).await;
    Ok(())
}

pub async fn run_node(hub: &str, identity: &str, cmd: NodeCmd) -> Result<()> {
    let (mut cluster, mut events) = connect(hub)?;
    discover(&mut cluster, &mut events, |c| c.get_node(identity).is_some())
        .await
        .with_context(|| format!("build node `{}` did not answer discovery", identity))?;

    let node = cluster.get_node_mut(identity).expect("discovered node exists");
    node.subscribe_to_state(CMD_KEY, Arc::new(ReplyPrinter));
    match cmd {
        NodeCmd::StartBuild { name, arch, version } => node.request_start_build(&name, &arch, &version),
        NodeCmd::AbortBuild => node.request_abort_build(),
        NodeCmd::Reset => node.request_reset(),
        NodeCmd::EnableMaintenance => node.request_enable_maintenance(),
        NodeCmd::DisableMaintenance => node.request_disable_maintenance(),
    }
    tracing::info!(node = identity, "command sent");

    linger(&mut cluster, &mut events).await;
    Ok(())
}

fn connect(hub: &str) -> Result<(ClusterProxy, mpsc::Receiver<OverlayEvent>)> {
    let (node, events) = YambNode::new(hub).context("error creating yamb node")?;
    let mut cluster = ClusterProxy::new(Arc::new(node));
    cluster.connect().context("error connecting to yamb hub")?;
    Ok((cluster, events))
}

/// Drive the cluster until `found` is satisfied or the discovery timeout
/// elapses.
async fn discover(
    cluster: &mut ClusterProxy, events: &mut mpsc::Receiver<OverlayEvent>, found: impl Fn(&ClusterProxy) -> bool,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + DISCOVERY_TIMEOUT;
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        if found(cluster) {
            return Ok(());
        }
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => cluster.handle_event(event),
                None => bail!("overlay closed during discovery"),
            },
            _ = tick.tick() => cluster.tick(),
            _ = tokio::time::sleep_until(deadline) => bail!("discovery timed out"),
        }
    }
}

/// Keep the event loop running briefly so replies still arrive.
async fn linger(cluster: &mut ClusterProxy, events: &mut mpsc::Receiver<OverlayEvent>) {
    let deadline = tokio::time::Instant::now() + LINGER;
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => cluster.handle_event(event),
                None => break,
            },
            _ = tick.tick() => cluster.tick(),
            _ = tokio::time::sleep_until(deadline) => break,
        }
    }
}

/// Prints peer replies that matter for a one-shot command.
struct ReplyPrinter;

impl MasterObserver for ReplyPrinter {
    fn on_error_received(&self, error: &str) {
        tracing::warn!(error, "master rejected the command");
    }
}

impl NodeObserver for ReplyPrinter {
    fn on_error_received(&self, error: &str) {
        tracing::warn!(error, "node rejected the command");
    }
}
