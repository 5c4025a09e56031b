//! Minimal yamb-node TCP binding.
//!
//! Frames are big-endian `[u32 length][u16 protocol][u32 source]
//! [u32 destination][payload]` where `length` covers everything after
//! itself. On connect the hub assigns the node its overlay address as a
//! single big-endian `u32` greeting. Frames whose source equals the node's
//! own address are reflections of its broadcasts and are suppressed.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use kiln_core::AppError;

use crate::overlay::{Overlay, OverlayAddr, OverlayEvent, OverlayFrame};

/// The TCP port yamb hubs listen on.
pub const DEFAULT_HUB_PORT: u16 = 6948;

/// Upper bound on a frame length word; larger values indicate a corrupted
/// stream and force a reconnect.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Bytes of the frame header following the length word.
const FRAME_HEADER_LEN: u32 = 10;

const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

/// An outbound payload handed to the writer task.
type Outbound = (Vec<u8>, OverlayAddr, u16);

/// A yamb overlay node bound to one hub.
///
/// This is a cheap handle; clones share the same connection.
#[derive(Clone)]
pub struct YambNode {
    shared: Arc<Shared>,
}

struct Shared {
    hub: SocketAddr,
    events_tx: mpsc::Sender<OverlayEvent>,
    state: Mutex<ConnState>,
}

#[derive(Default)]
struct ConnState {
    /// Channel into the writer task of the live connection, if any.
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    /// Whether the connection task has been spawned.
    running: bool,
}

impl YambNode {
    /// Create a node for the given hub address.
    ///
    /// The address is either a bare IP (`::1`, `10.0.0.7`) using
    /// [`DEFAULT_HUB_PORT`], or a full socket address. Returns the node
    /// along with the receiver of its overlay events.
    pub fn new(hub_addr: &str) -> Result<(Self, mpsc::Receiver<OverlayEvent>), AppError> {
        let hub = if let Ok(ip) = hub_addr.parse::<IpAddr>() {
            SocketAddr::new(ip, DEFAULT_HUB_PORT)
        } else {
            hub_addr
                .parse::<SocketAddr>()
                .map_err(|_| AppError::InvalidHubAddress(hub_addr.to_string()))?
        };
        let (events_tx, events_rx) = mpsc::channel(1024);
        let node = Self {
            shared: Arc::new(Shared {
                hub,
                events_tx,
                state: Mutex::new(ConnState::default()),
            }),
        };
        Ok((node, events_rx))
    }

    /// The hub this node is bound to.
    pub fn hub_addr(&self) -> SocketAddr {
        self.shared.hub
    }
}

impl Overlay for YambNode {
    fn connect(&self) -> Result<()> {
        let mut state = self.shared.state.lock().expect("yamb state lock poisoned");
        if !state.running {
            state.running = true;
            tokio::spawn(connection_task(self.shared.clone()));
        }
        Ok(())
    }

    fn send(&self, payload: Vec<u8>, destination: OverlayAddr, protocol: u16) {
        let state = self.shared.state.lock().expect("yamb state lock poisoned");
        match &state.outbound {
            Some(tx) => {
                let _res = tx.send((payload, destination, protocol));
            }
            None => tracing::trace!(destination, protocol, "dropping send while disconnected"),
        }
    }
}

/// Maintain the hub connection, reconnecting with a fixed delay.
async fn connection_task(shared: Arc<Shared>) {
    loop {
        let stream = match TcpStream::connect(shared.hub).await {
            Ok(stream) => stream,
            Err(err) => {
                let _res = shared.events_tx.send(OverlayEvent::Failed(err.to_string())).await;
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        if let Err(err) = drive_connection(&shared, stream).await {
            tracing::debug!(error = ?err, "yamb hub connection closed");
        }
        shared.state.lock().expect("yamb state lock poisoned").outbound = None;
        let _res = shared.events_tx.send(OverlayEvent::Lost).await;
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Run one established connection until it fails.
async fn drive_connection(shared: &Shared, mut stream: TcpStream) -> Result<()> {
    let own_addr = stream.read_u32().await.context("error reading address assignment from hub")?;
    let (mut reader, mut writer) = stream.into_split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    shared.state.lock().expect("yamb state lock poisoned").outbound = Some(outbound_tx);
    let _res = shared.events_tx.send(OverlayEvent::Established).await;
    tracing::debug!(own_addr = format_args!("{:#010x}", own_addr), "connected to yamb hub");

    let writer_handle = tokio::spawn(async move {
        while let Some((payload, destination, protocol)) = outbound_rx.recv().await {
            let len = FRAME_HEADER_LEN + payload.len() as u32;
            let mut frame = Vec::with_capacity(4 + len as usize);
            frame.extend_from_slice(&len.to_be_bytes());
            frame.extend_from_slice(&protocol.to_be_bytes());
            frame.extend_from_slice(&own_addr.to_be_bytes());
            frame.extend_from_slice(&destination.to_be_bytes());
            frame.extend_from_slice(&payload);
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let res = read_frames(shared, &mut reader, own_addr).await;
    writer_handle.abort();
    res
}

async fn read_frames(shared: &Shared, reader: &mut (impl AsyncReadExt + Unpin), own_addr: OverlayAddr) -> Result<()> {
    loop {
        let len = reader.read_u32().await.context("error reading frame length")?;
        if len < FRAME_HEADER_LEN || len > MAX_FRAME_LEN {
            anyhow::bail!("invalid frame length {} from hub", len);
        }
        let protocol = reader.read_u16().await.context("error reading frame protocol")?;
        let source = reader.read_u32().await.context("error reading frame source")?;
        let destination = reader.read_u32().await.context("error reading frame destination")?;
        let mut payload = vec![0u8; (len - FRAME_HEADER_LEN) as usize];
        reader.read_exact(&mut payload).await.context("error reading frame payload")?;

        // Reflections of our own broadcasts come back with our address.
        if source == own_addr {
            continue;
        }

        let frame = OverlayFrame {
            source,
            destination,
            protocol,
            payload,
        };
        if shared.events_tx.send(OverlayEvent::Frame(frame)).await.is_err() {
            anyhow::bail!("overlay event receiver dropped");
        }
    }
}
