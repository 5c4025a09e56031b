//! The yamb overlay contract consumed by the proxy core.
//!
//! The overlay delivers framed opaque payloads between 32-bit peer
//! addresses. The core only depends on the [`Overlay`] send capability and
//! on the [`OverlayEvent`] stream a binding emits; the concrete TCP binding
//! lives in [`yamb`] and can be replaced without touching the proxies.

pub mod yamb;

use anyhow::Result;

/// A 32-bit overlay transport address. Peer addresses may change across
/// peer restarts; stable identification is by identity string instead.
pub type OverlayAddr = u32;

/// The reserved destination address for broadcasts.
pub const BROADCAST_ADDR: OverlayAddr = 0xFFFF_FFFF;

/// The overlay protocol number of the build node channel.
pub const PROTO_NODE: u16 = 1000;
/// The overlay protocol number of the build master channel.
pub const PROTO_MASTER: u16 = 1001;

/// Send capability of an overlay binding.
///
/// Sends are fire-and-forget: a payload enqueued while the binding is not
/// connected is silently dropped. The periodic refresh timers of the proxy
/// core achieve eventual delivery once the overlay reconnects.
pub trait Overlay: Send + Sync {
    /// Attempt to establish the hub connection. Idempotent; subsequent
    /// calls re-attempt. Asynchronous failures are reported through
    /// [`OverlayEvent::Failed`], not through this return value.
    fn connect(&self) -> Result<()>;

    /// Enqueue a payload for the given destination on the given protocol
    /// channel. Destination [`BROADCAST_ADDR`] reaches every registered
    /// endpoint of that protocol.
    fn send(&self, payload: Vec<u8>, destination: OverlayAddr, protocol: u16);
}

/// An inbound framed payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverlayFrame {
    pub source: OverlayAddr,
    pub destination: OverlayAddr,
    pub protocol: u16,
    pub payload: Vec<u8>,
}

/// Events emitted by an overlay binding.
#[derive(Clone, Debug)]
pub enum OverlayEvent {
    /// The hub connection has been established.
    Established,
    /// An established hub connection has been lost.
    Lost,
    /// A connection attempt failed.
    Failed(String),
    /// A framed payload arrived.
    Frame(OverlayFrame),
}
