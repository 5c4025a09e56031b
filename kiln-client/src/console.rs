//! Console stream reassembly.
//!
//! Build nodes and build masters stream their console output as chunks of
//! bytes tagged with circular sequence marks (see [`kiln_core::mark`]).
//! Delivery over the overlay is unreliable: chunks may be lost and messages
//! may arrive out of order. The reassembler turns that into the contract
//! console subscribers rely on: each subscription receives a contiguous,
//! in-order byte suffix of the peer's stream with no gaps and no
//! re-delivery, with selective retransmission requests covering for losses.
//!
//! The reassembler is a pure state machine. Messages it wants sent to the
//! peer come back to the owning proxy as [`ConsoleCommand`] values; the
//! proxy wraps them into its channel's envelope.

use std::sync::Arc;

use serde_json::{json, Value};

use kiln_core::Mark;

use crate::subscriber::SubscriberKey;
use crate::wire;

/// A consumer of reassembled console output.
pub trait ConsoleSink: Send + Sync {
    /// Deliver the next in-order run of console bytes.
    fn on_data(&self, data: &[u8]);
}

/// A handle to a console subscription.
///
/// Unsubscribing consumes the handle, so a dropped subscription cannot be
/// reused. A handle created from a missing key is inert: unsubscribing it
/// is a no-op and no data will ever be delivered through it.
#[derive(Debug)]
pub struct ConsoleSubscription {
    pub(crate) key: Option<SubscriberKey>,
}

impl ConsoleSubscription {
    /// Whether this handle refers to a live subscription.
    pub fn is_active(&self) -> bool {
        self.key.is_some()
    }
}

/// A message the owning proxy must send to the peer on behalf of the
/// reassembler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ConsoleCommand {
    /// Opt into unsolicited update pushes.
    RequestUpdates,
    /// Acknowledge a received update push.
    Ack,
    /// Request retransmission of the mark range `[start, end]`.
    Request { start: Mark, end: Mark },
}

impl ConsoleCommand {
    /// Render the command as the `console_streaming` sub-object.
    pub(crate) fn to_wire(&self) -> Value {
        match self {
            ConsoleCommand::RequestUpdates => json!({ "msg": "request_updates" }),
            ConsoleCommand::Ack => json!({ "msg": "ack" }),
            ConsoleCommand::Request { start, end } => json!({
                "msg": "request",
                "start": start.raw(),
                "end": end.raw(),
            }),
        }
    }
}

/// One chunk descriptor from a peer message: the chunk's mark and its
/// length in the accompanying blob.
#[derive(Clone, Copy, Debug)]
struct ChunkMeta {
    mark: Mark,
    len: usize,
}

struct Subscription {
    key: SubscriberKey,
    sink: Arc<dyn ConsoleSink>,
    /// The last mark this subscription has consumed, [`Mark::NEVER`] until
    /// the first delivery.
    last_mark_received: Mark,
}

/// Per-peer console reassembly state.
#[derive(Default)]
pub(crate) struct ConsoleReassembler {
    subscriptions: Vec<Subscription>,
}

impl ConsoleReassembler {
    /// Attach a sink under the given key.
    ///
    /// A missing key yields an inert handle and no commands. A duplicate
    /// key replaces the prior subscription. A live subscription starts from
    /// scratch: the returned commands opt into pushes and fetch the peer's
    /// whole back-buffer.
    pub(crate) fn subscribe(
        &mut self, sink: Arc<dyn ConsoleSink>, key: Option<SubscriberKey>,
    ) -> (ConsoleSubscription, Vec<ConsoleCommand>) {
        let key = match key {
            Some(key) => key,
            None => return (ConsoleSubscription { key: None }, Vec::new()),
        };
        let entry = Subscription {
            key,
            sink,
            last_mark_received: Mark::NEVER,
        };
        match self.subscriptions.iter_mut().find(|s| s.key == key) {
            Some(prior) => *prior = entry,
            None => self.subscriptions.push(entry),
        }
        (ConsoleSubscription { key: Some(key) }, Self::attach_commands())
    }

    /// Detach the subscription behind the given handle, if it is live.
    pub(crate) fn unsubscribe(&mut self, subscription: ConsoleSubscription) {
        if let Some(key) = subscription.key {
            self.subscriptions.retain(|s| s.key != key);
        }
    }

    /// Forget all reassembly progress and replay the stream from the
    /// beginning for every subscription.
    pub(crate) fn reconnect(&mut self) -> Vec<ConsoleCommand> {
        for sub in &mut self.subscriptions {
            sub.last_mark_received = Mark::NEVER;
        }
        Self::attach_commands()
    }

    fn attach_commands() -> Vec<ConsoleCommand> {
        vec![
            ConsoleCommand::RequestUpdates,
            ConsoleCommand::Request {
                start: Mark::NEVER,
                end: Mark::NOW,
            },
        ]
    }

    /// Handle the `console_streaming` sub-object of a peer message.
    pub(crate) fn handle_message(&mut self, doc: &Value) -> Vec<ConsoleCommand> {
        let is_update = match wire::str_field(doc, "msg") {
            Some("data") => false,
            Some("update") => true,
            Some(other) => {
                tracing::debug!(msg = other, "ignoring unknown console message kind");
                return Vec::new();
            }
            None => return Vec::new(),
        };

        let (mdata, blob) = match parse_chunks(doc) {
            Some(parsed) => parsed,
            None => return Vec::new(),
        };
        if mdata.is_empty() {
            return Vec::new();
        }

        let mut commands = Vec::new();
        if let Some(request) = self.deliver(&mdata, &blob) {
            commands.push(request);
        }
        if is_update {
            commands.push(ConsoleCommand::Ack);
        }
        commands
    }

    /// Route one message's chunks to every subscription, returning the
    /// single retransmission request covering all lagging subscriptions,
    /// if any.
    fn deliver(&mut self, mdata: &[ChunkMeta], blob: &[u8]) -> Option<ConsoleCommand> {
        let first_mark = mdata.first()?.mark;
        let last_mark = mdata.last()?.mark;

        let mut min_required = Mark::NOW;
        for sub in &mut self.subscriptions {
            if sub.last_mark_received == Mark::NEVER {
                // First delivery: the whole message is new output.
                sub.sink.on_data(blob);
                sub.last_mark_received = last_mark;
            } else if sub.last_mark_received.in_range(first_mark.pred(), last_mark.pred()) {
                // The message joins up with what this subscription already
                // consumed. Skip the chunks it has seen and push the rest.
                let mut offset = 0;
                for chunk in mdata {
                    if !sub.last_mark_received.in_range(chunk.mark, last_mark) {
                        break;
                    }
                    offset += chunk.len;
                }
                if offset < blob.len() {
                    sub.sink.on_data(&blob[offset..]);
                }
                sub.last_mark_received = last_mark;
            } else if sub.last_mark_received != last_mark {
                // A gap: remember the oldest outstanding mark.
                if min_required == Mark::NOW || sub.last_mark_received.raw() < min_required.raw() {
                    min_required = sub.last_mark_received;
                }
            }
        }

        (min_required != Mark::NOW).then_some(ConsoleCommand::Request {
            start: min_required,
            end: Mark::NOW,
        })
    }
}

/// Parse the `mdata`/`blob` pair of a console message.
///
/// `mdata` must be an array of `[mark, length]` number pairs whose lengths
/// sum to the decoded blob size; anything else discards the message with a
/// log, as a broken descriptor would corrupt byte accounting for every
/// subscription.
fn parse_chunks(doc: &Value) -> Option<(Vec<ChunkMeta>, Vec<u8>)> {
    let blob = wire::decode_base64(wire::str_field(doc, "blob").unwrap_or(""))?;
    let items = doc.get("mdata")?.as_array()?;

    let mut mdata = Vec::with_capacity(items.len());
    let mut total = 0usize;
    for item in items {
        let pair = match item.as_array().map(Vec::as_slice) {
            Some([mark, len]) => mark.as_u64().zip(len.as_u64()),
            _ => None,
        };
        let (mark, len) = match pair.and_then(|(m, l)| u32::try_from(m).ok().zip(usize::try_from(l).ok())) {
            Some(pair) => pair,
            None => {
                tracing::debug!("dropping console message with ill-typed chunk metadata");
                return None;
            }
        };
        mdata.push(ChunkMeta {
            mark: Mark::new(mark),
            len,
        });
        total += len;
    }
    if total != blob.len() {
        tracing::debug!(total, blob_len = blob.len(), "dropping console message with inconsistent chunk metadata");
        return None;
    }
    Some((mdata, blob))
}
