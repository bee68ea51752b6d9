//! Callback registries and the status events the dispatcher reports through them.

use std::sync::Arc;

use crate::identity::{BlobRef, PacketId, PeerId};
use crate::packet::Packet;
use crate::queue::WorkItem;

pub type ProtocolStateFn = dyn Fn(&str, bool) + Send + Sync;
/// Returns true when the callback handled the packet.
pub type InboxPacketFn = dyn Fn(&Packet, &str, &str) -> bool + Send + Sync;
pub type OutboxPacketFn = dyn Fn(&Packet) + Send + Sync;
pub type InboxStatusFn = dyn Fn(&InboxEvent) + Send + Sync;
pub type OutboxStatusFn = dyn Fn(&OutboxEvent) + Send + Sync;
/// Called with the peer and its new alive state.
pub type ContactAliveFn = dyn Fn(&PeerId, bool) + Send + Sync;
pub type PingFn = dyn Fn(&PeerId) + Send + Sync;

/// Outcome of an outbound send, as reported to outbox-status callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    /// Handed to a transport.
    Started,
    /// Transport reported delivery.
    Sent,
    /// One transport attempt failed; the item is retried if it still has retries.
    Failed,
    Acked,
    /// Given up: retries exhausted, or an ack-less send failed. The item was dropped.
    Abandoned,
    /// The destination could not be resolved; the send was dropped.
    Unresolved,
}

impl OutboxStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OutboxStatus::Abandoned | OutboxStatus::Unresolved)
    }
}

#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub peer: PeerId,
    pub packet_id: PacketId,
    /// Snapshot of the work item, when one existed.
    pub item: Option<WorkItem>,
    pub protocol: String,
    pub host: String,
    pub status: OutboxStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxStatus {
    Received,
    /// Failed to parse; the blob was quarantined.
    Malformed,
    /// Parsed, but no interest and no inbox callback claimed it.
    Unhandled,
}

#[derive(Debug, Clone)]
pub struct InboxEvent {
    pub blob: BlobRef,
    pub protocol: String,
    pub host: String,
    pub status: InboxStatus,
    pub packet: Option<Packet>,
    pub error: Option<String>,
}

/// Ordered set of callbacks. Adding the same `Arc` twice is a no-op.
pub struct CallbackList<F: ?Sized> {
    entries: Vec<Arc<F>>,
}

impl<F: ?Sized> Default for CallbackList<F> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<F: ?Sized> CallbackList<F> {
    /// Returns false if `cb` was already registered.
    pub fn add(&mut self, cb: Arc<F>) -> bool {
        if self.contains(&cb) {
            return false;
        }
        self.entries.push(cb);
        true
    }

    pub fn remove(&mut self, cb: &Arc<F>) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| !same_callback(e, cb));
        self.entries.len() != before
    }

    pub fn contains(&self, cb: &Arc<F>) -> bool {
        self.entries.iter().any(|e| same_callback(e, cb))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<F>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Identity of a callback is the address of its allocation.
pub(crate) fn same_callback<F: ?Sized>(a: &Arc<F>, b: &Arc<F>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Every event hook the dispatcher exposes.
#[derive(Default)]
pub struct Callbacks {
    pub protocol_state: CallbackList<ProtocolStateFn>,
    pub inbox_packet: CallbackList<InboxPacketFn>,
    pub outbox_packet: CallbackList<OutboxPacketFn>,
    pub inbox_status: CallbackList<InboxStatusFn>,
    pub outbox_status: CallbackList<OutboxStatusFn>,
    pub contact_alive: CallbackList<ContactAliveFn>,
    pub ping: CallbackList<PingFn>,
}

impl Callbacks {
    pub(crate) fn fire_protocol_state(&self, protocol: &str, enabled: bool) {
        for cb in self.protocol_state.iter() {
            cb(protocol, enabled);
        }
    }

    /// Runs every inbox callback; true if any of them handled the packet.
    pub(crate) fn fire_inbox_packet(&self, packet: &Packet, protocol: &str, host: &str) -> bool {
        let mut handled = false;
        for cb in self.inbox_packet.iter() {
            handled |= cb(packet, protocol, host);
        }
        handled
    }

    pub(crate) fn fire_outbox_packet(&self, packet: &Packet) {
        for cb in self.outbox_packet.iter() {
            cb(packet);
        }
    }

    pub(crate) fn fire_inbox_status(&self, event: &InboxEvent) {
        for cb in self.inbox_status.iter() {
            cb(event);
        }
    }

    pub(crate) fn fire_outbox_status(&self, event: &OutboxEvent) {
        for cb in self.outbox_status.iter() {
            cb(event);
        }
    }

    pub(crate) fn fire_contact_alive(&self, peer: &PeerId, alive: bool) {
        for cb in self.contact_alive.iter() {
            cb(peer, alive);
        }
    }

    pub(crate) fn fire_ping(&self, peer: &PeerId) {
        for cb in self.ping.iter() {
            cb(peer);
        }
    }
}
