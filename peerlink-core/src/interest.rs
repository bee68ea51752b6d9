//! One-shot interests: "call me when packet (creator, packet_id) arrives".
//!
//! Used both for request/response (a Retrieve waits for the Data reply, keyed
//! by the requester's ID) and for send/ack correlation (keyed by the remote
//! peer's ID, since acks echo the original packet ID).

use std::collections::HashMap;
use std::sync::Arc;

use crate::events::CallbackList;
use crate::identity::{PacketId, PeerId};
use crate::packet::Packet;

pub type InterestFn = dyn Fn(&Packet) + Send + Sync;

#[derive(Default)]
pub struct InterestRegistry {
    entries: HashMap<(PeerId, PacketId), CallbackList<InterestFn>>,
}

impl InterestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `(creator, packet_id)`. Registering the same callback twice
    /// for one key keeps a single registration; returns false in that case.
    pub fn register(
        &mut self,
        creator: PeerId,
        packet_id: PacketId,
        callback: Arc<InterestFn>,
    ) -> bool {
        self.entries
            .entry((creator, packet_id))
            .or_default()
            .add(callback)
    }

    /// Fire and forget every callback waiting for this packet. Returns false if nobody waited.
    pub fn resolve(&mut self, packet: &Packet) -> bool {
        let Some(callbacks) = self.entries.remove(&packet.key()) else {
            return false;
        };
        for cb in callbacks.iter() {
            cb(packet);
        }
        true
    }

    /// Explicit cancellation. Returns true if an entry existed.
    pub fn remove(&mut self, creator: &PeerId, packet_id: &PacketId) -> bool {
        self.entries
            .remove(&(creator.clone(), packet_id.clone()))
            .is_some()
    }

    pub fn contains(&self, creator: &PeerId, packet_id: &PacketId) -> bool {
        self.entries
            .contains_key(&(creator.clone(), packet_id.clone()))
    }

    pub fn keys(&self) -> Vec<(PeerId, PacketId)> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
