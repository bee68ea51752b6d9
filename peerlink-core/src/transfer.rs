//! Transfer registry: in-flight transfers and lifetime byte counters.

use std::collections::{BTreeMap, HashMap};

use crate::identity::{BlobRef, PeerId, TransferId};

/// Live progress callback into the transport.
pub type BytesFn = Box<dyn Fn() -> u64 + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Receive,
}

/// One in-flight transfer, as reported by a transport.
pub struct TransferRecord {
    pub id: TransferId,
    pub protocol: String,
    pub direction: Direction,
    pub remote_address: String,
    pub remote_peer_id: Option<PeerId>,
    pub blob: BlobRef,
    pub size_hint: u64,
    bytes_fn: Option<BytesFn>,
}

impl TransferRecord {
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_fn.as_ref().map(|f| f()).unwrap_or(0)
    }
}

impl std::fmt::Debug for TransferRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRecord")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("direction", &self.direction)
            .field("remote_address", &self.remote_address)
            .field("remote_peer_id", &self.remote_peer_id)
            .field("blob", &self.blob)
            .field("size_hint", &self.size_hint)
            .finish()
    }
}

/// What a finished transfer contributed to the counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub id: TransferId,
    pub protocol: String,
    pub direction: Direction,
    pub remote_peer_id: Option<PeerId>,
    pub bytes: u64,
}

/// Lifetime byte counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteTotals {
    pub sent: u64,
    pub received: u64,
}

impl ByteTotals {
    fn add(&mut self, direction: Direction, bytes: u64) {
        match direction {
            Direction::Send => self.sent = self.sent.saturating_add(bytes),
            Direction::Receive => self.received = self.received.saturating_add(bytes),
        }
    }
}

#[derive(Debug, Default)]
pub struct TransferRegistry {
    next_id: u64,
    active: BTreeMap<TransferId, TransferRecord>,
    per_peer: HashMap<PeerId, ByteTotals>,
    per_protocol: HashMap<String, ByteTotals>,
    global: ByteTotals,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &mut self,
        protocol: &str,
        direction: Direction,
        remote_address: &str,
        remote_peer_id: Option<PeerId>,
        blob: BlobRef,
        size_hint: u64,
        bytes_fn: Option<BytesFn>,
    ) -> TransferId {
        self.next_id += 1;
        let id = TransferId(self.next_id);
        self.active.insert(
            id,
            TransferRecord {
                id,
                protocol: protocol.to_owned(),
                direction,
                remote_address: remote_address.to_owned(),
                remote_peer_id,
                blob,
                size_hint,
                bytes_fn,
            },
        );
        id
    }

    /// Finish a transfer and fold its bytes into the lifetime counters.
    /// `final_bytes` overrides the live progress callback when the transport knows the total.
    pub fn end(&mut self, id: TransferId, final_bytes: Option<u64>) -> Option<TransferSummary> {
        let record = self.active.remove(&id)?;
        let bytes = final_bytes.unwrap_or_else(|| record.bytes_transferred());
        self.global.add(record.direction, bytes);
        self.per_protocol
            .entry(record.protocol.clone())
            .or_default()
            .add(record.direction, bytes);
        if let Some(peer) = &record.remote_peer_id {
            self.per_peer
                .entry(peer.clone())
                .or_default()
                .add(record.direction, bytes);
        }
        Some(TransferSummary {
            id,
            protocol: record.protocol,
            direction: record.direction,
            remote_peer_id: record.remote_peer_id,
            bytes,
        })
    }

    /// Bytes moved so far by in-flight transfers in `direction`.
    pub fn current_bytes(&self, direction: Direction) -> u64 {
        self.active
            .values()
            .filter(|r| r.direction == direction)
            .map(|r| r.bytes_transferred())
            .sum()
    }

    pub fn list(&self, direction: Direction) -> Vec<&TransferRecord> {
        self.active
            .values()
            .filter(|r| r.direction == direction)
            .collect()
    }

    pub fn get(&self, id: TransferId) -> Option<&TransferRecord> {
        self.active.get(&id)
    }

    pub fn totals(&self) -> &ByteTotals {
        &self.global
    }

    pub fn peer_totals(&self, peer: &PeerId) -> ByteTotals {
        self.per_peer.get(peer).cloned().unwrap_or_default()
    }

    pub fn protocol_totals(&self, protocol: &str) -> ByteTotals {
        self.per_protocol.get(protocol).cloned().unwrap_or_default()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }
}
