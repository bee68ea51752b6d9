//! Send queue: outstanding outbound packets, one work item per (blob, peer).
//!
//! Ack-less items are always scanned before ack-requiring ones so that cheap
//! control traffic (acks themselves) is never stuck behind bulk sends. A stalled
//! item is resent with a doubled timeout until its retries run out.

use std::time::{Duration, Instant};

use crate::identity::{BlobRef, PacketId, PeerId};
use crate::packet::{Command, Packet};

/// Lifecycle of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// Queued, never attempted.
    Presend,
    /// Picked by the scheduler; a transport attempt is (or was) in flight.
    Sending,
    /// Transport reported completion; waiting for an ack or a retry timeout.
    Sent,
    Acked,
}

/// One queued, retryable attempt to deliver one serialized packet to one peer.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub blob: BlobRef,
    pub byte_size: usize,
    pub want_ack: bool,
    pub status: WorkStatus,
    pub packet_id: PacketId,
    pub remote_peer_id: PeerId,
    pub command: Command,
    pub wide: bool,
    pub payload_size: usize,
    pub enqueued_at: Instant,
    pub last_attempt_at: Option<Instant>,
    pub timeout: Duration,
    pub retries_remaining: u32,
    pub attempt_count: u32,
    /// Transport sends dispatched but not yet completed.
    pub in_flight: u32,
    /// At least one transport reported a successful send.
    pub delivered: bool,
}

impl WorkItem {
    /// New item in `Presend`. Data packets never get more than one retry: the
    /// requester is expected to ask again.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        blob: BlobRef,
        byte_size: usize,
        packet: &Packet,
        remote_peer_id: PeerId,
        want_ack: bool,
        wide: bool,
        timeout: Duration,
        max_retries: u32,
        now: Instant,
    ) -> Self {
        let retries_remaining = if packet.command == Command::Data {
            1
        } else {
            max_retries
        };
        Self {
            blob,
            byte_size,
            want_ack,
            status: WorkStatus::Presend,
            packet_id: packet.packet_id.clone(),
            remote_peer_id,
            command: packet.command.clone(),
            wide,
            payload_size: packet.payload.len(),
            enqueued_at: now,
            last_attempt_at: None,
            timeout,
            retries_remaining,
            attempt_count: 0,
            in_flight: 0,
            delivered: false,
        }
    }

    fn is_stalled(&self, now: Instant) -> bool {
        match self.last_attempt_at {
            Some(at) => now.saturating_duration_since(at) > self.timeout,
            None => true,
        }
    }
}

/// Outcome of a transport completion for a queued blob.
#[derive(Debug)]
pub enum SendResult {
    /// Item left the queue: acked, or ack-less with every transport attempt finished.
    /// `delivered` on the item tells whether any attempt got through.
    Removed(WorkItem),
    /// Item stays queued: awaiting an ack or a retry timeout, or other
    /// transports of a wide send are still in flight.
    Pending(WorkItem),
    /// No item owns this blob (already acked, expired or a duplicate completion).
    Unknown,
}

#[derive(Debug, Default)]
pub struct SendQueue {
    items: Vec<WorkItem>,
    expired: Vec<WorkItem>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, item: WorkItem) {
        self.items.push(item);
    }

    /// Next item to hand to a transport, or `None`.
    ///
    /// Items whose retries are exhausted are removed during the scan; collect
    /// them with [`SendQueue::drain_expired`].
    pub fn next_sendable(&mut self, now: Instant) -> Option<WorkItem> {
        for want_ack in [false, true] {
            let mut i = 0;
            while i < self.items.len() {
                let item = &mut self.items[i];
                if item.want_ack != want_ack {
                    i += 1;
                    continue;
                }
                match item.status {
                    WorkStatus::Presend => {
                        item.status = WorkStatus::Sending;
                        item.last_attempt_at = Some(now);
                        item.attempt_count += 1;
                        return Some(item.clone());
                    }
                    WorkStatus::Sending | WorkStatus::Sent if item.is_stalled(now) => {
                        if item.retries_remaining == 0 {
                            let dead = self.items.remove(i);
                            self.expired.push(dead);
                            continue;
                        }
                        item.timeout = item.timeout.saturating_mul(2);
                        item.retries_remaining -= 1;
                        item.last_attempt_at = Some(now);
                        item.attempt_count += 1;
                        item.status = WorkStatus::Sending;
                        return Some(item.clone());
                    }
                    _ => {}
                }
                i += 1;
            }
        }
        None
    }

    /// Items removed by the last scans because their retries ran out.
    pub fn drain_expired(&mut self) -> Vec<WorkItem> {
        std::mem::take(&mut self.expired)
    }

    /// Record `count` transport sends dispatched for `blob`.
    pub fn mark_dispatched(&mut self, blob: &BlobRef, count: u32) {
        if let Some(item) = self.items.iter_mut().find(|i| &i.blob == blob) {
            item.in_flight += count;
        }
    }

    /// Remove every item for `(peer, packet_id)`. An ack always wins over a pending retry.
    pub fn remove_by_ack(&mut self, peer: &PeerId, packet_id: &PacketId) -> Vec<WorkItem> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.items.len() {
            let item = &self.items[i];
            if &item.remote_peer_id == peer && &item.packet_id == packet_id {
                let mut item = self.items.remove(i);
                item.status = WorkStatus::Acked;
                removed.push(item);
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Apply a transport completion to the item owning `blob`.
    pub fn remove_by_send_result(&mut self, blob: &BlobRef, succeeded: bool) -> SendResult {
        let Some(idx) = self.items.iter().position(|i| &i.blob == blob) else {
            return SendResult::Unknown;
        };
        let item = &mut self.items[idx];
        item.in_flight = item.in_flight.saturating_sub(1);
        item.delivered |= succeeded;
        if item.status == WorkStatus::Acked {
            return SendResult::Removed(self.items.remove(idx));
        }
        if !item.want_ack {
            if item.in_flight == 0 {
                return SendResult::Removed(self.items.remove(idx));
            }
            return SendResult::Pending(item.clone());
        }
        // A failed attempt is retried on timeout like a lost one.
        tracing::trace!(blob = %blob, succeeded, "work item awaiting ack");
        item.status = WorkStatus::Sent;
        SendResult::Pending(item.clone())
    }

    /// Remove an item outright (administrative cancel).
    pub fn remove(&mut self, blob: &BlobRef) -> Option<WorkItem> {
        let idx = self.items.iter().position(|i| &i.blob == blob)?;
        Some(self.items.remove(idx))
    }

    /// Number of items addressed to peers `is_alive` reports as reachable.
    pub fn active_count(&self, is_alive: impl Fn(&PeerId) -> bool) -> usize {
        self.items
            .iter()
            .filter(|i| is_alive(&i.remote_peer_id))
            .count()
    }

    pub fn get(&self, blob: &BlobRef) -> Option<&WorkItem> {
        self.items.iter().find(|i| &i.blob == blob)
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
