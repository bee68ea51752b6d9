//! Host-driven API: the dispatcher receives events from the host (outbox requests,
//! inbound blobs, transport completions, resolver results, ticks) and calls into the
//! injected capabilities. It never blocks and never spawns; all state is owned here and
//! touched only from the host's single event loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::blob::{BlobError, BlobStore};
use crate::config::TransportConfig;
use crate::contact::{ContactInfo, ContactResolver, ResolutionAttempt, RetryDecision};
use crate::events::{Callbacks, InboxEvent, InboxStatus, OutboxEvent, OutboxStatus};
use crate::identity::{BlobRef, PacketId, PeerId, TransferId};
use crate::interest::{InterestFn, InterestRegistry};
use crate::liveness::LivenessTracker;
use crate::packet::{CodecError, Command, Packet, PacketCodec};
use crate::protocols::{ProtocolChange, ProtocolRegistry};
use crate::queue::{SendQueue, SendResult, WorkItem};
use crate::rate::RateLimiter;
use crate::scheduler::{AdaptiveDelay, DispatchResult};
use crate::transfer::{ByteTotals, BytesFn, Direction, TransferRegistry, TransferSummary};
use crate::transport::{
    ListenOptions, ListenerHandle, Transport, TransportError, ALWAYS_ON_PROTOCOL,
};

/// A serialized packet waiting for its destination to be resolved.
struct PendingSend {
    packet: Packet,
    blob: BlobRef,
    byte_size: usize,
    want_ack: bool,
    wide: bool,
}

struct PendingResolution {
    attempt: ResolutionAttempt,
    sends: Vec<PendingSend>,
}

/// What `outbox` did with a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxOutcome {
    /// Work item created; the blob holds the serialized packet.
    Queued(BlobRef),
    /// Destination unknown; a resolution is in progress.
    AwaitingContact(BlobRef),
    /// Empty destination, nothing to do.
    NoDestination,
    ShuttingDown,
}

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("packet created by {creator} with command {command} cannot be sent from here")]
    ForeignPacket { creator: PeerId, command: Command },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Blob(#[from] BlobError),
}

/// Progress of a graceful shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownStep {
    /// Sends to live peers are still queued; poll again after the configured interval.
    Draining { active: usize },
    /// Listeners were asked to stop; the host awaits their teardown.
    Stopped {
        listeners: Vec<(String, ListenerHandle)>,
        /// Sends still queued when the drain window ran out.
        abandoned: usize,
    },
}

/// Point-in-time counters.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherStats {
    pub queued: usize,
    pub pending_resolutions: usize,
    pub interests: usize,
    pub transfers_in: usize,
    pub transfers_out: usize,
    pub current_bytes_in: u64,
    pub current_bytes_out: u64,
    pub totals: ByteTotals,
    pub average_receive_rate: f64,
    pub average_send_rate: f64,
}

/// Owns every piece of transport control state plus the injected capabilities.
pub struct Dispatcher {
    local_id: PeerId,
    config: TransportConfig,
    codec: Box<dyn PacketCodec + Send>,
    blobs: Box<dyn BlobStore + Send>,
    resolver: Box<dyn ContactResolver + Send>,
    transports: HashMap<String, Box<dyn Transport + Send>>,
    queue: SendQueue,
    liveness: LivenessTracker,
    rate: RateLimiter,
    transfers: TransferRegistry,
    interests: InterestRegistry,
    protocols: ProtocolRegistry,
    callbacks: Callbacks,
    delay: AdaptiveDelay,
    pending: HashMap<PeerId, PendingResolution>,
    /// Contacts delivered by the resolver's async path.
    resolved: HashMap<PeerId, ContactInfo>,
    accepting: bool,
    shutdown_polls: u32,
}

impl Dispatcher {
    pub fn new(
        local_id: PeerId,
        config: TransportConfig,
        codec: Box<dyn PacketCodec + Send>,
        blobs: Box<dyn BlobStore + Send>,
        resolver: Box<dyn ContactResolver + Send>,
    ) -> Self {
        let mut liveness = LivenessTracker::new(config.alive_timeout());
        for peer in config.ping_exclusions() {
            liveness.exclude_from_pings(peer.clone());
        }
        let delay = AdaptiveDelay::new(
            Duration::from_millis(config.min_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            Duration::from_millis(config.delay_step_ms),
        );
        Self {
            local_id,
            config,
            codec,
            blobs,
            resolver,
            transports: HashMap::new(),
            queue: SendQueue::new(),
            liveness,
            rate: RateLimiter::new(),
            transfers: TransferRegistry::new(),
            interests: InterestRegistry::new(),
            protocols: ProtocolRegistry::new(),
            callbacks: Callbacks::default(),
            delay,
            pending: HashMap::new(),
            resolved: HashMap::new(),
            accepting: true,
            shutdown_polls: 0,
        }
    }

    /// Register a transport under its protocol name, replacing any previous one.
    pub fn register_transport(&mut self, transport: Box<dyn Transport + Send>) {
        let name = transport.protocol().to_owned();
        debug!("transport registered: {}", name);
        self.transports.insert(name, transport);
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn callbacks_mut(&mut self) -> &mut Callbacks {
        &mut self.callbacks
    }

    pub fn queue(&self) -> &SendQueue {
        &self.queue
    }

    pub fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }

    pub fn protocols(&self) -> &ProtocolRegistry {
        &self.protocols
    }

    pub fn transfers(&self) -> &TransferRegistry {
        &self.transfers
    }

    /// Delay the host should wait before the next `run_scheduler` call.
    pub fn next_delay(&self) -> Duration {
        self.delay.current()
    }

    // ---- outbound ----

    /// Queue `packet` for delivery. Fire-and-forget: network failures are only
    /// reported through outbox-status callbacks.
    pub fn outbox(
        &mut self,
        packet: Packet,
        want_ack: bool,
        wide: bool,
        now: Instant,
    ) -> Result<OutboxOutcome, OutboxError> {
        if !self.accepting {
            debug!("outbox refused during shutdown: {} {}", packet.command, packet.packet_id);
            return Ok(OutboxOutcome::ShuttingDown);
        }
        let destination = self.destination_for(&packet)?;
        if destination.is_empty() {
            debug!("outbox skipped, no destination: {} {}", packet.command, packet.packet_id);
            return Ok(OutboxOutcome::NoDestination);
        }
        let bytes = self.codec.serialize(&packet)?;
        let blob = self.blobs.write("outbox", &bytes)?;
        self.callbacks.fire_outbox_packet(&packet);

        let send = PendingSend {
            packet,
            blob: blob.clone(),
            byte_size: bytes.len(),
            want_ack,
            wide,
        };
        if self.contact_for(&destination).is_some() {
            self.enqueue(send, destination, now);
            return Ok(OutboxOutcome::Queued(blob));
        }
        self.await_contact(destination, send);
        Ok(OutboxOutcome::AwaitingContact(blob))
    }

    /// Packets we created go to their remote ID; the only foreign packet we may send is
    /// Data being returned to the peer that created it.
    fn destination_for(&self, packet: &Packet) -> Result<PeerId, OutboxError> {
        if packet.creator_id == self.local_id {
            return Ok(packet.remote_id.clone());
        }
        if packet.command == Command::Data {
            return Ok(packet.creator_id.clone());
        }
        Err(OutboxError::ForeignPacket {
            creator: packet.creator_id.clone(),
            command: packet.command.clone(),
        })
    }

    fn contact_for(&self, peer: &PeerId) -> Option<ContactInfo> {
        self.resolver
            .get_contact(peer)
            .or_else(|| self.resolved.get(peer).cloned())
    }

    fn enqueue(&mut self, send: PendingSend, destination: PeerId, now: Instant) {
        let item = WorkItem::new(
            send.blob,
            send.byte_size,
            &send.packet,
            destination.clone(),
            send.want_ack,
            send.wide,
            self.config.send_timeout(),
            self.config.max_retries,
            now,
        );
        debug!(
            "outbox {} {} to {} ({} bytes, ack={}, wide={})",
            item.command, item.packet_id, destination, item.byte_size, item.want_ack, item.wide
        );
        self.queue.append(item);
        self.liveness.note_ping_sent(&destination, now);
        self.delay.reset();
        self.run_scheduler(now);
    }

    fn await_contact(&mut self, destination: PeerId, send: PendingSend) {
        if let Some(entry) = self.pending.get_mut(&destination) {
            entry.sends.push(send);
            return;
        }
        info!("contact for {} unknown, resolving", destination);
        self.pending.insert(
            destination.clone(),
            PendingResolution {
                attempt: ResolutionAttempt::start(
                    self.config.resolve_attempts,
                    self.config.resolve_interval(),
                ),
                sends: vec![send],
            },
        );
        self.resolver.resolve_async(&destination);
    }

    /// Result of a `ContactResolver::resolve_async` fetch.
    pub fn on_contact_resolved(&mut self, peer: &PeerId, contact: Option<ContactInfo>, now: Instant) {
        let Some(mut entry) = self.pending.remove(peer) else {
            if let Some(info) = contact {
                self.resolved.insert(peer.clone(), info);
            }
            return;
        };
        if let Some(info) = contact {
            self.resolved.insert(peer.clone(), info);
        }
        if self.contact_for(peer).is_some() {
            for send in entry.sends {
                self.enqueue(send, peer.clone(), now);
            }
            return;
        }
        match entry.attempt.on_failure(now) {
            RetryDecision::RetryAt(_) => {
                debug!(
                    "contact for {} still unknown after attempt {}/{}",
                    peer, entry.attempt.count, entry.attempt.max_count
                );
                self.pending.insert(peer.clone(), entry);
            }
            RetryDecision::GiveUp => {
                warn!(
                    "dropping {} packet(s) to {}: contact not resolved after {} attempts",
                    entry.sends.len(),
                    peer,
                    entry.attempt.count
                );
                for send in entry.sends {
                    self.blobs.delete(&send.blob);
                    self.callbacks.fire_outbox_status(&OutboxEvent {
                        peer: peer.clone(),
                        packet_id: send.packet.packet_id,
                        item: None,
                        protocol: String::new(),
                        host: String::new(),
                        status: OutboxStatus::Unresolved,
                        error: Some("contact not resolved".into()),
                    });
                }
            }
        }
    }

    /// One scheduler iteration. Returns how long the host should wait before the next one.
    pub fn run_scheduler(&mut self, now: Instant) -> Duration {
        let result = self.try_dispatch_one(now);
        self.delay.update(result)
    }

    /// Hand the next sendable work item to the transports.
    pub fn try_dispatch_one(&mut self, now: Instant) -> DispatchResult {
        let next = self.queue.next_sendable(now);
        self.report_expired();
        let Some(item) = next else {
            return DispatchResult::NoWork;
        };
        let Some(contact) = self.contact_for(&item.remote_peer_id) else {
            debug!("no contact for {}, {} stays queued", item.remote_peer_id, item.packet_id);
            return DispatchResult::Blocked;
        };

        let mut started = Vec::new();
        for method in &contact.methods {
            if method.protocol != ALWAYS_ON_PROTOCOL && !self.protocols.is_enabled(&method.protocol)
            {
                continue;
            }
            let Some(transport) = self.transports.get_mut(&method.protocol) else {
                continue;
            };
            match transport.send(&item.blob, &method.host, method.port) {
                Ok(()) => {
                    started.push((method.protocol.clone(), method.host.clone()));
                    if !item.wide {
                        break;
                    }
                }
                Err(e) => warn!(
                    "{} send of {} to {}:{} failed to start: {}",
                    method.protocol, item.packet_id, method.host, method.port, e
                ),
            }
        }
        if started.is_empty() {
            debug!("no enabled transport for {}", item.remote_peer_id);
            return DispatchResult::Blocked;
        }

        self.queue.mark_dispatched(&item.blob, started.len() as u32);
        for (protocol, host) in started {
            self.callbacks.fire_outbox_status(&OutboxEvent {
                peer: item.remote_peer_id.clone(),
                packet_id: item.packet_id.clone(),
                item: Some(item.clone()),
                protocol,
                host,
                status: OutboxStatus::Started,
                error: None,
            });
        }
        DispatchResult::Sent
    }

    fn report_expired(&mut self) {
        for item in self.queue.drain_expired() {
            warn!(
                "giving up on {} {} to {} after {} attempts",
                item.command, item.packet_id, item.remote_peer_id, item.attempt_count
            );
            self.blobs.delete(&item.blob);
            self.callbacks.fire_outbox_status(&OutboxEvent {
                peer: item.remote_peer_id.clone(),
                packet_id: item.packet_id.clone(),
                item: Some(item),
                protocol: String::new(),
                host: String::new(),
                status: OutboxStatus::Abandoned,
                error: Some("retries exhausted".into()),
            });
        }
    }

    /// A transport finished (or failed) delivering `blob`.
    pub fn handle_send_completion(
        &mut self,
        blob: &BlobRef,
        succeeded: bool,
        protocol: &str,
        host: &str,
        now: Instant,
    ) {
        let (item, removed) = match self.queue.remove_by_send_result(blob, succeeded) {
            SendResult::Removed(item) => (item, true),
            SendResult::Pending(item) => (item, false),
            SendResult::Unknown => {
                debug!("{} completion for unknown blob {}", protocol, blob);
                return;
            }
        };
        // A wide send only counts as failed once no attempt is left in flight and none got through.
        let failed = !succeeded && item.in_flight == 0 && !(removed && item.delivered);
        if succeeded || failed {
            self.note_send_outcome(&item.remote_peer_id, succeeded, now);
        }
        if removed {
            self.blobs.delete(&item.blob);
        }
        let status = match (removed, item.delivered, succeeded) {
            (true, true, _) | (false, _, true) => OutboxStatus::Sent,
            (true, false, _) => OutboxStatus::Abandoned,
            (false, _, false) => OutboxStatus::Failed,
        };
        if !succeeded {
            info!(
                "{} send of {} to {} via {}:{} failed ({} attempt(s) still in flight)",
                item.command, item.packet_id, item.remote_peer_id, protocol, host, item.in_flight
            );
        }
        self.callbacks.fire_outbox_status(&OutboxEvent {
            peer: item.remote_peer_id.clone(),
            packet_id: item.packet_id.clone(),
            item: Some(item),
            protocol: protocol.to_owned(),
            host: host.to_owned(),
            status,
            error: (status != OutboxStatus::Sent).then(|| "transport send failed".to_owned()),
        });
    }

    fn note_send_outcome(&mut self, peer: &PeerId, succeeded: bool, now: Instant) {
        if succeeded {
            if self.liveness.touch(peer, now) {
                self.callbacks.fire_contact_alive(peer, true);
            }
        } else if self.liveness.record_failure(peer, now) {
            self.callbacks.fire_contact_alive(peer, false);
        }
    }

    // ---- inbound ----

    /// A transport received `blob`. Returns the parsed packet, or `None` if it was malformed.
    pub fn inbox(
        &mut self,
        blob: &BlobRef,
        protocol: &str,
        host: &str,
        now: Instant,
    ) -> Option<Packet> {
        let parsed = self
            .blobs
            .read(blob)
            .map_err(|e| e.to_string())
            .and_then(|bytes| self.codec.unserialize(&bytes).map_err(|e| e.to_string()));
        let packet = match parsed {
            Ok(packet) => packet,
            Err(e) => {
                warn!("malformed packet from {}://{}: {}", protocol, host, e);
                self.blobs.quarantine(blob);
                self.callbacks.fire_inbox_status(&InboxEvent {
                    blob: blob.clone(),
                    protocol: protocol.to_owned(),
                    host: host.to_owned(),
                    status: InboxStatus::Malformed,
                    packet: None,
                    error: Some(e),
                });
                return None;
            }
        };

        if self.liveness.touch(&packet.owner_id, now) {
            self.callbacks.fire_contact_alive(&packet.owner_id, true);
        }
        let acked = self.handle_ack_packet(&packet) > 0;
        let by_interest = self.interests.resolve(&packet);
        let by_callback = self.callbacks.fire_inbox_packet(&packet, protocol, host);
        let status = if acked || by_interest || by_callback {
            InboxStatus::Received
        } else {
            warn!(
                "unhandled {} {} from {} via {}://{}",
                packet.command, packet.packet_id, packet.owner_id, protocol, host
            );
            InboxStatus::Unhandled
        };
        self.blobs.delete(blob);
        self.callbacks.fire_inbox_status(&InboxEvent {
            blob: blob.clone(),
            protocol: protocol.to_owned(),
            host: host.to_owned(),
            status,
            packet: Some(packet.clone()),
            error: None,
        });
        Some(packet)
    }

    /// Drop queued sends answered by `packet`. Any packet echoing one of ours counts,
    /// whatever its command. Returns the number of work items removed.
    pub fn handle_ack_packet(&mut self, packet: &Packet) -> usize {
        if packet.remote_id != self.local_id && packet.creator_id != self.local_id {
            return 0;
        }
        let acked = self.queue.remove_by_ack(&packet.owner_id, &packet.packet_id);
        let count = acked.len();
        for item in acked {
            debug!("{} {} acked by {}", item.command, item.packet_id, item.remote_peer_id);
            self.blobs.delete(&item.blob);
            self.callbacks.fire_outbox_status(&OutboxEvent {
                peer: item.remote_peer_id.clone(),
                packet_id: item.packet_id.clone(),
                item: Some(item),
                protocol: String::new(),
                host: String::new(),
                status: OutboxStatus::Acked,
                error: None,
            });
        }
        count
    }

    // ---- interests ----

    /// Call `callback` once when packet `(creator, packet_id)` arrives.
    pub fn register_interest(
        &mut self,
        creator: PeerId,
        packet_id: PacketId,
        callback: Arc<InterestFn>,
    ) -> bool {
        self.interests.register(creator, packet_id, callback)
    }

    pub fn remove_interest(&mut self, creator: &PeerId, packet_id: &PacketId) -> bool {
        self.interests.remove(creator, packet_id)
    }

    pub fn interests(&self) -> &InterestRegistry {
        &self.interests
    }

    // ---- protocols ----

    /// Start the `protocol` transport's listener and mark the protocol enabled.
    pub fn start_listening(
        &mut self,
        protocol: &str,
        options: ListenOptions,
    ) -> Result<ListenerHandle, TransportError> {
        let transport = self
            .transports
            .get_mut(protocol)
            .ok_or_else(|| TransportError::Unavailable(protocol.to_owned()))?;
        let handle = transport.receive(&options)?;
        info!("{} listening on {}:{}", protocol, options.host, options.port);
        let change = self.protocols.set_listening(protocol, handle, options);
        self.fire_protocol_changes(change);
        Ok(handle)
    }

    /// Disable `protocol` and stop its listener.
    pub fn stop_protocol(&mut self, protocol: &str) -> Result<(), TransportError> {
        let (listener, change) = self.protocols.set_disabled(protocol);
        self.fire_protocol_changes(change);
        if let (Some(handle), Some(transport)) = (listener, self.transports.get_mut(protocol)) {
            transport.stop_listening(handle)?;
            info!("{} stopped", protocol);
        }
        Ok(())
    }

    fn fire_protocol_changes(&self, changes: impl IntoIterator<Item = ProtocolChange>) {
        for change in changes {
            self.callbacks
                .fire_protocol_state(&change.protocol, change.enabled);
        }
    }

    // ---- transfers and bandwidth ----

    /// A transport began moving bytes. `remote_address` is "host" or "host:port".
    pub fn start_transfer(
        &mut self,
        protocol: &str,
        direction: Direction,
        remote_address: &str,
        blob: BlobRef,
        size_hint: u64,
        bytes_fn: Option<BytesFn>,
    ) -> TransferId {
        let host = remote_address
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or(remote_address);
        let peer = self.resolver.peer_for_address(protocol, host);
        self.transfers.start(
            protocol,
            direction,
            remote_address,
            peer,
            blob,
            size_hint,
            bytes_fn,
        )
    }

    /// A transfer ended; its bytes count toward the lifetime totals and the rate window.
    pub fn end_transfer(&mut self, id: TransferId, final_bytes: Option<u64>) -> Option<TransferSummary> {
        let summary = self.transfers.end(id, final_bytes)?;
        match summary.direction {
            Direction::Send => self.rate.record_sent(summary.bytes),
            Direction::Receive => self.rate.record_received(summary.bytes),
        }
        Some(summary)
    }

    /// Chunk size for the next outbound read under the outbound cap.
    pub fn next_send_chunk_size(&self, prev_chunk_size: usize, requested: usize) -> usize {
        self.rate
            .next_send_chunk_size(prev_chunk_size, requested, self.config.band_out_limit_bytes())
    }

    /// Pause an inbound reader should take after reading `new_bytes`.
    pub fn next_receive_delay(&self, new_bytes: u64) -> Duration {
        self.rate
            .next_receive_delay(new_bytes, self.config.band_in_limit_bytes())
    }

    // ---- liveness ----

    pub fn is_alive(&self, peer: &PeerId, now: Instant) -> bool {
        self.liveness.is_alive_now(peer, now)
    }

    /// Administrative reset of a peer's liveness.
    pub fn clear_alive_state(&mut self, peer: &PeerId, now: Instant) {
        let was_alive = self.liveness.is_alive_now(peer, now);
        self.liveness.clear(peer);
        if was_alive {
            self.callbacks.fire_contact_alive(peer, false);
        }
    }

    /// Periodic housekeeping, at least once per second: rate sampling, due
    /// resolution retries, keep-alive pings.
    pub fn tick(&mut self, now: Instant) {
        self.rate.sample(now);

        let due: Vec<PeerId> = self
            .pending
            .iter_mut()
            .filter_map(|(peer, entry)| entry.attempt.take_due(now).then(|| peer.clone()))
            .collect();
        for peer in due {
            debug!("retrying contact resolution for {}", peer);
            self.resolver.resolve_async(&peer);
        }

        let interval = self.config.ping_interval();
        for peer in self.liveness.known_peers() {
            if self.liveness.maybe_schedule_ping(&peer, interval, now) {
                debug!("ping due for {}", peer);
                self.callbacks.fire_ping(&peer);
            }
        }
    }

    /// Queued items addressed to peers that are currently alive.
    pub fn active_count(&self, now: Instant) -> usize {
        self.queue
            .active_count(|peer| self.liveness.is_alive_now(peer, now))
    }

    // ---- shutdown ----

    /// Stop accepting new sends.
    pub fn begin_shutdown(&mut self) {
        if self.accepting {
            info!("transport control shutting down, {} item(s) queued", self.queue.len());
        }
        self.accepting = false;
        self.shutdown_polls = 0;
    }

    pub fn is_shutting_down(&self) -> bool {
        !self.accepting
    }

    /// Poll the drain. Once no live peer has queued sends, or the poll budget runs out,
    /// every listener is asked to stop.
    pub fn shutdown_poll(&mut self, now: Instant) -> ShutdownStep {
        let active = self.active_count(now);
        if active > 0 && self.shutdown_polls < self.config.shutdown_max_polls {
            self.shutdown_polls += 1;
            debug!("shutdown waiting on {} active send(s)", active);
            return ShutdownStep::Draining { active };
        }
        if active > 0 {
            warn!("shutdown drain timed out with {} active send(s)", active);
        }
        let (listeners, changes) = self.protocols.take_listeners();
        for (protocol, handle) in &listeners {
            if let Some(transport) = self.transports.get_mut(protocol) {
                if let Err(e) = transport.stop_listening(*handle) {
                    warn!("failed to stop {} listener: {}", protocol, e);
                }
            }
        }
        self.fire_protocol_changes(changes);
        ShutdownStep::Stopped {
            listeners,
            abandoned: active,
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            queued: self.queue.len(),
            pending_resolutions: self.pending.len(),
            interests: self.interests.len(),
            transfers_in: self.transfers.list(Direction::Receive).len(),
            transfers_out: self.transfers.list(Direction::Send).len(),
            current_bytes_in: self.transfers.current_bytes(Direction::Receive),
            current_bytes_out: self.transfers.current_bytes(Direction::Send),
            totals: self.transfers.totals().clone(),
            average_receive_rate: self.rate.average_receive_rate(),
            average_send_rate: self.rate.average_send_rate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::contact::ContactMethod;
    use crate::wire::BincodeCodec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type SendLog = Arc<Mutex<Vec<(String, BlobRef, String, u16)>>>;

    struct FakeTransport {
        name: &'static str,
        sends: SendLog,
        stopped: Arc<Mutex<Vec<ListenerHandle>>>,
        fail_start: bool,
    }

    impl Transport for FakeTransport {
        fn protocol(&self) -> &str {
            self.name
        }

        fn send(&mut self, blob: &BlobRef, host: &str, port: u16) -> Result<(), TransportError> {
            if self.fail_start {
                return Err(TransportError::Unavailable(self.name.into()));
            }
            self.sends
                .lock()
                .unwrap()
                .push((self.name.to_owned(), blob.clone(), host.to_owned(), port));
            Ok(())
        }

        fn receive(&mut self, options: &ListenOptions) -> Result<ListenerHandle, TransportError> {
            Ok(ListenerHandle(options.port as u64))
        }

        fn stop_listening(&mut self, handle: ListenerHandle) -> Result<(), TransportError> {
            self.stopped.lock().unwrap().push(handle);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct FakeResolver {
        contacts: Arc<Mutex<HashMap<PeerId, ContactInfo>>>,
        requests: Arc<Mutex<Vec<PeerId>>>,
    }

    impl ContactResolver for FakeResolver {
        fn get_contact(&self, peer: &PeerId) -> Option<ContactInfo> {
            self.contacts.lock().unwrap().get(peer).cloned()
        }

        fn resolve_async(&mut self, peer: &PeerId) {
            self.requests.lock().unwrap().push(peer.clone());
        }

        fn peer_for_address(&self, _protocol: &str, host: &str) -> Option<PeerId> {
            self.contacts
                .lock()
                .unwrap()
                .iter()
                .find(|(_, c)| c.methods.iter().any(|m| m.host == host))
                .map(|(p, _)| p.clone())
        }
    }

    struct Harness {
        d: Dispatcher,
        sends: SendLog,
        stopped: Arc<Mutex<Vec<ListenerHandle>>>,
        resolver: FakeResolver,
        statuses: Arc<Mutex<Vec<OutboxStatus>>>,
        t0: Instant,
    }

    fn me() -> PeerId {
        PeerId::from("me")
    }

    fn peer_a() -> PeerId {
        PeerId::from("peerA")
    }

    fn tcp_contact() -> ContactInfo {
        ContactInfo::new(vec![ContactMethod::new("tcp", "10.0.0.2", 7771)])
    }

    fn harness_with(config: TransportConfig) -> Harness {
        let resolver = FakeResolver::default();
        resolver.contacts.lock().unwrap().insert(peer_a(), tcp_contact());
        let mut d = Dispatcher::new(
            me(),
            config,
            Box::new(BincodeCodec),
            Box::new(MemoryBlobStore::new()),
            Box::new(resolver.clone()),
        );
        let sends: SendLog = Arc::default();
        let stopped: Arc<Mutex<Vec<ListenerHandle>>> = Arc::default();
        for name in ["tcp", "udp"] {
            d.register_transport(Box::new(FakeTransport {
                name,
                sends: sends.clone(),
                stopped: stopped.clone(),
                fail_start: false,
            }));
        }
        let statuses: Arc<Mutex<Vec<OutboxStatus>>> = Arc::default();
        let s = statuses.clone();
        d.callbacks_mut()
            .outbox_status
            .add(Arc::new(move |e: &OutboxEvent| s.lock().unwrap().push(e.status)));
        Harness {
            d,
            sends,
            stopped,
            resolver,
            statuses,
            t0: Instant::now(),
        }
    }

    fn harness() -> Harness {
        harness_with(TransportConfig::default())
    }

    fn packet(command: Command, id: &str) -> Packet {
        Packet::new(command, me(), PacketId::from(id), vec![7u8; 32], peer_a())
    }

    fn inbound_blob(h: &mut Harness, packet: &Packet) -> BlobRef {
        let bytes = BincodeCodec.serialize(packet).unwrap();
        h.d.blobs.write("inbox", &bytes).unwrap()
    }

    #[test]
    fn outbox_dispatches_immediately() {
        let mut h = harness();
        let out = h
            .d
            .outbox(packet(Command::Message, "m1"), false, false, h.t0)
            .unwrap();
        let OutboxOutcome::Queued(blob) = out else {
            panic!("expected Queued, got {out:?}");
        };
        let sends = h.sends.lock().unwrap().clone();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0], ("tcp".into(), blob.clone(), "10.0.0.2".into(), 7771));
        assert_eq!(h.d.queue().get(&blob).unwrap().in_flight, 1);

        h.d.handle_send_completion(&blob, true, "tcp", "10.0.0.2", h.t0);
        assert!(h.d.queue().is_empty());
        assert!(!h.d.blobs.exists(&blob));
        assert!(h.d.is_alive(&peer_a(), h.t0));
        assert_eq!(
            *h.statuses.lock().unwrap(),
            vec![OutboxStatus::Started, OutboxStatus::Sent]
        );
    }

    #[test]
    fn data_send_failure_is_not_retried() {
        let mut h = harness();
        let out = h
            .d
            .outbox(packet(Command::Data, "p1"), false, false, h.t0)
            .unwrap();
        let OutboxOutcome::Queued(blob) = out else {
            panic!("expected Queued");
        };
        assert_eq!(h.d.queue().get(&blob).unwrap().retries_remaining, 1);
        h.d.handle_send_completion(&blob, false, "tcp", "10.0.0.2", h.t0);
        assert!(h.d.queue().is_empty());
        assert!(!h.d.blobs.exists(&blob));
        h.d.run_scheduler(h.t0 + Duration::from_secs(60));
        assert_eq!(h.sends.lock().unwrap().len(), 1);
        assert_eq!(
            h.statuses.lock().unwrap().last(),
            Some(&OutboxStatus::Abandoned)
        );
    }

    #[test]
    fn failure_marks_peer_dead_immediately() {
        let mut h = harness();
        let alive = Arc::new(Mutex::new(Vec::new()));
        let a = alive.clone();
        h.d.callbacks_mut()
            .contact_alive
            .add(Arc::new(move |p: &PeerId, up: bool| a.lock().unwrap().push((p.clone(), up))));
        let OutboxOutcome::Queued(first) = h
            .d
            .outbox(packet(Command::Message, "m1"), false, false, h.t0)
            .unwrap()
        else {
            panic!("expected Queued");
        };
        h.d.handle_send_completion(&first, true, "tcp", "10.0.0.2", h.t0);
        let t1 = h.t0 + Duration::from_secs(1);
        let OutboxOutcome::Queued(second) = h
            .d
            .outbox(packet(Command::Message, "m2"), false, false, t1)
            .unwrap()
        else {
            panic!("expected Queued");
        };
        h.d.handle_send_completion(&second, false, "tcp", "10.0.0.2", t1);
        assert!(!h.d.is_alive(&peer_a(), t1));
        assert_eq!(
            *alive.lock().unwrap(),
            vec![(peer_a(), true), (peer_a(), false)]
        );
    }

    #[test]
    fn ack_removes_pending_item() {
        let mut h = harness();
        let OutboxOutcome::Queued(blob) = h
            .d
            .outbox(packet(Command::Retrieve, "r1"), true, false, h.t0)
            .unwrap()
        else {
            panic!("expected Queued");
        };
        h.d.handle_send_completion(&blob, true, "tcp", "10.0.0.2", h.t0);
        assert_eq!(h.d.queue().len(), 1);

        let mut ack = Packet::new(
            Command::Ack,
            peer_a(),
            PacketId::from("r1"),
            vec![],
            me(),
        );
        ack.owner_id = peer_a();
        let inbound = inbound_blob(&mut h, &ack);
        let parsed = h.d.inbox(&inbound, "tcp", "10.0.0.2", h.t0).unwrap();
        assert_eq!(parsed.command, Command::Ack);
        assert!(h.d.queue().is_empty());
        assert!(!h.d.blobs.exists(&blob));
        assert!(h
            .statuses
            .lock()
            .unwrap()
            .contains(&OutboxStatus::Acked));
    }

    #[test]
    fn stalled_item_is_resent_with_backoff() {
        let mut config = TransportConfig::default();
        config.send_timeout_secs = 1;
        config.max_retries = 2;
        let mut h = harness_with(config);
        h.d.outbox(packet(Command::Message, "m1"), true, false, h.t0)
            .unwrap();
        assert_eq!(h.sends.lock().unwrap().len(), 1);

        let t = h.t0 + Duration::from_millis(1100);
        assert_eq!(h.d.try_dispatch_one(t), DispatchResult::Sent);
        let t = t + Duration::from_millis(2100);
        assert_eq!(h.d.try_dispatch_one(t), DispatchResult::Sent);
        assert_eq!(h.sends.lock().unwrap().len(), 3);

        let t = t + Duration::from_millis(4100);
        assert_eq!(h.d.try_dispatch_one(t), DispatchResult::NoWork);
        assert!(h.d.queue().is_empty());
        assert_eq!(
            h.statuses.lock().unwrap().last(),
            Some(&OutboxStatus::Abandoned)
        );
    }

    #[test]
    fn wide_send_uses_every_enabled_protocol() {
        let mut h = harness();
        h.resolver.contacts.lock().unwrap().insert(
            peer_a(),
            ContactInfo::new(vec![
                ContactMethod::new("udp", "10.0.0.2", 8882),
                ContactMethod::new("http", "10.0.0.2", 80),
                ContactMethod::new("tcp", "10.0.0.2", 7771),
            ]),
        );
        // udp is not enabled yet, tcp is always tried
        h.d.outbox(packet(Command::Message, "m1"), false, true, h.t0)
            .unwrap();
        let protos: Vec<String> = h.sends.lock().unwrap().iter().map(|s| s.0.clone()).collect();
        assert_eq!(protos, vec!["tcp".to_owned()]);

        h.d.start_listening(
            "udp",
            ListenOptions {
                host: "0.0.0.0".into(),
                port: 8882,
                path: None,
            },
        )
        .unwrap();
        h.sends.lock().unwrap().clear();
        h.d.outbox(packet(Command::Message, "m2"), false, true, h.t0)
            .unwrap();
        let protos: Vec<String> = h.sends.lock().unwrap().iter().map(|s| s.0.clone()).collect();
        assert_eq!(protos, vec!["udp".to_owned(), "tcp".to_owned()]);

        h.sends.lock().unwrap().clear();
        h.d.outbox(packet(Command::Message, "m3"), false, false, h.t0)
            .unwrap();
        let protos: Vec<String> = h.sends.lock().unwrap().iter().map(|s| s.0.clone()).collect();
        assert_eq!(protos, vec!["udp".to_owned()]);
    }

    #[test]
    fn wide_send_survives_one_failing_transport() {
        let mut h = harness();
        h.resolver.contacts.lock().unwrap().insert(
            peer_a(),
            ContactInfo::new(vec![
                ContactMethod::new("udp", "10.0.0.2", 8882),
                ContactMethod::new("tcp", "10.0.0.2", 7771),
            ]),
        );
        h.d.start_listening(
            "udp",
            ListenOptions {
                host: "0.0.0.0".into(),
                port: 8882,
                path: None,
            },
        )
        .unwrap();
        let OutboxOutcome::Queued(blob) = h
            .d
            .outbox(packet(Command::Message, "m1"), false, true, h.t0)
            .unwrap()
        else {
            panic!("expected Queued");
        };
        assert_eq!(h.d.queue().get(&blob).unwrap().in_flight, 2);

        h.d.handle_send_completion(&blob, false, "udp", "10.0.0.2", h.t0);
        assert_eq!(h.d.queue().len(), 1);
        assert!(h.d.blobs.exists(&blob));

        h.d.handle_send_completion(&blob, true, "tcp", "10.0.0.2", h.t0);
        assert!(h.d.queue().is_empty());
        assert!(!h.d.blobs.exists(&blob));
        assert!(h.d.is_alive(&peer_a(), h.t0));
        assert_eq!(
            *h.statuses.lock().unwrap(),
            vec![
                OutboxStatus::Started,
                OutboxStatus::Started,
                OutboxStatus::Failed,
                OutboxStatus::Sent
            ]
        );
    }

    #[test]
    fn blocked_when_no_transport_matches() {
        let mut h = harness();
        h.resolver.contacts.lock().unwrap().insert(
            peer_a(),
            ContactInfo::new(vec![ContactMethod::new("http", "10.0.0.2", 80)]),
        );
        h.d.outbox(packet(Command::Message, "m1"), false, false, h.t0)
            .unwrap();
        assert!(h.sends.lock().unwrap().is_empty());
        assert_eq!(h.d.queue().len(), 1);
        assert_eq!(
            h.d.try_dispatch_one(h.t0 + Duration::from_secs(11)),
            DispatchResult::Blocked
        );
    }

    #[test]
    fn foreign_packets_rejected_unless_data() {
        let mut h = harness();
        let foreign = Packet::new(
            Command::Message,
            PeerId::from("someone"),
            PacketId::from("x"),
            vec![],
            peer_a(),
        );
        assert!(matches!(
            h.d.outbox(foreign, false, false, h.t0),
            Err(OutboxError::ForeignPacket { .. })
        ));

        let returned = Packet::new(
            Command::Data,
            peer_a(),
            PacketId::from("backup-0"),
            vec![1, 2, 3],
            PeerId::default(),
        );
        assert!(matches!(
            h.d.outbox(returned, false, false, h.t0),
            Ok(OutboxOutcome::Queued(_))
        ));
    }

    #[test]
    fn empty_destination_is_noop() {
        let mut h = harness();
        let p = Packet::new(Command::Message, me(), PacketId::from("x"), vec![], PeerId::default());
        assert_eq!(
            h.d.outbox(p, false, false, h.t0).unwrap(),
            OutboxOutcome::NoDestination
        );
        assert!(h.d.queue().is_empty());
    }

    #[test]
    fn unresolved_destination_retries_then_drops() {
        let mut h = harness();
        let stranger = PeerId::from("stranger");
        let p = Packet::new(Command::Message, me(), PacketId::from("s1"), vec![], stranger.clone());
        let OutboxOutcome::AwaitingContact(blob) = h.d.outbox(p, false, false, h.t0).unwrap()
        else {
            panic!("expected AwaitingContact");
        };
        assert_eq!(h.resolver.requests.lock().unwrap().len(), 1);

        let mut now = h.t0;
        for attempt in 2..=3 {
            h.d.on_contact_resolved(&stranger, None, now);
            now += Duration::from_secs(5);
            h.d.tick(now);
            assert_eq!(h.resolver.requests.lock().unwrap().len(), attempt - 1);
            now += Duration::from_secs(5);
            h.d.tick(now);
            assert_eq!(h.resolver.requests.lock().unwrap().len(), attempt);
        }
        h.d.on_contact_resolved(&stranger, None, now);
        assert!(!h.d.blobs.exists(&blob));
        assert_eq!(h.d.stats().pending_resolutions, 0);
        assert_eq!(
            *h.statuses.lock().unwrap(),
            vec![OutboxStatus::Unresolved]
        );
    }

    #[test]
    fn resolved_destination_is_sent() {
        let mut h = harness();
        let bob = PeerId::from("bob");
        let p = Packet::new(Command::Message, me(), PacketId::from("b1"), vec![], bob.clone());
        h.d.outbox(p, false, false, h.t0).unwrap();
        assert!(h.sends.lock().unwrap().is_empty());
        h.d.on_contact_resolved(
            &bob,
            Some(ContactInfo::new(vec![ContactMethod::new("tcp", "10.0.0.9", 7771)])),
            h.t0,
        );
        let sends = h.sends.lock().unwrap().clone();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].2, "10.0.0.9");
    }

    #[test]
    fn malformed_inbox_is_quarantined() {
        let mut h = harness();
        let blob = h.d.blobs.write("inbox", b"\x02\x00\x00\x00zz").unwrap();
        assert!(h.d.inbox(&blob, "tcp", "10.0.0.2", h.t0).is_none());
        assert!(!h.d.blobs.exists(&blob));
        assert!(!h.d.is_alive(&peer_a(), h.t0));
    }

    #[test]
    fn interest_and_callbacks_claim_packets() {
        let mut h = harness();
        let inbox_statuses = Arc::new(Mutex::new(Vec::new()));
        let s = inbox_statuses.clone();
        h.d.callbacks_mut()
            .inbox_status
            .add(Arc::new(move |e: &InboxEvent| s.lock().unwrap().push(e.status)));

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        h.d.register_interest(
            me(),
            PacketId::from("r1"),
            Arc::new(move |_p: &Packet| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let mut reply = Packet::new(Command::Data, me(), PacketId::from("r1"), vec![9], me());
        reply.owner_id = peer_a();
        let blob = inbound_blob(&mut h, &reply);
        assert!(h.d.inbox(&blob, "tcp", "10.0.0.2", h.t0).is_some());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(h.d.is_alive(&peer_a(), h.t0));

        let blob = inbound_blob(&mut h, &reply);
        h.d.inbox(&blob, "tcp", "10.0.0.2", h.t0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(
            *inbox_statuses.lock().unwrap(),
            vec![InboxStatus::Received, InboxStatus::Unhandled]
        );
    }

    #[test]
    fn pings_fire_for_quiet_alive_peers() {
        let mut config = TransportConfig::default();
        config.ping_interval_secs = 40;
        config.central_server_id = Some(PeerId::from("central"));
        let mut h = harness_with(config);
        let pinged = Arc::new(Mutex::new(Vec::new()));
        let p = pinged.clone();
        h.d.callbacks_mut()
            .ping
            .add(Arc::new(move |peer: &PeerId| p.lock().unwrap().push(peer.clone())));

        for who in [peer_a(), PeerId::from("central")] {
            let mut pkt = Packet::new(Command::Identity, who.clone(), PacketId::from("id"), vec![], me());
            pkt.owner_id = who;
            let blob = inbound_blob(&mut h, &pkt);
            h.d.inbox(&blob, "tcp", "10.0.0.2", h.t0);
        }
        h.d.tick(h.t0 + Duration::from_secs(5));
        assert!(pinged.lock().unwrap().is_empty());
        h.d.tick(h.t0 + Duration::from_secs(11));
        assert_eq!(*pinged.lock().unwrap(), vec![peer_a()]);
    }

    #[test]
    fn shutdown_drains_then_stops_listeners() {
        let mut config = TransportConfig::default();
        config.shutdown_max_polls = 2;
        let mut h = harness_with(config);
        h.d.start_listening(
            "tcp",
            ListenOptions {
                host: "0.0.0.0".into(),
                port: 7771,
                path: None,
            },
        )
        .unwrap();
        let OutboxOutcome::Queued(first) = h
            .d
            .outbox(packet(Command::Message, "m1"), true, false, h.t0)
            .unwrap()
        else {
            panic!("expected Queued");
        };
        h.d.handle_send_completion(&first, true, "tcp", "10.0.0.2", h.t0);
        h.d.begin_shutdown();
        assert_eq!(
            h.d.outbox(packet(Command::Message, "m2"), false, false, h.t0)
                .unwrap(),
            OutboxOutcome::ShuttingDown
        );
        assert_eq!(h.d.shutdown_poll(h.t0), ShutdownStep::Draining { active: 1 });
        assert_eq!(h.d.shutdown_poll(h.t0), ShutdownStep::Draining { active: 1 });
        assert_eq!(
            h.d.shutdown_poll(h.t0),
            ShutdownStep::Stopped {
                listeners: vec![("tcp".into(), ListenerHandle(7771))],
                abandoned: 1,
            }
        );
        assert_eq!(*h.stopped.lock().unwrap(), vec![ListenerHandle(7771)]);
        assert!(!h.d.protocols().is_enabled("tcp"));
    }

    #[test]
    fn transfers_feed_totals_and_rate() {
        let mut h = harness();
        let id = h.d.start_transfer(
            "tcp",
            Direction::Send,
            "10.0.0.2:7771",
            BlobRef::new("b"),
            2048,
            None,
        );
        assert_eq!(
            h.d.transfers().get(id).unwrap().remote_peer_id,
            Some(peer_a())
        );
        let summary = h.d.end_transfer(id, Some(2048)).unwrap();
        assert_eq!(summary.bytes, 2048);
        h.d.tick(h.t0);
        h.d.tick(h.t0 + Duration::from_secs(1));
        let stats = h.d.stats();
        assert_eq!(stats.totals.sent, 2048);
        assert!((stats.average_send_rate - 2048.0).abs() < f64::EPSILON);
    }

    #[test]
    fn bandwidth_caps_follow_measured_rates() {
        let mut config = TransportConfig::default();
        config.band_out_limit_kb = 1;
        config.band_in_limit_kb = 1;
        let mut h = harness_with(config);
        assert_eq!(h.d.next_send_chunk_size(1000, 4096), 4096);
        assert_eq!(h.d.next_receive_delay(1024), Duration::ZERO);

        h.d.tick(h.t0);
        for (direction, bytes) in [(Direction::Send, 10_240), (Direction::Receive, 3072)] {
            let id = h.d.start_transfer(
                "tcp",
                direction,
                "10.0.0.2:7771",
                BlobRef::new("b"),
                bytes,
                None,
            );
            h.d.end_transfer(id, Some(bytes));
        }
        // nothing changes until the next sample
        assert_eq!(h.d.next_send_chunk_size(1000, 4096), 4096);
        h.d.tick(h.t0 + Duration::from_secs(1));

        assert_eq!(h.d.next_send_chunk_size(1000, 4096), 500);
        assert_eq!(h.d.next_receive_delay(1024), Duration::from_secs(1));
        assert_eq!(h.d.next_receive_delay(1 << 20), Duration::from_secs(8));
    }

    #[test]
    fn failing_transport_start_blocks() {
        let mut h = harness();
        h.d.register_transport(Box::new(FakeTransport {
            name: "tcp",
            sends: h.sends.clone(),
            stopped: h.stopped.clone(),
            fail_start: true,
        }));
        h.d.outbox(packet(Command::Message, "m1"), false, false, h.t0)
            .unwrap();
        assert!(h.sends.lock().unwrap().is_empty());
        assert_eq!(h.d.queue().items()[0].in_flight, 0);
    }
}
