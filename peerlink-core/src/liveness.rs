//! Liveness: per-peer last-seen time, send failure count, ping bookkeeping.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::identity::PeerId;

/// Consecutive send failures after which a peer is considered offline.
pub const STALE_AFTER_FAILURES: u32 = 1;

/// Per-peer record. `last_alive_at == None` means stale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerLivenessRecord {
    pub last_alive_at: Option<Instant>,
    pub consecutive_send_failures: u32,
    pub last_ping_sent_at: Option<Instant>,
}

/// Tracks which peers are reachable.
///
/// A single failed send marks a peer stale right away: one failure is taken
/// as strong evidence the peer is offline.
#[derive(Debug, Default)]
pub struct LivenessTracker {
    records: HashMap<PeerId, PeerLivenessRecord>,
    alive_timeout: Duration,
    /// Infrastructure identities that are never pinged.
    no_ping: HashSet<PeerId>,
}

impl LivenessTracker {
    pub fn new(alive_timeout: Duration) -> Self {
        Self {
            records: HashMap::new(),
            alive_timeout,
            no_ping: HashSet::new(),
        }
    }

    /// Never schedule pings for `peer` (central server, money server).
    pub fn exclude_from_pings(&mut self, peer: PeerId) {
        if !peer.is_empty() {
            self.no_ping.insert(peer);
        }
    }

    pub fn get_or_create(&mut self, peer: &PeerId) -> &mut PeerLivenessRecord {
        self.records.entry(peer.clone()).or_default()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerLivenessRecord> {
        self.records.get(peer)
    }

    /// Valid traffic from `peer`. Returns true if the peer just became alive.
    pub fn touch(&mut self, peer: &PeerId, now: Instant) -> bool {
        let was_alive = self.is_alive(peer, self.alive_timeout, now);
        let record = self.get_or_create(peer);
        record.last_alive_at = Some(now);
        record.consecutive_send_failures = 0;
        !was_alive
    }

    /// A send to `peer` failed. The first failure makes the peer stale.
    /// Returns true if the peer was alive before this failure.
    pub fn record_failure(&mut self, peer: &PeerId, now: Instant) -> bool {
        let was_alive = self.is_alive(peer, self.alive_timeout, now);
        let record = self.get_or_create(peer);
        record.consecutive_send_failures += 1;
        if record.consecutive_send_failures >= STALE_AFTER_FAILURES {
            record.last_alive_at = None;
        }
        was_alive
    }

    pub fn is_alive(&self, peer: &PeerId, timeout: Duration, now: Instant) -> bool {
        match self.records.get(peer).and_then(|r| r.last_alive_at) {
            Some(at) => now.saturating_duration_since(at) < timeout,
            None => false,
        }
    }

    /// Alive using the tracker's default timeout.
    pub fn is_alive_now(&self, peer: &PeerId, now: Instant) -> bool {
        self.is_alive(peer, self.alive_timeout, now)
    }

    /// Whether `peer` is due a keep-alive ping. When true, the ping is
    /// recorded as sent and the caller must emit it.
    pub fn maybe_schedule_ping(
        &mut self,
        peer: &PeerId,
        ping_interval: Duration,
        now: Instant,
    ) -> bool {
        if self.no_ping.contains(peer) {
            return false;
        }
        if !self.is_alive(peer, self.alive_timeout, now) {
            return false;
        }
        let quarter = ping_interval / 4;
        let record = self.get_or_create(peer);
        let seen_recently = record
            .last_alive_at
            .is_some_and(|at| now.saturating_duration_since(at) <= quarter);
        let pinged_recently = record
            .last_ping_sent_at
            .is_some_and(|at| now.saturating_duration_since(at) <= quarter);
        if seen_recently || pinged_recently {
            return false;
        }
        record.last_ping_sent_at = Some(now);
        true
    }

    pub fn note_ping_sent(&mut self, peer: &PeerId, now: Instant) {
        self.get_or_create(peer).last_ping_sent_at = Some(now);
    }

    /// Administrative reset: forget that `peer` was alive.
    pub fn clear(&mut self, peer: &PeerId) {
        if let Some(record) = self.records.get_mut(peer) {
            record.last_alive_at = None;
        }
    }

    pub fn known_peers(&self) -> Vec<PeerId> {
        self.records.keys().cloned().collect()
    }

    pub fn failure_count(&self, peer: &PeerId) -> u32 {
        self.records
            .get(peer)
            .map(|r| r.consecutive_send_failures)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(60);

    #[test]
    fn touch_reports_transition_once() {
        let t0 = Instant::now();
        let mut l = LivenessTracker::new(TIMEOUT);
        let p = PeerId::from("alice");
        assert!(!l.is_alive(&p, TIMEOUT, t0));
        assert!(l.touch(&p, t0));
        assert!(!l.touch(&p, t0 + Duration::from_secs(1)));
        assert!(l.is_alive(&p, TIMEOUT, t0 + Duration::from_secs(30)));
        assert!(!l.is_alive(&p, TIMEOUT, t0 + Duration::from_secs(62)));
    }

    #[test]
    fn single_failure_marks_stale() {
        let t0 = Instant::now();
        let mut l = LivenessTracker::new(TIMEOUT);
        let p = PeerId::from("alice");
        l.touch(&p, t0);
        let now = t0 + Duration::from_secs(1);
        assert!(l.record_failure(&p, now));
        assert!(!l.is_alive(&p, TIMEOUT, now));
        assert_eq!(l.failure_count(&p), 1);
        l.touch(&p, now);
        assert_eq!(l.failure_count(&p), 0);
    }

    #[test]
    fn ping_only_when_quiet_for_a_quarter_interval() {
        let t0 = Instant::now();
        let interval = Duration::from_secs(40);
        let mut l = LivenessTracker::new(TIMEOUT);
        let p = PeerId::from("alice");
        l.touch(&p, t0);
        assert!(!l.maybe_schedule_ping(&p, interval, t0 + Duration::from_secs(5)));
        assert!(l.maybe_schedule_ping(&p, interval, t0 + Duration::from_secs(11)));
        assert!(!l.maybe_schedule_ping(&p, interval, t0 + Duration::from_secs(15)));
        assert!(l.maybe_schedule_ping(&p, interval, t0 + Duration::from_secs(22)));
    }

    #[test]
    fn no_ping_for_dead_or_excluded_peers() {
        let t0 = Instant::now();
        let interval = Duration::from_secs(40);
        let mut l = LivenessTracker::new(TIMEOUT);
        let dead = PeerId::from("dead");
        assert!(!l.maybe_schedule_ping(&dead, interval, t0));

        let central = PeerId::from("central");
        l.exclude_from_pings(central.clone());
        l.touch(&central, t0);
        assert!(!l.maybe_schedule_ping(&central, interval, t0 + Duration::from_secs(30)));
    }

    #[test]
    fn clear_resets_liveness() {
        let t0 = Instant::now();
        let mut l = LivenessTracker::new(TIMEOUT);
        let p = PeerId::from("alice");
        l.touch(&p, t0);
        l.clear(&p);
        assert!(!l.is_alive_now(&p, t0));
        assert_eq!(l.known_peers(), vec![p]);
    }
}
