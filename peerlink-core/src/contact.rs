//! Contact resolution: where a peer can be reached, and the bounded retry
//! used when the resolver does not know a peer yet.

use std::time::{Duration, Instant};

use crate::identity::PeerId;

/// Default number of asynchronous resolution attempts before a send is dropped.
pub const DEFAULT_RESOLVE_ATTEMPTS: u32 = 3;

/// Default delay between resolution attempts.
pub const DEFAULT_RESOLVE_INTERVAL: Duration = Duration::from_secs(10);

/// One advertised way of reaching a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactMethod {
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

impl ContactMethod {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
            port,
        }
    }
}

/// Routing info for a peer; methods are in the peer's preferred order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactInfo {
    pub methods: Vec<ContactMethod>,
}

impl ContactInfo {
    pub fn new(methods: Vec<ContactMethod>) -> Self {
        Self { methods }
    }
}

/// Identity lookup capability.
pub trait ContactResolver {
    /// Cached contact info, if known.
    fn get_contact(&self, peer: &PeerId) -> Option<ContactInfo>;

    /// Start a caching fetch. The host reports the result through
    /// [`crate::Dispatcher::on_contact_resolved`].
    fn resolve_async(&mut self, peer: &PeerId);

    /// Reverse lookup used for transfer bookkeeping.
    fn peer_for_address(&self, protocol: &str, host: &str) -> Option<PeerId>;
}

/// Bounded retry state for one unresolved peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionAttempt {
    pub count: u32,
    pub max_count: u32,
    pub interval: Duration,
    /// When the next fetch should start; `None` while a fetch is outstanding.
    pub next_at: Option<Instant>,
}

/// What to do after a failed resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt(Instant),
    GiveUp,
}

impl ResolutionAttempt {
    /// First attempt, started immediately.
    pub fn start(max_count: u32, interval: Duration) -> Self {
        Self {
            count: 1,
            max_count,
            interval,
            next_at: None,
        }
    }

    /// Record a failed fetch.
    pub fn on_failure(&mut self, now: Instant) -> RetryDecision {
        if self.count >= self.max_count {
            self.next_at = None;
            return RetryDecision::GiveUp;
        }
        let at = now + self.interval;
        self.next_at = Some(at);
        RetryDecision::RetryAt(at)
    }

    /// True when a scheduled retry is due; marks the fetch as outstanding.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.next_at {
            Some(at) if now >= at => {
                self.next_at = None;
                self.count += 1;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gives_up_after_max_attempts() {
        let t0 = Instant::now();
        let mut a = ResolutionAttempt::start(3, Duration::from_secs(10));
        assert_eq!(
            a.on_failure(t0),
            RetryDecision::RetryAt(t0 + Duration::from_secs(10))
        );
        assert!(!a.take_due(t0 + Duration::from_secs(9)));
        assert!(a.take_due(t0 + Duration::from_secs(10)));
        assert_eq!(a.count, 2);
        let t1 = t0 + Duration::from_secs(11);
        assert_eq!(
            a.on_failure(t1),
            RetryDecision::RetryAt(t1 + Duration::from_secs(10))
        );
        assert!(a.take_due(t1 + Duration::from_secs(10)));
        assert_eq!(a.count, 3);
        assert_eq!(a.on_failure(t1 + Duration::from_secs(12)), RetryDecision::GiveUp);
    }

    #[test]
    fn not_due_while_fetch_outstanding() {
        let t0 = Instant::now();
        let mut a = ResolutionAttempt::start(DEFAULT_RESOLVE_ATTEMPTS, DEFAULT_RESOLVE_INTERVAL);
        assert!(!a.take_due(t0 + Duration::from_secs(100)));
    }
}
