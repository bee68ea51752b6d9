//! Bandwidth caps: rolling per-second byte counters and the throttling math.
//!
//! The sampler has no timer of its own; the dispatcher tick calls
//! [`RateLimiter::sample`] and a new sample is taken once a full second has passed.
//! A cap of `0` means unlimited.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of one-second samples kept for the rolling average.
pub const HISTORY_LEN: usize = 20;

const SAMPLE_PERIOD: Duration = Duration::from_secs(1);
const MIN_RECEIVE_DELAY: Duration = Duration::from_secs(1);
const MAX_RECEIVE_DELAY: Duration = Duration::from_secs(8);

#[derive(Debug)]
pub struct RateLimiter {
    /// (bytes received, bytes sent) per past second, newest last.
    history: VecDeque<(u64, u64)>,
    received_this_period: u64,
    sent_this_period: u64,
    period_start: Option<Instant>,
    average_receive_rate: f64,
    average_send_rate: f64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_LEN),
            received_this_period: 0,
            sent_this_period: 0,
            period_start: None,
            average_receive_rate: 0.0,
            average_send_rate: 0.0,
        }
    }

    pub fn record_sent(&mut self, bytes: u64) {
        self.sent_this_period = self.sent_this_period.saturating_add(bytes);
    }

    pub fn record_received(&mut self, bytes: u64) {
        self.received_this_period = self.received_this_period.saturating_add(bytes);
    }

    /// Close the current one-second period if it is over. Returns true when a sample was taken.
    pub fn sample(&mut self, now: Instant) -> bool {
        let Some(start) = self.period_start else {
            self.period_start = Some(now);
            return false;
        };
        let elapsed = now.saturating_duration_since(start);
        if elapsed < SAMPLE_PERIOD {
            return false;
        }
        // A late tick: the seconds in between carried no recorded traffic.
        let idle = (elapsed.as_secs() as usize).saturating_sub(1).min(HISTORY_LEN);
        for _ in 0..idle {
            self.push_sample(0, 0);
        }
        self.push_sample(self.received_this_period, self.sent_this_period);
        self.received_this_period = 0;
        self.sent_this_period = 0;
        self.period_start = Some(now);

        let n = self.history.len() as f64;
        let (recv, sent) = self
            .history
            .iter()
            .fold((0u64, 0u64), |(r, s), &(hr, hs)| (r + hr, s + hs));
        self.average_receive_rate = recv as f64 / n;
        self.average_send_rate = sent as f64 / n;
        true
    }

    fn push_sample(&mut self, received: u64, sent: u64) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back((received, sent));
    }

    /// Bytes per second sent, averaged over the history window.
    pub fn average_send_rate(&self) -> f64 {
        self.average_send_rate
    }

    /// Bytes per second received, averaged over the history window.
    pub fn average_receive_rate(&self) -> f64 {
        self.average_receive_rate
    }

    /// Chunk size for the next outbound read. Over the cap, the previous chunk
    /// size is halved (never below 1).
    pub fn next_send_chunk_size(
        &self,
        prev_chunk_size: usize,
        requested_chunk_size: usize,
        cap_bytes_per_sec: u64,
    ) -> usize {
        if cap_bytes_per_sec == 0 || self.average_send_rate < cap_bytes_per_sec as f64 {
            return requested_chunk_size;
        }
        (prev_chunk_size / 2).max(1)
    }

    /// How long an inbound reader should pause after reading `new_bytes`.
    pub fn next_receive_delay(&self, new_bytes: u64, cap_bytes_per_sec: u64) -> Duration {
        let cap = cap_bytes_per_sec as f64;
        if cap_bytes_per_sec == 0 || self.average_receive_rate <= cap {
            return Duration::ZERO;
        }
        let secs = new_bytes as f64 / (self.average_receive_rate - cap);
        Duration::from_secs_f64(secs).clamp(MIN_RECEIVE_DELAY, MAX_RECEIVE_DELAY)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}
