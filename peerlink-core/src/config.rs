//! Transport control settings. Loaded by the host (see peerlink-daemon); every field has a default.

use std::time::Duration;

use serde::Deserialize;

use crate::identity::PeerId;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Resends allowed per work item (Data packets always get 1).
    pub max_retries: u32,
    /// Initial ack/completion timeout for a work item; doubles on every retry.
    pub send_timeout_secs: u64,
    /// A peer counts as alive this long after its last valid packet.
    pub alive_timeout_secs: u64,
    /// Outbound cap in KB/s, 0 = unlimited.
    pub band_out_limit_kb: u64,
    /// Inbound cap in KB/s, 0 = unlimited.
    pub band_in_limit_kb: u64,
    /// Infrastructure identities never pinged.
    pub central_server_id: Option<PeerId>,
    pub money_server_id: Option<PeerId>,
    pub ping_interval_secs: u64,
    pub resolve_attempts: u32,
    pub resolve_interval_secs: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub delay_step_ms: u64,
    pub shutdown_poll_ms: u64,
    pub shutdown_max_polls: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            send_timeout_secs: 10,
            alive_timeout_secs: 300,
            band_out_limit_kb: 0,
            band_in_limit_kb: 0,
            central_server_id: None,
            money_server_id: None,
            ping_interval_secs: 300,
            resolve_attempts: crate::contact::DEFAULT_RESOLVE_ATTEMPTS,
            resolve_interval_secs: crate::contact::DEFAULT_RESOLVE_INTERVAL.as_secs(),
            min_delay_ms: 10,
            max_delay_ms: 2000,
            delay_step_ms: 100,
            shutdown_poll_ms: 500,
            shutdown_max_polls: 10,
        }
    }
}

impl TransportConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn alive_timeout(&self) -> Duration {
        Duration::from_secs(self.alive_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn resolve_interval(&self) -> Duration {
        Duration::from_secs(self.resolve_interval_secs)
    }

    pub fn shutdown_poll(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_ms)
    }

    pub fn band_out_limit_bytes(&self) -> u64 {
        self.band_out_limit_kb.saturating_mul(1024)
    }

    pub fn band_in_limit_bytes(&self) -> u64 {
        self.band_in_limit_kb.saturating_mul(1024)
    }

    /// Identities excluded from keep-alive pings.
    pub fn ping_exclusions(&self) -> impl Iterator<Item = &PeerId> {
        self.central_server_id
            .iter()
            .chain(self.money_server_id.iter())
    }
}
