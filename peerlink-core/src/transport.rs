//! Wire transport capability. One implementation per protocol name ("tcp", "udp", ...).

use crate::identity::BlobRef;

/// Protocol that is always attempted, even when not marked enabled.
pub const ALWAYS_ON_PROTOCOL: &str = "tcp";

/// Opaque listener handle returned by [`Transport::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(pub u64);

/// Where a transport should listen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenOptions {
    pub host: String,
    pub port: u16,
    pub path: Option<String>,
}

pub trait Transport {
    /// Protocol name this transport serves.
    fn protocol(&self) -> &str;

    /// Start delivering `blob` to `host:port`. Returns once the attempt is dispatched;
    /// the outcome arrives later through [`crate::Dispatcher::handle_send_completion`].
    /// The transport must not read the blob after reporting completion.
    fn send(&mut self, blob: &BlobRef, host: &str, port: u16) -> Result<(), TransportError>;

    /// Start listening for inbound packets.
    fn receive(&mut self, options: &ListenOptions) -> Result<ListenerHandle, TransportError>;

    /// Ask a listener to stop. Hosts await the actual teardown themselves.
    fn stop_listening(&mut self, handle: ListenerHandle) -> Result<(), TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("invalid address {host}:{port}")]
    InvalidAddress { host: String, port: u16 },
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
}
