//! PeerLink transport control.
//! Host-driven: no I/O; the host passes events (with the current time) and the
//! dispatcher calls back into the injected transports, resolver, codec and blob store.

pub mod blob;
pub mod config;
pub mod contact;
pub mod dispatcher;
pub mod events;
pub mod identity;
pub mod interest;
pub mod liveness;
pub mod packet;
pub mod protocols;
pub mod queue;
pub mod rate;
pub mod scheduler;
pub mod transfer;
pub mod transport;
pub mod wire;

pub use blob::{BlobError, BlobStore, MemoryBlobStore};
pub use config::TransportConfig;
pub use contact::{ContactInfo, ContactMethod, ContactResolver};
pub use dispatcher::{
    Dispatcher, DispatcherStats, OutboxError, OutboxOutcome, ShutdownStep,
};
pub use events::{InboxEvent, InboxStatus, OutboxEvent, OutboxStatus};
pub use identity::{BlobRef, PacketId, PeerId, TransferId};
pub use packet::{CodecError, Command, Packet, PacketCodec};
pub use transfer::Direction;
pub use transport::{ListenOptions, ListenerHandle, Transport, TransportError};
pub use wire::{decode_frame, encode_frame, frame_len, BincodeCodec, FrameDecodeError, FrameEncodeError};
