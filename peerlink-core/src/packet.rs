//! Packet model and the codec capability that turns packets into bytes.

use serde::{Deserialize, Serialize};

use crate::identity::{PacketId, PeerId};

/// Packet command. The core only treats `Ack` and `Data` specially.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    Ack,
    Fail,
    Data,
    Retrieve,
    Identity,
    RequestService,
    CancelService,
    ListFiles,
    Files,
    Message,
    Other(String),
}

impl Command {
    pub fn as_str(&self) -> &str {
        match self {
            Command::Ack => "Ack",
            Command::Fail => "Fail",
            Command::Data => "Data",
            Command::Retrieve => "Retrieve",
            Command::Identity => "Identity",
            Command::RequestService => "RequestService",
            Command::CancelService => "CancelService",
            Command::ListFiles => "ListFiles",
            Command::Files => "Files",
            Command::Message => "Message",
            Command::Other(name) => name,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signed unit of exchange between peers. Opaque to the core apart from
/// these accessors; identity for correlation is `(creator_id, packet_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub command: Command,
    pub creator_id: PeerId,
    pub owner_id: PeerId,
    pub packet_id: PacketId,
    /// Creation time, seconds since the Unix epoch.
    pub date: u64,
    pub payload: Vec<u8>,
    pub remote_id: PeerId,
    pub signature: Vec<u8>,
}

impl Packet {
    /// Packet created and owned by `creator`, addressed to `remote`.
    pub fn new(
        command: Command,
        creator: PeerId,
        packet_id: PacketId,
        payload: Vec<u8>,
        remote: PeerId,
    ) -> Self {
        Self {
            command,
            owner_id: creator.clone(),
            creator_id: creator,
            packet_id,
            date: 0,
            payload,
            remote_id: remote,
            signature: Vec::new(),
        }
    }

    pub fn key(&self) -> (PeerId, PacketId) {
        (self.creator_id.clone(), self.packet_id.clone())
    }
}

/// Serialize/unserialize capability. Signing and verification live behind it.
pub trait PacketCodec {
    fn serialize(&self, packet: &Packet) -> Result<Vec<u8>, CodecError>;
    fn unserialize(&self, bytes: &[u8]) -> Result<Packet, CodecError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("trailing bytes after packet")]
    Trailing,
}
