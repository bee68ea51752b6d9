//! Framing: length-prefix (4 bytes LE) + bincode payload. Also the default packet codec.

use crate::packet::{CodecError, Packet, PacketCodec};

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a packet into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(packet).map_err(FrameEncodeError::Encode)?;
    frame_bytes(&payload)
}

/// Wrap already-serialized bytes in a length-prefixed frame.
pub fn frame_bytes(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = payload.len() as u32;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Length of the frame at the front of `bytes`, or `NeedMore`.
/// Returns (header + body length) once the whole frame is buffered.
pub fn frame_len(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok(LEN_SIZE + len)
}

/// Decode one frame from the front of `bytes`. Returns the packet and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Packet, usize), FrameDecodeError> {
    let total = frame_len(bytes)?;
    let packet: Packet =
        bincode::deserialize(&bytes[LEN_SIZE..total]).map_err(FrameDecodeError::Decode)?;
    Ok((packet, total))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Default [`PacketCodec`]: one packet per frame, no trailing bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl PacketCodec for BincodeCodec {
    fn serialize(&self, packet: &Packet) -> Result<Vec<u8>, CodecError> {
        encode_frame(packet).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn unserialize(&self, bytes: &[u8]) -> Result<Packet, CodecError> {
        let (packet, used) = decode_frame(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        if used != bytes.len() {
            return Err(CodecError::Trailing);
        }
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{PacketId, PeerId};
    use crate::packet::Command;

    fn sample() -> Packet {
        Packet::new(
            Command::Identity,
            PeerId::from("alice"),
            PacketId::from("id-1"),
            b"hello".to_vec(),
            PeerId::from("bob"),
        )
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..super::LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_frames_in_buffer() {
        let a = sample();
        let mut b = sample();
        b.packet_id = PacketId::from("id-2");
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = fa.clone();
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(m1, a);
        assert_eq!(m2.packet_id, PacketId::from("id-2"));
    }

    #[test]
    fn oversized_length_rejected() {
        let mut buf = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 8]);
        assert!(matches!(frame_len(&buf), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn codec_rejects_garbage_and_trailing() {
        let codec = BincodeCodec;
        assert!(codec.unserialize(b"\x03\x00\x00\x00abc").is_err());
        let mut bytes = codec.serialize(&sample()).unwrap();
        bytes.push(0);
        assert!(matches!(codec.unserialize(&bytes), Err(CodecError::Trailing)));
    }
}
