//! Frame codec for the echo wire protocol.
//!
//! Every message is a fixed 12-byte header followed by `data_len` payload
//! bytes. All header fields are in network byte order:
//!
//! ```text
//! offset 0  magic     u32   must equal 0x1A2B3C4D
//! offset 4  data_len  u32   1..=buffer_size
//! offset 8  msg_id    u32   opaque correlation id, caller-assigned
//! offset 12 payload   data_len bytes
//! ```
//!
//! The codec is pure: encode/decode/validate only, no I/O. A magic mismatch
//! or an out-of-range length is a protocol violation and tears the owning
//! connection down; neither is recoverable.

use bytes::{Buf, BufMut};

/// Magic constant every frame header must carry.
pub const FRAME_MAGIC: u32 = 0x1A2B_3C4D;

/// Size of the encoded frame header in bytes.
pub const HEADER_LEN: usize = 12;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub data_len: u32,
    pub msg_id: u32,
}

impl FrameHeader {
    /// Build a header for an outgoing frame.
    pub fn new(data_len: u32, msg_id: u32) -> Self {
        Self {
            magic: FRAME_MAGIC,
            data_len,
            msg_id,
        }
    }

    /// Decode a header from its 12-byte wire form.
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Self {
        let mut buf = &bytes[..];
        Self {
            magic: buf.get_u32(),
            data_len: buf.get_u32(),
            msg_id: buf.get_u32(),
        }
    }

    /// Encode the header into its 12-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        let mut buf = &mut bytes[..];
        buf.put_u32(self.magic);
        buf.put_u32(self.data_len);
        buf.put_u32(self.msg_id);
        bytes
    }

    /// Check the header against the protocol rules.
    ///
    /// `data_len` must lie in `1..=buffer_size`; a zero-length body is
    /// rejected. `msg_id` is opaque and never checked.
    pub fn validate(&self, buffer_size: usize) -> Result<(), FrameError> {
        if self.magic != FRAME_MAGIC {
            return Err(FrameError::InvalidMagic(self.magic));
        }
        if self.data_len == 0 || self.data_len as usize > buffer_size {
            return Err(FrameError::InvalidLength(self.data_len));
        }
        Ok(())
    }
}

/// Protocol violations detected while validating a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    InvalidMagic(u32),
    InvalidLength(u32),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::InvalidMagic(magic) => {
                write!(f, "bad magic {magic:#010x}, expected {FRAME_MAGIC:#010x}")
            }
            FrameError::InvalidLength(len) => write!(f, "data length {len} out of range"),
        }
    }
}

impl std::error::Error for FrameError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let header = FrameHeader::new(5, 7);
        let bytes = header.encode();

        assert_eq!(&bytes[0..4], &[0x1A, 0x2B, 0x3C, 0x4D]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 5]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 7]);
    }

    #[test]
    fn test_decode_roundtrip() {
        let header = FrameHeader::new(16384, u32::MAX);
        let decoded = FrameHeader::decode(&header.encode());
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_validate_ok() {
        assert!(FrameHeader::new(1, 0).validate(16384).is_ok());
        assert!(FrameHeader::new(16384, 99).validate(16384).is_ok());
    }

    #[test]
    fn test_validate_bad_magic() {
        let header = FrameHeader {
            magic: 0xDEAD_BEEF,
            data_len: 5,
            msg_id: 0,
        };
        assert_eq!(
            header.validate(16384),
            Err(FrameError::InvalidMagic(0xDEAD_BEEF))
        );
    }

    #[test]
    fn test_validate_zero_length() {
        let header = FrameHeader::new(0, 1);
        assert_eq!(header.validate(16384), Err(FrameError::InvalidLength(0)));
    }

    #[test]
    fn test_validate_oversized_length() {
        let header = FrameHeader::new(16385, 1);
        assert_eq!(
            header.validate(16384),
            Err(FrameError::InvalidLength(16385))
        );
    }

    #[test]
    fn test_decode_rejects_garbage_magic() {
        let bytes = [0xFFu8; HEADER_LEN];
        let header = FrameHeader::decode(&bytes);
        assert!(matches!(
            header.validate(16384),
            Err(FrameError::InvalidMagic(_))
        ));
    }
}
