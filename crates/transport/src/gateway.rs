//! Gateway audio frame header
//!
//! Sixteen bytes, big-endian:
//! `[type:1][reserved:1][payload_len:2][seq:4][timestamp:4][payload_len:4]`
//!
//! The same layout prefixes binary WebSocket frames on connections opened
//! with `from=mqtt_gateway` and every audio datagram on the broker variant.

use crate::TransportError;

pub const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioHeader {
    pub packet_type: u8,
    pub payload_len: u32,
    pub sequence: u32,
    pub timestamp: u32,
}

impl AudioHeader {
    pub fn new(packet_type: u8, sequence: u32, timestamp: u32, payload_len: u32) -> Self {
        Self {
            packet_type,
            payload_len,
            sequence,
            timestamp,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0] = self.packet_type;
        header[2..4].copy_from_slice(&(self.payload_len.min(u16::MAX as u32) as u16).to_be_bytes());
        header[4..8].copy_from_slice(&self.sequence.to_be_bytes());
        header[8..12].copy_from_slice(&self.timestamp.to_be_bytes());
        header[12..16].copy_from_slice(&self.payload_len.to_be_bytes());
        header
    }

    pub fn decode(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() < HEADER_LEN {
            return Err(TransportError::Malformed(format!(
                "audio header needs {HEADER_LEN} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            packet_type: data[0],
            payload_len: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            sequence: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            timestamp: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    /// Split a header-prefixed frame into `(header, payload)`.
    ///
    /// When the declared length is implausible the remainder after the
    /// header is taken as-is, matching the tolerant gateway behavior.
    pub fn split_frame(data: &[u8]) -> Result<(Self, &[u8]), TransportError> {
        let header = Self::decode(data)?;
        let rest = &data[HEADER_LEN..];
        let len = header.payload_len as usize;
        let payload = if len > 0 && rest.len() >= len {
            &rest[..len]
        } else {
            rest
        };
        Ok((header, payload))
    }

    /// Prefix `payload` with this header.
    pub fn wrap(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(&self.encode());
        out.extend_from_slice(payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let header = AudioHeader::new(1, 42, 123_456, 960);
        let decoded = AudioHeader::decode(&header.encode()).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn split_respects_declared_length() {
        let payload = vec![0xAAu8; 10];
        let frame = AudioHeader::new(1, 0, 0, 10).wrap(&payload);
        let (header, split) = AudioHeader::split_frame(&frame).unwrap();
        assert_eq!(header.payload_len, 10);
        assert_eq!(split, &payload[..]);
    }

    #[test]
    fn split_tolerates_bad_length() {
        let payload = vec![0xAAu8; 10];
        let frame = AudioHeader::new(1, 0, 0, 500).wrap(&payload);
        let (_, split) = AudioHeader::split_frame(&frame).unwrap();
        assert_eq!(split.len(), 10);
    }

    #[test]
    fn short_frame_is_rejected() {
        assert!(AudioHeader::decode(&[0u8; 8]).is_err());
    }
}
