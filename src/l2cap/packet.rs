//! L2CAP basic header and reserved identifiers
//!
//! Every L2CAP PDU starts with a 4-byte header giving the payload length and
//! the destination channel identifier, both little-endian.

use crate::constants::L2CAP_HDR_LEN;

/// L2CAP decoding errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum L2capError {
    /// Packet data is too short (insufficient bytes for header or payload)
    InsufficientData,
    /// Payload exceeds buffer capacity
    PayloadTooLarge,
}

impl core::fmt::Display for L2capError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "Insufficient data for L2CAP packet"),
            Self::PayloadTooLarge => write!(f, "L2CAP payload exceeds buffer capacity"),
        }
    }
}

/// L2CAP Channel Identifier (CID)
///
/// - 0x0000: Reserved, shall not be used
/// - 0x0001: L2CAP Signaling channel
/// - 0x0002: Connectionless reception channel
/// - 0x0003-0x003F: Reserved
/// - 0x0040-0xFFFF: Dynamically allocated
pub type ChannelId = u16;

/// L2CAP Protocol Service Multiplexer (PSM)
pub type ProtocolServiceMultiplexer = u16;

/// L2CAP reserved channel identifiers
pub mod cid {
    use super::ChannelId;

    /// Reserved - shall not be used
    pub const NULL: ChannelId = 0x0000;
    /// L2CAP Signaling channel
    pub const SIGNALING: ChannelId = 0x0001;
    /// Connectionless reception channel
    pub const CONNECTIONLESS: ChannelId = 0x0002;

    /// First dynamically allocated CID
    pub const DYNAMIC_START: ChannelId = 0x0040;
    /// Last dynamically allocated CID
    pub const DYNAMIC_END: ChannelId = 0xFFFF;
}

/// Well-known Protocol Service Multiplexers
pub mod psm {
    use super::ProtocolServiceMultiplexer;

    /// HID control channel
    pub const HID_CONTROL: ProtocolServiceMultiplexer = 0x0011;
    /// HID interrupt channel
    pub const HID_INTERRUPT: ProtocolServiceMultiplexer = 0x0013;
}

/// L2CAP Basic Header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct L2capHeader {
    /// Length of the payload (not including the header itself)
    pub length: u16,
    /// Channel identifier of the intended recipient
    pub channel_id: ChannelId,
}

impl L2capHeader {
    /// Create a new L2CAP header
    #[must_use]
    pub fn new(length: u16, channel_id: ChannelId) -> Self {
        Self { length, channel_id }
    }

    /// Parse L2CAP header from byte slice
    ///
    /// # Errors
    /// Returns `L2capError::InsufficientData` if the slice is less than 4 bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, L2capError> {
        if bytes.len() < Self::HEADER_SIZE {
            return Err(L2capError::InsufficientData);
        }

        let length = u16::from_le_bytes([bytes[0], bytes[1]]);
        let channel_id = u16::from_le_bytes([bytes[2], bytes[3]]);

        Ok(Self::new(length, channel_id))
    }

    /// Convert header to bytes (little-endian)
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes[0..2].copy_from_slice(&self.length.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.channel_id.to_le_bytes());
        bytes
    }

    /// Bytes the whole PDU occupies, header included
    #[must_use]
    pub fn pdu_len(self) -> usize {
        Self::HEADER_SIZE + usize::from(self.length)
    }

    /// Whether the PDU is addressed to the signaling channel
    #[must_use]
    pub fn is_signaling(self) -> bool {
        self.channel_id == cid::SIGNALING
    }

    /// Size of the L2CAP header in bytes
    pub const HEADER_SIZE: usize = L2CAP_HDR_LEN;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2cap_header_serialization() {
        let header = L2capHeader::new(0x1234, 0x5678);
        let bytes = header.to_bytes();
        assert_eq!(bytes, [0x34, 0x12, 0x78, 0x56]); // Little-endian

        let parsed = L2capHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.pdu_len(), 0x1238);
    }

    #[test]
    fn test_l2cap_header_parsing_errors() {
        let short_bytes = [0x01, 0x02, 0x03];
        assert_eq!(
            L2capHeader::from_bytes(&short_bytes),
            Err(L2capError::InsufficientData)
        );
    }

    #[test]
    fn test_signaling_channel_detection() {
        assert!(L2capHeader::new(0, cid::SIGNALING).is_signaling());
        assert!(!L2capHeader::new(0, cid::CONNECTIONLESS).is_signaling());
        assert!(!L2capHeader::new(0, cid::DYNAMIC_START).is_signaling());
    }
}
