//! L2CAP Signaling Protocol
//!
//! Signaling PDUs travel on CID 0x0001 and carry one or more commands, each
//! `[code][identifier][length LE][data]`. Odd codes are responses or rejects
//! and echo the identifier of the request they answer.

use super::packet::{ChannelId, L2capError, ProtocolServiceMultiplexer};
use crate::constants::{L2CAP_CFGOPTHDR_LEN, L2CAP_SIG_MTU, L2CAP_SIGHDR_LEN};
use heapless::Vec;

/// Largest command data this stack emits: one command per PDU within the minimum signaling MTU
pub const MAX_SIGNAL_DATA: usize = L2CAP_SIG_MTU as usize - L2CAP_SIGHDR_LEN;

/// L2CAP Signaling Command Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SignalingCode {
    /// Command Reject
    CommandReject = 0x01,
    /// Connection Request
    ConnectionRequest = 0x02,
    /// Connection Response
    ConnectionResponse = 0x03,
    /// Configuration Request
    ConfigurationRequest = 0x04,
    /// Configuration Response
    ConfigurationResponse = 0x05,
    /// Disconnection Request
    DisconnectionRequest = 0x06,
    /// Disconnection Response
    DisconnectionResponse = 0x07,
    /// Echo Request
    EchoRequest = 0x08,
    /// Echo Response
    EchoResponse = 0x09,
    /// Information Request
    InformationRequest = 0x0A,
    /// Information Response
    InformationResponse = 0x0B,
}

impl SignalingCode {
    /// Convert from raw byte value
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::CommandReject),
            0x02 => Some(Self::ConnectionRequest),
            0x03 => Some(Self::ConnectionResponse),
            0x04 => Some(Self::ConfigurationRequest),
            0x05 => Some(Self::ConfigurationResponse),
            0x06 => Some(Self::DisconnectionRequest),
            0x07 => Some(Self::DisconnectionResponse),
            0x08 => Some(Self::EchoRequest),
            0x09 => Some(Self::EchoResponse),
            0x0A => Some(Self::InformationRequest),
            0x0B => Some(Self::InformationResponse),
            _ => None,
        }
    }

    /// Responses and rejects carry odd codes
    #[must_use]
    pub const fn is_response(code: u8) -> bool {
        code % 2 == 1
    }
}

/// L2CAP Signaling Command Header
///
/// The code is kept raw so that unknown commands can still be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SignalingHeader {
    /// Command code
    pub code: u8,
    /// Command identifier (for matching requests/responses)
    pub identifier: u8,
    /// Length of command data
    pub length: u16,
}

impl SignalingHeader {
    /// Create a new signaling header
    #[must_use]
    pub fn new(code: SignalingCode, identifier: u8, length: u16) -> Self {
        Self {
            code: code as u8,
            identifier,
            length,
        }
    }

    /// Parse signaling header from bytes
    ///
    /// # Errors
    /// Returns `L2capError::InsufficientData` if fewer than 4 bytes are given
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, L2capError> {
        if bytes.len() < Self::SIZE {
            return Err(L2capError::InsufficientData);
        }

        Ok(Self {
            code: bytes[0],
            identifier: bytes[1],
            length: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }

    /// Convert header to bytes
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        let [l0, l1] = self.length.to_le_bytes();
        [self.code, self.identifier, l0, l1]
    }

    /// Size of signaling header in bytes
    pub const SIZE: usize = L2CAP_SIGHDR_LEN;
}

/// Connection response results
pub mod conn_result {
    /// Connection successful
    pub const SUCCESS: u16 = 0x0000;
    /// Connection pending
    pub const PENDING: u16 = 0x0001;
    /// Refused, PSM not supported
    pub const REFUSED_PSM: u16 = 0x0002;
    /// Refused, no resources available
    pub const REFUSED_RESOURCES: u16 = 0x0004;
    /// Local result: configuration did not finish in time
    pub const CONFIG_TIMEOUT: u16 = 0x0005;
}

/// Connection response status for pending results
pub mod conn_status {
    /// No further information available
    pub const NO_INFO: u16 = 0x0000;
}

/// Configuration response results
pub mod cfg_result {
    /// Success
    pub const SUCCESS: u16 = 0x0000;
    /// Failure, unacceptable parameters
    pub const UNACCEPTABLE: u16 = 0x0001;
    /// Failure, unknown options
    pub const UNKNOWN_OPTIONS: u16 = 0x0003;
}

/// Command reject reasons
pub mod reject_reason {
    /// Command not understood
    pub const NOT_UNDERSTOOD: u16 = 0x0000;
    /// Signaling MTU exceeded
    pub const MTU_EXCEEDED: u16 = 0x0001;
    /// Invalid CID in request
    pub const INVALID_CID: u16 = 0x0002;
}

/// Configuration option types
pub mod option {
    /// Maximum transmission unit
    pub const MTU: u8 = 0x01;
    /// Flush timeout
    pub const FLUSH_TIMEOUT: u8 = 0x02;
    /// Quality of service
    pub const QOS: u8 = 0x03;
    /// Set on options the receiver may skip
    pub const HINT: u8 = 0x80;

    /// Value length of the MTU option
    pub const MTU_LEN: u8 = 2;
    /// Value length of the flush timeout option
    pub const FLUSH_TIMEOUT_LEN: u8 = 2;
    /// Value length of the QoS option
    pub const QOS_LEN: u8 = 22;
}

/// `QoS` Service Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QosServiceType {
    /// No traffic (channel disabled)
    NoTraffic = 0x00,
    /// Best effort service
    BestEffort = 0x01,
    /// Guaranteed service
    Guaranteed = 0x02,
}

/// Continuation flag of configuration requests and responses
pub const CONFIG_CONTINUATION: u16 = 0x0001;

fn le16(bytes: &[u8], at: usize) -> Result<u16, L2capError> {
    match bytes.get(at..at + 2) {
        Some(b) => Ok(u16::from_le_bytes([b[0], b[1]])),
        None => Err(L2capError::InsufficientData),
    }
}

/// L2CAP Connection Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionRequest {
    /// Protocol Service Multiplexer
    pub psm: ProtocolServiceMultiplexer,
    /// Source Channel Identifier
    pub source_cid: ChannelId,
}

impl ConnectionRequest {
    /// Parse from bytes
    ///
    /// # Errors
    /// Returns `L2capError::InsufficientData` if not enough bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, L2capError> {
        Ok(Self {
            psm: le16(bytes, 0)?,
            source_cid: le16(bytes, 2)?,
        })
    }

    /// Convert to bytes
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes[0..2].copy_from_slice(&self.psm.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.source_cid.to_le_bytes());
        bytes
    }
}

/// L2CAP Connection Response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionResponse {
    /// Destination Channel Identifier (the responder's channel)
    pub destination_cid: ChannelId,
    /// Source Channel Identifier (the requester's channel)
    pub source_cid: ChannelId,
    /// One of [`conn_result`]
    pub result: u16,
    /// One of [`conn_status`]
    pub status: u16,
}

impl ConnectionResponse {
    /// Parse from bytes
    ///
    /// # Errors
    /// Returns `L2capError::InsufficientData` if not enough bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, L2capError> {
        Ok(Self {
            destination_cid: le16(bytes, 0)?,
            source_cid: le16(bytes, 2)?,
            result: le16(bytes, 4)?,
            status: le16(bytes, 6)?,
        })
    }
}

/// L2CAP Disconnection Request and Response share one layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Disconnection {
    /// Destination Channel Identifier
    pub destination_cid: ChannelId,
    /// Source Channel Identifier
    pub source_cid: ChannelId,
}

impl Disconnection {
    /// Parse from bytes
    ///
    /// # Errors
    /// Returns `L2capError::InsufficientData` if not enough bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, L2capError> {
        Ok(Self {
            destination_cid: le16(bytes, 0)?,
            source_cid: le16(bytes, 2)?,
        })
    }
}

/// One decoded signaling command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal<'a> {
    /// Command Reject
    CommandReject {
        /// One of [`reject_reason`]
        reason: u16,
    },
    /// Connection Request
    ConnectionRequest(ConnectionRequest),
    /// Connection Response
    ConnectionResponse(ConnectionResponse),
    /// Configuration Request
    ConfigurationRequest {
        /// Channel being configured, on the receiver's side
        destination_cid: ChannelId,
        /// Continuation flag
        flags: u16,
        /// Raw option records
        options: &'a [u8],
    },
    /// Configuration Response
    ConfigurationResponse {
        /// Channel being configured, on the receiver's side
        source_cid: ChannelId,
        /// Continuation flag
        flags: u16,
        /// One of [`cfg_result`]
        result: u16,
        /// Raw option records
        options: &'a [u8],
    },
    /// Disconnection Request
    DisconnectionRequest(Disconnection),
    /// Disconnection Response
    DisconnectionResponse(Disconnection),
    /// Echo Request
    EchoRequest(&'a [u8]),
    /// Echo Response
    EchoResponse(&'a [u8]),
    /// Any other code
    Unknown {
        /// The raw code
        code: u8,
    },
}

impl<'a> Signal<'a> {
    /// Decode the data of a command with the given code
    ///
    /// # Errors
    /// Returns `L2capError::InsufficientData` if `data` is shorter than the command needs
    pub fn parse(code: u8, data: &'a [u8]) -> Result<Self, L2capError> {
        let Some(known) = SignalingCode::from_u8(code) else {
            return Ok(Self::Unknown { code });
        };
        Ok(match known {
            SignalingCode::CommandReject => Self::CommandReject {
                reason: le16(data, 0)?,
            },
            SignalingCode::ConnectionRequest => {
                Self::ConnectionRequest(ConnectionRequest::from_bytes(data)?)
            }
            SignalingCode::ConnectionResponse => {
                Self::ConnectionResponse(ConnectionResponse::from_bytes(data)?)
            }
            SignalingCode::ConfigurationRequest => Self::ConfigurationRequest {
                destination_cid: le16(data, 0)?,
                flags: le16(data, 2)?,
                options: &data[4..],
            },
            SignalingCode::ConfigurationResponse => Self::ConfigurationResponse {
                source_cid: le16(data, 0)?,
                flags: le16(data, 2)?,
                result: le16(data, 4)?,
                options: &data[6..],
            },
            SignalingCode::DisconnectionRequest => {
                Self::DisconnectionRequest(Disconnection::from_bytes(data)?)
            }
            SignalingCode::DisconnectionResponse => {
                Self::DisconnectionResponse(Disconnection::from_bytes(data)?)
            }
            SignalingCode::EchoRequest => Self::EchoRequest(data),
            SignalingCode::EchoResponse => Self::EchoResponse(data),
            SignalingCode::InformationRequest | SignalingCode::InformationResponse => {
                Self::Unknown { code }
            }
        })
    }
}

/// One configuration option record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigOption<'a> {
    /// Option type without the hint bit
    pub kind: u8,
    /// Whether the receiver may skip the option
    pub hint: bool,
    /// Option value
    pub value: &'a [u8],
    /// The whole record, header included
    pub raw: &'a [u8],
}

impl ConfigOption<'_> {
    /// Whether the value has the length its type requires; unknown types always pass
    #[must_use]
    pub fn well_formed(&self) -> bool {
        let expected = match self.kind {
            option::MTU => option::MTU_LEN,
            option::FLUSH_TIMEOUT => option::FLUSH_TIMEOUT_LEN,
            option::QOS => option::QOS_LEN,
            _ => return true,
        };
        self.value.len() == usize::from(expected)
    }

    /// The value read as a little-endian 16-bit number
    #[must_use]
    pub fn u16_value(&self) -> Option<u16> {
        if !self.well_formed() {
            return None;
        }
        le16(self.value, 0).ok()
    }

    /// `QoS` service type, the second byte of a `QoS` value
    #[must_use]
    pub fn service_type(&self) -> Option<u8> {
        if !self.well_formed() {
            return None;
        }
        self.value.get(1).copied()
    }
}

/// Iterator over the option records of a configuration command
///
/// A truncated trailing record ends the iteration.
#[derive(Debug, Clone)]
pub struct ConfigOptions<'a> {
    bytes: &'a [u8],
}

impl<'a> ConfigOptions<'a> {
    /// Walk the records in `bytes`
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }
}

impl<'a> Iterator for ConfigOptions<'a> {
    type Item = ConfigOption<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let [ty, len, ..] = *self.bytes else {
            return None;
        };
        let end = L2CAP_CFGOPTHDR_LEN + usize::from(len);
        let Some(raw) = self.bytes.get(..end) else {
            self.bytes = &[];
            return None;
        };
        self.bytes = &self.bytes[end..];
        Some(ConfigOption {
            kind: ty & !option::HINT,
            hint: ty & option::HINT != 0,
            value: &raw[L2CAP_CFGOPTHDR_LEN..],
            raw,
        })
    }
}

/// Data of an outgoing command, built field by field
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalData(Vec<u8, MAX_SIGNAL_DATA>);

impl SignalData {
    /// Empty data
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Data made of little-endian 16-bit fields
    ///
    /// # Errors
    /// Returns `L2capError::PayloadTooLarge` if the fields do not fit
    pub fn words(words: &[u16]) -> Result<Self, L2capError> {
        let mut data = Self::new();
        for word in words {
            data.push_u16(*word)?;
        }
        Ok(data)
    }

    /// Append a little-endian 16-bit field
    ///
    /// # Errors
    /// Returns `L2capError::PayloadTooLarge` if the data is full
    pub fn push_u16(&mut self, value: u16) -> Result<&mut Self, L2capError> {
        self.push_bytes(&value.to_le_bytes())
    }

    /// Append raw bytes
    ///
    /// # Errors
    /// Returns `L2capError::PayloadTooLarge` if the data is full
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self, L2capError> {
        self.0
            .extend_from_slice(bytes)
            .map_err(|()| L2capError::PayloadTooLarge)?;
        Ok(self)
    }

    /// Append one configuration option record
    ///
    /// # Errors
    /// Returns `L2capError::PayloadTooLarge` if the data is full
    pub fn push_option(&mut self, kind: u8, value: &[u8]) -> Result<&mut Self, L2capError> {
        let len = u8::try_from(value.len()).map_err(|_| L2capError::PayloadTooLarge)?;
        if self.0.len() + L2CAP_CFGOPTHDR_LEN + value.len() > MAX_SIGNAL_DATA {
            return Err(L2capError::PayloadTooLarge);
        }
        self.push_bytes(&[kind, len])?.push_bytes(value)
    }

    /// The encoded bytes
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Number of encoded bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing was encoded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.0.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signaling_header() {
        let header = SignalingHeader::new(SignalingCode::ConnectionRequest, 0x42, 4);
        let bytes = header.to_bytes();
        assert_eq!(bytes, [0x02, 0x42, 0x04, 0x00]);

        let parsed = SignalingHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert!(!SignalingCode::is_response(parsed.code));
        assert!(SignalingCode::is_response(SignalingCode::CommandReject as u8));
    }

    #[test]
    fn test_connection_request() {
        let req = ConnectionRequest {
            psm: 0x0011,
            source_cid: 0x0040,
        };
        assert_eq!(req.to_bytes(), [0x11, 0x00, 0x40, 0x00]);
        assert_eq!(
            Signal::parse(0x02, &req.to_bytes()),
            Ok(Signal::ConnectionRequest(req))
        );
        assert_eq!(
            Signal::parse(0x02, &[0x11, 0x00, 0x40]),
            Err(L2capError::InsufficientData)
        );
    }

    #[test]
    fn test_configuration_response_parsing() {
        let bytes = [0x41, 0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x02, 0x30, 0x00];
        match Signal::parse(0x05, &bytes).unwrap() {
            Signal::ConfigurationResponse {
                source_cid,
                flags,
                result,
                options,
            } => {
                assert_eq!(source_cid, 0x0041);
                assert_eq!(flags, CONFIG_CONTINUATION);
                assert_eq!(result, cfg_result::UNACCEPTABLE);
                let mtu = ConfigOptions::new(options).next().unwrap();
                assert_eq!(mtu.kind, option::MTU);
                assert_eq!(mtu.u16_value(), Some(0x0030));
            }
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[test]
    fn test_unknown_codes_are_kept() {
        assert_eq!(Signal::parse(0x0A, &[1, 0]), Ok(Signal::Unknown { code: 0x0A }));
        assert_eq!(Signal::parse(0x42, &[]), Ok(Signal::Unknown { code: 0x42 }));
    }

    #[test]
    fn test_config_options_iteration() {
        let bytes = [
            0x81, 0x02, 0xA0, 0x02, // hinted MTU
            0x02, 0x02, 0x20, 0x00, // flush timeout
            0x07, 0x05, 0x01, // truncated unknown option
        ];
        let options: heapless::Vec<ConfigOption<'_>, 4> = ConfigOptions::new(&bytes).collect();
        assert_eq!(options.len(), 2);
        assert!(options[0].hint);
        assert_eq!(options[0].kind, option::MTU);
        assert_eq!(options[0].u16_value(), Some(0x02A0));
        assert!(!options[1].hint);
        assert_eq!(options[1].raw, &[0x02, 0x02, 0x20, 0x00]);
    }

    #[test]
    fn test_option_lengths_are_checked() {
        let bytes = [
            0x01, 0x03, 0x00, 0x02, 0x00, // MTU one byte too long
            0x02, 0x02, 0x20, 0x00, // flush timeout
            0x03, 0x02, 0x00, 0x01, // short QoS
        ];
        let options: heapless::Vec<ConfigOption<'_>, 4> = ConfigOptions::new(&bytes).collect();
        assert_eq!(options.len(), 3);
        assert!(!options[0].well_formed());
        assert_eq!(options[0].u16_value(), None);
        assert_eq!(options[1].u16_value(), Some(0x0020));
        assert_eq!(options[2].service_type(), None);

        let mut qos = [0u8; 24];
        qos[0] = option::QOS;
        qos[1] = option::QOS_LEN;
        qos[3] = QosServiceType::Guaranteed as u8;
        let parsed = ConfigOptions::new(&qos).next().unwrap();
        assert!(parsed.well_formed());
        assert_eq!(parsed.service_type(), Some(QosServiceType::Guaranteed as u8));
    }

    #[test]
    fn test_signal_data_builder() {
        let mut data = SignalData::words(&[0x0040, 0]).unwrap();
        data.push_option(option::MTU, &0x0300u16.to_le_bytes())
            .unwrap();
        assert_eq!(
            data.as_slice(),
            &[0x40, 0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x03]
        );

        let big = [0u8; MAX_SIGNAL_DATA];
        assert_eq!(
            data.push_option(0x07, &big[..40]),
            Err(L2capError::PayloadTooLarge)
        );
        assert_eq!(data.len(), 8);
    }
}
