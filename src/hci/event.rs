//! HCI event decoding
//!
//! Events arrive as `[code][parameter length][parameters]`. Each variant of
//! [`HciEvent`] borrows the parameter bytes it needs; record lists (inquiry
//! results, returned link keys, completed packets) are exposed as iterators
//! over fixed-size records.

use super::opcode::Opcode;
use crate::BluetoothAddress;
use crate::constants::{CLASS_OF_DEVICE_LENGTH, HCI_EVENT_HDR_LEN, LINK_KEY_LENGTH};

/// HCI event decoding errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HciError {
    /// Packet shorter than its header or declared parameter length
    InsufficientData,
}

impl core::fmt::Display for HciError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "Insufficient data for HCI event"),
        }
    }
}

/// HCI event codes
pub mod code {
    /// Inquiry Complete
    pub const INQUIRY_COMPLETE: u8 = 0x01;
    /// Inquiry Result
    pub const INQUIRY_RESULT: u8 = 0x02;
    /// Connection Complete
    pub const CONNECTION_COMPLETE: u8 = 0x03;
    /// Connection Request
    pub const CONNECTION_REQUEST: u8 = 0x04;
    /// Disconnection Complete
    pub const DISCONNECTION_COMPLETE: u8 = 0x05;
    /// Encryption Change
    pub const ENCRYPTION_CHANGE: u8 = 0x08;
    /// `QoS` Setup Complete
    pub const QOS_SETUP_COMPLETE: u8 = 0x0D;
    /// Command Complete
    pub const COMMAND_COMPLETE: u8 = 0x0E;
    /// Command Status
    pub const COMMAND_STATUS: u8 = 0x0F;
    /// Hardware Error
    pub const HARDWARE_ERROR: u8 = 0x10;
    /// Role Change
    pub const ROLE_CHANGE: u8 = 0x12;
    /// Number Of Completed Packets
    pub const NUMBER_OF_COMPLETED_PACKETS: u8 = 0x13;
    /// Mode Change
    pub const MODE_CHANGE: u8 = 0x14;
    /// Return Link Keys
    pub const RETURN_LINK_KEYS: u8 = 0x15;
    /// PIN Code Request
    pub const PIN_CODE_REQUEST: u8 = 0x16;
    /// Link Key Request
    pub const LINK_KEY_REQUEST: u8 = 0x17;
    /// Link Key Notification
    pub const LINK_KEY_NOTIFICATION: u8 = 0x18;
    /// Data Buffer Overflow
    pub const DATA_BUFFER_OVERFLOW: u8 = 0x1A;
    /// Max Slots Change
    pub const MAX_SLOTS_CHANGE: u8 = 0x1B;
}

/// One record of an Inquiry Result event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InquiryRecord {
    /// Address of the responding device
    pub addr: BluetoothAddress,
    /// Page scan repetition mode
    pub psrm: u8,
    /// Page scan mode (reserved in later core versions)
    pub psm: u8,
    /// Class of device, wire order
    pub class_of_device: [u8; CLASS_OF_DEVICE_LENGTH],
    /// Clock offset
    pub clock_offset: u16,
}

impl InquiryRecord {
    /// Size of one record on the wire
    pub const SIZE: usize = 14;

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            addr: BluetoothAddress::read_from(bytes, 0).ok()?,
            psrm: bytes[6],
            psm: bytes[7],
            class_of_device: [bytes[9], bytes[10], bytes[11]],
            clock_offset: u16::from_le_bytes([bytes[12], bytes[13]]),
        })
    }
}

/// One record of a Return Link Keys event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkKeyRecord {
    /// Device the key belongs to
    pub addr: BluetoothAddress,
    /// The link key
    pub key: [u8; LINK_KEY_LENGTH],
}

impl LinkKeyRecord {
    /// Size of one record on the wire
    pub const SIZE: usize = 22;

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut key = [0u8; LINK_KEY_LENGTH];
        key.copy_from_slice(&bytes[6..22]);
        Some(Self {
            addr: BluetoothAddress::read_from(bytes, 0).ok()?,
            key,
        })
    }
}

/// One entry of a Number Of Completed Packets event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CompletedPackets {
    /// Connection handle
    pub handle: u16,
    /// Packets completed since the last event
    pub count: u16,
}

impl CompletedPackets {
    /// Size of one entry on the wire
    pub const SIZE: usize = 4;

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            handle: u16::from_le_bytes([bytes[0], bytes[1]]),
            count: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }
}

/// Iterator over the fixed-size records following a count byte
#[derive(Debug, Clone)]
pub struct Records<'a, T> {
    data: &'a [u8],
    remaining: usize,
    size: usize,
    parse: fn(&[u8]) -> Option<T>,
}

impl<'a, T> Records<'a, T> {
    fn new(params: &'a [u8], size: usize, parse: fn(&[u8]) -> Option<T>) -> Self {
        let (count, data) = params.split_first().map_or((0, &[][..]), |(c, d)| (*c, d));
        Self {
            data,
            remaining: usize::from(count),
            size,
            parse,
        }
    }
}

impl<T> Iterator for Records<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.remaining == 0 || self.data.len() < self.size {
            return None;
        }
        let (record, rest) = self.data.split_at(self.size);
        self.data = rest;
        self.remaining -= 1;
        (self.parse)(record)
    }
}

/// A decoded HCI event
#[derive(Debug, Clone)]
pub enum HciEvent<'a> {
    /// Inquiry finished
    InquiryComplete {
        /// Controller status
        status: u8,
    },
    /// Devices answered an inquiry
    InquiryResult(Records<'a, InquiryRecord>),
    /// An ACL connection attempt finished
    ConnectionComplete {
        /// Controller status
        status: u8,
        /// Assigned connection handle
        handle: u16,
        /// Peer address
        addr: BluetoothAddress,
        /// Link type
        link_type: u8,
        /// Encryption mode
        encryption_mode: u8,
    },
    /// A peer wants to connect
    ConnectionRequest {
        /// Peer address
        addr: BluetoothAddress,
        /// Peer class of device
        class_of_device: [u8; CLASS_OF_DEVICE_LENGTH],
        /// Requested link type
        link_type: u8,
    },
    /// An ACL connection went down
    DisconnectionComplete {
        /// Controller status
        status: u8,
        /// Connection handle
        handle: u16,
        /// Disconnect reason
        reason: u8,
    },
    /// A command finished
    CommandComplete {
        /// Commands the controller now accepts
        num_cmd: u8,
        /// Opcode of the completed command
        opcode: Opcode,
        /// Return parameters, starting with the status byte
        params: &'a [u8],
    },
    /// A command was accepted or refused
    CommandStatus {
        /// Controller status
        status: u8,
        /// Commands the controller now accepts
        num_cmd: u8,
        /// Opcode of the command
        opcode: Opcode,
    },
    /// Controller hardware failure
    HardwareError {
        /// Vendor hardware code
        code: u8,
    },
    /// Controller finished sending packets
    NumberOfCompletedPackets(Records<'a, CompletedPackets>),
    /// A connection changed between active, hold, sniff and park
    ModeChange {
        /// Controller status
        status: u8,
        /// Connection handle
        handle: u16,
        /// New mode
        mode: u8,
        /// Mode interval
        interval: u16,
    },
    /// Stored link keys read from the controller
    ReturnLinkKeys(Records<'a, LinkKeyRecord>),
    /// Controller needs a PIN
    PinCodeRequest {
        /// Peer address
        addr: BluetoothAddress,
    },
    /// Controller needs a link key
    LinkKeyRequest {
        /// Peer address
        addr: BluetoothAddress,
    },
    /// A new link key was created
    LinkKeyNotification {
        /// Peer address
        addr: BluetoothAddress,
        /// The new key
        key: [u8; LINK_KEY_LENGTH],
        /// Key type
        key_type: u8,
    },
    /// Events the host notes without acting on them
    Ignored {
        /// Event code
        code: u8,
    },
}

fn u16_at(params: &[u8], offset: usize) -> Result<u16, HciError> {
    params
        .get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(HciError::InsufficientData)
}

fn u8_at(params: &[u8], offset: usize) -> Result<u8, HciError> {
    params.get(offset).copied().ok_or(HciError::InsufficientData)
}

fn addr_at(params: &[u8], offset: usize) -> Result<BluetoothAddress, HciError> {
    BluetoothAddress::read_from(params, offset).map_err(|_| HciError::InsufficientData)
}

impl<'a> HciEvent<'a> {
    /// Decode an event packet (without the packet indicator byte)
    ///
    /// # Errors
    /// Returns `HciError::InsufficientData` if the packet is shorter than its
    /// header claims or than the event's fixed parameters
    pub fn from_bytes(packet: &'a [u8]) -> Result<Self, HciError> {
        if packet.len() < HCI_EVENT_HDR_LEN {
            return Err(HciError::InsufficientData);
        }
        let event_code = packet[0];
        let plen = usize::from(packet[1]);
        let p = packet
            .get(HCI_EVENT_HDR_LEN..HCI_EVENT_HDR_LEN + plen)
            .ok_or(HciError::InsufficientData)?;

        let event = match event_code {
            code::INQUIRY_COMPLETE => Self::InquiryComplete { status: u8_at(p, 0)? },
            code::INQUIRY_RESULT => Self::InquiryResult(Records::new(
                p,
                InquiryRecord::SIZE,
                InquiryRecord::from_bytes,
            )),
            code::CONNECTION_COMPLETE => Self::ConnectionComplete {
                status: u8_at(p, 0)?,
                handle: u16_at(p, 1)? & 0x0FFF,
                addr: addr_at(p, 3)?,
                link_type: u8_at(p, 9)?,
                encryption_mode: u8_at(p, 10)?,
            },
            code::CONNECTION_REQUEST => {
                let cod = p.get(6..9).ok_or(HciError::InsufficientData)?;
                Self::ConnectionRequest {
                    addr: addr_at(p, 0)?,
                    class_of_device: [cod[0], cod[1], cod[2]],
                    link_type: u8_at(p, 9)?,
                }
            }
            code::DISCONNECTION_COMPLETE => Self::DisconnectionComplete {
                status: u8_at(p, 0)?,
                handle: u16_at(p, 1)? & 0x0FFF,
                reason: u8_at(p, 3)?,
            },
            code::COMMAND_COMPLETE => Self::CommandComplete {
                num_cmd: u8_at(p, 0)?,
                opcode: Opcode::from_raw(u16_at(p, 1)?),
                params: p.get(3..).unwrap_or(&[]),
            },
            code::COMMAND_STATUS => Self::CommandStatus {
                status: u8_at(p, 0)?,
                num_cmd: u8_at(p, 1)?,
                opcode: Opcode::from_raw(u16_at(p, 2)?),
            },
            code::HARDWARE_ERROR => Self::HardwareError { code: u8_at(p, 0)? },
            code::NUMBER_OF_COMPLETED_PACKETS => Self::NumberOfCompletedPackets(Records::new(
                p,
                CompletedPackets::SIZE,
                CompletedPackets::from_bytes,
            )),
            code::MODE_CHANGE => Self::ModeChange {
                status: u8_at(p, 0)?,
                handle: u16_at(p, 1)? & 0x0FFF,
                mode: u8_at(p, 3)?,
                interval: u16_at(p, 4)?,
            },
            code::RETURN_LINK_KEYS => Self::ReturnLinkKeys(Records::new(
                p,
                LinkKeyRecord::SIZE,
                LinkKeyRecord::from_bytes,
            )),
            code::PIN_CODE_REQUEST => Self::PinCodeRequest { addr: addr_at(p, 0)? },
            code::LINK_KEY_REQUEST => Self::LinkKeyRequest { addr: addr_at(p, 0)? },
            code::LINK_KEY_NOTIFICATION => {
                let raw = p.get(6..22).ok_or(HciError::InsufficientData)?;
                let mut key = [0u8; LINK_KEY_LENGTH];
                key.copy_from_slice(raw);
                Self::LinkKeyNotification {
                    addr: addr_at(p, 0)?,
                    key,
                    key_type: p.get(22).copied().unwrap_or(0),
                }
            }
            other => Self::Ignored { code: other },
        };
        Ok(event)
    }
}
