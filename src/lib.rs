#![no_std]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

#[macro_use]
mod fmt;

mod address;
pub mod bte;
pub mod constants;
pub mod hci;
pub mod host;
pub mod l2cap;
pub mod memb;
pub mod memr;
pub mod pbuf;
pub mod stack;
pub mod transport;

use crate::constants::{DEFAULT_INQUIRY_DURATION, GIAC, UNLIMITED_RESPONSES};
use crate::hci::event::HciError;
use crate::l2cap::L2capError;

pub use address::BluetoothAddress;
pub use bte::{Bte, BteEvent, BteState, DeviceHandle};
pub use hci::procedure::{BringUpOptions, ProcedureKind, VendorPatch};
pub use host::Host;
pub use l2cap::{ChannelHandle, ChannelState, ListenerHandle};
pub use pbuf::{PbufId, PbufKind, PbufLayer, PbufPool};
pub use stack::{Stack, StackEvent};
pub use transport::{Frame, PhysBus};

/// What the controller reported about itself during bring-up
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LocalDeviceInfo {
    /// Local `BD_ADDR`
    pub bd_addr: Option<BluetoothAddress>,
    /// HCI version
    pub hci_version: Option<u8>,
    /// HCI revision
    pub hci_revision: Option<u16>,
    /// LMP version
    pub lmp_version: Option<u8>,
    /// Manufacturer name
    pub manufacturer_name: Option<u16>,
    /// LMP subversion
    pub lmp_subversion: Option<u16>,
    /// LMP feature mask
    pub local_features: Option<[u8; 8]>,
    /// ACL payload bytes per packet
    pub acl_data_packet_length: Option<u16>,
    /// SCO payload bytes per packet
    pub sco_data_packet_length: Option<u8>,
    /// ACL packets the controller can buffer
    pub total_num_acl_data_packets: Option<u16>,
    /// SCO packets the controller can buffer
    pub total_num_sco_data_packets: Option<u16>,
}

/// Errors reported by the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BluetoothError {
    /// A pool or the heap is exhausted
    OutOfMemory,
    /// Data was longer than the peer accepts and was cut
    MtuExceeded,
    /// No link or channel in a state that allows the operation
    Connection,
    /// Bad argument, stale handle or malformed packet
    InvalidParameter,
    /// The device or channel is closing
    Closed,
    /// The controller answered with a non-zero status
    HciCommandFailed(u8),
    /// The bus refused the frame
    Transport,
    /// The peer never answered
    Timeout,
    /// Another procedure or inquiry is running
    Busy,
}

impl core::fmt::Display for BluetoothError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "Out of memory"),
            Self::MtuExceeded => write!(f, "Data exceeds the peer's MTU"),
            Self::Connection => write!(f, "Not connected"),
            Self::InvalidParameter => write!(f, "Invalid parameter"),
            Self::Closed => write!(f, "Closed"),
            Self::HciCommandFailed(status) => write!(f, "HCI command failed with status {status:#04x}"),
            Self::Transport => write!(f, "Transport error"),
            Self::Timeout => write!(f, "Timed out"),
            Self::Busy => write!(f, "Busy"),
        }
    }
}

impl From<HciError> for BluetoothError {
    fn from(error: HciError) -> Self {
        match error {
            HciError::InsufficientData => Self::InvalidParameter,
        }
    }
}

impl From<L2capError> for BluetoothError {
    fn from(error: L2capError) -> Self {
        match error {
            L2capError::InsufficientData => Self::InvalidParameter,
            L2capError::PayloadTooLarge => Self::MtuExceeded,
        }
    }
}

/// Run-time options of a [`Stack`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOptions {
    /// Inquiry access code
    pub lap: [u8; 3],
    /// Inquiry duration in 1.28 s units
    pub inquiry_length: u8,
    /// Responses before an inquiry stops, 0 for unlimited
    pub num_responses: u8,
    /// Start the inquiry again when it found nothing
    pub restart_empty_inquiry: bool,
    /// Accept incoming baseband connections
    pub accept_connections: bool,
    /// Run the host buffer and flow control steps during [`ProcedureKind::InitCore`]
    pub extended_bring_up: bool,
    /// Values written during bring-up
    pub bring_up: BringUpOptions,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            lap: GIAC,
            inquiry_length: DEFAULT_INQUIRY_DURATION,
            num_responses: UNLIMITED_RESPONSES,
            restart_empty_inquiry: false,
            accept_connections: true,
            extended_bring_up: false,
            bring_up: BringUpOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::string::ToString;

    #[test]
    fn test_error_conversions() {
        assert_eq!(
            BluetoothError::from(HciError::InsufficientData),
            BluetoothError::InvalidParameter
        );
        assert_eq!(
            BluetoothError::from(L2capError::PayloadTooLarge),
            BluetoothError::MtuExceeded
        );
        assert_eq!(
            BluetoothError::HciCommandFailed(0x0C).to_string(),
            "HCI command failed with status 0x0c"
        );
    }

    #[test]
    fn test_default_options() {
        let options = HostOptions::default();
        assert_eq!(options.lap, [0x33, 0x8B, 0x9E]);
        assert_eq!(options.inquiry_length, 3);
        assert_eq!(options.num_responses, 0);
        assert!(options.accept_connections);
        assert!(!options.restart_empty_inquiry);
        assert!(!options.extended_bring_up);
        assert_eq!(options.bring_up.page_timeout, 0x2000);
    }
}
