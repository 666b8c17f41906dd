//! L2CAP channel control blocks
//!
//! A channel is created `Closed` and unregistered. It joins the active list
//! when a connection is requested, when an echo is sent, or when a peer's
//! connection request is accepted from a [`L2capListener`]. The stack frees
//! it right after delivering its terminal disconnect event.

use super::packet::{ChannelId, ProtocolServiceMultiplexer};
use super::signaling::SignalData;
use crate::BluetoothAddress;
use crate::constants::{
    L2CAP_CFG_DEFAULT_INMTU, L2CAP_CFG_DEFAULT_OUTFLUSHTO, L2CAP_CFG_TO, L2CAP_MTU,
};
use crate::memb::BlockId;
use crate::pbuf::PbufId;

/// L2CAP Channel States
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelState {
    /// Channel is closed
    Closed,
    /// Waiting for incoming connections
    Listen,
    /// Connection request sent, waiting for the response
    W4ConnectRsp,
    /// Both sides are negotiating parameters
    Config,
    /// Channel is open for data transfer
    Open,
    /// Disconnection request sent, waiting for the response
    W4DisconnectRsp,
}

/// Progress of the two configuration directions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigFlags {
    /// This side initiated the connection
    pub initiator: bool,
    /// A configuration request was sent to the peer
    pub out_requested: bool,
    /// The peer accepted our configuration
    pub in_success: bool,
    /// We accepted the peer's configuration
    pub out_success: bool,
}

impl ConfigFlags {
    /// Both directions are configured
    #[must_use]
    pub fn done(self) -> bool {
        self.in_success && self.out_success
    }
}

/// Negotiated channel parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Largest SDU we accept
    pub inmtu: u16,
    /// Largest SDU the peer accepts
    pub outmtu: u16,
    /// Flush timeout the peer asked for
    pub influshto: u16,
    /// Flush timeout we ask the peer for; `0xFFFF` leaves signals unsupervised
    pub outflushto: u16,
    pub(crate) cfgto: u16,
    pub(crate) flags: ConfigFlags,
    /// Options echoed in the next configuration response
    pub(crate) opt: SignalData,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            inmtu: L2CAP_MTU,
            outmtu: L2CAP_CFG_DEFAULT_INMTU,
            influshto: L2CAP_CFG_DEFAULT_OUTFLUSHTO,
            outflushto: L2CAP_CFG_DEFAULT_OUTFLUSHTO,
            cfgto: L2CAP_CFG_TO,
            flags: ConfigFlags::default(),
            opt: SignalData::new(),
        }
    }
}

/// Handle of a channel, invalid once the channel is freed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelHandle {
    pub(crate) slot: BlockId,
    pub(crate) serial: u16,
}

/// Handle of a listening registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ListenerHandle {
    pub(crate) slot: BlockId,
    pub(crate) serial: u16,
}

/// One L2CAP channel control block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2capChannel {
    pub(crate) serial: u16,
    /// Current state
    pub state: ChannelState,
    /// Peer device
    pub remote: BluetoothAddress,
    /// Protocol/Service Multiplexer
    pub psm: ProtocolServiceMultiplexer,
    /// Local channel identifier
    pub scid: ChannelId,
    /// Remote channel identifier
    pub dcid: ChannelId,
    /// Negotiated parameters
    pub cfg: ChannelConfig,
    /// Encryption mode reported when the link came up
    pub encrypt: u8,
    /// Tag handed back in every event for this channel
    pub arg: usize,
    pub(crate) registered: bool,
    /// Identifier of a peer request we still have to answer
    pub(crate) ursp_id: u8,
}

impl L2capChannel {
    pub(crate) fn new(serial: u16) -> Self {
        Self {
            serial,
            state: ChannelState::Closed,
            remote: BluetoothAddress::ANY,
            psm: 0,
            scid: 0,
            dcid: 0,
            cfg: ChannelConfig::default(),
            encrypt: 0,
            arg: 0,
            registered: false,
            ursp_id: 0,
        }
    }

    /// Whether data can flow
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }
}

/// A listening registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capListener {
    pub(crate) serial: u16,
    /// Remote device to accept from; `ANY` matches every device
    pub addr: BluetoothAddress,
    /// PSM to accept
    pub psm: ProtocolServiceMultiplexer,
    /// Tag given to channels accepted here
    pub arg: usize,
}

impl L2capListener {
    pub(crate) fn accepts(&self, addr: &BluetoothAddress, psm: ProtocolServiceMultiplexer) -> bool {
        self.psm == psm && (self.addr.is_any() || self.addr == *addr)
    }
}

/// An outstanding request awaiting its response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct L2capSig {
    pub channel: BlockId,
    pub id: u8,
    pub code: u8,
    /// The whole PDU, kept for retransmission
    pub p: PbufId,
    pub len: u16,
    pub rtx: u16,
    pub ertx: u16,
    pub nrtx: u8,
    /// Period of the running rtx timer, doubled on every retransmission
    pub rtx_period: u16,
}

/// An inbound PDU being reassembled from ACL fragments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct L2capSeg {
    pub addr: BluetoothAddress,
    pub p: PbufId,
    /// Expected length, header included
    pub len: usize,
    pub cid: ChannelId,
}
