//! L2CAP (Logical Link Control and Adaptation Protocol) Implementation
//!
//! Connection-oriented channels multiplexed over the ACL links of [`crate::hci`]:
//! channel identifier allocation, the signaling state machine with
//! configuration negotiation, retransmission and configuration timers, and
//! reassembly of inbound PDUs from ACL fragments.
//!
//! Channels are addressed by [`ChannelHandle`]. Outcomes reach the embedder as
//! [`StackEvent`]s; a channel is freed right after its `DisconnectIndication`
//! or `DisconnectConfirm`, and its handle goes stale.

pub mod channel;
pub mod packet;
pub mod signaling;

pub use channel::{
    ChannelConfig, ChannelHandle, ChannelState, ConfigFlags, L2capChannel, L2capListener,
    ListenerHandle,
};
pub use packet::{ChannelId, L2capError, L2capHeader, ProtocolServiceMultiplexer, cid, psm};
pub use signaling::{SignalingCode, SignalingHeader};

use crate::constants::{
    L2CAP_CFG_DEFAULT_INMTU, L2CAP_CFG_DEFAULT_OUTFLUSHTO, L2CAP_CFG_TO, L2CAP_ERTX,
    L2CAP_HDR_LEN, L2CAP_MAXRTX, L2CAP_MIN_CID, L2CAP_MTU, L2CAP_RTX, L2CAP_SIGHDR_LEN,
    MEMB_NUM_L2CAP_PCB, MEMB_NUM_L2CAP_PCB_LISTEN, MEMB_NUM_L2CAP_SEG, MEMB_NUM_L2CAP_SIG,
};
use crate::hci::boundary;
use crate::memb::{BlockId, Memb};
use crate::pbuf::{PbufId, PbufKind, PbufLayer};
use crate::stack::{Stack, StackEvent};
use crate::transport::PhysBus;
use crate::{BluetoothAddress, BluetoothError};
use channel::{L2capSeg, L2capSig};
use signaling::{
    CONFIG_CONTINUATION, ConfigOptions, ConnectionRequest, ConnectionResponse, Disconnection,
    QosServiceType, Signal, SignalData, cfg_result, conn_result, conn_status, option, reject_reason,
};

/// Largest command data accepted from a peer
const SIGNAL_RX_LEN: usize = 256;

/// Channel, listener, signal and reassembly tables
#[derive(Debug)]
pub struct L2cap {
    pub(crate) channels: Memb<L2capChannel, MEMB_NUM_L2CAP_PCB>,
    pub(crate) listeners: Memb<L2capListener, MEMB_NUM_L2CAP_PCB_LISTEN>,
    pub(crate) sigs: Memb<L2capSig, MEMB_NUM_L2CAP_SIG>,
    pub(crate) segs: Memb<L2capSeg, MEMB_NUM_L2CAP_SEG>,
    next_sigid: u8,
    serial: u16,
}

impl L2cap {
    /// Empty tables
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Memb::new(),
            listeners: Memb::new(),
            sigs: Memb::new(),
            segs: Memb::new(),
            next_sigid: 0,
            serial: 0,
        }
    }

    fn next_serial(&mut self) -> u16 {
        self.serial = self.serial.wrapping_add(1);
        self.serial
    }

    fn next_sigid(&mut self) -> u8 {
        self.next_sigid = self.next_sigid.wrapping_add(1);
        if self.next_sigid == 0 {
            self.next_sigid = 1;
        }
        self.next_sigid
    }

    /// First dynamic CID not used by a registered channel, 0 when none is left
    #[must_use]
    pub fn cid_alloc(&self) -> ChannelId {
        (L2CAP_MIN_CID..cid::DYNAMIC_END)
            .find(|candidate| {
                !self
                    .channels
                    .iter()
                    .any(|(_, ch)| ch.registered && ch.scid == *candidate)
            })
            .unwrap_or(cid::NULL)
    }

    fn resolve(&self, handle: ChannelHandle) -> Result<BlockId, BluetoothError> {
        match self.channels.get(handle.slot) {
            Some(ch) if ch.serial == handle.serial => Ok(handle.slot),
            _ => Err(BluetoothError::InvalidParameter),
        }
    }

    fn handle(&self, slot: BlockId) -> Option<ChannelHandle> {
        self.channels.get(slot).map(|ch| ChannelHandle {
            slot,
            serial: ch.serial,
        })
    }

    fn registered(&self, mut pred: impl FnMut(&L2capChannel) -> bool) -> Option<BlockId> {
        self.channels.find(|ch| ch.registered && pred(ch))
    }

    /// Outstanding request with identifier `id`, as `(signal, channel)`
    fn sig_lookup(&self, id: u8) -> Option<(BlockId, BlockId)> {
        self.sigs
            .iter()
            .find(|(_, sig)| sig.id == id)
            .map(|(sid, sig)| (sid, sig.channel))
    }

    /// The channel behind `handle`
    #[must_use]
    pub fn channel(&self, handle: ChannelHandle) -> Option<&L2capChannel> {
        self.resolve(handle).ok().and_then(|slot| self.channels.get(slot))
    }

    /// Every channel on the active list
    pub fn channels(&self) -> impl Iterator<Item = (ChannelHandle, &L2capChannel)> {
        self.channels
            .iter()
            .filter(|(_, ch)| ch.registered)
            .map(|(slot, ch)| {
                (
                    ChannelHandle {
                        slot,
                        serial: ch.serial,
                    },
                    ch,
                )
            })
    }

    /// Every listening registration
    pub fn listeners(&self) -> impl Iterator<Item = (ListenerHandle, &L2capListener)> {
        self.listeners.iter().map(|(slot, l)| {
            (
                ListenerHandle {
                    slot,
                    serial: l.serial,
                },
                l,
            )
        })
    }

    /// Number of requests still waiting for a response
    #[must_use]
    pub fn pending_signals(&self) -> usize {
        self.sigs.used()
    }
}

impl Default for L2cap {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Indication,
    Confirm,
}

impl<B: PhysBus> Stack<B> {
    /// Allocate a closed channel that is not on the active list yet
    ///
    /// # Errors
    /// Returns `OutOfMemory` when every channel block is in use
    pub fn l2cap_new(&mut self) -> Result<ChannelHandle, BluetoothError> {
        let serial = self.l2cap.next_serial();
        let slot = self
            .l2cap
            .channels
            .alloc(L2capChannel::new(serial))
            .ok_or_else(|| {
                error!("l2cap_new: could not allocate channel");
                BluetoothError::OutOfMemory
            })?;
        Ok(ChannelHandle { slot, serial })
    }

    /// Free a channel and every request it has outstanding, without signaling
    ///
    /// # Errors
    /// Returns `InvalidParameter` for a stale handle
    pub fn l2cap_close(&mut self, handle: ChannelHandle) -> Result<(), BluetoothError> {
        let slot = self.l2cap.resolve(handle)?;
        self.l2cap_free(slot);
        Ok(())
    }

    /// Set the tag reported with every event of this channel
    ///
    /// # Errors
    /// Returns `InvalidParameter` for a stale handle
    pub fn l2cap_set_arg(&mut self, handle: ChannelHandle, arg: usize) -> Result<(), BluetoothError> {
        self.l2cap_channel_mut(handle)?.arg = arg;
        Ok(())
    }

    /// Flush timeout to request from the peer; any value below `0xFFFF` also
    /// turns on retransmission of unanswered requests
    ///
    /// # Errors
    /// Returns `InvalidParameter` for a stale handle
    pub fn l2cap_set_outflushto(
        &mut self,
        handle: ChannelHandle,
        flush_timeout: u16,
    ) -> Result<(), BluetoothError> {
        self.l2cap_channel_mut(handle)?.cfg.outflushto = flush_timeout;
        Ok(())
    }

    /// Turn `handle` into a listening registration for `psm` from `addr`
    ///
    /// The channel is consumed; accepted channels inherit its tag. `ANY`
    /// accepts from every device.
    ///
    /// # Errors
    /// Returns `InvalidParameter` for a stale handle, `OutOfMemory` when no
    /// listener block is free (the channel is kept then)
    pub fn l2cap_listen(
        &mut self,
        handle: ChannelHandle,
        addr: BluetoothAddress,
        psm: ProtocolServiceMultiplexer,
    ) -> Result<ListenerHandle, BluetoothError> {
        let slot = self.l2cap.resolve(handle)?;
        let arg = self.l2cap.channels.get(slot).map_or(0, |ch| ch.arg);
        let serial = self.l2cap.next_serial();
        let listener = self
            .l2cap
            .listeners
            .alloc(L2capListener {
                serial,
                addr,
                psm,
                arg,
            })
            .ok_or_else(|| {
                error!("l2cap_listen: could not allocate listener");
                BluetoothError::OutOfMemory
            })?;
        self.l2cap_free(slot);
        debug!("l2cap: listening on psm {} for {}", psm, addr);
        Ok(ListenerHandle {
            slot: listener,
            serial,
        })
    }

    /// Remove a listening registration
    ///
    /// # Errors
    /// Returns `InvalidParameter` for a stale handle
    pub fn l2cap_listen_close(&mut self, handle: ListenerHandle) -> Result<(), BluetoothError> {
        match self.l2cap.listeners.get(handle.slot) {
            Some(l) if l.serial == handle.serial => {
                self.l2cap.listeners.release(handle.slot);
                Ok(())
            }
            _ => Err(BluetoothError::InvalidParameter),
        }
    }

    /// State of a channel
    ///
    /// # Errors
    /// Returns `InvalidParameter` for a stale handle
    pub fn l2cap_state(&self, handle: ChannelHandle) -> Result<ChannelState, BluetoothError> {
        self.l2cap_channel(handle).map(|ch| ch.state)
    }

    /// Control block of a channel: CIDs, MTUs, remote address and PSM
    ///
    /// # Errors
    /// Returns `InvalidParameter` for a stale handle
    pub fn l2cap_channel(&self, handle: ChannelHandle) -> Result<&L2capChannel, BluetoothError> {
        self.l2cap
            .channel(handle)
            .ok_or(BluetoothError::InvalidParameter)
    }

    fn l2cap_channel_mut(
        &mut self,
        handle: ChannelHandle,
    ) -> Result<&mut L2capChannel, BluetoothError> {
        let slot = self.l2cap.resolve(handle)?;
        self.l2cap
            .channels
            .get_mut(slot)
            .ok_or(BluetoothError::InvalidParameter)
    }

    /// Open a channel to `psm` on `addr`
    ///
    /// Without an ACL link one is created first and the connection request
    /// follows once it is up. The outcome arrives as `ConnectConfirm`.
    ///
    /// # Errors
    /// Returns `InvalidParameter` for a stale handle, `Connection` when the
    /// channel is already connecting or connected, `OutOfMemory` when no CID
    /// is left, or the error of the first transmission
    pub fn l2ca_connect_req(
        &mut self,
        handle: ChannelHandle,
        addr: BluetoothAddress,
        psm: ProtocolServiceMultiplexer,
        role_switch: u8,
    ) -> Result<(), BluetoothError> {
        let slot = self.l2cap.resolve(handle)?;
        if self
            .l2cap
            .channels
            .get(slot)
            .is_some_and(|ch| ch.registered || ch.state != ChannelState::Closed)
        {
            warn!("l2cap_connect_req: channel already in use");
            return Err(BluetoothError::Connection);
        }
        let scid = self.l2cap.cid_alloc();
        if scid == cid::NULL {
            error!("l2cap_connect_req: no free channel identifier");
            return Err(BluetoothError::OutOfMemory);
        }
        if let Some(ch) = self.l2cap.channels.get_mut(slot) {
            ch.remote = addr;
            ch.psm = psm;
            ch.scid = scid;
            ch.cfg.flags.initiator = true;
            ch.registered = true;
        }

        if !self.lp_is_connected(&addr) {
            debug!("l2cap: no link to {}, connecting first", addr);
            return self.lp_connect_req(addr, role_switch);
        }
        let req = ConnectionRequest {
            psm,
            source_cid: scid,
        };
        let result = self.l2cap_signal(
            Some(slot),
            SignalingCode::ConnectionRequest as u8,
            0,
            addr,
            &req.to_bytes(),
        );
        if let Some(ch) = self.l2cap.channels.get_mut(slot) {
            ch.state = ChannelState::W4ConnectRsp;
        }
        result
    }

    /// Request (re)configuration of the incoming direction
    ///
    /// # Errors
    /// Returns `Connection` unless the channel is open or configuring
    pub fn l2ca_config_req(&mut self, handle: ChannelHandle) -> Result<(), BluetoothError> {
        let slot = self.l2cap.resolve(handle)?;
        self.l2cap_config_req(slot)
    }

    fn l2cap_config_req(&mut self, slot: BlockId) -> Result<(), BluetoothError> {
        let ch = self
            .l2cap
            .channels
            .get_mut(slot)
            .ok_or(BluetoothError::InvalidParameter)?;
        match ch.state {
            ChannelState::Open => {
                debug!("l2cap: reconfiguring open channel {}", ch.scid);
                ch.state = ChannelState::Config;
            }
            ChannelState::Config => {}
            _ => {
                error!("l2cap_config_req: channel {} in state {}", ch.scid, ch.state);
                return Err(BluetoothError::Connection);
            }
        }

        let mut data = SignalData::words(&[ch.dcid, 0])?;
        if ch.cfg.inmtu != L2CAP_CFG_DEFAULT_INMTU {
            data.push_option(option::MTU, &ch.cfg.inmtu.to_le_bytes())?;
        }
        if ch.cfg.outflushto != L2CAP_CFG_DEFAULT_OUTFLUSHTO {
            data.push_option(option::FLUSH_TIMEOUT, &ch.cfg.outflushto.to_le_bytes())?;
        }
        let remote = ch.remote;
        self.l2cap_signal(
            Some(slot),
            SignalingCode::ConfigurationRequest as u8,
            0,
            remote,
            data.as_slice(),
        )
    }

    /// Ask the peer to close the channel; `DisconnectConfirm` follows
    ///
    /// # Errors
    /// Returns `Connection` unless the channel is open or configuring
    pub fn l2ca_disconnect_req(&mut self, handle: ChannelHandle) -> Result<(), BluetoothError> {
        let slot = self.l2cap.resolve(handle)?;
        self.l2cap_disconnect_req(slot)
    }

    fn l2cap_disconnect_req(&mut self, slot: BlockId) -> Result<(), BluetoothError> {
        let ch = self
            .l2cap
            .channels
            .get(slot)
            .ok_or(BluetoothError::InvalidParameter)?;
        if !matches!(ch.state, ChannelState::Open | ChannelState::Config) {
            return Err(BluetoothError::Connection);
        }
        let (remote, dcid, scid) = (ch.remote, ch.dcid, ch.scid);
        let data = SignalData::words(&[dcid, scid])?;
        self.l2cap_signal(
            Some(slot),
            SignalingCode::DisconnectionRequest as u8,
            0,
            remote,
            data.as_slice(),
        )?;
        if let Some(ch) = self.l2cap.channels.get_mut(slot) {
            ch.state = ChannelState::W4DisconnectRsp;
        }
        Ok(())
    }

    /// Send the packet `p` on an open channel
    ///
    /// The caller keeps its reference on `p`. Data longer than the peer's MTU
    /// is cut to the MTU, sent, and reported as `MtuExceeded`.
    ///
    /// # Errors
    /// Returns `Connection` unless the channel is open, `OutOfMemory` if the
    /// header cannot be allocated, `MtuExceeded` after a truncated send, or
    /// the transmission error
    pub fn l2ca_datawrite(&mut self, handle: ChannelHandle, p: PbufId) -> Result<(), BluetoothError> {
        let ch = self.l2cap_channel(handle)?;
        if !ch.is_open() {
            error!("l2cap_datawrite: channel {} not open, dropping data", ch.scid);
            return Err(BluetoothError::Connection);
        }
        let (remote, dcid, outmtu) = (ch.remote, ch.dcid, ch.cfg.outmtu);

        #[allow(clippy::cast_possible_truncation)]
        let q = self
            .pbufs
            .alloc(PbufLayer::Raw, L2CAP_HDR_LEN as u16, PbufKind::Ram)
            .ok_or_else(|| {
                error!("l2cap_datawrite: could not allocate header");
                BluetoothError::OutOfMemory
            })?;
        let tot_len = self.pbufs.tot_len(p);
        let truncated = tot_len > outmtu;
        let len = tot_len.min(outmtu);
        if let Err(e) = self
            .pbufs
            .copy_in(q, 0, &L2capHeader::new(len, dcid).to_bytes())
        {
            self.pbufs.free(q);
            return Err(e);
        }
        self.pbufs.chain(q, p);
        let result = self.l2cap_write(remote, q, L2CAP_HDR_LEN + usize::from(len));
        self.pbufs.dechain(q);
        self.pbufs.free(q);

        result?;
        if truncated {
            debug!("l2cap_datawrite: {} bytes cut to outmtu {}", tot_len, outmtu);
            return Err(BluetoothError::MtuExceeded);
        }
        Ok(())
    }

    /// Send an empty echo request to `addr`; the answer arrives as `Pong`
    ///
    /// # Errors
    /// Returns `Connection` without a link to `addr`
    pub fn l2ca_ping(
        &mut self,
        handle: ChannelHandle,
        addr: BluetoothAddress,
    ) -> Result<(), BluetoothError> {
        let slot = self.l2cap.resolve(handle)?;
        if !self.lp_is_connected(&addr) {
            return Err(BluetoothError::Connection);
        }
        if let Some(ch) = self.l2cap.channels.get_mut(slot) {
            ch.remote = addr;
            ch.registered = true;
        }
        self.l2cap_signal(Some(slot), SignalingCode::EchoRequest as u8, 0, addr, &[])
    }

    /// Frame and send one signaling command
    ///
    /// Requests take a fresh identifier and are kept, with their packet, until
    /// answered; responses echo `ursp_id` and are released once sent.
    pub(crate) fn l2cap_signal(
        &mut self,
        channel: Option<BlockId>,
        code: u8,
        ursp_id: u8,
        addr: BluetoothAddress,
        data: &[u8],
    ) -> Result<(), BluetoothError> {
        let request = !SignalingCode::is_response(code);
        if request && self.l2cap.sigs.used() == self.l2cap.sigs.capacity() {
            error!("l2cap_signal: could not allocate signal");
            return Err(BluetoothError::OutOfMemory);
        }
        let data_len = u16::try_from(data.len()).map_err(|_| BluetoothError::InvalidParameter)?;
        let total = L2CAP_HDR_LEN + L2CAP_SIGHDR_LEN + data.len();
        let total_len = u16::try_from(total).map_err(|_| BluetoothError::InvalidParameter)?;
        let p = self
            .pbufs
            .alloc(PbufLayer::Raw, total_len, PbufKind::Ram)
            .ok_or_else(|| {
                error!("l2cap_signal: could not allocate packet");
                BluetoothError::OutOfMemory
            })?;

        let id = if request {
            self.l2cap.next_sigid()
        } else {
            ursp_id
        };
        #[allow(clippy::cast_possible_truncation)]
        let l2cap_hdr = L2capHeader::new(L2CAP_SIGHDR_LEN as u16 + data_len, cid::SIGNALING);
        let sig_hdr = SignalingHeader {
            code,
            identifier: id,
            length: data_len,
        };
        let mut head = [0u8; L2CAP_HDR_LEN + L2CAP_SIGHDR_LEN];
        head[..L2CAP_HDR_LEN].copy_from_slice(&l2cap_hdr.to_bytes());
        head[L2CAP_HDR_LEN..].copy_from_slice(&sig_hdr.to_bytes());
        if let Err(e) = self
            .pbufs
            .copy_in(p, 0, &head)
            .and_then(|()| self.pbufs.copy_in(p, head.len(), data))
        {
            self.pbufs.free(p);
            return Err(e);
        }

        trace!("l2cap: sending signal code {} id {} to {}", code, id, addr);
        let result = self.l2cap_write(addr, p, total);
        match channel {
            Some(channel) if request && result.is_ok() => {
                let sig = L2capSig {
                    channel,
                    id,
                    code,
                    p,
                    len: total_len,
                    rtx: L2CAP_RTX,
                    ertx: 0,
                    nrtx: L2CAP_MAXRTX,
                    rtx_period: L2CAP_RTX,
                };
                if self.l2cap.sigs.alloc(sig).is_none() {
                    self.pbufs.free(p);
                }
            }
            _ => {
                self.pbufs.free(p);
            }
        }
        result
    }

    /// Send `len` bytes of `p` as ACL packets no longer than the controller's MTU
    pub(crate) fn l2cap_write(
        &mut self,
        addr: BluetoothAddress,
        p: PbufId,
        len: usize,
    ) -> Result<(), BluetoothError> {
        let maxsize = match usize::from(self.lp_pdu_maxsize()) {
            0 => len,
            n => n,
        };
        let mut offset = 0;
        let mut pb = boundary::START;
        while offset < len {
            let chunk = (len - offset).min(maxsize);
            self.lp_acl_write(addr, p, offset, chunk, pb)?;
            offset += chunk;
            pb = boundary::CONTINUE;
        }
        Ok(())
    }

    /// Reassemble one ACL fragment from `addr` and dispatch complete PDUs
    ///
    /// Takes over the reference on `p`.
    pub(crate) fn l2cap_input(&mut self, p: PbufId, addr: BluetoothAddress, pb: u8) {
        let existing = self.l2cap.segs.find(|seg| seg.addr == addr);
        let seg_id = match pb {
            boundary::CONTINUE => {
                let Some(seg_id) = existing else {
                    debug!("l2cap_input: continuing fragment without a start, dropping");
                    self.pbufs.free(p);
                    return;
                };
                let Some(seg) = self.l2cap.segs.get(seg_id).copied() else {
                    self.pbufs.free(p);
                    return;
                };
                let have = usize::from(self.pbufs.tot_len(seg.p));
                if have + usize::from(self.pbufs.tot_len(p)) > seg.len {
                    warn!("l2cap_input: fragment overruns the PDU length, dropping");
                    self.l2cap_seg_drop(seg_id);
                    self.pbufs.free(p);
                    return;
                }
                self.pbufs.cat(seg.p, p);
                seg_id
            }
            boundary::START => {
                let Some(hdr) = self.l2cap_read_header(p) else {
                    warn!("l2cap_input: start fragment too short, dropping");
                    self.pbufs.free(p);
                    return;
                };
                let seg = L2capSeg {
                    addr,
                    p,
                    len: hdr.pdu_len(),
                    cid: hdr.channel_id,
                };
                match existing {
                    Some(seg_id) => {
                        debug!("l2cap_input: new start fragment, dropping the previous PDU");
                        if let Some(old) = self.l2cap.segs.get_mut(seg_id) {
                            let stale = old.p;
                            *old = seg;
                            self.pbufs.free(stale);
                        }
                        seg_id
                    }
                    None => {
                        let Some(seg_id) = self.l2cap.segs.alloc(seg) else {
                            error!("l2cap_input: could not allocate reassembly segment");
                            self.pbufs.free(p);
                            return;
                        };
                        seg_id
                    }
                }
            }
            _ => {
                debug!("l2cap_input: unexpected boundary flag {}, dropping", pb);
                if let Some(seg_id) = existing {
                    self.l2cap_seg_drop(seg_id);
                }
                self.pbufs.free(p);
                return;
            }
        };

        let Some(seg) = self.l2cap.segs.get(seg_id).copied() else {
            return;
        };
        let have = usize::from(self.pbufs.tot_len(seg.p));
        if have < seg.len {
            trace!("l2cap_input: {} of {} bytes, waiting for more", have, seg.len);
            return;
        }
        self.l2cap.segs.release(seg_id);
        self.pbufs
            .realloc(seg.p, u16::try_from(seg.len).unwrap_or(u16::MAX));
        self.l2cap_dispatch(seg.p, seg.cid, addr);
    }

    fn l2cap_read_header(&self, p: PbufId) -> Option<L2capHeader> {
        let mut raw = [0u8; L2CAP_HDR_LEN];
        if self.pbufs.copy_out(p, 0, &mut raw) != L2CAP_HDR_LEN {
            return None;
        }
        L2capHeader::from_bytes(&raw).ok()
    }

    fn l2cap_seg_drop(&mut self, seg_id: BlockId) {
        if let Some(seg) = self.l2cap.segs.release(seg_id) {
            self.pbufs.free(seg.p);
        }
    }

    fn l2cap_dispatch(&mut self, p: PbufId, channel_id: ChannelId, addr: BluetoothAddress) {
        match channel_id {
            cid::NULL => {
                warn!("l2cap_input: illegal null CID");
                self.pbufs.free(p);
            }
            cid::SIGNALING => {
                self.l2cap_process_sig(p, addr);
                self.pbufs.free(p);
            }
            cid::CONNECTIONLESS => {
                trace!("l2cap_input: dropping connectionless data");
                self.pbufs.free(p);
            }
            _ => {
                let target = if channel_id < cid::DYNAMIC_START {
                    None
                } else {
                    self.l2cap.registered(|ch| ch.scid == channel_id)
                };
                let Some(slot) = target else {
                    debug!("l2cap_input: no channel for CID {}", channel_id);
                    self.pbufs.free(p);
                    let id = self.l2cap.next_sigid();
                    self.l2cap_reject(addr, id, &[reject_reason::INVALID_CID, channel_id, cid::NULL]);
                    return;
                };
                #[allow(clippy::cast_possible_truncation)]
                let hide = -(L2CAP_HDR_LEN as i16);
                if self.pbufs.header(p, hide).is_err() {
                    self.pbufs.free(p);
                    return;
                }
                self.l2cap_notify(slot, |channel, arg| StackEvent::Received {
                    channel,
                    arg,
                    pbuf: p,
                });
            }
        }
    }

    fn l2cap_reject(&mut self, addr: BluetoothAddress, id: u8, words: &[u16]) {
        let sent = SignalData::words(words)
            .map_err(BluetoothError::from)
            .and_then(|data| {
                self.l2cap_signal(
                    None,
                    SignalingCode::CommandReject as u8,
                    id,
                    addr,
                    data.as_slice(),
                )
            });
        if sent.is_err() {
            warn!("l2cap: could not send command reject to {}", addr);
        }
    }

    fn l2cap_respond(
        &mut self,
        slot: Option<BlockId>,
        code: SignalingCode,
        id: u8,
        addr: BluetoothAddress,
        data: &[u8],
    ) {
        if self.l2cap_signal(slot, code as u8, id, addr, data).is_err() {
            warn!("l2cap: could not send response {} to {}", code as u8, addr);
        }
    }

    fn l2cap_respond_words(
        &mut self,
        slot: Option<BlockId>,
        code: SignalingCode,
        id: u8,
        addr: BluetoothAddress,
        words: &[u16],
    ) {
        match SignalData::words(words) {
            Ok(data) => self.l2cap_respond(slot, code, id, addr, data.as_slice()),
            Err(_) => warn!("l2cap: response {} too long", code as u8),
        }
    }

    /// Walk every command of a signaling PDU (header included in `p`)
    fn l2cap_process_sig(&mut self, p: PbufId, addr: BluetoothAddress) {
        let Some(hdr) = self.l2cap_read_header(p) else {
            return;
        };
        if hdr.length > L2CAP_MTU {
            let id = self.pbufs.read_u8(p, L2CAP_HDR_LEN + 1).unwrap_or(0);
            warn!("l2cap: signaling PDU of {} bytes exceeds the MTU", hdr.length);
            self.l2cap_reject(addr, id, &[reject_reason::MTU_EXCEEDED, L2CAP_MTU]);
            return;
        }

        let end = hdr.pdu_len().min(usize::from(self.pbufs.tot_len(p)));
        let mut offset = L2CAP_HDR_LEN;
        let mut buf = [0u8; SIGNAL_RX_LEN];
        while offset + SignalingHeader::SIZE <= end {
            let mut raw = [0u8; SignalingHeader::SIZE];
            self.pbufs.copy_out(p, offset, &mut raw);
            let Ok(sig_hdr) = SignalingHeader::from_bytes(&raw) else {
                break;
            };
            let data_len = usize::from(sig_hdr.length);
            let data_at = offset + SignalingHeader::SIZE;
            offset = data_at + data_len;
            if offset > end {
                warn!("l2cap: truncated signaling command {}", sig_hdr.code);
                break;
            }
            if data_len > SIGNAL_RX_LEN {
                warn!("l2cap: signaling command of {} bytes too long", data_len);
                #[allow(clippy::cast_possible_truncation)]
                let limit = SIGNAL_RX_LEN as u16;
                self.l2cap_reject(addr, sig_hdr.identifier, &[reject_reason::MTU_EXCEEDED, limit]);
                continue;
            }
            let data = &mut buf[..data_len];
            self.pbufs.copy_out(p, data_at, data);
            match Signal::parse(sig_hdr.code, data) {
                Ok(signal) => self.l2cap_handle_signal(addr, sig_hdr.identifier, signal),
                Err(_) => warn!(
                    "l2cap: malformed signaling command {} id {}",
                    sig_hdr.code, sig_hdr.identifier
                ),
            }
        }
    }

    fn l2cap_handle_signal(&mut self, addr: BluetoothAddress, id: u8, signal: Signal<'_>) {
        match signal {
            Signal::CommandReject { reason } => {
                let Some((sig, slot)) = self.l2cap.sig_lookup(id) else {
                    debug!("l2cap: reject without matching request, id {}", id);
                    return;
                };
                debug!("l2cap: request {} rejected with reason {}, disconnecting", id, reason);
                self.l2cap_sig_remove(sig);
                if self.l2cap_disconnect_req(slot).is_err() {
                    debug!("l2cap: rejected channel is not connected");
                }
            }
            Signal::ConnectionRequest(req) => self.l2cap_conn_req(addr, id, req),
            Signal::ConnectionResponse(rsp) => self.l2cap_conn_rsp(id, rsp),
            Signal::ConfigurationRequest {
                destination_cid,
                flags,
                options,
            } => self.l2cap_cfg_req(addr, id, destination_cid, flags, options),
            Signal::ConfigurationResponse {
                flags,
                result,
                options,
                ..
            } => self.l2cap_cfg_rsp(id, flags, result, options),
            Signal::DisconnectionRequest(req) => self.l2cap_disconn_req(addr, id, req),
            Signal::DisconnectionResponse(_) => {
                let Some((sig, slot)) = self.l2cap.sig_lookup(id) else {
                    debug!("l2cap: disconnection response without request, id {}", id);
                    return;
                };
                self.l2cap_sig_remove(sig);
                self.l2cap_teardown(slot, Teardown::Confirm);
            }
            Signal::EchoRequest(_) => {
                self.l2cap_respond(None, SignalingCode::EchoResponse, id, addr, &[]);
            }
            Signal::EchoResponse(_) => {
                let Some((sig, slot)) = self.l2cap.sig_lookup(id) else {
                    debug!("l2cap: echo response without request, id {}", id);
                    return;
                };
                self.l2cap_sig_remove(sig);
                if let Some(ch) = self.l2cap.channels.get_mut(slot) {
                    ch.registered = false;
                    ch.state = ChannelState::Closed;
                }
                self.l2cap_notify(slot, |channel, arg| StackEvent::Pong {
                    channel,
                    arg,
                    result: Ok(()),
                });
            }
            Signal::Unknown { code } => {
                debug!("l2cap: command {} not understood", code);
                self.l2cap_reject(addr, id, &[reject_reason::NOT_UNDERSTOOD]);
            }
        }
    }

    fn l2cap_conn_req(&mut self, addr: BluetoothAddress, id: u8, req: ConnectionRequest) {
        let listener = self
            .l2cap
            .listeners
            .iter()
            .find(|(_, l)| l.accepts(&addr, req.psm))
            .map(|(_, l)| l.arg);
        let Some(arg) = listener else {
            debug!("l2cap: no listener for psm {} from {}", req.psm, addr);
            self.l2cap_respond_words(
                None,
                SignalingCode::ConnectionResponse,
                id,
                addr,
                &[
                    cid::NULL,
                    req.source_cid,
                    conn_result::REFUSED_PSM,
                    conn_status::NO_INFO,
                ],
            );
            return;
        };
        let scid = self.l2cap.cid_alloc();
        let serial = self.l2cap.next_serial();
        let mut ch = L2capChannel::new(serial);
        ch.remote = addr;
        ch.scid = scid;
        ch.dcid = req.source_cid;
        ch.psm = req.psm;
        ch.arg = arg;
        ch.state = ChannelState::Config;
        ch.registered = true;
        let slot = match self.l2cap.channels.alloc(ch) {
            Some(slot) if scid != cid::NULL => slot,
            other => {
                if let Some(slot) = other {
                    self.l2cap.channels.release(slot);
                }
                error!("l2cap: no resources for connection from {}", addr);
                self.l2cap_respond_words(
                    None,
                    SignalingCode::ConnectionResponse,
                    id,
                    addr,
                    &[
                        cid::NULL,
                        req.source_cid,
                        conn_result::REFUSED_RESOURCES,
                        conn_status::NO_INFO,
                    ],
                );
                return;
            }
        };

        debug!("l2cap: accepted psm {} from {} on CID {}", req.psm, addr, scid);
        self.l2cap_respond_words(
            Some(slot),
            SignalingCode::ConnectionResponse,
            id,
            addr,
            &[scid, req.source_cid, conn_result::SUCCESS, conn_status::NO_INFO],
        );
    }

    fn l2cap_conn_rsp(&mut self, id: u8, rsp: ConnectionResponse) {
        let Some((sig, slot)) = self.l2cap.sig_lookup(id) else {
            debug!("l2cap: connection response without request, id {}", id);
            return;
        };
        match rsp.result {
            conn_result::SUCCESS => {
                self.l2cap_sig_remove(sig);
                let Some(ch) = self.l2cap.channels.get_mut(slot) else {
                    return;
                };
                ch.dcid = rsp.destination_cid;
                ch.state = ChannelState::Config;
                debug!("l2cap: channel {} connected to {}", ch.scid, ch.dcid);
                if ch.cfg.flags.initiator {
                    ch.cfg.flags.out_requested = true;
                    if self.l2cap_config_req(slot).is_err() {
                        warn!("l2cap: could not send configuration request");
                    }
                }
            }
            conn_result::PENDING => {
                debug!("l2cap: connection pending, status {}", rsp.status);
                if let Some(sig) = self.l2cap.sigs.get_mut(sig) {
                    sig.rtx = 0;
                    sig.ertx = L2CAP_ERTX;
                }
            }
            result => {
                debug!("l2cap: connection refused, result {}", result);
                self.l2cap_sig_remove(sig);
                if let Some(ch) = self.l2cap.channels.get_mut(slot) {
                    ch.registered = false;
                    ch.state = ChannelState::Closed;
                }
                self.l2cap_notify(slot, |channel, arg| StackEvent::ConnectConfirm {
                    channel,
                    arg,
                    result,
                    status: rsp.status,
                });
            }
        }
    }

    fn l2cap_cfg_req(
        &mut self,
        addr: BluetoothAddress,
        id: u8,
        destination_cid: ChannelId,
        flags: u16,
        options: &[u8],
    ) {
        let Some(slot) = self.l2cap.registered(|ch| ch.scid == destination_cid) else {
            debug!("l2cap: configuration request for unknown CID {}", destination_cid);
            self.l2cap_reject(
                addr,
                id,
                &[reject_reason::INVALID_CID, destination_cid, cid::NULL],
            );
            return;
        };
        let Some(ch) = self.l2cap.channels.get_mut(slot) else {
            return;
        };
        ch.ursp_id = id;

        let mut rspstate = cfg_result::SUCCESS;
        for opt in ConfigOptions::new(options).filter(|opt| !opt.hint) {
            match opt.kind {
                option::MTU => {
                    if let Some(mtu) = opt.u16_value() {
                        ch.cfg.outmtu = mtu;
                    }
                }
                option::FLUSH_TIMEOUT => {
                    if let Some(flushto) = opt.u16_value() {
                        ch.cfg.influshto = flushto;
                    }
                }
                option::QOS => {
                    if opt.service_type() == Some(QosServiceType::Guaranteed as u8)
                        && ch.cfg.opt.push_bytes(opt.raw).is_err()
                    {
                        warn!("l2cap: no room to echo QoS option");
                    }
                }
                kind => {
                    debug!("l2cap: unknown configuration option {}", kind);
                    if rspstate != cfg_result::UNKNOWN_OPTIONS {
                        rspstate = cfg_result::UNKNOWN_OPTIONS;
                        ch.cfg.opt.clear();
                    }
                    if ch.cfg.opt.push_bytes(opt.raw).is_err() {
                        warn!("l2cap: no room to echo option {}", kind);
                    }
                }
            }
        }

        let (remote, dcid) = (ch.remote, ch.dcid);
        if flags & CONFIG_CONTINUATION != 0 {
            self.l2cap_respond_words(
                Some(slot),
                SignalingCode::ConfigurationResponse,
                id,
                remote,
                &[dcid, 0, cfg_result::SUCCESS],
            );
            return;
        }

        let progress = ch.cfg.flags;
        if !progress.initiator && !progress.out_requested {
            ch.cfg.flags.out_requested = true;
            if self.l2cap_config_req(slot).is_err() {
                warn!("l2cap: could not send configuration request");
            }
        }

        let mut data = [0u8; 6 + signaling::MAX_SIGNAL_DATA];
        let mut len = 0;
        for word in [dcid, 0, rspstate] {
            data[len..len + 2].copy_from_slice(&word.to_le_bytes());
            len += 2;
        }
        if let Some(ch) = self.l2cap.channels.get_mut(slot) {
            let opt = ch.cfg.opt.as_slice();
            data[len..len + opt.len()].copy_from_slice(opt);
            len += opt.len();
            ch.cfg.opt.clear();
        }
        self.l2cap_respond(
            Some(slot),
            SignalingCode::ConfigurationResponse,
            id,
            remote,
            &data[..len],
        );

        if rspstate == cfg_result::SUCCESS {
            let Some(ch) = self.l2cap.channels.get_mut(slot) else {
                return;
            };
            ch.cfg.flags.out_success = true;
            if ch.cfg.flags.done() {
                self.l2cap_opened(slot);
            }
        }
    }

    fn l2cap_cfg_rsp(&mut self, id: u8, flags: u16, result: u16, options: &[u8]) {
        let Some((sig, slot)) = self.l2cap.sig_lookup(id) else {
            debug!("l2cap: configuration response without request, id {}", id);
            return;
        };
        self.l2cap_sig_remove(sig);
        let continuation = flags & CONFIG_CONTINUATION != 0;
        let Some(ch) = self.l2cap.channels.get_mut(slot) else {
            return;
        };

        match result {
            cfg_result::SUCCESS => {
                ch.cfg.flags.in_success = true;
                ch.cfg.cfgto = L2CAP_CFG_TO;
                let (remote, outflushto) = (ch.remote, ch.cfg.outflushto);
                let done = ch.cfg.flags.done();
                if outflushto != L2CAP_CFG_DEFAULT_OUTFLUSHTO
                    && self.lp_write_flush_timeout(remote, outflushto).is_err()
                {
                    warn!("l2cap: could not write flush timeout");
                }
                if done {
                    self.l2cap_opened(slot);
                }
            }
            cfg_result::UNACCEPTABLE => {
                for opt in ConfigOptions::new(options).filter(|opt| !opt.hint) {
                    match opt.kind {
                        option::MTU => match opt.u16_value() {
                            Some(mtu) if mtu < L2CAP_MTU => ch.cfg.inmtu = mtu,
                            _ => {
                                error!("l2cap: MTU negotiation failed");
                                self.l2cap_disconnect_failed(slot);
                                return;
                            }
                        },
                        option::FLUSH_TIMEOUT => {
                            if let Some(flushto) = opt.u16_value() {
                                ch.cfg.influshto = flushto;
                            }
                        }
                        option::QOS => {
                            if opt.service_type() != Some(QosServiceType::BestEffort as u8) {
                                error!("l2cap: unsupported QoS service type");
                                self.l2cap_disconnect_failed(slot);
                                return;
                            }
                        }
                        _ => {}
                    }
                }
                if !continuation && self.l2cap_config_req(slot).is_err() {
                    warn!("l2cap: could not repeat configuration request");
                }
            }
            _ => {
                if !continuation {
                    debug!("l2cap: configuration failed with result {}", result);
                    self.l2cap_disconnect_failed(slot);
                    return;
                }
            }
        }

        if continuation {
            let Some(ch) = self.l2cap.channels.get(slot) else {
                return;
            };
            let (remote, scid) = (ch.remote, ch.scid);
            let [s0, s1] = scid.to_le_bytes();
            if self
                .l2cap_signal(
                    Some(slot),
                    SignalingCode::ConfigurationRequest as u8,
                    0,
                    remote,
                    &[s0, s1, 0, 0],
                )
                .is_err()
            {
                warn!("l2cap: could not send empty configuration request");
            }
        }
    }

    fn l2cap_disconn_req(&mut self, addr: BluetoothAddress, id: u8, req: Disconnection) {
        let Some(slot) = self.l2cap.registered(|ch| ch.scid == req.destination_cid) else {
            self.l2cap_reject(
                addr,
                id,
                &[reject_reason::INVALID_CID, req.destination_cid, cid::NULL],
            );
            return;
        };
        let Some(ch) = self.l2cap.channels.get(slot) else {
            return;
        };
        let (remote, scid, dcid) = (ch.remote, ch.scid, ch.dcid);
        self.l2cap_respond_words(
            Some(slot),
            SignalingCode::DisconnectionResponse,
            id,
            remote,
            &[scid, dcid],
        );
        debug!("l2cap: channel {} disconnected by peer", scid);
        self.l2cap_teardown(slot, Teardown::Indication);
    }

    fn l2cap_disconnect_failed(&mut self, slot: BlockId) {
        if self.l2cap_disconnect_req(slot).is_err() {
            warn!("l2cap: could not disconnect failed channel");
        }
    }

    fn l2cap_opened(&mut self, slot: BlockId) {
        let Some(ch) = self.l2cap.channels.get_mut(slot) else {
            return;
        };
        ch.state = ChannelState::Open;
        info!("l2cap: channel {} open, outmtu {}", ch.scid, ch.cfg.outmtu);
        if ch.cfg.flags.initiator {
            self.l2cap_notify(slot, |channel, arg| StackEvent::ConnectConfirm {
                channel,
                arg,
                result: conn_result::SUCCESS,
                status: conn_status::NO_INFO,
            });
        } else {
            self.l2cap_notify(slot, |channel, arg| StackEvent::ConnectIndication {
                channel,
                arg,
                result: Ok(()),
            });
        }
    }

    fn l2cap_notify(
        &mut self,
        slot: BlockId,
        make: impl FnOnce(ChannelHandle, usize) -> StackEvent,
    ) {
        if let Some(channel) = self.l2cap.handle(slot) {
            let arg = self.l2cap.channels.get(slot).map_or(0, |ch| ch.arg);
            self.emit(make(channel, arg));
        }
    }

    /// Close a channel, tell the embedder once and free it
    fn l2cap_teardown(&mut self, slot: BlockId, kind: Teardown) {
        if let Some(ch) = self.l2cap.channels.get_mut(slot) {
            ch.state = ChannelState::Closed;
        }
        match kind {
            Teardown::Indication => self.l2cap_notify(slot, |channel, arg| {
                StackEvent::DisconnectIndication { channel, arg }
            }),
            Teardown::Confirm => self.l2cap_notify(slot, |channel, arg| {
                StackEvent::DisconnectConfirm { channel, arg }
            }),
        }
        self.l2cap_free(slot);
    }

    fn l2cap_sig_remove(&mut self, sig: BlockId) {
        if let Some(sig) = self.l2cap.sigs.release(sig) {
            self.pbufs.free(sig.p);
        }
    }

    fn l2cap_free(&mut self, slot: BlockId) {
        for sig in self.l2cap.sigs.ids() {
            if self.l2cap.sigs.get(sig).is_some_and(|s| s.channel == slot) {
                self.l2cap_sig_remove(sig);
            }
        }
        self.l2cap.channels.release(slot);
    }

    /// One tick of the response and configuration timers
    pub(crate) fn l2cap_tmr(&mut self) {
        for slot in self.l2cap.channels.ids() {
            let Some(ch) = self.l2cap.channels.get(slot) else {
                continue;
            };
            if !ch.registered {
                continue;
            }
            if ch.cfg.outflushto < L2CAP_CFG_DEFAULT_OUTFLUSHTO && !self.l2cap_sig_tmr(slot) {
                continue;
            }
            self.l2cap_cfg_tmr(slot);
        }
    }

    /// Returns `false` when the channel was closed
    fn l2cap_sig_tmr(&mut self, slot: BlockId) -> bool {
        for id in self.l2cap.sigs.ids() {
            let Some(sig) = self.l2cap.sigs.get_mut(id) else {
                continue;
            };
            if sig.channel != slot {
                continue;
            }
            let on_rtx = sig.rtx > 0;
            if on_rtx {
                sig.rtx -= 1;
                if sig.rtx > 0 {
                    continue;
                }
            } else if sig.ertx > 0 {
                sig.ertx -= 1;
                if sig.ertx > 0 {
                    continue;
                }
            } else {
                continue;
            }

            if sig.nrtx == 0 {
                warn!("l2cap: request {} unanswered after all retransmissions", sig.id);
                self.l2cap_teardown(slot, Teardown::Indication);
                return false;
            }
            sig.nrtx -= 1;
            if on_rtx {
                sig.rtx_period = sig.rtx_period.saturating_mul(2);
            } else {
                sig.ertx = 0;
                sig.rtx_period = L2CAP_RTX;
            }
            sig.rtx = sig.rtx_period;
            let (p, len) = (sig.p, usize::from(sig.len));
            debug!("l2cap: retransmitting request {}", sig.id);

            self.l2cap_notify(slot, |channel, arg| StackEvent::TimeoutIndication {
                channel,
                arg,
            });
            let remote = self
                .l2cap
                .channels
                .get(slot)
                .map_or(BluetoothAddress::ANY, |ch| ch.remote);
            if self.l2cap_write(remote, p, len).is_err() {
                warn!("l2cap: retransmission to {} failed", remote);
            }
        }
        true
    }

    fn l2cap_cfg_tmr(&mut self, slot: BlockId) {
        let Some(ch) = self.l2cap.channels.get_mut(slot) else {
            return;
        };
        if ch.state != ChannelState::Config || ch.cfg.cfgto == 0 {
            return;
        }
        ch.cfg.cfgto -= 1;
        if ch.cfg.cfgto > 0 {
            return;
        }
        warn!("l2cap: configuration of channel {} timed out", ch.scid);
        let initiator = ch.cfg.flags.initiator;
        if self.l2cap_disconnect_req(slot).is_err() {
            warn!("l2cap: could not disconnect timed out channel");
        }
        if initiator {
            self.l2cap_notify(slot, |channel, arg| StackEvent::ConnectConfirm {
                channel,
                arg,
                result: conn_result::CONFIG_TIMEOUT,
                status: conn_status::NO_INFO,
            });
        } else {
            self.l2cap_notify(slot, |channel, arg| StackEvent::ConnectIndication {
                channel,
                arg,
                result: Err(BluetoothError::Timeout),
            });
        }
        self.l2cap_teardown(slot, Teardown::Indication);
    }

    /// Free every channel, listener, outstanding request and reassembly
    pub(crate) fn l2cap_reset_all(&mut self) {
        for sig in self.l2cap.sigs.ids() {
            self.l2cap_sig_remove(sig);
        }
        for seg in self.l2cap.segs.ids() {
            self.l2cap_seg_drop(seg);
        }
        let serial = self.l2cap.serial;
        self.l2cap = L2cap::new();
        self.l2cap.serial = serial;
    }

    /// The ACL link to `addr` came up (or failed) after `lp_connect_req`
    ///
    /// Every closed channel waiting for the link sends its connection request.
    pub fn lp_connect_cfm(
        &mut self,
        addr: BluetoothAddress,
        encrypt_mode: u8,
        result: Result<(), BluetoothError>,
    ) {
        for slot in self.l2cap.channels.ids() {
            let waiting = self.l2cap.channels.get(slot).is_some_and(|ch| {
                ch.registered && ch.remote == addr && ch.state == ChannelState::Closed
            });
            if !waiting {
                continue;
            }
            let sent = match result {
                Ok(()) => {
                    let Some(ch) = self.l2cap.channels.get_mut(slot) else {
                        continue;
                    };
                    ch.encrypt = encrypt_mode;
                    let req = ConnectionRequest {
                        psm: ch.psm,
                        source_cid: ch.scid,
                    };
                    self.l2cap_signal(
                        Some(slot),
                        SignalingCode::ConnectionRequest as u8,
                        0,
                        addr,
                        &req.to_bytes(),
                    )
                }
                Err(e) => Err(e),
            };
            match sent {
                Ok(()) => {
                    if let Some(ch) = self.l2cap.channels.get_mut(slot) {
                        ch.state = ChannelState::W4ConnectRsp;
                    }
                }
                Err(e) => {
                    error!("lp_connect_cfm: connection to {} failed: {}", addr, e);
                    if let Some(ch) = self.l2cap.channels.get_mut(slot) {
                        ch.registered = false;
                    }
                    self.l2cap_notify(slot, |channel, arg| StackEvent::ConnectConfirm {
                        channel,
                        arg,
                        result: conn_result::REFUSED_RESOURCES,
                        status: conn_status::NO_INFO,
                    });
                }
            }
        }
    }

    /// A remote device brought up an ACL link
    pub fn lp_connect_ind(&mut self, addr: BluetoothAddress) {
        debug!("lp_connect_ind: link from {}", addr);
    }

    /// The ACL link to `addr` is gone: close every channel on it
    pub fn lp_disconnect_ind(&mut self, addr: BluetoothAddress, reason: u8) {
        for slot in self.l2cap.channels.ids() {
            if self
                .l2cap
                .channels
                .get(slot)
                .is_some_and(|ch| ch.registered && ch.remote == addr)
            {
                self.l2cap_teardown(slot, Teardown::Indication);
            }
        }
        if let Some(seg) = self.l2cap.segs.find(|seg| seg.addr == addr) {
            self.l2cap_seg_drop(seg);
        }
        info!("l2cap: baseband link to {} down, reason {}", addr, reason);
        self.emit(StackEvent::BasebandDisconnect { addr, reason });
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::hci::{event, opcode};
    use crate::transport::testing::RecordingBus;
    use std::vec;
    use std::vec::Vec;

    const PEER: BluetoothAddress = BluetoothAddress([1, 2, 3, 4, 5, 6]);
    const HANDLE: u16 = 0x0001;

    #[derive(Debug, PartialEq, Eq)]
    struct Sent {
        code: u8,
        id: u8,
        data: Vec<u8>,
    }

    fn event(code: u8, params: &[u8]) -> Vec<u8> {
        let mut packet = vec![code, params.len() as u8];
        packet.extend_from_slice(params);
        packet
    }

    fn setup() -> Stack<RecordingBus> {
        let mut stack = Stack::new(RecordingBus::default());
        let [o0, o1] = opcode::READ_BUFFER_SIZE.to_bytes();
        stack
            .hci_event_input(&event(
                event::code::COMMAND_COMPLETE,
                &[1, o0, o1, 0x00, 0x53, 0x01, 0x40, 100, 0, 0x08, 0x00],
            ))
            .unwrap();
        let mut params = vec![0x00];
        params.extend_from_slice(&HANDLE.to_le_bytes());
        params.extend_from_slice(PEER.as_bytes());
        params.extend_from_slice(&[0x01, 0x00]);
        stack
            .hci_event_input(&event(event::code::CONNECTION_COMPLETE, &params))
            .unwrap();
        drain(&mut stack);
        stack.bus.clear();
        stack
    }

    fn drain(stack: &mut Stack<RecordingBus>) -> Vec<StackEvent> {
        let mut events = Vec::new();
        while let Some(event) = stack.poll_event() {
            events.push(event);
        }
        events
    }

    fn acl(pb: u8, payload: &[u8]) -> Vec<u8> {
        let flags = HANDLE | (u16::from(pb) << 12);
        let mut packet = Vec::new();
        packet.extend_from_slice(&flags.to_le_bytes());
        packet.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    fn pdu(cid: u16, payload: &[u8]) -> Vec<u8> {
        let mut bytes = L2capHeader::new(payload.len() as u16, cid).to_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    fn words(values: &[u16]) -> Vec<u8> {
        values.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn feed(stack: &mut Stack<RecordingBus>, code: SignalingCode, id: u8, data: &[u8]) {
        let mut command = vec![code as u8, id];
        command.extend_from_slice(&(data.len() as u16).to_le_bytes());
        command.extend_from_slice(data);
        stack
            .acl_input(&acl(boundary::START, &pdu(cid::SIGNALING, &command)))
            .unwrap();
    }

    fn sent(stack: &Stack<RecordingBus>) -> Vec<Sent> {
        stack
            .bus
            .acl()
            .iter()
            .filter(|f| f.len() >= 13 && u16::from_le_bytes([f[7], f[8]]) == cid::SIGNALING)
            .map(|f| Sent {
                code: f[9],
                id: f[10],
                data: f[13..].to_vec(),
            })
            .collect()
    }

    fn sent_code(stack: &Stack<RecordingBus>, code: SignalingCode) -> Vec<Sent> {
        sent(stack)
            .into_iter()
            .filter(|s| s.code == code as u8)
            .collect()
    }

    /// Accept a peer connection on PSM 0x11 (peer CID 0x70) and configure it both ways
    fn open_incoming(stack: &mut Stack<RecordingBus>) -> ChannelHandle {
        let l = stack.l2cap_new().unwrap();
        stack.l2cap_set_arg(l, 5).unwrap();
        stack.l2cap_listen(l, BluetoothAddress::ANY, 0x11).unwrap();
        feed(stack, SignalingCode::ConnectionRequest, 3, &words(&[0x11, 0x70]));
        feed(stack, SignalingCode::ConfigurationRequest, 4, &words(&[0x40, 0]));
        let ours = sent_code(stack, SignalingCode::ConfigurationRequest);
        assert_eq!(ours.len(), 1);
        feed(
            stack,
            SignalingCode::ConfigurationResponse,
            ours[0].id,
            &words(&[0x70, 0, cfg_result::SUCCESS]),
        );
        let events = drain(stack);
        let [StackEvent::ConnectIndication { channel, arg: 5, result: Ok(()) }] = events[..] else {
            panic!("unexpected events {events:?}");
        };
        stack.bus.clear();
        channel
    }

    #[test]
    fn test_cid_allocation_reuses_first_free() {
        let mut stack = setup();
        let a = stack.l2cap_new().unwrap();
        stack.l2ca_connect_req(a, PEER, 0x11, 0).unwrap();
        let b = stack.l2cap_new().unwrap();
        stack.l2ca_connect_req(b, PEER, 0x13, 0).unwrap();
        assert_eq!(stack.l2cap_channel(a).unwrap().scid, 0x40);
        assert_eq!(stack.l2cap_channel(b).unwrap().scid, 0x41);

        stack.l2cap_close(a).unwrap();
        assert_eq!(stack.l2cap_state(a), Err(BluetoothError::InvalidParameter));
        assert_eq!(stack.l2cap.pending_signals(), 1);

        let c = stack.l2cap_new().unwrap();
        stack.l2ca_connect_req(c, PEER, 0x11, 0).unwrap();
        assert_eq!(stack.l2cap_channel(c).unwrap().scid, 0x40);
        assert_eq!(stack.l2cap_state(c), Ok(ChannelState::W4ConnectRsp));

        let requests = sent_code(&stack, SignalingCode::ConnectionRequest);
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].data, words(&[0x11, 0x40]));
        assert_eq!(requests[2].data, words(&[0x11, 0x40]));
    }

    #[test]
    fn test_outgoing_connection_opens_after_both_configs() {
        let mut stack = setup();
        let channel = stack.l2cap_new().unwrap();
        stack.l2cap_set_arg(channel, 9).unwrap();
        stack.l2ca_connect_req(channel, PEER, 0x11, 0).unwrap();
        let req = sent_code(&stack, SignalingCode::ConnectionRequest).remove(0);
        assert_eq!(req.id, 1);

        feed(
            &mut stack,
            SignalingCode::ConnectionResponse,
            1,
            &words(&[0x50, 0x40, conn_result::SUCCESS, 0]),
        );
        assert_eq!(stack.l2cap_state(channel), Ok(ChannelState::Config));
        assert_eq!(stack.l2cap_channel(channel).unwrap().dcid, 0x50);
        let cfg = sent_code(&stack, SignalingCode::ConfigurationRequest).remove(0);
        assert_eq!(cfg.data, [0x50, 0, 0, 0, option::MTU, 2, 0x97, 0x06]);

        feed(
            &mut stack,
            SignalingCode::ConfigurationResponse,
            cfg.id,
            &words(&[0x40, 0, cfg_result::SUCCESS]),
        );
        assert_eq!(stack.l2cap_state(channel), Ok(ChannelState::Config));
        assert!(drain(&mut stack).is_empty());

        let mut peer_cfg = words(&[0x40, 0]);
        peer_cfg.extend_from_slice(&[option::MTU, 2, 0x00, 0x02]);
        feed(&mut stack, SignalingCode::ConfigurationRequest, 7, &peer_cfg);
        let rsp = sent_code(&stack, SignalingCode::ConfigurationResponse);
        assert_eq!(rsp.len(), 1);
        assert_eq!(rsp[0].id, 7);
        assert_eq!(rsp[0].data, words(&[0x50, 0, cfg_result::SUCCESS]));

        assert_eq!(stack.l2cap_state(channel), Ok(ChannelState::Open));
        assert_eq!(stack.l2cap_channel(channel).unwrap().cfg.outmtu, 0x200);
        assert_eq!(
            drain(&mut stack),
            [StackEvent::ConnectConfirm {
                channel,
                arg: 9,
                result: conn_result::SUCCESS,
                status: 0,
            }]
        );
        assert_eq!(stack.l2cap.pending_signals(), 0);
    }

    #[test]
    fn test_refused_connection_is_confirmed_and_kept() {
        let mut stack = setup();
        let channel = stack.l2cap_new().unwrap();
        stack.l2ca_connect_req(channel, PEER, 0x11, 0).unwrap();
        feed(
            &mut stack,
            SignalingCode::ConnectionResponse,
            1,
            &words(&[0, 0x40, conn_result::REFUSED_PSM, 0]),
        );
        assert_eq!(
            drain(&mut stack),
            [StackEvent::ConnectConfirm {
                channel,
                arg: 0,
                result: conn_result::REFUSED_PSM,
                status: 0,
            }]
        );
        assert_eq!(stack.l2cap_state(channel), Ok(ChannelState::Closed));
        stack.l2ca_connect_req(channel, PEER, 0x13, 0).unwrap();
        assert_eq!(stack.l2cap_state(channel), Ok(ChannelState::W4ConnectRsp));
        stack.l2cap_close(channel).unwrap();
        assert_eq!(stack.pbufs.descriptors_in_use(), 0);
    }

    #[test]
    fn test_connect_on_busy_channel_is_rejected() {
        let mut stack = setup();
        let connecting = stack.l2cap_new().unwrap();
        stack.l2ca_connect_req(connecting, PEER, 0x13, 0).unwrap();
        assert_eq!(
            stack.l2ca_connect_req(connecting, PEER, 0x13, 0),
            Err(BluetoothError::Connection)
        );
        stack.l2cap_close(connecting).unwrap();
        stack.bus.clear();

        let open = open_incoming(&mut stack);
        assert_eq!(stack.l2cap_channel(open).unwrap().scid, 0x40);
        assert_eq!(
            stack.l2ca_connect_req(open, PEER, 0x11, 0),
            Err(BluetoothError::Connection)
        );
        assert_eq!(stack.l2cap_state(open), Ok(ChannelState::Open));
        assert_eq!(stack.l2cap_channel(open).unwrap().scid, 0x40);
        assert!(sent_code(&stack, SignalingCode::ConnectionRequest).is_empty());
    }

    #[test]
    fn test_unacceptable_mtu_is_requested_again_once() {
        let mut stack = setup();
        let channel = stack.l2cap_new().unwrap();
        stack.l2ca_connect_req(channel, PEER, 0x11, 0).unwrap();
        feed(
            &mut stack,
            SignalingCode::ConnectionResponse,
            1,
            &words(&[0x50, 0x40, conn_result::SUCCESS, 0]),
        );
        let first = sent_code(&stack, SignalingCode::ConfigurationRequest);
        assert_eq!(first.len(), 1);
        stack.bus.clear();

        let mut rsp = words(&[0x40, 0, cfg_result::UNACCEPTABLE]);
        rsp.extend_from_slice(&[option::MTU, 2, 0x00, 0x02]);
        feed(&mut stack, SignalingCode::ConfigurationResponse, first[0].id, &rsp);

        let again = sent_code(&stack, SignalingCode::ConfigurationRequest);
        assert_eq!(again.len(), 1);
        assert_ne!(again[0].id, first[0].id);
        assert_eq!(again[0].data, [0x50, 0, 0, 0, option::MTU, 2, 0x00, 0x02]);
        assert_eq!(stack.l2cap_channel(channel).unwrap().cfg.inmtu, 0x200);
        assert_eq!(stack.l2cap.pending_signals(), 1);
    }

    #[test]
    fn test_config_timeout_indicates_once() {
        let mut stack = setup();
        let l = stack.l2cap_new().unwrap();
        stack.l2cap_set_arg(l, 5).unwrap();
        stack.l2cap_listen(l, PEER, 0x11).unwrap();
        feed(&mut stack, SignalingCode::ConnectionRequest, 3, &words(&[0x11, 0x70]));
        let rsp = sent_code(&stack, SignalingCode::ConnectionResponse);
        assert_eq!(rsp[0].id, 3);
        assert_eq!(rsp[0].data, words(&[0x40, 0x70, conn_result::SUCCESS, 0]));
        let (channel, ch) = stack.l2cap.channels().next().unwrap();
        assert_eq!(ch.state, ChannelState::Config);

        for _ in 0..L2CAP_CFG_TO - 1 {
            stack.tick();
        }
        assert!(drain(&mut stack).is_empty());
        stack.tick();
        assert_eq!(
            drain(&mut stack),
            [
                StackEvent::ConnectIndication {
                    channel,
                    arg: 5,
                    result: Err(BluetoothError::Timeout),
                },
                StackEvent::DisconnectIndication { channel, arg: 5 },
            ]
        );
        assert_eq!(sent_code(&stack, SignalingCode::DisconnectionRequest).len(), 1);
        assert_eq!(stack.l2cap_state(channel), Err(BluetoothError::InvalidParameter));

        for _ in 0..100 {
            stack.tick();
        }
        assert!(drain(&mut stack).is_empty());
        assert_eq!(stack.pbufs.descriptors_in_use(), 0);
    }

    #[test]
    fn test_unanswered_request_backs_off_then_disconnects() {
        let mut stack = setup();
        let channel = stack.l2cap_new().unwrap();
        stack.l2cap_set_outflushto(channel, 0x20).unwrap();
        stack.l2ca_connect_req(channel, PEER, 0x11, 0).unwrap();

        let timeout = StackEvent::TimeoutIndication { channel, arg: 0 };
        for period in [L2CAP_RTX, L2CAP_RTX * 2] {
            for _ in 0..period - 1 {
                stack.tick();
            }
            assert!(drain(&mut stack).is_empty());
            stack.tick();
            assert_eq!(drain(&mut stack), [timeout.clone()]);
        }
        let requests = sent_code(&stack, SignalingCode::ConnectionRequest);
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.id == requests[0].id));

        for _ in 0..L2CAP_RTX * 4 {
            stack.tick();
        }
        assert_eq!(
            drain(&mut stack),
            [StackEvent::DisconnectIndication { channel, arg: 0 }]
        );
        assert_eq!(stack.l2cap_state(channel), Err(BluetoothError::InvalidParameter));
        assert_eq!(stack.l2cap.pending_signals(), 0);
    }

    #[test]
    fn test_pending_response_switches_to_extended_timer() {
        let mut stack = setup();
        let channel = stack.l2cap_new().unwrap();
        stack.l2cap_set_outflushto(channel, 0x20).unwrap();
        stack.l2ca_connect_req(channel, PEER, 0x11, 0).unwrap();
        feed(
            &mut stack,
            SignalingCode::ConnectionResponse,
            1,
            &words(&[0, 0x40, conn_result::PENDING, 0]),
        );
        for _ in 0..L2CAP_ERTX - 1 {
            stack.tick();
        }
        assert!(drain(&mut stack).is_empty());
        stack.tick();
        assert_eq!(
            drain(&mut stack),
            [StackEvent::TimeoutIndication { channel, arg: 0 }]
        );
        assert_eq!(sent_code(&stack, SignalingCode::ConnectionRequest).len(), 2);
    }

    #[test]
    fn test_fragmented_pdu_is_reassembled() {
        let mut stack = setup();
        let channel = open_incoming(&mut stack);

        let bytes = pdu(0x40, b"abcdef");
        stack.acl_input(&acl(boundary::START, &bytes[..5])).unwrap();
        assert!(drain(&mut stack).is_empty());
        stack.acl_input(&acl(boundary::CONTINUE, &bytes[5..])).unwrap();

        let events = drain(&mut stack);
        let [StackEvent::Received { channel: from, arg: 5, pbuf }] = events[..] else {
            panic!("unexpected events {events:?}");
        };
        assert_eq!(from, channel);
        let mut out = [0u8; 6];
        assert_eq!(stack.pbufs.tot_len(pbuf), 6);
        assert_eq!(stack.pbufs.copy_out(pbuf, 0, &mut out), 6);
        assert_eq!(&out, b"abcdef");
        stack.pbufs.free(pbuf);

        stack.acl_input(&acl(boundary::CONTINUE, b"xyz")).unwrap();
        assert!(drain(&mut stack).is_empty());
        assert_eq!(stack.pbufs.descriptors_in_use(), 0);
    }

    #[test]
    fn test_overrunning_fragment_drops_the_pdu() {
        let mut stack = setup();
        open_incoming(&mut stack);
        let bytes = pdu(0x40, b"abcd");
        stack.acl_input(&acl(boundary::START, &bytes[..5])).unwrap();
        stack
            .acl_input(&acl(boundary::CONTINUE, b"bcdefgh"))
            .unwrap();
        assert!(drain(&mut stack).is_empty());
        assert_eq!(stack.l2cap.segs.used(), 0);
        assert_eq!(stack.pbufs.descriptors_in_use(), 0);
    }

    #[test]
    fn test_data_for_unknown_cid_is_rejected() {
        let mut stack = setup();
        stack
            .acl_input(&acl(boundary::START, &pdu(0x55, b"hi")))
            .unwrap();
        let rej = sent_code(&stack, SignalingCode::CommandReject);
        assert_eq!(rej.len(), 1);
        assert_eq!(rej[0].data, words(&[reject_reason::INVALID_CID, 0x55, 0]));
        assert!(drain(&mut stack).is_empty());
    }

    #[test]
    fn test_connection_without_listener_is_refused() {
        let mut stack = setup();
        feed(&mut stack, SignalingCode::ConnectionRequest, 6, &words(&[0x11, 0x70]));
        let rsp = sent_code(&stack, SignalingCode::ConnectionResponse);
        assert_eq!(rsp.len(), 1);
        assert_eq!(rsp[0].id, 6);
        assert_eq!(rsp[0].data, words(&[0, 0x70, conn_result::REFUSED_PSM, 0]));
        assert_eq!(stack.l2cap.channels().count(), 0);
    }

    #[test]
    fn test_peer_disconnect_frees_channel() {
        let mut stack = setup();
        let channel = open_incoming(&mut stack);
        feed(&mut stack, SignalingCode::DisconnectionRequest, 9, &words(&[0x40, 0x70]));
        let rsp = sent_code(&stack, SignalingCode::DisconnectionResponse);
        assert_eq!(rsp.len(), 1);
        assert_eq!(rsp[0].id, 9);
        assert_eq!(rsp[0].data, words(&[0x40, 0x70]));
        assert_eq!(
            drain(&mut stack),
            [StackEvent::DisconnectIndication { channel, arg: 5 }]
        );
        assert_eq!(stack.l2cap_state(channel), Err(BluetoothError::InvalidParameter));
    }

    #[test]
    fn test_local_disconnect_is_confirmed() {
        let mut stack = setup();
        let channel = open_incoming(&mut stack);
        stack.l2ca_disconnect_req(channel).unwrap();
        assert_eq!(stack.l2cap_state(channel), Ok(ChannelState::W4DisconnectRsp));
        let req = sent_code(&stack, SignalingCode::DisconnectionRequest).remove(0);
        assert_eq!(req.data, words(&[0x70, 0x40]));
        feed(&mut stack, SignalingCode::DisconnectionResponse, req.id, &words(&[0x70, 0x40]));
        assert_eq!(
            drain(&mut stack),
            [StackEvent::DisconnectConfirm { channel, arg: 5 }]
        );
        assert_eq!(
            stack.l2ca_disconnect_req(channel),
            Err(BluetoothError::InvalidParameter)
        );
    }

    #[test]
    fn test_datawrite_cuts_to_peer_mtu() {
        let mut stack = setup();
        let channel = open_incoming(&mut stack);
        let p = stack.pbufs.alloc(PbufLayer::Raw, 6, PbufKind::Ram).unwrap();
        stack.pbufs.copy_in(p, 0, b"abcdef").unwrap();

        assert_eq!(stack.l2ca_datawrite(channel, p), Ok(()));
        stack.l2cap_channel_mut(channel).unwrap().cfg.outmtu = 4;
        assert_eq!(stack.l2ca_datawrite(channel, p), Err(BluetoothError::MtuExceeded));

        let frames = stack.bus.acl();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][5..], &[6, 0, 0x70, 0, b'a', b'b', b'c', b'd', b'e', b'f']);
        assert_eq!(&frames[1][5..], &[4, 0, 0x70, 0, b'a', b'b', b'c', b'd']);

        assert_eq!(stack.pbufs.tot_len(p), 6);
        stack.pbufs.free(p);
        assert_eq!(stack.pbufs.descriptors_in_use(), 0);
    }

    #[test]
    fn test_datawrite_needs_open_channel() {
        let mut stack = setup();
        let channel = stack.l2cap_new().unwrap();
        let p = stack.pbufs.alloc(PbufLayer::Raw, 2, PbufKind::Ram).unwrap();
        assert_eq!(stack.l2ca_datawrite(channel, p), Err(BluetoothError::Connection));
        assert!(stack.bus.acl().is_empty());
    }

    #[test]
    fn test_echo_round_trip() {
        let mut stack = setup();
        let channel = stack.l2cap_new().unwrap();
        assert_eq!(
            stack.l2ca_ping(channel, BluetoothAddress([9; 6])),
            Err(BluetoothError::Connection)
        );
        stack.l2ca_ping(channel, PEER).unwrap();
        let req = sent_code(&stack, SignalingCode::EchoRequest).remove(0);
        assert!(req.data.is_empty());
        feed(&mut stack, SignalingCode::EchoResponse, req.id, &[]);
        assert_eq!(
            drain(&mut stack),
            [StackEvent::Pong {
                channel,
                arg: 0,
                result: Ok(()),
            }]
        );
        assert_eq!(stack.l2cap_state(channel), Ok(ChannelState::Closed));
        assert_eq!(stack.l2cap.channels().count(), 0);
    }

    #[test]
    fn test_echo_request_is_answered() {
        let mut stack = setup();
        feed(&mut stack, SignalingCode::EchoRequest, 0x21, b"ping");
        let rsp = sent_code(&stack, SignalingCode::EchoResponse);
        assert_eq!(rsp, [Sent { code: 0x09, id: 0x21, data: Vec::new() }]);
    }

    #[test]
    fn test_unknown_command_is_not_understood() {
        let mut stack = setup();
        feed(&mut stack, SignalingCode::InformationRequest, 4, &words(&[2]));
        let rej = sent_code(&stack, SignalingCode::CommandReject);
        assert_eq!(rej.len(), 1);
        assert_eq!(rej[0].id, 4);
        assert_eq!(rej[0].data, words(&[reject_reason::NOT_UNDERSTOOD]));
    }

    #[test]
    fn test_baseband_disconnect_closes_channels() {
        let mut stack = setup();
        let channel = open_incoming(&mut stack);
        stack
            .hci_event_input(&event(
                event::code::DISCONNECTION_COMPLETE,
                &[0x00, 0x01, 0x00, 0x13],
            ))
            .unwrap();
        assert_eq!(
            drain(&mut stack),
            [
                StackEvent::DisconnectIndication { channel, arg: 5 },
                StackEvent::BasebandDisconnect {
                    addr: PEER,
                    reason: 0x13,
                },
            ]
        );
        assert!(!stack.lp_is_connected(&PEER));
    }

    #[test]
    fn test_connect_waits_for_link() {
        let mut stack = Stack::new(RecordingBus::default());
        let channel = stack.l2cap_new().unwrap();
        stack
            .l2ca_connect_req(channel, PEER, 0x11, crate::constants::ALLOW_ROLE_SWITCH)
            .unwrap();
        assert_eq!(stack.l2cap_state(channel), Ok(ChannelState::Closed));
        assert!(stack.bus.acl().is_empty());
        assert_eq!(stack.bus.last_command().unwrap().1, 0x0005);

        let mut params = vec![0x00];
        params.extend_from_slice(&HANDLE.to_le_bytes());
        params.extend_from_slice(PEER.as_bytes());
        params.extend_from_slice(&[0x01, 0x01]);
        stack
            .hci_event_input(&event(event::code::CONNECTION_COMPLETE, &params))
            .unwrap();
        assert_eq!(stack.l2cap_state(channel), Ok(ChannelState::W4ConnectRsp));
        assert_eq!(stack.l2cap_channel(channel).unwrap().encrypt, 1);
    }

    #[test]
    fn test_page_timeout_confirms_once_and_drops_link() {
        let mut stack = Stack::new(RecordingBus::default());
        let channel = stack.l2cap_new().unwrap();
        stack.l2cap_set_arg(channel, 4).unwrap();
        stack.l2ca_connect_req(channel, PEER, 0x11, 0).unwrap();
        assert!(stack.lp_is_connected(&PEER));

        let mut params = vec![0x04, 0x00, 0x00];
        params.extend_from_slice(PEER.as_bytes());
        params.extend_from_slice(&[0x01, 0x00]);
        stack
            .hci_event_input(&event(event::code::CONNECTION_COMPLETE, &params))
            .unwrap();
        assert_eq!(
            drain(&mut stack),
            [StackEvent::ConnectConfirm {
                channel,
                arg: 4,
                result: conn_result::REFUSED_RESOURCES,
                status: 0,
            }]
        );
        assert!(!stack.lp_is_connected(&PEER));
        assert_eq!(stack.hci().links().count(), 0);
        assert_eq!(stack.l2cap_state(channel), Ok(ChannelState::Closed));

        for _ in 0..100 {
            stack.tick();
        }
        assert!(drain(&mut stack).is_empty());
        assert!(stack.bus.acl().is_empty());
    }

    #[test]
    fn test_reset_all_frees_everything() {
        let mut stack = setup();
        let channel = open_incoming(&mut stack);
        let bytes = pdu(0x40, b"abcdef");
        stack.acl_input(&acl(boundary::START, &bytes[..5])).unwrap();
        let other = stack.l2cap_new().unwrap();
        stack.l2cap_set_outflushto(other, 0x20).unwrap();
        stack.l2ca_connect_req(other, PEER, 0x13, 0).unwrap();

        stack.l2cap_reset_all();
        assert_eq!(stack.l2cap_state(channel), Err(BluetoothError::InvalidParameter));
        assert_eq!(stack.l2cap_state(other), Err(BluetoothError::InvalidParameter));
        assert_eq!(stack.l2cap.listeners().count(), 0);
        assert_eq!(stack.pbufs.descriptors_in_use(), 0);
        let fresh = stack.l2cap_new().unwrap();
        assert_ne!(fresh, channel);
    }
}
