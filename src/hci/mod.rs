//! Host Controller Interface
//!
//! The device control block ([`Hci`]) tracks what the controller reported
//! about itself, the ACL credit counters, the active links and the results of
//! the last inquiry and stored-link-key read. Inbound events are decoded by
//! [`event::HciEvent`] and dispatched by [`Stack::hci_event_input`]; inbound
//! ACL data flows through [`Stack::acl_input`] to L2CAP.

mod command;
pub mod event;
pub mod opcode;
pub mod procedure;

use crate::constants::{
    DEFAULT_PAGE_SCAN_REPETITION_MODE, HCI_ACL_DATA_PACKET, HCI_ACL_HDR_LEN,
    HCI_DEFAULT_PACKET_TYPES, HCI_HOST_MAX_NUM_ACL, HCI_NUM_CMD_DEFAULT, LINK_KEY_LENGTH,
    MEMB_NUM_HCI_INQ, MEMB_NUM_HCI_LINK, MEMB_NUM_HCI_LINK_KEY,
};
use crate::memb::{BlockId, Memb};
use crate::pbuf::{PbufId, PbufKind, PbufLayer};
use crate::stack::{Stack, StackEvent};
use crate::transport::{Frame, PhysBus};
use crate::{BluetoothAddress, BluetoothError, LocalDeviceInfo};
use event::{HciEvent, InquiryRecord, LinkKeyRecord};
use opcode::Opcode;
use procedure::{InquiryRequest, Procedure};

/// HCI status codes the stack acts on
pub mod status {
    /// Command succeeded
    pub const SUCCESS: u8 = 0x00;
    /// Page timeout
    pub const PAGE_TIMEOUT: u8 = 0x04;
    /// Connection rejected due to unacceptable `BD_ADDR`
    pub const CONNECTION_REJECTED_BD_ADDR: u8 = 0x0F;
    /// Remote user terminated connection
    pub const REMOTE_USER_TERMINATED: u8 = 0x13;
    /// Connection terminated by local host
    pub const LOCAL_HOST_TERMINATED: u8 = 0x16;
}

/// ACL packet type bits
pub mod packet_type {
    /// DM1
    pub const DM1: u16 = 0x0008;
    /// DH1
    pub const DH1: u16 = 0x0010;
    /// HV1
    pub const HV1: u16 = 0x0020;
    /// HV2
    pub const HV2: u16 = 0x0040;
    /// HV3
    pub const HV3: u16 = 0x0080;
    /// DM3
    pub const DM3: u16 = 0x0400;
    /// DH3
    pub const DH3: u16 = 0x0800;
    /// DM5
    pub const DM5: u16 = 0x4000;
    /// DH5
    pub const DH5: u16 = 0x8000;
}

/// ACL packet boundary flags
pub mod boundary {
    /// Continuing fragment of a higher layer message
    pub const CONTINUE: u8 = 0x01;
    /// First fragment of a higher layer message
    pub const START: u8 = 0x02;
}

const LMP_3SLOT: u8 = 0x01;
const LMP_5SLOT: u8 = 0x02;
const LMP_HV2: u8 = 0x10;
const LMP_HV3: u8 = 0x20;

/// Bytes of the inbound ACL header (no packet indicator)
const ACL_IN_HDR_LEN: usize = 4;

/// An outbound ACL fragment parked until the controller returns a credit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingAcl {
    pub p: PbufId,
    pub offset: usize,
    pub len: usize,
    pub pb: u8,
}

/// One ACL connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciLink {
    /// Remote device
    pub addr: BluetoothAddress,
    /// Connection handle assigned by the controller
    pub handle: u16,
    /// Link policy settings last confirmed by the controller
    pub policy: u16,
    pub(crate) requested_policy: u16,
    pub(crate) pending: Option<PendingAcl>,
}

impl HciLink {
    fn new(addr: BluetoothAddress) -> Self {
        Self {
            addr,
            handle: 0,
            policy: 0,
            requested_policy: 0,
            pending: None,
        }
    }
}

/// Link key returned by the controller or reported by a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StoredLinkKey {
    /// Device the key belongs to
    pub addr: BluetoothAddress,
    /// The key
    pub key: [u8; LINK_KEY_LENGTH],
}

impl From<LinkKeyRecord> for StoredLinkKey {
    fn from(record: LinkKeyRecord) -> Self {
        Self {
            addr: record.addr,
            key: record.key,
        }
    }
}

/// Which security requests the embedder answers itself
///
/// A request without a hook gets a negative reply straight away so the
/// controller is never left waiting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HciHooks {
    /// Forward PIN code requests as [`StackEvent::PinCodeRequest`]
    pub pin_code_request: bool,
    /// Forward link key requests as [`StackEvent::LinkKeyRequest`]
    pub link_key_request: bool,
}

/// HCI device control block
#[derive(Debug)]
pub struct Hci {
    pub(crate) info: LocalDeviceInfo,
    pub(crate) pkt_type: u16,
    pub(crate) acl_mtu: u16,
    pub(crate) sco_mtu: u8,
    pub(crate) acl_max_pkt: u16,
    pub(crate) sco_max_pkt: u16,
    pub(crate) num_cmd: u8,
    pub(crate) flow: bool,
    pub(crate) host_num_acl: u16,
    pub(crate) links: Memb<HciLink, MEMB_NUM_HCI_LINK>,
    pub(crate) inquiry_results: Memb<InquiryRecord, MEMB_NUM_HCI_INQ>,
    pub(crate) link_keys: Memb<StoredLinkKey, MEMB_NUM_HCI_LINK_KEY>,
    pub(crate) procedure: Option<Procedure>,
    pub(crate) inquiry: Option<InquiryRequest>,
    pub(crate) hooks: HciHooks,
}

impl Hci {
    /// Fresh control block, as after a controller reset
    #[must_use]
    pub fn new() -> Self {
        Self {
            info: LocalDeviceInfo::default(),
            pkt_type: HCI_DEFAULT_PACKET_TYPES,
            acl_mtu: 0,
            sco_mtu: 0,
            acl_max_pkt: 0,
            sco_max_pkt: 0,
            num_cmd: HCI_NUM_CMD_DEFAULT,
            flow: false,
            host_num_acl: 0,
            links: Memb::new(),
            inquiry_results: Memb::new(),
            link_keys: Memb::new(),
            procedure: None,
            inquiry: None,
            hooks: HciHooks::default(),
        }
    }

    /// Link to `addr`, if one exists
    #[must_use]
    pub fn link(&self, addr: &BluetoothAddress) -> Option<&HciLink> {
        self.links.iter().map(|(_, l)| l).find(|l| l.addr == *addr)
    }

    pub(crate) fn link_id(&self, addr: &BluetoothAddress) -> Option<BlockId> {
        self.links.find(|l| l.addr == *addr)
    }

    pub(crate) fn link_id_by_handle(&self, handle: u16) -> Option<BlockId> {
        self.links.find(|l| l.handle == handle)
    }

    /// Every active link
    pub fn links(&self) -> impl Iterator<Item = &HciLink> {
        self.links.iter().map(|(_, l)| l)
    }

    /// Results of the last inquiry
    pub fn inquiry_results(&self) -> impl Iterator<Item = &InquiryRecord> {
        self.inquiry_results.iter().map(|(_, r)| r)
    }

    /// Link keys returned by the last stored-link-key read
    pub fn stored_link_keys(&self) -> impl Iterator<Item = &StoredLinkKey> {
        self.link_keys.iter().map(|(_, k)| k)
    }

    /// What the controller reported about itself
    #[must_use]
    pub fn local_info(&self) -> &LocalDeviceInfo {
        &self.info
    }

    /// ACL payload bytes the controller accepts per packet
    #[must_use]
    pub fn acl_mtu(&self) -> u16 {
        self.acl_mtu
    }

    /// ACL packets the controller can still buffer
    #[must_use]
    pub fn acl_credits(&self) -> u16 {
        self.acl_max_pkt
    }

    /// SCO payload bytes and buffer count reported by the controller
    #[must_use]
    pub fn sco_buffers(&self) -> (u8, u16) {
        (self.sco_mtu, self.sco_max_pkt)
    }

    /// Packet types offered when creating a connection
    #[must_use]
    pub fn packet_types(&self) -> u16 {
        self.pkt_type
    }

    /// Commands the controller can accept right now
    #[must_use]
    pub fn command_credits(&self) -> u8 {
        self.num_cmd
    }

    /// Whether controller-to-host flow control is on
    #[must_use]
    pub fn flow_control(&self) -> bool {
        self.flow
    }

    /// ACL packets the host still accepts before returning credits
    #[must_use]
    pub fn host_acl_credits(&self) -> u16 {
        self.host_num_acl
    }

    fn page_params(&self, addr: &BluetoothAddress) -> (u8, u8, u16) {
        self.inquiry_results
            .iter()
            .map(|(_, r)| r)
            .find(|r| r.addr == *addr)
            .map_or((DEFAULT_PAGE_SCAN_REPETITION_MODE, 0, 0), |r| {
                (r.psrm, r.psm, r.clock_offset)
            })
    }

    fn apply_features(&mut self, features: [u8; 8]) {
        if features[0] & LMP_3SLOT != 0 {
            self.pkt_type |= packet_type::DM3 | packet_type::DH3;
        }
        if features[0] & LMP_5SLOT != 0 {
            self.pkt_type |= packet_type::DM5 | packet_type::DH5;
        }
        if features[1] & LMP_HV2 != 0 {
            self.pkt_type |= packet_type::HV2;
        }
        if features[1] & LMP_HV3 != 0 {
            self.pkt_type |= packet_type::HV3;
        }
        self.info.local_features = Some(features);
    }
}

impl Default for Hci {
    fn default() -> Self {
        Self::new()
    }
}

fn le16(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes([*bytes.get(at)?, *bytes.get(at + 1)?]))
}

impl<B: PhysBus> Stack<B> {
    /// Feed one HCI event packet (`[code][length][parameters]`) into the stack
    ///
    /// # Errors
    /// Returns an error if the packet is truncated; the event is dropped then
    pub fn hci_event_input(&mut self, packet: &[u8]) -> Result<(), BluetoothError> {
        let event = HciEvent::from_bytes(packet).inspect_err(|_| {
            warn!("hci: dropping truncated event ({} bytes)", packet.len());
        })?;
        self.hci_event_handler(event);
        Ok(())
    }

    fn hci_event_handler(&mut self, event: HciEvent<'_>) {
        match event {
            HciEvent::InquiryComplete { status } => self.inquiry_complete(status),
            HciEvent::InquiryResult(records) => {
                for record in records {
                    if self.hci.inquiry_results.alloc(record).is_none() {
                        error!("hci: could not store inquiry result for {}", record.addr);
                    }
                }
            }
            HciEvent::ConnectionComplete {
                status,
                handle,
                addr,
                encryption_mode,
                ..
            } => self.connection_complete(status, handle, addr, encryption_mode),
            HciEvent::ConnectionRequest {
                addr,
                class_of_device,
                link_type,
            } => self.connection_request(addr, class_of_device, link_type),
            HciEvent::DisconnectionComplete {
                status,
                handle,
                reason,
            } => {
                if status != status::SUCCESS {
                    return;
                }
                let Some(id) = self.hci.link_id_by_handle(handle) else {
                    warn!("hci: disconnection complete for unknown handle {}", handle);
                    return;
                };
                if let Some(addr) = self.hci.links.get(id).map(|l| l.addr) {
                    self.lp_disconnect_ind(addr, reason);
                }
                self.hci_close(id);
            }
            HciEvent::CommandComplete {
                num_cmd,
                opcode,
                params,
            } => {
                self.hci.num_cmd = self.hci.num_cmd.saturating_add(num_cmd);
                let status = params.first().copied().unwrap_or(status::SUCCESS);
                if status == status::SUCCESS {
                    self.command_complete_params(opcode, params);
                }
                self.command_complete(opcode, status);
            }
            HciEvent::CommandStatus {
                status,
                num_cmd,
                opcode,
            } => {
                if status != status::SUCCESS {
                    debug!("hci: command {} failed with status {}", opcode, status);
                    self.command_complete(opcode, status);
                }
                self.hci.num_cmd = self.hci.num_cmd.saturating_add(num_cmd);
            }
            HciEvent::HardwareError { code } => {
                error!("hci: hardware error {}", code);
            }
            HciEvent::NumberOfCompletedPackets(entries) => {
                for entry in entries {
                    self.hci.acl_max_pkt = self.hci.acl_max_pkt.saturating_add(entry.count);
                    self.flush_pending_acl(entry.handle);
                }
            }
            HciEvent::ModeChange {
                status,
                handle,
                mode,
                interval,
            } => {
                debug!(
                    "hci: mode change status {} handle {} mode {} interval {}",
                    status, handle, mode, interval
                );
            }
            HciEvent::ReturnLinkKeys(records) => {
                for record in records {
                    if self.hci.link_keys.alloc(record.into()).is_none() {
                        error!("hci: could not store link key for {}", record.addr);
                    }
                }
            }
            HciEvent::PinCodeRequest { addr } => {
                if self.hci.hooks.pin_code_request {
                    self.emit(StackEvent::PinCodeRequest { addr });
                } else if self.pin_code_request_negative_reply(addr).is_err() {
                    error!("hci: could not refuse PIN request from {}", addr);
                }
            }
            HciEvent::LinkKeyRequest { addr } => {
                if self.hci.hooks.link_key_request {
                    self.emit(StackEvent::LinkKeyRequest { addr });
                } else if self.link_key_request_negative_reply(addr).is_err() {
                    error!("hci: could not refuse link key request from {}", addr);
                }
            }
            HciEvent::LinkKeyNotification { addr, key, .. } => {
                self.emit(StackEvent::LinkKeyNotification { addr, key });
            }
            HciEvent::Ignored { code } => match code {
                event::code::DATA_BUFFER_OVERFLOW => {
                    warn!("hci: controller ACL buffer overflow");
                }
                event::code::ROLE_CHANGE
                | event::code::MAX_SLOTS_CHANGE
                | event::code::QOS_SETUP_COMPLETE => {
                    debug!("hci: link change event {}", code);
                }
                _ => trace!("hci: ignoring event {}", code),
            },
        }
    }

    fn command_complete_params(&mut self, opcode: Opcode, params: &[u8]) {
        match opcode {
            opcode::READ_LOCAL_VERSION => {
                if params.len() < 9 {
                    return;
                }
                let info = &mut self.hci.info;
                info.hci_version = Some(params[1]);
                info.hci_revision = le16(params, 2);
                info.lmp_version = Some(params[4]);
                info.manufacturer_name = le16(params, 5);
                info.lmp_subversion = le16(params, 7);
            }
            opcode::READ_LOCAL_FEATURES => {
                let Some(raw) = params.get(1..9) else {
                    return;
                };
                let mut features = [0u8; 8];
                features.copy_from_slice(raw);
                self.hci.apply_features(features);
            }
            opcode::READ_BUFFER_SIZE => {
                if params.len() < 8 {
                    return;
                }
                let hci = &mut self.hci;
                hci.acl_mtu = le16(params, 1).unwrap_or(0);
                hci.sco_mtu = params[3];
                hci.acl_max_pkt = le16(params, 4).unwrap_or(0);
                hci.sco_max_pkt = le16(params, 6).unwrap_or(0);
                hci.info.acl_data_packet_length = Some(hci.acl_mtu);
                hci.info.sco_data_packet_length = Some(hci.sco_mtu);
                hci.info.total_num_acl_data_packets = Some(hci.acl_max_pkt);
                hci.info.total_num_sco_data_packets = Some(hci.sco_max_pkt);
                debug!(
                    "hci: acl mtu {} credits {}",
                    hci.acl_mtu, hci.acl_max_pkt
                );
            }
            opcode::READ_BD_ADDR => {
                if let Ok(addr) = BluetoothAddress::read_from(params, 1) {
                    info!("hci: local address {}", addr);
                    self.hci.info.bd_addr = Some(addr);
                }
            }
            opcode::SET_CONTROLLER_TO_HOST_FLOW_CONTROL => {
                self.hci.flow = true;
            }
            opcode::READ_CURRENT_IAC_LAP => {
                let count = params.get(1).copied().unwrap_or(0);
                let laps = params.get(2..).unwrap_or(&[]).chunks_exact(3);
                for lap in laps.take(usize::from(count)) {
                    debug!("hci: current IAC LAP {} {} {}", lap[2], lap[1], lap[0]);
                }
            }
            opcode::WRITE_LINK_POLICY_SETTINGS => {
                let Some(handle) = le16(params, 1) else {
                    return;
                };
                let Some(id) = self.hci.link_id_by_handle(handle) else {
                    warn!("hci: link policy written for unknown handle {}", handle);
                    return;
                };
                if let Some(link) = self.hci.links.get_mut(id) {
                    link.policy = link.requested_policy;
                    let addr = link.addr;
                    self.emit(StackEvent::LinkPolicyWritten { addr });
                }
            }
            _ => {}
        }
    }

    fn connection_request(
        &mut self,
        addr: BluetoothAddress,
        class_of_device: [u8; 3],
        link_type: u8,
    ) {
        self.emit(StackEvent::ConnectionRequest {
            addr,
            class_of_device,
            link_type,
        });
        if !self.options.accept_connections {
            if self
                .reject_connection_request(addr, status::CONNECTION_REJECTED_BD_ADDR)
                .is_err()
            {
                error!("hci: could not reject connection from {}", addr);
            }
            return;
        }
        if self.hci.link_id(&addr).is_none() && self.hci.links.alloc(HciLink::new(addr)).is_none()
        {
            error!("hci: no free link for incoming connection from {}", addr);
            return;
        }
        if self.accept_connection_request(addr, 0x00).is_err() {
            error!("hci: could not accept connection from {}", addr);
        }
    }

    fn connection_complete(
        &mut self,
        status: u8,
        handle: u16,
        addr: BluetoothAddress,
        encryption_mode: u8,
    ) {
        let existing = self.hci.link_id(&addr);
        match status {
            status::SUCCESS => {
                let outgoing = existing.is_some();
                let id = match existing {
                    Some(id) => id,
                    None => {
                        let Some(id) = self.hci.links.alloc(HciLink::new(addr)) else {
                            error!("hci: no free link for {}", addr);
                            self.lp_disconnect_ind(addr, status::LOCAL_HOST_TERMINATED);
                            return;
                        };
                        id
                    }
                };
                if let Some(link) = self.hci.links.get_mut(id) {
                    link.handle = handle;
                }
                info!("hci: connected to {} handle {}", addr, handle);
                self.emit(StackEvent::AclConnected { addr, handle });
                if outgoing {
                    self.lp_connect_cfm(addr, encryption_mode, Ok(()));
                } else {
                    self.lp_connect_ind(addr);
                }
            }
            _ => {
                if status == status::PAGE_TIMEOUT {
                    debug!("hci: page timeout connecting to {}", addr);
                } else {
                    warn!("hci: connection to {} failed with status {}", addr, status);
                }
                if let Some(id) = existing {
                    self.hci_close(id);
                    let error = if status == status::PAGE_TIMEOUT {
                        BluetoothError::Timeout
                    } else {
                        BluetoothError::Connection
                    };
                    self.lp_connect_cfm(addr, encryption_mode, Err(error));
                }
            }
        }
    }

    /// Release a link and any ACL chain parked on it
    pub(crate) fn hci_close(&mut self, id: BlockId) {
        if let Some(pending) = self.hci.links.release(id).and_then(|l| l.pending) {
            self.pbufs.free(pending.p);
        }
    }

    fn flush_pending_acl(&mut self, handle: u16) {
        let Some(id) = self.hci.link_id_by_handle(handle) else {
            return;
        };
        let Some((addr, pending)) = self
            .hci
            .links
            .get_mut(id)
            .and_then(|l| l.pending.take().map(|p| (l.addr, p)))
        else {
            return;
        };
        if self
            .lp_acl_write(addr, pending.p, pending.offset, pending.len, pending.pb)
            .is_err()
        {
            warn!("hci: could not send parked ACL data to {}", addr);
        }
        self.pbufs.free(pending.p);
    }

    /// Feed one inbound ACL packet (`[handle|flags][length][data]`) into the stack
    ///
    /// # Errors
    /// Returns `OutOfMemory` if the packet cannot be buffered, `InvalidParameter` if it is too long
    pub fn acl_input(&mut self, packet: &[u8]) -> Result<(), BluetoothError> {
        let len = u16::try_from(packet.len()).map_err(|_| BluetoothError::InvalidParameter)?;
        let Some(p) = self.pbufs.alloc(PbufLayer::Raw, len, PbufKind::Pool) else {
            error!("hci: no buffer for {} bytes of ACL data", len);
            return Err(BluetoothError::OutOfMemory);
        };
        if let Err(e) = self.pbufs.copy_in(p, 0, packet) {
            self.pbufs.free(p);
            return Err(e);
        }
        self.hci_acldata_handler(p);
        Ok(())
    }

    /// Strip the ACL header of a received packet and hand it to L2CAP
    ///
    /// Takes over the reference on `p`.
    pub(crate) fn hci_acldata_handler(&mut self, p: PbufId) {
        let Some(raw) = self.pbufs.read_u16_le(p, 0) else {
            self.pbufs.free(p);
            return;
        };
        let handle = raw & 0x0FFF;
        #[allow(clippy::cast_possible_truncation)]
        let pb = ((raw >> 12) & 0x03) as u8;
        let len = self.pbufs.read_u16_le(p, 2).unwrap_or(0);

        if self.hci.flow {
            self.hci.host_num_acl = self.hci.host_num_acl.saturating_sub(1);
            if self.hci.host_num_acl == 0
                && self
                    .host_num_completed_packets(handle, HCI_HOST_MAX_NUM_ACL)
                    .is_err()
            {
                error!("hci: could not return host ACL credits");
            }
        }

        let addr = self
            .hci
            .link_id_by_handle(handle)
            .and_then(|id| self.hci.links.get(id))
            .map(|l| l.addr);
        #[allow(clippy::cast_possible_truncation)]
        let stripped = self.pbufs.header(p, -(ACL_IN_HDR_LEN as i16));
        match addr {
            Some(addr) if len != 0 && stripped.is_ok() => {
                self.pbufs.realloc(p, len);
                self.l2cap_input(p, addr, pb);
            }
            Some(_) => {
                self.pbufs.free(p);
            }
            None => {
                warn!("hci: ACL data for unknown handle {}", handle);
                self.pbufs.free(p);
            }
        }
    }

    /// Send `len` bytes of chain `p`, starting `offset` bytes in, as one ACL packet
    ///
    /// Without a controller credit the fragment is parked on the link until the
    /// next Number Of Completed Packets event; a link holds at most one parked
    /// fragment and further ones are dropped.
    ///
    /// # Errors
    /// Returns `Connection` when there is no link to `addr`, `Busy` when the
    /// fragment was dropped because another one is parked, `OutOfMemory` if the
    /// header cannot be allocated, or the bus error
    pub fn lp_acl_write(
        &mut self,
        addr: BluetoothAddress,
        p: PbufId,
        offset: usize,
        len: usize,
        pb: u8,
    ) -> Result<(), BluetoothError> {
        let Some(id) = self.hci.link_id(&addr) else {
            warn!("hci: no link to {} for ACL data", addr);
            return Err(BluetoothError::Connection);
        };
        let handle = self.hci.links.get(id).map_or(0, |l| l.handle);

        if self.hci.acl_max_pkt == 0 {
            if self.hci.links.get(id).is_some_and(|l| l.pending.is_some()) {
                warn!("hci: link to {} already holds parked ACL data, dropping", addr);
                return Err(BluetoothError::Busy);
            }
            self.pbufs.inc_ref(p);
            let Some(q) = self.pbufs.take(p) else {
                return Err(BluetoothError::OutOfMemory);
            };
            if let Some(link) = self.hci.links.get_mut(id) {
                link.pending = Some(PendingAcl {
                    p: q,
                    offset,
                    len,
                    pb,
                });
            }
            debug!("hci: no ACL credits, parking {} bytes for {}", len, addr);
            return Ok(());
        }

        let data_len = u16::try_from(len).map_err(|_| BluetoothError::InvalidParameter)?;
        #[allow(clippy::cast_possible_truncation)]
        let Some(hdr) = self
            .pbufs
            .alloc(PbufLayer::Raw, HCI_ACL_HDR_LEN as u16, PbufKind::Ram)
        else {
            error!("hci: could not allocate ACL header");
            return Err(BluetoothError::OutOfMemory);
        };
        let flags = (handle & 0x0FFF) | (u16::from(pb & 0x03) << 12);
        let [f0, f1] = flags.to_le_bytes();
        let [l0, l1] = data_len.to_le_bytes();
        let result = self
            .pbufs
            .copy_in(hdr, 0, &[HCI_ACL_DATA_PACKET, f0, f1, l0, l1])
            .and_then(|()| {
                self.bus.output(Frame::new(
                    self.pbufs.segments(hdr),
                    self.pbufs.segments_range(p, offset, len),
                    HCI_ACL_HDR_LEN + len,
                ))
            });
        if result.is_ok() {
            self.hci.acl_max_pkt = self.hci.acl_max_pkt.saturating_sub(1);
        }
        self.pbufs.free(hdr);
        result
    }

    /// Whether an ACL link to `addr` exists
    #[must_use]
    pub fn lp_is_connected(&self, addr: &BluetoothAddress) -> bool {
        self.hci.link_id(addr).is_some()
    }

    /// Largest ACL payload per packet
    #[must_use]
    pub fn lp_pdu_maxsize(&self) -> u16 {
        self.hci.acl_mtu
    }

    /// Create a link to `addr` and page it
    ///
    /// The page scan parameters come from the last inquiry when `addr` answered it.
    ///
    /// # Errors
    /// Returns `OutOfMemory` when no link is free, or the command error
    pub fn lp_connect_req(
        &mut self,
        addr: BluetoothAddress,
        allow_role_switch: u8,
    ) -> Result<(), BluetoothError> {
        if self.hci.link_id(&addr).is_none() && self.hci.links.alloc(HciLink::new(addr)).is_none()
        {
            error!("hci: no free link to connect to {}", addr);
            return Err(BluetoothError::OutOfMemory);
        }
        self.create_connection(addr, allow_role_switch)
    }

    /// Write the automatic flush timeout of the link to `addr`
    ///
    /// # Errors
    /// Returns `Connection` when there is no link to `addr`
    pub fn lp_write_flush_timeout(
        &mut self,
        addr: BluetoothAddress,
        flush_timeout: u16,
    ) -> Result<(), BluetoothError> {
        let handle = self.link_handle(&addr)?;
        let [h0, h1] = handle.to_le_bytes();
        let [t0, t1] = flush_timeout.to_le_bytes();
        self.send_command(opcode::WRITE_AUTOMATIC_FLUSH_TIMEOUT, &[h0, h1, t0, t1])
    }

    pub(crate) fn link_handle(&self, addr: &BluetoothAddress) -> Result<u16, BluetoothError> {
        self.hci.link(addr).map(|l| l.handle).ok_or_else(|| {
            warn!("hci: no link to {}", addr);
            BluetoothError::Connection
        })
    }

    /// Add a device to the inquiry results by hand
    ///
    /// # Errors
    /// Returns `OutOfMemory` when the result table is full
    pub fn register_device_info(
        &mut self,
        addr: BluetoothAddress,
        class_of_device: [u8; 3],
        psrm: u8,
        psm: u8,
        clock_offset: u16,
    ) -> Result<(), BluetoothError> {
        self.hci
            .inquiry_results
            .alloc(InquiryRecord {
                addr,
                psrm,
                psm,
                class_of_device,
                clock_offset,
            })
            .map(|_| ())
            .ok_or(BluetoothError::OutOfMemory)
    }

    /// Choose which security requests are forwarded as events
    pub fn set_hooks(&mut self, hooks: HciHooks) {
        self.hci.hooks = hooks;
    }
}
