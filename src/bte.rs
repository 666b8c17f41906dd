//! HID devices over L2CAP
//!
//! [`Bte`] sits beside a [`Stack`] and consumes the events of the channels it
//! owns. Each registered device listens on the HID control and interrupt
//! PSMs; once the peer has opened both, the device is connected. Output
//! reports go out on the interrupt channel, SET_REPORT requests on the
//! control channel one at a time, each acknowledged by a handshake. Input
//! reports come back as [`BteEvent::Report`].
//!
//! Feed every [`StackEvent`] through [`Bte::process`]; events for other
//! channels are handed back untouched.

use crate::constants::{BTE_EVENT_QUEUE_LEN, BTE_REPORT_LEN, MEMB_NUM_BTE_CTRLS, MEMB_NUM_BTE_PCB};
use crate::hci::status;
use crate::l2cap::{ChannelHandle, ListenerHandle, psm};
use crate::memb::{BlockId, Memb};
use crate::pbuf::{PbufId, PbufKind, PbufLayer};
use crate::stack::{Stack, StackEvent};
use crate::transport::PhysBus;
use crate::{BluetoothAddress, BluetoothError};
use heapless::{Deque, Vec};

/// HID transport protocol header values
///
/// The transaction type is in the high nibble, its parameter in the low one.
pub mod hidp {
    /// Transaction type bits
    pub const TRANS_MASK: u8 = 0xF0;
    /// Parameter bits
    pub const PARAM_MASK: u8 = 0x0F;

    /// Transaction types
    pub mod trans {
        /// Handshake, answering a control request
        pub const HANDSHAKE: u8 = 0x00;
        /// HID control
        pub const HID_CONTROL: u8 = 0x10;
        /// Set report
        pub const SET_REPORT: u8 = 0x50;
        /// Data
        pub const DATA: u8 = 0xA0;
    }

    /// Report types
    pub mod report {
        /// Other
        pub const OTHER: u8 = 0x00;
        /// Input, device to host
        pub const INPUT: u8 = 0x01;
        /// Output, host to device
        pub const OUTPUT: u8 = 0x02;
        /// Feature
        pub const FEATURE: u8 = 0x03;
    }

    /// Handshake results
    pub mod handshake {
        /// Request accepted
        pub const SUCCESSFUL: u8 = 0x00;
        /// Device not ready
        pub const NOT_READY: u8 = 0x01;
        /// Invalid report ID
        pub const ERR_INVALID_REPORT_ID: u8 = 0x02;
        /// Unsupported request
        pub const ERR_UNSUPPORTED_REQUEST: u8 = 0x03;
        /// Invalid parameter
        pub const ERR_INVALID_PARAMETER: u8 = 0x04;
        /// Unknown error
        pub const ERR_UNKNOWN: u8 = 0x0E;
        /// Fatal error
        pub const ERR_FATAL: u8 = 0x0F;
    }
}

/// Link policy written when an ACL link comes up: role switch and sniff mode
pub const LINK_POLICY_ROLE_SWITCH_SNIFF: u16 = 0x0005;

/// Marks channel tags assigned by [`Bte`]
const TAG_FLAG: usize = 1 << (usize::BITS - 1);

/// State of a device or of a control request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BteState {
    /// Allocated, not registered
    NotReady,
    /// Waiting to be sent
    Ready,
    /// Listening for the peer
    Connecting,
    /// Both channels open
    Connected,
    /// Channels being torn down
    Disconnecting,
    /// Both channels gone
    Disconnected,
    /// Request sent, waiting for the handshake
    Sending,
    /// Request acknowledged
    Sent,
    /// Request could not be sent
    Failed,
}

/// Handle of a HID device, invalid once the device is removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceHandle {
    slot: BlockId,
    serial: u16,
}

/// One HID device control block
#[derive(Debug)]
pub struct HidDevice {
    serial: u16,
    /// Current state
    pub state: BteState,
    /// Peer device
    pub addr: BluetoothAddress,
    /// Tag handed back in every event for this device
    pub arg: usize,
    ctl: Option<ChannelHandle>,
    data: Option<ChannelHandle>,
    listeners: [Option<ListenerHandle>; 2],
    queue: Deque<BlockId, MEMB_NUM_BTE_CTRLS>,
}

impl HidDevice {
    fn new(serial: u16) -> Self {
        Self {
            serial,
            state: BteState::NotReady,
            addr: BluetoothAddress::ANY,
            arg: 0,
            ctl: None,
            data: None,
            listeners: [None, None],
            queue: Deque::new(),
        }
    }

    fn tag(&self) -> usize {
        TAG_FLAG | usize::from(self.serial)
    }

    fn is_closed(&self) -> bool {
        matches!(self.state, BteState::Disconnecting | BteState::Disconnected)
    }

    /// Control channel, once accepted
    #[must_use]
    pub fn control_channel(&self) -> Option<ChannelHandle> {
        self.ctl
    }

    /// Interrupt channel, once accepted
    #[must_use]
    pub fn interrupt_channel(&self) -> Option<ChannelHandle> {
        self.data
    }

    /// Control requests queued or in flight
    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.queue.len()
    }
}

#[derive(Debug)]
struct CtrlRequest {
    state: BteState,
    p: Option<PbufId>,
}

/// Notification from [`Bte`] to the application
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BteEvent {
    /// Both channels are open, or accepting one of them failed
    Connected {
        /// The device
        device: DeviceHandle,
        /// Device tag
        arg: usize,
        /// Outcome
        result: Result<(), BluetoothError>,
    },
    /// An input report arrived
    Report {
        /// The device
        device: DeviceHandle,
        /// Device tag
        arg: usize,
        /// Report payload without the transaction header
        data: Vec<u8, BTE_REPORT_LEN>,
    },
    /// A control request was acknowledged, failed, or dropped on close
    MessageComplete {
        /// The device
        device: DeviceHandle,
        /// Device tag
        arg: usize,
        /// Outcome
        result: Result<(), BluetoothError>,
    },
    /// Both channels are gone
    Disconnected {
        /// The device
        device: DeviceHandle,
        /// Device tag
        arg: usize,
    },
}

/// HID device table
#[derive(Debug)]
pub struct Bte {
    devices: Memb<HidDevice, MEMB_NUM_BTE_PCB>,
    requests: Memb<CtrlRequest, MEMB_NUM_BTE_CTRLS>,
    events: Deque<BteEvent, BTE_EVENT_QUEUE_LEN>,
    serial: u16,
}

impl Default for Bte {
    fn default() -> Self {
        Self::new()
    }
}

impl Bte {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self {
            devices: Memb::new(),
            requests: Memb::new(),
            events: Deque::new(),
            serial: 0,
        }
    }

    /// Allocate a device in state `NotReady`
    ///
    /// # Errors
    /// Returns `OutOfMemory` when every device block is in use
    pub fn new_device(&mut self) -> Result<DeviceHandle, BluetoothError> {
        self.serial = self.serial.wrapping_add(1);
        let serial = self.serial;
        let slot = self.devices.alloc(HidDevice::new(serial)).ok_or_else(|| {
            error!("bte: could not allocate device");
            BluetoothError::OutOfMemory
        })?;
        Ok(DeviceHandle { slot, serial })
    }

    /// Set the tag reported with every event of this device
    ///
    /// # Errors
    /// Returns `InvalidParameter` for a stale handle
    pub fn set_arg(&mut self, device: DeviceHandle, arg: usize) -> Result<(), BluetoothError> {
        let slot = self.resolve(device)?;
        if let Some(dev) = self.devices.get_mut(slot) {
            dev.arg = arg;
        }
        Ok(())
    }

    /// Control block of a device
    #[must_use]
    pub fn device(&self, device: DeviceHandle) -> Option<&HidDevice> {
        self.devices
            .get(device.slot)
            .filter(|d| d.serial == device.serial)
    }

    /// State of a device
    ///
    /// # Errors
    /// Returns `InvalidParameter` for a stale handle
    pub fn state(&self, device: DeviceHandle) -> Result<BteState, BluetoothError> {
        self.device(device)
            .map(|d| d.state)
            .ok_or(BluetoothError::InvalidParameter)
    }

    /// State of the control request at the head of the queue
    ///
    /// `Sending` while it waits for the handshake, `Ready` before it went out.
    #[must_use]
    pub fn message_state(&self, device: DeviceHandle) -> Option<BteState> {
        let head = self.device(device)?.queue.front().copied()?;
        self.requests.get(head).map(|r| r.state)
    }

    /// Next pending notification
    pub fn poll_event(&mut self) -> Option<BteEvent> {
        self.events.pop_front()
    }

    fn resolve(&self, device: DeviceHandle) -> Result<BlockId, BluetoothError> {
        self.device(device)
            .map(|_| device.slot)
            .ok_or(BluetoothError::InvalidParameter)
    }

    fn handle(&self, slot: BlockId) -> Option<(DeviceHandle, usize)> {
        self.devices.get(slot).map(|d| {
            (
                DeviceHandle {
                    slot,
                    serial: d.serial,
                },
                d.arg,
            )
        })
    }

    fn by_tag(&self, arg: usize) -> Option<BlockId> {
        if arg & TAG_FLAG == 0 {
            return None;
        }
        self.devices.find(|d| d.tag() == arg)
    }

    fn emit(&mut self, event: BteEvent) {
        if self.events.push_back(event).is_err() {
            error!("bte: event queue full, dropping event");
        }
    }

    fn complete(&mut self, slot: BlockId, result: Result<(), BluetoothError>) {
        if let Some((device, arg)) = self.handle(slot) {
            self.emit(BteEvent::MessageComplete {
                device,
                arg,
                result,
            });
        }
    }

    /// Listen for `addr` on the HID control and interrupt PSMs
    ///
    /// # Errors
    /// Returns `InvalidParameter` for a stale handle, or the allocation
    /// error; listeners registered before the failure are removed again
    pub fn register_device<B: PhysBus>(
        &mut self,
        stack: &mut Stack<B>,
        device: DeviceHandle,
        addr: BluetoothAddress,
    ) -> Result<(), BluetoothError> {
        let slot = self.resolve(device)?;
        let tag = self.devices.get(slot).map_or(0, HidDevice::tag);
        let mut listeners = [None, None];
        let psms = [psm::HID_CONTROL, psm::HID_INTERRUPT];
        for (i, target) in psms.into_iter().enumerate() {
            match Self::listen(stack, tag, addr, target) {
                Ok(listener) => listeners[i] = Some(listener),
                Err(e) => {
                    for listener in listeners.into_iter().flatten() {
                        let _ = stack.l2cap_listen_close(listener);
                    }
                    return Err(e);
                }
            }
        }
        if let Some(dev) = self.devices.get_mut(slot) {
            for listener in dev.listeners.iter_mut().filter_map(Option::take) {
                let _ = stack.l2cap_listen_close(listener);
            }
            dev.listeners = listeners;
            dev.addr = addr;
            dev.state = BteState::Connecting;
        }
        info!("bte: waiting for {}", addr);
        Ok(())
    }

    fn listen<B: PhysBus>(
        stack: &mut Stack<B>,
        tag: usize,
        addr: BluetoothAddress,
        target: u16,
    ) -> Result<ListenerHandle, BluetoothError> {
        let channel = stack.l2cap_new()?;
        stack.l2cap_set_arg(channel, tag)?;
        stack.l2cap_listen(channel, addr, target).inspect_err(|_| {
            let _ = stack.l2cap_close(channel);
        })
    }

    /// Remove a device: its listeners and channels are closed without
    /// signaling and queued requests complete with `Closed`
    ///
    /// # Errors
    /// Returns `InvalidParameter` for a stale handle
    pub fn remove_device<B: PhysBus>(
        &mut self,
        stack: &mut Stack<B>,
        device: DeviceHandle,
    ) -> Result<(), BluetoothError> {
        let slot = self.resolve(device)?;
        self.close_queue(stack, slot);
        if let Some(dev) = self.devices.release(slot) {
            for listener in dev.listeners.into_iter().flatten() {
                let _ = stack.l2cap_listen_close(listener);
            }
            for channel in [dev.data, dev.ctl].into_iter().flatten() {
                let _ = stack.l2cap_close(channel);
            }
        }
        Ok(())
    }

    fn frame<B: PhysBus>(
        stack: &mut Stack<B>,
        header: u8,
        body: &[u8],
    ) -> Result<PbufId, BluetoothError> {
        let len = u16::try_from(body.len() + 1).map_err(|_| BluetoothError::InvalidParameter)?;
        let p = stack
            .pbufs_mut()
            .alloc(PbufLayer::Raw, len, PbufKind::Ram)
            .ok_or_else(|| {
                error!("bte: could not allocate {} byte report", len);
                BluetoothError::OutOfMemory
            })?;
        let written = stack
            .pbufs_mut()
            .copy_in(p, 0, &[header])
            .and_then(|()| stack.pbufs_mut().copy_in(p, 1, body));
        if let Err(e) = written {
            stack.pbufs_mut().free(p);
            return Err(e);
        }
        Ok(p)
    }

    /// Send an output report on the interrupt channel
    ///
    /// # Errors
    /// Returns `InvalidParameter` for an empty report, `Closed` while the
    /// device disconnects, `Connection` before the interrupt channel is open,
    /// or the write error
    pub fn send_data<B: PhysBus>(
        &mut self,
        stack: &mut Stack<B>,
        device: DeviceHandle,
        data: &[u8],
    ) -> Result<(), BluetoothError> {
        let slot = self.resolve(device)?;
        if data.is_empty() {
            return Err(BluetoothError::InvalidParameter);
        }
        let dev = self
            .devices
            .get(slot)
            .ok_or(BluetoothError::InvalidParameter)?;
        if dev.is_closed() {
            return Err(BluetoothError::Closed);
        }
        let channel = dev.data.ok_or(BluetoothError::Connection)?;
        let p = Self::frame(stack, hidp::trans::DATA | hidp::report::OUTPUT, data)?;
        let result = stack.l2ca_datawrite(channel, p);
        stack.pbufs_mut().free(p);
        result
    }

    /// Queue a SET_REPORT request on the control channel
    ///
    /// Requests are sent one at a time; each completes with
    /// [`BteEvent::MessageComplete`] once the device answers with a handshake.
    ///
    /// # Errors
    /// Returns `InvalidParameter` for an empty message, `Closed` while the
    /// device disconnects, `OutOfMemory` when the queue is full, or the
    /// write error when the request went out at once and failed
    pub fn send_message<B: PhysBus>(
        &mut self,
        stack: &mut Stack<B>,
        device: DeviceHandle,
        message: &[u8],
    ) -> Result<(), BluetoothError> {
        let slot = self.resolve(device)?;
        if message.is_empty() {
            return Err(BluetoothError::InvalidParameter);
        }
        if self.devices.get(slot).is_some_and(HidDevice::is_closed) {
            return Err(BluetoothError::Closed);
        }
        let p = Self::frame(stack, hidp::trans::SET_REPORT | hidp::report::OUTPUT, message)?;
        let Some(request) = self.requests.alloc(CtrlRequest {
            state: BteState::Ready,
            p: Some(p),
        }) else {
            error!("bte: could not allocate control request");
            stack.pbufs_mut().free(p);
            return Err(BluetoothError::OutOfMemory);
        };
        let Some(dev) = self.devices.get_mut(slot) else {
            return Err(BluetoothError::InvalidParameter);
        };
        let idle = dev.queue.is_empty();
        if dev.queue.push_back(request).is_err() {
            self.requests.release(request);
            stack.pbufs_mut().free(p);
            return Err(BluetoothError::OutOfMemory);
        }
        if idle {
            self.send_pending(stack, slot)
        } else {
            Ok(())
        }
    }

    /// Send the head of the control queue
    ///
    /// A request that cannot be sent completes as failed and the next one is
    /// tried. Returns the error of the first failure.
    fn send_pending<B: PhysBus>(
        &mut self,
        stack: &mut Stack<B>,
        slot: BlockId,
    ) -> Result<(), BluetoothError> {
        let mut first = Ok(());
        loop {
            let Some(dev) = self.devices.get(slot) else {
                return first;
            };
            let (ctl, Some(head)) = (dev.ctl, dev.queue.front().copied()) else {
                return first;
            };
            let Some(request) = self.requests.get_mut(head) else {
                return first;
            };
            request.state = BteState::Sending;
            let result = match (ctl, request.p.take()) {
                (Some(ctl), Some(p)) => {
                    let result = stack.l2ca_datawrite(ctl, p);
                    stack.pbufs_mut().free(p);
                    result
                }
                (None, Some(p)) => {
                    stack.pbufs_mut().free(p);
                    Err(BluetoothError::Connection)
                }
                (_, None) => Err(BluetoothError::InvalidParameter),
            };
            let Err(e) = result else {
                return first;
            };
            warn!("bte: control request failed: {}", e);
            if let Some(request) = self.requests.get_mut(head) {
                request.state = BteState::Failed;
            }
            if let Some(dev) = self.devices.get_mut(slot) {
                dev.queue.pop_front();
            }
            self.requests.release(head);
            self.complete(slot, Err(e));
            if first.is_ok() {
                first = Err(e);
            }
        }
    }

    fn close_queue<B: PhysBus>(&mut self, stack: &mut Stack<B>, slot: BlockId) {
        while let Some(head) = self.devices.get_mut(slot).and_then(|d| d.queue.pop_front()) {
            if let Some(p) = self.requests.release(head).and_then(|r| r.p) {
                stack.pbufs_mut().free(p);
            }
            self.complete(slot, Err(BluetoothError::Closed));
        }
    }

    /// Close the interrupt channel, then the control channel
    ///
    /// Ends with [`BteEvent::Disconnected`] and a baseband disconnect.
    ///
    /// # Errors
    /// Returns `Connection` when no channel is open, or the signaling error
    pub fn disconnect<B: PhysBus>(
        &mut self,
        stack: &mut Stack<B>,
        device: DeviceHandle,
    ) -> Result<(), BluetoothError> {
        let slot = self.resolve(device)?;
        let dev = self
            .devices
            .get_mut(slot)
            .ok_or(BluetoothError::InvalidParameter)?;
        let channel = dev.data.or(dev.ctl).ok_or(BluetoothError::Connection)?;
        dev.state = BteState::Disconnecting;
        debug!("bte: disconnecting {}", dev.addr);
        stack.l2ca_disconnect_req(channel)
    }

    /// Handle one stack event
    ///
    /// Events for channels this table owns are consumed. Everything else is
    /// returned, including the link events that also trigger the link policy
    /// and link key writes.
    pub fn process<B: PhysBus>(
        &mut self,
        stack: &mut Stack<B>,
        event: StackEvent,
    ) -> Option<StackEvent> {
        match event {
            StackEvent::AclConnected { addr, .. } => {
                if let Err(e) = stack.write_link_policy_settings(addr, LINK_POLICY_ROLE_SWITCH_SNIFF)
                {
                    warn!("bte: could not set link policy for {}: {}", addr, e);
                }
                Some(event)
            }
            StackEvent::LinkKeyNotification { addr, key } => {
                if let Err(e) = stack.write_stored_link_key(addr, &key) {
                    warn!("bte: could not store link key for {}: {}", addr, e);
                }
                Some(event)
            }
            StackEvent::ConnectIndication {
                channel,
                arg,
                result,
            } => {
                let Some(slot) = self.by_tag(arg) else {
                    return Some(event);
                };
                self.accepted(stack, slot, channel, result);
                None
            }
            StackEvent::Received { arg, pbuf, .. } => {
                let Some(slot) = self.by_tag(arg) else {
                    return Some(event);
                };
                self.input(stack, slot, pbuf);
                None
            }
            StackEvent::DisconnectIndication { channel, arg } => {
                let Some(slot) = self.by_tag(arg) else {
                    return Some(event);
                };
                self.disconnect_ind(stack, slot, channel);
                None
            }
            StackEvent::DisconnectConfirm { channel, arg } => {
                let Some(slot) = self.by_tag(arg) else {
                    return Some(event);
                };
                self.disconnect_cfm(stack, slot, channel);
                None
            }
            _ => Some(event),
        }
    }

    fn accepted<B: PhysBus>(
        &mut self,
        stack: &mut Stack<B>,
        slot: BlockId,
        channel: ChannelHandle,
        result: Result<(), BluetoothError>,
    ) {
        let Some((device, arg)) = self.handle(slot) else {
            return;
        };
        if let Err(e) = result {
            warn!("bte: accepting a channel failed: {}", e);
            self.emit(BteEvent::Connected {
                device,
                arg,
                result: Err(BluetoothError::Connection),
            });
            return;
        }
        let Ok(accepted_on) = stack.l2cap_channel(channel).map(|ch| ch.psm) else {
            return;
        };
        let Some(dev) = self.devices.get_mut(slot) else {
            return;
        };
        match accepted_on {
            psm::HID_CONTROL => dev.ctl = Some(channel),
            psm::HID_INTERRUPT => dev.data = Some(channel),
            other => {
                warn!("bte: unexpected psm {}", other);
                return;
            }
        }
        if dev.ctl.is_some() && dev.data.is_some() {
            dev.state = BteState::Connected;
            info!("bte: {} connected", dev.addr);
            self.emit(BteEvent::Connected {
                device,
                arg,
                result: Ok(()),
            });
        }
    }

    fn input<B: PhysBus>(&mut self, stack: &mut Stack<B>, slot: BlockId, p: PbufId) {
        self.dispatch_input(stack, slot, p);
        stack.pbufs_mut().free(p);
    }

    fn dispatch_input<B: PhysBus>(&mut self, stack: &mut Stack<B>, slot: BlockId, p: PbufId) {
        let Some(dev) = self.devices.get(slot) else {
            return;
        };
        if dev.is_closed() {
            debug!("bte: dropping input for closed device {}", dev.addr);
            return;
        }
        let Some(header) = stack.pbufs().read_u8(p, 0) else {
            return;
        };
        let param = header & hidp::PARAM_MASK;
        match header & hidp::TRANS_MASK {
            hidp::trans::HANDSHAKE => self.handshake(stack, slot, param),
            hidp::trans::DATA if param == hidp::report::INPUT => {
                let mut buf = [0u8; BTE_REPORT_LEN];
                let len = stack.pbufs().copy_out(p, 1, &mut buf);
                if usize::from(stack.pbufs().tot_len(p)) > len + 1 {
                    warn!("bte: input report cut to {} bytes", len);
                }
                let Some((device, arg)) = self.handle(slot) else {
                    return;
                };
                if let Ok(data) = Vec::from_slice(&buf[..len]) {
                    self.emit(BteEvent::Report { device, arg, data });
                }
            }
            other => trace!("bte: ignoring transaction {} param {}", other, param),
        }
    }

    fn handshake<B: PhysBus>(&mut self, stack: &mut Stack<B>, slot: BlockId, result: u8) {
        if result != hidp::handshake::SUCCESSFUL {
            debug!("bte: handshake result {}", result);
            return;
        }
        let Some(head) = self.devices.get_mut(slot).and_then(|d| d.queue.pop_front()) else {
            debug!("bte: handshake without a pending request");
            return;
        };
        if let Some(p) = self.requests.release(head).and_then(|r| r.p) {
            stack.pbufs_mut().free(p);
        }
        self.complete(slot, Ok(()));
        let _ = self.send_pending(stack, slot);
    }

    /// Forget `channel`; true once both channels are gone
    fn forget(&mut self, slot: BlockId, channel: ChannelHandle) -> Option<bool> {
        let dev = self.devices.get_mut(slot)?;
        if dev.data == Some(channel) {
            dev.data = None;
        } else if dev.ctl == Some(channel) {
            dev.ctl = None;
        } else {
            return None;
        }
        dev.state = BteState::Disconnecting;
        Some(dev.data.is_none() && dev.ctl.is_none())
    }

    /// Mark the device disconnected and report it, once
    fn finish<B: PhysBus>(&mut self, stack: &mut Stack<B>, slot: BlockId) -> bool {
        match self.devices.get_mut(slot) {
            Some(dev) if dev.state != BteState::Disconnected => {
                dev.state = BteState::Disconnected;
                info!("bte: {} disconnected", dev.addr);
            }
            _ => return false,
        }
        self.close_queue(stack, slot);
        if let Some((device, arg)) = self.handle(slot) {
            self.emit(BteEvent::Disconnected { device, arg });
        }
        true
    }

    fn disconnect_ind<B: PhysBus>(
        &mut self,
        stack: &mut Stack<B>,
        slot: BlockId,
        channel: ChannelHandle,
    ) {
        if self.forget(slot, channel) == Some(true) {
            self.finish(stack, slot);
        }
    }

    fn disconnect_cfm<B: PhysBus>(
        &mut self,
        stack: &mut Stack<B>,
        slot: BlockId,
        channel: ChannelHandle,
    ) {
        match self.forget(slot, channel) {
            Some(false) => {
                let remaining = self.devices.get(slot).and_then(|d| d.data.or(d.ctl));
                if let Some(remaining) = remaining {
                    if let Err(e) = stack.l2ca_disconnect_req(remaining) {
                        warn!("bte: could not close remaining channel: {}", e);
                    }
                }
            }
            Some(true) => {
                let Some(addr) = self.devices.get(slot).map(|d| d.addr) else {
                    return;
                };
                if !self.finish(stack, slot) {
                    return;
                }
                if let Err(e) = stack.disconnect(addr, status::REMOTE_USER_TERMINATED) {
                    warn!("bte: baseband disconnect of {} failed: {}", addr, e);
                }
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::hci::event::code;
    use crate::hci::opcode::{self, Opcode};
    use crate::l2cap::{L2capHeader, SignalingCode, cid};
    use crate::transport::testing::RecordingBus;
    use std::vec;
    use std::vec::Vec as StdVec;

    const PEER: BluetoothAddress = BluetoothAddress([1, 2, 3, 4, 5, 6]);
    const HANDLE: u16 = 0x0001;
    const PEER_CTL: u16 = 0x70;
    const PEER_DATA: u16 = 0x71;

    fn event(code: u8, params: &[u8]) -> StdVec<u8> {
        let mut packet = vec![code, params.len() as u8];
        packet.extend_from_slice(params);
        packet
    }

    fn pump(stack: &mut Stack<RecordingBus>, bte: &mut Bte) -> StdVec<StackEvent> {
        let mut passed = StdVec::new();
        while let Some(event) = stack.poll_event() {
            if let Some(event) = bte.process(stack, event) {
                passed.push(event);
            }
        }
        passed
    }

    fn bte_events(bte: &mut Bte) -> StdVec<BteEvent> {
        let mut events = StdVec::new();
        while let Some(event) = bte.poll_event() {
            events.push(event);
        }
        events
    }

    fn setup(bte: &mut Bte) -> Stack<RecordingBus> {
        let mut stack = Stack::new(RecordingBus::default());
        let [o0, o1] = opcode::READ_BUFFER_SIZE.to_bytes();
        stack
            .hci_event_input(&event(
                code::COMMAND_COMPLETE,
                &[1, o0, o1, 0x00, 0x53, 0x01, 0x40, 100, 0, 0x08, 0x00],
            ))
            .unwrap();
        let mut params = vec![0x00];
        params.extend_from_slice(&HANDLE.to_le_bytes());
        params.extend_from_slice(PEER.as_bytes());
        params.extend_from_slice(&[0x01, 0x00]);
        stack
            .hci_event_input(&event(code::CONNECTION_COMPLETE, &params))
            .unwrap();
        pump(&mut stack, bte);
        stack.bus.clear();
        stack
    }

    fn l2cap(stack: &mut Stack<RecordingBus>, cid: u16, payload: &[u8]) {
        let mut pdu = L2capHeader::new(payload.len() as u16, cid).to_bytes().to_vec();
        pdu.extend_from_slice(payload);
        let mut packet = StdVec::new();
        packet.extend_from_slice(&(HANDLE | 0x2000).to_le_bytes());
        packet.extend_from_slice(&(pdu.len() as u16).to_le_bytes());
        packet.extend_from_slice(&pdu);
        stack.acl_input(&packet).unwrap();
    }

    fn signal(stack: &mut Stack<RecordingBus>, code: SignalingCode, id: u8, words: &[u16]) {
        let data: StdVec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let mut command = vec![code as u8, id];
        command.extend_from_slice(&(data.len() as u16).to_le_bytes());
        command.extend_from_slice(&data);
        l2cap(stack, cid::SIGNALING, &command);
    }

    /// Last signal of `code` we sent, as `(id, data)`
    fn last_sent(stack: &Stack<RecordingBus>, code: SignalingCode) -> (u8, StdVec<u8>) {
        stack
            .bus
            .acl()
            .iter()
            .filter(|f| u16::from_le_bytes([f[7], f[8]]) == cid::SIGNALING && f[9] == code as u8)
            .map(|f| (f[10], f[13..].to_vec()))
            .last()
            .unwrap()
    }

    /// Payloads we sent on the channel the peer knows as `peer_cid`
    fn sent_on(stack: &Stack<RecordingBus>, peer_cid: u16) -> StdVec<StdVec<u8>> {
        stack
            .bus
            .acl()
            .iter()
            .filter(|f| u16::from_le_bytes([f[7], f[8]]) == peer_cid)
            .map(|f| f[9..].to_vec())
            .collect()
    }

    /// The peer opens and configures one channel
    fn peer_opens(stack: &mut Stack<RecordingBus>, psm: u16, peer_cid: u16, ours: u16, id: u8) {
        signal(stack, SignalingCode::ConnectionRequest, id, &[psm, peer_cid]);
        signal(stack, SignalingCode::ConfigurationRequest, id + 1, &[ours, 0]);
        let (req, _) = last_sent(stack, SignalingCode::ConfigurationRequest);
        signal(stack, SignalingCode::ConfigurationResponse, req, &[peer_cid, 0, 0]);
    }

    fn connected() -> (Stack<RecordingBus>, Bte, DeviceHandle) {
        let mut bte = Bte::new();
        let mut stack = setup(&mut bte);
        let device = bte.new_device().unwrap();
        bte.set_arg(device, 7).unwrap();
        bte.register_device(&mut stack, device, PEER).unwrap();
        peer_opens(&mut stack, psm::HID_CONTROL, PEER_CTL, 0x40, 10);
        peer_opens(&mut stack, psm::HID_INTERRUPT, PEER_DATA, 0x41, 20);
        assert!(pump(&mut stack, &mut bte).is_empty());
        assert_eq!(
            bte_events(&mut bte),
            [BteEvent::Connected {
                device,
                arg: 7,
                result: Ok(())
            }]
        );
        stack.bus.clear();
        (stack, bte, device)
    }

    #[test]
    fn test_acl_connection_writes_link_policy() {
        let mut bte = Bte::new();
        let mut stack = Stack::new(RecordingBus::default());
        let mut params = vec![0x00];
        params.extend_from_slice(&HANDLE.to_le_bytes());
        params.extend_from_slice(PEER.as_bytes());
        params.extend_from_slice(&[0x01, 0x00]);
        stack
            .hci_event_input(&event(code::CONNECTION_COMPLETE, &params))
            .unwrap();
        let passed = pump(&mut stack, &mut bte);
        assert!(matches!(passed[..], [StackEvent::AclConnected { addr: PEER, .. }]));

        let (ogf, ocf, params) = stack.bus.last_command().unwrap();
        assert_eq!(Opcode::new(ogf, ocf), opcode::WRITE_LINK_POLICY_SETTINGS);
        assert_eq!(params, [0x01, 0x00, 0x05, 0x00]);
    }

    #[test]
    fn test_link_key_notification_is_stored() {
        let mut bte = Bte::new();
        let mut stack = setup(&mut bte);
        let mut params = PEER.as_bytes().to_vec();
        params.extend_from_slice(&[0xAB; 16]);
        params.push(0x00);
        stack
            .hci_event_input(&event(code::LINK_KEY_NOTIFICATION, &params))
            .unwrap();
        pump(&mut stack, &mut bte);

        let (ogf, ocf, params) = stack.bus.last_command().unwrap();
        assert_eq!(Opcode::new(ogf, ocf), opcode::WRITE_STORED_LINK_KEY);
        assert_eq!(params[0], 0x01);
        assert_eq!(&params[1..7], PEER.as_bytes());
        assert_eq!(&params[7..], &[0xAB; 16]);
    }

    #[test]
    fn test_both_channels_connect_the_device() {
        let mut bte = Bte::new();
        let mut stack = setup(&mut bte);
        let device = bte.new_device().unwrap();
        assert_eq!(bte.state(device), Ok(BteState::NotReady));
        bte.register_device(&mut stack, device, PEER).unwrap();
        assert_eq!(bte.state(device), Ok(BteState::Connecting));
        assert_eq!(stack.l2cap().listeners().count(), 2);

        peer_opens(&mut stack, psm::HID_CONTROL, PEER_CTL, 0x40, 10);
        pump(&mut stack, &mut bte);
        assert_eq!(bte.state(device), Ok(BteState::Connecting));
        assert!(bte_events(&mut bte).is_empty());

        peer_opens(&mut stack, psm::HID_INTERRUPT, PEER_DATA, 0x41, 20);
        pump(&mut stack, &mut bte);
        assert_eq!(bte.state(device), Ok(BteState::Connected));
        let dev = bte.device(device).unwrap();
        assert!(dev.control_channel().is_some());
        assert!(dev.interrupt_channel().is_some());
    }

    #[test]
    fn test_foreign_channels_pass_through() {
        let (mut stack, mut bte, _) = connected();
        let listener = stack.l2cap_new().unwrap();
        stack.l2cap_set_arg(listener, 3).unwrap();
        stack.l2cap_listen(listener, BluetoothAddress::ANY, 0x01).unwrap();
        peer_opens(&mut stack, 0x01, 0x72, 0x42, 30);
        let passed = pump(&mut stack, &mut bte);
        assert!(matches!(
            passed[..],
            [StackEvent::ConnectIndication {
                arg: 3,
                result: Ok(()),
                ..
            }]
        ));
        assert!(bte_events(&mut bte).is_empty());
    }

    #[test]
    fn test_send_data_uses_interrupt_channel() {
        let (mut stack, mut bte, device) = connected();
        bte.send_data(&mut stack, device, &[0x11, 0x10]).unwrap();
        assert_eq!(sent_on(&stack, PEER_DATA), [vec![0xA2, 0x11, 0x10]]);
        assert_eq!(
            bte.send_data(&mut stack, device, &[]),
            Err(BluetoothError::InvalidParameter)
        );
        assert_eq!(stack.pbufs().descriptors_in_use(), 0);
    }

    #[test]
    fn test_messages_wait_for_handshake() {
        let (mut stack, mut bte, device) = connected();
        bte.send_message(&mut stack, device, &[0x15, 0x00]).unwrap();
        bte.send_message(&mut stack, device, &[0x11, 0x01]).unwrap();
        assert_eq!(sent_on(&stack, PEER_CTL), [vec![0x52, 0x15, 0x00]]);
        assert_eq!(bte.device(device).unwrap().pending_messages(), 2);
        assert_eq!(bte.message_state(device), Some(BteState::Sending));

        l2cap(&mut stack, 0x40, &[hidp::trans::HANDSHAKE | hidp::handshake::SUCCESSFUL]);
        pump(&mut stack, &mut bte);
        assert_eq!(
            sent_on(&stack, PEER_CTL),
            [vec![0x52, 0x15, 0x00], vec![0x52, 0x11, 0x01]]
        );
        assert_eq!(
            bte_events(&mut bte),
            [BteEvent::MessageComplete {
                device,
                arg: 7,
                result: Ok(())
            }]
        );

        l2cap(&mut stack, 0x40, &[hidp::trans::HANDSHAKE | hidp::handshake::NOT_READY]);
        pump(&mut stack, &mut bte);
        assert!(bte_events(&mut bte).is_empty());
        assert_eq!(bte.device(device).unwrap().pending_messages(), 1);
        assert_eq!(stack.pbufs().descriptors_in_use(), 0);
    }

    #[test]
    fn test_input_report_is_delivered() {
        let (mut stack, mut bte, device) = connected();
        l2cap(&mut stack, 0x41, &[0xA1, 0x30, 0x00, 0x08]);
        l2cap(&mut stack, 0x41, &[0xA3, 0x01]);
        assert!(pump(&mut stack, &mut bte).is_empty());
        assert_eq!(
            bte_events(&mut bte),
            [BteEvent::Report {
                device,
                arg: 7,
                data: Vec::from_slice(&[0x30, 0x00, 0x08]).unwrap()
            }]
        );
        assert_eq!(stack.pbufs().descriptors_in_use(), 0);
    }

    #[test]
    fn test_local_disconnect_closes_interrupt_then_control() {
        let (mut stack, mut bte, device) = connected();
        bte.send_message(&mut stack, device, &[0x15, 0x00]).unwrap();
        bte.send_message(&mut stack, device, &[0x11, 0x01]).unwrap();
        bte.disconnect(&mut stack, device).unwrap();
        assert_eq!(bte.state(device), Ok(BteState::Disconnecting));
        assert_eq!(
            bte.send_data(&mut stack, device, &[0x01]),
            Err(BluetoothError::Closed)
        );

        let (id, data) = last_sent(&stack, SignalingCode::DisconnectionRequest);
        assert_eq!(data[..2], PEER_DATA.to_le_bytes());
        signal(&mut stack, SignalingCode::DisconnectionResponse, id, &[PEER_DATA, 0x41]);
        pump(&mut stack, &mut bte);

        let (id, data) = last_sent(&stack, SignalingCode::DisconnectionRequest);
        assert_eq!(data[..2], PEER_CTL.to_le_bytes());
        assert!(stack.bus.commands().is_empty());
        signal(&mut stack, SignalingCode::DisconnectionResponse, id, &[PEER_CTL, 0x40]);
        pump(&mut stack, &mut bte);

        assert_eq!(bte.state(device), Ok(BteState::Disconnected));
        let closed = BteEvent::MessageComplete {
            device,
            arg: 7,
            result: Err(BluetoothError::Closed),
        };
        assert_eq!(
            bte_events(&mut bte),
            [
                closed.clone(),
                closed,
                BteEvent::Disconnected { device, arg: 7 }
            ]
        );
        let (ogf, ocf, params) = stack.bus.last_command().unwrap();
        assert_eq!(Opcode::new(ogf, ocf), opcode::DISCONNECT);
        assert_eq!(params, [0x01, 0x00, 0x13]);
        assert_eq!(stack.pbufs().descriptors_in_use(), 0);
    }

    #[test]
    fn test_peer_disconnect_reports_once() {
        let (mut stack, mut bte, device) = connected();
        signal(&mut stack, SignalingCode::DisconnectionRequest, 40, &[0x41, PEER_DATA]);
        pump(&mut stack, &mut bte);
        assert_eq!(bte.state(device), Ok(BteState::Disconnecting));
        assert!(bte_events(&mut bte).is_empty());

        l2cap(&mut stack, 0x40, &[0xA1, 0x30]);
        pump(&mut stack, &mut bte);
        assert!(bte_events(&mut bte).is_empty());

        signal(&mut stack, SignalingCode::DisconnectionRequest, 41, &[0x40, PEER_CTL]);
        pump(&mut stack, &mut bte);
        assert_eq!(
            bte_events(&mut bte),
            [BteEvent::Disconnected { device, arg: 7 }]
        );
        assert!(stack.bus.commands().is_empty());
        assert_eq!(stack.l2cap().channels().count(), 0);
    }

    #[test]
    fn test_remove_device_drops_listeners() {
        let mut bte = Bte::new();
        let mut stack = setup(&mut bte);
        let device = bte.new_device().unwrap();
        bte.register_device(&mut stack, device, PEER).unwrap();
        bte.remove_device(&mut stack, device).unwrap();
        assert_eq!(stack.l2cap().listeners().count(), 0);
        assert_eq!(bte.state(device), Err(BluetoothError::InvalidParameter));
        assert_eq!(
            bte.send_message(&mut stack, device, &[1]),
            Err(BluetoothError::InvalidParameter)
        );
    }
}
