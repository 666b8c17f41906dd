//! The stack context
//!
//! [`Stack`] owns every pool, the HCI device block, the L2CAP channel tables
//! and the queue of notifications for the embedder. All entry points (HCI
//! events, ACL data, the one-second tick and the upper-layer API) are methods
//! on it, so several independent stacks can live side by side.

use crate::constants::{EVENT_QUEUE_LEN, EVENT_QUEUE_RESERVE};
use crate::hci::Hci;
use crate::hci::opcode::Opcode;
use crate::hci::procedure::ProcedureKind;
use crate::l2cap::L2cap;
use crate::l2cap::channel::ChannelHandle;
use crate::pbuf::{PbufId, PbufPool};
use crate::transport::PhysBus;
use crate::{BluetoothAddress, BluetoothError, HostOptions};
use heapless::Deque;

/// Notification from the stack to the embedding application
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StackEvent {
    /// A command issued outside a procedure completed
    CommandComplete {
        /// Echoed opcode
        opcode: Opcode,
        /// Controller status
        status: u8,
    },
    /// A multi-step procedure finished
    ProcedureComplete {
        /// Which procedure
        kind: ProcedureKind,
        /// Outcome of the last step
        result: Result<(), BluetoothError>,
    },
    /// An inquiry finished, with the number of devices found
    InquiryComplete {
        /// Device count or the failure
        result: Result<usize, BluetoothError>,
    },
    /// A remote device asked for a baseband connection
    ConnectionRequest {
        /// Remote device
        addr: BluetoothAddress,
        /// Its class of device
        class_of_device: [u8; 3],
        /// Requested link type
        link_type: u8,
    },
    /// An ACL link came up
    AclConnected {
        /// Remote device
        addr: BluetoothAddress,
        /// Connection handle
        handle: u16,
    },
    /// The controller confirmed new link policy settings
    LinkPolicyWritten {
        /// Remote device
        addr: BluetoothAddress,
    },
    /// The controller wants a PIN code, answer with `pin_code_request_reply`
    PinCodeRequest {
        /// Remote device
        addr: BluetoothAddress,
    },
    /// The controller wants a link key, answer with `link_key_request_reply`
    LinkKeyRequest {
        /// Remote device
        addr: BluetoothAddress,
    },
    /// A new link key was created
    LinkKeyNotification {
        /// Remote device
        addr: BluetoothAddress,
        /// The key
        key: [u8; 16],
    },
    /// The ACL link went down, after every channel on it was indicated
    BasebandDisconnect {
        /// Remote device
        addr: BluetoothAddress,
        /// HCI reason code
        reason: u8,
    },
    /// A channel accepted from a listener is open, or failed to configure
    ConnectIndication {
        /// The new channel
        channel: ChannelHandle,
        /// Tag inherited from the listener
        arg: usize,
        /// `Ok` once open, `Timeout` if configuration never converged
        result: Result<(), BluetoothError>,
    },
    /// Outcome of a locally initiated connection
    ConnectConfirm {
        /// The channel
        channel: ChannelHandle,
        /// Channel tag
        arg: usize,
        /// L2CAP connection result
        result: u16,
        /// L2CAP connection status
        status: u16,
    },
    /// The channel is gone; its handle is no longer valid
    DisconnectIndication {
        /// The channel
        channel: ChannelHandle,
        /// Channel tag
        arg: usize,
    },
    /// A local disconnect completed; the handle is no longer valid
    DisconnectConfirm {
        /// The channel
        channel: ChannelHandle,
        /// Channel tag
        arg: usize,
    },
    /// A signal went unanswered and was sent again
    TimeoutIndication {
        /// The channel
        channel: ChannelHandle,
        /// Channel tag
        arg: usize,
    },
    /// Data arrived on an open channel; the receiver must free `pbuf`
    Received {
        /// The channel
        channel: ChannelHandle,
        /// Channel tag
        arg: usize,
        /// Payload without the L2CAP header
        pbuf: PbufId,
    },
    /// Answer to `l2ca_ping`
    Pong {
        /// The channel the echo was sent on
        channel: ChannelHandle,
        /// Channel tag
        arg: usize,
        /// Whether the echo came back
        result: Result<(), BluetoothError>,
    },
}

impl StackEvent {
    /// Whether the event ends a procedure or a channel or link lifetime
    ///
    /// These may use the reserved part of the event queue.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ProcedureComplete { .. }
                | Self::InquiryComplete { .. }
                | Self::BasebandDisconnect { .. }
                | Self::ConnectIndication { .. }
                | Self::ConnectConfirm { .. }
                | Self::DisconnectIndication { .. }
                | Self::DisconnectConfirm { .. }
                | Self::Pong { .. }
        )
    }
}

/// A complete Bluetooth host stack bound to one physical bus
#[derive(Debug)]
pub struct Stack<B: PhysBus> {
    pub(crate) bus: B,
    pub(crate) pbufs: PbufPool,
    pub(crate) hci: Hci,
    pub(crate) l2cap: L2cap,
    pub(crate) events: Deque<StackEvent, EVENT_QUEUE_LEN>,
    pub(crate) dropped_events: u32,
    pub(crate) options: HostOptions,
}

impl<B: PhysBus> Stack<B> {
    /// Create a stack with default options
    #[must_use]
    pub fn new(bus: B) -> Self {
        Self::with_options(bus, HostOptions::default())
    }

    /// Create a stack with custom options
    #[must_use]
    pub fn with_options(bus: B, options: HostOptions) -> Self {
        Self {
            bus,
            pbufs: PbufPool::new(),
            hci: Hci::new(),
            l2cap: L2cap::new(),
            events: Deque::new(),
            dropped_events: 0,
            options,
        }
    }

    /// Next pending notification
    pub fn poll_event(&mut self) -> Option<StackEvent> {
        self.events.pop_front()
    }

    /// Whether notifications are waiting
    #[must_use]
    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Events lost to a full queue since the stack was created
    #[must_use]
    pub fn dropped_events(&self) -> u32 {
        self.dropped_events
    }

    pub(crate) fn emit(&mut self, event: StackEvent) {
        let limit = if event.is_terminal() {
            EVENT_QUEUE_LEN
        } else {
            EVENT_QUEUE_LEN - EVENT_QUEUE_RESERVE
        };
        if self.events.len() >= limit {
            self.drop_event(event);
        } else if let Err(event) = self.events.push_back(event) {
            self.drop_event(event);
        }
    }

    fn drop_event(&mut self, event: StackEvent) {
        self.dropped_events = self.dropped_events.saturating_add(1);
        if event.is_terminal() {
            error!("stack: event queue full, dropping {:?}", event);
        } else {
            warn!("stack: event queue full, dropping event");
        }
        if let StackEvent::Received { pbuf, .. } = event {
            self.pbufs.free(pbuf);
        }
    }

    /// Drive the L2CAP timers; call once per second
    pub fn tick(&mut self) {
        self.l2cap_tmr();
    }

    /// Drop every channel, listener, link and pending notification
    ///
    /// The bus and the options are kept. Nothing is sent to the controller;
    /// use [`Stack::reset`] for the HCI Reset command.
    pub fn reset_state(&mut self) {
        self.l2cap_reset_all();
        while let Some(event) = self.events.pop_front() {
            if let StackEvent::Received { pbuf, .. } = event {
                self.pbufs.free(pbuf);
            }
        }
        for id in self.hci.links.ids() {
            self.hci_close(id);
        }
        self.hci = Hci::new();
        info!("stack: reset");
    }

    /// The HCI device block
    #[must_use]
    pub fn hci(&self) -> &Hci {
        &self.hci
    }

    /// The L2CAP channel tables
    #[must_use]
    pub fn l2cap(&self) -> &L2cap {
        &self.l2cap
    }

    /// Packet buffers, to read received data
    #[must_use]
    pub fn pbufs(&self) -> &PbufPool {
        &self.pbufs
    }

    /// Packet buffers, to build outgoing data and free received data
    pub fn pbufs_mut(&mut self) -> &mut PbufPool {
        &mut self.pbufs
    }

    /// The physical bus
    #[must_use]
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// The physical bus
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Options the stack was created with
    #[must_use]
    pub fn options(&self) -> &HostOptions {
        &self.options
    }

    /// Replace the options; procedures started afterwards use the new values
    pub fn set_options(&mut self, options: HostOptions) {
        self.options = options;
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::pbuf::{PbufKind, PbufLayer};
    use crate::transport::testing::RecordingBus;

    const PEER: BluetoothAddress = BluetoothAddress([1, 2, 3, 4, 5, 6]);

    #[test]
    fn test_events_are_fifo() {
        let mut stack = Stack::new(RecordingBus::default());
        assert!(!stack.has_events());
        stack.emit(StackEvent::LinkKeyRequest { addr: PEER });
        stack.emit(StackEvent::PinCodeRequest { addr: PEER });
        assert!(stack.has_events());
        assert_eq!(
            stack.poll_event(),
            Some(StackEvent::LinkKeyRequest { addr: PEER })
        );
        assert_eq!(
            stack.poll_event(),
            Some(StackEvent::PinCodeRequest { addr: PEER })
        );
        assert_eq!(stack.poll_event(), None);
    }

    #[test]
    fn test_full_queue_frees_dropped_data() {
        let mut stack = Stack::new(RecordingBus::default());
        let room = EVENT_QUEUE_LEN - EVENT_QUEUE_RESERVE;
        for _ in 0..room {
            stack.emit(StackEvent::PinCodeRequest { addr: PEER });
        }
        let p = stack.pbufs.alloc(PbufLayer::Raw, 4, PbufKind::Pool).unwrap();
        let channel = stack.l2cap_new().unwrap();
        stack.emit(StackEvent::Received {
            channel,
            arg: 0,
            pbuf: p,
        });
        assert_eq!(stack.pbufs.descriptors_in_use(), 0);
        assert_eq!(stack.events.len(), room);
        assert_eq!(stack.dropped_events(), 1);
    }

    #[test]
    fn test_terminal_events_use_reserved_room() {
        let mut stack = Stack::new(RecordingBus::default());
        let channel = stack.l2cap_new().unwrap();
        for _ in 0..EVENT_QUEUE_LEN {
            stack.emit(StackEvent::LinkKeyRequest { addr: PEER });
        }
        assert_eq!(stack.dropped_events(), EVENT_QUEUE_RESERVE as u32);

        stack.emit(StackEvent::DisconnectIndication { channel, arg: 3 });
        stack.emit(StackEvent::BasebandDisconnect {
            addr: PEER,
            reason: 0x13,
        });
        assert_eq!(stack.dropped_events(), EVENT_QUEUE_RESERVE as u32);
        assert_eq!(stack.events.len(), EVENT_QUEUE_LEN - EVENT_QUEUE_RESERVE + 2);

        let mut terminal = std::vec::Vec::new();
        while let Some(event) = stack.poll_event() {
            if event.is_terminal() {
                terminal.push(event);
            }
        }
        assert_eq!(
            terminal,
            [
                StackEvent::DisconnectIndication { channel, arg: 3 },
                StackEvent::BasebandDisconnect {
                    addr: PEER,
                    reason: 0x13
                },
            ]
        );
    }

    #[test]
    fn test_terminal_overflow_is_counted() {
        let mut stack = Stack::new(RecordingBus::default());
        for _ in 0..EVENT_QUEUE_LEN {
            stack.emit(StackEvent::InquiryComplete { result: Ok(0) });
        }
        assert_eq!(stack.events.len(), EVENT_QUEUE_LEN);
        assert_eq!(stack.dropped_events(), 0);
        stack.emit(StackEvent::InquiryComplete { result: Ok(1) });
        assert_eq!(stack.dropped_events(), 1);
        assert_eq!(stack.events.len(), EVENT_QUEUE_LEN);
    }

    #[test]
    fn test_reset_releases_queued_data() {
        let mut stack = Stack::new(RecordingBus::default());
        let channel = stack.l2cap_new().unwrap();
        let p = stack.pbufs.alloc(PbufLayer::Raw, 4, PbufKind::Ram).unwrap();
        stack.emit(StackEvent::Received {
            channel,
            arg: 7,
            pbuf: p,
        });
        stack.reset_state();
        assert!(!stack.has_events());
        assert_eq!(stack.pbufs.descriptors_in_use(), 0);
        assert_eq!(stack.l2cap_state(channel), Err(BluetoothError::InvalidParameter));
    }
}
