//! Async front end for a shared [`Stack`]
//!
//! The stack itself is synchronous: every input and API call runs to
//! completion under `&mut`. [`Host`] puts it behind a blocking mutex so the
//! transport task (feeding events, ACL data and the timer tick) and the
//! application tasks can share it, and turns the multi-step procedures into
//! `async fn`s that resolve when the stack reports their completion.
//!
//! ## Usage
//!
//! ```rust,ignore
//! static HOST: StaticCell<Host<CriticalSectionRawMutex, UsbBus>> = StaticCell::new();
//! let host = HOST.init(Host::new(Stack::new(bus)));
//!
//! // transport task
//! host.hci_event_input(&packet)?;
//!
//! // application task
//! host.init_core().await?;
//! host.init_sub().await?;
//! let found = host.inquiry().await?;
//! ```
//!
//! Procedure and inquiry completions are consumed by the `Host`; every other
//! [`StackEvent`] is forwarded to a channel read with [`Host::next_event`].

use crate::constants::HOST_EVENT_QUEUE_LEN;
use crate::hci::procedure::{ProcedureKind, VendorPatch};
use crate::stack::{Stack, StackEvent};
use crate::transport::PhysBus;
use crate::{BluetoothAddress, BluetoothError};
use core::cell::RefCell;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use embassy_sync::signal::Signal;

/// A [`Stack`] shared between tasks
pub struct Host<M: RawMutex, B: PhysBus> {
    stack: Mutex<M, RefCell<Stack<B>>>,
    procedure: Signal<M, (ProcedureKind, Result<(), BluetoothError>)>,
    inquiry: Signal<M, Result<usize, BluetoothError>>,
    events: Channel<M, StackEvent, HOST_EVENT_QUEUE_LEN>,
}

impl<M: RawMutex, B: PhysBus> Host<M, B> {
    /// Wrap a stack
    pub fn new(stack: Stack<B>) -> Self {
        Self {
            stack: Mutex::new(RefCell::new(stack)),
            procedure: Signal::new(),
            inquiry: Signal::new(),
            events: Channel::new(),
        }
    }

    /// Run `f` with exclusive access to the stack
    ///
    /// Events `f` produces stay queued until the next input or
    /// [`Host::dispatch`]. `f` must not call back into the `Host`.
    pub fn with_stack<R>(&self, f: impl FnOnce(&mut Stack<B>) -> R) -> R {
        self.stack.lock(|cell| f(&mut cell.borrow_mut()))
    }

    /// Feed one HCI event packet
    ///
    /// # Errors
    /// Returns an error if the packet is truncated
    pub fn hci_event_input(&self, packet: &[u8]) -> Result<(), BluetoothError> {
        let result = self.with_stack(|stack| stack.hci_event_input(packet));
        self.dispatch();
        result
    }

    /// Feed one ACL data packet
    ///
    /// # Errors
    /// Returns an error if the packet is truncated or cannot be buffered
    pub fn acl_input(&self, packet: &[u8]) -> Result<(), BluetoothError> {
        let result = self.with_stack(|stack| stack.acl_input(packet));
        self.dispatch();
        result
    }

    /// Drive the L2CAP timers; call once per second
    pub fn tick(&self) {
        self.with_stack(Stack::tick);
        self.dispatch();
    }

    /// Route queued stack events: completions wake their waiters, the rest
    /// go to the event channel
    pub fn dispatch(&self) {
        while let Some(event) = self.with_stack(Stack::poll_event) {
            match event {
                StackEvent::ProcedureComplete { kind, result } => {
                    self.procedure.signal((kind, result));
                }
                StackEvent::InquiryComplete { result } => self.inquiry.signal(result),
                event => {
                    if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
                        warn!("host: event channel full, dropping event");
                        if let StackEvent::Received { pbuf, .. } = event {
                            self.with_stack(|stack| stack.pbufs_mut().free(pbuf));
                        }
                    }
                }
            }
        }
    }

    /// Wait for the next forwarded event
    pub async fn next_event(&self) -> StackEvent {
        self.events.receive().await
    }

    /// Next forwarded event, if one is waiting
    pub fn try_next_event(&self) -> Option<StackEvent> {
        self.events.try_receive().ok()
    }

    async fn run(
        &self,
        kind: ProcedureKind,
        start: impl FnOnce(&mut Stack<B>) -> Result<(), BluetoothError>,
    ) -> Result<(), BluetoothError> {
        self.procedure.reset();
        self.with_stack(start)?;
        self.dispatch();
        loop {
            let (done, result) = self.procedure.wait().await;
            if done == kind {
                debug!("host: {:?} finished", kind);
                return result;
            }
            warn!("host: completion of {:?} while waiting for {:?}", done, kind);
        }
    }

    async fn procedure(&self, kind: ProcedureKind) -> Result<(), BluetoothError> {
        self.run(kind, |stack| stack.start_procedure(kind)).await
    }

    /// Reset the controller, read its parameters and write the basic settings
    ///
    /// # Errors
    /// Returns `Busy` while another procedure runs, or the failing step's error
    pub async fn init_core(&self) -> Result<(), BluetoothError> {
        self.procedure(ProcedureKind::InitCore).await
    }

    /// Download a vendor firmware patch and bring the controller up again
    ///
    /// # Errors
    /// Returns `Busy` while another procedure runs, or the failing step's error
    pub async fn apply_patch(&self, patch: VendorPatch) -> Result<(), BluetoothError> {
        self.run(ProcedureKind::ApplyPatch, |stack| stack.apply_patch(patch))
            .await
    }

    /// Write the scan and discoverability settings
    ///
    /// # Errors
    /// Returns `Busy` while another procedure runs, or the failing step's error
    pub async fn init_sub(&self) -> Result<(), BluetoothError> {
        self.procedure(ProcedureKind::InitSub).await
    }

    /// Read the link keys stored in the controller, returning how many there are
    ///
    /// # Errors
    /// Returns `Busy` while another procedure runs, or the command error
    pub async fn read_stored_link_keys(&self) -> Result<usize, BluetoothError> {
        self.procedure(ProcedureKind::ReadStoredLinkKeys).await?;
        Ok(self.with_stack(|stack| stack.hci().stored_link_keys().count()))
    }

    /// Read the local `BD_ADDR`
    ///
    /// # Errors
    /// Returns `Busy` while another procedure runs, or the command error
    pub async fn read_bd_addr(&self) -> Result<BluetoothAddress, BluetoothError> {
        self.procedure(ProcedureKind::ReadBdAddr).await?;
        self.with_stack(|stack| stack.hci().local_info().bd_addr)
            .ok_or(BluetoothError::InvalidParameter)
    }

    /// Reset the controller and close the bus
    ///
    /// # Errors
    /// Returns `Busy` while another procedure runs, or the reset error
    pub async fn shutdown(&self) -> Result<(), BluetoothError> {
        self.procedure(ProcedureKind::Shutdown).await
    }

    /// Inquire with the configured options, returning the number of devices
    /// found; read them with [`crate::hci::Hci::inquiry_results`]
    ///
    /// # Errors
    /// Returns `Busy` while an inquiry runs, or the command error
    pub async fn inquiry(&self) -> Result<usize, BluetoothError> {
        self.inquiry.reset();
        self.with_stack(Stack::start_inquiry)?;
        self.dispatch();
        self.inquiry.wait().await
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::hci::event::code;
    use crate::hci::opcode::Opcode;
    use crate::transport::testing::RecordingBus;
    use embassy_futures::join::join;
    use embassy_futures::{block_on, yield_now};
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use std::vec;

    type TestHost = Host<NoopRawMutex, RecordingBus>;

    fn host() -> TestHost {
        Host::new(Stack::new(RecordingBus::default()))
    }

    fn complete_last(host: &TestHost, status: u8, extra: &[u8]) {
        let (ogf, ocf, _) = host.with_stack(|s| s.bus().last_command()).unwrap();
        let [o0, o1] = Opcode::new(ogf, ocf).to_bytes();
        let mut packet = vec![code::COMMAND_COMPLETE, 4 + extra.len() as u8, 1, o0, o1, status];
        packet.extend_from_slice(extra);
        host.hci_event_input(&packet).unwrap();
    }

    /// Answer every command of the running procedure
    async fn controller(host: &TestHost, status: u8) {
        loop {
            yield_now().await;
            if host.with_stack(|s| s.procedure().is_none()) {
                break;
            }
            complete_last(host, status, &[]);
        }
    }

    #[test]
    fn test_init_sub_resolves_after_last_step() {
        let host = host();
        let (result, ()) = block_on(join(host.init_sub(), controller(&host, 0x00)));
        assert_eq!(result, Ok(()));
        assert!(host.with_stack(|s| s.bus().commands().len()) > 1);
        assert_eq!(host.try_next_event(), None);
    }

    #[test]
    fn test_failed_step_is_returned() {
        let host = host();
        let (result, ()) = block_on(join(host.init_core(), controller(&host, 0x0C)));
        assert_eq!(result, Err(BluetoothError::HciCommandFailed(0x0C)));
    }

    #[test]
    fn test_busy_procedure_fails_at_once() {
        let host = host();
        host.with_stack(|s| s.start_procedure(ProcedureKind::InitSub))
            .unwrap();
        assert_eq!(block_on(host.shutdown()), Err(BluetoothError::Busy));
    }

    #[test]
    fn test_read_bd_addr_returns_address() {
        let host = host();
        let answer = async {
            yield_now().await;
            complete_last(&host, 0x00, &[6, 5, 4, 3, 2, 1]);
        };
        let (result, ()) = block_on(join(host.read_bd_addr(), answer));
        assert_eq!(result, Ok(BluetoothAddress([6, 5, 4, 3, 2, 1])));
    }

    #[test]
    fn test_inquiry_counts_results() {
        let host = host();
        let answer = async {
            yield_now().await;
            let mut result = vec![code::INQUIRY_RESULT, 15, 1];
            result.extend_from_slice(&[1, 2, 3, 4, 5, 6, 0x01, 0x00, 0x00]);
            result.extend_from_slice(&[0x04, 0x25, 0x00, 0x10, 0x20]);
            host.hci_event_input(&result).unwrap();
            host.hci_event_input(&[code::INQUIRY_COMPLETE, 1, 0x00])
                .unwrap();
        };
        let (result, ()) = block_on(join(host.inquiry(), answer));
        assert_eq!(result, Ok(1));
    }

    #[test]
    fn test_other_events_are_forwarded() {
        let host = host();
        let mut params = vec![0x00, 0x01, 0x00];
        params.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        params.extend_from_slice(&[0x01, 0x00]);
        let mut packet = vec![code::CONNECTION_COMPLETE, params.len() as u8];
        packet.extend_from_slice(&params);
        host.hci_event_input(&packet).unwrap();

        let event = block_on(host.next_event());
        assert_eq!(
            event,
            StackEvent::AclConnected {
                addr: BluetoothAddress([1, 2, 3, 4, 5, 6]),
                handle: 1
            }
        );
        assert_eq!(host.try_next_event(), None);
    }
}
