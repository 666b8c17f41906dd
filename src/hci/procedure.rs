//! Multi-step controller procedures
//!
//! A procedure is a fixed plan of commands issued one at a time: each Command
//! Complete for the current step issues the next one, a failed step aborts
//! the plan, and the end of the plan (or the abort) is reported once as
//! [`StackEvent::ProcedureComplete`]. Only one procedure runs at a time, it
//! owns the single command-completion slot.
//!
//! Inquiry runs beside procedures and completes on the Inquiry Complete event.

use super::opcode::{
    self, Opcode, VENDOR_PATCH_CONT_OCF, VENDOR_PATCH_END_OCF, VENDOR_PATCH_START_OCF,
};
use super::status;
use crate::constants::MAX_DEVICE_NAME_LENGTH;
use crate::stack::{Stack, StackEvent};
use crate::transport::PhysBus;
use crate::BluetoothError;
use heapless::String;

/// What a procedure brings about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProcedureKind {
    /// Reset and query the controller, then write the basic settings
    InitCore,
    /// Download a vendor firmware patch, then bring the controller up again
    ApplyPatch,
    /// Write the scan and discoverability settings
    InitSub,
    /// Read every link key stored in the controller
    ReadStoredLinkKeys,
    /// Read the local `BD_ADDR`
    ReadBdAddr,
    /// Reset the controller and close the bus
    Shutdown,
}

/// One command of a procedure plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BringUpStep {
    /// Reset
    Reset,
    /// Read Buffer Size
    ReadBufferSize,
    /// Read Local Version Information
    ReadLocalVersion,
    /// Read `BD_ADDR`
    ReadBdAddr,
    /// Read Local Supported Features
    ReadLocalFeatures,
    /// Write Inquiry Mode
    WriteInquiryMode,
    /// Write Page Scan Type
    WritePageScanType,
    /// Write Inquiry Scan Type
    WriteInquiryScanType,
    /// Write Class of Device
    WriteClassOfDevice,
    /// Write Page Timeout
    WritePageTimeout,
    /// Write Local Name
    WriteLocalName,
    /// Write PIN Type
    WritePinType,
    /// Host Buffer Size
    HostBufferSize,
    /// Write Scan Enable
    WriteScanEnable,
    /// Read Stored Link Key
    ReadStoredLinkKey,
    /// Vendor command opening the patch download
    VendorKick,
    /// First part of the vendor patch
    PatchFirst,
    /// Second part of the vendor patch
    PatchSecond,
}

impl BringUpStep {
    /// Opcode whose completion finishes this step
    #[must_use]
    pub const fn opcode(self) -> Opcode {
        match self {
            Self::Reset => opcode::RESET,
            Self::ReadBufferSize => opcode::READ_BUFFER_SIZE,
            Self::ReadLocalVersion => opcode::READ_LOCAL_VERSION,
            Self::ReadBdAddr => opcode::READ_BD_ADDR,
            Self::ReadLocalFeatures => opcode::READ_LOCAL_FEATURES,
            Self::WriteInquiryMode => opcode::WRITE_INQUIRY_MODE,
            Self::WritePageScanType => opcode::WRITE_PAGE_SCAN_TYPE,
            Self::WriteInquiryScanType => opcode::WRITE_INQUIRY_SCAN_TYPE,
            Self::WriteClassOfDevice => opcode::WRITE_CLASS_OF_DEVICE,
            Self::WritePageTimeout => opcode::WRITE_PAGE_TIMEOUT,
            Self::WriteLocalName => opcode::WRITE_LOCAL_NAME,
            Self::WritePinType => opcode::WRITE_PIN_TYPE,
            Self::HostBufferSize => opcode::HOST_BUFFER_SIZE,
            Self::WriteScanEnable => opcode::WRITE_SCAN_ENABLE,
            Self::ReadStoredLinkKey => opcode::READ_STORED_LINK_KEY,
            Self::VendorKick => Opcode::new(opcode::ogf::VENDOR, VENDOR_PATCH_START_OCF),
            Self::PatchFirst => Opcode::new(opcode::ogf::VENDOR, VENDOR_PATCH_CONT_OCF),
            Self::PatchSecond => Opcode::new(opcode::ogf::VENDOR, VENDOR_PATCH_END_OCF),
        }
    }
}

/// Controller bring-up
pub const INIT_CORE: &[BringUpStep] = &[
    BringUpStep::Reset,
    BringUpStep::ReadBufferSize,
    BringUpStep::ReadLocalVersion,
    BringUpStep::ReadBdAddr,
    BringUpStep::ReadLocalFeatures,
    BringUpStep::WriteInquiryMode,
    BringUpStep::WritePageScanType,
    BringUpStep::WriteInquiryScanType,
    BringUpStep::WriteClassOfDevice,
    BringUpStep::WritePageTimeout,
];

/// Controller bring-up followed by the local name, PIN type and host buffers
pub const INIT_CORE_EXTENDED: &[BringUpStep] = &[
    BringUpStep::Reset,
    BringUpStep::ReadBufferSize,
    BringUpStep::ReadLocalVersion,
    BringUpStep::ReadBdAddr,
    BringUpStep::ReadLocalFeatures,
    BringUpStep::WriteInquiryMode,
    BringUpStep::WritePageScanType,
    BringUpStep::WriteInquiryScanType,
    BringUpStep::WriteClassOfDevice,
    BringUpStep::WritePageTimeout,
    BringUpStep::WriteLocalName,
    BringUpStep::WritePinType,
    BringUpStep::HostBufferSize,
];

/// Vendor patch download and the bring-up that follows it
pub const APPLY_PATCH: &[BringUpStep] = &[
    BringUpStep::VendorKick,
    BringUpStep::PatchFirst,
    BringUpStep::PatchSecond,
    BringUpStep::Reset,
    BringUpStep::ReadBufferSize,
    BringUpStep::WriteClassOfDevice,
    BringUpStep::WriteLocalName,
    BringUpStep::WritePinType,
    BringUpStep::HostBufferSize,
    BringUpStep::ReadLocalVersion,
    BringUpStep::ReadBdAddr,
    BringUpStep::ReadLocalFeatures,
];

/// Scan and discoverability settings
pub const INIT_SUB: &[BringUpStep] = &[
    BringUpStep::WriteInquiryMode,
    BringUpStep::WritePageScanType,
    BringUpStep::WriteInquiryScanType,
    BringUpStep::WriteClassOfDevice,
    BringUpStep::WritePageTimeout,
    BringUpStep::WriteLocalName,
    BringUpStep::WriteScanEnable,
];

const READ_STORED_LINK_KEYS: &[BringUpStep] = &[BringUpStep::ReadStoredLinkKey];
const READ_BD_ADDR: &[BringUpStep] = &[BringUpStep::ReadBdAddr];
const SHUTDOWN: &[BringUpStep] = &[BringUpStep::Reset];

/// Values written to the controller during bring-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BringUpOptions {
    /// Class of device, wire order
    pub class_of_device: [u8; 3],
    /// Page timeout in 0.625 ms slots
    pub page_timeout: u16,
    /// Local name
    pub local_name: String<MAX_DEVICE_NAME_LENGTH>,
    /// PIN type (0 variable, 1 fixed)
    pub pin_type: u8,
    /// Inquiry result format
    pub inquiry_mode: u8,
    /// Page scan type
    pub page_scan_type: u8,
    /// Inquiry scan type
    pub inquiry_scan_type: u8,
    /// Scan enable written by [`ProcedureKind::InitSub`]
    pub scan_enable: u8,
}

impl Default for BringUpOptions {
    fn default() -> Self {
        Self {
            class_of_device: [0x00, 0x04, 0x48],
            page_timeout: 0x2000,
            local_name: String::new(),
            pin_type: 0x00,
            inquiry_mode: 0x01,
            page_scan_type: 0x01,
            inquiry_scan_type: 0x01,
            scan_enable: 0x02,
        }
    }
}

/// Vendor firmware patch, downloaded in two parts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorPatch {
    /// Payload of the first patch command
    pub first: &'static [u8],
    /// Payload of the second patch command
    pub second: &'static [u8],
}

/// The procedure occupying the completion slot
#[derive(Debug, Clone, Copy)]
pub(crate) struct Procedure {
    kind: ProcedureKind,
    plan: &'static [BringUpStep],
    index: usize,
    patch: Option<VendorPatch>,
}

impl Procedure {
    fn step(&self) -> Option<BringUpStep> {
        self.plan.get(self.index).copied()
    }
}

/// An inquiry waiting for Inquiry Complete
#[derive(Debug, Clone, Copy)]
pub(crate) struct InquiryRequest {
    restart_when_empty: bool,
}

impl<B: PhysBus> Stack<B> {
    /// Run a procedure; its end is reported as [`StackEvent::ProcedureComplete`]
    ///
    /// [`ProcedureKind::ApplyPatch`] needs the patch, start it with [`Stack::apply_patch`].
    ///
    /// # Errors
    /// Returns `Busy` while another procedure runs, `InvalidParameter` for
    /// `ApplyPatch`, or the error of the first command
    pub fn start_procedure(&mut self, kind: ProcedureKind) -> Result<(), BluetoothError> {
        let plan = match kind {
            ProcedureKind::InitCore if self.options.extended_bring_up => INIT_CORE_EXTENDED,
            ProcedureKind::InitCore => INIT_CORE,
            ProcedureKind::ApplyPatch => return Err(BluetoothError::InvalidParameter),
            ProcedureKind::InitSub => INIT_SUB,
            ProcedureKind::ReadStoredLinkKeys => READ_STORED_LINK_KEYS,
            ProcedureKind::ReadBdAddr => READ_BD_ADDR,
            ProcedureKind::Shutdown => SHUTDOWN,
        };
        self.begin(kind, plan, None)
    }

    /// Download a vendor patch and bring the controller up again
    ///
    /// # Errors
    /// Returns `Busy` while another procedure runs, or the error of the first command
    pub fn apply_patch(&mut self, patch: VendorPatch) -> Result<(), BluetoothError> {
        self.begin(ProcedureKind::ApplyPatch, APPLY_PATCH, Some(patch))
    }

    /// The procedure currently running
    #[must_use]
    pub fn procedure(&self) -> Option<ProcedureKind> {
        self.hci.procedure.map(|p| p.kind)
    }

    fn begin(
        &mut self,
        kind: ProcedureKind,
        plan: &'static [BringUpStep],
        patch: Option<VendorPatch>,
    ) -> Result<(), BluetoothError> {
        if self.hci.procedure.is_some() {
            warn!("hci: procedure {} refused, slot busy", kind);
            return Err(BluetoothError::Busy);
        }
        let first = plan.first().copied().ok_or(BluetoothError::InvalidParameter)?;
        debug!("hci: starting procedure {}", kind);
        self.hci.procedure = Some(Procedure {
            kind,
            plan,
            index: 0,
            patch,
        });
        if let Err(e) = self.issue_step(first) {
            self.hci.procedure = None;
            return Err(e);
        }
        Ok(())
    }

    fn issue_step(&mut self, step: BringUpStep) -> Result<(), BluetoothError> {
        let o = &self.options.bring_up;
        let (cod, page_timeout, pin_type) = (o.class_of_device, o.page_timeout, o.pin_type);
        let (inquiry_mode, page_scan_type, inquiry_scan_type, scan_enable) = (
            o.inquiry_mode,
            o.page_scan_type,
            o.inquiry_scan_type,
            o.scan_enable,
        );
        let patch = self.hci.procedure.and_then(|p| p.patch);
        match step {
            BringUpStep::Reset => self.reset(),
            BringUpStep::ReadBufferSize => self.read_buffer_size(),
            BringUpStep::ReadLocalVersion => self.read_local_version(),
            BringUpStep::ReadBdAddr => self.read_bd_addr(),
            BringUpStep::ReadLocalFeatures => self.read_local_features(),
            BringUpStep::WriteInquiryMode => self.write_inquiry_mode(inquiry_mode),
            BringUpStep::WritePageScanType => self.write_page_scan_type(page_scan_type),
            BringUpStep::WriteInquiryScanType => self.write_inquiry_scan_type(inquiry_scan_type),
            BringUpStep::WriteClassOfDevice => self.write_class_of_device(cod),
            BringUpStep::WritePageTimeout => self.write_page_timeout(page_timeout),
            BringUpStep::WriteLocalName => {
                let name = self.options.bring_up.local_name.clone();
                self.write_local_name(name.as_bytes())
            }
            BringUpStep::WritePinType => self.write_pin_type(pin_type),
            BringUpStep::HostBufferSize => self.host_buffer_size(),
            BringUpStep::WriteScanEnable => self.write_scan_enable(scan_enable),
            BringUpStep::ReadStoredLinkKey => self.read_stored_link_key(),
            BringUpStep::VendorKick => self.vendor_specific_command(VENDOR_PATCH_START_OCF, &[0]),
            BringUpStep::PatchFirst => {
                let patch = patch.ok_or(BluetoothError::InvalidParameter)?;
                self.vendor_specific_command(VENDOR_PATCH_CONT_OCF, patch.first)
            }
            BringUpStep::PatchSecond => {
                let patch = patch.ok_or(BluetoothError::InvalidParameter)?;
                self.vendor_specific_command(VENDOR_PATCH_END_OCF, patch.second)
            }
        }
    }

    /// Route a command result to its waiter, or report it as a plain event
    pub(crate) fn command_complete(&mut self, opcode: Opcode, status: u8) {
        if opcode == opcode::INQUIRY && status != status::SUCCESS && self.hci.inquiry.is_some() {
            self.hci.inquiry = None;
            self.emit(StackEvent::InquiryComplete {
                result: Err(BluetoothError::HciCommandFailed(status)),
            });
            return;
        }
        if !self.procedure_step_complete(opcode, status) {
            self.emit(StackEvent::CommandComplete { opcode, status });
        }
    }

    fn procedure_step_complete(&mut self, opcode: Opcode, status: u8) -> bool {
        let Some(procedure) = self.hci.procedure.as_mut() else {
            return false;
        };
        if procedure.step().map(BringUpStep::opcode) != Some(opcode) {
            return false;
        }
        if status != status::SUCCESS {
            warn!(
                "hci: procedure {} step {} failed with status {}",
                procedure.kind, opcode, status
            );
            self.finish_procedure(Err(BluetoothError::HciCommandFailed(status)));
            return true;
        }
        procedure.index += 1;
        match procedure.step() {
            Some(next) => {
                if let Err(e) = self.issue_step(next) {
                    self.finish_procedure(Err(e));
                }
            }
            None => self.finish_procedure(Ok(())),
        }
        true
    }

    fn finish_procedure(&mut self, result: Result<(), BluetoothError>) {
        let Some(procedure) = self.hci.procedure.take() else {
            return;
        };
        if procedure.kind == ProcedureKind::Shutdown {
            self.bus.close();
        }
        debug!("hci: procedure {} finished", procedure.kind);
        self.emit(StackEvent::ProcedureComplete {
            kind: procedure.kind,
            result,
        });
    }

    /// Inquire with the configured access code and duration
    ///
    /// Completes with [`StackEvent::InquiryComplete`] carrying the number of
    /// devices found; the devices are in [`crate::hci::Hci::inquiry_results`].
    ///
    /// # Errors
    /// Returns `Busy` while an inquiry runs, or the command error
    pub fn start_inquiry(&mut self) -> Result<(), BluetoothError> {
        if self.hci.inquiry.is_some() {
            return Err(BluetoothError::Busy);
        }
        let (lap, length, num) = (
            self.options.lap,
            self.options.inquiry_length,
            self.options.num_responses,
        );
        self.inquiry(lap, length, num)?;
        self.hci.inquiry = Some(InquiryRequest {
            restart_when_empty: self.options.restart_empty_inquiry,
        });
        Ok(())
    }

    pub(crate) fn inquiry_complete(&mut self, status: u8) {
        let request = self.hci.inquiry;
        if status != status::SUCCESS {
            self.hci.inquiry = None;
            self.emit(StackEvent::InquiryComplete {
                result: Err(BluetoothError::HciCommandFailed(status)),
            });
            return;
        }
        let found = self.hci.inquiry_results.used();
        if found == 0 && request.is_some_and(|r| r.restart_when_empty) {
            debug!("hci: inquiry found nothing, restarting");
            let (lap, length, num) = (
                self.options.lap,
                self.options.inquiry_length,
                self.options.num_responses,
            );
            if let Err(e) = self.inquiry(lap, length, num) {
                self.hci.inquiry = None;
                self.emit(StackEvent::InquiryComplete { result: Err(e) });
            }
            return;
        }
        self.hci.inquiry = None;
        self.emit(StackEvent::InquiryComplete { result: Ok(found) });
    }
}
