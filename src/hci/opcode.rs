//! HCI command opcodes
//!
//! An opcode packs a 6-bit group field (OGF) and a 10-bit command field (OCF)
//! into one little-endian 16-bit value.

/// OGF/OCF pair identifying one HCI command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Opcode {
    /// Opcode group field
    pub ogf: u8,
    /// Opcode command field
    pub ocf: u16,
}

impl Opcode {
    /// Build an opcode from its two fields
    #[must_use]
    pub const fn new(ogf: u8, ocf: u16) -> Self {
        Self {
            ogf,
            ocf: ocf & 0x03FF,
        }
    }

    /// Split a raw 16-bit opcode
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_raw(raw: u16) -> Self {
        Self {
            ogf: (raw >> 10) as u8,
            ocf: raw & 0x03FF,
        }
    }

    /// The packed 16-bit value
    #[must_use]
    pub const fn raw(self) -> u16 {
        ((self.ogf as u16) << 10) | (self.ocf & 0x03FF)
    }

    /// The two opcode bytes as they appear in a command header
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 2] {
        self.raw().to_le_bytes()
    }
}

impl core::fmt::Display for Opcode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}/{:04x}", self.ogf, self.ocf)
    }
}

/// Opcode group fields
pub mod ogf {
    /// Link control commands
    pub const LINK_CONTROL: u8 = 0x01;
    /// Link policy commands
    pub const LINK_POLICY: u8 = 0x02;
    /// Controller and baseband commands
    pub const CONTROLLER_BASEBAND: u8 = 0x03;
    /// Informational parameters
    pub const INFORMATIONAL: u8 = 0x04;
    /// Vendor-specific commands
    pub const VENDOR: u8 = 0x3F;
}

const fn lc(ocf: u16) -> Opcode {
    Opcode::new(ogf::LINK_CONTROL, ocf)
}

const fn lp(ocf: u16) -> Opcode {
    Opcode::new(ogf::LINK_POLICY, ocf)
}

const fn cb(ocf: u16) -> Opcode {
    Opcode::new(ogf::CONTROLLER_BASEBAND, ocf)
}

const fn info(ocf: u16) -> Opcode {
    Opcode::new(ogf::INFORMATIONAL, ocf)
}

/// Inquiry
pub const INQUIRY: Opcode = lc(0x0001);
/// Periodic Inquiry Mode
pub const PERIODIC_INQUIRY: Opcode = lc(0x0003);
/// Exit Periodic Inquiry Mode
pub const EXIT_PERIODIC_INQUIRY: Opcode = lc(0x0004);
/// Create Connection
pub const CREATE_CONNECTION: Opcode = lc(0x0005);
/// Disconnect
pub const DISCONNECT: Opcode = lc(0x0006);
/// Accept Connection Request
pub const ACCEPT_CONNECTION_REQUEST: Opcode = lc(0x0009);
/// Reject Connection Request
pub const REJECT_CONNECTION_REQUEST: Opcode = lc(0x000A);
/// Link Key Request Reply
pub const LINK_KEY_REQUEST_REPLY: Opcode = lc(0x000B);
/// Link Key Request Negative Reply
pub const LINK_KEY_REQUEST_NEGATIVE_REPLY: Opcode = lc(0x000C);
/// PIN Code Request Reply
pub const PIN_CODE_REQUEST_REPLY: Opcode = lc(0x000D);
/// PIN Code Request Negative Reply
pub const PIN_CODE_REQUEST_NEGATIVE_REPLY: Opcode = lc(0x000E);
/// Remote Name Request
pub const REMOTE_NAME_REQUEST: Opcode = lc(0x0019);

/// Sniff Mode
pub const SNIFF_MODE: Opcode = lp(0x0003);
/// Write Link Policy Settings
pub const WRITE_LINK_POLICY_SETTINGS: Opcode = lp(0x000D);

/// Set Event Mask
pub const SET_EVENT_MASK: Opcode = cb(0x0001);
/// Reset
pub const RESET: Opcode = cb(0x0003);
/// Set Event Filter
pub const SET_EVENT_FILTER: Opcode = cb(0x0005);
/// Write PIN Type
pub const WRITE_PIN_TYPE: Opcode = cb(0x000A);
/// Read Stored Link Key
pub const READ_STORED_LINK_KEY: Opcode = cb(0x000D);
/// Write Stored Link Key
pub const WRITE_STORED_LINK_KEY: Opcode = cb(0x0011);
/// Write Local Name
pub const WRITE_LOCAL_NAME: Opcode = cb(0x0013);
/// Write Page Timeout
pub const WRITE_PAGE_TIMEOUT: Opcode = cb(0x0018);
/// Write Scan Enable
pub const WRITE_SCAN_ENABLE: Opcode = cb(0x001A);
/// Write Class of Device
pub const WRITE_CLASS_OF_DEVICE: Opcode = cb(0x0024);
/// Write Automatic Flush Timeout
pub const WRITE_AUTOMATIC_FLUSH_TIMEOUT: Opcode = cb(0x0028);
/// Set Controller To Host Flow Control
pub const SET_CONTROLLER_TO_HOST_FLOW_CONTROL: Opcode = cb(0x0031);
/// Host Buffer Size
pub const HOST_BUFFER_SIZE: Opcode = cb(0x0033);
/// Host Number Of Completed Packets
pub const HOST_NUMBER_OF_COMPLETED_PACKETS: Opcode = cb(0x0035);
/// Read Current IAC LAP
pub const READ_CURRENT_IAC_LAP: Opcode = cb(0x0039);
/// Write Inquiry Scan Type
pub const WRITE_INQUIRY_SCAN_TYPE: Opcode = cb(0x0043);
/// Write Inquiry Mode
pub const WRITE_INQUIRY_MODE: Opcode = cb(0x0045);
/// Write Page Scan Type
pub const WRITE_PAGE_SCAN_TYPE: Opcode = cb(0x0047);

/// Read Local Version Information
pub const READ_LOCAL_VERSION: Opcode = info(0x0001);
/// Read Local Supported Features
pub const READ_LOCAL_FEATURES: Opcode = info(0x0003);
/// Read Buffer Size
pub const READ_BUFFER_SIZE: Opcode = info(0x0005);
/// Read `BD_ADDR`
pub const READ_BD_ADDR: Opcode = info(0x0009);

/// Vendor command that opens (and closes) a firmware patch download
pub const VENDOR_PATCH_START_OCF: u16 = 0x004F;
/// Vendor command carrying the body of a firmware patch
pub const VENDOR_PATCH_CONT_OCF: u16 = 0x004C;
/// Vendor command carrying the final part of a firmware patch
pub const VENDOR_PATCH_END_OCF: u16 = 0x004F;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_packing() {
        assert_eq!(RESET.raw(), 0x0C03);
        assert_eq!(RESET.to_bytes(), [0x03, 0x0C]);
        assert_eq!(READ_BD_ADDR.raw(), 0x1009);
        assert_eq!(WRITE_LINK_POLICY_SETTINGS.raw(), 0x080D);
        assert_eq!(Opcode::new(ogf::VENDOR, VENDOR_PATCH_CONT_OCF).raw(), 0xFC4C);
    }

    #[test]
    fn test_opcode_from_raw() {
        let opcode = Opcode::from_raw(0x0C18);
        assert_eq!(opcode, WRITE_PAGE_TIMEOUT);
        assert_eq!(opcode.ogf, ogf::CONTROLLER_BASEBAND);
        assert_eq!(opcode.ocf, 0x0018);
        assert_eq!(Opcode::from_raw(INQUIRY.raw()), INQUIRY);
    }
}
