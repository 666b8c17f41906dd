//! `Wrenlink` Constants
//!
//! Compile-time sizes of every pool, protocol MTUs, timer durations and
//! the defaults written to the controller during bring-up.

// Fixed-block pools

/// Number of simultaneous ACL links
pub const MEMB_NUM_HCI_LINK: usize = 4;

/// Number of inquiry results kept between inquiries
pub const MEMB_NUM_HCI_INQ: usize = 16;

/// Number of stored link keys kept from a read-stored-link-key command
pub const MEMB_NUM_HCI_LINK_KEY: usize = 16;

/// Number of L2CAP channel control blocks
pub const MEMB_NUM_L2CAP_PCB: usize = 8;

/// Number of L2CAP listening registrations
pub const MEMB_NUM_L2CAP_PCB_LISTEN: usize = 8;

/// Number of outstanding L2CAP signaling requests
pub const MEMB_NUM_L2CAP_SIG: usize = 16;

/// Number of in-flight L2CAP reassemblies (one per peer)
pub const MEMB_NUM_L2CAP_SEG: usize = 4;

/// Number of HID devices handled by the `bte` consumer
pub const MEMB_NUM_BTE_PCB: usize = 4;

/// Number of queued HID control requests
pub const MEMB_NUM_BTE_CTRLS: usize = 8;

/// Largest input report handed to the `bte` consumer, header excluded
pub const BTE_REPORT_LEN: usize = 64;

/// Capacity of the `bte` consumer's notification queue
pub const BTE_EVENT_QUEUE_LEN: usize = 16;

// Packet buffers

/// Number of packet buffer descriptors
pub const PBUF_DESC_COUNT: usize = 64;

/// Number of pool payload blocks
pub const PBUF_POOL_SIZE: usize = 32;

/// Payload bytes of one pool block
pub const PBUF_POOL_BUFSIZE: usize = 128;

/// Size of the heap arena backing RAM-mode buffers
pub const MEM_SIZE: usize = 8 * 1024;

/// Alignment of heap allocations
pub const MEM_ALIGNMENT: usize = 4;

/// Headroom for the HCI packet indicator and ACL header
pub const PBUF_LINK_HLEN: usize = 5;

/// Headroom for the L2CAP basic header on top of the link headroom
pub const PBUF_TRANSPORT_HLEN: usize = 4;

// HCI

/// HCI packet indicator for commands
pub const HCI_COMMAND_DATA_PACKET: u8 = 0x01;

/// HCI packet indicator for ACL data
pub const HCI_ACL_DATA_PACKET: u8 = 0x02;

/// Size of the HCI command header including the packet indicator
pub const HCI_CMD_HDR_LEN: usize = 4;

/// Size of the HCI ACL header including the packet indicator
pub const HCI_ACL_HDR_LEN: usize = 5;

/// Size of the HCI event header
pub const HCI_EVENT_HDR_LEN: usize = 2;

/// Largest ACL payload the host accepts from the controller
pub const HCI_HOST_ACL_MAX_LEN: u16 = 1691;

/// Number of ACL packets the host can buffer before returning credits
pub const HCI_HOST_MAX_NUM_ACL: u16 = 20;

/// Number of HCI commands the controller accepts before the first event
pub const HCI_NUM_CMD_DEFAULT: u8 = 1;

/// Initial ACL packet types (DM1, DH1)
pub const HCI_DEFAULT_PACKET_TYPES: u16 = 0x0018;

/// General Inquiry Access Code (GIAC) - standard inquiry LAP
pub const GIAC: [u8; 3] = [0x33, 0x8B, 0x9E];

/// Default inquiry duration in 1.28s units
pub const DEFAULT_INQUIRY_DURATION: u8 = 3;

/// Unlimited number of inquiry responses
pub const UNLIMITED_RESPONSES: u8 = 0;

/// Page scan repetition mode used when no inquiry result is known
pub const DEFAULT_PAGE_SCAN_REPETITION_MODE: u8 = 0x01;

/// Allow role switch during connection
pub const ALLOW_ROLE_SWITCH: u8 = 0x01;

/// Maximum device name length kept by the host
pub const MAX_DEVICE_NAME_LENGTH: usize = 32;

/// Length of the local name field of `Write_Local_Name`
pub const HCI_LOCAL_NAME_LENGTH: usize = 248;

/// Class of Device length in bytes
pub const CLASS_OF_DEVICE_LENGTH: usize = 3;

/// Link key length in bytes
pub const LINK_KEY_LENGTH: usize = 16;

/// Maximum PIN code length in bytes
pub const PIN_CODE_MAX_LENGTH: usize = 16;

// L2CAP

/// Size of the L2CAP basic header
pub const L2CAP_HDR_LEN: usize = 4;

/// Size of a signaling command header
pub const L2CAP_SIGHDR_LEN: usize = 4;

/// Size of a configuration option header
pub const L2CAP_CFGOPTHDR_LEN: usize = 2;

/// Largest L2CAP payload this host receives
pub const L2CAP_MTU: u16 = HCI_HOST_ACL_MAX_LEN - L2CAP_HDR_LEN as u16;

/// Signaling MTU advertised on the signaling channel
pub const L2CAP_SIG_MTU: u16 = 48;

/// Default MTU assumed when the peer does not configure one
pub const L2CAP_CFG_DEFAULT_INMTU: u16 = 672;

/// Flush timeout meaning "infinite, reliable channel"
pub const L2CAP_CFG_DEFAULT_OUTFLUSHTO: u16 = 0xFFFF;

/// Response timeout in timer ticks
pub const L2CAP_RTX: u16 = 60;

/// Extended response timeout in timer ticks
pub const L2CAP_ERTX: u16 = 300;

/// Number of retransmissions before a channel is given up
pub const L2CAP_MAXRTX: u8 = 2;

/// Configuration timeout in timer ticks
pub const L2CAP_CFG_TO: u16 = 30;

/// First dynamically allocated channel identifier
pub const L2CAP_MIN_CID: u16 = 0x0040;

// Event delivery

/// Capacity of the stack's pending event queue
pub const EVENT_QUEUE_LEN: usize = 48;

/// Queue slots only channel, link and procedure outcomes may use: two per
/// channel, one per link, one each for a procedure and an inquiry
pub const EVENT_QUEUE_RESERVE: usize = 2 * MEMB_NUM_L2CAP_PCB + MEMB_NUM_HCI_LINK + 2;

/// Capacity of the async host's event channel
pub const HOST_EVENT_QUEUE_LEN: usize = 16;
