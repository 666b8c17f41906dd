//! HCI command encoders
//!
//! Each command is framed into one heap buffer as
//! `[0x01][opcode][parameter length][parameters]` and handed to the bus.
//! Results arrive later through Command Complete or Command Status.

use super::opcode::{self, Opcode};
use crate::constants::{
    HCI_CMD_HDR_LEN, HCI_COMMAND_DATA_PACKET, HCI_HOST_ACL_MAX_LEN, HCI_HOST_MAX_NUM_ACL,
    HCI_LOCAL_NAME_LENGTH, LINK_KEY_LENGTH, PIN_CODE_MAX_LENGTH,
};
use crate::pbuf::{PbufKind, PbufLayer};
use crate::stack::Stack;
use crate::transport::{Frame, PhysBus};
use crate::{BluetoothAddress, BluetoothError};

const HOST_SCO_MAX_LEN: u8 = 255;
const HOST_MAX_NUM_SCO: u16 = 1;

/// Condition bytes that follow a Set Event Filter of the given type
const fn event_filter_condition_len(filter_type: u8, condition_type: u8) -> Option<usize> {
    match (filter_type, condition_type) {
        (0x00, _) => Some(0),
        (0x01, 0x00) => Some(0),
        (0x01, 0x01 | 0x02) => Some(6),
        (0x02, 0x00) => Some(1),
        (0x02, 0x01 | 0x02) => Some(7),
        _ => None,
    }
}

impl<B: PhysBus> Stack<B> {
    /// Frame and transmit one HCI command
    ///
    /// # Errors
    /// Returns `InvalidParameter` if `params` does not fit the length byte,
    /// `OutOfMemory` if no buffer is available, or the bus error
    pub fn send_command(&mut self, opcode: Opcode, params: &[u8]) -> Result<(), BluetoothError> {
        let plen = u8::try_from(params.len()).map_err(|_| BluetoothError::InvalidParameter)?;
        let total = HCI_CMD_HDR_LEN + params.len();
        #[allow(clippy::cast_possible_truncation)]
        let Some(p) = self
            .pbufs
            .alloc(PbufLayer::Raw, total as u16, PbufKind::Ram)
        else {
            error!("hci: could not allocate command {}", opcode);
            return Err(BluetoothError::OutOfMemory);
        };
        let [o0, o1] = opcode.to_bytes();
        let result = self
            .pbufs
            .copy_in(p, 0, &[HCI_COMMAND_DATA_PACKET, o0, o1, plen])
            .and_then(|()| self.pbufs.copy_in(p, HCI_CMD_HDR_LEN, params))
            .and_then(|()| {
                self.bus
                    .output(Frame::single(&self.pbufs, self.pbufs.segments(p), total))
            });
        self.pbufs.free(p);
        if result.is_ok() {
            trace!("hci: sent command {}", opcode);
            self.hci.num_cmd = self.hci.num_cmd.saturating_sub(1);
        }
        result
    }

    /// Start an inquiry, dropping the results of the previous one
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn inquiry(
        &mut self,
        lap: [u8; 3],
        length: u8,
        num_responses: u8,
    ) -> Result<(), BluetoothError> {
        self.hci.inquiry_results.clear();
        self.send_command(
            opcode::INQUIRY,
            &[lap[0], lap[1], lap[2], length, num_responses],
        )
    }

    /// Enter periodic inquiry mode, dropping the previous results
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn periodic_inquiry(
        &mut self,
        lap: [u8; 3],
        min_period: u16,
        max_period: u16,
        length: u8,
        num_responses: u8,
    ) -> Result<(), BluetoothError> {
        self.hci.inquiry_results.clear();
        let [x0, x1] = max_period.to_le_bytes();
        let [n0, n1] = min_period.to_le_bytes();
        self.send_command(
            opcode::PERIODIC_INQUIRY,
            &[x0, x1, n0, n1, lap[0], lap[1], lap[2], length, num_responses],
        )
    }

    /// Leave periodic inquiry mode
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn exit_periodic_inquiry(&mut self) -> Result<(), BluetoothError> {
        self.send_command(opcode::EXIT_PERIODIC_INQUIRY, &[])
    }

    pub(crate) fn create_connection(
        &mut self,
        addr: BluetoothAddress,
        allow_role_switch: u8,
    ) -> Result<(), BluetoothError> {
        let (psrm, psm, clock_offset) = self.hci.page_params(&addr);
        let [t0, t1] = self.hci.pkt_type.to_le_bytes();
        let [c0, c1] = clock_offset.to_le_bytes();
        let mut params = [0u8; 13];
        params[..6].copy_from_slice(addr.as_bytes());
        params[6..].copy_from_slice(&[t0, t1, psrm, psm, c0, c1, allow_role_switch]);
        self.send_command(opcode::CREATE_CONNECTION, &params)
    }

    /// Disconnect the link to `addr`
    ///
    /// # Errors
    /// Returns `Connection` when there is no link to `addr`
    pub fn disconnect(&mut self, addr: BluetoothAddress, reason: u8) -> Result<(), BluetoothError> {
        let [h0, h1] = self.link_handle(&addr)?.to_le_bytes();
        self.send_command(opcode::DISCONNECT, &[h0, h1, reason])
    }

    /// Accept an incoming connection, `role` 0x00 to become master
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn accept_connection_request(
        &mut self,
        addr: BluetoothAddress,
        role: u8,
    ) -> Result<(), BluetoothError> {
        let mut params = [0u8; 7];
        params[..6].copy_from_slice(addr.as_bytes());
        params[6] = role;
        self.send_command(opcode::ACCEPT_CONNECTION_REQUEST, &params)
    }

    /// Reject an incoming connection
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn reject_connection_request(
        &mut self,
        addr: BluetoothAddress,
        reason: u8,
    ) -> Result<(), BluetoothError> {
        let mut params = [0u8; 7];
        params[..6].copy_from_slice(addr.as_bytes());
        params[6] = reason;
        self.send_command(opcode::REJECT_CONNECTION_REQUEST, &params)
    }

    /// Answer a link key request with a key
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn link_key_request_reply(
        &mut self,
        addr: BluetoothAddress,
        key: &[u8; LINK_KEY_LENGTH],
    ) -> Result<(), BluetoothError> {
        let mut params = [0u8; 6 + LINK_KEY_LENGTH];
        params[..6].copy_from_slice(addr.as_bytes());
        params[6..].copy_from_slice(key);
        self.send_command(opcode::LINK_KEY_REQUEST_REPLY, &params)
    }

    /// Tell the controller no link key is known for `addr`
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn link_key_request_negative_reply(
        &mut self,
        addr: BluetoothAddress,
    ) -> Result<(), BluetoothError> {
        self.send_command(opcode::LINK_KEY_REQUEST_NEGATIVE_REPLY, addr.as_bytes())
    }

    /// Answer a PIN code request
    ///
    /// # Errors
    /// Returns `InvalidParameter` for an empty PIN or one longer than 16 bytes
    pub fn pin_code_request_reply(
        &mut self,
        addr: BluetoothAddress,
        pin: &[u8],
    ) -> Result<(), BluetoothError> {
        if pin.is_empty() || pin.len() > PIN_CODE_MAX_LENGTH {
            return Err(BluetoothError::InvalidParameter);
        }
        let pin_len = u8::try_from(pin.len()).map_err(|_| BluetoothError::InvalidParameter)?;
        let mut params = [0u8; 7 + PIN_CODE_MAX_LENGTH];
        params[..6].copy_from_slice(addr.as_bytes());
        params[6] = pin_len;
        params[7..7 + pin.len()].copy_from_slice(pin);
        self.send_command(opcode::PIN_CODE_REQUEST_REPLY, &params)
    }

    /// Refuse a PIN code request
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn pin_code_request_negative_reply(
        &mut self,
        addr: BluetoothAddress,
    ) -> Result<(), BluetoothError> {
        self.send_command(opcode::PIN_CODE_REQUEST_NEGATIVE_REPLY, addr.as_bytes())
    }

    /// Ask for the user-friendly name of `addr`
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn remote_name_request(&mut self, addr: BluetoothAddress) -> Result<(), BluetoothError> {
        let (psrm, psm, clock_offset) = self.hci.page_params(&addr);
        let [c0, c1] = clock_offset.to_le_bytes();
        let mut params = [0u8; 10];
        params[..6].copy_from_slice(addr.as_bytes());
        params[6..].copy_from_slice(&[psrm, psm, c0, c1]);
        self.send_command(opcode::REMOTE_NAME_REQUEST, &params)
    }

    /// Put the link to `addr` into sniff mode
    ///
    /// # Errors
    /// Returns `Connection` when there is no link to `addr`
    pub fn sniff_mode(
        &mut self,
        addr: BluetoothAddress,
        max_interval: u16,
        min_interval: u16,
        attempt: u16,
        timeout: u16,
    ) -> Result<(), BluetoothError> {
        let handle = self.link_handle(&addr)?;
        let mut params = [0u8; 10];
        for (chunk, value) in params
            .chunks_exact_mut(2)
            .zip([handle, max_interval, min_interval, attempt, timeout])
        {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        self.send_command(opcode::SNIFF_MODE, &params)
    }

    /// Write the link policy of the link to `addr`
    ///
    /// The link records the new policy once the controller confirms it.
    ///
    /// # Errors
    /// Returns `Connection` when there is no link to `addr`
    pub fn write_link_policy_settings(
        &mut self,
        addr: BluetoothAddress,
        policy: u16,
    ) -> Result<(), BluetoothError> {
        let handle = self.link_handle(&addr)?;
        if let Some(link) = self
            .hci
            .link_id(&addr)
            .and_then(|id| self.hci.links.get_mut(id))
        {
            link.requested_policy = policy;
        }
        let [h0, h1] = handle.to_le_bytes();
        let [p0, p1] = policy.to_le_bytes();
        self.send_command(opcode::WRITE_LINK_POLICY_SETTINGS, &[h0, h1, p0, p1])
    }

    /// Set which events the controller reports
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn set_event_mask(&mut self, mask: u64) -> Result<(), BluetoothError> {
        self.send_command(opcode::SET_EVENT_MASK, &mask.to_le_bytes())
    }

    /// Reset the controller
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn reset(&mut self) -> Result<(), BluetoothError> {
        self.send_command(opcode::RESET, &[])
    }

    /// Install an event filter
    ///
    /// `condition` must hold at least as many bytes as the filter type needs.
    ///
    /// # Errors
    /// Returns `InvalidParameter` for an unknown filter or a short condition
    pub fn set_event_filter(
        &mut self,
        filter_type: u8,
        condition_type: u8,
        condition: &[u8],
    ) -> Result<(), BluetoothError> {
        let cond_len = event_filter_condition_len(filter_type, condition_type)
            .ok_or(BluetoothError::InvalidParameter)?;
        let cond = condition
            .get(..cond_len)
            .ok_or(BluetoothError::InvalidParameter)?;
        let mut params = [0u8; 9];
        params[0] = filter_type;
        params[1] = condition_type;
        params[2..2 + cond_len].copy_from_slice(cond);
        let plen = if filter_type == 0 { 1 } else { 2 + cond_len };
        self.send_command(opcode::SET_EVENT_FILTER, &params[..plen])
    }

    /// Read every link key stored in the controller
    ///
    /// Keys come back in Return Link Keys events and replace the previous read.
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn read_stored_link_key(&mut self) -> Result<(), BluetoothError> {
        self.hci.link_keys.clear();
        let own = self.hci.info.bd_addr.unwrap_or(BluetoothAddress::ANY);
        let mut params = [0u8; 7];
        params[..6].copy_from_slice(own.as_bytes());
        params[6] = 0x01;
        self.send_command(opcode::READ_STORED_LINK_KEY, &params)
    }

    /// Store one link key in the controller
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn write_stored_link_key(
        &mut self,
        addr: BluetoothAddress,
        key: &[u8; LINK_KEY_LENGTH],
    ) -> Result<(), BluetoothError> {
        let mut params = [0u8; 7 + LINK_KEY_LENGTH];
        params[0] = 0x01;
        params[1..7].copy_from_slice(addr.as_bytes());
        params[7..].copy_from_slice(key);
        self.send_command(opcode::WRITE_STORED_LINK_KEY, &params)
    }

    /// Write the local name, truncated to the 248-byte field
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn write_local_name(&mut self, name: &[u8]) -> Result<(), BluetoothError> {
        let mut params = [0u8; HCI_LOCAL_NAME_LENGTH];
        let len = name.len().min(HCI_LOCAL_NAME_LENGTH);
        params[..len].copy_from_slice(&name[..len]);
        self.send_command(opcode::WRITE_LOCAL_NAME, &params)
    }

    /// Write the page timeout in 0.625 ms slots
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn write_page_timeout(&mut self, timeout: u16) -> Result<(), BluetoothError> {
        self.send_command(opcode::WRITE_PAGE_TIMEOUT, &timeout.to_le_bytes())
    }

    /// Enable inquiry and page scans (0 none, 1 inquiry, 2 page, 3 both)
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn write_scan_enable(&mut self, scan_enable: u8) -> Result<(), BluetoothError> {
        self.send_command(opcode::WRITE_SCAN_ENABLE, &[scan_enable])
    }

    /// Write the class of device, wire order
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn write_class_of_device(&mut self, cod: [u8; 3]) -> Result<(), BluetoothError> {
        self.send_command(opcode::WRITE_CLASS_OF_DEVICE, &cod)
    }

    /// Turn on controller-to-host flow control for ACL data
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn set_controller_to_host_flow_control(&mut self) -> Result<(), BluetoothError> {
        self.send_command(opcode::SET_CONTROLLER_TO_HOST_FLOW_CONTROL, &[0x01])
    }

    /// Tell the controller how much the host can buffer
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn host_buffer_size(&mut self) -> Result<(), BluetoothError> {
        let [a0, a1] = HCI_HOST_ACL_MAX_LEN.to_le_bytes();
        let [n0, n1] = HCI_HOST_MAX_NUM_ACL.to_le_bytes();
        let [s0, s1] = HOST_MAX_NUM_SCO.to_le_bytes();
        self.hci.host_num_acl = HCI_HOST_MAX_NUM_ACL;
        self.send_command(
            opcode::HOST_BUFFER_SIZE,
            &[a0, a1, HOST_SCO_MAX_LEN, n0, n1, s0, s1],
        )
    }

    /// Return `count` ACL buffers of `handle` to the controller
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn host_num_completed_packets(
        &mut self,
        handle: u16,
        count: u16,
    ) -> Result<(), BluetoothError> {
        let [h0, h1] = handle.to_le_bytes();
        let [c0, c1] = count.to_le_bytes();
        self.hci.host_num_acl = self.hci.host_num_acl.saturating_add(count);
        self.send_command(opcode::HOST_NUMBER_OF_COMPLETED_PACKETS, &[0x01, h0, h1, c0, c1])
    }

    /// Read the inquiry access codes the controller listens for
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn read_current_iac_lap(&mut self) -> Result<(), BluetoothError> {
        self.send_command(opcode::READ_CURRENT_IAC_LAP, &[])
    }

    /// Write the inquiry scan type (0 standard, 1 interlaced)
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn write_inquiry_scan_type(&mut self, scan_type: u8) -> Result<(), BluetoothError> {
        self.send_command(opcode::WRITE_INQUIRY_SCAN_TYPE, &[scan_type])
    }

    /// Write the inquiry result format (0 standard, 1 with RSSI)
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn write_inquiry_mode(&mut self, mode: u8) -> Result<(), BluetoothError> {
        self.send_command(opcode::WRITE_INQUIRY_MODE, &[mode])
    }

    /// Write the page scan type (0 standard, 1 interlaced)
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn write_page_scan_type(&mut self, scan_type: u8) -> Result<(), BluetoothError> {
        self.send_command(opcode::WRITE_PAGE_SCAN_TYPE, &[scan_type])
    }

    /// Write the PIN type (0 variable, 1 fixed)
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn write_pin_type(&mut self, pin_type: u8) -> Result<(), BluetoothError> {
        self.send_command(opcode::WRITE_PIN_TYPE, &[pin_type])
    }

    /// Read the local version information
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn read_local_version(&mut self) -> Result<(), BluetoothError> {
        self.send_command(opcode::READ_LOCAL_VERSION, &[])
    }

    /// Read the local supported features
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn read_local_features(&mut self) -> Result<(), BluetoothError> {
        self.send_command(opcode::READ_LOCAL_FEATURES, &[])
    }

    /// Read the controller's buffer sizes and ACL credits
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn read_buffer_size(&mut self) -> Result<(), BluetoothError> {
        self.send_command(opcode::READ_BUFFER_SIZE, &[])
    }

    /// Read the local `BD_ADDR`
    ///
    /// # Errors
    /// Returns the framing or bus error
    pub fn read_bd_addr(&mut self) -> Result<(), BluetoothError> {
        self.send_command(opcode::READ_BD_ADDR, &[])
    }

    /// Send a vendor-specific command
    ///
    /// # Errors
    /// Returns `InvalidParameter` if `data` is longer than 255 bytes, or the bus error
    pub fn vendor_specific_command(&mut self, ocf: u16, data: &[u8]) -> Result<(), BluetoothError> {
        self.send_command(Opcode::new(opcode::ogf::VENDOR, ocf), data)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::transport::testing::RecordingBus;
    use std::vec;

    const PEER: BluetoothAddress = BluetoothAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

    #[test]
    fn test_write_page_timeout_framing() {
        let mut stack = Stack::new(RecordingBus::default());
        stack.write_page_timeout(0x2000).unwrap();
        assert_eq!(stack.bus.frames, vec![vec![0x01, 0x18, 0x0C, 0x02, 0x00, 0x20]]);
        assert_eq!(stack.pbufs.descriptors_in_use(), 0);
    }

    #[test]
    fn test_command_headers() {
        let mut stack = Stack::new(RecordingBus::default());
        stack.reset().unwrap();
        stack.read_bd_addr().unwrap();
        stack.write_scan_enable(0x02).unwrap();
        stack.write_class_of_device([0x00, 0x04, 0x48]).unwrap();
        assert_eq!(
            stack.bus.frames,
            vec![
                vec![0x01, 0x03, 0x0C, 0x00],
                vec![0x01, 0x09, 0x10, 0x00],
                vec![0x01, 0x1A, 0x0C, 0x01, 0x02],
                vec![0x01, 0x24, 0x0C, 0x03, 0x00, 0x04, 0x48],
            ]
        );
    }

    #[test]
    fn test_host_buffer_size_parameters() {
        let mut stack = Stack::new(RecordingBus::default());
        stack.host_buffer_size().unwrap();
        assert_eq!(
            stack.bus.frames[0],
            vec![0x01, 0x33, 0x0C, 0x07, 0x9B, 0x06, 0xFF, 0x14, 0x00, 0x01, 0x00]
        );
        assert_eq!(stack.hci.host_num_acl, HCI_HOST_MAX_NUM_ACL);
    }

    #[test]
    fn test_create_connection_uses_inquiry_result() {
        let mut stack = Stack::new(RecordingBus::default());
        stack.lp_connect_req(PEER, 0x01).unwrap();
        let (_, _, params) = stack.bus.last_command().unwrap();
        assert_eq!(&params[..6], PEER.as_bytes());
        assert_eq!(&params[6..], &[0x18, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01]);
        assert!(stack.hci.link(&PEER).is_some());

        let other = BluetoothAddress([7; 6]);
        stack
            .register_device_info(other, [0, 0, 0], 0x02, 0x00, 0x1234)
            .unwrap();
        stack.lp_connect_req(other, 0x00).unwrap();
        let (_, _, params) = stack.bus.last_command().unwrap();
        assert_eq!(&params[6..], &[0x18, 0x00, 0x02, 0x00, 0x34, 0x12, 0x00]);
    }

    #[test]
    fn test_link_commands_need_a_link() {
        let mut stack = Stack::new(RecordingBus::default());
        assert_eq!(
            stack.disconnect(PEER, 0x13),
            Err(BluetoothError::Connection)
        );
        assert_eq!(
            stack.sniff_mode(PEER, 8, 4, 1, 0),
            Err(BluetoothError::Connection)
        );
        assert_eq!(
            stack.write_link_policy_settings(PEER, 0x0005),
            Err(BluetoothError::Connection)
        );
        assert!(stack.bus.frames.is_empty());
    }

    #[test]
    fn test_variable_length_commands() {
        let mut stack = Stack::new(RecordingBus::default());
        stack.write_local_name(b"wrenlink").unwrap();
        let (_, _, params) = stack.bus.last_command().unwrap();
        assert_eq!(params.len(), HCI_LOCAL_NAME_LENGTH);
        assert_eq!(&params[..9], b"wrenlink\0");

        stack.pin_code_request_reply(PEER, b"0000").unwrap();
        let (_, _, params) = stack.bus.last_command().unwrap();
        assert_eq!(params.len(), 23);
        assert_eq!(params[6], 4);
        assert_eq!(&params[7..11], b"0000");
        assert_eq!(
            stack.pin_code_request_reply(PEER, &[0; 17]),
            Err(BluetoothError::InvalidParameter)
        );

        stack.vendor_specific_command(0x4F, &[0]).unwrap();
        assert_eq!(
            stack.bus.frames.last().unwrap(),
            &vec![0x01, 0x4F, 0xFC, 0x01, 0x00]
        );
    }

    #[test]
    fn test_set_event_filter_condition_lengths() {
        let mut stack = Stack::new(RecordingBus::default());
        stack.set_event_filter(0x00, 0x00, &[]).unwrap();
        stack.set_event_filter(0x01, 0x01, &[1, 2, 3, 4, 5, 6]).unwrap();
        stack.set_event_filter(0x02, 0x00, &[0x02]).unwrap();
        let lens: std::vec::Vec<usize> = stack
            .bus
            .commands()
            .into_iter()
            .map(|(_, _, params)| params.len())
            .collect();
        assert_eq!(lens, vec![1, 8, 3]);
        assert_eq!(
            stack.set_event_filter(0x02, 0x01, &[0; 3]),
            Err(BluetoothError::InvalidParameter)
        );
    }

    #[test]
    fn test_refused_frame_is_released() {
        let mut stack = Stack::new(RecordingBus::default());
        stack.bus.refuse = true;
        assert_eq!(stack.reset(), Err(BluetoothError::Transport));
        assert_eq!(stack.pbufs.descriptors_in_use(), 0);
    }
}
