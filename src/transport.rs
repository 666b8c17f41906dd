//! Physical bus interface
//!
//! The stack frames complete HCI packets (packet indicator included) and hands
//! them to a [`PhysBus`] as a [`Frame`]: a header buffer followed by a byte range
//! of a payload chain, so ACL fragments go out without copying the payload.
//! Inbound traffic is pushed the other way, through
//! [`crate::Stack::hci_event_input`] and [`crate::Stack::acl_input`].

use crate::BluetoothError;
use crate::pbuf::{PbufPool, Segments};

/// One framed HCI packet ready for transmission
#[derive(Debug, Clone)]
pub struct Frame<'a> {
    head: Segments<'a>,
    body: Segments<'a>,
    len: usize,
}

impl<'a> Frame<'a> {
    pub(crate) fn new(head: Segments<'a>, body: Segments<'a>, len: usize) -> Self {
        Self { head, body, len }
    }

    pub(crate) fn single(pool: &'a PbufPool, head: Segments<'a>, len: usize) -> Self {
        Self::new(head, Segments::empty(pool), len)
    }

    /// Total number of bytes in the frame
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the frame carries no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Contiguous pieces of the frame in transmission order
    pub fn parts(&self) -> impl Iterator<Item = &'a [u8]> + use<'a> {
        self.head.clone().chain(self.body.clone())
    }

    /// Copy the frame into `out`, returning the number of bytes written
    ///
    /// # Errors
    /// Returns `BluetoothError::MtuExceeded` if `out` is shorter than the frame
    pub fn copy_to(&self, out: &mut [u8]) -> Result<usize, BluetoothError> {
        if out.len() < self.len {
            return Err(BluetoothError::MtuExceeded);
        }
        let mut written = 0;
        for part in self.parts() {
            out[written..written + part.len()].copy_from_slice(part);
            written += part.len();
        }
        Ok(written)
    }
}

/// Transport binding the stack to a controller
pub trait PhysBus {
    /// Queue one framed HCI command or ACL packet for transmission
    ///
    /// # Errors
    /// Returns `BluetoothError::Transport` if the bus cannot accept the frame
    fn output(&mut self, frame: Frame<'_>) -> Result<(), BluetoothError>;

    /// Release the bus after the controller has been shut down
    fn close(&mut self) {}
}

#[cfg(test)]
pub(crate) mod testing {
    extern crate std;

    use super::{Frame, PhysBus};
    use crate::BluetoothError;
    use std::vec::Vec;

    /// Bus double that keeps every transmitted frame
    #[derive(Debug, Default)]
    pub(crate) struct RecordingBus {
        pub frames: Vec<Vec<u8>>,
        pub closed: bool,
        pub refuse: bool,
    }

    impl RecordingBus {
        /// Frames that are HCI commands, as `(ogf, ocf, params)`
        pub fn commands(&self) -> Vec<(u8, u16, Vec<u8>)> {
            self.frames
                .iter()
                .filter(|f| f.first() == Some(&0x01) && f.len() >= 4)
                .map(|f| {
                    let opcode = u16::from_le_bytes([f[1], f[2]]);
                    #[allow(clippy::cast_possible_truncation)]
                    let ogf = (opcode >> 10) as u8;
                    (ogf, opcode & 0x03FF, f[4..].to_vec())
                })
                .collect()
        }

        /// Frames that are ACL data packets
        pub fn acl(&self) -> Vec<Vec<u8>> {
            self.frames
                .iter()
                .filter(|f| f.first() == Some(&0x02))
                .cloned()
                .collect()
        }

        pub fn last_command(&self) -> Option<(u8, u16, Vec<u8>)> {
            self.commands().pop()
        }

        pub fn clear(&mut self) {
            self.frames.clear();
        }
    }

    impl PhysBus for RecordingBus {
        fn output(&mut self, frame: Frame<'_>) -> Result<(), BluetoothError> {
            if self.refuse {
                return Err(BluetoothError::Transport);
            }
            let mut bytes = Vec::with_capacity(frame.len());
            for part in frame.parts() {
                bytes.extend_from_slice(part);
            }
            assert_eq!(bytes.len(), frame.len());
            self.frames.push(bytes);
            Ok(())
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }
}
