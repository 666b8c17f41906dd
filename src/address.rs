use crate::BluetoothError;

/// A Bluetooth Device Address (`BD_ADDR`) in wire (little-endian) byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BluetoothAddress(pub [u8; 6]);

impl BluetoothAddress {
    /// The all-zero address, used by listeners that accept any peer
    pub const ANY: Self = Self([0; 6]);

    /// Length of a `BD_ADDR` on the wire
    pub const SIZE: usize = 6;

    /// Create a new Bluetooth address from bytes
    #[must_use]
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Get the raw address bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Whether this is the wildcard address
    #[must_use]
    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }

    /// Read an address stored at `offset` of an HCI parameter block
    ///
    /// # Errors
    /// Returns `BluetoothError::InvalidParameter` if fewer than six bytes are available
    pub fn read_from(bytes: &[u8], offset: usize) -> Result<Self, BluetoothError> {
        bytes
            .get(offset..offset + Self::SIZE)
            .ok_or(BluetoothError::InvalidParameter)?
            .try_into()
    }

    /// Format the address most-significant byte first, colon separated
    #[must_use]
    pub fn format_hex(&self) -> heapless::String<17> {
        const HEX: &[u8; 16] = b"0123456789ABCDEF";
        let mut result = heapless::String::new();
        for (i, byte) in self.0.iter().rev().enumerate() {
            if i > 0 {
                result.push(':').ok();
            }
            result.push(char::from(HEX[usize::from(byte >> 4)])).ok();
            result.push(char::from(HEX[usize::from(byte & 0x0F)])).ok();
        }
        result
    }

    /// Parse an address written most-significant byte first, colon separated
    ///
    /// # Errors
    /// Returns `BluetoothError::InvalidParameter` if the string is not six colon separated hex octets
    pub fn from_hex(hex: &str) -> Result<Self, BluetoothError> {
        if hex.len() != 17 || !hex.chars().all(|c| c.is_ascii_hexdigit() || c == ':') {
            return Err(BluetoothError::InvalidParameter);
        }

        let mut bytes = [0u8; 6];
        for (i, octet) in hex.split(':').enumerate() {
            if i >= 6 || octet.len() != 2 {
                return Err(BluetoothError::InvalidParameter);
            }
            bytes[5 - i] =
                u8::from_str_radix(octet, 16).map_err(|_| BluetoothError::InvalidParameter)?;
        }
        Ok(Self(bytes))
    }
}

impl core::fmt::Display for BluetoothAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.format_hex().as_str())
    }
}

impl From<[u8; 6]> for BluetoothAddress {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<BluetoothAddress> for [u8; 6] {
    fn from(addr: BluetoothAddress) -> Self {
        addr.0
    }
}

impl From<BluetoothAddress> for bt_hci::param::BdAddr {
    fn from(addr: BluetoothAddress) -> Self {
        bt_hci::param::BdAddr::new(addr.0)
    }
}

impl TryFrom<&str> for BluetoothAddress {
    type Error = BluetoothError;

    fn try_from(hex: &str) -> Result<Self, Self::Error> {
        BluetoothAddress::from_hex(hex)
    }
}

impl TryFrom<&[u8]> for BluetoothAddress {
    type Error = BluetoothError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let addr: [u8; 6] = bytes
            .try_into()
            .map_err(|_| BluetoothError::InvalidParameter)?;
        Ok(BluetoothAddress(addr))
    }
}

impl TryFrom<bt_hci::param::BdAddr> for BluetoothAddress {
    type Error = BluetoothError;

    fn try_from(bd_addr: bt_hci::param::BdAddr) -> Result<Self, Self::Error> {
        bd_addr.raw().try_into()
    }
}
