//! Advertised service UUIDs.
//!
//! Advertisements carry 16-, 32- or 128-bit service UUIDs. All forms are
//! normalised to 128 bits on the Bluetooth base UUID so they compare equal.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`.
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// A 128-bit service UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceUuid(pub u128);

impl ServiceUuid {
    pub const fn from_u16(short: u16) -> Self {
        Self(((short as u128) << 96) | BLUETOOTH_BASE_UUID)
    }

    pub const fn from_u32(short: u32) -> Self {
        Self(((short as u128) << 96) | BLUETOOTH_BASE_UUID)
    }

    /// Parse a 128-bit UUID from the little-endian byte order used in advertisements.
    pub fn from_le_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(u128::from_le_bytes(bytes)))
    }
}

impl fmt::Display for ServiceUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xFFFF_FFFF_FFFF
        )
    }
}

/// Errors returned when parsing a service UUID string.
#[derive(Error, Debug, PartialEq)]
pub enum ParseUuidError {
    #[error("invalid UUID: expected 4, 8 or 36 characters, got {0}")]
    InvalidLength(usize),
    #[error("invalid UUID: '{0}' is not valid hex")]
    InvalidHex(String),
    #[error("invalid UUID: misplaced hyphens in '{0}'")]
    InvalidFormat(String),
}

impl FromStr for ServiceUuid {
    type Err = ParseUuidError;

    /// Accepts the short forms (`180f`, `0000180f`) and the canonical
    /// hyphenated 36-character form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if !s.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return Err(ParseUuidError::InvalidHex(s.to_string()));
        }
        let hex = |digits: &str| {
            u128::from_str_radix(digits, 16).map_err(|_| ParseUuidError::InvalidHex(s.to_string()))
        };

        match s.len() {
            4 | 8 => Ok(Self::from_u32(hex(s)? as u32)),
            36 => {
                let groups: Vec<&str> = s.split('-').collect();
                let lengths: Vec<usize> = groups.iter().map(|g| g.len()).collect();
                if lengths != [8, 4, 4, 4, 12] {
                    return Err(ParseUuidError::InvalidFormat(s.to_string()));
                }
                Ok(Self(hex(&groups.concat())?))
            }
            other => Err(ParseUuidError::InvalidLength(other)),
        }
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Uuid> for ServiceUuid {
    fn from(uuid: bluer::Uuid) -> Self {
        Self(uuid.as_u128())
    }
}
