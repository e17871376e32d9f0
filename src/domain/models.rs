use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 48-bit Bluetooth device address.
///
/// Stored the way the radio stacks hand it out (a `u64` with the upper
/// 16 bits clear) and displayed in the usual `AA:BB:CC:DD:EE:FF` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    const MASK: u64 = 0xFFFF_FFFF_FFFF;

    pub fn new(raw: u64) -> Self {
        Self(raw & Self::MASK)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for DeviceAddress {
    fn from(raw: u64) -> Self {
        Self::new(raw)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid Bluetooth address: {0}")]
pub struct AddressParseError(String);

impl FromStr for DeviceAddress {
    type Err = AddressParseError;

    /// Accepts `AA:BB:CC:DD:EE:FF`, `AA-BB-...` or a bare hex number
    /// (with or without `0x`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let err = || AddressParseError(s.to_string());

        if trimmed.contains(':') || trimmed.contains('-') {
            let parts: Vec<&str> = trimmed.split([':', '-']).collect();
            if parts.len() != 6 {
                return Err(err());
            }
            let mut raw = 0u64;
            for part in parts {
                if part.len() != 2 {
                    return Err(err());
                }
                let byte = u8::from_str_radix(part, 16).map_err(|_| err())?;
                raw = (raw << 8) | byte as u64;
            }
            return Ok(Self(raw));
        }

        let hex = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let raw = u64::from_str_radix(hex, 16).map_err(|_| err())?;
        if raw > Self::MASK {
            return Err(err());
        }
        Ok(Self(raw))
    }
}

/// Coarse connection status as seen by a UI collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Events from the telemetry service to the application layer.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    ConnectionStatus {
        address: DeviceAddress,
        status: ConnectionStatus,
    },
    MtuChanged {
        address: DeviceAddress,
        mtu: u16,
    },
}
