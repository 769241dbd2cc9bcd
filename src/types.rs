//! Core data types for sensorboard-rs
//!
//! This module contains small value types shared by every subsystem.
//!
//! # Main Types
//!
//! - [`FirmwareVersion`] - Semantic firmware version reported by the board
//! - [`ConnectionStatus`] - Current state of the board connection
//! - [`SourceKey`] - The `(module, register, data id)` triple that addresses a data stream

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BoardError;

/// Marker byte used in commands when a stream has no data id
pub const NO_DATA_ID: u8 = 0xff;

/// Firmware version reported by the board
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl FirmwareVersion {
    /// Create a new firmware version
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for FirmwareVersion {
    type Err = BoardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(BoardError::Config(format!(
                "Firmware version '{}' is not in major.minor.patch form",
                s
            )));
        }

        let parse = |part: &str| {
            part.parse::<u8>().map_err(|e| {
                BoardError::Config(format!("Invalid firmware version '{}': {}", s, e))
            })
        };

        Ok(Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

/// Connection status of the board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionStatus {
    /// Not connected
    #[default]
    Disconnected,
    /// Connected and ready for commands
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "Disconnected"),
            ConnectionStatus::Connected => write!(f, "Connected"),
        }
    }
}

/// Address of a data stream on the board
///
/// Commands that reference a stream as an input (processor creation, log
/// triggers, event bindings) carry these three bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceKey {
    pub module: u8,
    pub register: u8,
    pub data_id: u8,
}

impl SourceKey {
    /// Create a key; `None` maps to [`NO_DATA_ID`]
    pub fn new(module: u8, register: u8, data_id: Option<u8>) -> Self {
        Self {
            module,
            register,
            data_id: data_id.unwrap_or(NO_DATA_ID),
        }
    }

    /// The three bytes as they appear in a command
    pub fn to_bytes(self) -> [u8; 3] {
        [self.module, self.register, self.data_id]
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:02x}, {:02x}, {:02x}]",
            self.module, self.register, self.data_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_version_ordering() {
        let old = FirmwareVersion::new(1, 2, 2);
        let new = FirmwareVersion::new(1, 2, 3);
        assert!(old < new);
        assert!(FirmwareVersion::new(1, 3, 0) > new);
    }

    #[test]
    fn test_firmware_version_parse() {
        let v: FirmwareVersion = "1.5.0".parse().unwrap();
        assert_eq!(v, FirmwareVersion::new(1, 5, 0));
        assert_eq!(v.to_string(), "1.5.0");

        assert!("1.5".parse::<FirmwareVersion>().is_err());
        assert!("1.x.0".parse::<FirmwareVersion>().is_err());
    }

    #[test]
    fn test_source_key_bytes() {
        let key = SourceKey::new(0x03, 0x04, None);
        assert_eq!(key.to_bytes(), [0x03, 0x04, 0xff]);
    }
}
