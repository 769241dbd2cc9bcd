//! Stored log entry format
//!
//! ```text
//! byte 0      slot id (bits 0-4) | reset generation (bits 5-7)
//! bytes 1-4   tick, little endian
//! bytes 5-8   payload
//! ```

use crate::protocol::LOG_ENTRY_SIZE;

/// One stored log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub slot: u8,
    pub reset_uid: u8,
    pub tick: u32,
    pub payload: [u8; 4],
}

impl LogEntry {
    /// Parse one 9-byte entry
    pub fn parse(bytes: &[u8]) -> Option<LogEntry> {
        if bytes.len() < LOG_ENTRY_SIZE {
            return None;
        }
        Some(LogEntry {
            slot: bytes[0] & 0x1f,
            reset_uid: (bytes[0] >> 5) & 0x07,
            tick: u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            payload: [bytes[5], bytes[6], bytes[7], bytes[8]],
        })
    }

    /// Wire form of the entry
    pub fn to_bytes(&self) -> [u8; LOG_ENTRY_SIZE] {
        let mut bytes = [0u8; LOG_ENTRY_SIZE];
        bytes[0] = (self.slot & 0x1f) | ((self.reset_uid & 0x07) << 5);
        bytes[1..5].copy_from_slice(&self.tick.to_le_bytes());
        bytes[5..9].copy_from_slice(&self.payload);
        bytes
    }
}

/// Entries packed in a readout notification body (after `[0x0b, 0x07]`)
///
/// Trailing bytes too short for a whole entry are ignored.
pub fn parse_entries(body: &[u8]) -> Vec<LogEntry> {
    body.chunks_exact(LOG_ENTRY_SIZE)
        .filter_map(LogEntry::parse)
        .collect()
}
