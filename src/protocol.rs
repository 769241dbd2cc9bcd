//! Register map and command framing for the board
//!
//! Every command sent to the board is `[module, register, entity?, params...]`.
//! Setting the high bit of `register` turns a write into a read; the board
//! answers reads (and identifier-yielding writes) on the same
//! `[module, register]` pair.

/// Bit that marks a register access as a read
pub const READ_BIT: u8 = 0x80;

/// Data processor module
pub mod processor {
    pub const MODULE: u8 = 0x09;
    /// Create a processor (replies with its id)
    pub const ADD: u8 = 0x02;
    /// Processor output notifications
    pub const NOTIFY: u8 = 0x03;
    /// Processor internal state (write resets/overwrites it)
    pub const STATE: u8 = 0x04;
    /// Processor configuration (write modifies, read returns the config record)
    pub const PARAMETER: u8 = 0x05;
    pub const REMOVE: u8 = 0x06;
    pub const NOTIFY_ENABLE: u8 = 0x07;
    pub const REMOVE_ALL: u8 = 0x08;
}

/// Event module
pub mod event {
    pub const MODULE: u8 = 0x0a;
    /// Bind a source to a destination command (replies with its id)
    pub const ENTRY: u8 = 0x02;
    /// Parameters of the command bound by the preceding entry
    pub const CMD_PARAMETERS: u8 = 0x03;
    pub const REMOVE: u8 = 0x04;
    pub const REMOVE_ALL: u8 = 0x05;
}

/// Logging module
pub mod logging {
    pub const MODULE: u8 = 0x0b;
    pub const ENABLE: u8 = 0x01;
    /// Create a log trigger (replies with its slot id); read returns the trigger
    pub const TRIGGER: u8 = 0x02;
    pub const REMOVE: u8 = 0x03;
    /// Read returns `[tick u32, reset uid]`
    pub const TIME: u8 = 0x04;
    /// Read returns the number of stored entries
    pub const LENGTH: u8 = 0x05;
    pub const READOUT: u8 = 0x06;
    /// Stored entries, up to two per notification
    pub const READOUT_NOTIFY: u8 = 0x07;
    pub const READOUT_PROGRESS: u8 = 0x08;
    pub const REMOVE_ENTRIES: u8 = 0x09;
    pub const REMOVE_ALL: u8 = 0x0a;
    pub const READOUT_PAGE_COMPLETED: u8 = 0x0d;
    pub const READOUT_PAGE_CONFIRM: u8 = 0x0e;
}

/// Timer module
pub mod timer {
    pub const MODULE: u8 = 0x0c;
    /// Create a timer (replies with its id)
    pub const ENTRY: u8 = 0x02;
    pub const START: u8 = 0x03;
    pub const STOP: u8 = 0x04;
    pub const REMOVE: u8 = 0x05;
    pub const NOTIFY: u8 = 0x06;
}

/// Bytes of one producer value a single log slot can hold
pub const LOG_SLOT_SIZE: usize = 4;

/// Size of one stored log entry inside a readout notification
pub const LOG_ENTRY_SIZE: usize = 9;

/// Build a read command for `register` of `module`
pub fn read(module: u8, register: u8) -> Vec<u8> {
    vec![module, register | READ_BIT]
}

/// Build a read command addressing a single entity
pub fn read_entity(module: u8, register: u8, entity: u8) -> Vec<u8> {
    vec![module, register | READ_BIT, entity]
}

/// Render bytes as a compact hex string for diagnostics
pub fn hex(bytes: &[u8]) -> String {
    let parts: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_sets_high_bit() {
        assert_eq!(read(logging::MODULE, logging::LENGTH), vec![0x0b, 0x85]);
    }

    #[test]
    fn test_read_entity_addresses_one_entity() {
        assert_eq!(
            read_entity(logging::MODULE, logging::TRIGGER, 7),
            vec![0x0b, 0x82, 0x07]
        );
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x0b, 0x85]), "[0b, 85]");
    }
}
