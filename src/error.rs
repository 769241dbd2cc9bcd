//! Error handling for sensorboard-rs
//!
//! This module defines the error taxonomy shared by the codec, the allocation
//! protocol and the logging engine, plus a Result alias for use throughout
//! the crate.
//!
//! # Propagation
//!
//! - Codec errors ([`BoardError::UnknownProcessorKind`], [`BoardError::TruncatedConfig`],
//!   [`BoardError::UnsupportedOnFirmware`]) always reach the immediate caller.
//! - Allocation failures roll back the partial route first, then surface.
//! - Log delivery errors ([`BoardError::UnknownLogEntry`], [`BoardError::UnhandledLogData`])
//!   are handed to an optional handler and never abort a download.

use thiserror::Error;

/// Main error type for sensorboard-rs operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BoardError {
    /// Processor config record starts with a discriminant we do not know
    #[error("Unknown processor kind: 0x{0:02X}")]
    UnknownProcessorKind(u8),

    /// Processor config record is shorter than its discriminant requires
    #[error("Truncated processor config 0x{kind:02X}: expected {expected} bytes, got {actual}")]
    TruncatedConfig {
        kind: u8,
        expected: usize,
        actual: usize,
    },

    /// A processor name is already bound by another live route
    #[error("Processor name '{0}' is already in use")]
    DuplicateProcessorName(String),

    /// The board did not reply with an identifier in time
    #[error("Timed out waiting for identifier from module 0x{module:02X} register 0x{register:02X}")]
    CreationTimeout { module: u8, register: u8 },

    /// The board did not answer a register read in time
    #[error("Timed out waiting for reply from module 0x{module:02X} register 0x{register:02X}")]
    ReadTimeout { module: u8, register: u8 },

    /// The connection dropped while a request was in flight
    #[error("Connection to the board was lost")]
    ConnectionLost,

    /// A log entry arrived for a slot with no registered logger
    #[error("Log entry for unknown slot {slot}")]
    UnknownLogEntry { slot: u8 },

    /// A log entry arrived for a logger nobody subscribed to
    #[error("Log data for slot {slot} has no subscriber")]
    UnhandledLogData { slot: u8 },

    /// The connected firmware/revision cannot express the request
    #[error("Unsupported on firmware {firmware} (revision {revision}): {feature}")]
    UnsupportedOnFirmware {
        feature: String,
        firmware: String,
        revision: u8,
    },

    /// A processor parameter is outside the range its wire field can carry
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Attributes describe bytes beyond the source register's reply
    #[error("Attributes out of range: offset {offset} + length {length} exceeds {limit} bytes")]
    AttributeOutOfRange {
        offset: usize,
        length: usize,
        limit: usize,
    },

    /// Producer id does not refer to a live producer
    #[error("Unknown producer: {0}")]
    UnknownProducer(String),

    /// Route id does not refer to a committed route
    #[error("Unknown route: {0}")]
    UnknownRoute(String),

    /// The declared route cannot be turned into device commands
    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    /// Errors reported by the transport collaborator
    #[error("Transport error: {0}")]
    Transport(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<BoardError>,
    },
}

impl BoardError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        BoardError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip any context wrappers and return the underlying error
    pub fn root(&self) -> &BoardError {
        match self {
            BoardError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<std::io::Error> for BoardError {
    fn from(err: std::io::Error) -> Self {
        BoardError::Io(err.to_string())
    }
}

/// Result type alias for sensorboard-rs operations
pub type Result<T> = std::result::Result<T, BoardError>;

/// Wraps the error of a [`Result`] in a [`BoardError::WithContext`]
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}
