//! Transport seam between the protocol engine and the radio link
//!
//! The session never talks to a radio stack directly. It writes commands
//! through a [`Transport`] and receives everything the board sends back as
//! [`Notification`]s on a crossbeam channel, delivered in arrival order.
//!
//! # Implementations
//!
//! - [`RecordingTransport`] - Records every command; used to drive a session
//!   deterministically from tests
//! - [`MockBoard`] - Simulated board that allocates ids and streams log
//!   entries (feature `mock-board`)

#[cfg(feature = "mock-board")]
pub mod mock;

#[cfg(feature = "mock-board")]
pub use mock::{MockBoard, MockController};

use crate::error::{BoardError, Result};
use crate::types::FirmwareVersion;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Something the board sent, or a change of link state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Raw notification bytes `[module, register, ...]`
    Data(Vec<u8>),
    /// The link came up; carries the firmware the board reports
    Connected(FirmwareVersion),
    /// The link dropped
    Disconnected,
}

/// Statistics for transport operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Commands written successfully
    pub commands_sent: u64,
    /// Commands the transport refused
    pub failed_sends: u64,
    /// Total command bytes written
    pub bytes_sent: u64,
}

impl TransportStats {
    /// Record a successful write
    pub fn record_send(&mut self, bytes: usize) {
        self.commands_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Record a refused write
    pub fn record_failure(&mut self) {
        self.failed_sends += 1;
    }

    /// Percentage of writes that succeeded
    pub fn success_rate(&self) -> f64 {
        let total = self.commands_sent + self.failed_sends;
        if total == 0 {
            100.0
        } else {
            (self.commands_sent as f64 / total as f64) * 100.0
        }
    }

    /// Reset all statistics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Write side of the board link
///
/// Implementations must be `Send` so the session can live on the board
/// worker thread.
///
/// # Example
///
/// ```ignore
/// fn remove_processor(transport: &mut dyn Transport, id: u8) -> Result<()> {
///     transport.send(&[0x09, 0x06, id])
/// }
/// ```
pub trait Transport: Send {
    /// Write one command `[module, register, params...]`
    fn send(&mut self, command: &[u8]) -> Result<()>;

    /// Whether the link is up
    fn is_connected(&self) -> bool;

    /// Firmware version the board reported during discovery
    fn firmware_version(&self) -> FirmwareVersion;

    /// Implementation revision of a module, as reported during discovery
    fn module_revision(&self, module: u8) -> u8;

    /// Get transport statistics
    fn stats(&self) -> &TransportStats;

    /// Get mutable reference to transport statistics
    fn stats_mut(&mut self) -> &mut TransportStats;

    /// Reset transport statistics
    fn reset_stats(&mut self) {
        self.stats_mut().reset();
    }
}

/// Commands written through a [`RecordingTransport`], shared with the test
pub type SentLog = Arc<Mutex<Vec<Vec<u8>>>>;

type FailurePredicate = Box<dyn Fn(&[u8]) -> bool + Send>;

/// Transport that only records what it is asked to send
///
/// Replies are injected by the caller, which makes command ordering fully
/// observable.
pub struct RecordingTransport {
    sent: SentLog,
    firmware: FirmwareVersion,
    revisions: HashMap<u8, u8>,
    connected: bool,
    fail_when: Option<FailurePredicate>,
    stats: TransportStats,
}

impl RecordingTransport {
    /// Create a connected transport and the log of commands it records
    pub fn new(firmware: FirmwareVersion) -> (Self, SentLog) {
        let sent: SentLog = Arc::new(Mutex::new(Vec::new()));
        let transport = Self {
            sent: sent.clone(),
            firmware,
            revisions: HashMap::new(),
            connected: true,
            fail_when: None,
            stats: TransportStats::default(),
        };
        (transport, sent)
    }

    /// Report `revision` for `module`
    pub fn with_revision(mut self, module: u8, revision: u8) -> Self {
        self.revisions.insert(module, revision);
        self
    }

    /// Refuse every command matching `predicate`
    pub fn fail_when(mut self, predicate: impl Fn(&[u8]) -> bool + Send + 'static) -> Self {
        self.fail_when = Some(Box::new(predicate));
        self
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, command: &[u8]) -> Result<()> {
        if !self.connected {
            self.stats.record_failure();
            return Err(BoardError::ConnectionLost);
        }
        if self.fail_when.as_ref().is_some_and(|f| f(command)) {
            self.stats.record_failure();
            return Err(BoardError::Transport(format!(
                "write of {} refused",
                crate::protocol::hex(command)
            )));
        }

        self.sent
            .lock()
            .map_err(|_| BoardError::Transport("sent log poisoned".to_string()))?
            .push(command.to_vec());
        self.stats.record_send(command.len());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn firmware_version(&self) -> FirmwareVersion {
        self.firmware
    }

    fn module_revision(&self, module: u8) -> u8 {
        self.revisions.get(&module).copied().unwrap_or(0)
    }

    fn stats(&self) -> &TransportStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut TransportStats {
        &mut self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_transport_records_in_order() {
        let (mut transport, sent) = RecordingTransport::new(FirmwareVersion::new(1, 5, 0));
        transport.send(&[0x0b, 0x85]).unwrap();
        transport.send(&[0x09, 0x06, 0x01]).unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.as_slice(), &[vec![0x0b, 0x85], vec![0x09, 0x06, 0x01]]);
        assert_eq!(transport.stats().commands_sent, 2);
        assert_eq!(transport.stats().bytes_sent, 5);
    }

    #[test]
    fn test_recording_transport_failure_injection() {
        let (transport, sent) = RecordingTransport::new(FirmwareVersion::default());
        let mut transport = transport
            .with_revision(0x09, 2)
            .fail_when(|cmd| cmd[0] == 0x0a);

        assert_eq!(transport.module_revision(0x09), 2);
        assert_eq!(transport.module_revision(0x0b), 0);
        assert!(transport.send(&[0x0a, 0x02]).is_err());
        assert!(sent.lock().unwrap().is_empty());
        assert_eq!(transport.stats().failed_sends, 1);
        assert!(transport.stats().success_rate() < 1.0);

        transport.reset_stats();
        assert_eq!(transport.stats(), &TransportStats::default());
    }
}
