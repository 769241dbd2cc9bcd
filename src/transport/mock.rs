//! Simulated board for tests and demos
//!
//! [`MockBoard`] implements [`Transport`] on top of an in-memory model of the
//! processor, event, logging and timer modules. Replies are pushed to the
//! notification channel synchronously from `send`, in the order the real
//! board would produce them.
//!
//! # Behaviour
//!
//! - **Allocation**: creation commands get the lowest free id of their module
//! - **Reads**: processor records, log triggers, the tick clock and the
//!   stored entry count are answered from the model
//! - **Log readout**: stored entries are streamed two per notification, with
//!   progress and page-completed notifications
//! - **Fault injection**: replies can be withheld and writes refused per
//!   `(module, register)` pair
//!
//! # Example
//!
//! ```ignore
//! use sensorboard::transport::MockBoard;
//!
//! let (board, notifications) = MockBoard::new(FirmwareVersion::new(1, 5, 0));
//! let control = board.controller();
//! control.push_log_entry(0, 100, [1, 2, 3, 4]);
//! ```

use super::{Notification, Transport, TransportStats};
use crate::error::{BoardError, Result};
use crate::protocol::{self, event, logging, processor, timer, LOG_ENTRY_SIZE, READ_BIT};
use crate::types::FirmwareVersion;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Entries after which the board asks for a page confirmation
const ENTRIES_PER_PAGE: usize = 16;

/// A stored event binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockEvent {
    /// Entry bytes after `[0x0a, 0x02]`
    pub entry: Vec<u8>,
    /// Command parameters sent with `[0x0a, 0x03]`
    pub params: Vec<u8>,
}

#[derive(Debug)]
struct MockState {
    firmware: FirmwareVersion,
    revisions: HashMap<u8, u8>,
    connected: bool,
    /// Processor id -> `[input4, config...]`
    processors: BTreeMap<u8, Vec<u8>>,
    /// Log slot -> `[module, register, data_id, source byte]`
    triggers: BTreeMap<u8, [u8; 4]>,
    events: BTreeMap<u8, MockEvent>,
    timers: BTreeMap<u8, Vec<u8>>,
    last_event: Option<u8>,
    entries: Vec<[u8; LOG_ENTRY_SIZE]>,
    read_cursor: usize,
    tick: u32,
    reset_uid: u8,
    silenced: HashSet<(u8, u8)>,
    refused: HashSet<(u8, u8)>,
    history: Vec<Vec<u8>>,
}

impl MockState {
    fn new(firmware: FirmwareVersion) -> Self {
        Self {
            firmware,
            revisions: HashMap::new(),
            connected: true,
            processors: BTreeMap::new(),
            triggers: BTreeMap::new(),
            events: BTreeMap::new(),
            timers: BTreeMap::new(),
            last_event: None,
            entries: Vec::new(),
            read_cursor: 0,
            tick: 0,
            reset_uid: 0,
            silenced: HashSet::new(),
            refused: HashSet::new(),
            history: Vec::new(),
        }
    }

    fn clear_entities(&mut self) {
        self.processors.clear();
        self.triggers.clear();
        self.events.clear();
        self.timers.clear();
        self.last_event = None;
    }

    /// Apply one command and collect the notifications it produces
    fn handle(&mut self, command: &[u8]) -> Vec<Vec<u8>> {
        let (module, register) = (command[0], command[1]);
        let params = &command[2..];
        let mut replies = Vec::new();

        match (module, register) {
            (processor::MODULE, processor::ADD) => {
                if let Some(id) = next_free(&self.processors) {
                    self.processors.insert(id, params.to_vec());
                    replies.push(vec![module, register, id]);
                }
            }
            (processor::MODULE, processor::PARAMETER) => {
                if let (Some(&id), Some(config)) = (params.first(), params.get(1..)) {
                    if let Some(record) = self.processors.get_mut(&id) {
                        record.truncate(4);
                        record.extend_from_slice(config);
                    }
                }
            }
            (processor::MODULE, processor::REMOVE) => {
                if let Some(id) = params.first() {
                    self.processors.remove(id);
                }
            }
            (processor::MODULE, processor::REMOVE_ALL) => self.processors.clear(),
            (processor::MODULE, r) if r == processor::ADD | READ_BIT => {
                if let Some(&id) = params.first() {
                    let mut reply = vec![module, register, id];
                    if let Some(record) = self.processors.get(&id) {
                        reply.extend_from_slice(record);
                    }
                    replies.push(reply);
                }
            }
            (event::MODULE, event::ENTRY) => {
                if let Some(id) = next_free(&self.events) {
                    self.events.insert(
                        id,
                        MockEvent {
                            entry: params.to_vec(),
                            params: Vec::new(),
                        },
                    );
                    self.last_event = Some(id);
                    replies.push(vec![module, register, id]);
                }
            }
            (event::MODULE, event::CMD_PARAMETERS) => {
                if let Some(stored) = self.last_event.and_then(|id| self.events.get_mut(&id)) {
                    stored.params = params.to_vec();
                }
            }
            (event::MODULE, event::REMOVE) => {
                if let Some(id) = params.first() {
                    self.events.remove(id);
                }
            }
            (event::MODULE, event::REMOVE_ALL) => self.events.clear(),
            (timer::MODULE, timer::ENTRY) => {
                if let Some(id) = next_free(&self.timers) {
                    self.timers.insert(id, params.to_vec());
                    replies.push(vec![module, register, id]);
                }
            }
            (timer::MODULE, timer::REMOVE) => {
                if let Some(id) = params.first() {
                    self.timers.remove(id);
                }
            }
            (logging::MODULE, logging::TRIGGER) if params.len() >= 4 => {
                if let Some(id) = next_free(&self.triggers) {
                    self.triggers
                        .insert(id, [params[0], params[1], params[2], params[3]]);
                    replies.push(vec![module, register, id]);
                }
            }
            (logging::MODULE, logging::REMOVE) => {
                if let Some(id) = params.first() {
                    self.triggers.remove(id);
                }
            }
            (logging::MODULE, logging::REMOVE_ALL) => self.triggers.clear(),
            (logging::MODULE, r) if r == logging::TRIGGER | READ_BIT => {
                if let Some(&slot) = params.first() {
                    let mut reply = vec![module, register, slot];
                    if let Some(trigger) = self.triggers.get(&slot) {
                        reply.extend_from_slice(trigger);
                    }
                    replies.push(reply);
                }
            }
            (logging::MODULE, r) if r == logging::TIME | READ_BIT => {
                let mut reply = vec![module, register];
                reply.extend_from_slice(&self.tick.to_le_bytes());
                reply.push(self.reset_uid);
                replies.push(reply);
            }
            (logging::MODULE, r) if r == logging::LENGTH | READ_BIT => {
                let remaining = (self.entries.len() - self.read_cursor) as u32;
                let mut reply = vec![module, register];
                reply.extend_from_slice(&remaining.to_le_bytes());
                replies.push(reply);
            }
            (logging::MODULE, logging::READOUT) if params.len() >= 8 => {
                let count = u32::from_le_bytes([params[0], params[1], params[2], params[3]]);
                let delta = u32::from_le_bytes([params[4], params[5], params[6], params[7]]);
                self.readout(count as usize, delta as usize, &mut replies);
            }
            (logging::MODULE, logging::REMOVE_ENTRIES) => {
                self.entries.drain(..self.read_cursor);
                self.read_cursor = 0;
            }
            _ => {}
        }

        replies
    }

    fn readout(&mut self, count: usize, delta: usize, replies: &mut Vec<Vec<u8>>) {
        let available = self.entries.len() - self.read_cursor;
        let count = count.min(available);
        let batch = &self.entries[self.read_cursor..self.read_cursor + count];

        let mut since_progress = 0;
        let mut sent = 0;
        for pair in batch.chunks(2) {
            let mut packet = vec![logging::MODULE, logging::READOUT_NOTIFY];
            for entry in pair {
                packet.extend_from_slice(entry);
            }
            replies.push(packet);

            sent += pair.len();
            since_progress += pair.len();
            if sent % ENTRIES_PER_PAGE < pair.len() && sent < count {
                replies.push(vec![logging::MODULE, logging::READOUT_PAGE_COMPLETED]);
            }
            if delta > 0 && since_progress >= delta && sent < count {
                since_progress = 0;
                let mut progress = vec![logging::MODULE, logging::READOUT_PROGRESS];
                progress.extend_from_slice(&((count - sent) as u32).to_le_bytes());
                replies.push(progress);
            }
        }

        self.read_cursor += count;
        let mut done = vec![logging::MODULE, logging::READOUT_PROGRESS];
        done.extend_from_slice(&0u32.to_le_bytes());
        replies.push(done);
    }
}

fn next_free<V>(map: &BTreeMap<u8, V>) -> Option<u8> {
    (0..=u8::MAX).find(|id| !map.contains_key(id))
}

fn lock(state: &Mutex<MockState>) -> Result<MutexGuard<'_, MockState>> {
    state
        .lock()
        .map_err(|_| BoardError::Transport("mock board state poisoned".to_string()))
}

/// Simulated board implementing [`Transport`]
pub struct MockBoard {
    state: Arc<Mutex<MockState>>,
    notifications: Sender<Notification>,
    stats: TransportStats,
}

impl MockBoard {
    /// Create a connected board and the channel its notifications arrive on
    pub fn new(firmware: FirmwareVersion) -> (Self, Receiver<Notification>) {
        let (tx, rx) = unbounded();
        let board = Self {
            state: Arc::new(Mutex::new(MockState::new(firmware))),
            notifications: tx,
            stats: TransportStats::default(),
        };
        (board, rx)
    }

    /// Report `revision` for `module`
    pub fn with_revision(self, module: u8, revision: u8) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.revisions.insert(module, revision);
        }
        self
    }

    /// Handle for driving and inspecting the board after the transport has
    /// been handed to a session
    pub fn controller(&self) -> MockController {
        MockController {
            state: self.state.clone(),
            notifications: self.notifications.clone(),
        }
    }
}

impl Transport for MockBoard {
    fn send(&mut self, command: &[u8]) -> Result<()> {
        if command.len() < 2 {
            self.stats.record_failure();
            return Err(BoardError::Transport(format!(
                "command {} is too short",
                protocol::hex(command)
            )));
        }

        let replies = {
            let mut state = lock(&self.state)?;
            if !state.connected {
                self.stats.record_failure();
                return Err(BoardError::ConnectionLost);
            }
            let key = (command[0], command[1]);
            if state.refused.contains(&key) {
                self.stats.record_failure();
                return Err(BoardError::Transport(format!(
                    "board rejected {}",
                    protocol::hex(command)
                )));
            }

            state.history.push(command.to_vec());
            let replies = state.handle(command);
            if state.silenced.contains(&key) {
                Vec::new()
            } else {
                replies
            }
        };

        self.stats.record_send(command.len());
        for reply in replies {
            tracing::trace!("mock board -> {}", protocol::hex(&reply));
            self.notifications
                .send(Notification::Data(reply))
                .map_err(|e| BoardError::Channel(e.to_string()))?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().map(|s| s.connected).unwrap_or(false)
    }

    fn firmware_version(&self) -> FirmwareVersion {
        self.state.lock().map(|s| s.firmware).unwrap_or_default()
    }

    fn module_revision(&self, module: u8) -> u8 {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.revisions.get(&module).copied())
            .unwrap_or(0)
    }

    fn stats(&self) -> &TransportStats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut TransportStats {
        &mut self.stats
    }
}

/// Test-side handle onto a [`MockBoard`]
#[derive(Clone)]
pub struct MockController {
    state: Arc<Mutex<MockState>>,
    notifications: Sender<Notification>,
}

impl MockController {
    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> Option<T> {
        self.state.lock().ok().map(|mut state| f(&mut state))
    }

    /// A fresh link to the same board, as seen by a restarted host
    ///
    /// Entities and stored entries carry over; this controller keeps
    /// notifying the old link.
    pub fn reattach(&self) -> (MockBoard, Receiver<Notification>) {
        let (tx, rx) = unbounded();
        let board = MockBoard {
            state: self.state.clone(),
            notifications: tx,
            stats: TransportStats::default(),
        };
        (board, rx)
    }

    /// Store a log entry for `slot` at `tick` in the current reset generation
    pub fn push_log_entry(&self, slot: u8, tick: u32, payload: [u8; 4]) {
        self.with_state(|s| {
            let mut entry = [0u8; LOG_ENTRY_SIZE];
            entry[0] = (slot & 0x1f) | (s.reset_uid << 5);
            entry[1..5].copy_from_slice(&tick.to_le_bytes());
            entry[5..9].copy_from_slice(&payload);
            s.entries.push(entry);
        });
    }

    /// Set the board's tick counter
    pub fn set_tick(&self, tick: u32) {
        self.with_state(|s| s.tick = tick);
    }

    /// Simulate a reboot: new reset generation, tick counter back to zero
    pub fn reboot(&self) {
        self.with_state(|s| {
            s.reset_uid = (s.reset_uid + 1) & 0x7;
            s.tick = 0;
        });
    }

    /// Current reset generation
    pub fn reset_uid(&self) -> u8 {
        self.with_state(|s| s.reset_uid).unwrap_or(0)
    }

    /// Drop the link
    pub fn disconnect(&self) {
        self.with_state(|s| s.connected = false);
        let _ = self.notifications.send(Notification::Disconnected);
    }

    /// Bring the link back up, optionally after a firmware update
    ///
    /// A firmware change wipes every entity, like a real flash does.
    pub fn connect(&self, firmware: Option<FirmwareVersion>) {
        let firmware = self
            .with_state(|s| {
                if let Some(fw) = firmware {
                    if fw != s.firmware {
                        s.clear_entities();
                        s.entries.clear();
                        s.read_cursor = 0;
                    }
                    s.firmware = fw;
                }
                s.connected = true;
                s.firmware
            })
            .unwrap_or_default();
        let _ = self.notifications.send(Notification::Connected(firmware));
    }

    /// Deliver raw bytes as if the board had notified them
    pub fn emit(&self, bytes: Vec<u8>) {
        let _ = self.notifications.send(Notification::Data(bytes));
    }

    /// Stop answering commands sent to `(module, register)`
    pub fn silence(&self, module: u8, register: u8) {
        self.with_state(|s| s.silenced.insert((module, register)));
    }

    /// Refuse writes to `(module, register)`
    pub fn refuse(&self, module: u8, register: u8) {
        self.with_state(|s| s.refused.insert((module, register)));
    }

    /// Undo [`silence`](Self::silence) and [`refuse`](Self::refuse)
    pub fn heal(&self) {
        self.with_state(|s| {
            s.silenced.clear();
            s.refused.clear();
        });
    }

    /// Live processors: id -> `[input4, config...]`
    pub fn processors(&self) -> BTreeMap<u8, Vec<u8>> {
        self.with_state(|s| s.processors.clone()).unwrap_or_default()
    }

    /// Live log triggers: slot -> `[module, register, data_id, source byte]`
    pub fn triggers(&self) -> BTreeMap<u8, [u8; 4]> {
        self.with_state(|s| s.triggers.clone()).unwrap_or_default()
    }

    /// Live event bindings
    pub fn events(&self) -> BTreeMap<u8, MockEvent> {
        self.with_state(|s| s.events.clone()).unwrap_or_default()
    }

    /// Live timers: id -> `[period u32, repetitions u16, immediate]`
    pub fn timers(&self) -> BTreeMap<u8, Vec<u8>> {
        self.with_state(|s| s.timers.clone()).unwrap_or_default()
    }

    /// Entries stored and not yet read out
    pub fn pending_entries(&self) -> usize {
        self.with_state(|s| s.entries.len() - s.read_cursor)
            .unwrap_or(0)
    }

    /// Entries still held by the board, read out or not
    pub fn stored_entries(&self) -> usize {
        self.with_state(|s| s.entries.len()).unwrap_or(0)
    }

    /// Every command the board accepted, in order
    pub fn history(&self) -> Vec<Vec<u8>> {
        self.with_state(|s| s.history.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> (MockBoard, Receiver<Notification>) {
        MockBoard::new(FirmwareVersion::new(1, 5, 0))
    }

    fn data(rx: &Receiver<Notification>) -> Vec<Vec<u8>> {
        rx.try_iter()
            .filter_map(|n| match n {
                Notification::Data(bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_ids_assigned_in_order() {
        let (mut board, rx) = board();
        board.send(&[0x09, 0x02, 0x03, 0x04, 0xff, 0xa0, 0x03, 0x15, 16]).unwrap();
        board.send(&[0x09, 0x02, 0x09, 0x03, 0x00, 0x20, 0x0f, 0x01]).unwrap();
        board.send(&[0x09, 0x06, 0x00]).unwrap();
        board.send(&[0x09, 0x02, 0x03, 0x04, 0xff, 0xa0, 0x0f, 0x01]).unwrap();

        assert_eq!(
            data(&rx),
            vec![vec![0x09, 0x02, 0], vec![0x09, 0x02, 1], vec![0x09, 0x02, 0]]
        );
        assert_eq!(board.controller().processors().len(), 2);
    }

    #[test]
    fn test_trigger_and_processor_reads() {
        let (mut board, rx) = board();
        board.send(&[0x0b, 0x02, 0x03, 0x04, 0xff, 0x60]).unwrap();
        board.send(&[0x0b, 0x82, 0x00]).unwrap();
        board.send(&[0x0b, 0x82, 0x05]).unwrap();
        board.send(&[0x09, 0x82, 0x00]).unwrap();

        assert_eq!(
            data(&rx),
            vec![
                vec![0x0b, 0x02, 0x00],
                vec![0x0b, 0x82, 0x00, 0x03, 0x04, 0xff, 0x60],
                vec![0x0b, 0x82, 0x05],
                vec![0x09, 0x82, 0x00],
            ]
        );
    }

    #[test]
    fn test_readout_streams_pairs_and_progress() {
        let (mut board, rx) = board();
        let control = board.controller();
        for tick in 0..5 {
            control.push_log_entry(1, tick, [tick as u8, 0, 0, 0]);
        }

        board.send(&[0x0b, 0x85]).unwrap();
        board
            .send(&[0x0b, 0x06, 5, 0, 0, 0, 2, 0, 0, 0])
            .unwrap();

        let replies = data(&rx);
        assert_eq!(replies[0], vec![0x0b, 0x85, 5, 0, 0, 0]);
        let packets: Vec<_> = replies.iter().filter(|r| r[1] == 0x07).collect();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].len(), 2 + 2 * LOG_ENTRY_SIZE);
        assert_eq!(packets[2].len(), 2 + LOG_ENTRY_SIZE);
        assert_eq!(replies.last().unwrap(), &vec![0x0b, 0x08, 0, 0, 0, 0]);
        assert_eq!(control.pending_entries(), 0);
        assert_eq!(control.stored_entries(), 5);

        board.send(&[0x0b, 0x09, 0xff, 0xff, 0xff, 0xff]).unwrap();
        assert_eq!(control.stored_entries(), 0);
    }

    #[test]
    fn test_silence_and_refuse() {
        let (mut board, rx) = board();
        let control = board.controller();
        control.silence(0x0a, 0x02);
        control.refuse(0x0c, 0x02);

        board.send(&[0x0a, 0x02, 0x09, 0x03, 0x00, 0x09, 0x04, 0x01]).unwrap();
        assert!(data(&rx).is_empty());
        assert!(board.send(&[0x0c, 0x02, 0, 0, 0, 0, 0, 0, 0]).is_err());

        control.disconnect();
        assert!(matches!(
            board.send(&[0x0b, 0x85]),
            Err(BoardError::ConnectionLost)
        ));
        assert!(!board.is_connected());
    }

    #[test]
    fn test_firmware_change_wipes_entities() {
        let (mut board, _rx) = board();
        let control = board.controller();
        board.send(&[0x0c, 0x02, 0xe8, 0x03, 0, 0, 0xff, 0xff, 0]).unwrap();
        assert_eq!(control.timers().len(), 1);

        control.connect(Some(FirmwareVersion::new(1, 5, 0)));
        assert_eq!(control.timers().len(), 1);
        control.connect(Some(FirmwareVersion::new(1, 6, 0)));
        assert!(control.timers().is_empty());
        assert_eq!(board.firmware_version(), FirmwareVersion::new(1, 6, 0));
    }
}
