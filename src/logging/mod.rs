//! Logging engine
//!
//! Owns every [`DataLogger`], routes stored entries to them by slot, stamps
//! reassembled samples with calendar time, and hands them to subscribers.
//!
//! # Architecture
//!
//! ```text
//! [0b 07 entries] ──► parse_entries ──► slot → DataLogger ──► TimeKeeper ──► subscriber
//!                                            │ (merge slices)
//!                                            └─ unknown slot / no subscriber → error handler
//! ```
//!
//! Delivery errors never abort a download: they are handed to the caller's
//! error handler, or logged when there is none.

pub mod download;
pub mod entry;
pub mod logger;
pub mod recovery;
pub mod time;

pub use download::{Download, DownloadOptions, DownloadPhase, DownloadStep, ErrorHandler, ProgressHandler};
pub use entry::{parse_entries, LogEntry};
pub use logger::{Assembled, DataLogger, LogSample, LogSlice};
pub use recovery::{RecoveredLogger, Recovery};
pub use time::{TimeKeeper, TimeReference};

use crate::error::{BoardError, Result};
use crate::producer::{LoggerId, ProducerId};
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use tracing::{debug, info};

/// Loggers, slot routing and time conversion for one board
#[derive(Debug)]
pub struct LogEngine {
    loggers: HashMap<LoggerId, DataLogger>,
    slots: HashMap<u8, LoggerId>,
    subscribers: HashMap<LoggerId, Sender<LogSample>>,
    time: TimeKeeper,
    next_logger: u32,
}

impl LogEngine {
    /// Create an engine for a board ticking every `period_ms`
    pub fn new(period_ms: f64) -> Self {
        Self {
            loggers: HashMap::new(),
            slots: HashMap::new(),
            subscribers: HashMap::new(),
            time: TimeKeeper::new(period_ms),
            next_logger: 0,
        }
    }

    /// Add a logger recording `producer` through `slices`
    pub fn register(&mut self, producer: ProducerId, slices: Vec<LogSlice>) -> LoggerId {
        let id = LoggerId(self.next_logger);
        self.next_logger += 1;

        let logger = DataLogger::new(id, producer, slices);
        for slot in logger.slots() {
            self.slots.insert(slot, id);
        }
        debug!("Logger {} records {} in slots {:?}", id, producer, logger.slots());
        self.loggers.insert(id, logger);
        id
    }

    /// Drop a logger, freeing its slots
    pub fn remove(&mut self, id: LoggerId) -> Option<DataLogger> {
        let logger = self.loggers.remove(&id)?;
        self.slots.retain(|_, owner| *owner != id);
        self.subscribers.remove(&id);
        Some(logger)
    }

    pub fn logger(&self, id: LoggerId) -> Option<&DataLogger> {
        self.loggers.get(&id)
    }

    /// Logger owning a board slot
    pub fn logger_for_slot(&self, slot: u8) -> Option<LoggerId> {
        self.slots.get(&slot).copied()
    }

    pub fn loggers(&self) -> impl Iterator<Item = &DataLogger> {
        self.loggers.values()
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }

    /// Receive every sample of a logger
    ///
    /// A new subscription replaces the previous one.
    pub fn subscribe(&mut self, id: LoggerId) -> Result<Receiver<LogSample>> {
        if !self.loggers.contains_key(&id) {
            return Err(BoardError::InvalidParameter(format!("unknown logger {}", id)));
        }
        let (tx, rx) = unbounded();
        self.subscribers.insert(id, tx);
        Ok(rx)
    }

    pub fn time(&self) -> &TimeKeeper {
        &self.time
    }

    pub fn time_mut(&mut self) -> &mut TimeKeeper {
        &mut self.time
    }

    /// Route one stored entry
    pub fn deliver(&mut self, entry: LogEntry, now: DateTime<Utc>) -> Result<()> {
        let id = self
            .logger_for_slot(entry.slot)
            .ok_or(BoardError::UnknownLogEntry { slot: entry.slot })?;
        let logger = self
            .loggers
            .get_mut(&id)
            .ok_or(BoardError::UnknownLogEntry { slot: entry.slot })?;

        let Some(assembled) = logger.accept(entry) else {
            return Ok(());
        };
        let producer = logger.producer;
        let timestamp = self
            .time
            .convert(assembled.head.reset_uid, assembled.head.tick, now);

        let sample = LogSample {
            logger: id,
            producer,
            timestamp,
            reset_uid: assembled.head.reset_uid,
            tick: assembled.head.tick,
            data: assembled.data,
        };

        let delivered = self
            .subscribers
            .get(&id)
            .is_some_and(|tx| tx.send(sample).is_ok());
        if !delivered {
            self.subscribers.remove(&id);
            return Err(BoardError::UnhandledLogData { slot: entry.slot });
        }
        Ok(())
    }

    /// Route every entry of a readout notification body
    ///
    /// Entries that cannot be delivered go to `report` with their raw bytes.
    pub fn handle_readout(
        &mut self,
        body: &[u8],
        now: DateTime<Utc>,
        mut report: impl FnMut(&BoardError, &[u8]),
    ) {
        for entry in parse_entries(body) {
            if let Err(e) = self.deliver(entry, now) {
                report(&e, &entry.to_bytes());
            }
        }
    }

    /// Drop half-assembled samples
    pub fn clear_fragments(&mut self) {
        for logger in self.loggers.values_mut() {
            logger.clear();
        }
    }

    /// Forget every logger and time reference
    pub fn reset(&mut self) {
        info!("Dropping {} loggers", self.loggers.len());
        self.loggers.clear();
        self.slots.clear();
        self.subscribers.clear();
        self.time.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(slot: u8, tick: u32, payload: [u8; 4]) -> LogEntry {
        LogEntry {
            slot,
            reset_uid: 0,
            tick,
            payload,
        }
    }

    #[test]
    fn test_deliver_to_subscriber() {
        let mut engine = LogEngine::new(1.0);
        let id = engine.register(
            ProducerId(3),
            vec![
                LogSlice { slot: 0, start: 0, length: 4 },
                LogSlice { slot: 1, start: 4, length: 2 },
            ],
        );
        let rx = engine.subscribe(id).unwrap();
        let now = Utc::now();
        engine.time_mut().on_time_reply(0, 100, now);

        engine.deliver(entry(1, 110, [5, 6, 0, 0]), now).unwrap();
        assert!(rx.try_recv().is_err());
        engine.deliver(entry(0, 110, [1, 2, 3, 4]), now).unwrap();

        let sample = rx.try_recv().unwrap();
        assert_eq!(sample.producer, ProducerId(3));
        assert_eq!(sample.data, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(sample.timestamp, now + chrono::Duration::milliseconds(10));
    }

    #[test]
    fn test_delivery_errors() {
        let mut engine = LogEngine::new(1.0);
        let id = engine.register(ProducerId(0), vec![LogSlice { slot: 2, start: 0, length: 1 }]);
        let now = Utc::now();

        assert_eq!(
            engine.deliver(entry(5, 0, [0; 4]), now),
            Err(BoardError::UnknownLogEntry { slot: 5 })
        );
        assert_eq!(
            engine.deliver(entry(2, 0, [0; 4]), now),
            Err(BoardError::UnhandledLogData { slot: 2 })
        );

        // Dropped receiver counts as no subscriber
        drop(engine.subscribe(id).unwrap());
        assert!(engine.deliver(entry(2, 1, [0; 4]), now).is_err());

        let mut reported = Vec::new();
        let mut body = entry(5, 0, [0; 4]).to_bytes().to_vec();
        body.extend_from_slice(&entry(2, 2, [0; 4]).to_bytes());
        engine.handle_readout(&body, now, |e, bytes| reported.push((e.clone(), bytes[0])));
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0].1, 5);
    }

    #[test]
    fn test_remove_frees_slots() {
        let mut engine = LogEngine::new(1.0);
        let id = engine.register(ProducerId(0), vec![LogSlice { slot: 2, start: 0, length: 1 }]);
        assert_eq!(engine.logger_for_slot(2), Some(id));
        assert!(engine.remove(id).is_some());
        assert_eq!(engine.logger_for_slot(2), None);
        assert!(engine.subscribe(id).is_err());
        assert!(engine.is_empty());
    }
}
