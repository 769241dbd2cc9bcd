//! Multi-slot data loggers
//!
//! A producer longer than one log slot is logged through several triggers,
//! one per 4-byte slice. The board stores each slice as its own entry, so
//! the logger buffers fragments per slot and emits a sample only once every
//! slot has contributed one, concatenated in slice order.

use super::entry::LogEntry;
use crate::producer::{LoggerId, ProducerId};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};

/// One log trigger of a logger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogSlice {
    /// Board log slot
    pub slot: u8,
    /// Byte offset of the slice inside the producer value
    pub start: usize,
    pub length: usize,
}

/// A reassembled, timestamped sample
#[derive(Debug, Clone, PartialEq)]
pub struct LogSample {
    pub logger: LoggerId,
    pub producer: ProducerId,
    pub timestamp: DateTime<Utc>,
    pub reset_uid: u8,
    pub tick: u32,
    pub data: Vec<u8>,
}

/// Fragments of a complete sample, in slice order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    /// Entry of the first slice; its tick stamps the sample
    pub head: LogEntry,
    pub data: Vec<u8>,
}

/// Bookkeeping for one logged producer
#[derive(Debug)]
pub struct DataLogger {
    pub id: LoggerId,
    pub producer: ProducerId,
    slices: Vec<LogSlice>,
    pending: HashMap<u8, VecDeque<LogEntry>>,
}

impl DataLogger {
    /// Create a logger over `slices`, sorted into slice order
    pub fn new(id: LoggerId, producer: ProducerId, mut slices: Vec<LogSlice>) -> Self {
        slices.sort_by_key(|s| s.start);
        let pending = slices.iter().map(|s| (s.slot, VecDeque::new())).collect();
        Self {
            id,
            producer,
            slices,
            pending,
        }
    }

    pub fn slices(&self) -> &[LogSlice] {
        &self.slices
    }

    /// Slot ids in slice order
    pub fn slots(&self) -> Vec<u8> {
        self.slices.iter().map(|s| s.slot).collect()
    }

    /// Byte length of one sample
    pub fn length(&self) -> usize {
        self.slices.iter().map(|s| s.length).sum()
    }

    /// Fragments waiting for their siblings
    pub fn buffered(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    /// Buffer a fragment, returning a sample once every slot has one
    ///
    /// Entries for slots this logger does not own are ignored.
    pub fn accept(&mut self, entry: LogEntry) -> Option<Assembled> {
        self.pending.get_mut(&entry.slot)?.push_back(entry);
        if self.pending.values().any(VecDeque::is_empty) {
            return None;
        }

        let mut data = Vec::with_capacity(self.length());
        let mut head = None;
        for slice in &self.slices {
            let fragment = self.pending.get_mut(&slice.slot)?.pop_front()?;
            data.extend_from_slice(&fragment.payload[..slice.length.min(fragment.payload.len())]);
            head.get_or_insert(fragment);
        }
        head.map(|head| Assembled { head, data })
    }

    /// Drop buffered fragments
    pub fn clear(&mut self) {
        for queue in self.pending.values_mut() {
            queue.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn logger() -> DataLogger {
        DataLogger::new(
            LoggerId(0),
            ProducerId(0),
            vec![
                LogSlice { slot: 4, start: 4, length: 4 },
                LogSlice { slot: 2, start: 0, length: 4 },
                LogSlice { slot: 7, start: 8, length: 2 },
            ],
        )
    }

    fn entry(slot: u8, tick: u32, payload: [u8; 4]) -> LogEntry {
        LogEntry {
            slot,
            reset_uid: 0,
            tick,
            payload,
        }
    }

    #[test]
    fn test_slices_sorted_by_offset() {
        let logger = logger();
        assert_eq!(logger.slots(), vec![2, 4, 7]);
        assert_eq!(logger.length(), 10);
    }

    #[test]
    fn test_merge_waits_for_every_slot() {
        let mut logger = logger();
        assert!(logger.accept(entry(7, 10, [9, 10, 0, 0])).is_none());
        assert!(logger.accept(entry(4, 10, [5, 6, 7, 8])).is_none());
        assert!(logger.accept(entry(3, 10, [0; 4])).is_none());
        assert_eq!(logger.buffered(), 2);

        let sample = logger.accept(entry(2, 10, [1, 2, 3, 4])).unwrap();
        assert_eq!(sample.data, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(sample.head.slot, 2);
        assert_eq!(logger.buffered(), 0);
    }

    fn arrival() -> impl Strategy<Value = Vec<usize>> {
        (1usize..4).prop_flat_map(|samples| {
            let sequence: Vec<usize> = (0..3)
                .flat_map(|i| std::iter::repeat(i).take(samples))
                .collect();
            Just(sequence).prop_shuffle()
        })
    }

    proptest! {
        #[test]
        fn prop_merge_follows_slice_order(order in arrival()) {
            let slots = [2u8, 4, 7];
            let samples = order.len() / 3;
            let mut logger = logger();
            let mut next = [0usize; 3];
            let mut emitted = Vec::new();

            // Fragments of one slot stay in sequence; slots interleave freely
            for i in order {
                let n = next[i];
                next[i] += 1;
                let base = (n * 10 + i * 4) as u8;
                let payload = [base, base + 1, base + 2, base + 3];
                if let Some(sample) = logger.accept(entry(slots[i], n as u32, payload)) {
                    emitted.push(sample.data);
                }
            }

            prop_assert_eq!(emitted.len(), samples);
            for (n, data) in emitted.iter().enumerate() {
                let base = (n * 10) as u8;
                let expected: Vec<u8> = (0..10).map(|k| base + k as u8).collect();
                prop_assert_eq!(data, &expected);
            }
        }
    }
}
