//! Logger recovery
//!
//! When the host loses its bookkeeping (a crash, a new process) the board
//! still holds its log triggers. Recovery reads every trigger slot, follows
//! processor chains back to a registered source by reading each processor's
//! record, and rebuilds producers and [`DataLogger`](super::DataLogger)s
//! without creating anything on the board.
//!
//! Queries are issued one at a time:
//!
//! 1. `[0x0b, 0x82, slot]` for every slot
//! 2. `[0x09, 0x82, id]` for every processor a trigger or record refers to,
//!    including the inputs of fusers

use super::{LogEngine, LogSlice};
use crate::codec::{CodecContext, ProcessorConfig, ProcessorRecord};
use crate::error::{BoardError, Result, ResultExt};
use crate::producer::{Attributes, LoggerId, ProducerArena, ProducerId};
use crate::protocol::{self, logging, processor, LOG_SLOT_SIZE};
use crate::types::SourceKey;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Deepest processor chain followed before giving up
const MAX_CHAIN_DEPTH: usize = 32;

/// A logger rebuilt from the board's triggers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredLogger {
    pub logger: LoggerId,
    pub producer: ProducerId,
    pub slots: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Query {
    Trigger(u8),
    Processor(u8),
}

impl Query {
    fn command(self) -> Vec<u8> {
        match self {
            Query::Trigger(slot) => protocol::read_entity(logging::MODULE, logging::TRIGGER, slot),
            Query::Processor(id) => protocol::read_entity(processor::MODULE, processor::ADD, id),
        }
    }

    fn reply(self) -> (u8, u8) {
        match self {
            Query::Trigger(_) => (logging::MODULE, logging::TRIGGER | protocol::READ_BIT),
            Query::Processor(_) => (processor::MODULE, processor::ADD | protocol::READ_BIT),
        }
    }

    fn entity(self) -> u8 {
        match self {
            Query::Trigger(id) | Query::Processor(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Trigger {
    slot: u8,
    key: SourceKey,
    offset: u8,
    length: usize,
}

fn is_processor_output(key: SourceKey) -> bool {
    key.module == processor::MODULE && key.register == processor::NOTIFY
}

/// Query state of one recovery
#[derive(Debug)]
pub struct Recovery {
    slot_count: u8,
    query: Option<Query>,
    triggers: Vec<Trigger>,
    records: HashMap<u8, Option<ProcessorRecord>>,
    queued: VecDeque<u8>,
    timeout: Duration,
    deadline: Instant,
}

impl Recovery {
    /// Begin recovery over slots `0..slot_count`, returning the first query
    pub fn start(slot_count: u8, timeout: Duration, now: Instant) -> (Self, Option<Vec<u8>>) {
        let query = (slot_count > 0).then_some(Query::Trigger(0));
        let recovery = Self {
            slot_count,
            query,
            triggers: Vec::new(),
            records: HashMap::new(),
            queued: VecDeque::new(),
            timeout,
            deadline: now + timeout,
        };
        (recovery, query.map(Query::command))
    }

    /// Whether every query has been answered
    pub fn is_finished(&self) -> bool {
        self.query.is_none()
    }

    /// Whether a reply on `(module, register)` answers the current query
    pub fn awaiting(&self, module: u8, register: u8) -> bool {
        self.query.is_some_and(|q| q.reply() == (module, register))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.query.map(|_| self.deadline)
    }

    /// Error to fail recovery with once the current query is overdue
    pub fn check_timeout(&self, now: Instant) -> Option<BoardError> {
        let query = self.query?;
        if now < self.deadline {
            return None;
        }
        let (module, register) = query.reply();
        Some(BoardError::ReadTimeout { module, register })
    }

    fn enqueue(&mut self, id: u8) {
        if !self.records.contains_key(&id) && !self.queued.contains(&id) {
            self.queued.push_back(id);
        }
    }

    /// Handle a read reply, returning the next query to send
    ///
    /// Replies for an entity other than the one queried are ignored.
    pub fn on_reply(&mut self, bytes: &[u8], ctx: &CodecContext, now: Instant) -> Result<Option<Vec<u8>>> {
        let Some(query) = self.query else {
            return Ok(None);
        };
        if bytes.get(2) != Some(&query.entity()) {
            debug!("Ignoring recovery reply {}", protocol::hex(bytes));
            return Ok(None);
        }

        match query {
            Query::Trigger(slot) => {
                if bytes.len() >= 7 {
                    let key = SourceKey {
                        module: bytes[3],
                        register: bytes[4],
                        data_id: bytes[5],
                    };
                    let (offset, length) = Attributes::unpack_source_config(bytes[6]);
                    debug!("Slot {} logs {} at {}+{}", slot, key, offset, length);
                    self.triggers.push(Trigger {
                        slot,
                        key,
                        offset,
                        length,
                    });
                    if is_processor_output(key) {
                        self.enqueue(key.data_id);
                    }
                }
            }
            Query::Processor(id) => {
                let body = &bytes[3..];
                if body.is_empty() {
                    warn!("Processor {} referenced by a log trigger no longer exists", id);
                    self.records.insert(id, None);
                } else {
                    let record = ProcessorRecord::decode(body, ctx)
                        .context(format!("Recovering processor {}", id))?;
                    if is_processor_output(record.source) {
                        self.enqueue(record.source.data_id);
                    }
                    if let ProcessorConfig::Fuser { inputs } = &record.config {
                        for &input in inputs {
                            self.enqueue(input);
                        }
                    }
                    debug!("Processor {} is a {}", id, record.config.kind_name());
                    self.records.insert(id, Some(record));
                }
            }
        }

        self.query = match query {
            Query::Trigger(slot) if slot + 1 < self.slot_count => Some(Query::Trigger(slot + 1)),
            _ => self.queued.pop_front().map(Query::Processor),
        };
        self.deadline = now + self.timeout;
        Ok(self.query.map(Query::command))
    }

    fn processor_output(&self, id: u8, arena: &mut ProducerArena, depth: usize) -> Option<ProducerId> {
        if let Some(existing) = arena.find_processor(id) {
            return Some(existing);
        }
        if depth > MAX_CHAIN_DEPTH {
            warn!("Processor chain through {} is too deep", id);
            return None;
        }

        let record = self.records.get(&id)?.as_ref()?;
        let parent = self.stream(
            record.source,
            record.source_offset,
            record.source_length,
            arena,
            depth + 1,
        )?;
        let input = arena.get(parent).ok()?.attributes.clone();

        let fused = match &record.config {
            ProcessorConfig::Fuser { inputs } => inputs
                .iter()
                .map(|&input| {
                    let output = self.processor_output(input, arena, depth + 1)?;
                    arena.get(output).ok().map(|p| p.attributes.clone())
                })
                .collect::<Option<Vec<_>>>()?,
            _ => Vec::new(),
        };

        let output = record.config.output_attributes(&input, &fused);
        arena.derive_processor(parent, id, output).ok()
    }

    fn stream(
        &self,
        key: SourceKey,
        offset: u8,
        length: usize,
        arena: &mut ProducerArena,
        depth: usize,
    ) -> Option<ProducerId> {
        let base = if is_processor_output(key) {
            self.processor_output(key.data_id, arena, depth)?
        } else {
            match arena.find_source(key) {
                Some(source) => source,
                None => {
                    warn!("No registered source for {}", key);
                    return None;
                }
            }
        };
        match arena.view(base, offset, length) {
            Ok(view) => Some(view),
            Err(e) => {
                warn!("Cannot view {} at {}+{}: {}", key, offset, length, e);
                None
            }
        }
    }

    /// Rebuild producers and loggers from the answered queries
    ///
    /// Adjacent triggers on the same stream are joined into one logger when
    /// every slice but the last fills a whole slot. Slots the engine already
    /// knows are skipped.
    pub fn finish(self, arena: &mut ProducerArena, engine: &mut LogEngine) -> Vec<RecoveredLogger> {
        let mut by_key: BTreeMap<[u8; 3], Vec<Trigger>> = BTreeMap::new();
        for trigger in &self.triggers {
            if engine.logger_for_slot(trigger.slot).is_some() {
                continue;
            }
            by_key.entry(trigger.key.to_bytes()).or_default().push(*trigger);
        }

        let mut recovered = Vec::new();
        for (_, mut triggers) in by_key {
            triggers.sort_by_key(|t| t.offset);

            let mut groups: Vec<Vec<Trigger>> = Vec::new();
            for trigger in triggers {
                match groups.last_mut() {
                    Some(group)
                        if group.last().is_some_and(|last| {
                            last.length == LOG_SLOT_SIZE
                                && last.offset as usize + last.length == trigger.offset as usize
                        }) =>
                    {
                        group.push(trigger)
                    }
                    _ => groups.push(vec![trigger]),
                }
            }

            for group in groups {
                let first = group[0];
                let length = group.iter().map(|t| t.length).sum();
                let Some(producer) = self.stream(first.key, first.offset, length, arena, 0) else {
                    warn!(
                        "Could not resolve the stream logged by slots {:?}",
                        group.iter().map(|t| t.slot).collect::<Vec<_>>()
                    );
                    continue;
                };

                let slices: Vec<LogSlice> = group
                    .iter()
                    .map(|t| LogSlice {
                        slot: t.slot,
                        start: (t.offset - first.offset) as usize,
                        length: t.length,
                    })
                    .collect();
                let slots = slices.iter().map(|s| s.slot).collect();
                let logger = engine.register(producer, slices);
                recovered.push(RecoveredLogger {
                    logger,
                    producer,
                    slots,
                });
            }
        }

        info!("Recovered {} loggers", recovered.len());
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FirmwareVersion;

    fn ctx() -> CodecContext {
        CodecContext::new(FirmwareVersion::new(1, 5, 0), 0)
    }

    fn answer(recovery: &mut Recovery, reply: Vec<u8>) -> Option<Vec<u8>> {
        recovery.on_reply(&reply, &ctx(), Instant::now()).unwrap()
    }

    #[test]
    fn test_walks_slots_then_processors() {
        let now = Instant::now();
        let (mut recovery, first) = Recovery::start(3, Duration::from_secs(1), now);
        assert_eq!(first, Some(vec![0x0b, 0x82, 0]));
        assert!(recovery.awaiting(0x0b, 0x82));

        // Slot 0: processor 1 output
        let next = answer(&mut recovery, vec![0x0b, 0x82, 0, 0x09, 0x03, 1, 0x00]);
        assert_eq!(next, Some(vec![0x0b, 0x82, 1]));
        // Slot 1: unused
        let next = answer(&mut recovery, vec![0x0b, 0x82, 1]);
        assert_eq!(next, Some(vec![0x0b, 0x82, 2]));
        // Stale reply for another slot is ignored
        assert_eq!(answer(&mut recovery, vec![0x0b, 0x82, 1]), None);
        assert!(!recovery.is_finished());

        let next = answer(&mut recovery, vec![0x0b, 0x82, 2]);
        assert_eq!(next, Some(vec![0x09, 0x82, 1]));

        // Processor 1 is a buffer fed by processor 0
        let next = answer(&mut recovery, vec![0x09, 0x82, 1, 0x09, 0x03, 0, 0x20, 0x0f, 0x01]);
        assert_eq!(next, Some(vec![0x09, 0x82, 0]));
        // Processor 0 averages accelerometer x
        let next = answer(
            &mut recovery,
            vec![0x09, 0x82, 0, 0x03, 0x04, 0xff, 0x20, 0x03, 0x15, 16],
        );
        assert_eq!(next, None);
        assert!(recovery.is_finished());
    }

    #[test]
    fn test_finish_rebuilds_chain_and_loggers() {
        let mut arena = ProducerArena::new();
        let acc = arena
            .register_source(0x03, 0x04, None, Attributes::uniform(3, 2, true), 6)
            .unwrap();
        let wide = arena
            .register_source(0x19, 0x07, None, Attributes::new(vec![4, 4, 2], false), 10)
            .unwrap();
        let mut engine = LogEngine::new(48.0 / 32768.0 * 1000.0);

        let (mut recovery, _) = Recovery::start(5, Duration::from_secs(1), Instant::now());
        for reply in [
            vec![0x0b, 0x82, 0, 0x09, 0x03, 0, 0x20],
            vec![0x0b, 0x82, 1, 0x19, 0x07, 0xff, 0x64],
            vec![0x0b, 0x82, 2, 0x19, 0x07, 0xff, 0x60],
            vec![0x0b, 0x82, 3, 0x19, 0x07, 0xff, 0x28],
            vec![0x0b, 0x82, 4],
            vec![0x09, 0x82, 0, 0x03, 0x04, 0xff, 0x20, 0x03, 0x15, 16],
        ] {
            answer(&mut recovery, reply);
        }
        assert!(recovery.is_finished());

        let mut loggers = recovery.finish(&mut arena, &mut engine);
        loggers.sort_by_key(|l| l.slots[0]);
        assert_eq!(loggers.len(), 2);

        let average = arena.find_processor(0).unwrap();
        let acc_channel = arena.channel(acc, 0).unwrap();
        assert_eq!(arena.get(average).unwrap().parent, Some(acc_channel));
        assert_eq!(loggers[0].producer, average);
        assert_eq!(loggers[0].slots, vec![0]);

        assert_eq!(loggers[1].producer, wide);
        assert_eq!(loggers[1].slots, vec![2, 1, 3]);
        assert_eq!(engine.logger_for_slot(3), Some(loggers[1].logger));
    }

    #[test]
    fn test_undecodable_processor_names_the_processor() {
        let (mut recovery, _) = Recovery::start(1, Duration::from_secs(1), Instant::now());
        answer(&mut recovery, vec![0x0b, 0x82, 0, 0x09, 0x03, 4, 0x00]);

        let err = recovery
            .on_reply(&[0x09, 0x82, 4, 0x03, 0x04, 0xff, 0x20, 0x1c], &ctx(), Instant::now())
            .unwrap_err();
        assert!(err.to_string().starts_with("Recovering processor 4"));
        assert_eq!(err.root(), &BoardError::UnknownProcessorKind(0x1c));
    }

    #[test]
    fn test_unknown_source_is_skipped() {
        let mut arena = ProducerArena::new();
        let mut engine = LogEngine::new(1.0);
        let (mut recovery, _) = Recovery::start(1, Duration::from_secs(1), Instant::now());
        answer(&mut recovery, vec![0x0b, 0x82, 0, 0x05, 0x01, 0xff, 0x00]);
        assert!(recovery.finish(&mut arena, &mut engine).is_empty());
    }

    #[test]
    fn test_query_timeout() {
        let now = Instant::now();
        let (recovery, _) = Recovery::start(2, Duration::from_millis(10), now);
        assert_eq!(
            recovery.check_timeout(now + Duration::from_millis(10)),
            Some(BoardError::ReadTimeout { module: 0x0b, register: 0x82 })
        );
    }
}
