//! Attribute and producer model
//!
//! A producer is a node in the pipeline graph: a byte stream coming either from
//! a sensor register or from an on-board processing stage. Its [`Attributes`]
//! describe how the bytes are laid out: channel widths, how many times that
//! channel group repeats, the offset inside the register reply, and whether
//! the values are signed.
//!
//! # Arena
//!
//! Producers are immutable values stored in a flat [`ProducerArena`] and
//! addressed by [`ProducerId`]. Deriving a processing stage, or viewing one
//! channel of a multi-channel stream, appends a new entry linked to its
//! parent rather than mutating the parent.

pub mod id;

pub use id::{LoggerId, ProducerId, RouteId};

use crate::error::{BoardError, Result};
use crate::protocol;
use crate::types::SourceKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Largest byte count a `(length - 1) << 5 | offset` source byte can describe
pub const MAX_SOURCE_LENGTH: usize = 8;

/// Largest offset a source byte can describe
pub const MAX_SOURCE_OFFSET: usize = 0x1f;

/// Layout of a producer's bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attributes {
    /// Byte width of each channel, in order
    pub sizes: Vec<u8>,
    /// How many times the channel group repeats
    pub copies: u8,
    /// Byte offset inside the source register reply
    pub offset: u8,
    /// Whether channel values are signed
    pub signed: bool,
}

impl Default for Attributes {
    fn default() -> Self {
        Self {
            sizes: Vec::new(),
            copies: 1,
            offset: 0,
            signed: false,
        }
    }
}

impl Attributes {
    /// Create attributes for the given channel widths
    pub fn new(sizes: Vec<u8>, signed: bool) -> Self {
        Self {
            sizes,
            signed,
            ..Self::default()
        }
    }

    /// `channels` channels of `size` bytes each
    pub fn uniform(channels: usize, size: u8, signed: bool) -> Self {
        Self::new(vec![size; channels], signed)
    }

    /// Copy with a different offset
    pub fn with_offset(mut self, offset: u8) -> Self {
        self.offset = offset;
        self
    }

    /// Copy with a different repeat count
    pub fn with_copies(mut self, copies: u8) -> Self {
        self.copies = copies;
        self
    }

    /// Copy with a different signedness
    pub fn with_signed(mut self, signed: bool) -> Self {
        self.signed = signed;
        self
    }

    /// Total byte length: sum of channel sizes times the repeat count
    pub fn length(&self) -> usize {
        self.sizes.iter().map(|&s| s as usize).sum::<usize>() * self.copies as usize
    }

    /// Number of channels in one copy
    pub fn channels(&self) -> usize {
        self.sizes.len()
    }

    /// Check that `offset + length()` fits inside a reply of `reply_size` bytes
    pub fn validate(&self, reply_size: usize) -> Result<()> {
        let end = self.offset as usize + self.length();
        if end > reply_size {
            return Err(BoardError::AttributeOutOfRange {
                offset: self.offset as usize,
                length: self.length(),
                limit: reply_size,
            });
        }
        Ok(())
    }

    /// The `(length - 1) << 5 | offset` byte used by creation commands
    pub fn source_config(&self) -> Result<u8> {
        let length = self.length();
        if length == 0 || length > MAX_SOURCE_LENGTH {
            return Err(BoardError::InvalidParameter(format!(
                "stream length {} cannot be addressed (1..={} bytes)",
                length, MAX_SOURCE_LENGTH
            )));
        }
        if self.offset as usize > MAX_SOURCE_OFFSET {
            return Err(BoardError::InvalidParameter(format!(
                "stream offset {} exceeds {}",
                self.offset, MAX_SOURCE_OFFSET
            )));
        }
        Ok((((length - 1) as u8) << 5) | self.offset)
    }

    /// Unpack a source byte into `(offset, length)`
    pub fn unpack_source_config(byte: u8) -> (u8, usize) {
        (byte & 0x1f, ((byte >> 5) as usize) + 1)
    }

    /// Raw view of `length` bytes starting `start` bytes into this stream
    pub fn slice(&self, start: usize, length: usize) -> Attributes {
        Attributes {
            sizes: vec![length as u8],
            copies: 1,
            offset: self.offset + start as u8,
            signed: self.signed,
        }
    }

    /// Split into one attribute set per channel (across all copies)
    pub fn split(&self) -> Vec<Attributes> {
        let mut parts = Vec::with_capacity(self.sizes.len() * self.copies as usize);
        let mut offset = self.offset;
        for _ in 0..self.copies {
            for &size in &self.sizes {
                parts.push(Attributes {
                    sizes: vec![size],
                    copies: 1,
                    offset,
                    signed: self.signed,
                });
                offset += size;
            }
        }
        parts
    }

    /// Divide the stream into log-slot sized slices: `(start, length)` pairs
    pub fn log_slices(&self) -> Vec<(usize, usize)> {
        let total = self.length();
        let mut slices = Vec::new();
        let mut start = 0;
        while start < total {
            let length = (total - start).min(protocol::LOG_SLOT_SIZE);
            slices.push((start, length));
            start += length;
        }
        slices
    }
}

/// Where a producer's bytes come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// A sensor register registered by the application
    Source,
    /// Output of the on-board processor with this id
    Processor(u8),
    /// Notification of the on-board timer with this id
    Timer(u8),
    /// Channel view into the parent producer
    Split,
}

/// A typed byte stream on the board
#[derive(Debug, Clone, PartialEq)]
pub struct Producer {
    pub id: ProducerId,
    pub module: u8,
    pub register: u8,
    pub data_id: Option<u8>,
    pub attributes: Attributes,
    pub parent: Option<ProducerId>,
    pub origin: Origin,
    /// Size of the register reply the attributes index into
    pub reply_size: usize,
}

impl Producer {
    /// Address of the stream in commands
    pub fn key(&self) -> SourceKey {
        SourceKey::new(self.module, self.register, self.data_id)
    }

    /// The `[module, register, data_id, source byte]` prefix used by
    /// processor and log-trigger creation commands
    pub fn input_bytes(&self) -> Result<[u8; 4]> {
        let key = self.key().to_bytes();
        Ok([key[0], key[1], key[2], self.attributes.source_config()?])
    }

    /// Processor id if this producer is a processor output
    pub fn processor_id(&self) -> Option<u8> {
        match self.origin {
            Origin::Processor(id) => Some(id),
            _ => None,
        }
    }
}

/// A slot in the producer arena
#[derive(Debug, Clone)]
struct ProducerSlot {
    producer: Producer,
    retired: bool,
}

/// Flat storage for all producers of one board connection
#[derive(Debug, Default)]
pub struct ProducerArena {
    slots: Vec<ProducerSlot>,
    splits: HashMap<ProducerId, Vec<ProducerId>>,
    views: HashMap<ProducerId, Vec<ProducerId>>,
}

impl ProducerArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, mut producer: Producer) -> ProducerId {
        let id = ProducerId(self.slots.len() as u32);
        producer.id = id;
        self.slots.push(ProducerSlot {
            producer,
            retired: false,
        });
        id
    }

    /// Register a sensor stream
    pub fn register_source(
        &mut self,
        module: u8,
        register: u8,
        data_id: Option<u8>,
        attributes: Attributes,
        reply_size: usize,
    ) -> Result<ProducerId> {
        attributes.validate(reply_size)?;
        let key = SourceKey::new(module, register, data_id);
        if let Some(existing) = self.find_source(key) {
            let current = &self.slots[existing.index()].producer;
            if current.attributes == attributes {
                return Ok(existing);
            }
        }

        Ok(self.push(Producer {
            id: ProducerId::INVALID,
            module,
            register,
            data_id,
            attributes,
            parent: None,
            origin: Origin::Source,
            reply_size,
        }))
    }

    /// Add the output of processor `processor_id` fed by `parent`
    pub fn derive_processor(
        &mut self,
        parent: ProducerId,
        processor_id: u8,
        attributes: Attributes,
    ) -> Result<ProducerId> {
        self.get(parent)?;
        let reply_size = attributes.offset as usize + attributes.length();
        Ok(self.push(Producer {
            id: ProducerId::INVALID,
            module: protocol::processor::MODULE,
            register: protocol::processor::NOTIFY,
            data_id: Some(processor_id),
            attributes,
            parent: Some(parent),
            origin: Origin::Processor(processor_id),
            reply_size,
        }))
    }

    /// Add the notification stream of timer `timer_id`
    pub fn derive_timer(&mut self, timer_id: u8) -> ProducerId {
        self.push(Producer {
            id: ProducerId::INVALID,
            module: protocol::timer::MODULE,
            register: protocol::timer::NOTIFY,
            data_id: Some(timer_id),
            attributes: Attributes::default(),
            parent: None,
            origin: Origin::Timer(timer_id),
            reply_size: 0,
        })
    }

    /// Channel views of a producer, created on first use
    pub fn split(&mut self, id: ProducerId) -> Result<Vec<ProducerId>> {
        if let Some(existing) = self.splits.get(&id) {
            return Ok(existing.clone());
        }

        let parent = self.get(id)?.clone();
        let children: Vec<ProducerId> = parent
            .attributes
            .split()
            .into_iter()
            .map(|attributes| {
                self.push(Producer {
                    id: ProducerId::INVALID,
                    module: parent.module,
                    register: parent.register,
                    data_id: parent.data_id,
                    attributes,
                    parent: Some(id),
                    origin: Origin::Split,
                    reply_size: parent.reply_size,
                })
            })
            .collect();

        self.splits.insert(id, children.clone());
        Ok(children)
    }

    /// Channel view `index` of a producer
    pub fn channel(&mut self, id: ProducerId, index: usize) -> Result<ProducerId> {
        let children = self.split(id)?;
        children.get(index).copied().ok_or_else(|| {
            BoardError::UnknownProducer(format!("{} has no channel {}", id, index))
        })
    }

    /// View of `length` bytes at reply offset `offset` inside `parent`
    ///
    /// Returns the parent itself or one of its channels when the range
    /// matches exactly, otherwise adds a raw slice view.
    pub fn view(&mut self, parent: ProducerId, offset: u8, length: usize) -> Result<ProducerId> {
        let attributes = self.get(parent)?.attributes.clone();
        if attributes.offset == offset && attributes.length() == length {
            return Ok(parent);
        }

        let end = attributes.offset as usize + attributes.length();
        if offset < attributes.offset || offset as usize + length > end {
            return Err(BoardError::AttributeOutOfRange {
                offset: offset as usize,
                length,
                limit: end,
            });
        }

        for child in self.split(parent)? {
            let view = &self.slots[child.index()].producer.attributes;
            if view.offset == offset && view.length() == length {
                return Ok(child);
            }
        }
        if let Some(existing) = self.views.get(&parent).and_then(|views| {
            views.iter().copied().find(|&v| {
                let slot = &self.slots[v.index()];
                let view = &slot.producer.attributes;
                !slot.retired && view.offset == offset && view.length() == length
            })
        }) {
            return Ok(existing);
        }

        let source = self.get(parent)?.clone();
        let view = self.push(Producer {
            id: ProducerId::INVALID,
            module: source.module,
            register: source.register,
            data_id: source.data_id,
            attributes: attributes.slice((offset - attributes.offset) as usize, length),
            parent: Some(parent),
            origin: Origin::Split,
            reply_size: source.reply_size,
        });
        self.views.entry(parent).or_default().push(view);
        Ok(view)
    }

    /// Look up a live producer
    pub fn get(&self, id: ProducerId) -> Result<&Producer> {
        match self.slots.get(id.index()) {
            Some(slot) if !slot.retired => Ok(&slot.producer),
            _ => Err(BoardError::UnknownProducer(id.to_string())),
        }
    }

    /// Whether `id` refers to a live producer
    pub fn contains(&self, id: ProducerId) -> bool {
        self.get(id).is_ok()
    }

    /// Find a registered sensor stream by its address
    pub fn find_source(&self, key: SourceKey) -> Option<ProducerId> {
        self.slots
            .iter()
            .find(|slot| {
                !slot.retired
                    && slot.producer.origin == Origin::Source
                    && slot.producer.key() == key
            })
            .map(|slot| slot.producer.id)
    }

    /// Find the output producer of a live processor
    pub fn find_processor(&self, processor_id: u8) -> Option<ProducerId> {
        self.slots
            .iter()
            .find(|slot| !slot.retired && slot.producer.origin == Origin::Processor(processor_id))
            .map(|slot| slot.producer.id)
    }

    /// Retire a producer and any channel views of it
    pub fn retire(&mut self, id: ProducerId) {
        let children = self
            .splits
            .remove(&id)
            .into_iter()
            .chain(self.views.remove(&id))
            .flatten();
        for child in children.collect::<Vec<_>>() {
            self.retire(child);
        }
        if let Some(slot) = self.slots.get_mut(id.index()) {
            slot.retired = true;
        }
    }

    /// Retire everything except registered sensor streams
    pub fn retire_derived(&mut self) {
        self.splits.clear();
        self.views.clear();
        for slot in &mut self.slots {
            if slot.producer.origin != Origin::Source {
                slot.retired = true;
            }
        }
    }

    /// Number of live producers
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.retired).count()
    }
}
