//! Route declarations and committed route handles
//!
//! A route is one top-level ask: a pipeline of processors fed by a producer,
//! a periodic timer, or a bare event binding. Routes are plain data; the
//! [`builder`](super::builder) turns them into device commands.
//!
//! # Example
//!
//! ```ignore
//! let route = DataRoute::new(accelerometer)
//!     .node(RouteNode::new(NodeInput::SourceChannel(0), average).named("smooth"))
//!     .node(RouteNode::new(NodeInput::Node(0), threshold).logged());
//! let handle = board.create_route(RouteSpec::Data(route))?;
//! ```

use crate::codec::ProcessorConfig;
use crate::producer::{LoggerId, ProducerId, RouteId};
use crate::protocol::{event, logging, processor, timer};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a reaction's command goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReactionTarget {
    /// An arbitrary command `[module, register, params...]`
    Command {
        module: u8,
        register: u8,
        params: Vec<u8>,
    },
    /// Rewrite the config of a named processor
    ProcessorParameter {
        name: String,
        config: ProcessorConfig,
    },
    /// Overwrite the internal state of a named processor
    ProcessorState { name: String, state: Vec<u8> },
}

/// Copy part of the triggering sample into the reaction's parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataInjection {
    /// First byte of the sample to copy (0..=15)
    pub source_offset: u8,
    /// Bytes to copy (1..=8)
    pub length: u8,
    /// Where in the parameters the bytes land
    pub destination_offset: u8,
}

impl DataInjection {
    /// The two trailing bytes of an event entry
    pub fn to_bytes(self) -> [u8; 2] {
        [
            0x01 | ((self.length - 1) << 1) | (self.source_offset << 4),
            self.destination_offset,
        ]
    }
}

/// A command the board issues each time a producer updates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub target: ReactionTarget,
    pub inject: Option<DataInjection>,
}

impl Reaction {
    /// Issue `[module, register, params...]`
    pub fn command(module: u8, register: u8, params: Vec<u8>) -> Self {
        Self {
            target: ReactionTarget::Command {
                module,
                register,
                params,
            },
            inject: None,
        }
    }

    /// Reset the state of the processor called `name`
    pub fn reset(name: impl Into<String>, state: Vec<u8>) -> Self {
        Self {
            target: ReactionTarget::ProcessorState {
                name: name.into(),
                state,
            },
            inject: None,
        }
    }

    /// Replace the config of the processor called `name`
    pub fn modify(name: impl Into<String>, config: ProcessorConfig) -> Self {
        Self {
            target: ReactionTarget::ProcessorParameter {
                name: name.into(),
                config,
            },
            inject: None,
        }
    }

    /// Copy `length` sample bytes from `source_offset` into the parameters
    /// at `destination_offset`
    pub fn with_injection(mut self, source_offset: u8, length: u8, destination_offset: u8) -> Self {
        self.inject = Some(DataInjection {
            source_offset,
            length,
            destination_offset,
        });
        self
    }

    /// Name of the processor this reaction refers to, if any
    pub fn processor_name(&self) -> Option<&str> {
        match &self.target {
            ReactionTarget::Command { .. } => None,
            ReactionTarget::ProcessorParameter { name, .. }
            | ReactionTarget::ProcessorState { name, .. } => Some(name),
        }
    }
}

/// What a route node reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeInput {
    /// The route's source producer
    Source,
    /// One channel of the source producer
    SourceChannel(usize),
    /// Output of an earlier node
    Node(usize),
    /// One channel of an earlier node's output
    NodeChannel(usize, usize),
}

impl NodeInput {
    /// Index of the node this input reads from
    pub fn node(self) -> Option<usize> {
        match self {
            NodeInput::Node(i) | NodeInput::NodeChannel(i, _) => Some(i),
            _ => None,
        }
    }
}

/// One processor of a data route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteNode {
    pub input: NodeInput,
    pub config: ProcessorConfig,
    pub name: Option<String>,
    /// Log the processor output
    pub log: bool,
    pub reactions: Vec<Reaction>,
    /// Names of the processors a Fuser combines, in order
    pub fuse: Vec<String>,
}

impl RouteNode {
    pub fn new(input: NodeInput, config: ProcessorConfig) -> Self {
        Self {
            input,
            config,
            name: None,
            log: false,
            reactions: Vec::new(),
            fuse: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn logged(mut self) -> Self {
        self.log = true;
        self
    }

    pub fn react(mut self, reaction: Reaction) -> Self {
        self.reactions.push(reaction);
        self
    }

    pub fn fusing<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.fuse = names.into_iter().map(Into::into).collect();
        self
    }
}

/// A processing pipeline fed by an existing producer
///
/// Nodes may only read from the source or from nodes declared before them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRoute {
    pub source: ProducerId,
    /// Log the source itself
    pub log: bool,
    /// Reactions to the source updating
    pub reactions: Vec<Reaction>,
    pub nodes: Vec<RouteNode>,
}

impl DataRoute {
    pub fn new(source: ProducerId) -> Self {
        Self {
            source,
            log: false,
            reactions: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn logged(mut self) -> Self {
        self.log = true;
        self
    }

    pub fn react(mut self, reaction: Reaction) -> Self {
        self.reactions.push(reaction);
        self
    }

    pub fn node(mut self, node: RouteNode) -> Self {
        self.nodes.push(node);
        self
    }
}

/// A periodic board timer and what it triggers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerRoute {
    pub period_ms: u32,
    /// Number of firings; `u16::MAX` repeats forever
    pub repetitions: u16,
    /// Fire once immediately on start
    pub immediate: bool,
    /// Start the timer once the route is committed
    pub start: bool,
    pub reactions: Vec<Reaction>,
}

impl TimerRoute {
    pub fn new(period_ms: u32) -> Self {
        Self {
            period_ms,
            repetitions: u16::MAX,
            immediate: false,
            start: true,
            reactions: Vec::new(),
        }
    }

    pub fn repeat(mut self, repetitions: u16) -> Self {
        self.repetitions = repetitions;
        self
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn stopped(mut self) -> Self {
        self.start = false;
        self
    }

    pub fn react(mut self, reaction: Reaction) -> Self {
        self.reactions.push(reaction);
        self
    }

    /// The `[0x0c, 0x02, ...]` creation command
    pub fn creation_command(&self) -> Vec<u8> {
        let mut cmd = vec![timer::MODULE, timer::ENTRY];
        cmd.extend_from_slice(&self.period_ms.to_le_bytes());
        cmd.extend_from_slice(&self.repetitions.to_le_bytes());
        cmd.push(self.immediate as u8);
        cmd
    }
}

/// Reactions bound to an existing producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRoute {
    pub source: ProducerId,
    pub reactions: Vec<Reaction>,
}

impl EventRoute {
    pub fn new(source: ProducerId) -> Self {
        Self {
            source,
            reactions: Vec::new(),
        }
    }

    pub fn react(mut self, reaction: Reaction) -> Self {
        self.reactions.push(reaction);
        self
    }
}

/// A queued top-level request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteSpec {
    Data(DataRoute),
    Timer(TimerRoute),
    Event(EventRoute),
}

impl RouteSpec {
    /// Short label for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            RouteSpec::Data(_) => "data",
            RouteSpec::Timer(_) => "timer",
            RouteSpec::Event(_) => "event",
        }
    }
}

/// Lifecycle of a route request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteState {
    Pending,
    BuildingConfigs,
    BuildingLoggers,
    BuildingEvents,
    Committed,
    RolledBack,
}

impl fmt::Display for RouteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouteState::Pending => "pending",
            RouteState::BuildingConfigs => "building configs",
            RouteState::BuildingLoggers => "building loggers",
            RouteState::BuildingEvents => "building events",
            RouteState::Committed => "committed",
            RouteState::RolledBack => "rolled back",
        };
        write!(f, "{}", s)
    }
}

/// An entity allocated on the board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CreatedEntity {
    Timer(u8),
    Processor(u8),
    LogSlot(u8),
    Event(u8),
}

impl CreatedEntity {
    /// The command that frees this entity
    pub fn removal_command(self) -> Vec<u8> {
        match self {
            CreatedEntity::Timer(id) => vec![timer::MODULE, timer::REMOVE, id],
            CreatedEntity::Processor(id) => vec![processor::MODULE, processor::REMOVE, id],
            CreatedEntity::LogSlot(id) => vec![logging::MODULE, logging::REMOVE, id],
            CreatedEntity::Event(id) => vec![event::MODULE, event::REMOVE, id],
        }
    }
}

/// A committed route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteHandle {
    pub id: RouteId,
    /// Output producer of each node, in declaration order
    pub outputs: Vec<ProducerId>,
    /// Board id of each node's processor, in declaration order
    pub processors: Vec<u8>,
    /// Loggers created by the route with the producer each one records
    pub loggers: Vec<(ProducerId, LoggerId)>,
    /// Timer id for timer routes
    pub timer: Option<u8>,
    /// Notification producer of the timer
    pub timer_producer: Option<ProducerId>,
    /// Every entity on the board, in creation order
    pub entities: Vec<CreatedEntity>,
    /// Names bound by the route
    pub names: Vec<String>,
}

impl RouteHandle {
    /// Output producer of node `index`
    pub fn output(&self, index: usize) -> Option<ProducerId> {
        self.outputs.get(index).copied()
    }

    /// Logger recording `producer`
    pub fn logger_for(&self, producer: ProducerId) -> Option<LoggerId> {
        self.loggers
            .iter()
            .find(|(p, _)| *p == producer)
            .map(|(_, l)| *l)
    }

    /// Log slots owned by the route
    pub fn log_slots(&self) -> Vec<u8> {
        self.entities
            .iter()
            .filter_map(|e| match e {
                CreatedEntity::LogSlot(id) => Some(*id),
                _ => None,
            })
            .collect()
    }
}
