//! Phased construction of one route
//!
//! A [`RouteBuild`] is planned up front (all validation happens before the
//! first command is written) and then rendered one creation at a time, since
//! later commands embed the ids returned for earlier ones.
//!
//! # Phases
//!
//! 1. Timer / processors, in declaration order
//! 2. Log triggers, one per 4-byte slice of every logged producer
//! 3. Event bindings for reactions
//!
//! Every allocated id is recorded so that [`RouteBuild::rollback`] can free
//! them in reverse creation order.

use super::queue::PendingCreation;
use super::route::{
    CreatedEntity, DataRoute, NodeInput, Reaction, ReactionTarget, RouteHandle, RouteSpec,
    RouteState,
};
use crate::codec::{CodecContext, ProcessorConfig};
use crate::error::{BoardError, Result};
use crate::logging::LogSlice;
use crate::producer::{Attributes, ProducerArena, ProducerId, RouteId};
use crate::protocol::{event, logging, processor, timer};
use std::collections::HashMap;

/// Largest sample offset an event injection can address
const MAX_INJECTION_OFFSET: u8 = 0x0f;

/// Largest number of bytes an event injection can copy
const MAX_INJECTION_LENGTH: u8 = 8;

/// A name bound by a committed route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameBinding {
    pub route: RouteId,
    pub processor: u8,
    pub producer: ProducerId,
}

/// Names of live processors
pub type NameTable = HashMap<String, NameBinding>;

/// What the identifier of a creation is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Continuation {
    Timer,
    Processor { node: usize },
    LogSlot { logger: usize, start: usize, length: usize },
    Event { reaction: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Producer(ProducerId),
    Node(usize),
    Timer,
}

#[derive(Debug, Clone)]
struct PlannedLogger {
    target: Target,
    slots: Vec<LogSlice>,
}

/// Build state of the active route
#[derive(Debug)]
pub struct RouteBuild {
    pub id: RouteId,
    spec: RouteSpec,
    plan: Vec<Continuation>,
    cursor: usize,
    state: RouteState,
    /// Output shape of each node
    planned: Vec<Attributes>,
    outputs: Vec<Option<ProducerId>>,
    node_ids: Vec<Option<u8>>,
    timer: Option<(u8, ProducerId)>,
    loggers: Vec<PlannedLogger>,
    reactions: Vec<(Target, Reaction)>,
    created: Vec<CreatedEntity>,
}

fn check_reaction(
    reaction: &Reaction,
    local_names: &HashMap<&str, usize>,
    names: &NameTable,
    ctx: &CodecContext,
) -> Result<()> {
    if let Some(name) = reaction.processor_name() {
        if !local_names.contains_key(name) && !names.contains_key(name) {
            return Err(BoardError::InvalidRoute(format!(
                "reaction targets unknown processor '{}'",
                name
            )));
        }
    }
    let params = match &reaction.target {
        ReactionTarget::Command { params, .. } => params.len(),
        ReactionTarget::ProcessorParameter { config, .. } => 1 + config.encode(ctx)?.len(),
        ReactionTarget::ProcessorState { state, .. } => 1 + state.len(),
    };
    parameter_length(params)?;
    if let Some(inject) = reaction.inject {
        if inject.length == 0 || inject.length > MAX_INJECTION_LENGTH {
            return Err(BoardError::InvalidParameter(format!(
                "injection length {} outside 1..={}",
                inject.length, MAX_INJECTION_LENGTH
            )));
        }
        if inject.source_offset > MAX_INJECTION_OFFSET {
            return Err(BoardError::InvalidParameter(format!(
                "injection offset {} exceeds {}",
                inject.source_offset, MAX_INJECTION_OFFSET
            )));
        }
    }
    Ok(())
}

/// Event entries carry the parameter count in one byte
fn parameter_length(len: usize) -> Result<u8> {
    u8::try_from(len).map_err(|_| {
        BoardError::InvalidParameter(format!(
            "reaction carries {} parameter bytes, at most {} fit an event entry",
            len,
            u8::MAX
        ))
    })
}

fn channel_of(attributes: &Attributes, channel: usize) -> Result<Attributes> {
    attributes.split().get(channel).cloned().ok_or_else(|| {
        BoardError::InvalidRoute(format!(
            "channel {} requested from a {} channel stream",
            channel,
            attributes.channels() * attributes.copies as usize
        ))
    })
}

fn planned_logger(target: Target, attributes: &Attributes) -> Result<PlannedLogger> {
    if attributes.length() == 0 {
        return Err(BoardError::InvalidRoute(
            "cannot log a stream without data".to_string(),
        ));
    }
    Ok(PlannedLogger {
        target,
        slots: Vec::new(),
    })
}

impl RouteBuild {
    /// Validate a route and lay out its creations
    pub fn plan(
        id: RouteId,
        spec: RouteSpec,
        arena: &ProducerArena,
        names: &NameTable,
        ctx: &CodecContext,
    ) -> Result<RouteBuild> {
        let mut planned = Vec::new();
        let mut loggers = Vec::new();
        let mut reactions = Vec::new();
        let mut plan = Vec::new();

        match &spec {
            RouteSpec::Data(route) => {
                let source = arena.get(route.source)?.attributes.clone();

                let mut local_names: HashMap<&str, usize> = HashMap::new();
                for (i, node) in route.nodes.iter().enumerate() {
                    if let Some(name) = node.name.as_deref() {
                        if names.contains_key(name) || local_names.insert(name, i).is_some() {
                            return Err(BoardError::DuplicateProcessorName(name.to_string()));
                        }
                    }
                }

                for (i, node) in route.nodes.iter().enumerate() {
                    if node.input.node().is_some_and(|j| j >= i) {
                        return Err(BoardError::InvalidRoute(format!(
                            "node {} reads from node {:?} which is not declared before it",
                            i, node.input
                        )));
                    }
                    let input = match node.input {
                        NodeInput::Source => source.clone(),
                        NodeInput::SourceChannel(c) => channel_of(&source, c)?,
                        NodeInput::Node(j) => planned_at(&planned, j)?.clone(),
                        NodeInput::NodeChannel(j, c) => {
                            channel_of(planned_at(&planned, j)?, c)?
                        }
                    };
                    input.source_config()?;

                    let mut fused = Vec::with_capacity(node.fuse.len());
                    match &node.config {
                        ProcessorConfig::Fuser { .. } => {
                            if node.fuse.is_empty() {
                                return Err(BoardError::InvalidRoute(
                                    "fuser needs at least one named input".to_string(),
                                ));
                            }
                            for name in &node.fuse {
                                let attrs = match local_names.get(name.as_str()) {
                                    Some(&j) if j < i => planned_at(&planned, j)?.clone(),
                                    Some(_) => {
                                        return Err(BoardError::InvalidRoute(format!(
                                            "fuser input '{}' is declared after the fuser",
                                            name
                                        )))
                                    }
                                    None => {
                                        let binding = names.get(name).ok_or_else(|| {
                                            BoardError::InvalidRoute(format!(
                                                "fuser input '{}' is not a live processor",
                                                name
                                            ))
                                        })?;
                                        arena.get(binding.producer)?.attributes.clone()
                                    }
                                };
                                fused.push(attrs);
                            }
                            ProcessorConfig::Fuser {
                                inputs: vec![0; node.fuse.len()],
                            }
                            .encode(ctx)?;
                        }
                        other => {
                            if !node.fuse.is_empty() {
                                return Err(BoardError::InvalidRoute(format!(
                                    "only a fuser can fuse inputs, node {} is a {}",
                                    i,
                                    other.kind_name()
                                )));
                            }
                            other.encode(ctx)?;
                        }
                    }

                    planned.push(node.config.output_attributes(&input, &fused));
                    plan.push(Continuation::Processor { node: i });
                }

                if route.log {
                    loggers.push(planned_logger(Target::Producer(route.source), &source)?);
                }
                for (i, node) in route.nodes.iter().enumerate() {
                    if node.log {
                        loggers.push(planned_logger(Target::Node(i), &planned[i])?);
                    }
                }

                for reaction in &route.reactions {
                    check_reaction(reaction, &local_names, names, ctx)?;
                    reactions.push((Target::Producer(route.source), reaction.clone()));
                }
                for (i, node) in route.nodes.iter().enumerate() {
                    for reaction in &node.reactions {
                        check_reaction(reaction, &local_names, names, ctx)?;
                        reactions.push((Target::Node(i), reaction.clone()));
                    }
                }

                for (l, logger) in loggers.iter().enumerate() {
                    let attributes = match logger.target {
                        Target::Producer(_) => &source,
                        Target::Node(i) => &planned[i],
                        Target::Timer => continue,
                    };
                    for (start, length) in attributes.log_slices() {
                        plan.push(Continuation::LogSlot {
                            logger: l,
                            start,
                            length,
                        });
                    }
                }
            }
            RouteSpec::Timer(route) => {
                plan.push(Continuation::Timer);
                for reaction in &route.reactions {
                    check_reaction(reaction, &HashMap::new(), names, ctx)?;
                    reactions.push((Target::Timer, reaction.clone()));
                }
            }
            RouteSpec::Event(route) => {
                arena.get(route.source)?;
                for reaction in &route.reactions {
                    check_reaction(reaction, &HashMap::new(), names, ctx)?;
                    reactions.push((Target::Producer(route.source), reaction.clone()));
                }
            }
        }

        for reaction in 0..reactions.len() {
            plan.push(Continuation::Event { reaction });
        }

        if plan.is_empty() {
            return Err(BoardError::InvalidRoute(format!(
                "{} route creates nothing on the board",
                spec.kind()
            )));
        }

        let nodes = planned.len();
        Ok(RouteBuild {
            id,
            spec,
            plan,
            cursor: 0,
            state: RouteState::Pending,
            planned,
            outputs: vec![None; nodes],
            node_ids: vec![None; nodes],
            timer: None,
            loggers,
            reactions,
            created: Vec::new(),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> RouteState {
        self.state
    }

    /// Entities allocated so far, in creation order
    pub fn created(&self) -> &[CreatedEntity] {
        &self.created
    }

    /// Whether every planned creation has its identifier
    pub fn is_complete(&self) -> bool {
        self.cursor == self.plan.len()
    }

    fn data_route(&self) -> Option<&DataRoute> {
        match &self.spec {
            RouteSpec::Data(route) => Some(route),
            _ => None,
        }
    }

    fn node_output(&self, node: usize) -> Result<ProducerId> {
        self.outputs.get(node).copied().flatten().ok_or_else(|| {
            BoardError::InvalidRoute(format!("node {} has not been created yet", node))
        })
    }

    fn input_producer(&self, node: usize, arena: &mut ProducerArena) -> Result<ProducerId> {
        let route = self
            .data_route()
            .ok_or_else(|| BoardError::InvalidRoute("not a data route".to_string()))?;
        let input = route
            .nodes
            .get(node)
            .map(|n| n.input)
            .ok_or_else(|| BoardError::InvalidRoute(format!("no node {}", node)))?;

        match input {
            NodeInput::Source => Ok(route.source),
            NodeInput::SourceChannel(c) => arena.channel(route.source, c),
            NodeInput::Node(j) => self.node_output(j),
            NodeInput::NodeChannel(j, c) => {
                let parent = self.node_output(j)?;
                arena.channel(parent, c)
            }
        }
    }

    fn target_producer(&self, target: Target) -> Result<ProducerId> {
        match target {
            Target::Producer(id) => Ok(id),
            Target::Node(i) => self.node_output(i),
            Target::Timer => self
                .timer
                .map(|(_, producer)| producer)
                .ok_or_else(|| BoardError::InvalidRoute("timer not created yet".to_string())),
        }
    }

    /// Board id of a processor named in this route or by a live route
    fn processor_id(&self, name: &str, names: &NameTable) -> Result<u8> {
        if let Some(route) = self.data_route() {
            if let Some(i) = route
                .nodes
                .iter()
                .position(|n| n.name.as_deref() == Some(name))
            {
                return self.node_ids[i].ok_or_else(|| {
                    BoardError::InvalidRoute(format!("processor '{}' not created yet", name))
                });
            }
        }
        names
            .get(name)
            .map(|b| b.processor)
            .ok_or_else(|| BoardError::InvalidRoute(format!("unknown processor '{}'", name)))
    }

    fn reaction_command(
        &self,
        reaction: &Reaction,
        names: &NameTable,
        ctx: &CodecContext,
    ) -> Result<(u8, u8, Vec<u8>)> {
        match &reaction.target {
            ReactionTarget::Command {
                module,
                register,
                params,
            } => Ok((*module, *register, params.clone())),
            ReactionTarget::ProcessorParameter { name, config } => {
                let mut params = vec![self.processor_id(name, names)?];
                params.extend(config.encode(ctx)?);
                Ok((processor::MODULE, processor::PARAMETER, params))
            }
            ReactionTarget::ProcessorState { name, state } => {
                let mut params = vec![self.processor_id(name, names)?];
                params.extend_from_slice(state);
                Ok((processor::MODULE, processor::STATE, params))
            }
        }
    }

    /// Render the next creation, or `None` once the route is complete
    pub fn next_creation(
        &mut self,
        arena: &mut ProducerArena,
        names: &NameTable,
        ctx: &CodecContext,
    ) -> Result<Option<PendingCreation>> {
        let Some(&step) = self.plan.get(self.cursor) else {
            return Ok(None);
        };

        self.state = match step {
            Continuation::Timer | Continuation::Processor { .. } => RouteState::BuildingConfigs,
            Continuation::LogSlot { .. } => RouteState::BuildingLoggers,
            Continuation::Event { .. } => RouteState::BuildingEvents,
        };

        let mut follow_up = Vec::new();
        let (command, reply) = match step {
            Continuation::Timer => {
                let RouteSpec::Timer(route) = &self.spec else {
                    return Err(BoardError::InvalidRoute("not a timer route".to_string()));
                };
                (route.creation_command(), (timer::MODULE, timer::ENTRY))
            }
            Continuation::Processor { node } => {
                let input = self.input_producer(node, arena)?;
                let input_bytes = arena.get(input)?.input_bytes()?;

                let route = self
                    .data_route()
                    .ok_or_else(|| BoardError::InvalidRoute("not a data route".to_string()))?;
                let config = match &route.nodes[node].config {
                    ProcessorConfig::Fuser { .. } => ProcessorConfig::Fuser {
                        inputs: route.nodes[node]
                            .fuse
                            .iter()
                            .map(|name| self.processor_id(name, names))
                            .collect::<Result<Vec<u8>>>()?,
                    },
                    other => other.clone(),
                };

                let mut command = vec![processor::MODULE, processor::ADD];
                command.extend_from_slice(&input_bytes);
                command.extend(config.encode(ctx)?);
                (command, (processor::MODULE, processor::ADD))
            }
            Continuation::LogSlot {
                logger,
                start,
                length,
            } => {
                let producer = self.target_producer(self.loggers[logger].target)?;
                let producer = arena.get(producer)?;
                let slice = producer.attributes.slice(start, length);

                let mut command = vec![logging::MODULE, logging::TRIGGER];
                command.extend_from_slice(&producer.key().to_bytes());
                command.push(slice.source_config()?);
                (command, (logging::MODULE, logging::TRIGGER))
            }
            Continuation::Event { reaction } => {
                let (target, reaction) = &self.reactions[reaction];
                let source = arena.get(self.target_producer(*target)?)?;
                let (module, register, params) = self.reaction_command(reaction, names, ctx)?;

                let mut command = vec![event::MODULE, event::ENTRY];
                command.extend_from_slice(&source.key().to_bytes());
                command.extend_from_slice(&[module, register, parameter_length(params.len())?]);
                if let Some(inject) = reaction.inject {
                    command.extend_from_slice(&inject.to_bytes());
                }

                let mut parameters = vec![event::MODULE, event::CMD_PARAMETERS];
                parameters.extend(params);
                follow_up.push(parameters);
                (command, (event::MODULE, event::ENTRY))
            }
        };

        Ok(Some(PendingCreation {
            command,
            follow_up,
            reply,
            route: self.id,
            continuation: step,
        }))
    }

    /// Bind the identifier the board returned for `creation`
    pub fn apply(
        &mut self,
        creation: &PendingCreation,
        id: u8,
        arena: &mut ProducerArena,
    ) -> Result<()> {
        if self.plan.get(self.cursor) != Some(&creation.continuation) {
            return Err(BoardError::InvalidRoute(format!(
                "identifier for {:?} arrived out of order",
                creation.continuation
            )));
        }

        match creation.continuation {
            Continuation::Timer => {
                let producer = arena.derive_timer(id);
                self.timer = Some((id, producer));
                self.created.push(CreatedEntity::Timer(id));
            }
            Continuation::Processor { node } => {
                self.created.push(CreatedEntity::Processor(id));
                let input = self.input_producer(node, arena)?;
                let output = arena.derive_processor(input, id, self.planned[node].clone())?;
                self.outputs[node] = Some(output);
                self.node_ids[node] = Some(id);
            }
            Continuation::LogSlot {
                logger,
                start,
                length,
            } => {
                self.created.push(CreatedEntity::LogSlot(id));
                self.loggers[logger].slots.push(LogSlice {
                    slot: id,
                    start,
                    length,
                });
            }
            Continuation::Event { .. } => {
                self.created.push(CreatedEntity::Event(id));
            }
        }

        self.cursor += 1;
        Ok(())
    }

    /// Command that starts the timer once the route is committed
    pub fn start_command(&self) -> Option<Vec<u8>> {
        match (&self.spec, self.timer) {
            (RouteSpec::Timer(route), Some((id, _))) if route.start => {
                Some(vec![timer::MODULE, timer::START, id])
            }
            _ => None,
        }
    }

    /// Name bindings this route introduces
    pub fn bindings(&self) -> Vec<(String, NameBinding)> {
        let Some(route) = self.data_route() else {
            return Vec::new();
        };
        route
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, node)| {
                let name = node.name.clone()?;
                Some((
                    name,
                    NameBinding {
                        route: self.id,
                        processor: self.node_ids[i]?,
                        producer: self.outputs[i]?,
                    },
                ))
            })
            .collect()
    }

    /// Finish the route, returning its handle and the loggers to register
    pub fn commit(mut self) -> (RouteHandle, Vec<(ProducerId, Vec<LogSlice>)>) {
        self.state = RouteState::Committed;
        let names = self.bindings().into_iter().map(|(name, _)| name).collect();

        let mut loggers = Vec::with_capacity(self.loggers.len());
        for logger in &self.loggers {
            if let Ok(producer) = self.target_producer(logger.target) {
                loggers.push((producer, logger.slots.clone()));
            }
        }

        let handle = RouteHandle {
            id: self.id,
            outputs: self.outputs.iter().flatten().copied().collect(),
            processors: self.node_ids.iter().flatten().copied().collect(),
            loggers: Vec::new(),
            timer: self.timer.map(|(id, _)| id),
            timer_producer: self.timer.map(|(_, producer)| producer),
            entities: self.created,
            names,
        };
        (handle, loggers)
    }

    /// Retire everything the route created host-side and return the removal
    /// commands for the board, newest entity first
    pub fn rollback(&mut self, arena: &mut ProducerArena) -> Vec<Vec<u8>> {
        self.state = RouteState::RolledBack;
        for output in self.outputs.iter_mut().rev() {
            if let Some(producer) = output.take() {
                arena.retire(producer);
            }
        }
        if let Some((_, producer)) = self.timer.take() {
            arena.retire(producer);
        }
        self.created
            .drain(..)
            .rev()
            .map(CreatedEntity::removal_command)
            .collect()
    }
}

fn planned_at(planned: &[Attributes], node: usize) -> Result<&Attributes> {
    planned
        .get(node)
        .ok_or_else(|| BoardError::InvalidRoute(format!("no node {}", node)))
}
