//! Remote entity allocation
//!
//! Turns route declarations into board entities (timers, processors, log
//! triggers, event bindings) one identifier at a time.
//!
//! # Architecture
//!
//! ```text
//! submit() ──► requests ──► RouteBuild (active) ──► CreationQueue ──► Transport
//!                                  ▲                       │
//!                                  └──── on_identifier ◄───┘ [m, r, id]
//! ```
//!
//! Only one route is built at a time and only one creation is in flight, so
//! identifier replies are matched purely by arrival order. A route either
//! commits with every entity created or rolls back every entity it created.

pub mod builder;
pub mod queue;
pub mod route;

pub use builder::{Continuation, NameBinding, NameTable, RouteBuild};
pub use queue::{CreationQueue, PendingCreation};
pub use route::{
    CreatedEntity, DataInjection, DataRoute, EventRoute, NodeInput, Reaction, ReactionTarget,
    RouteHandle, RouteNode, RouteSpec, RouteState, TimerRoute,
};

use crate::codec::CodecContext;
use crate::error::{BoardError, Result};
use crate::logging::LogSlice;
use crate::producer::{ProducerArena, ProducerId, RouteId};
use crate::protocol;
use crate::transport::Transport;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What the allocator needs from the session for one step
pub struct AllocEnv<'a> {
    pub transport: &'a mut dyn Transport,
    pub arena: &'a mut ProducerArena,
    pub ctx: CodecContext,
}

/// Final result of a route request
#[derive(Debug)]
pub enum RouteOutcome {
    /// Every entity was created
    Committed {
        handle: RouteHandle,
        /// Loggers to register with the log engine
        loggers: Vec<(ProducerId, Vec<LogSlice>)>,
    },
    /// The route was rolled back (or never started)
    Failed { route: RouteId, error: BoardError },
}

impl RouteOutcome {
    /// Route the outcome belongs to
    pub fn route(&self) -> RouteId {
        match self {
            RouteOutcome::Committed { handle, .. } => handle.id,
            RouteOutcome::Failed { route, .. } => *route,
        }
    }
}

fn send_creation(creation: &PendingCreation, transport: &mut dyn Transport) -> Result<()> {
    debug!(
        "Creating {:?} for {}: {}",
        creation.continuation,
        creation.route,
        protocol::hex(&creation.command)
    );
    transport.send(&creation.command)?;
    for command in &creation.follow_up {
        transport.send(command)?;
    }
    Ok(())
}

/// Serializes route requests onto the board
pub struct Allocator {
    queue: CreationQueue,
    requests: VecDeque<(RouteId, RouteSpec)>,
    active: Option<RouteBuild>,
    names: NameTable,
    /// Removal commands that could not be sent while the link was down
    deferred: Vec<Vec<u8>>,
    next_route: u32,
}

impl Allocator {
    /// Create an allocator whose creations time out after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            queue: CreationQueue::new(timeout),
            requests: VecDeque::new(),
            active: None,
            names: NameTable::new(),
            deferred: Vec::new(),
            next_route: 0,
        }
    }

    /// Queue a route request
    pub fn submit(&mut self, spec: RouteSpec) -> RouteId {
        let id = RouteId(self.next_route);
        self.next_route = self.next_route.wrapping_add(1);
        debug!("Queued {} route {}", spec.kind(), id);
        self.requests.push_back((id, spec));
        id
    }

    /// Live processor names
    pub fn names(&self) -> &NameTable {
        &self.names
    }

    /// State of the route being built, if any
    pub fn active(&self) -> Option<(RouteId, RouteState)> {
        self.active.as_ref().map(|b| (b.id, b.state()))
    }

    /// Requests waiting behind the active route
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Whether an identifier reply on `(module, register)` is expected
    pub fn awaiting(&self, module: u8, register: u8) -> bool {
        self.queue.awaiting(module, register)
    }

    /// Deadline of the in-flight creation
    pub fn deadline(&self) -> Option<Instant> {
        self.queue.deadline()
    }

    /// Whether nothing is queued, building or in flight
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.requests.is_empty() && self.queue.is_idle()
    }

    /// Advance as far as possible without waiting for the board
    pub fn pump(&mut self, now: Instant, env: &mut AllocEnv<'_>) -> Vec<RouteOutcome> {
        let mut outcomes = Vec::new();

        loop {
            if self.active.is_none() {
                let Some((id, spec)) = self.requests.pop_front() else {
                    break;
                };
                match RouteBuild::plan(id, spec, env.arena, &self.names, &env.ctx) {
                    Ok(build) => {
                        info!("Building route {}", id);
                        self.active = Some(build);
                    }
                    Err(e) => {
                        warn!("Route {} rejected: {}", id, e);
                        outcomes.push(RouteOutcome::Failed { route: id, error: e });
                        continue;
                    }
                }
            }

            if !self.queue.is_idle() {
                break;
            }

            let Some(build) = self.active.as_mut() else {
                break;
            };
            match build.next_creation(env.arena, &self.names, &env.ctx) {
                Ok(Some(creation)) => {
                    self.queue.push(creation);
                    let sent = match self.queue.dispatch(now).cloned() {
                        Some(creation) => send_creation(&creation, env.transport),
                        None => Ok(()),
                    };
                    match sent {
                        Ok(()) => break,
                        Err(e) => outcomes.extend(self.fail_active(e, env)),
                    }
                }
                Ok(None) => outcomes.push(self.commit_active(env)),
                Err(e) => outcomes.extend(self.fail_active(e, env)),
            }
        }

        outcomes
    }

    /// Handle an identifier reply
    ///
    /// Returns `None` when no creation was waiting on `(module, register)`.
    pub fn on_identifier(
        &mut self,
        module: u8,
        register: u8,
        id: u8,
        now: Instant,
        env: &mut AllocEnv<'_>,
    ) -> Option<Vec<RouteOutcome>> {
        let creation = self.queue.resolve(module, register)?;
        debug!("Identifier {} for {:?}", id, creation.continuation);

        let mut outcomes = Vec::new();
        match self.active.as_mut() {
            Some(build) if build.id == creation.route => {
                if let Err(e) = build.apply(&creation, id, env.arena) {
                    outcomes.extend(self.fail_active(e, env));
                }
            }
            _ => warn!(
                "Identifier {} arrived for route {} which is no longer building",
                id, creation.route
            ),
        }

        outcomes.extend(self.pump(now, env));
        Some(outcomes)
    }

    /// Fail the active route if its creation reply is overdue
    pub fn check_timeout(&mut self, now: Instant, env: &mut AllocEnv<'_>) -> Vec<RouteOutcome> {
        let Some(creation) = self.queue.expire(now) else {
            return Vec::new();
        };
        let error = BoardError::CreationTimeout {
            module: creation.reply.0,
            register: creation.reply.1,
        };

        let mut outcomes = Vec::new();
        if self.active.as_ref().is_some_and(|b| b.id == creation.route) {
            outcomes.extend(self.fail_active(error, env));
        }
        outcomes.extend(self.pump(now, env));
        outcomes
    }

    /// Fail the active route and every queued request, e.g. on disconnect
    ///
    /// Removal commands for partially created entities are kept and sent by
    /// [`Allocator::flush_deferred`] once the link is back.
    pub fn abort(&mut self, error: BoardError, arena: &mut ProducerArena) -> Vec<RouteOutcome> {
        self.queue.clear();
        let mut outcomes = Vec::new();

        if let Some(mut build) = self.active.take() {
            let removals = build.rollback(arena);
            if !removals.is_empty() {
                debug!(
                    "Deferring {} removals of route {} until reconnect",
                    removals.len(),
                    build.id
                );
            }
            self.deferred.extend(removals);
            error!("Route {} aborted: {}", build.id, error);
            outcomes.push(RouteOutcome::Failed {
                route: build.id,
                error: error.clone(),
            });
        }

        for (id, _) in self.requests.drain(..) {
            outcomes.push(RouteOutcome::Failed {
                route: id,
                error: error.clone(),
            });
        }
        outcomes
    }

    /// Send removals deferred by [`Allocator::abort`]
    pub fn flush_deferred(&mut self, transport: &mut dyn Transport) {
        for command in std::mem::take(&mut self.deferred) {
            if let Err(e) = transport.send(&command) {
                warn!("Failed to remove orphaned entity {}: {}", protocol::hex(&command), e);
            }
        }
    }

    /// Forget everything; the board no longer holds any of our entities
    pub fn reset(&mut self, error: BoardError, arena: &mut ProducerArena) -> Vec<RouteOutcome> {
        let outcomes = self.abort(error, arena);
        self.deferred.clear();
        self.names.clear();
        outcomes
    }

    /// Drop the names bound by a removed route
    pub fn release(&mut self, route: RouteId) {
        self.names.retain(|_, binding| binding.route != route);
    }

    fn fail_active(&mut self, error: BoardError, env: &mut AllocEnv<'_>) -> Option<RouteOutcome> {
        let build = self.active.take()?;
        Some(self.fail_build(build, error, env))
    }

    fn fail_build(
        &mut self,
        mut build: RouteBuild,
        error: BoardError,
        env: &mut AllocEnv<'_>,
    ) -> RouteOutcome {
        self.queue.cancel_route(build.id);
        let state = build.state();
        for command in build.rollback(env.arena) {
            if let Err(e) = env.transport.send(&command) {
                warn!("Rollback of {} failed: {}", protocol::hex(&command), e);
            }
        }
        error!("Route {} rolled back while {}: {}", build.id, state, error);
        RouteOutcome::Failed {
            route: build.id,
            error,
        }
    }

    fn commit_active(&mut self, env: &mut AllocEnv<'_>) -> RouteOutcome {
        let Some(build) = self.active.take() else {
            return RouteOutcome::Failed {
                route: RouteId(u32::MAX),
                error: BoardError::InvalidRoute("no route is building".to_string()),
            };
        };

        if let Some(start) = build.start_command() {
            if let Err(e) = env.transport.send(&start) {
                return self.fail_build(build, e, env);
            }
        }

        for (name, binding) in build.bindings() {
            self.names.insert(name, binding);
        }
        let (handle, loggers) = build.commit();
        info!(
            "Route {} committed with {} entities",
            handle.id,
            handle.entities.len()
        );
        RouteOutcome::Committed { handle, loggers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ProcessorConfig, ThresholdMode};
    use crate::producer::Attributes;
    use crate::transport::{RecordingTransport, SentLog};
    use crate::types::FirmwareVersion;

    fn ctx() -> CodecContext {
        CodecContext::new(FirmwareVersion::new(1, 5, 0), 0)
    }

    struct Fixture {
        allocator: Allocator,
        transport: RecordingTransport,
        sent: SentLog,
        arena: ProducerArena,
        source: ProducerId,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_transport(|t| t)
        }

        fn with_transport(f: impl FnOnce(RecordingTransport) -> RecordingTransport) -> Self {
            let (transport, sent) = RecordingTransport::new(FirmwareVersion::new(1, 5, 0));
            let mut arena = ProducerArena::new();
            let source = arena
                .register_source(0x03, 0x04, None, Attributes::uniform(3, 2, true), 6)
                .unwrap();
            Self {
                allocator: Allocator::new(Duration::from_millis(250)),
                transport: f(transport),
                sent,
                arena,
                source,
            }
        }

        fn pump(&mut self, now: Instant) -> Vec<RouteOutcome> {
            let mut env = AllocEnv {
                transport: &mut self.transport,
                arena: &mut self.arena,
                ctx: ctx(),
            };
            self.allocator.pump(now, &mut env)
        }

        fn reply(&mut self, module: u8, register: u8, id: u8, now: Instant) -> Option<Vec<RouteOutcome>> {
            let mut env = AllocEnv {
                transport: &mut self.transport,
                arena: &mut self.arena,
                ctx: ctx(),
            };
            self.allocator.on_identifier(module, register, id, now, &mut env)
        }

        fn timeout(&mut self, now: Instant) -> Vec<RouteOutcome> {
            let mut env = AllocEnv {
                transport: &mut self.transport,
                arena: &mut self.arena,
                ctx: ctx(),
            };
            self.allocator.check_timeout(now, &mut env)
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
    }

    fn threshold_route(source: ProducerId, name: &str) -> RouteSpec {
        RouteSpec::Data(DataRoute::new(source).node(
            RouteNode::new(
                NodeInput::SourceChannel(0),
                ProcessorConfig::Threshold {
                    size: 2,
                    signed: true,
                    mode: ThresholdMode::Binary,
                    boundary: 100,
                    hysteresis: 0,
                },
            )
            .named(name),
        ))
    }

    #[test]
    fn test_routes_are_built_one_at_a_time() {
        let mut fx = Fixture::new();
        let now = Instant::now();
        let a = fx.allocator.submit(threshold_route(fx.source, "a"));
        let b = fx.allocator.submit(threshold_route(fx.source, "b"));

        assert!(fx.pump(now).is_empty());
        assert_eq!(fx.sent().len(), 1);
        assert_eq!(fx.allocator.active(), Some((a, RouteState::BuildingConfigs)));
        assert_eq!(fx.allocator.pending_requests(), 1);

        let outcomes = fx.reply(0x09, 0x02, 0, now).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].route(), a);
        assert_eq!(fx.sent().len(), 2);
        assert_eq!(fx.allocator.active().map(|(id, _)| id), Some(b));

        let outcomes = fx.reply(0x09, 0x02, 1, now).unwrap();
        assert!(matches!(&outcomes[0], RouteOutcome::Committed { handle, .. } if handle.processors == vec![1]));
        assert!(fx.allocator.is_idle());
        assert_eq!(fx.allocator.names()["b"].processor, 1);
    }

    #[test]
    fn test_unexpected_identifier_is_ignored() {
        let mut fx = Fixture::new();
        assert!(fx.reply(0x09, 0x02, 0, Instant::now()).is_none());
    }

    #[test]
    fn test_timeout_rolls_back_and_continues() {
        let mut fx = Fixture::new();
        let now = Instant::now();
        let spec = RouteSpec::Data(
            DataRoute::new(fx.source)
                .node(RouteNode::new(
                    NodeInput::SourceChannel(0),
                    ProcessorConfig::Buffer { size: 2 },
                ))
                .node(RouteNode::new(NodeInput::Node(0), ProcessorConfig::Buffer { size: 2 })),
        );
        let failed = fx.allocator.submit(spec);
        let next = fx.allocator.submit(threshold_route(fx.source, "next"));

        fx.pump(now);
        fx.reply(0x09, 0x02, 7, now);
        assert!(fx.timeout(now + Duration::from_millis(100)).is_empty());

        let outcomes = fx.timeout(now + Duration::from_millis(300));
        assert!(matches!(
            &outcomes[0],
            RouteOutcome::Failed { route, error: BoardError::CreationTimeout { module: 0x09, register: 0x02 } }
                if *route == failed
        ));

        let sent = fx.sent();
        assert_eq!(sent[2], vec![0x09, 0x06, 7]);
        assert_eq!(sent[3][..2], [0x09, 0x02]);
        assert_eq!(fx.allocator.active().map(|(id, _)| id), Some(next));
    }

    #[test]
    fn test_late_identifier_binds_to_next_creation_on_same_register() {
        let mut fx = Fixture::new();
        let now = Instant::now();
        let first = fx.allocator.submit(threshold_route(fx.source, "first"));
        let second = fx.allocator.submit(threshold_route(fx.source, "second"));
        fx.pump(now);

        let outcomes = fx.timeout(now + Duration::from_millis(300));
        assert_eq!(outcomes[0].route(), first);
        assert_eq!(fx.allocator.active().map(|(id, _)| id), Some(second));

        // Replies carry no request id: the first route's reply completes the second
        let outcomes = fx.reply(0x09, 0x02, 4, now).unwrap();
        assert!(matches!(
            &outcomes[0],
            RouteOutcome::Committed { handle, .. } if handle.id == second && handle.processors == vec![4]
        ));
        assert!(fx.reply(0x09, 0x02, 5, now).is_none());
    }

    #[test]
    fn test_duplicate_name_across_routes() {
        let mut fx = Fixture::new();
        let now = Instant::now();
        fx.allocator.submit(threshold_route(fx.source, "peak"));
        fx.pump(now);
        fx.reply(0x09, 0x02, 0, now);

        let dup = fx.allocator.submit(threshold_route(fx.source, "peak"));
        let outcomes = fx.pump(now);
        assert!(matches!(
            &outcomes[0],
            RouteOutcome::Failed { route, error: BoardError::DuplicateProcessorName(_) } if *route == dup
        ));
        assert_eq!(fx.sent().len(), 1);

        fx.allocator.release(RouteId(0));
        fx.allocator.submit(threshold_route(fx.source, "peak"));
        fx.pump(now);
        assert_eq!(fx.sent().len(), 2);
    }

    #[test]
    fn test_send_failure_rolls_back() {
        let mut fx = Fixture::with_transport(|t| t.fail_when(|cmd| cmd[0] == 0x0a));
        let now = Instant::now();
        let spec = RouteSpec::Data(
            DataRoute::new(fx.source)
                .react(Reaction::command(0x02, 0x01, vec![1]))
                .node(RouteNode::new(NodeInput::SourceChannel(1), ProcessorConfig::Buffer { size: 2 }).logged()),
        );
        fx.allocator.submit(spec);
        fx.pump(now);
        fx.reply(0x09, 0x02, 2, now);
        let outcomes = fx.reply(0x0b, 0x02, 5, now).unwrap();

        assert!(matches!(&outcomes[0], RouteOutcome::Failed { error: BoardError::Transport(_), .. }));
        let sent = fx.sent();
        assert_eq!(&sent[sent.len() - 2..], &[vec![0x0b, 0x03, 5], vec![0x09, 0x06, 2]]);
        assert!(fx.arena.find_processor(2).is_none());
    }

    #[test]
    fn test_abort_defers_removals() {
        let mut fx = Fixture::new();
        let now = Instant::now();
        fx.allocator.submit(RouteSpec::Timer(TimerRoute::new(100).react(Reaction::command(0x02, 0x01, vec![]))));
        let queued = fx.allocator.submit(threshold_route(fx.source, "later"));
        fx.pump(now);
        fx.reply(0x0c, 0x02, 3, now);

        let outcomes = fx.allocator.abort(BoardError::ConnectionLost, &mut fx.arena);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[1].route(), queued);
        assert!(fx.allocator.is_idle());

        let before = fx.sent().len();
        fx.allocator.flush_deferred(&mut fx.transport);
        assert_eq!(fx.sent()[before..], [vec![0x0c, 0x05, 3]]);
    }
}
