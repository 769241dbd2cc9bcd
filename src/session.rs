//! Connection-scoped protocol state
//!
//! A [`Session`] owns everything that lives as long as one board connection:
//! the producer arena, the allocator, committed routes, the log engine and
//! any download, recovery or time read in progress. It is driven from a
//! single thread; the [`Board`](crate::board::Board) worker feeds it commands
//! and notifications in arrival order.
//!
//! # Notification dispatch
//!
//! | bytes                      | handled by                       |
//! |----------------------------|----------------------------------|
//! | `[0b 07 entries...]`       | log engine                       |
//! | `[0b 08 remaining]`        | download progress                |
//! | `[0b 0d]`                  | page confirmation                |
//! | `[0b 84 tick uid]`         | time keeper, `sync_time` waiters |
//! | `[0b 85 count]`            | download length                  |
//! | `[0b 82 ..]`, `[09 82 ..]` | logger recovery                  |
//! | `[m r id]`                 | allocator, if a creation waits   |
//! | anything else              | live producer subscriptions      |

use crate::alloc::{AllocEnv, Allocator, RouteHandle, RouteOutcome, RouteSpec};
use crate::codec::CodecContext;
use crate::config::BoardConfig;
use crate::error::{BoardError, Result};
use crate::logging::{
    Download, DownloadOptions, DownloadStep, LogEngine, LogSample, RecoveredLogger, Recovery,
    TimeReference,
};
use crate::producer::{Attributes, LoggerId, Origin, ProducerArena, ProducerId, RouteId};
use crate::protocol::{self, logging, processor, READ_BIT};
use crate::transport::{Notification, Transport, TransportStats};
use crate::types::{ConnectionStatus, FirmwareVersion, SourceKey, NO_DATA_ID};
use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// One-shot reply channel of a request
pub type Responder<T> = Sender<Result<T>>;

fn respond<T>(reply: Responder<T>, result: Result<T>) {
    if reply.send(result).is_err() {
        debug!("Requester went away before the reply");
    }
}

fn read_u32(bytes: &[u8]) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(..4)?.try_into().ok()?))
}

#[derive(Debug)]
struct LiveSubscription {
    producer: ProducerId,
    key: SourceKey,
    offset: usize,
    length: usize,
    tx: Sender<Vec<u8>>,
}

impl LiveSubscription {
    /// Bytes of this producer inside a notification, if it carries them
    fn extract<'a>(&self, bytes: &'a [u8]) -> Option<&'a [u8]> {
        let payload = if self.key.data_id == NO_DATA_ID {
            (bytes.get(..2)? == [self.key.module, self.key.register]).then(|| &bytes[2..])?
        } else {
            (bytes.get(..3)? == self.key.to_bytes()).then(|| &bytes[3..])?
        };
        payload.get(self.offset..self.offset + self.length)
    }
}

/// Protocol state of one board connection
pub struct Session {
    config: BoardConfig,
    transport: Box<dyn Transport>,
    status: ConnectionStatus,
    firmware: FirmwareVersion,
    arena: ProducerArena,
    allocator: Allocator,
    routes: BTreeMap<RouteId, RouteHandle>,
    route_waiters: HashMap<RouteId, Responder<RouteHandle>>,
    engine: LogEngine,
    download: Option<(Download, Responder<()>)>,
    recovery: Option<(Recovery, Responder<Vec<RecoveredLogger>>)>,
    time_waiters: Vec<(Responder<TimeReference>, Instant)>,
    live: Vec<LiveSubscription>,
}

impl Session {
    /// Create a session over `transport`
    pub fn new(config: BoardConfig, transport: Box<dyn Transport>) -> Self {
        let status = if transport.is_connected() {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        };
        let firmware = transport.firmware_version();
        info!("Session opened ({}, firmware {})", status, firmware);

        Self {
            allocator: Allocator::new(config.creation_timeout()),
            engine: LogEngine::new(config.tick_period_ms),
            config,
            transport,
            status,
            firmware,
            arena: ProducerArena::new(),
            routes: BTreeMap::new(),
            route_waiters: HashMap::new(),
            download: None,
            recovery: None,
            time_waiters: Vec::new(),
            live: Vec::new(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn firmware(&self) -> FirmwareVersion {
        self.firmware
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn arena(&self) -> &ProducerArena {
        &self.arena
    }

    pub fn engine(&self) -> &LogEngine {
        &self.engine
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Committed routes in creation order
    pub fn routes(&self) -> impl Iterator<Item = &RouteHandle> {
        self.routes.values()
    }

    pub fn route(&self, id: RouteId) -> Option<&RouteHandle> {
        self.routes.get(&id)
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats().clone()
    }

    pub fn is_downloading(&self) -> bool {
        self.download.is_some()
    }

    /// Codec context for the connected firmware
    pub fn codec_context(&self) -> CodecContext {
        CodecContext::new(
            self.firmware,
            self.transport.module_revision(processor::MODULE),
        )
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.status {
            ConnectionStatus::Connected => Ok(()),
            ConnectionStatus::Disconnected => Err(BoardError::ConnectionLost),
        }
    }

    fn send(&mut self, command: &[u8]) -> Result<()> {
        debug!("-> {}", protocol::hex(command));
        self.transport.send(command)
    }

    fn with_allocator<T>(&mut self, f: impl FnOnce(&mut Allocator, &mut AllocEnv<'_>) -> T) -> T {
        let ctx = self.codec_context();
        let mut env = AllocEnv {
            transport: self.transport.as_mut(),
            arena: &mut self.arena,
            ctx,
        };
        f(&mut self.allocator, &mut env)
    }

    fn handle_outcomes(&mut self, outcomes: Vec<RouteOutcome>) {
        for outcome in outcomes {
            match outcome {
                RouteOutcome::Committed {
                    mut handle,
                    loggers,
                } => {
                    for (producer, slices) in loggers {
                        let logger = self.engine.register(producer, slices);
                        handle.loggers.push((producer, logger));
                    }
                    self.routes.insert(handle.id, handle.clone());
                    if let Some(reply) = self.route_waiters.remove(&handle.id) {
                        respond(reply, Ok(handle));
                    }
                }
                RouteOutcome::Failed { route, error } => {
                    if let Some(reply) = self.route_waiters.remove(&route) {
                        respond(reply, Err(error));
                    }
                }
            }
        }
    }

    /// Register a sensor stream the application can build routes from
    pub fn register_source(
        &mut self,
        module: u8,
        register: u8,
        data_id: Option<u8>,
        attributes: Attributes,
        reply_size: usize,
    ) -> Result<ProducerId> {
        let id = self
            .arena
            .register_source(module, register, data_id, attributes, reply_size)?;
        debug!(
            "Source {} registered as {}",
            SourceKey::new(module, register, data_id),
            id
        );
        Ok(id)
    }

    /// Queue a route; `reply` receives the handle once it commits
    pub fn create_route(&mut self, spec: RouteSpec, reply: Responder<RouteHandle>, now: Instant) {
        if let Err(e) = self.ensure_connected() {
            respond(reply, Err(e));
            return;
        }
        let id = self.allocator.submit(spec);
        self.route_waiters.insert(id, reply);
        let outcomes = self.with_allocator(|allocator, env| allocator.pump(now, env));
        self.handle_outcomes(outcomes);
    }

    /// Remove every entity of a committed route
    pub fn remove_route(&mut self, id: RouteId) -> Result<()> {
        let handle = self
            .routes
            .remove(&id)
            .ok_or_else(|| BoardError::UnknownRoute(id.to_string()))?;

        for entity in handle.entities.iter().rev() {
            if let Err(e) = self.send(&entity.removal_command()) {
                warn!("Failed to remove {:?} of route {}: {}", entity, id, e);
            }
        }
        for (_, logger) in &handle.loggers {
            self.engine.remove(*logger);
        }
        for producer in handle.outputs.iter().rev().chain(handle.timer_producer.iter()) {
            self.arena.retire(*producer);
        }
        self.allocator.release(id);

        let arena = &self.arena;
        self.live.retain(|sub| arena.contains(sub.producer));
        info!("Route {} removed", id);
        Ok(())
    }

    /// Start downloading stored log entries
    pub fn download_log(&mut self, mut options: DownloadOptions, reply: Responder<()>, now: Instant) {
        if let Err(e) = self.ensure_connected() {
            respond(reply, Err(e));
            return;
        }
        if self.download.is_some() {
            respond(
                reply,
                Err(BoardError::InvalidParameter(
                    "a log download is already running".to_string(),
                )),
            );
            return;
        }

        options.clear_entries |= self.config.download.clear_after_download;
        let (download, commands) = Download::start(options, self.config.read_timeout(), now);
        self.download = Some((download, reply));
        self.send_download_commands(commands);
    }

    fn send_download_commands(&mut self, commands: Vec<Vec<u8>>) {
        for command in commands {
            if let Err(e) = self.send(&command) {
                self.fail_download(e);
                return;
            }
        }
    }

    fn apply_download_step(&mut self, step: DownloadStep) {
        self.send_download_commands(step.commands);
        if step.finished {
            if let Some((_, reply)) = self.download.take() {
                self.engine.time_mut().finish_download();
                respond(reply, Ok(()));
            }
        }
    }

    fn fail_download(&mut self, error: BoardError) {
        if let Some((_, reply)) = self.download.take() {
            error!("Log download failed: {}", error);
            self.engine.clear_fragments();
            respond(reply, Err(error));
        }
    }

    /// Rebuild loggers from the triggers already on the board
    pub fn recover_loggers(&mut self, reply: Responder<Vec<RecoveredLogger>>, now: Instant) {
        if let Err(e) = self.ensure_connected() {
            respond(reply, Err(e));
            return;
        }
        if self.recovery.is_some() {
            respond(
                reply,
                Err(BoardError::InvalidParameter(
                    "logger recovery is already running".to_string(),
                )),
            );
            return;
        }

        let (recovery, first) = Recovery::start(
            self.config.download.log_slot_count,
            self.config.read_timeout(),
            now,
        );
        self.recovery = Some((recovery, reply));
        match first {
            Some(command) => {
                if let Err(e) = self.send(&command) {
                    self.fail_recovery(e);
                }
            }
            None => self.finish_recovery(),
        }
    }

    fn finish_recovery(&mut self) {
        if let Some((recovery, reply)) = self.recovery.take() {
            let loggers = recovery.finish(&mut self.arena, &mut self.engine);
            respond(reply, Ok(loggers));
        }
    }

    fn fail_recovery(&mut self, error: BoardError) {
        if let Some((_, reply)) = self.recovery.take() {
            error!("Logger recovery failed: {}", error);
            respond(reply, Err(error));
        }
    }

    /// Receive reassembled samples of a logger
    pub fn subscribe_logger(&mut self, logger: LoggerId) -> Result<Receiver<LogSample>> {
        self.engine.subscribe(logger)
    }

    /// Receive the live notifications of a producer
    ///
    /// Processor outputs have their notifications enabled on the board.
    pub fn subscribe_producer(&mut self, id: ProducerId) -> Result<Receiver<Vec<u8>>> {
        let producer = self.arena.get(id)?.clone();
        if let Origin::Processor(processor_id) = producer.origin {
            self.ensure_connected()?;
            self.send(&[processor::MODULE, processor::NOTIFY_ENABLE, processor_id, 1])?;
        }

        let (tx, rx) = unbounded();
        self.live.push(LiveSubscription {
            producer: id,
            key: producer.key(),
            offset: producer.attributes.offset as usize,
            length: producer.attributes.length(),
            tx,
        });
        Ok(rx)
    }

    /// Read the board clock and anchor the current generation
    pub fn sync_time(&mut self, reply: Responder<TimeReference>, now: Instant) {
        if let Err(e) = self.ensure_connected() {
            respond(reply, Err(e));
            return;
        }
        match self.send(&protocol::read(logging::MODULE, logging::TIME)) {
            Ok(()) => self
                .time_waiters
                .push((reply, now + self.config.read_timeout())),
            Err(e) => respond(reply, Err(e)),
        }
    }

    /// Feed one notification from the transport
    pub fn handle_notification(&mut self, notification: Notification, now: Instant) {
        match notification {
            Notification::Data(bytes) => self.handle_data(&bytes, now),
            Notification::Connected(firmware) => self.on_connected(firmware),
            Notification::Disconnected => self.on_disconnected(),
        }
    }

    fn handle_data(&mut self, bytes: &[u8], now: Instant) {
        let [module, register, ..] = *bytes else {
            warn!("Runt notification {}", protocol::hex(bytes));
            return;
        };
        let body = &bytes[2..];

        match (module, register) {
            (logging::MODULE, logging::READOUT_NOTIFY) => self.on_log_entries(body, now),
            (logging::MODULE, logging::READOUT_PROGRESS) => match read_u32(body) {
                Some(remaining) => self.on_progress(remaining, now),
                None => warn!("Short progress notification {}", protocol::hex(bytes)),
            },
            (logging::MODULE, logging::READOUT_PAGE_COMPLETED) => self.on_page_completed(now),
            (logging::MODULE, r) if r == logging::TIME | READ_BIT => {
                match (read_u32(body), body.get(4)) {
                    (Some(tick), Some(&uid)) => self.on_time(tick, uid),
                    _ => warn!("Short time reply {}", protocol::hex(bytes)),
                }
            }
            (logging::MODULE, r) if r == logging::LENGTH | READ_BIT => match read_u32(body) {
                Some(count) => self.on_length(count, now),
                None => warn!("Short length reply {}", protocol::hex(bytes)),
            },
            _ if self
                .recovery
                .as_ref()
                .is_some_and(|(r, _)| r.awaiting(module, register)) =>
            {
                self.on_recovery_reply(bytes, now)
            }
            _ if bytes.len() == 3 && self.allocator.awaiting(module, register) => {
                let id = bytes[2];
                let outcomes = self.with_allocator(|allocator, env| {
                    allocator.on_identifier(module, register, id, now, env)
                });
                self.handle_outcomes(outcomes.unwrap_or_default());
            }
            _ => self.on_live_data(bytes),
        }
    }

    fn on_log_entries(&mut self, body: &[u8], now: Instant) {
        let wall = Utc::now();
        match self.download.as_mut() {
            Some((download, _)) => {
                download.touch(now);
                self.engine
                    .handle_readout(body, wall, |e, raw| download.report(e, raw));
            }
            None => self.engine.handle_readout(body, wall, |e, raw| {
                warn!("{} ({})", e, protocol::hex(raw));
            }),
        }
    }

    fn on_progress(&mut self, remaining: u32, now: Instant) {
        let Some((download, _)) = self.download.as_mut() else {
            debug!("Progress {} without a download", remaining);
            return;
        };
        let step = download.on_progress(remaining, now);
        self.apply_download_step(step);
    }

    fn on_length(&mut self, count: u32, now: Instant) {
        let Some((download, _)) = self.download.as_mut() else {
            debug!("Log length {} without a download", count);
            return;
        };
        // The time read went out ahead of the length read, so the anchor is
        // fresh by now. Hold it until the entries are in.
        self.engine.time_mut().begin_download();
        let step = download.on_length(count, now);
        self.apply_download_step(step);
    }

    fn on_page_completed(&mut self, now: Instant) {
        let confirm = match self.download.as_mut() {
            Some((download, _)) => download.on_page_completed(now),
            None => vec![logging::MODULE, logging::READOUT_PAGE_CONFIRM],
        };
        if let Err(e) = self.send(&confirm) {
            self.fail_download(e);
        }
    }

    fn on_time(&mut self, tick: u32, reset_uid: u8) {
        let time = self.engine.time_mut();
        time.on_time_reply(reset_uid, tick, Utc::now());
        let Some(reference) = time.reference(reset_uid).copied() else {
            return;
        };
        for (reply, _) in self.time_waiters.drain(..) {
            respond(reply, Ok(reference));
        }
    }

    fn on_recovery_reply(&mut self, bytes: &[u8], now: Instant) {
        let ctx = self.codec_context();
        let Some((recovery, _)) = self.recovery.as_mut() else {
            return;
        };
        match recovery.on_reply(bytes, &ctx, now) {
            Ok(Some(next)) => {
                if let Err(e) = self.send(&next) {
                    self.fail_recovery(e);
                }
            }
            Ok(None) if recovery.is_finished() => self.finish_recovery(),
            Ok(None) => {}
            Err(e) => self.fail_recovery(e),
        }
    }

    fn on_live_data(&mut self, bytes: &[u8]) {
        let mut matched = false;
        self.live.retain(|sub| match sub.extract(bytes) {
            Some(data) => {
                matched = true;
                sub.tx.send(data.to_vec()).is_ok()
            }
            None => true,
        });
        if !matched {
            debug!("Unhandled notification {}", protocol::hex(bytes));
        }
    }

    fn on_disconnected(&mut self) {
        if self.status == ConnectionStatus::Disconnected {
            return;
        }
        warn!("Board disconnected");
        self.status = ConnectionStatus::Disconnected;

        let outcomes = self
            .allocator
            .abort(BoardError::ConnectionLost, &mut self.arena);
        self.handle_outcomes(outcomes);
        self.fail_download(BoardError::ConnectionLost);
        self.fail_recovery(BoardError::ConnectionLost);
        for (reply, _) in self.time_waiters.drain(..) {
            respond(reply, Err(BoardError::ConnectionLost));
        }
        self.engine.time_mut().on_disconnect();
    }

    fn on_connected(&mut self, firmware: FirmwareVersion) {
        if self.firmware != firmware {
            info!(
                "Firmware changed from {} to {}, dropping board state",
                self.firmware, firmware
            );
            let outcomes = self
                .allocator
                .reset(BoardError::ConnectionLost, &mut self.arena);
            self.handle_outcomes(outcomes);
            self.fail_download(BoardError::ConnectionLost);
            self.fail_recovery(BoardError::ConnectionLost);
            self.routes.clear();
            self.engine.reset();
            self.arena.retire_derived();
            let arena = &self.arena;
            self.live.retain(|sub| arena.contains(sub.producer));
        } else {
            self.allocator.flush_deferred(self.transport.as_mut());
        }

        self.firmware = firmware;
        self.status = ConnectionStatus::Connected;
        info!("Board connected (firmware {})", firmware);
    }

    /// Fail whatever has passed its deadline
    pub fn check_timeouts(&mut self, now: Instant) {
        let outcomes = self.with_allocator(|allocator, env| allocator.check_timeout(now, env));
        self.handle_outcomes(outcomes);

        if let Some(error) = self
            .download
            .as_ref()
            .and_then(|(d, _)| d.check_timeout(now))
        {
            self.fail_download(error);
        }
        if let Some(error) = self
            .recovery
            .as_ref()
            .and_then(|(r, _)| r.check_timeout(now))
        {
            self.fail_recovery(error);
        }

        let (expired, waiting): (Vec<_>, Vec<_>) = self
            .time_waiters
            .drain(..)
            .partition(|(_, deadline)| now >= *deadline);
        self.time_waiters = waiting;
        for (reply, _) in expired {
            respond(
                reply,
                Err(BoardError::ReadTimeout {
                    module: logging::MODULE,
                    register: logging::TIME | READ_BIT,
                }),
            );
        }
    }

    /// Fail every outstanding request; the worker is stopping
    pub fn shutdown(&mut self) {
        let error = BoardError::Channel("board worker shut down".to_string());
        let outcomes = self.allocator.abort(error.clone(), &mut self.arena);
        self.handle_outcomes(outcomes);
        self.fail_download(error.clone());
        self.fail_recovery(error.clone());
        for (reply, _) in self.time_waiters.drain(..) {
            respond(reply, Err(error.clone()));
        }
        self.allocator.flush_deferred(self.transport.as_mut());
    }
}
