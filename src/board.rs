//! Board worker thread
//!
//! The [`Board`] owns a [`Session`] and runs it on its own thread. The
//! application talks to it through a cloneable [`BoardHandle`], whose methods
//! block until the worker answers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  BoardCommand   ┌──────────────────────────┐  commands  ┌───────────┐
//! │ BoardHandle  │ ──────────────► │          Board           │ ─────────► │ Transport │
//! │ (any thread) │ ◄────────────── │  select! { commands,     │            └─────┬─────┘
//! └──────────────┘  reply channel  │            notifications,│ ◄─────────────────┘
//!                                  │            poll tick }   │  Notification
//!                                  └──────────────────────────┘
//! ```
//!
//! Every loop iteration ends with a timeout sweep, so creation, read and
//! download deadlines are honoured within one poll interval.
//!
//! # Example
//!
//! ```ignore
//! let (board, notifications) = MockBoard::new(FirmwareVersion::new(1, 5, 0));
//! let (handle, worker) = Board::spawn(BoardConfig::default(), Box::new(board), notifications);
//! let status = handle.status()?;
//! handle.shutdown();
//! worker.join().ok();
//! ```

use crate::alloc::{RouteHandle, RouteSpec};
use crate::config::BoardConfig;
use crate::error::{BoardError, Result};
use crate::logging::{DownloadOptions, LogSample, RecoveredLogger, TimeReference};
use crate::producer::{Attributes, LoggerId, ProducerId, RouteId};
use crate::session::{Responder, Session};
use crate::transport::{Notification, Transport, TransportStats};
use crate::types::{ConnectionStatus, FirmwareVersion};
use crossbeam_channel::{bounded, never, select, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Requests handled by the board worker
#[derive(Debug)]
pub enum BoardCommand {
    /// Build a route on the board
    CreateRoute {
        spec: RouteSpec,
        reply: Responder<RouteHandle>,
    },
    /// Remove a committed route
    RemoveRoute {
        route: RouteId,
        reply: Responder<()>,
    },
    /// Register a sensor stream
    RegisterSource {
        module: u8,
        register: u8,
        data_id: Option<u8>,
        attributes: Attributes,
        reply_size: usize,
        reply: Responder<ProducerId>,
    },
    /// Download stored log entries
    DownloadLog {
        options: DownloadOptions,
        reply: Responder<()>,
    },
    /// Rebuild loggers from the board's triggers
    RecoverLoggers {
        reply: Responder<Vec<RecoveredLogger>>,
    },
    SubscribeLogger {
        logger: LoggerId,
        reply: Responder<Receiver<LogSample>>,
    },
    SubscribeProducer {
        producer: ProducerId,
        reply: Responder<Receiver<Vec<u8>>>,
    },
    /// Read the board clock
    SyncTime { reply: Responder<TimeReference> },
    Status { reply: Sender<BoardStatus> },
    Shutdown,
}

/// Snapshot of the worker's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardStatus {
    pub connection: ConnectionStatus,
    pub firmware: FirmwareVersion,
    pub routes: usize,
    pub loggers: usize,
    /// Live producers in the arena
    pub producers: usize,
    /// Routes queued behind the one being built
    pub pending_routes: usize,
    pub downloading: bool,
    pub transport: TransportStats,
}

/// The board worker
pub struct Board {
    session: Session,
    command_rx: Receiver<BoardCommand>,
    notifications: Receiver<Notification>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl Board {
    /// Create a worker and the handle that drives it
    pub fn new(
        config: BoardConfig,
        transport: Box<dyn Transport>,
        notifications: Receiver<Notification>,
    ) -> (Self, BoardHandle) {
        let (command_tx, command_rx) = bounded(256);
        let running = Arc::new(AtomicBool::new(true));
        let poll_interval = config.poll_interval();

        let board = Self {
            session: Session::new(config, transport),
            command_rx,
            notifications,
            running: running.clone(),
            poll_interval,
        };
        let handle = BoardHandle {
            command_tx,
            running,
        };
        (board, handle)
    }

    /// Create a worker and run it on a new thread
    pub fn spawn(
        config: BoardConfig,
        transport: Box<dyn Transport>,
        notifications: Receiver<Notification>,
    ) -> (BoardHandle, JoinHandle<()>) {
        let (board, handle) = Self::new(config, transport, notifications);
        let worker = std::thread::spawn(move || board.run());
        (handle, worker)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run until shut down or every handle is dropped
    pub fn run(mut self) {
        tracing::info!("Board worker started");
        let commands = self.command_rx.clone();
        let notifications = self.notifications.clone();
        let closed = never();
        let mut link_closed = false;

        while self.running.load(Ordering::SeqCst) {
            let incoming = if link_closed { &closed } else { &notifications };
            select! {
                recv(commands) -> msg => match msg {
                    Ok(command) => self.handle_command(command),
                    Err(_) => {
                        tracing::debug!("All board handles dropped");
                        self.running.store(false, Ordering::SeqCst);
                    }
                },
                recv(incoming) -> msg => match msg {
                    Ok(notification) => {
                        self.session.handle_notification(notification, Instant::now())
                    }
                    Err(_) => {
                        tracing::warn!("Notification channel closed");
                        link_closed = true;
                        self.session
                            .handle_notification(Notification::Disconnected, Instant::now());
                    }
                },
                default(self.poll_interval) => {}
            }
            self.session.check_timeouts(Instant::now());
        }

        self.session.shutdown();
        tracing::info!("Board worker stopped");
    }

    fn handle_command(&mut self, command: BoardCommand) {
        let now = Instant::now();
        match command {
            BoardCommand::CreateRoute { spec, reply } => {
                tracing::debug!("Create {} route", spec.kind());
                self.session.create_route(spec, reply, now);
            }
            BoardCommand::RemoveRoute { route, reply } => {
                let _ = reply.send(self.session.remove_route(route));
            }
            BoardCommand::RegisterSource {
                module,
                register,
                data_id,
                attributes,
                reply_size,
                reply,
            } => {
                let result =
                    self.session
                        .register_source(module, register, data_id, attributes, reply_size);
                let _ = reply.send(result);
            }
            BoardCommand::DownloadLog { options, reply } => {
                self.session.download_log(options, reply, now);
            }
            BoardCommand::RecoverLoggers { reply } => {
                self.session.recover_loggers(reply, now);
            }
            BoardCommand::SubscribeLogger { logger, reply } => {
                let _ = reply.send(self.session.subscribe_logger(logger));
            }
            BoardCommand::SubscribeProducer { producer, reply } => {
                let _ = reply.send(self.session.subscribe_producer(producer));
            }
            BoardCommand::SyncTime { reply } => {
                self.session.sync_time(reply, now);
            }
            BoardCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            BoardCommand::Shutdown => {
                tracing::info!("Shutdown requested");
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    fn status(&self) -> BoardStatus {
        let session = &self.session;
        BoardStatus {
            connection: session.status(),
            firmware: session.firmware(),
            routes: session.routes().count(),
            loggers: session.engine().len(),
            producers: session.arena().live_count(),
            pending_routes: session.allocator().pending_requests(),
            downloading: session.is_downloading(),
            transport: session.transport_stats(),
        }
    }
}

/// Cloneable, blocking front end of a [`Board`] worker
#[derive(Debug, Clone)]
pub struct BoardHandle {
    command_tx: Sender<BoardCommand>,
    running: Arc<AtomicBool>,
}

impl BoardHandle {
    fn request<T>(&self, make: impl FnOnce(Responder<T>) -> BoardCommand) -> Result<T> {
        let (tx, rx) = bounded(1);
        self.command_tx
            .send(make(tx))
            .map_err(|_| BoardError::Channel("board worker is not running".to_string()))?;
        rx.recv()
            .map_err(|_| BoardError::Channel("board worker dropped the request".to_string()))?
    }

    /// Build a route, blocking until it is committed or rolled back
    pub fn create_route(&self, spec: RouteSpec) -> Result<RouteHandle> {
        self.request(|reply| BoardCommand::CreateRoute { spec, reply })
    }

    pub fn remove_route(&self, route: RouteId) -> Result<()> {
        self.request(|reply| BoardCommand::RemoveRoute { route, reply })
    }

    /// Register a sensor stream
    ///
    /// `reply_size` is the byte length of the register's notification
    /// payload; `attributes` must fit inside it.
    pub fn register_source(
        &self,
        module: u8,
        register: u8,
        data_id: Option<u8>,
        attributes: Attributes,
        reply_size: usize,
    ) -> Result<ProducerId> {
        self.request(|reply| BoardCommand::RegisterSource {
            module,
            register,
            data_id,
            attributes,
            reply_size,
            reply,
        })
    }

    /// Download stored log entries, blocking until the readout completes
    pub fn download_log(&self, options: DownloadOptions) -> Result<()> {
        self.request(|reply| BoardCommand::DownloadLog { options, reply })
    }

    pub fn recover_loggers(&self) -> Result<Vec<RecoveredLogger>> {
        self.request(|reply| BoardCommand::RecoverLoggers { reply })
    }

    pub fn subscribe_logger(&self, logger: LoggerId) -> Result<Receiver<LogSample>> {
        self.request(|reply| BoardCommand::SubscribeLogger { logger, reply })
    }

    pub fn subscribe_producer(&self, producer: ProducerId) -> Result<Receiver<Vec<u8>>> {
        self.request(|reply| BoardCommand::SubscribeProducer { producer, reply })
    }

    pub fn sync_time(&self) -> Result<TimeReference> {
        self.request(|reply| BoardCommand::SyncTime { reply })
    }

    pub fn status(&self) -> Result<BoardStatus> {
        let (tx, rx) = bounded(1);
        self.command_tx
            .send(BoardCommand::Status { reply: tx })
            .map_err(|_| BoardError::Channel("board worker is not running".to_string()))?;
        rx.recv()
            .map_err(|_| BoardError::Channel("board worker dropped the request".to_string()))
    }

    /// Ask the worker to stop; outstanding requests fail
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(BoardCommand::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
