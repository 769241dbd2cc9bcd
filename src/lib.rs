//! # sensorboard: host control of on-board sensor pipelines
//!
//! Builds data-processing pipelines on a connected sensor board, records
//! their outputs to the board's log and downloads the stored entries with
//! host timestamps. The board speaks a register protocol of
//! `[module, register, params...]` commands; every entity it allocates
//! (processor, log trigger, event, timer) is identified by a one-byte id the
//! board returns asynchronously.
//!
//! ## Architecture
//!
//! - **Producers**: typed byte streams (sensor sources, processor outputs,
//!   channel views) kept in an arena
//! - **Allocator**: turns a route description into creation commands, one
//!   outstanding at a time, with rollback on failure
//! - **Logging**: multi-slot loggers, tick-to-calendar conversion and the
//!   download handshake
//! - **Board worker**: a thread owning the session, driven over crossbeam
//!   channels from a cloneable handle
//!
//! ## Configuration
//!
//! Timeouts and download defaults live in `board.toml` under the platform
//! data directory for `dev.hxyulin.sensorboard-rs`:
//!
//! - **Linux**: `~/.local/share/dev.hxyulin.sensorboard-rs/`
//! - **macOS**: `~/Library/Application Support/dev.hxyulin.sensorboard-rs/`
//! - **Windows**: `%APPDATA%\dev.hxyulin.sensorboard-rs\`
//!
//! ## Example
//!
//! ```ignore
//! use sensorboard::{
//!     alloc::{DataRoute, NodeInput, RouteNode, RouteSpec},
//!     codec::{ProcessorConfig, ThresholdMode},
//!     Board, BoardConfig,
//! };
//!
//! let (handle, worker) = Board::spawn(BoardConfig::load_or_default(), transport, notifications);
//! let accel = handle.register_source(0x03, 0x04, None, Attributes::uniform(3, 2, true), 6)?;
//! let route = handle.create_route(RouteSpec::Data(
//!     DataRoute::new(accel).node(RouteNode::new(NodeInput::SourceChannel(2), config).logged()),
//! ))?;
//! handle.download_log(DownloadOptions::new(10))?;
//! ```

pub mod alloc;
pub mod board;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod producer;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use alloc::{RouteHandle, RouteSpec};
pub use board::{Board, BoardHandle, BoardStatus};
pub use config::BoardConfig;
pub use error::{BoardError, Result};
pub use logging::{DownloadOptions, LogSample};
pub use producer::{Attributes, LoggerId, ProducerId, RouteId};
pub use transport::{Notification, Transport};
pub use types::{ConnectionStatus, FirmwareVersion};
