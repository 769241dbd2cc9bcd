//! Log download handshake
//!
//! ```text
//! host                                   board
//!  │ [0b 84]            time read          │
//!  │ [0b 07 01]         entry notify on    │
//!  │ [0b 08 01]         progress notify on │
//!  │ [0b 85]            length read        │
//!  │ ◄──────────── [0b 85 count]           │
//!  │ [0b 06 count delta] readout           │
//!  │ ◄──────────── [0b 07 entries...]      │
//!  │ ◄──────────── [0b 0d] page completed  │
//!  │ [0b 0e]            page confirm       │
//!  │ ◄──────────── [0b 08 remaining]       │
//! ```
//!
//! A remaining count of zero, from either the length read or a progress
//! notification, completes the download.

use crate::config::DownloadConfig;
use crate::error::BoardError;
use crate::protocol::{self, logging};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Called with `(remaining, total)` entries on every progress notification
pub type ProgressHandler = Box<dyn FnMut(u32, u32) + Send>;

/// Called with undeliverable log data and the raw entry bytes
pub type ErrorHandler = Box<dyn FnMut(&BoardError, &[u8]) + Send>;

/// Caller options for one download
#[derive(Default)]
pub struct DownloadOptions {
    /// Number of progress notifications to ask for
    pub updates: u32,
    /// Remove downloaded entries from the board afterwards
    pub clear_entries: bool,
    pub progress: Option<ProgressHandler>,
    pub errors: Option<ErrorHandler>,
}

impl fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("updates", &self.updates)
            .field("clear_entries", &self.clear_entries)
            .field("progress", &self.progress.is_some())
            .field("errors", &self.errors.is_some())
            .finish()
    }
}

impl DownloadOptions {
    pub fn new(updates: u32) -> Self {
        Self {
            updates,
            ..Self::default()
        }
    }

    pub fn clear_entries(mut self) -> Self {
        self.clear_entries = true;
        self
    }

    pub fn on_progress(mut self, handler: impl FnMut(u32, u32) + Send + 'static) -> Self {
        self.progress = Some(Box::new(handler));
        self
    }

    pub fn on_error(mut self, handler: impl FnMut(&BoardError, &[u8]) + Send + 'static) -> Self {
        self.errors = Some(Box::new(handler));
        self
    }
}

impl From<&DownloadConfig> for DownloadOptions {
    fn from(config: &DownloadConfig) -> Self {
        Self {
            updates: config.progress_updates,
            clear_entries: config.clear_after_download,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    AwaitingLength,
    Streaming { total: u32 },
}

/// What the session must do after feeding the download a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadStep {
    pub commands: Vec<Vec<u8>>,
    pub finished: bool,
}

impl DownloadStep {
    fn send(commands: Vec<Vec<u8>>) -> Self {
        Self {
            commands,
            finished: false,
        }
    }
}

/// One running download
pub struct Download {
    phase: DownloadPhase,
    options: DownloadOptions,
    timeout: Duration,
    deadline: Instant,
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("phase", &self.phase)
            .field("options", &self.options)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Download {
    /// Begin a download, returning it with the opening commands
    ///
    /// `timeout` bounds the wait for the length reply and the silence between
    /// streamed notifications.
    pub fn start(options: DownloadOptions, timeout: Duration, now: Instant) -> (Self, Vec<Vec<u8>>) {
        let commands = vec![
            protocol::read(logging::MODULE, logging::TIME),
            vec![logging::MODULE, logging::READOUT_NOTIFY, 1],
            vec![logging::MODULE, logging::READOUT_PROGRESS, 1],
            protocol::read(logging::MODULE, logging::LENGTH),
        ];
        let download = Self {
            phase: DownloadPhase::AwaitingLength,
            options,
            timeout,
            deadline: now + timeout,
        };
        (download, commands)
    }

    pub fn phase(&self) -> DownloadPhase {
        self.phase
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Error to fail the download with once `now` passes the deadline
    pub fn check_timeout(&self, now: Instant) -> Option<BoardError> {
        if now < self.deadline {
            return None;
        }
        let register = match self.phase {
            DownloadPhase::AwaitingLength => logging::LENGTH | protocol::READ_BIT,
            DownloadPhase::Streaming { .. } => logging::READOUT_NOTIFY,
        };
        Some(BoardError::ReadTimeout {
            module: logging::MODULE,
            register,
        })
    }

    /// Push the inactivity deadline out after board traffic
    pub fn touch(&mut self, now: Instant) {
        self.deadline = now + self.timeout;
    }

    fn finish(&self) -> DownloadStep {
        let mut commands = vec![
            vec![logging::MODULE, logging::READOUT_NOTIFY, 0],
            vec![logging::MODULE, logging::READOUT_PROGRESS, 0],
        ];
        if self.options.clear_entries {
            commands.push(vec![logging::MODULE, logging::REMOVE_ENTRIES, 0xff, 0xff, 0xff, 0xff]);
        }
        DownloadStep {
            commands,
            finished: true,
        }
    }

    /// Handle the stored entry count
    pub fn on_length(&mut self, count: u32, now: Instant) -> DownloadStep {
        self.touch(now);
        if self.phase != DownloadPhase::AwaitingLength {
            debug!("Ignoring log length {} outside the handshake", count);
            return DownloadStep::send(Vec::new());
        }
        if count == 0 {
            info!("No log entries to download");
            return self.finish();
        }

        let delta = if self.options.updates == 0 {
            0
        } else {
            count / self.options.updates
        };
        info!("Downloading {} log entries", count);
        self.phase = DownloadPhase::Streaming { total: count };

        let mut readout = vec![logging::MODULE, logging::READOUT];
        readout.extend_from_slice(&count.to_le_bytes());
        readout.extend_from_slice(&delta.to_le_bytes());
        DownloadStep::send(vec![readout])
    }

    /// Handle a remaining-entries notification
    pub fn on_progress(&mut self, remaining: u32, now: Instant) -> DownloadStep {
        self.touch(now);
        let DownloadPhase::Streaming { total } = self.phase else {
            debug!("Ignoring progress {} before the readout started", remaining);
            return DownloadStep::send(Vec::new());
        };

        if let Some(progress) = self.options.progress.as_mut() {
            progress(remaining, total);
        }
        if remaining == 0 {
            info!("Log download complete");
            return self.finish();
        }
        DownloadStep::send(Vec::new())
    }

    /// Confirm a completed readout page
    pub fn on_page_completed(&mut self, now: Instant) -> Vec<u8> {
        self.touch(now);
        vec![logging::MODULE, logging::READOUT_PAGE_CONFIRM]
    }

    /// Hand undeliverable data to the caller's handler, or log it
    pub fn report(&mut self, error: &BoardError, bytes: &[u8]) {
        match self.options.errors.as_mut() {
            Some(handler) => handler(error, bytes),
            None => warn!("{} ({})", error, protocol::hex(bytes)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_handshake_commands() {
        let now = Instant::now();
        let (mut download, commands) =
            Download::start(DownloadOptions::new(10), Duration::from_secs(1), now);
        assert_eq!(
            commands,
            vec![
                vec![0x0b, 0x84],
                vec![0x0b, 0x07, 0x01],
                vec![0x0b, 0x08, 0x01],
                vec![0x0b, 0x85],
            ]
        );

        let step = download.on_length(100, now);
        assert_eq!(
            step.commands,
            vec![vec![0x0b, 0x06, 100, 0, 0, 0, 10, 0, 0, 0]]
        );
        assert!(!step.finished);
        assert_eq!(download.phase(), DownloadPhase::Streaming { total: 100 });
    }

    #[test]
    fn test_options_from_config() {
        let config = DownloadConfig {
            progress_updates: 5,
            clear_after_download: true,
            log_slot_count: 8,
        };
        let options = DownloadOptions::from(&config);
        assert_eq!(options.updates, 5);
        assert!(options.clear_entries);
        assert!(options.progress.is_none());
    }

    #[test]
    fn test_empty_log_completes_immediately() {
        let now = Instant::now();
        let options = DownloadOptions::new(4).clear_entries();
        let (mut download, _) = Download::start(options, Duration::from_secs(1), now);
        let step = download.on_length(0, now);
        assert!(step.finished);
        assert_eq!(
            step.commands,
            vec![
                vec![0x0b, 0x07, 0x00],
                vec![0x0b, 0x08, 0x00],
                vec![0x0b, 0x09, 0xff, 0xff, 0xff, 0xff],
            ]
        );
    }

    #[test]
    fn test_progress_reaches_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let options = DownloadOptions::new(2).on_progress(move |remaining, total| {
            sink.lock().unwrap().push((remaining, total));
        });

        let now = Instant::now();
        let (mut download, _) = Download::start(options, Duration::from_secs(1), now);
        assert!(!download.on_progress(3, now).finished);
        download.on_length(6, now);
        assert!(!download.on_progress(3, now).finished);
        assert!(download.on_progress(0, now).finished);

        assert_eq!(*seen.lock().unwrap(), vec![(3, 6), (0, 6)]);
    }

    #[test]
    fn test_timeout_depends_on_phase() {
        let now = Instant::now();
        let (mut download, _) =
            Download::start(DownloadOptions::default(), Duration::from_millis(100), now);
        assert!(download.check_timeout(now).is_none());
        assert_eq!(
            download.check_timeout(now + Duration::from_millis(100)),
            Some(BoardError::ReadTimeout { module: 0x0b, register: 0x85 })
        );

        download.on_length(1, now + Duration::from_millis(50));
        assert!(download.check_timeout(now + Duration::from_millis(100)).is_none());
        assert_eq!(download.on_page_completed(now), vec![0x0b, 0x0e]);
    }
}
