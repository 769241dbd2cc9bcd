//! Tick to calendar time conversion
//!
//! Log entries carry a 32-bit tick count relative to the reset generation
//! they were recorded in. Each generation has one [`TimeReference`] that
//! pairs a tick with a host timestamp; converting a tick is an offset from
//! that anchor.
//!
//! # Wraparound
//!
//! When a tick arrives that is smaller than the last one seen for its
//! generation, the counter is assumed to have wrapped. The anchor is then
//! moved up to the last seen tick before converting, so the offset from the
//! anchor never spans more than one wrap.
//!
//! # Downloads
//!
//! Starting a download checkpoints the last seen ticks. While a checkpoint
//! exists, a time reply for a generation that already has an anchor does not
//! replace it; a new generation is still installed. A disconnect restores the
//! checkpoint and only a completed download clears it.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

const WRAP: i64 = 1 << 32;

/// Anchor pairing a device tick with a host timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeReference {
    pub reset_uid: u8,
    /// Anchor tick; negative once the anchor has moved past a wraparound
    pub tick: i64,
    pub timestamp: DateTime<Utc>,
}

/// Convert a signed tick count into a duration
pub fn ticks_to_duration(ticks: i64, period_ms: f64) -> Duration {
    Duration::microseconds((ticks as f64 * period_ms * 1000.0).round() as i64)
}

/// Per-generation time references and wraparound tracking
#[derive(Debug)]
pub struct TimeKeeper {
    period_ms: f64,
    references: HashMap<u8, TimeReference>,
    last_tick: HashMap<u8, u32>,
    rollback: HashMap<u8, u32>,
    checkpointed: bool,
}

impl TimeKeeper {
    /// Create a keeper for a device ticking every `period_ms`
    pub fn new(period_ms: f64) -> Self {
        Self {
            period_ms,
            references: HashMap::new(),
            last_tick: HashMap::new(),
            rollback: HashMap::new(),
            checkpointed: false,
        }
    }

    pub fn period_ms(&self) -> f64 {
        self.period_ms
    }

    /// Anchor of a generation
    pub fn reference(&self, reset_uid: u8) -> Option<&TimeReference> {
        self.references.get(&reset_uid)
    }

    /// Last tick converted for a generation
    pub fn last_tick(&self, reset_uid: u8) -> Option<u32> {
        self.last_tick.get(&reset_uid).copied()
    }

    /// Whether a download checkpoint is held
    pub fn is_checkpointed(&self) -> bool {
        self.checkpointed
    }

    /// Handle a `[tick, reset_uid]` time reply captured at `now`
    ///
    /// Returns whether the reference was installed.
    pub fn on_time_reply(&mut self, reset_uid: u8, tick: u32, now: DateTime<Utc>) -> bool {
        if self.checkpointed && self.references.contains_key(&reset_uid) {
            debug!(
                "Keeping anchor of generation {} while a download is pending",
                reset_uid
            );
            return false;
        }

        debug!("Generation {} anchored at tick {}", reset_uid, tick);
        self.references.insert(
            reset_uid,
            TimeReference {
                reset_uid,
                tick: tick as i64,
                timestamp: now,
            },
        );
        // Ticks seen before the new anchor belong to the old one
        self.last_tick.remove(&reset_uid);
        true
    }

    /// Calendar time of `tick` in generation `reset_uid`
    ///
    /// A generation without an anchor is anchored at `now`.
    pub fn convert(&mut self, reset_uid: u8, tick: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let period_ms = self.period_ms;
        let reference = self.references.entry(reset_uid).or_insert_with(|| {
            warn!(
                "No time reference for generation {}, anchoring tick {} at host time",
                reset_uid, tick
            );
            TimeReference {
                reset_uid,
                tick: tick as i64,
                timestamp: now,
            }
        });

        if let Some(&last) = self.last_tick.get(&reset_uid) {
            if tick < last {
                let delta = last as i64 - reference.tick;
                reference.timestamp += ticks_to_duration(delta, period_ms);
                reference.tick = last as i64 - WRAP;
                debug!(
                    "Generation {} wrapped after tick {}, anchor moved by {} ticks",
                    reset_uid, last, delta
                );
            }
        }
        self.last_tick.insert(reset_uid, tick);

        reference.timestamp + ticks_to_duration(tick as i64 - reference.tick, period_ms)
    }

    /// Checkpoint last seen ticks at the start of a download
    ///
    /// A checkpoint left by an interrupted download is kept.
    pub fn begin_download(&mut self) {
        if !self.checkpointed {
            self.rollback = self.last_tick.clone();
            self.checkpointed = true;
        }
    }

    /// Drop the checkpoint once a download completes
    pub fn finish_download(&mut self) {
        self.rollback.clear();
        self.checkpointed = false;
    }

    /// Restore the checkpoint after the link dropped
    pub fn on_disconnect(&mut self) {
        if self.checkpointed {
            self.last_tick = self.rollback.clone();
        }
    }

    /// Forget every generation
    pub fn reset(&mut self) {
        self.references.clear();
        self.last_tick.clear();
        self.rollback.clear();
        self.checkpointed = false;
    }
}
