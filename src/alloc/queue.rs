//! Global creation queue
//!
//! The board answers every identifier-yielding command with
//! `[module, register, id]` and nothing else, so a reply can only be matched
//! to a request by arrival order. The queue therefore keeps at most one
//! creation in flight for the whole connection.

use super::builder::Continuation;
use crate::producer::RouteId;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// One unit of remote work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCreation {
    /// Identifier-yielding command
    pub command: Vec<u8>,
    /// Commands written right after `command`, before the reply arrives
    pub follow_up: Vec<Vec<u8>>,
    /// `(module, register)` the identifier reply is sent on
    pub reply: (u8, u8),
    /// Route the creation belongs to
    pub route: RouteId,
    /// What to do with the identifier
    pub continuation: Continuation,
}

#[derive(Debug)]
struct InFlight {
    creation: PendingCreation,
    deadline: Instant,
}

/// FIFO of pending creations with a single in-flight slot
#[derive(Debug)]
pub struct CreationQueue {
    pending: VecDeque<PendingCreation>,
    in_flight: Option<InFlight>,
    timeout: Duration,
}

impl CreationQueue {
    /// Create an empty queue whose creations time out after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: None,
            timeout,
        }
    }

    /// Append a creation to the back of the queue
    pub fn push(&mut self, creation: PendingCreation) {
        self.pending.push_back(creation);
    }

    /// Move the oldest pending creation in flight
    ///
    /// Returns `None` while another creation is still waiting for its reply.
    pub fn dispatch(&mut self, now: Instant) -> Option<&PendingCreation> {
        if self.in_flight.is_some() {
            return None;
        }
        let creation = self.pending.pop_front()?;
        self.in_flight = Some(InFlight {
            creation,
            deadline: now + self.timeout,
        });
        self.in_flight.as_ref().map(|f| &f.creation)
    }

    /// Whether a reply on `(module, register)` would resolve the in-flight creation
    pub fn awaiting(&self, module: u8, register: u8) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|f| f.creation.reply == (module, register))
    }

    /// Take the in-flight creation if the reply matches it
    pub fn resolve(&mut self, module: u8, register: u8) -> Option<PendingCreation> {
        if !self.awaiting(module, register) {
            return None;
        }
        self.in_flight.take().map(|f| f.creation)
    }

    /// Take the in-flight creation if its deadline has passed
    pub fn expire(&mut self, now: Instant) -> Option<PendingCreation> {
        match &self.in_flight {
            Some(f) if now >= f.deadline => self.in_flight.take().map(|f| f.creation),
            _ => None,
        }
    }

    /// Drop the in-flight and pending creations of one route
    pub fn cancel_route(&mut self, route: RouteId) {
        if self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.creation.route == route)
        {
            self.in_flight = None;
        }
        self.pending.retain(|c| c.route != route);
    }

    /// Drop everything
    pub fn clear(&mut self) -> Vec<PendingCreation> {
        let mut dropped: Vec<PendingCreation> =
            self.in_flight.take().map(|f| f.creation).into_iter().collect();
        dropped.extend(self.pending.drain(..));
        dropped
    }

    /// Earliest deadline the owner must check
    pub fn deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(|f| f.deadline)
    }

    /// Whether nothing is in flight or pending
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    /// Number of creations not yet resolved
    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }

    /// Whether the queue holds nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
