//! Identity types for producers, routes and loggers.
//!
//! All IDs are newtypes over `u32`. `ProducerId` is a direct index into
//! `ProducerArena::slots`; route and logger ids are monotonically issued keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index into `ProducerArena::slots`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProducerId(pub u32);

impl ProducerId {
    pub const INVALID: ProducerId = ProducerId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "ProducerId(INVALID)")
        } else {
            write!(f, "ProducerId({})", self.0)
        }
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Key of a route request, issued in submission order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteId(pub u32);

impl fmt::Debug for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouteId({})", self.0)
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Key of a host-side data logger.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoggerId(pub u32);

impl fmt::Debug for LoggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoggerId({})", self.0)
    }
}

impl fmt::Display for LoggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_id() {
        let id = ProducerId(42);
        assert!(id.is_valid());
        assert_eq!(id.index(), 42);
        assert!(!ProducerId::INVALID.is_valid());
        assert_eq!(format!("{:?}", ProducerId::INVALID), "ProducerId(INVALID)");
    }

    #[test]
    fn test_route_and_logger_ids_order() {
        assert!(RouteId(1) < RouteId(2));
        assert_eq!(LoggerId(3).to_string(), "LoggerId(3)");
    }
}
