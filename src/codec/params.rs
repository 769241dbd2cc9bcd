//! Sub-mode enums and per-variant parameter structs for processor configs.
//!
//! Every enum here is stored in a few bits of a config control byte; `bits()`
//! gives the wire value and `from_bits()` maps it back.

use serde::{Deserialize, Serialize};

/// Passthrough gate behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PassthroughMode {
    /// Let every sample through
    All = 0,
    /// Let samples through while the value is non-zero
    Conditional = 1,
    /// Let `value` samples through, then close
    Count = 2,
}

impl PassthroughMode {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::All),
            1 => Some(Self::Conditional),
            2 => Some(Self::Count),
            _ => None,
        }
    }
}

/// Accumulator behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AccumulatorMode {
    /// Running sum of the input
    Accumulate = 0,
    /// Number of samples seen
    Count = 1,
}

impl AccumulatorMode {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Accumulate),
            1 => Some(Self::Count),
            _ => None,
        }
    }
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ComparisonOp {
    Eq = 0,
    Neq = 1,
    Lt = 2,
    Lte = 3,
    Gt = 4,
    Gte = 5,
}

impl ComparisonOp {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Eq),
            1 => Some(Self::Neq),
            2 => Some(Self::Lt),
            3 => Some(Self::Lte),
            4 => Some(Self::Gt),
            5 => Some(Self::Gte),
            _ => None,
        }
    }
}

/// Output of a multi-value comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ComparisonMode {
    /// Pass the input when any reference satisfies the operator
    Absolute = 0,
    /// Pass the reference that satisfied the operator
    Reference = 1,
    /// Output the index of the first satisfied reference
    Zone = 2,
    /// Output 0 or 1
    PassFail = 3,
}

impl ComparisonMode {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Absolute),
            1 => Some(Self::Reference),
            2 => Some(Self::Zone),
            3 => Some(Self::PassFail),
            _ => None,
        }
    }
}

/// Root-mean/sum-square combiner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CombinerMode {
    Rms = 0,
    Rss = 1,
}

impl CombinerMode {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Rms),
            1 => Some(Self::Rss),
            _ => None,
        }
    }
}

/// Time limiter output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TimeMode {
    /// Pass the sample itself
    Absolute = 0,
    /// Pass the difference from the previously passed sample
    Differential = 1,
}

impl TimeMode {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Absolute),
            1 => Some(Self::Differential),
            _ => None,
        }
    }
}

/// Arithmetic operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MathsOp {
    Add = 1,
    Multiply = 2,
    Divide = 3,
    Modulus = 4,
    Exponent = 5,
    Sqrt = 6,
    LeftShift = 7,
    RightShift = 8,
    Subtract = 9,
    AbsValue = 10,
    Constant = 11,
}

impl MathsOp {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(Self::Add),
            2 => Some(Self::Multiply),
            3 => Some(Self::Divide),
            4 => Some(Self::Modulus),
            5 => Some(Self::Exponent),
            6 => Some(Self::Sqrt),
            7 => Some(Self::LeftShift),
            8 => Some(Self::RightShift),
            9 => Some(Self::Subtract),
            10 => Some(Self::AbsValue),
            11 => Some(Self::Constant),
            _ => None,
        }
    }
}

/// What a pulse detector reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PulseOutput {
    /// Number of samples in the pulse
    Width = 0,
    /// Sum of the samples in the pulse
    Area = 1,
    /// Highest sample in the pulse
    Peak = 2,
    /// A single byte as soon as a pulse is detected
    OnDetection = 3,
}

impl PulseOutput {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Width),
            1 => Some(Self::Area),
            2 => Some(Self::Peak),
            3 => Some(Self::OnDetection),
            _ => None,
        }
    }
}

/// Differential filter output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DifferentialMode {
    Absolute = 0,
    Differential = 1,
    /// 1 or -1 depending on direction
    Binary = 2,
}

impl DifferentialMode {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Absolute),
            1 => Some(Self::Differential),
            2 => Some(Self::Binary),
            _ => None,
        }
    }
}

/// Threshold detector output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ThresholdMode {
    Absolute = 0,
    /// 1 when crossing upwards, -1 when crossing downwards
    Binary = 1,
}

impl ThresholdMode {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Absolute),
            1 => Some(Self::Binary),
            _ => None,
        }
    }
}

/// Information an accounter prepends to each sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AccountType {
    /// Running sample count
    Count = 1,
    /// Board tick at the time the sample was produced
    Time = 3,
}

impl AccountType {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(Self::Count),
            3 => Some(Self::Time),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bits_round_trip() {
        for bits in 0..=15u8 {
            if let Some(op) = MathsOp::from_bits(bits) {
                assert_eq!(op.bits(), bits);
            }
            if let Some(mode) = ComparisonMode::from_bits(bits) {
                assert_eq!(mode.bits(), bits);
            }
            if let Some(kind) = AccountType::from_bits(bits) {
                assert_eq!(kind.bits(), bits);
            }
        }
    }

    #[test]
    fn test_unknown_bits() {
        assert_eq!(MathsOp::from_bits(0), None);
        assert_eq!(ComparisonOp::from_bits(6), None);
        assert_eq!(AccountType::from_bits(2), None);
    }
}
