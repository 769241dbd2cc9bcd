//! Processor config codec
//!
//! Translates logical stream operators into the bit-packed records the board's
//! data processor module accepts, and decodes records read back from the board.
//!
//! # Wire layout
//!
//! Every record starts with a one-byte discriminant (see [`kind`]). Most
//! variants follow with a control byte that packs several small fields via
//! shift/mask:
//!
//! ```text
//! bit  7 6 5 4 3 2 1 0
//!      . . . . i i o o     o = output size - 1, i = input size - 1
//! ```
//!
//! followed by little-endian numeric parameters. Count fields are stored
//! biased by -1 (a count of 1 is encoded as 0).
//!
//! # Versioning
//!
//! Several variants grew trailing fields across module revisions and firmware
//! releases, so both directions take a [`CodecContext`]. Encoding a field the
//! context cannot carry fails with [`BoardError::UnsupportedOnFirmware`]; for
//! every config a context accepts, `decode(encode(c)) == c`.
//!
//! # Example
//!
//! ```ignore
//! use sensorboard::codec::{CodecContext, ProcessorConfig};
//!
//! let ctx = CodecContext::new(FirmwareVersion::new(1, 5, 0), 2);
//! let bytes = config.encode(&ctx)?;
//! assert_eq!(ProcessorConfig::decode(&bytes, &ctx)?, config);
//! ```

pub mod params;

pub use params::{
    AccountType, AccumulatorMode, CombinerMode, ComparisonMode, ComparisonOp, DifferentialMode,
    MathsOp, PassthroughMode, PulseOutput, ThresholdMode, TimeMode,
};

use crate::error::{BoardError, Result};
use crate::producer::Attributes;
use crate::types::{FirmwareVersion, SourceKey};
use serde::{Deserialize, Serialize};

/// Module revision that added the high-pass flag and input count to Average
pub const AVERAGE_HPF_REVISION: u8 = 2;

/// Module revision that widened Delay's input-size field to 4 bits
pub const DELAY_EXPANDED_REVISION: u8 = 1;

/// Module revision that added the multi-channel input count to Maths
pub const MATHS_MULTI_CHANNEL_REVISION: u8 = 1;

/// Module revision that introduced the Fuser
pub const FUSER_REVISION: u8 = 3;

/// First firmware that accepts multi-value comparisons
pub const MULTI_COMPARISON_FIRMWARE: FirmwareVersion = FirmwareVersion::new(1, 2, 3);

/// Discriminant bytes, one per variant
pub mod kind {
    pub const PASSTHROUGH: u8 = 0x01;
    pub const ACCUMULATOR: u8 = 0x02;
    pub const AVERAGE: u8 = 0x03;
    pub const COMPARISON: u8 = 0x06;
    pub const COMBINER: u8 = 0x07;
    pub const TIME: u8 = 0x08;
    pub const MATHS: u8 = 0x09;
    pub const DELAY: u8 = 0x0a;
    pub const PULSE: u8 = 0x0b;
    pub const DIFFERENTIAL: u8 = 0x0c;
    pub const THRESHOLD: u8 = 0x0d;
    pub const BUFFER: u8 = 0x0f;
    pub const PACKER: u8 = 0x10;
    pub const ACCOUNTER: u8 = 0x11;
    pub const FUSER: u8 = 0x1b;
}

/// Firmware version and data processor revision a record is read or written for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct CodecContext {
    pub firmware: FirmwareVersion,
    pub revision: u8,
}

impl CodecContext {
    pub fn new(firmware: FirmwareVersion, revision: u8) -> Self {
        Self { firmware, revision }
    }

    /// Whether the Comparison record uses the multi-value layout
    pub fn multi_comparison(&self) -> bool {
        self.firmware >= MULTI_COMPARISON_FIRMWARE
    }

    fn unsupported(&self, feature: impl Into<String>) -> BoardError {
        BoardError::UnsupportedOnFirmware {
            feature: feature.into(),
            firmware: self.firmware.to_string(),
            revision: self.revision,
        }
    }
}

/// Comparison filter parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparison {
    /// One 32-bit reference (firmware before 1.2.3)
    Single {
        signed: bool,
        operation: ComparisonOp,
        reference: i32,
    },
    /// A list of references of `reference_size` bytes each
    Multi {
        signed: bool,
        operation: ComparisonOp,
        mode: ComparisonMode,
        reference_size: u8,
        references: Vec<i32>,
    },
}

/// Logical parameters of one on-board processor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessorConfig {
    Passthrough {
        mode: PassthroughMode,
        value: u16,
    },
    Accumulator {
        mode: AccumulatorMode,
        output_size: u8,
        input_size: u8,
    },
    Average {
        output_size: u8,
        input_size: u8,
        input_count: u8,
        signed: bool,
        high_pass: bool,
        samples: u8,
    },
    Comparison(Comparison),
    Combiner {
        mode: CombinerMode,
        output_size: u8,
        input_size: u8,
        input_count: u8,
        signed: bool,
    },
    Time {
        size: u8,
        mode: TimeMode,
        period_ms: u32,
    },
    Maths {
        output_size: u8,
        input_size: u8,
        input_count: u8,
        signed: bool,
        operation: MathsOp,
        rhs: i32,
    },
    Delay {
        size: u8,
        samples: u8,
    },
    Pulse {
        size: u8,
        output: PulseOutput,
        threshold: i32,
        width: u16,
    },
    Differential {
        size: u8,
        signed: bool,
        mode: DifferentialMode,
        threshold: u32,
    },
    Threshold {
        size: u8,
        signed: bool,
        mode: ThresholdMode,
        boundary: i32,
        hysteresis: u16,
    },
    Buffer {
        size: u8,
    },
    Packer {
        size: u8,
        count: u8,
    },
    Accounter {
        size: u8,
        account: AccountType,
        prescale: u8,
    },
    /// Combines its input with the buffered outputs of other processors
    Fuser {
        inputs: Vec<u8>,
    },
}

// ==================== Field helpers ====================

/// Encode a 1-indexed count/size as its 0-indexed wire value
fn biased(field: &str, value: u8, max: u8) -> Result<u8> {
    if value == 0 || value > max {
        return Err(BoardError::InvalidParameter(format!(
            "{} must be in 1..={}, got {}",
            field, max, value
        )));
    }
    Ok(value - 1)
}

fn require_len(bytes: &[u8], kind: u8, expected: usize) -> Result<()> {
    if bytes.len() < expected {
        return Err(BoardError::TruncatedConfig {
            kind,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    read_u32(bytes, at) as i32
}

fn invalid_bits(kind: u8, field: &str, bits: u8) -> BoardError {
    BoardError::InvalidParameter(format!(
        "config 0x{:02x} has unknown {} value {}",
        kind, field, bits
    ))
}

/// Range a reference of `size` bytes can carry
fn reference_range(size: u8, signed: bool) -> (i64, i64) {
    let bits = size as u32 * 8;
    if signed {
        (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
    } else {
        (0, ((1i64 << bits) - 1).min(i32::MAX as i64))
    }
}

fn write_reference(out: &mut Vec<u8>, value: i32, size: u8, signed: bool) -> Result<()> {
    let (min, max) = reference_range(size, signed);
    if (value as i64) < min || (value as i64) > max {
        return Err(BoardError::InvalidParameter(format!(
            "reference {} does not fit in {} {} bytes",
            value,
            size,
            if signed { "signed" } else { "unsigned" }
        )));
    }
    out.extend_from_slice(&value.to_le_bytes()[..size as usize]);
    Ok(())
}

fn read_reference(bytes: &[u8], size: u8, signed: bool) -> i32 {
    let mut raw = [0u8; 4];
    raw[..size as usize].copy_from_slice(&bytes[..size as usize]);
    let value = u32::from_le_bytes(raw);
    if signed && size < 4 {
        let shift = 32 - size as u32 * 8;
        ((value << shift) as i32) >> shift
    } else {
        value as i32
    }
}

/// Flatten repeated channel groups into one size per channel
fn flat_sizes(attributes: &Attributes) -> Vec<u8> {
    let mut sizes = Vec::with_capacity(attributes.channels() * attributes.copies as usize);
    for _ in 0..attributes.copies {
        sizes.extend_from_slice(&attributes.sizes);
    }
    sizes
}

impl ProcessorConfig {
    /// Discriminant byte of this variant
    pub fn kind(&self) -> u8 {
        match self {
            ProcessorConfig::Passthrough { .. } => kind::PASSTHROUGH,
            ProcessorConfig::Accumulator { .. } => kind::ACCUMULATOR,
            ProcessorConfig::Average { .. } => kind::AVERAGE,
            ProcessorConfig::Comparison(_) => kind::COMPARISON,
            ProcessorConfig::Combiner { .. } => kind::COMBINER,
            ProcessorConfig::Time { .. } => kind::TIME,
            ProcessorConfig::Maths { .. } => kind::MATHS,
            ProcessorConfig::Delay { .. } => kind::DELAY,
            ProcessorConfig::Pulse { .. } => kind::PULSE,
            ProcessorConfig::Differential { .. } => kind::DIFFERENTIAL,
            ProcessorConfig::Threshold { .. } => kind::THRESHOLD,
            ProcessorConfig::Buffer { .. } => kind::BUFFER,
            ProcessorConfig::Packer { .. } => kind::PACKER,
            ProcessorConfig::Accounter { .. } => kind::ACCOUNTER,
            ProcessorConfig::Fuser { .. } => kind::FUSER,
        }
    }

    /// Short name used in display URIs
    pub fn kind_name(&self) -> &'static str {
        match self {
            ProcessorConfig::Passthrough { .. } => "passthrough",
            ProcessorConfig::Accumulator {
                mode: AccumulatorMode::Accumulate,
                ..
            } => "accumulate",
            ProcessorConfig::Accumulator {
                mode: AccumulatorMode::Count,
                ..
            } => "count",
            ProcessorConfig::Average {
                high_pass: true, ..
            } => "high-pass",
            ProcessorConfig::Average { .. } => "low-pass",
            ProcessorConfig::Comparison(_) => "comparison",
            ProcessorConfig::Combiner {
                mode: CombinerMode::Rms,
                ..
            } => "rms",
            ProcessorConfig::Combiner {
                mode: CombinerMode::Rss,
                ..
            } => "rss",
            ProcessorConfig::Time { .. } => "time",
            ProcessorConfig::Maths { .. } => "math",
            ProcessorConfig::Delay { .. } => "delay",
            ProcessorConfig::Pulse { .. } => "pulse",
            ProcessorConfig::Differential { .. } => "differential",
            ProcessorConfig::Threshold { .. } => "threshold",
            ProcessorConfig::Buffer { .. } => "buffer",
            ProcessorConfig::Packer { .. } => "packer",
            ProcessorConfig::Accounter { .. } => "account",
            ProcessorConfig::Fuser { .. } => "fuser",
        }
    }

    /// Stable diagnostic key for a processor with board id `id`
    pub fn uri(&self, id: u8) -> String {
        format!("{}?id={}", self.kind_name(), id)
    }

    /// Encode into the wire record for the given context
    pub fn encode(&self, ctx: &CodecContext) -> Result<Vec<u8>> {
        let mut out = vec![self.kind()];

        match self {
            ProcessorConfig::Passthrough { mode, value } => {
                out.push(mode.bits() & 0x7);
                out.extend_from_slice(&value.to_le_bytes());
            }
            ProcessorConfig::Accumulator {
                mode,
                output_size,
                input_size,
            } => {
                let o = biased("output size", *output_size, 4)?;
                let i = biased("input size", *input_size, 4)?;
                out.push(o | (i << 2) | (mode.bits() << 4));
            }
            ProcessorConfig::Average {
                output_size,
                input_size,
                input_count,
                signed,
                high_pass,
                samples,
            } => {
                let o = biased("output size", *output_size, 4)?;
                let i = biased("input size", *input_size, 4)?;
                let count = biased("input count", *input_count, 8)?;
                let enhanced = ctx.revision >= AVERAGE_HPF_REVISION;
                if !enhanced && (*high_pass || *input_count != 1) {
                    return Err(ctx.unsupported("high-pass / multi-channel average"));
                }
                out.push(o | (i << 2) | ((*signed as u8) << 4) | ((*high_pass as u8) << 5));
                out.push(*samples);
                if enhanced {
                    out.push(count);
                }
            }
            ProcessorConfig::Comparison(comparison) => {
                encode_comparison(&mut out, comparison, ctx)?;
            }
            ProcessorConfig::Combiner {
                mode,
                output_size,
                input_size,
                input_count,
                signed,
            } => {
                let o = biased("output size", *output_size, 4)?;
                let i = biased("input size", *input_size, 4)?;
                let count = biased("input count", *input_count, 8)?;
                out.push(o | (i << 2) | (count << 4) | ((*signed as u8) << 7));
                out.push(mode.bits());
            }
            ProcessorConfig::Time {
                size,
                mode,
                period_ms,
            } => {
                let s = biased("size", *size, 8)?;
                out.push(s | (mode.bits() << 3));
                out.extend_from_slice(&period_ms.to_le_bytes());
            }
            ProcessorConfig::Maths {
                output_size,
                input_size,
                input_count,
                signed,
                operation,
                rhs,
            } => {
                let o = biased("output size", *output_size, 4)?;
                let i = biased("input size", *input_size, 4)?;
                let count = biased("input count", *input_count, 8)?;
                let multi = ctx.revision >= MATHS_MULTI_CHANNEL_REVISION;
                if !multi && *input_count != 1 {
                    return Err(ctx.unsupported("multi-channel math"));
                }
                out.push(o | (i << 2) | ((*signed as u8) << 4));
                out.push(operation.bits());
                out.extend_from_slice(&rhs.to_le_bytes());
                if multi {
                    out.push(count);
                }
            }
            ProcessorConfig::Delay { size, samples } => {
                let max = if ctx.revision >= DELAY_EXPANDED_REVISION {
                    16
                } else {
                    4
                };
                if *size > max {
                    return Err(ctx.unsupported(format!("delay of {} byte inputs", size)));
                }
                out.push(biased("size", *size, max)?);
                out.push(*samples);
            }
            ProcessorConfig::Pulse {
                size,
                output,
                threshold,
                width,
            } => {
                out.push(biased("size", *size, 4)?);
                out.push(0);
                out.push(output.bits());
                out.extend_from_slice(&threshold.to_le_bytes());
                out.extend_from_slice(&width.to_le_bytes());
            }
            ProcessorConfig::Differential {
                size,
                signed,
                mode,
                threshold,
            } => {
                let s = biased("size", *size, 4)?;
                out.push(s | ((*signed as u8) << 2) | (mode.bits() << 3));
                out.extend_from_slice(&threshold.to_le_bytes());
            }
            ProcessorConfig::Threshold {
                size,
                signed,
                mode,
                boundary,
                hysteresis,
            } => {
                let s = biased("size", *size, 4)?;
                out.push(s | ((*signed as u8) << 2) | (mode.bits() << 3));
                out.extend_from_slice(&boundary.to_le_bytes());
                out.extend_from_slice(&hysteresis.to_le_bytes());
            }
            ProcessorConfig::Buffer { size } => {
                out.push(biased("size", *size, 32)?);
            }
            ProcessorConfig::Packer { size, count } => {
                out.push(biased("size", *size, 32)?);
                out.push(biased("count", *count, 32)?);
            }
            ProcessorConfig::Accounter {
                size,
                account,
                prescale,
            } => {
                let s = biased("size", *size, 4)?;
                out.push(s | (account.bits() << 4));
                out.push(*prescale);
            }
            ProcessorConfig::Fuser { inputs } => {
                if ctx.revision < FUSER_REVISION {
                    return Err(ctx.unsupported("fuser"));
                }
                let count = u8::try_from(inputs.len()).unwrap_or(u8::MAX);
                out.push(biased("fuser input count", count, 32)?);
                out.extend_from_slice(inputs);
            }
        }

        Ok(out)
    }

    /// Decode a wire record read back from the board
    pub fn decode(bytes: &[u8], ctx: &CodecContext) -> Result<ProcessorConfig> {
        let Some(&kind_byte) = bytes.first() else {
            return Err(BoardError::TruncatedConfig {
                kind: 0,
                expected: 1,
                actual: 0,
            });
        };

        let config = match kind_byte {
            kind::PASSTHROUGH => {
                require_len(bytes, kind_byte, 4)?;
                let mode = PassthroughMode::from_bits(bytes[1] & 0x7)
                    .ok_or_else(|| invalid_bits(kind_byte, "mode", bytes[1] & 0x7))?;
                ProcessorConfig::Passthrough {
                    mode,
                    value: read_u16(bytes, 2),
                }
            }
            kind::ACCUMULATOR => {
                require_len(bytes, kind_byte, 2)?;
                let ctrl = bytes[1];
                let mode = AccumulatorMode::from_bits((ctrl >> 4) & 0x7)
                    .ok_or_else(|| invalid_bits(kind_byte, "mode", (ctrl >> 4) & 0x7))?;
                ProcessorConfig::Accumulator {
                    mode,
                    output_size: (ctrl & 0x3) + 1,
                    input_size: ((ctrl >> 2) & 0x3) + 1,
                }
            }
            kind::AVERAGE => {
                let enhanced = ctx.revision >= AVERAGE_HPF_REVISION;
                require_len(bytes, kind_byte, if enhanced { 4 } else { 3 })?;
                let ctrl = bytes[1];
                ProcessorConfig::Average {
                    output_size: (ctrl & 0x3) + 1,
                    input_size: ((ctrl >> 2) & 0x3) + 1,
                    input_count: if enhanced { bytes[3] + 1 } else { 1 },
                    signed: (ctrl >> 4) & 0x1 == 1,
                    high_pass: enhanced && (ctrl >> 5) & 0x1 == 1,
                    samples: bytes[2],
                }
            }
            kind::COMPARISON => ProcessorConfig::Comparison(decode_comparison(bytes, ctx)?),
            kind::COMBINER => {
                require_len(bytes, kind_byte, 3)?;
                let ctrl = bytes[1];
                let mode = CombinerMode::from_bits(bytes[2])
                    .ok_or_else(|| invalid_bits(kind_byte, "mode", bytes[2]))?;
                ProcessorConfig::Combiner {
                    mode,
                    output_size: (ctrl & 0x3) + 1,
                    input_size: ((ctrl >> 2) & 0x3) + 1,
                    input_count: ((ctrl >> 4) & 0x7) + 1,
                    signed: (ctrl >> 7) == 1,
                }
            }
            kind::TIME => {
                require_len(bytes, kind_byte, 6)?;
                let ctrl = bytes[1];
                let mode = TimeMode::from_bits((ctrl >> 3) & 0x7)
                    .ok_or_else(|| invalid_bits(kind_byte, "mode", (ctrl >> 3) & 0x7))?;
                ProcessorConfig::Time {
                    size: (ctrl & 0x7) + 1,
                    mode,
                    period_ms: read_u32(bytes, 2),
                }
            }
            kind::MATHS => {
                let multi = ctx.revision >= MATHS_MULTI_CHANNEL_REVISION;
                require_len(bytes, kind_byte, if multi { 8 } else { 7 })?;
                let ctrl = bytes[1];
                let operation = MathsOp::from_bits(bytes[2])
                    .ok_or_else(|| invalid_bits(kind_byte, "operation", bytes[2]))?;
                ProcessorConfig::Maths {
                    output_size: (ctrl & 0x3) + 1,
                    input_size: ((ctrl >> 2) & 0x3) + 1,
                    input_count: if multi { bytes[7] + 1 } else { 1 },
                    signed: (ctrl >> 4) & 0x1 == 1,
                    operation,
                    rhs: read_i32(bytes, 3),
                }
            }
            kind::DELAY => {
                require_len(bytes, kind_byte, 3)?;
                let mask = if ctx.revision >= DELAY_EXPANDED_REVISION {
                    0xf
                } else {
                    0x3
                };
                ProcessorConfig::Delay {
                    size: (bytes[1] & mask) + 1,
                    samples: bytes[2],
                }
            }
            kind::PULSE => {
                require_len(bytes, kind_byte, 10)?;
                let output = PulseOutput::from_bits(bytes[3])
                    .ok_or_else(|| invalid_bits(kind_byte, "output", bytes[3]))?;
                ProcessorConfig::Pulse {
                    size: (bytes[1] & 0x3) + 1,
                    output,
                    threshold: read_i32(bytes, 4),
                    width: read_u16(bytes, 8),
                }
            }
            kind::DIFFERENTIAL => {
                require_len(bytes, kind_byte, 6)?;
                let ctrl = bytes[1];
                let mode = DifferentialMode::from_bits((ctrl >> 3) & 0x7)
                    .ok_or_else(|| invalid_bits(kind_byte, "mode", (ctrl >> 3) & 0x7))?;
                ProcessorConfig::Differential {
                    size: (ctrl & 0x3) + 1,
                    signed: (ctrl >> 2) & 0x1 == 1,
                    mode,
                    threshold: read_u32(bytes, 2),
                }
            }
            kind::THRESHOLD => {
                require_len(bytes, kind_byte, 8)?;
                let ctrl = bytes[1];
                let mode = ThresholdMode::from_bits((ctrl >> 3) & 0x7)
                    .ok_or_else(|| invalid_bits(kind_byte, "mode", (ctrl >> 3) & 0x7))?;
                ProcessorConfig::Threshold {
                    size: (ctrl & 0x3) + 1,
                    signed: (ctrl >> 2) & 0x1 == 1,
                    mode,
                    boundary: read_i32(bytes, 2),
                    hysteresis: read_u16(bytes, 6),
                }
            }
            kind::BUFFER => {
                require_len(bytes, kind_byte, 2)?;
                ProcessorConfig::Buffer {
                    size: (bytes[1] & 0x1f) + 1,
                }
            }
            kind::PACKER => {
                require_len(bytes, kind_byte, 3)?;
                ProcessorConfig::Packer {
                    size: (bytes[1] & 0x1f) + 1,
                    count: (bytes[2] & 0x1f) + 1,
                }
            }
            kind::ACCOUNTER => {
                require_len(bytes, kind_byte, 3)?;
                let ctrl = bytes[1];
                let account = AccountType::from_bits(ctrl >> 4)
                    .ok_or_else(|| invalid_bits(kind_byte, "account type", ctrl >> 4))?;
                ProcessorConfig::Accounter {
                    size: (ctrl & 0x3) + 1,
                    account,
                    prescale: bytes[2],
                }
            }
            kind::FUSER => {
                require_len(bytes, kind_byte, 2)?;
                let count = (bytes[1] & 0x1f) as usize + 1;
                require_len(bytes, kind_byte, 2 + count)?;
                ProcessorConfig::Fuser {
                    inputs: bytes[2..2 + count].to_vec(),
                }
            }
            other => return Err(BoardError::UnknownProcessorKind(other)),
        };

        Ok(config)
    }

    /// Shape of the processor's output given the shape of its input
    ///
    /// `fused` holds the output shapes of the processors a Fuser combines,
    /// in the order of its inputs; other variants ignore it.
    pub fn output_attributes(&self, input: &Attributes, fused: &[Attributes]) -> Attributes {
        let passthrough = input.clone().with_offset(0);

        match self {
            ProcessorConfig::Passthrough { .. }
            | ProcessorConfig::Time { .. }
            | ProcessorConfig::Delay { .. }
            | ProcessorConfig::Buffer { .. } => passthrough,
            ProcessorConfig::Accumulator {
                mode, output_size, ..
            } => Attributes::new(
                vec![*output_size],
                *mode == AccumulatorMode::Accumulate && input.signed,
            ),
            ProcessorConfig::Average {
                output_size,
                input_count,
                signed,
                ..
            }
            | ProcessorConfig::Maths {
                output_size,
                input_count,
                signed,
                ..
            } => Attributes::uniform(*input_count as usize, *output_size, *signed),
            ProcessorConfig::Comparison(Comparison::Single { signed, .. }) => {
                passthrough.with_signed(*signed)
            }
            ProcessorConfig::Comparison(Comparison::Multi { signed, mode, .. }) => match mode {
                ComparisonMode::Absolute | ComparisonMode::Reference => {
                    passthrough.with_signed(*signed)
                }
                ComparisonMode::Zone | ComparisonMode::PassFail => {
                    Attributes::new(vec![1], false)
                }
            },
            ProcessorConfig::Combiner { output_size, .. } => {
                Attributes::new(vec![*output_size], false)
            }
            ProcessorConfig::Pulse { size, output, .. } => match output {
                PulseOutput::Width => Attributes::new(vec![2], false),
                PulseOutput::Area => Attributes::new(vec![4], input.signed),
                PulseOutput::Peak => Attributes::new(vec![*size], input.signed),
                PulseOutput::OnDetection => Attributes::new(vec![1], false),
            },
            ProcessorConfig::Differential { size, signed, mode, .. } => match mode {
                DifferentialMode::Binary => Attributes::new(vec![1], true),
                _ => Attributes::new(vec![*size], *signed),
            },
            ProcessorConfig::Threshold { size, signed, mode, .. } => match mode {
                ThresholdMode::Binary => Attributes::new(vec![1], true),
                ThresholdMode::Absolute => Attributes::new(vec![*size], *signed),
            },
            ProcessorConfig::Packer { count, .. } => passthrough.with_copies(*count),
            ProcessorConfig::Accounter { size, .. } => {
                let mut sizes = vec![*size];
                sizes.extend(flat_sizes(input));
                Attributes::new(sizes, input.signed)
            }
            ProcessorConfig::Fuser { .. } => {
                let mut sizes = flat_sizes(input);
                for other in fused {
                    sizes.extend(flat_sizes(other));
                }
                Attributes::new(sizes, input.signed)
            }
        }
    }
}

fn encode_comparison(out: &mut Vec<u8>, comparison: &Comparison, ctx: &CodecContext) -> Result<()> {
    match comparison {
        Comparison::Single {
            signed,
            operation,
            reference,
        } => {
            if ctx.multi_comparison() {
                return Err(ctx.unsupported("single-value comparison layout"));
            }
            out.push(*signed as u8);
            out.push(operation.bits());
            out.push(0);
            out.extend_from_slice(&reference.to_le_bytes());
        }
        Comparison::Multi {
            signed,
            operation,
            mode,
            reference_size,
            references,
        } => {
            if !ctx.multi_comparison() {
                return Err(ctx.unsupported("multi-value comparison"));
            }
            if references.is_empty() {
                return Err(BoardError::InvalidParameter(
                    "comparison needs at least one reference".to_string(),
                ));
            }
            let size = biased("reference size", *reference_size, 4)?;
            out.push((*signed as u8) | (size << 1) | (operation.bits() << 3) | (mode.bits() << 6));
            for reference in references {
                write_reference(out, *reference, *reference_size, *signed)?;
            }
        }
    }
    Ok(())
}

fn decode_comparison(bytes: &[u8], ctx: &CodecContext) -> Result<Comparison> {
    if !ctx.multi_comparison() {
        require_len(bytes, kind::COMPARISON, 8)?;
        let operation = ComparisonOp::from_bits(bytes[2])
            .ok_or_else(|| invalid_bits(kind::COMPARISON, "operation", bytes[2]))?;
        return Ok(Comparison::Single {
            signed: bytes[1] == 1,
            operation,
            reference: read_i32(bytes, 4),
        });
    }

    require_len(bytes, kind::COMPARISON, 2)?;
    let ctrl = bytes[1];
    let signed = ctrl & 0x1 == 1;
    let reference_size = ((ctrl >> 1) & 0x3) + 1;
    let operation = ComparisonOp::from_bits((ctrl >> 3) & 0x7)
        .ok_or_else(|| invalid_bits(kind::COMPARISON, "operation", (ctrl >> 3) & 0x7))?;
    let mode = ComparisonMode::from_bits(ctrl >> 6)
        .ok_or_else(|| invalid_bits(kind::COMPARISON, "mode", ctrl >> 6))?;

    let payload = &bytes[2..];
    let size = reference_size as usize;
    if payload.is_empty() || payload.len() % size != 0 {
        let whole = payload.len().div_ceil(size).max(1);
        return Err(BoardError::TruncatedConfig {
            kind: kind::COMPARISON,
            expected: 2 + whole * size,
            actual: bytes.len(),
        });
    }

    let references = payload
        .chunks(size)
        .map(|chunk| read_reference(chunk, reference_size, signed))
        .collect();

    Ok(Comparison::Multi {
        signed,
        operation,
        mode,
        reference_size,
        references,
    })
}

/// A processor record as read back from the board
///
/// The parameter register of a processor replies with the stream feeding it
/// followed by its config record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorRecord {
    pub source: SourceKey,
    pub source_offset: u8,
    pub source_length: usize,
    pub config: ProcessorConfig,
}

impl ProcessorRecord {
    /// Decode `[module, register, data_id, source byte, config...]`
    pub fn decode(bytes: &[u8], ctx: &CodecContext) -> Result<ProcessorRecord> {
        if bytes.len() < 5 {
            return Err(BoardError::TruncatedConfig {
                kind: bytes.get(4).copied().unwrap_or(0),
                expected: 5,
                actual: bytes.len(),
            });
        }
        let (source_offset, source_length) = Attributes::unpack_source_config(bytes[3]);
        Ok(ProcessorRecord {
            source: SourceKey {
                module: bytes[0],
                register: bytes[1],
                data_id: bytes[2],
            },
            source_offset,
            source_length,
            config: ProcessorConfig::decode(&bytes[4..], ctx)?,
        })
    }
}
