//! Branch-following disassembly over a local image copy.
//!
//! Instructions are addressed by their offset into the image (an rva when the
//! image is a module copy), so every constant recovered downstream is an rva too.

use crate::insn::{Insn, InsnStream};

use iced_x86::{Decoder, DecoderError, DecoderOptions};
use std::ops::BitOr;
use thiserror::Error;
use tracing::trace;

/// Longest possible x86 instruction.
const MAX_INSN_LEN: usize = 15;

/// Upper bound on folded branches per stream, independent of `max_instructions`.
/// A stub that keeps jumping without producing code is treated as unanalyzable.
pub const MAX_FOLDED_BRANCHES: usize = 1024;

// ============================================================================
// Decode boundary
// ============================================================================

/// Why a single decode step failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("offset 0x{0:X} is outside the image")]
    OutOfBounds(u64),

    #[error("truncated instruction at 0x{0:X}")]
    Truncated(u64),

    #[error("invalid instruction at 0x{0:X}")]
    Invalid(u64),
}

/// Counters kept by a [`DecodeContext`].
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeStats {
    /// Successful decode steps.
    pub decoded: usize,
    /// Failed decode steps.
    pub failures: usize,
}

/// Decoder state for one worker.
///
/// Not shared: every thread that disassembles owns its own context.
#[derive(Default, Debug)]
pub struct DecodeContext {
    stats: DecodeStats,
}

impl DecodeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Decode one instruction at `offset` in `image`.
    pub fn decode(&mut self, image: &[u8], offset: u64) -> Result<Insn, DecodeError> {
        let result = decode_one(image, offset);
        match result {
            Ok(_) => self.stats.decoded += 1,
            Err(_) => self.stats.failures += 1,
        }
        result
    }
}

fn decode_one(image: &[u8], offset: u64) -> Result<Insn, DecodeError> {
    let start = usize::try_from(offset)
        .ok()
        .filter(|&start| start < image.len())
        .ok_or(DecodeError::OutOfBounds(offset))?;
    let window = &image[start..image.len().min(start + MAX_INSN_LEN)];

    let mut decoder = Decoder::with_ip(64, window, offset, DecoderOptions::NONE);
    let instr = decoder.decode();

    if instr.is_invalid() {
        return Err(match decoder.last_error() {
            DecoderError::NoMoreBytes => DecodeError::Truncated(offset),
            _ => DecodeError::Invalid(offset),
        });
    }

    Ok(Insn::new(instr, &window[..instr.len()]))
}

// ============================================================================
// Policy
// ============================================================================

/// Branch policy for [`disassemble`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DisasmFlags(u32);

impl DisasmFlags {
    /// Stop at every branch.
    pub const NONE: Self = Self(0);
    /// Follow `jmp imm` without emitting it.
    pub const TAKE_UNCONDITIONAL_IMM: Self = Self(1 << 0);
    /// Follow conditional jumps to their target.
    pub const TAKE_CONDITIONAL: Self = Self(1 << 1);
    /// Continue at the fall-through of conditional jumps.
    pub const SKIP_CONDITIONAL: Self = Self(1 << 2);
    /// Keep decoding after a `call`.
    pub const PASS_CALLS: Self = Self(1 << 3);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & 0xF)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for DisasmFlags {
    fn default() -> Self {
        Self::TAKE_UNCONDITIONAL_IMM
    }
}

impl BitOr for DisasmFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ============================================================================
// Disassembly
// ============================================================================

/// Disassemble from `offset`, negotiating branches according to `flags`.
///
/// Folded branches are never part of the result. Any branch that is not folded ends
/// the stream without being appended. Calls are appended and end the stream unless
/// [`DisasmFlags::PASS_CALLS`] is set; returns are appended and always end it.
///
/// Returns an empty stream when more than `max_instructions` instructions would be
/// appended, or when more than [`MAX_FOLDED_BRANCHES`] branches are folded.
/// Decode failures end the stream silently.
pub fn disassemble(
    ctx: &mut DecodeContext,
    image: &[u8],
    offset: u64,
    flags: DisasmFlags,
    max_instructions: usize,
) -> InsnStream {
    let mut insns: Vec<Insn> = Vec::new();
    let mut cursor = offset;
    let mut folded = 0usize;

    loop {
        let insn = match ctx.decode(image, cursor) {
            Ok(insn) => insn,
            Err(e) => {
                trace!("disassembly of 0x{:X} ended: {}", offset, e);
                break;
            }
        };

        if insn.is_branch() {
            let next = fold_target(&insn, flags);
            match next {
                Some(next) => {
                    folded += 1;
                    if folded > MAX_FOLDED_BRANCHES {
                        trace!("disassembly of 0x{:X} exceeded the branch budget", offset);
                        return InsnStream::empty();
                    }
                    cursor = next;
                    continue;
                }
                None => break,
            }
        }

        if insns.len() >= max_instructions {
            trace!(
                "disassembly of 0x{:X} exceeded {} instructions",
                offset,
                max_instructions
            );
            return InsnStream::empty();
        }

        let stop = insn.is_return() || (insn.is_call() && !flags.contains(DisasmFlags::PASS_CALLS));
        cursor = insn.end_address();
        insns.push(insn);

        if stop {
            break;
        }
    }

    InsnStream::new(insns)
}

/// Where decoding continues after `insn` under `flags`, if the branch is folded.
fn fold_target(insn: &Insn, flags: DisasmFlags) -> Option<u64> {
    if insn.is_uncond_jmp() {
        return flags
            .contains(DisasmFlags::TAKE_UNCONDITIONAL_IMM)
            .then(|| insn.branch_target())
            .flatten();
    }

    if insn.instruction().is_jcc_short_or_near() {
        if flags.contains(DisasmFlags::TAKE_CONDITIONAL) {
            return insn.branch_target();
        }
        if flags.contains(DisasmFlags::SKIP_CONDITIONAL) {
            return Some(insn.end_address());
        }
    }

    None
}

/// Decode every instruction starting in `[offset, end)`, advancing one byte past
/// anything that fails to decode.
pub fn disassembly_simple(ctx: &mut DecodeContext, image: &[u8], offset: u64, end: u64) -> Vec<Insn> {
    let mut insns = Vec::new();
    let mut cursor = offset;

    while cursor < end {
        match ctx.decode(image, cursor) {
            Ok(insn) => {
                cursor = insn.end_address();
                insns.push(insn);
            }
            Err(DecodeError::OutOfBounds(_)) => break,
            Err(_) => cursor += 1,
        }
    }

    insns
}
