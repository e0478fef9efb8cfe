//! Decoded instructions and replayable instruction streams.
//!
//! An [`Insn`] is a self-contained snapshot of one decoded x86-64 instruction: the
//! decoded form plus the raw bytes it came from. An [`InsnStream`] is a window over a
//! shared, immutable arena of instructions. Cloning a stream or slicing it never copies
//! instructions, it only creates a new `[begin, end)` view with its own cursor.

use iced_x86::{
    Code, FlowControl, Instruction, InstructionInfoFactory, Mnemonic, OpAccess, OpKind, Register,
};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

// ============================================================================
// Instruction Model
// ============================================================================

/// One decoded instruction with its raw bytes.
#[derive(Clone, Debug)]
pub struct Insn {
    instruction: Instruction,
    bytes: Box<[u8]>,
}

impl Insn {
    /// Wrap a decoded instruction. `bytes` must be exactly the instruction's encoding.
    pub fn new(instruction: Instruction, bytes: &[u8]) -> Self {
        Self {
            instruction,
            bytes: bytes.into(),
        }
    }

    /// Address the instruction was decoded at.
    #[inline]
    pub fn address(&self) -> u64 {
        self.instruction.ip()
    }

    /// Address of the following instruction.
    #[inline]
    pub fn end_address(&self) -> u64 {
        self.instruction.next_ip()
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; decoded instructions are at least one byte.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Raw instruction bytes.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The underlying decoded instruction.
    #[inline]
    pub fn instruction(&self) -> &Instruction {
        &self.instruction
    }

    #[inline]
    pub fn code(&self) -> Code {
        self.instruction.code()
    }

    #[inline]
    pub fn mnemonic(&self) -> Mnemonic {
        self.instruction.mnemonic()
    }

    #[inline]
    pub fn flow_control(&self) -> FlowControl {
        self.instruction.flow_control()
    }

    /// Any kind of jump: unconditional, conditional or indirect (loops and jrcxz included).
    pub fn is_branch(&self) -> bool {
        matches!(
            self.flow_control(),
            FlowControl::UnconditionalBranch
                | FlowControl::ConditionalBranch
                | FlowControl::IndirectBranch
        )
    }

    /// `jmp`, direct or indirect.
    pub fn is_uncond_jmp(&self) -> bool {
        self.mnemonic() == Mnemonic::Jmp
    }

    pub fn is_cond_jump(&self) -> bool {
        self.flow_control() == FlowControl::ConditionalBranch
    }

    pub fn is_call(&self) -> bool {
        matches!(
            self.flow_control(),
            FlowControl::Call | FlowControl::IndirectCall
        )
    }

    pub fn is_return(&self) -> bool {
        self.flow_control() == FlowControl::Return
    }

    /// `E8 rel32`, the only call form the packer emits at obfuscated call sites.
    pub fn is_relative_call(&self) -> bool {
        self.code() == Code::Call_rel32_64 && self.bytes.first() == Some(&0xE8)
    }

    /// `push r64` / `push r16`.
    pub fn is_push_reg(&self) -> bool {
        self.mnemonic() == Mnemonic::Push && self.operand_kind(0) == Some(OpKind::Register)
    }

    /// Target of a direct near branch or call.
    pub fn branch_target(&self) -> Option<u64> {
        match self.instruction.op0_kind() {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Some(self.instruction.near_branch_target())
            }
            _ => None,
        }
    }

    /// Number of explicit operands.
    #[inline]
    pub fn operand_count(&self) -> u32 {
        self.instruction.op_count()
    }

    pub fn operand_kind(&self, index: u32) -> Option<OpKind> {
        (index < self.operand_count()).then(|| self.instruction.op_kind(index))
    }

    pub fn operand_register(&self, index: u32) -> Option<Register> {
        match self.operand_kind(index)? {
            OpKind::Register => Some(self.instruction.op_register(index)),
            _ => None,
        }
    }

    /// Immediate operand value, sign or zero extended to 64 bits the way the CPU would.
    pub fn operand_immediate(&self, index: u32) -> Option<u64> {
        match self.operand_kind(index)? {
            OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Some(self.instruction.immediate(index)),
            _ => None,
        }
    }

    /// Registers read and written by this instruction, including implicit ones.
    pub fn regs_accessed(&self, factory: &mut InstructionInfoFactory) -> (Vec<Register>, Vec<Register>) {
        let info = factory.info(&self.instruction);
        let mut read = Vec::new();
        let mut written = Vec::new();

        for used in info.used_registers() {
            match used.access() {
                OpAccess::Read | OpAccess::CondRead => read.push(used.register()),
                OpAccess::Write | OpAccess::CondWrite => written.push(used.register()),
                OpAccess::ReadWrite | OpAccess::ReadCondWrite => {
                    read.push(used.register());
                    written.push(used.register());
                }
                _ => {}
            }
        }

        (read, written)
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}: {}", self.address(), self.instruction)
    }
}

// ============================================================================
// Instruction Stream
// ============================================================================

/// A replayable window `[begin, end)` over a shared instruction arena.
///
/// Invariant: `begin <= cursor <= end <= arena.len()`.
#[derive(Clone, Debug)]
pub struct InsnStream {
    insns: Arc<[Insn]>,
    begin: usize,
    end: usize,
    cursor: usize,
}

impl Default for InsnStream {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Vec<Insn>> for InsnStream {
    fn from(insns: Vec<Insn>) -> Self {
        Self::new(insns)
    }
}

impl FromIterator<Insn> for InsnStream {
    fn from_iter<I: IntoIterator<Item = Insn>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl InsnStream {
    /// Create a stream spanning every instruction in `insns`.
    pub fn new(insns: Vec<Insn>) -> Self {
        let end = insns.len();
        Self {
            insns: Arc::from(insns),
            begin: 0,
            end,
            cursor: 0,
        }
    }

    /// A stream with no instructions.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Number of instructions in the span.
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Address of the first instruction in the span.
    pub fn base(&self) -> Option<u64> {
        self.first().map(Insn::address)
    }

    /// Address just past the last instruction in the span.
    pub fn end_address(&self) -> Option<u64> {
        self.last().map(Insn::end_address)
    }

    /// Instructions in the span.
    #[inline]
    pub fn as_slice(&self) -> &[Insn] {
        &self.insns[self.begin..self.end]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Insn> {
        self.as_slice().iter()
    }

    pub fn first(&self) -> Option<&Insn> {
        self.as_slice().first()
    }

    pub fn last(&self) -> Option<&Insn> {
        self.as_slice().last()
    }

    /// Return the instruction under the cursor and advance it.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&Insn> {
        if self.cursor >= self.end {
            return None;
        }
        self.cursor += 1;
        self.insns.get(self.cursor - 1)
    }

    /// Instruction under the cursor without advancing.
    pub fn peek(&self) -> Option<&Insn> {
        if self.cursor >= self.end {
            return None;
        }
        self.insns.get(self.cursor)
    }

    /// Cursor position relative to the start of the span.
    #[inline]
    pub fn position(&self) -> usize {
        self.cursor - self.begin
    }

    /// Rewind the cursor to the start of the span.
    pub fn reset(&mut self) {
        self.cursor = self.begin;
    }

    /// Sub-view of this span. Indices are relative to the span and clamped to it.
    pub fn slice(&self, range: Range<usize>) -> InsnStream {
        let begin = (self.begin + range.start).min(self.end);
        let end = (self.begin + range.end).clamp(begin, self.end);
        Self {
            insns: Arc::clone(&self.insns),
            begin,
            end,
            cursor: begin,
        }
    }

    /// Whether both streams view the same arena.
    pub fn shares_arena(&self, other: &InsnStream) -> bool {
        Arc::ptr_eq(&self.insns, &other.insns)
    }

    /// Concatenated raw bytes of every instruction in the span.
    pub fn bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.iter().map(Insn::len).sum());
        for insn in self.iter() {
            result.extend_from_slice(insn.bytes());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions};

    fn decode_all(code: &[u8], ip: u64) -> Vec<Insn> {
        let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
        let mut result = Vec::new();
        while decoder.can_decode() {
            let pos = decoder.position();
            let instr = decoder.decode();
            result.push(Insn::new(instr, &code[pos..pos + instr.len()]));
        }
        result
    }

    #[test]
    fn test_insn_classification() {
        let code: &[u8] = &[
            0x50,                         // push rax
            0xE8, 0x00, 0x00, 0x00, 0x00, // call +0
            0xEB, 0x01,                   // jmp +1
            0x74, 0x02,                   // je +2
            0xFF, 0xE0,                   // jmp rax
            0xC3,                         // ret
        ];
        let insns = decode_all(code, 0x1000);
        assert_eq!(insns.len(), 6);

        assert!(insns[0].is_push_reg());
        assert!(insns[1].is_call());
        assert!(insns[1].is_relative_call());
        assert_eq!(insns[1].branch_target(), Some(0x1006));
        assert!(insns[2].is_branch() && insns[2].is_uncond_jmp());
        assert_eq!(insns[2].branch_target(), Some(0x1009));
        assert!(insns[3].is_cond_jump());
        assert!(insns[4].is_branch());
        assert_eq!(insns[4].branch_target(), None);
        assert_eq!(insns[4].operand_register(0), Some(Register::RAX));
        assert!(insns[5].is_return());
    }

    #[test]
    fn test_insn_immediate() {
        // add rsp, -8 ; sign-extended imm8
        let insns = decode_all(&[0x48, 0x83, 0xC4, 0xF8], 0);
        assert_eq!(insns[0].operand_immediate(1), Some(0xFFFF_FFFF_FFFF_FFF8));
        assert_eq!(insns[0].operand_immediate(0), None);
        assert_eq!(insns[0].operand_immediate(5), None);
    }

    #[test]
    fn test_regs_accessed() {
        // xchg rax, rcx
        let insns = decode_all(&[0x48, 0x91], 0);
        let mut factory = InstructionInfoFactory::new();
        let (read, written) = insns[0].regs_accessed(&mut factory);
        assert!(read.contains(&Register::RAX) && read.contains(&Register::RCX));
        assert!(written.contains(&Register::RAX) && written.contains(&Register::RCX));
    }

    #[test]
    fn test_stream_cursor() {
        let code: &[u8] = &[0x90, 0x50, 0x58, 0xC3];
        let mut stream = InsnStream::new(decode_all(code, 0x2000));

        assert_eq!(stream.len(), 4);
        assert_eq!(stream.base(), Some(0x2000));
        assert_eq!(stream.end_address(), Some(0x2004));

        let mut seen = Vec::new();
        while let Some(insn) = stream.next() {
            seen.push(insn.address());
        }
        assert_eq!(seen, vec![0x2000, 0x2001, 0x2002, 0x2003]);
        assert!(stream.next().is_none());
        assert_eq!(stream.position(), 4);

        stream.reset();
        assert_eq!(stream.peek().map(Insn::address), Some(0x2000));
        assert_eq!(stream.bytes(), code);
    }

    #[test]
    fn test_stream_slice_shares_arena() {
        let code: &[u8] = &[0x90, 0x50, 0x58, 0xC3];
        let stream = InsnStream::new(decode_all(code, 0x2000));
        let tail = stream.slice(1..10);

        assert!(tail.shares_arena(&stream));
        assert_eq!(tail.len(), 3);
        assert_eq!(tail.base(), Some(0x2001));
        assert_eq!(tail.bytes(), &code[1..]);

        let copy = tail.clone();
        assert!(copy.shares_arena(&stream));
        assert!(stream.slice(4..2).is_empty());
    }

    #[test]
    fn test_empty_stream() {
        let mut stream = InsnStream::default();
        assert!(stream.is_empty());
        assert_eq!(stream.base(), None);
        assert!(stream.next().is_none());
        assert!(stream.bytes().is_empty());
    }
}
