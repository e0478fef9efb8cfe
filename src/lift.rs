//! Symbolic lifting of straight-line instruction blocks.
//!
//! A block is executed over symbolic values: every register starts as `Reg(r)` and
//! every memory qword as `Load(address)`. Arithmetic that stays linear (add, sub,
//! scaling by constants, neg, not) is kept exact; anything else the lifter does not
//! model becomes a fresh `Opaque` value.
//!
//! Expressions are kept in a canonical form: a sorted sum of atoms with wrapping
//! coefficients plus one constant. Two expressions that simplify to the same form
//! compare equal.

use crate::insn::{Insn, InsnStream};

use iced_x86::{Instruction, InstructionInfoFactory, Mnemonic, OpAccess, OpKind, Register};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops;
use thiserror::Error;

// ============================================================================
// Expressions
// ============================================================================

/// Symbolic 64-bit value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Expr {
    Const(u64),
    /// Value of a 64-bit register on block entry.
    Reg(Register),
    /// Qword in memory at the given address on block entry.
    Load(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    /// A value the lifter could not model. Each one is distinct.
    Opaque(u32),
}

impl Expr {
    pub fn load(address: Expr) -> Expr {
        Expr::Load(Box::new(address.simplify()))
    }

    /// Canonical form of this expression.
    pub fn simplify(&self) -> Expr {
        Linear::of(self).into_expr()
    }

    /// The constant this expression evaluates to, if any.
    pub fn as_const(&self) -> Option<u64> {
        Linear::of(self).as_const()
    }

    /// Decompose into `base + offset`; `base` is `Const(0)` for pure constants.
    pub fn split_offset(&self) -> (Expr, u64) {
        let mut linear = Linear::of(self);
        let offset = std::mem::take(&mut linear.constant);
        (linear.into_expr(), offset)
    }

    /// Address of a `Load`, without simplifying `self` first.
    pub fn as_load(&self) -> Option<&Expr> {
        match self {
            Expr::Load(address) => Some(address),
            _ => None,
        }
    }

    /// Semantic equality after simplification.
    pub fn equals(&self, other: &Expr) -> bool {
        self.simplify() == other.simplify()
    }

    pub fn contains_opaque(&self) -> bool {
        match self {
            Expr::Opaque(_) => true,
            Expr::Const(_) | Expr::Reg(_) => false,
            Expr::Load(a) => a.contains_opaque(),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) => {
                a.contains_opaque() || b.contains_opaque()
            }
        }
    }
}

impl ops::Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        Expr::Add(Box::new(self), Box::new(rhs)).simplify()
    }
}

impl ops::Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        Expr::Sub(Box::new(self), Box::new(rhs)).simplify()
    }
}

impl ops::Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        Expr::Mul(Box::new(self), Box::new(rhs)).simplify()
    }
}

impl ops::Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        self * Expr::Const(u64::MAX)
    }
}

impl ops::Not for Expr {
    type Output = Expr;

    // !x == -x - 1
    fn not(self) -> Expr {
        -self + Expr::Const(u64::MAX)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(c) => write!(f, "{:#x}", c),
            Expr::Reg(r) => write!(f, "{:?}", r),
            Expr::Load(a) => write!(f, "[{}]", a),
            Expr::Add(a, b) => write!(f, "({} + {})", a, b),
            Expr::Sub(a, b) => write!(f, "({} - {})", a, b),
            Expr::Mul(a, b) => write!(f, "({} * {})", a, b),
            Expr::Opaque(n) => write!(f, "?{}", n),
        }
    }
}

/// Sum of atoms with wrapping coefficients.
#[derive(Default)]
struct Linear {
    terms: BTreeMap<Expr, u64>,
    constant: u64,
}

impl Linear {
    fn atom(expr: Expr) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(expr, 1);
        Self { terms, constant: 0 }
    }

    fn of(expr: &Expr) -> Self {
        match expr {
            Expr::Const(c) => Self {
                terms: BTreeMap::new(),
                constant: *c,
            },
            Expr::Reg(_) | Expr::Opaque(_) => Self::atom(expr.clone()),
            Expr::Load(address) => Self::atom(Expr::Load(Box::new(address.simplify()))),
            Expr::Add(a, b) => {
                let mut result = Self::of(a);
                result.accumulate(Self::of(b), 1);
                result
            }
            Expr::Sub(a, b) => {
                let mut result = Self::of(a);
                result.accumulate(Self::of(b), u64::MAX);
                result
            }
            Expr::Mul(a, b) => {
                let lhs = Self::of(a);
                let rhs = Self::of(b);
                if let Some(k) = rhs.as_const() {
                    lhs.scale(k)
                } else if let Some(k) = lhs.as_const() {
                    rhs.scale(k)
                } else {
                    let (x, y) = (lhs.into_expr(), rhs.into_expr());
                    let (x, y) = if x <= y { (x, y) } else { (y, x) };
                    Self::atom(Expr::Mul(Box::new(x), Box::new(y)))
                }
            }
        }
    }

    fn accumulate(&mut self, other: Linear, factor: u64) {
        self.constant = self
            .constant
            .wrapping_add(other.constant.wrapping_mul(factor));
        for (atom, coef) in other.terms {
            let entry = self.terms.entry(atom).or_insert(0);
            *entry = entry.wrapping_add(coef.wrapping_mul(factor));
        }
        self.terms.retain(|_, coef| *coef != 0);
    }

    fn scale(mut self, k: u64) -> Self {
        self.constant = self.constant.wrapping_mul(k);
        for coef in self.terms.values_mut() {
            *coef = coef.wrapping_mul(k);
        }
        self.terms.retain(|_, coef| *coef != 0);
        self
    }

    fn as_const(&self) -> Option<u64> {
        self.terms.is_empty().then_some(self.constant)
    }

    fn into_expr(self) -> Expr {
        let mut sum: Option<Expr> = None;
        for (atom, coef) in self.terms {
            let term = match coef {
                1 => atom,
                _ => Expr::Mul(Box::new(atom), Box::new(Expr::Const(coef))),
            };
            sum = Some(match sum {
                None => term,
                Some(acc) => Expr::Add(Box::new(acc), Box::new(term)),
            });
        }

        match sum {
            None => Expr::Const(self.constant),
            Some(e) if self.constant == 0 => e,
            Some(e) => Expr::Add(Box::new(e), Box::new(Expr::Const(self.constant))),
        }
    }
}

// ============================================================================
// Machine state
// ============================================================================

/// Errors that prevent a block from being lifted at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LiftError {
    #[error("empty block")]
    Empty,

    #[error("block does not end in a control transfer (last instruction at 0x{0:X})")]
    MissingTransfer(u64),

    #[error("control transfer inside the block at 0x{0:X}")]
    UnexpectedTransfer(u64),
}

/// How the lifted block leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    Return,
    Jump,
    Call,
}

/// Register file and memory of a symbolic execution.
#[derive(Clone, Debug, Default)]
pub struct SymbolicState {
    regs: HashMap<Register, Expr>,
    /// Qwords written during the block, keyed by canonical address.
    memory: BTreeMap<Expr, Expr>,
    next_opaque: u32,
}

impl SymbolicState {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh(&mut self) -> Expr {
        let id = self.next_opaque;
        self.next_opaque += 1;
        Expr::Opaque(id)
    }

    /// Current value of a full 64-bit register.
    pub fn register(&self, reg: Register) -> Expr {
        let full = reg.full_register();
        self.regs
            .get(&full)
            .cloned()
            .unwrap_or(Expr::Reg(full))
    }

    /// Qword at `address`, or `None` when it was partially overwritten.
    pub fn peek_qword(&self, address: &Expr) -> Option<Expr> {
        let address = address.simplify();
        if let Some(value) = self.memory.get(&address) {
            return Some(value.clone());
        }

        let overlaps = self.memory.keys().any(|key| {
            distance(key, &address).is_some_and(|d| d != 0 && d.unsigned_abs() < 8)
        });
        (!overlaps).then(|| Expr::Load(Box::new(address)))
    }

    fn read_reg(&mut self, reg: Register) -> Expr {
        if reg == Register::None {
            return Expr::Const(0);
        }
        if !reg.is_gpr() {
            return self.fresh();
        }

        let value = self.register(reg);
        if reg.size() == 8 {
            return value;
        }
        match value.as_const() {
            Some(c) => Expr::Const(extract_subregister(c, reg)),
            None => self.fresh(),
        }
    }

    fn write_reg(&mut self, reg: Register, value: Expr) {
        if !reg.is_gpr() {
            return;
        }

        let full = reg.full_register();
        let value = match reg.size() {
            8 => value.simplify(),
            // 32-bit writes zero-extend.
            4 => match value.as_const() {
                Some(c) => Expr::Const(c & 0xFFFF_FFFF),
                None => self.fresh(),
            },
            _ => match (self.register(full).as_const(), value.as_const()) {
                (Some(old), Some(new)) => Expr::Const(merge_subregister(old, new, reg)),
                _ => self.fresh(),
            },
        };
        self.regs.insert(full, value);
    }

    fn load(&mut self, address: Expr, size: usize) -> Expr {
        match (size, self.peek_qword(&address)) {
            (8, Some(value)) => value,
            (1..=4, Some(value)) => match value.as_const() {
                Some(c) => Expr::Const(c & mask(size)),
                None => self.fresh(),
            },
            _ => self.fresh(),
        }
    }

    fn store(&mut self, address: Expr, value: Expr, size: usize) {
        let address = address.simplify();

        let clobbered: Vec<Expr> = self
            .memory
            .keys()
            .filter(|key| {
                distance(key, &address).is_some_and(|d| d != 0 && d > -8 && d < size as i64)
            })
            .cloned()
            .collect();
        for key in clobbered {
            let opaque = self.fresh();
            self.memory.insert(key, opaque);
        }

        let value = if size == 8 {
            value.simplify()
        } else {
            self.fresh()
        };
        self.memory.insert(address, value);
    }

    fn memory_address(&mut self, instr: &Instruction) -> Option<Expr> {
        if matches!(instr.segment_prefix(), Register::FS | Register::GS) {
            return None;
        }
        if instr.is_ip_rel_memory_operand() {
            return Some(Expr::Const(instr.ip_rel_memory_address()));
        }

        let base = instr.memory_base();
        let index = instr.memory_index();
        if (base != Register::None && !base.is_gpr64()) || (index != Register::None && !index.is_gpr64()) {
            return None;
        }

        let mut address = Expr::Const(instr.memory_displacement64());
        if base != Register::None {
            address = address + self.read_reg(base);
        }
        if index != Register::None {
            let scale = Expr::Const(u64::from(instr.memory_index_scale()));
            address = address + self.read_reg(index) * scale;
        }
        Some(address)
    }

    fn read_operand(&mut self, instr: &Instruction, index: u32) -> Expr {
        match instr.op_kind(index) {
            OpKind::Register => self.read_reg(instr.op_register(index)),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Expr::Const(instr.near_branch_target())
            }
            OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Expr::Const(instr.immediate(index)),
            OpKind::Memory => match self.memory_address(instr) {
                Some(address) => self.load(address, instr.memory_size().size()),
                None => self.fresh(),
            },
            _ => self.fresh(),
        }
    }

    fn write_operand(&mut self, instr: &Instruction, index: u32, value: Expr) {
        match instr.op_kind(index) {
            OpKind::Register => self.write_reg(instr.op_register(index), value),
            OpKind::Memory => {
                if let Some(address) = self.memory_address(instr) {
                    self.store(address, value, instr.memory_size().size());
                }
            }
            _ => {}
        }
    }

    fn operand_size(instr: &Instruction, index: u32) -> usize {
        match instr.op_kind(index) {
            OpKind::Register => instr.op_register(index).size(),
            OpKind::Memory => instr.memory_size().size(),
            _ => 8,
        }
    }

    fn push(&mut self, value: Expr, size: usize) {
        let sp = self.read_reg(Register::RSP) - Expr::Const(size as u64);
        self.write_reg(Register::RSP, sp.clone());
        self.store(sp, value, size);
    }

    fn pop(&mut self, size: usize) -> Expr {
        let sp = self.read_reg(Register::RSP);
        let value = self.load(sp.clone(), size);
        self.write_reg(Register::RSP, sp + Expr::Const(size as u64));
        value
    }

    /// Apply the effects of one non-transfer instruction.
    pub fn step(&mut self, insn: &Insn, factory: &mut InstructionInfoFactory) {
        let instr = insn.instruction();

        match insn.mnemonic() {
            Mnemonic::Nop | Mnemonic::Cmp | Mnemonic::Test | Mnemonic::Clc | Mnemonic::Stc | Mnemonic::Cmc => {}
            Mnemonic::Mov => {
                let value = self.read_operand(instr, 1);
                self.write_operand(instr, 0, value);
            }
            Mnemonic::Movzx | Mnemonic::Movsx | Mnemonic::Movsxd => {
                let size = Self::operand_size(instr, 1);
                let value = match self.read_operand(instr, 1).as_const() {
                    Some(c) => Expr::Const(extend(c, size, insn.mnemonic() != Mnemonic::Movzx)),
                    None => self.fresh(),
                };
                self.write_operand(instr, 0, value);
            }
            Mnemonic::Lea => {
                let value = match self.memory_address(instr) {
                    Some(address) => address,
                    None => self.fresh(),
                };
                self.write_operand(instr, 0, value);
            }
            Mnemonic::Push => {
                let value = self.read_operand(instr, 0);
                let size = match instr.op_kind(0) {
                    OpKind::Register | OpKind::Memory => Self::operand_size(instr, 0),
                    _ => instr.stack_pointer_increment().unsigned_abs() as usize,
                };
                self.push(value, size);
            }
            Mnemonic::Pop => {
                let value = self.pop(Self::operand_size(instr, 0));
                self.write_operand(instr, 0, value);
            }
            Mnemonic::Xchg => {
                let a = self.read_operand(instr, 0);
                let b = self.read_operand(instr, 1);
                self.write_operand(instr, 0, b);
                self.write_operand(instr, 1, a);
            }
            Mnemonic::Add | Mnemonic::Sub | Mnemonic::Xor | Mnemonic::And | Mnemonic::Or | Mnemonic::Shl => {
                let a = self.read_operand(instr, 0);
                let b = self.read_operand(instr, 1);
                let value = match insn.mnemonic() {
                    Mnemonic::Add => Some(a + b),
                    Mnemonic::Sub => Some(a - b),
                    Mnemonic::Shl => {
                        let bits = if Self::operand_size(instr, 0) == 8 { 63 } else { 31 };
                        b.as_const().map(|k| a * Expr::Const(1u64 << (k & bits)))
                    }
                    mnemonic => bitwise(mnemonic, &a, &b),
                };
                let value = value.unwrap_or_else(|| self.fresh());
                self.write_operand(instr, 0, value);
            }
            Mnemonic::Inc | Mnemonic::Dec | Mnemonic::Neg | Mnemonic::Not => {
                let a = self.read_operand(instr, 0);
                let value = match insn.mnemonic() {
                    Mnemonic::Inc => a + Expr::Const(1),
                    Mnemonic::Dec => a - Expr::Const(1),
                    Mnemonic::Neg => -a,
                    _ => !a,
                };
                self.write_operand(instr, 0, value);
            }
            _ => self.step_generic(insn, factory),
        }
    }

    /// Anything not modeled: written registers and memory become opaque.
    fn step_generic(&mut self, insn: &Insn, factory: &mut InstructionInfoFactory) {
        let instr = insn.instruction();
        let increment = instr.stack_pointer_increment();
        let (_, written) = insn.regs_accessed(factory);

        for reg in written {
            if reg.full_register() == Register::RSP && increment != 0 {
                continue;
            }
            let opaque = self.fresh();
            self.write_reg(reg, opaque);
        }

        let writes_memory = factory
            .info(instr)
            .used_memory()
            .iter()
            .any(|m| matches!(m.access(), OpAccess::Write | OpAccess::CondWrite | OpAccess::ReadWrite | OpAccess::ReadCondWrite));
        let explicit_memory = (0..instr.op_count()).any(|i| instr.op_kind(i) == OpKind::Memory);
        if writes_memory && explicit_memory {
            if let Some(address) = self.memory_address(instr) {
                let opaque = self.fresh();
                self.store(address, opaque, instr.memory_size().size());
            }
        }

        if increment != 0 {
            let sp = self.read_reg(Register::RSP) + Expr::Const(i64::from(increment) as u64);
            self.write_reg(Register::RSP, sp.clone());
            if increment < 0 {
                let opaque = self.fresh();
                self.store(sp, opaque, increment.unsigned_abs() as usize);
            }
        }
    }
}

fn distance(a: &Expr, b: &Expr) -> Option<i64> {
    (a.clone() - b.clone()).as_const().map(|d| d as i64)
}

fn mask(size: usize) -> u64 {
    match size {
        1 => 0xFF,
        2 => 0xFFFF,
        4 => 0xFFFF_FFFF,
        _ => u64::MAX,
    }
}

fn is_high_byte(reg: Register) -> bool {
    matches!(reg, Register::AH | Register::BH | Register::CH | Register::DH)
}

fn extract_subregister(value: u64, reg: Register) -> u64 {
    if is_high_byte(reg) {
        (value >> 8) & 0xFF
    } else {
        value & mask(reg.size())
    }
}

fn merge_subregister(old: u64, new: u64, reg: Register) -> u64 {
    if is_high_byte(reg) {
        (old & !0xFF00) | ((new & 0xFF) << 8)
    } else {
        let m = mask(reg.size());
        (old & !m) | (new & m)
    }
}

fn extend(value: u64, size: usize, signed: bool) -> u64 {
    let value = value & mask(size);
    if !signed || size >= 8 {
        return value;
    }
    let shift = 64 - size as u32 * 8;
    (((value << shift) as i64) >> shift) as u64
}

fn bitwise(mnemonic: Mnemonic, a: &Expr, b: &Expr) -> Option<Expr> {
    let (ca, cb) = (a.as_const(), b.as_const());
    match mnemonic {
        Mnemonic::Xor => match (ca, cb) {
            (Some(x), Some(y)) => Some(Expr::Const(x ^ y)),
            _ if a.equals(b) => Some(Expr::Const(0)),
            (_, Some(0)) => Some(a.clone()),
            (Some(0), _) => Some(b.clone()),
            _ => None,
        },
        Mnemonic::And => match (ca, cb) {
            (Some(x), Some(y)) => Some(Expr::Const(x & y)),
            (_, Some(0)) | (Some(0), _) => Some(Expr::Const(0)),
            (_, Some(u64::MAX)) => Some(a.clone()),
            _ if a.equals(b) => Some(a.clone()),
            _ => None,
        },
        Mnemonic::Or => match (ca, cb) {
            (Some(x), Some(y)) => Some(Expr::Const(x | y)),
            (_, Some(0)) => Some(a.clone()),
            (Some(0), _) => Some(b.clone()),
            _ if a.equals(b) => Some(a.clone()),
            _ => None,
        },
        _ => None,
    }
}

// ============================================================================
// Lifting
// ============================================================================

/// A lifted block, observed at its final control transfer.
///
/// For `ret` the state is taken after the return address is popped; for `jmp` and
/// `call` it is taken before the transfer itself touches the stack.
#[derive(Clone, Debug)]
pub struct LiftedBlock {
    state: SymbolicState,
    target: Expr,
    kind: TransferKind,
}

impl LiftedBlock {
    /// Where the final transfer goes.
    pub fn target(&self) -> &Expr {
        &self.target
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn trace_register(&self, reg: Register) -> Expr {
        self.state.register(reg)
    }

    pub fn stack_pointer(&self) -> Expr {
        self.state.register(Register::RSP)
    }

    /// Qword at `address` at the transfer, `None` if it was partially overwritten.
    pub fn trace_memory(&self, address: &Expr) -> Option<Expr> {
        self.state.peek_qword(address)
    }
}

/// Lift a straight-line stream that ends in `ret`, `jmp` or `call`.
pub fn lift(stream: &InsnStream) -> Result<LiftedBlock, LiftError> {
    let (last, body) = stream.as_slice().split_last().ok_or(LiftError::Empty)?;

    let mut factory = InstructionInfoFactory::new();
    let mut state = SymbolicState::new();

    for insn in body {
        if insn.is_branch() || insn.is_call() || insn.is_return() {
            return Err(LiftError::UnexpectedTransfer(insn.address()));
        }
        state.step(insn, &mut factory);
    }

    let instr = last.instruction();
    let (target, kind) = if last.is_return() {
        let extra = last.operand_immediate(0).unwrap_or(0);
        let target = state.pop(8);
        let sp = state.read_reg(Register::RSP) + Expr::Const(extra);
        state.write_reg(Register::RSP, sp);
        (target, TransferKind::Return)
    } else if last.is_call() {
        (state.read_operand(instr, 0), TransferKind::Call)
    } else if last.is_uncond_jmp() {
        (state.read_operand(instr, 0), TransferKind::Jump)
    } else {
        return Err(LiftError::MissingTransfer(last.address()));
    };

    Ok(LiftedBlock {
        state,
        target: target.simplify(),
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::{disassemble, disassembly_simple, DecodeContext, DisasmFlags};

    fn reg(r: Register) -> Expr {
        Expr::Reg(r)
    }

    fn c(v: u64) -> Expr {
        Expr::Const(v)
    }

    // Linear decode so blocks may end in an indirect jmp.
    fn lift_bytes(code: &[u8]) -> LiftedBlock {
        let mut ctx = DecodeContext::new();
        let stream = InsnStream::from(disassembly_simple(&mut ctx, code, 0, code.len() as u64));
        lift(&stream).unwrap()
    }

    #[test]
    fn test_simplify_linear() {
        let e = (reg(Register::RSP) + c(8)) - c(8);
        assert_eq!(e, reg(Register::RSP));

        let e = (reg(Register::RAX) - reg(Register::RAX)) + c(3);
        assert_eq!(e.as_const(), Some(3));

        let e = reg(Register::RCX) * c(2) - reg(Register::RCX);
        assert_eq!(e, reg(Register::RCX));

        let a = reg(Register::RAX) + reg(Register::RBX);
        let b = reg(Register::RBX) + reg(Register::RAX);
        assert!(a.equals(&b));
        assert_eq!(a.simplify(), a.simplify().simplify());
    }

    #[test]
    fn test_simplify_wrapping() {
        let e = c(u64::MAX) + c(2);
        assert_eq!(e.as_const(), Some(1));
        assert_eq!((-c(1)).as_const(), Some(u64::MAX));
        assert_eq!((!c(0)).as_const(), Some(u64::MAX));
        assert_eq!((!reg(Register::RAX) + reg(Register::RAX)).as_const(), Some(u64::MAX));
    }

    #[test]
    fn test_split_offset() {
        let load = Expr::load(c(0x2000));
        let (base, offset) = (load.clone() + c(0x10)).split_offset();
        assert_eq!(base, load);
        assert_eq!(offset, 0x10);
        assert_eq!(base.as_load().and_then(Expr::as_const), Some(0x2000));

        let (base, offset) = c(5).split_offset();
        assert_eq!(base, c(0));
        assert_eq!(offset, 5);
    }

    #[test]
    fn test_nonlinear_mul_is_atom() {
        let e = reg(Register::RAX) * reg(Register::RBX);
        let f = reg(Register::RBX) * reg(Register::RAX);
        assert_eq!(e, f);
        assert_eq!(e.as_const(), None);
    }

    #[test]
    fn test_lift_push_ret() {
        // push rax; ret
        let block = lift_bytes(&[0x50, 0xC3]);
        assert_eq!(block.kind(), TransferKind::Return);
        assert_eq!(block.target(), &reg(Register::RAX));
        assert_eq!(block.stack_pointer(), reg(Register::RSP));
    }

    #[test]
    fn test_lift_rip_relative_load() {
        let code: &[u8] = &[
            0x48, 0x8B, 0x05, 0xF9, 0x0F, 0x00, 0x00, // 0: mov rax, [rip+0xff9] -> [0x1000]
            0x48, 0x8D, 0x40, 0x10,                   // 7: lea rax, [rax+0x10]
            0xFF, 0xE0,                               // b: jmp rax
        ];
        let block = lift_bytes(code);
        assert_eq!(block.kind(), TransferKind::Jump);
        assert_eq!(block.target(), &(Expr::load(c(0x1000)) + c(0x10)));
    }

    #[test]
    fn test_lift_xchg_stack() {
        let code: &[u8] = &[
            0x48, 0x87, 0x04, 0x24, // xchg [rsp], rax
            0x48, 0xFF, 0xC0,       // inc rax
            0x48, 0x87, 0x04, 0x24, // xchg [rsp], rax
            0xC3,                   // ret
        ];
        let block = lift_bytes(code);
        assert_eq!(block.target(), &(Expr::load(reg(Register::RSP)) + c(1)));
        assert_eq!(block.trace_register(Register::RAX), reg(Register::RAX));
        assert_eq!(block.stack_pointer(), reg(Register::RSP) + c(8));
    }

    #[test]
    fn test_lift_ret_imm() {
        // ret 0x10
        let block = lift_bytes(&[0xC2, 0x10, 0x00]);
        assert_eq!(block.stack_pointer(), reg(Register::RSP) + c(0x18));
    }

    #[test]
    fn test_lift_32bit_writes() {
        let code: &[u8] = &[
            0xB8, 0x78, 0x56, 0x34, 0x12, // mov eax, 0x12345678
            0x89, 0xD9,                   // mov ecx, ebx
            0xFF, 0xE0,                   // jmp rax
        ];
        let block = lift_bytes(code);
        assert_eq!(block.target().as_const(), Some(0x1234_5678));
        assert!(block.trace_register(Register::RCX).contains_opaque());
    }

    #[test]
    fn test_lift_subregister_merge() {
        let code: &[u8] = &[
            0x48, 0xC7, 0xC0, 0x00, 0x10, 0x00, 0x00, // mov rax, 0x1000
            0xB0, 0x22,                               // mov al, 0x22
            0xB4, 0x33,                               // mov ah, 0x33
            0xFF, 0xE0,                               // jmp rax
        ];
        let block = lift_bytes(code);
        assert_eq!(block.target().as_const(), Some(0x3322));
    }

    #[test]
    fn test_lift_bitwise() {
        let code: &[u8] = &[
            0x48, 0x31, 0xC9,       // xor rcx, rcx
            0x48, 0x83, 0xC9, 0x08, // or rcx, 8
            0x48, 0xC1, 0xE1, 0x02, // shl rcx, 2
            0x48, 0x01, 0xCC,       // add rsp, rcx
            0xFF, 0xE0,             // jmp rax
        ];
        let block = lift_bytes(code);
        assert_eq!(block.stack_pointer(), reg(Register::RSP) + c(0x20));
    }

    #[test]
    fn test_partial_write_clobbers_slot() {
        let code: &[u8] = &[
            0x48, 0x89, 0x04, 0x24, // mov [rsp], rax
            0x88, 0x5C, 0x24, 0x04, // mov [rsp+4], bl
            0xC3,                   // ret
        ];
        let block = lift_bytes(code);
        assert!(block.target().contains_opaque());
    }

    #[test]
    fn test_unknown_instruction_is_opaque() {
        let code: &[u8] = &[
            0x48, 0x0F, 0xC8, // bswap rax
            0xFF, 0xE0,       // jmp rax
        ];
        let block = lift_bytes(code);
        assert!(block.target().contains_opaque());
        assert_eq!(block.stack_pointer(), reg(Register::RSP));
    }

    #[test]
    fn test_pushfq_moves_stack() {
        let code: &[u8] = &[
            0x9C, // pushfq
            0x9D, // popfq
            0xC3, // ret
        ];
        let block = lift_bytes(code);
        assert_eq!(block.target(), &Expr::load(reg(Register::RSP)));
        assert_eq!(block.stack_pointer(), reg(Register::RSP) + c(8));
    }

    #[test]
    fn test_lift_errors() {
        assert_eq!(lift(&InsnStream::empty()).unwrap_err(), LiftError::Empty);

        let mut ctx = DecodeContext::new();
        let stream = disassemble(&mut ctx, &[0x90, 0x90], 0, DisasmFlags::default(), 8);
        assert_eq!(lift(&stream).unwrap_err(), LiftError::MissingTransfer(1));

        let flags = DisasmFlags::default() | DisasmFlags::PASS_CALLS;
        let stream = disassemble(&mut ctx, &[0xFF, 0xD0, 0xC3], 0, flags, 8);
        assert_eq!(lift(&stream).unwrap_err(), LiftError::UnexpectedTransfer(0));
    }
}
