//! Recognition of packer-generated import stubs.
//!
//! Every obfuscated import call lands in a short stub that starts with a `nop`,
//! loads the import address from a thunk, optionally adds a constant, fixes up the
//! return address and stack, and transfers to the import. The stub is lifted
//! symbolically and the result is matched against that shape:
//!
//! ```text
//! target        = [THUNK] + OFFSET
//! [final rsp]   = [base] (+ 1 when the call site carries a junk byte)
//! final rsp     = entry rsp + ADJUSTMENT
//! ```

use crate::insn::InsnStream;
use crate::lift::{lift, Expr, LiftError};

use iced_x86::Register;
use thiserror::Error;
use tracing::{debug, warn};

/// What a recognized stub does on behalf of its call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StubAnalysis {
    /// Rva of the pointer the stub dereferences.
    pub thunk_rva: u64,
    /// Constant added to the dereferenced pointer.
    pub dest_offset: u64,
    /// Extra stack consumed by the stub, excluding the return address of a jump.
    pub stack_adjustment: i32,
    /// The return address is bumped past a junk byte at the call site.
    pub padded: bool,
    /// The original instruction was a `jmp`, not a `call`.
    pub is_jmp: bool,
}

/// Why a stub was not recognized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StubError {
    #[error(transparent)]
    Lift(#[from] LiftError),

    #[error("transfer target {0} is not a constant load plus offset")]
    TargetShape(Expr),

    #[error("return address slot at {0} was partially overwritten")]
    ReturnSlotClobbered(Expr),

    #[error("return address {0} is not a load plus constant")]
    ReturnAddressShape(Expr),

    #[error("final stack pointer {0} is not a constant offset from entry")]
    NonConstantStack(Expr),

    #[error("stack adjustment {0} does not fit in 32 bits")]
    StackAdjustmentRange(i64),
}

/// Analyze a stub, returning `None` when it does not have the expected shape.
pub fn analyze(stream: &InsnStream) -> Option<StubAnalysis> {
    match try_analyze(stream) {
        Ok(analysis) => Some(analysis),
        Err(e) => {
            debug!("stub at 0x{:X} rejected: {}", stream.base().unwrap_or(0), e);
            None
        }
    }
}

/// Analyze a stub, naming the reason when it is rejected.
pub fn try_analyze(stream: &InsnStream) -> Result<StubAnalysis, StubError> {
    let block = lift(stream)?;

    let target = block.target().simplify();
    let (dest, dest_offset) = target.split_offset();
    let thunk_rva = dest
        .as_load()
        .and_then(Expr::as_const)
        .ok_or_else(|| StubError::TargetShape(target.clone()))?;

    let sp = block.stack_pointer();
    let return_address = block
        .trace_memory(&sp)
        .ok_or_else(|| StubError::ReturnSlotClobbered(sp.clone()))?;

    let (slot, padding) = return_address.split_offset();
    let base = slot
        .as_load()
        .cloned()
        .ok_or_else(|| StubError::ReturnAddressShape(return_address.clone()))?;

    let padded = padding != 0;
    if padded && padding != 1 {
        warn!(
            "stub at 0x{:X} pads its return address by {}, expected 1",
            stream.base().unwrap_or(0),
            padding as i64
        );
    }

    let delta = (sp.clone() - Expr::Reg(Register::RSP))
        .as_const()
        .ok_or_else(|| StubError::NonConstantStack(sp.clone()))? as i64;
    let mut stack_adjustment =
        i32::try_from(delta).map_err(|_| StubError::StackAdjustmentRange(delta))?;

    // A jump leaves the caller's return address in place, so the slot at the final
    // stack pointer still holds its entry value.
    let is_jmp = base == sp && stack_adjustment >= 8;
    if is_jmp {
        stack_adjustment -= 8;
    }

    Ok(StubAnalysis {
        thunk_rva,
        dest_offset,
        stack_adjustment,
        padded,
        is_jmp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::{disassemble, disassembly_simple, DecodeContext, DisasmFlags};

    const THUNK: u64 = 0x2000;

    /// Stub bytes assembled at rva 0.
    #[derive(Default)]
    struct StubCode(Vec<u8>);

    impl StubCode {
        fn raw(mut self, bytes: &[u8]) -> Self {
            self.0.extend_from_slice(bytes);
            self
        }

        /// mov rax, [rip -> thunk]
        fn load_thunk(mut self) -> Self {
            let end = self.0.len() as i64 + 7;
            let disp = (THUNK as i64 - end) as i32;
            self.0.extend_from_slice(&[0x48, 0x8B, 0x05]);
            self.0.extend_from_slice(&disp.to_le_bytes());
            self
        }

        fn stream(&self) -> InsnStream {
            let mut ctx = DecodeContext::new();
            disassemble(&mut ctx, &self.0, 0, DisasmFlags::default(), 128)
        }

        fn linear_stream(&self) -> InsnStream {
            let mut ctx = DecodeContext::new();
            InsnStream::from(disassembly_simple(&mut ctx, &self.0, 0, self.0.len() as u64))
        }
    }

    const NOP: &[u8] = &[0x90];
    const PUSH_RAX: &[u8] = &[0x50];
    const POP_RAX: &[u8] = &[0x58];
    const RET: &[u8] = &[0xC3];
    const JMP_RAX: &[u8] = &[0xFF, 0xE0];
    const MOV_RAX_RSP8: &[u8] = &[0x48, 0x8B, 0x44, 0x24, 0x08];
    const MOV_RSP8_RAX: &[u8] = &[0x48, 0x89, 0x44, 0x24, 0x08];
    const MOV_RSP16_RAX: &[u8] = &[0x48, 0x89, 0x44, 0x24, 0x10];
    const XCHG_RSP_RAX: &[u8] = &[0x48, 0x87, 0x04, 0x24];
    const LEA_RSP_RSP8: &[u8] = &[0x48, 0x8D, 0x64, 0x24, 0x08];

    fn lea_rax_rax(disp: u8) -> [u8; 4] {
        [0x48, 0x8D, 0x40, disp]
    }

    #[test]
    fn test_padded_call_stub() {
        let code = StubCode::default()
            .raw(NOP)
            .raw(PUSH_RAX)
            .raw(MOV_RAX_RSP8)
            .raw(&lea_rax_rax(1))
            .raw(MOV_RSP8_RAX)
            .load_thunk()
            .raw(&lea_rax_rax(0x10))
            .raw(XCHG_RSP_RAX)
            .raw(RET);

        let analysis = analyze(&code.stream()).unwrap();
        assert_eq!(
            analysis,
            StubAnalysis {
                thunk_rva: THUNK,
                dest_offset: 0x10,
                stack_adjustment: 0,
                padded: true,
                is_jmp: false,
            }
        );
    }

    #[test]
    fn test_jump_stub() {
        let code = StubCode::default()
            .raw(NOP)
            .raw(PUSH_RAX)
            .load_thunk()
            .raw(MOV_RSP8_RAX)
            .raw(POP_RAX)
            .raw(RET);

        let analysis = analyze(&code.stream()).unwrap();
        assert_eq!(analysis.thunk_rva, THUNK);
        assert_eq!(analysis.dest_offset, 0);
        assert!(analysis.is_jmp);
        assert!(!analysis.padded);
        assert_eq!(analysis.stack_adjustment, 0);
    }

    #[test]
    fn test_push_compensated_call_stub() {
        let code = StubCode::default()
            .raw(NOP)
            .raw(PUSH_RAX)
            .raw(MOV_RAX_RSP8)
            .raw(MOV_RSP16_RAX)
            .load_thunk()
            .raw(MOV_RSP8_RAX)
            .raw(POP_RAX)
            .raw(RET);

        let analysis = analyze(&code.stream()).unwrap();
        assert!(!analysis.is_jmp);
        assert!(!analysis.padded);
        assert_eq!(analysis.stack_adjustment, 8);
    }

    #[test]
    fn test_push_compensated_jump_stub() {
        let code = StubCode::default()
            .raw(NOP)
            .raw(PUSH_RAX)
            .load_thunk()
            .raw(MOV_RSP16_RAX)
            .raw(POP_RAX)
            .raw(LEA_RSP_RSP8)
            .raw(RET);

        let analysis = analyze(&code.stream()).unwrap();
        assert!(analysis.is_jmp);
        assert_eq!(analysis.stack_adjustment, 8);
    }

    #[test]
    fn test_jmp_register_unchanged_stack() {
        // The return address is untouched and the stack did not move, so the
        // adjustment stays below 8 and the stub is classified as a call.
        let code = StubCode::default()
            .raw(NOP)
            .load_thunk()
            .raw(JMP_RAX);

        let analysis = try_analyze(&code.linear_stream()).unwrap();
        assert_eq!(analysis.thunk_rva, THUNK);
        assert_eq!(analysis.stack_adjustment, 0);
        assert!(!analysis.is_jmp);
        assert!(!analysis.padded);
    }

    #[test]
    fn test_unusual_padding_is_accepted() {
        let code = StubCode::default()
            .raw(NOP)
            .raw(PUSH_RAX)
            .raw(MOV_RAX_RSP8)
            .raw(&lea_rax_rax(2))
            .raw(MOV_RSP8_RAX)
            .load_thunk()
            .raw(XCHG_RSP_RAX)
            .raw(RET);

        let analysis = analyze(&code.stream()).unwrap();
        assert!(analysis.padded);
        assert_eq!(analysis.dest_offset, 0);
    }

    #[test]
    fn test_non_constant_stack_rejected() {
        let code = StubCode::default()
            .raw(NOP)
            .load_thunk()
            .raw(&[0x48, 0x01, 0xD4]) // add rsp, rdx
            .raw(JMP_RAX);

        let err = try_analyze(&code.linear_stream()).unwrap_err();
        assert!(matches!(err, StubError::NonConstantStack(_)));
    }

    #[test]
    fn test_target_shape_rejected() {
        let code = StubCode::default()
            .raw(NOP)
            .raw(&[0x48, 0x89, 0xC8]) // mov rax, rcx
            .raw(JMP_RAX);

        let err = try_analyze(&code.linear_stream()).unwrap_err();
        assert_eq!(err, StubError::TargetShape(Expr::Reg(Register::RCX)));
    }

    #[test]
    fn test_clobbered_return_slot_rejected() {
        let code = StubCode::default()
            .raw(NOP)
            .load_thunk()
            .raw(&[0x88, 0x5C, 0x24, 0x04]) // mov [rsp+4], bl
            .raw(&[0x48, 0x89, 0x4C, 0x24, 0xF8]) // mov [rsp-8], rcx
            .raw(JMP_RAX);

        let err = try_analyze(&code.linear_stream()).unwrap_err();
        assert!(matches!(err, StubError::ReturnSlotClobbered(_)));
    }

    #[test]
    fn test_empty_stream_rejected() {
        // Stub that never terminates within budget.
        let code = StubCode::default().raw(NOP).raw(&[0xEB, 0xFE]);
        assert!(code.stream().is_empty());
        assert_eq!(
            try_analyze(&code.stream()).unwrap_err(),
            StubError::Lift(LiftError::Empty)
        );
        assert!(analyze(&code.stream()).is_none());
    }
}
