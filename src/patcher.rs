//! Call-site patching.
//!
//! A recognized stub call is rewritten in the local image into a conventional
//! `call [thunk]` / `jmp [thunk]` through the rebuilt import table. When the call
//! site is too small for the RIP-relative form, a 6-byte `jmp [thunk]` trampoline
//! is appended to the containing section and the call site transfers to it
//! directly instead.

use crate::disasm::{disassembly_simple, DecodeContext};
use crate::pe::PeImage;
use crate::scanner::ImportCall;

use iced_x86::{code_asm::*, Code, Encoder, IcedError, Instruction, MemoryOperand, Register};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Size of a `jmp qword ptr [rip+disp32]` trampoline.
pub const TRAMPOLINE_SIZE: u32 = 6;

/// Filler written over the unused part of a patched region.
const NOP: u8 = 0x90;

/// A code patch applied to the local image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodePatch {
    /// RVA of the patch location.
    pub rva: u64,
    /// Bytes that were replaced.
    pub original_bytes: Vec<u8>,
    /// New bytes (including NOP padding).
    pub patch_bytes: Vec<u8>,
}

/// Why a call site could not be converted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("call at 0x{call_rva:X} adjusts the stack but is not directly preceded by a push")]
    StackAdjustmentMismatch { call_rva: u64 },

    #[error("call at 0x{call_rva:X} could not be disassembled")]
    DisassemblyFailed { call_rva: u64 },

    #[error("could not assemble replacement for call at 0x{call_rva:X}: {reason}")]
    AssemblyFailed { call_rva: u64, reason: String },

    #[error("insufficient bytes for call at 0x{call_rva:X} (have {have}, need {need})")]
    InsufficientSpace {
        call_rva: u64,
        have: usize,
        need: usize,
    },
}

/// Trampolines already emitted, keyed by thunk address.
#[derive(Clone, Debug, Default)]
pub struct TrampolineCache {
    stubs: BTreeMap<u64, u32>,
}

impl TrampolineCache {
    pub fn get(&self, thunk_ea: u64) -> Option<u32> {
        self.stubs.get(&thunk_ea).copied()
    }

    pub fn insert(&mut self, thunk_ea: u64, rva: u32) {
        self.stubs.insert(thunk_ea, rva);
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }
}

/// `call|jmp qword ptr [target]`, encoded at `ip`.
fn encode_indirect(is_jmp: bool, target: u64, ip: u64) -> Result<Vec<u8>, IcedError> {
    let code = if is_jmp { Code::Jmp_rm64 } else { Code::Call_rm64 };
    let instr = Instruction::with1(code, MemoryOperand::with_base_displ(Register::RIP, target as i64))?;

    let mut encoder = Encoder::new(64);
    encoder.encode(&instr, ip)?;
    Ok(encoder.take_buffer())
}

/// `call|jmp target`, encoded at `ip`.
fn encode_direct(is_jmp: bool, target: u64, ip: u64) -> Result<Vec<u8>, IcedError> {
    let mut asm = CodeAssembler::new(64)?;
    if is_jmp {
        asm.jmp(target)?;
    } else {
        asm.call(target)?;
    }
    asm.assemble(ip)
}

/// Rewrites import stub calls in a module image.
pub struct CallPatcher<'a> {
    image: &'a mut PeImage,
    module_base: u64,
    ctx: DecodeContext,
    trampolines: TrampolineCache,
}

impl<'a> CallPatcher<'a> {
    /// Patch `image`, which is loaded at `module_base` in the target process.
    pub fn new(image: &'a mut PeImage, module_base: u64) -> Self {
        Self {
            image,
            module_base,
            ctx: DecodeContext::new(),
            trampolines: TrampolineCache::default(),
        }
    }

    /// Patch `image`, reusing trampolines emitted by an earlier patcher.
    pub fn with_trampolines(image: &'a mut PeImage, module_base: u64, trampolines: TrampolineCache) -> Self {
        Self {
            trampolines,
            ..Self::new(image, module_base)
        }
    }

    pub fn trampolines(&self) -> &TrampolineCache {
        &self.trampolines
    }

    pub fn into_trampolines(self) -> TrampolineCache {
        self.trampolines
    }

    /// Replace the stub call `call` with a transfer through `thunk_ea`.
    ///
    /// The call site is only modified when the conversion succeeds. A trampoline
    /// emitted for a site that still does not fit stays in its cave unused.
    pub fn convert(&mut self, call: &ImportCall, thunk_ea: u64) -> Result<CodePatch, PatchError> {
        let call_rva = call.call_rva;
        let mut fill_rva = None;
        let mut fill_size = 0usize;

        // The stub consumed one pushed qword, so the push belongs to the call site.
        if call.stack_adjustment == 8 {
            match &call.prev_instruction {
                Some(prev) if prev.is_push_reg() && prev.end_address() == call_rva => {
                    fill_rva = Some(prev.address());
                    fill_size += prev.len();
                }
                _ => return Err(PatchError::StackAdjustmentMismatch { call_rva }),
            }
        }

        let insns = disassembly_simple(&mut self.ctx, self.image.bytes(), call_rva, call_rva + 1);
        let Some(first) = insns.first() else {
            return Err(PatchError::DisassemblyFailed { call_rva });
        };

        // Jumps to stubs are 5 bytes, followed by a junk byte unless a push was used.
        if fill_size == 0 && call.is_jmp {
            fill_size += 1;
        }

        let fill_rva = fill_rva.unwrap_or(first.address());
        fill_size += insns.iter().map(|insn| insn.len()).sum::<usize>();
        if call.padded {
            fill_size += 1;
        }

        let fill_ea = self.module_base + fill_rva;
        let mut encoded = encode_indirect(call.is_jmp, thunk_ea, fill_ea).map_err(|e| {
            PatchError::AssemblyFailed {
                call_rva,
                reason: e.to_string(),
            }
        })?;

        if encoded.len() > fill_size {
            if let Some(stub_rva) = self.generate_trampoline(fill_rva, thunk_ea) {
                let stub_ea = self.module_base + u64::from(stub_rva);
                encoded = encode_direct(call.is_jmp, stub_ea, fill_ea).map_err(|e| {
                    PatchError::AssemblyFailed {
                        call_rva,
                        reason: e.to_string(),
                    }
                })?;
                trace!("call at 0x{:X} dispatched via trampoline 0x{:X}", call_rva, stub_rva);
            }
        }

        if encoded.len() > fill_size {
            return Err(PatchError::InsufficientSpace {
                call_rva,
                have: fill_size,
                need: encoded.len(),
            });
        }

        let region = self
            .image
            .slice_mut(fill_rva, fill_size)
            .map_err(|_| PatchError::InsufficientSpace {
                call_rva,
                have: 0,
                need: fill_size,
            })?;
        let original_bytes = region.to_vec();

        let mut patch_bytes = encoded;
        patch_bytes.resize(fill_size, NOP);
        region.copy_from_slice(&patch_bytes);

        debug!(
            "converted {} at 0x{:X} -> [0x{:X}] ({} bytes)",
            if call.is_jmp { "jmp" } else { "call" },
            call_rva,
            thunk_ea,
            fill_size
        );

        Ok(CodePatch {
            rva: fill_rva,
            original_bytes,
            patch_bytes,
        })
    }

    /// Emit (or reuse) a `jmp [thunk_ea]` trampoline at the end of the section
    /// containing `rva`. Returns the trampoline rva.
    pub fn generate_trampoline(&mut self, rva: u64, thunk_ea: u64) -> Option<u32> {
        if let Some(stub_rva) = self.trampolines.get(thunk_ea) {
            return Some(stub_rva);
        }

        let sections = self.image.sections().ok()?;
        let index = sections.iter().position(|s| s.contains_rva(rva))?;
        let section = sections[index];

        let stub_rva = section.virtual_address.checked_add(section.virtual_size)?;
        let stub_end = stub_rva.checked_add(TRAMPOLINE_SIZE)?;

        // The cave must not run into the next section, past the aligned end of the
        // last one (where the import section goes), or past the image.
        let next_section = sections
            .iter()
            .map(|s| s.virtual_address)
            .filter(|&va| va > section.virtual_address)
            .min();
        let limit = match next_section {
            Some(va) => va,
            None => self.image.sections_end().ok()?,
        }
        .min(self.image.len() as u32);
        if stub_end > limit {
            warn!(
                "no room for a trampoline after {} (0x{:X} > 0x{:X})",
                section.name_str(),
                stub_end,
                limit
            );
            return None;
        }

        let stub_ea = self.module_base + u64::from(stub_rva);
        let jump = encode_indirect(true, thunk_ea, stub_ea).ok()?;
        if jump.len() > TRAMPOLINE_SIZE as usize {
            return None;
        }

        self.image.write_bytes(u64::from(stub_rva), &jump).ok()?;
        self.image
            .set_section_virtual_size(index, section.virtual_size + TRAMPOLINE_SIZE)
            .ok()?;
        self.trampolines.insert(thunk_ea, stub_rva);

        debug!("trampoline for [0x{:X}] at 0x{:X}", thunk_ea, stub_rva);
        Some(stub_rva)
    }
}
