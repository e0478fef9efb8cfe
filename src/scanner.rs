//! Import call scanning.
//!
//! Code sections are walked linearly looking for `E8` calls that land on a stub
//! sentinel byte. Each candidate stub is disassembled and analyzed; recognized
//! stubs yield a [`ResolvedImport`] (keyed by the thunk the stub reads) and an
//! [`ImportCall`] describing the call site.

use crate::disasm::{disassemble, DecodeContext, DisasmFlags};
use crate::error::Result;
use crate::insn::Insn;
use crate::pe::{PeImage, CODE_SECTION_CHARACTERISTICS};
use crate::stub::analyze;

use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Configuration for the import scanner.
#[derive(Clone, Debug)]
pub struct ScanConfig {
    /// Instruction budget for a single stub.
    pub max_stub_instructions: usize,
    /// First byte of every import stub.
    pub stub_sentinel: u8,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_stub_instructions: 128,
            stub_sentinel: 0x90, // nop
        }
    }
}

/// Counters for a scan.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub instructions_decoded: usize,
    /// Bytes skipped after a failed decode.
    pub resync_bytes: usize,
    /// Short junk jumps stepped over.
    pub junk_jumps: usize,
    /// Relative calls landing on the sentinel.
    pub candidates: usize,
    pub recognized: usize,
    pub rejected: usize,
}

/// An obfuscated import, identified by the thunk its stubs dereference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedImport {
    /// Rva of the pointer the stub reads.
    pub thunk_rva: u64,
    /// Address of the import in the target process.
    pub target_ea: u64,
}

/// A call site that goes through an import stub.
#[derive(Clone, Debug)]
pub struct ImportCall {
    /// Rva of the `E8` call.
    pub call_rva: u64,
    /// Key of the [`ResolvedImport`] this call reaches.
    pub thunk_rva: u64,
    pub stack_adjustment: i32,
    /// A junk byte follows the call.
    pub padded: bool,
    /// The original instruction was a `jmp`.
    pub is_jmp: bool,
    /// Instruction decoded right before the call, if any.
    pub prev_instruction: Option<Insn>,
}

/// Everything found by one or more scans.
#[derive(Clone, Debug, Default)]
pub struct ImportScan {
    /// Imports keyed by thunk rva.
    pub imports: BTreeMap<u64, ResolvedImport>,
    /// Call sites in discovery order.
    pub calls: Vec<ImportCall>,
}

impl ImportScan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// The import reached by `call`.
    pub fn import_for(&self, call: &ImportCall) -> Option<&ResolvedImport> {
        self.imports.get(&call.thunk_rva)
    }
}

/// Scans a module image for import calls.
pub struct ImportScanner<'a> {
    image: &'a PeImage,
    config: ScanConfig,
    ctx: DecodeContext,
    stats: ScanStats,
}

impl<'a> ImportScanner<'a> {
    pub fn new(image: &'a PeImage, config: ScanConfig) -> Self {
        Self {
            image,
            config,
            ctx: DecodeContext::new(),
            stats: ScanStats::default(),
        }
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Scan every executable code section.
    pub fn scan_all_sections(&mut self) -> Result<ImportScan> {
        let mut result = ImportScan::new();

        for section in self.image.sections()? {
            if !section.has_characteristics(CODE_SECTION_CHARACTERISTICS) {
                continue;
            }

            debug!(
                "scanning {} (0x{:X}, {} bytes)",
                section.name_str(),
                { section.virtual_address },
                { section.virtual_size }
            );
            self.scan(
                u64::from(section.virtual_address),
                u64::from(section.virtual_size),
                &mut result,
            );
        }

        Ok(result)
    }

    /// Scan `[region_rva, region_rva + region_size)`, adding to `result`.
    pub fn scan(&mut self, region_rva: u64, region_size: u64, result: &mut ImportScan) {
        let image = self.image;
        let bytes = image.bytes();
        let end = region_rva.saturating_add(region_size);
        let mut cursor = region_rva;
        let mut prev: Option<Insn> = None;

        while cursor < end {
            let insn = match self.ctx.decode(bytes, cursor) {
                Ok(insn) => insn,
                Err(e) => {
                    trace!("{}", e);
                    self.stats.resync_bytes += 1;
                    cursor += 1;
                    continue;
                }
            };
            self.stats.instructions_decoded += 1;

            // Mutated code hops over junk bytes with 1 and 2 byte forward jumps.
            if insn.is_uncond_jmp() {
                if let Some(target) = insn.branch_target() {
                    let skip = target.wrapping_sub(insn.end_address());
                    if skip == 1 || skip == 2 {
                        self.stats.junk_jumps += 1;
                        cursor = target;
                        prev = Some(insn);
                        continue;
                    }
                }
            }

            cursor = insn.end_address();

            if let Some(call) = self.try_stub_call(&insn, prev.take(), result) {
                if call.is_jmp && call.stack_adjustment == 0 {
                    // Jump stubs never return, so the junk byte after them is not
                    // reported by the analysis.
                    cursor += 1;
                }
                result.calls.push(call);
            }

            prev = Some(insn);
        }
    }

    fn try_stub_call(
        &mut self,
        insn: &Insn,
        prev: Option<Insn>,
        result: &mut ImportScan,
    ) -> Option<ImportCall> {
        if !insn.is_relative_call() {
            return None;
        }

        let image = self.image;
        let bytes = image.bytes();
        let target = insn.branch_target()?;
        let sentinel = usize::try_from(target).ok().and_then(|t| bytes.get(t))?;
        if *sentinel != self.config.stub_sentinel {
            return None;
        }
        self.stats.candidates += 1;

        let stream = disassemble(
            &mut self.ctx,
            bytes,
            target,
            DisasmFlags::default(),
            self.config.max_stub_instructions,
        );
        let Some(analysis) = analyze(&stream) else {
            self.stats.rejected += 1;
            return None;
        };

        let thunk_value = match image.read_u64(analysis.thunk_rva) {
            Ok(value) => value,
            Err(e) => {
                debug!("call at 0x{:X}: thunk unreadable: {}", insn.address(), e);
                self.stats.rejected += 1;
                return None;
            }
        };
        self.stats.recognized += 1;

        let target_ea = thunk_value.wrapping_add(analysis.dest_offset);
        result
            .imports
            .entry(analysis.thunk_rva)
            .or_insert(ResolvedImport {
                thunk_rva: analysis.thunk_rva,
                target_ea,
            });

        debug!(
            "call at 0x{:X} -> stub 0x{:X} -> [0x{:X}] + 0x{:X} = 0x{:X}",
            insn.address(),
            target,
            analysis.thunk_rva,
            analysis.dest_offset,
            target_ea
        );

        Some(ImportCall {
            call_rva: insn.address(),
            thunk_rva: analysis.thunk_rva,
            stack_adjustment: analysis.stack_adjustment,
            padded: analysis.padded,
            is_jmp: analysis.is_jmp,
            prev_instruction: prev,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::tests::build_test_image;

    const THUNK: u64 = 0x2000;
    const THUNK_VALUE: u64 = 0x7FF8_0001_0000;

    /// Write a padded call stub at `at` reading `THUNK` and adding `offset`.
    fn write_stub(image: &mut PeImage, at: u64, offset: u8) {
        // nop; push rax; mov rax,[rsp+8]; lea rax,[rax+1]; mov [rsp+8],rax
        let mut code = vec![
            0x90, 0x50, 0x48, 0x8B, 0x44, 0x24, 0x08, 0x48, 0x8D, 0x40, 0x01, 0x48, 0x89, 0x44,
            0x24, 0x08,
        ];
        let load_end = at + code.len() as u64 + 7;
        let disp = (THUNK as i64 - load_end as i64) as i32;
        code.extend_from_slice(&[0x48, 0x8B, 0x05]);
        code.extend_from_slice(&disp.to_le_bytes());
        code.extend_from_slice(&[0x48, 0x8D, 0x40, offset]); // lea rax, [rax+offset]
        code.extend_from_slice(&[0x48, 0x87, 0x04, 0x24]); // xchg [rsp], rax
        code.push(0xC3); // ret

        image.write_bytes(at, &code).unwrap();
    }

    fn write_call(image: &mut PeImage, at: u64, target: u64) {
        let rel = (target as i64 - (at as i64 + 5)) as i32;
        image.write_bytes(at, &[0xE8]).unwrap();
        image.write_bytes(at + 1, &rel.to_le_bytes()).unwrap();
    }

    fn image() -> PeImage {
        let mut image = PeImage::parse(build_test_image()).unwrap();
        // Fill the code section with int3 so linear decoding stays in sync.
        image.slice_mut(0x1000, 0x800).unwrap().fill(0xCC);
        image.write_bytes(THUNK, &THUNK_VALUE.to_le_bytes()).unwrap();
        write_stub(&mut image, 0x1400, 0x10);
        image
    }

    #[test]
    fn test_finds_padded_call() {
        let mut image = image();
        write_call(&mut image, 0x1000, 0x1400);

        let mut scanner = ImportScanner::new(&image, ScanConfig::default());
        let scan = scanner.scan_all_sections().unwrap();

        assert_eq!(scan.imports.len(), 1);
        let import = scan.imports[&THUNK];
        assert_eq!(import.target_ea, THUNK_VALUE + 0x10);

        assert_eq!(scan.calls.len(), 1);
        let call = &scan.calls[0];
        assert_eq!(call.call_rva, 0x1000);
        assert!(call.padded);
        assert!(!call.is_jmp);
        assert_eq!(call.stack_adjustment, 0);
        assert!(call.prev_instruction.is_none());
        assert_eq!(scan.import_for(call), Some(&import));

        let stats = scanner.stats();
        assert_eq!(stats.candidates, 1);
        assert_eq!(stats.recognized, 1);
    }

    #[test]
    fn test_indirect_call_stub() {
        let mut image = image();
        image.write_bytes(THUNK, &0x1_4000_2000u64.to_le_bytes()).unwrap();

        // nop; mov rax, [rip -> THUNK]; lea rax, [rax+0x10]; call rax
        let disp = (THUNK as i64 - 0x1608) as i32;
        let mut stub = vec![0x90, 0x48, 0x8B, 0x05];
        stub.extend_from_slice(&disp.to_le_bytes());
        stub.extend_from_slice(&[0x48, 0x8D, 0x40, 0x10, 0xFF, 0xD0]);
        image.write_bytes(0x1600, &stub).unwrap();
        write_call(&mut image, 0x1000, 0x1600);

        let scan = ImportScanner::new(&image, ScanConfig::default())
            .scan_all_sections()
            .unwrap();

        assert_eq!(scan.imports.len(), 1);
        assert_eq!(scan.imports[&THUNK].target_ea, 0x1_4000_2010);
        assert_eq!(scan.calls.len(), 1);
        assert_eq!(scan.calls[0].call_rva, 0x1000);
        assert!(!scan.calls[0].padded);
        assert!(!scan.calls[0].is_jmp);
    }

    #[test]
    fn test_jump_stub_skips_junk_byte() {
        let mut image = image();

        // nop; push rax; mov rax, [rip -> THUNK]; mov [rsp+8], rax; pop rax; ret
        let disp = (THUNK as i64 - 0x1609) as i32;
        let mut stub = vec![0x90, 0x50, 0x48, 0x8B, 0x05];
        stub.extend_from_slice(&disp.to_le_bytes());
        stub.extend_from_slice(&[0x48, 0x89, 0x44, 0x24, 0x08, 0x58, 0xC3]);
        image.write_bytes(0x1600, &stub).unwrap();

        // call stub; junk E8; call stub
        write_call(&mut image, 0x1000, 0x1600);
        image.write_bytes(0x1005, &[0xE8]).unwrap();
        write_call(&mut image, 0x1006, 0x1600);

        let scan = ImportScanner::new(&image, ScanConfig::default())
            .scan_all_sections()
            .unwrap();

        assert_eq!(scan.imports.len(), 1);
        assert_eq!(scan.imports[&THUNK].target_ea, THUNK_VALUE);
        let calls: Vec<_> = scan
            .calls
            .iter()
            .map(|c| (c.call_rva, c.is_jmp, c.stack_adjustment))
            .collect();
        assert_eq!(calls, vec![(0x1000, true, 0), (0x1006, true, 0)]);
    }

    #[test]
    fn test_dedup_by_thunk() {
        let mut image = image();
        write_call(&mut image, 0x1000, 0x1400);
        write_call(&mut image, 0x1010, 0x1400);

        let scan = ImportScanner::new(&image, ScanConfig::default())
            .scan_all_sections()
            .unwrap();
        assert_eq!(scan.imports.len(), 1);
        assert_eq!(scan.calls.len(), 2);
        assert_eq!(scan.calls[1].call_rva, 0x1010);
        // The int3 before the second call is its previous instruction.
        assert_eq!(scan.calls[1].prev_instruction.as_ref().map(Insn::address), Some(0x100F));
    }

    #[test]
    fn test_scan_is_idempotent() {
        let mut image = image();
        write_call(&mut image, 0x1000, 0x1400);
        write_call(&mut image, 0x1100, 0x1400);

        let first = ImportScanner::new(&image, ScanConfig::default())
            .scan_all_sections()
            .unwrap();
        let second = ImportScanner::new(&image, ScanConfig::default())
            .scan_all_sections()
            .unwrap();

        assert_eq!(first.imports, second.imports);
        let rvas = |scan: &ImportScan| scan.calls.iter().map(|c| c.call_rva).collect::<Vec<_>>();
        assert_eq!(rvas(&first), rvas(&second));
    }

    #[test]
    fn test_junk_jump_is_skipped() {
        let mut image = image();
        // jmp +1; junk E8 byte; real call
        image.write_bytes(0x1000, &[0xEB, 0x01, 0xE8]).unwrap();
        write_call(&mut image, 0x1003, 0x1400);

        let mut scanner = ImportScanner::new(&image, ScanConfig::default());
        let scan = scanner.scan_all_sections().unwrap();

        assert_eq!(scan.calls.len(), 1);
        assert_eq!(scan.calls[0].call_rva, 0x1003);
        let prev = scan.calls[0].prev_instruction.as_ref().unwrap();
        assert!(prev.is_uncond_jmp());
        assert_eq!(scanner.stats().junk_jumps, 1);
    }

    #[test]
    fn test_call_without_sentinel_is_ignored() {
        let mut image = image();
        write_call(&mut image, 0x1000, 0x1600); // lands on int3

        let mut scanner = ImportScanner::new(&image, ScanConfig::default());
        let scan = scanner.scan_all_sections().unwrap();
        assert!(scan.is_empty());
        assert_eq!(scanner.stats().candidates, 0);
    }

    #[test]
    fn test_unrecognized_stub_is_rejected() {
        let mut image = image();
        image.write_bytes(0x1600, &[0x90, 0xC3]).unwrap(); // nop; ret
        write_call(&mut image, 0x1000, 0x1600);

        let mut scanner = ImportScanner::new(&image, ScanConfig::default());
        let scan = scanner.scan_all_sections().unwrap();
        assert!(scan.is_empty());
        assert_eq!(scanner.stats().rejected, 1);
    }

    #[test]
    fn test_non_code_sections_are_skipped() {
        let mut image = image();
        write_call(&mut image, 0x2800, 0x1400);

        let scan = ImportScanner::new(&image, ScanConfig::default())
            .scan_all_sections()
            .unwrap();
        assert!(scan.is_empty());
    }
}
