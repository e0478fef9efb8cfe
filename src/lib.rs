//! # vmpdump
//!
//! Import table recovery for x86-64 modules protected with VMProtect.
//!
//! ## Overview
//!
//! VMProtect replaces calls through the import address table with calls into
//! small obfuscated stubs. Each stub computes the import's address from a
//! constant pool and jumps to it, after adjusting the stack so the call looks
//! like it came from the original site. This crate:
//!
//! 1. Copies the protected module out of a live process
//! 2. Scans its code for `call stub; <pad>` sequences
//! 3. Symbolically executes each stub to recover the import it resolves to
//! 4. Maps every import to a module export and builds a fresh import table
//! 5. Rewrites each stub call as `call [thunk]` or `jmp [thunk]`
//! 6. Emits the module in file layout with the import table in a new section
//!
//! The process is accessed through [`ProcessMemory`], implemented for live
//! processes on Windows by [`RemoteProcess`] and for in-memory images by
//! [`MemorySnapshot`].

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![allow(clippy::too_many_arguments)]

pub mod error;
pub mod insn;
pub mod disasm;
pub mod lift;
pub mod stub;
pub mod pe;
pub mod memory;
pub mod module_view;
pub mod scanner;
pub mod patcher;
pub mod rebuild;
pub mod dumper;

pub use error::{Error, Result};
pub use dumper::{DumpConfig, DumpReport, ProgressCallback, ProgressInfo, ProgressStage, VmpDump};
pub use memory::{MemorySnapshot, ModuleEntry, ProcessMemory};
#[cfg(target_os = "windows")]
pub use memory::RemoteProcess;
pub use module_view::ModuleView;
pub use pe::PeImage;
pub use scanner::{ImportScan, ImportScanner, ScanConfig};
