//! Error types for vmpdump.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort a dump run.
///
/// Per-call-site problems (decode desync, unrecognized stubs, patches that do not
/// fit) have their own local error types and never surface here.
#[derive(Error, Debug)]
pub enum Error {
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("failed to open process {0} (0x{0:X})")]
    ProcessOpenFailed(u32),

    #[error("invalid DOS signature at offset 0x{0:X}")]
    InvalidDosSignature(usize),

    #[error("invalid PE signature at offset 0x{0:X}")]
    InvalidPeSignature(usize),

    #[error("unsupported machine type: 0x{0:X}")]
    UnsupportedMachine(u16),

    #[error("failed to read memory at 0x{addr:X} (size: {size})")]
    MemoryReadFailed { addr: u64, size: usize },

    #[error("failed to write memory at 0x{addr:X} (size: {size})")]
    MemoryWriteFailed { addr: u64, size: usize },

    #[error("PE headers too small: expected {expected}, got {actual}")]
    HeadersTooSmall { expected: usize, actual: usize },

    #[error("RVA 0x{rva:X} (size: {size}) is outside the image")]
    RvaOutOfBounds { rva: u64, size: usize },

    #[error("invalid section index: {0}")]
    InvalidSectionIndex(usize),

    #[error("no room for another section header (headers end at 0x{0:X})")]
    NoSectionHeaderSpace(u32),

    #[error("output file creation failed: {0}")]
    OutputCreationFailed(String),

    #[error("output file write failed: {0}")]
    OutputWriteFailed(String),

    #[cfg(target_os = "windows")]
    #[error("windows API error: {0}")]
    WindowsApi(#[from] windows::core::Error),
}
