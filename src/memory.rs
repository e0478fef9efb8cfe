//! Target process memory access.
//!
//! [`ProcessMemory`] is the seam between the dumper and the process it works on.
//! [`RemoteProcess`] implements it for a live Windows process; [`MemorySnapshot`]
//! implements it over module images held in memory, which is what the tests and
//! offline runs use.

use crate::error::{Error, Result};

#[cfg(target_os = "windows")]
use tracing::{debug, trace};

#[cfg(target_os = "windows")]
use windows::Win32::{
    Foundation::{CloseHandle, HANDLE, HMODULE},
    System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory},
    System::Memory::{VirtualProtectEx, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS},
    System::ProcessStatus::{EnumProcessModules, GetModuleBaseNameA, GetModuleInformation, MODULEINFO},
    System::Threading::{
        OpenProcess, QueryFullProcessImageNameA, PROCESS_ALL_ACCESS, PROCESS_NAME_WIN32,
    },
};

/// Maximum number of modules enumerated in a process.
pub const MAX_MODULES: usize = 1024;

/// A module loaded in the target process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleEntry {
    /// Base name, e.g. `kernel32.dll`.
    pub name: String,
    /// Load address.
    pub base: u64,
    /// Size of the mapped image.
    pub size: u32,
}

impl ModuleEntry {
    /// Whether `ea` lies within `[base, base + size)`.
    #[inline]
    pub fn contains(&self, ea: u64) -> bool {
        ea >= self.base && ea < self.base + u64::from(self.size)
    }
}

/// File name component of a process image path.
pub fn image_file_name(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

/// Read, write and enumerate modules of a target process.
pub trait ProcessMemory {
    fn process_id(&self) -> u32;

    /// Full path of the process image.
    fn image_path(&self) -> Result<String>;

    /// Modules loaded in the process.
    fn modules(&self) -> Result<Vec<ModuleEntry>>;

    /// Read exactly `size` bytes at `address`.
    fn read(&self, address: u64, size: usize) -> Result<Vec<u8>>;

    /// Write all of `data` at `address`, regardless of page protection.
    fn write(&mut self, address: u64, data: &[u8]) -> Result<()>;

    /// Find a module by name. An empty name selects the process image itself,
    /// matched case-insensitively against the image file name.
    fn find_module(&self, name: &str) -> Result<ModuleEntry> {
        let modules = self.modules()?;

        let found = if name.is_empty() {
            let path = self.image_path()?;
            let image_name = image_file_name(&path);
            modules
                .into_iter()
                .find(|m| m.name.eq_ignore_ascii_case(image_name))
        } else {
            modules.into_iter().find(|m| m.name == name)
        };

        found.ok_or_else(|| Error::ModuleNotFound(name.to_string()))
    }

    /// Module whose image contains `ea`.
    fn module_containing(&self, ea: u64) -> Result<Option<ModuleEntry>> {
        Ok(self.modules()?.into_iter().find(|m| m.contains(ea)))
    }
}

// ============================================================================
// Live process (Windows)
// ============================================================================

/// A process opened for full access.
#[cfg(target_os = "windows")]
pub struct RemoteProcess {
    process_id: u32,
    handle: HANDLE,
}

#[cfg(target_os = "windows")]
impl RemoteProcess {
    /// Open `process_id` with full access rights.
    pub fn open(process_id: u32) -> Result<Self> {
        let handle = unsafe { OpenProcess(PROCESS_ALL_ACCESS, false, process_id) }
            .map_err(|_| Error::ProcessOpenFailed(process_id))?;

        debug!("opened process {} (handle {:?})", process_id, handle);
        Ok(Self { process_id, handle })
    }

    pub fn handle(&self) -> HANDLE {
        self.handle
    }
}

#[cfg(target_os = "windows")]
impl Drop for RemoteProcess {
    fn drop(&mut self) {
        let _ = unsafe { CloseHandle(self.handle) };
    }
}

#[cfg(target_os = "windows")]
impl ProcessMemory for RemoteProcess {
    fn process_id(&self) -> u32 {
        self.process_id
    }

    fn image_path(&self) -> Result<String> {
        let mut buffer = [0u8; 1024];
        let mut size = buffer.len() as u32;

        unsafe {
            QueryFullProcessImageNameA(
                self.handle,
                PROCESS_NAME_WIN32,
                windows::core::PSTR(buffer.as_mut_ptr()),
                &mut size,
            )?;
        }

        Ok(String::from_utf8_lossy(&buffer[..size as usize]).into_owned())
    }

    fn modules(&self) -> Result<Vec<ModuleEntry>> {
        let mut handles = vec![HMODULE::default(); MAX_MODULES];
        let mut needed: u32 = 0;

        unsafe {
            EnumProcessModules(
                self.handle,
                handles.as_mut_ptr(),
                (handles.len() * std::mem::size_of::<HMODULE>()) as u32,
                &mut needed,
            )?;
        }

        let count = (needed as usize / std::mem::size_of::<HMODULE>()).min(MAX_MODULES);
        let mut modules = Vec::with_capacity(count);

        for module in handles.iter().take(count) {
            let mut name = [0u8; 260];
            let mut info = MODULEINFO::default();

            let len = unsafe {
                GetModuleInformation(
                    self.handle,
                    *module,
                    &mut info,
                    std::mem::size_of::<MODULEINFO>() as u32,
                )?;
                GetModuleBaseNameA(self.handle, Some(*module), &mut name)
            };

            modules.push(ModuleEntry {
                name: String::from_utf8_lossy(&name[..len as usize]).into_owned(),
                base: info.lpBaseOfDll as u64,
                size: info.SizeOfImage,
            });
        }

        trace!("process {} has {} modules", self.process_id, modules.len());
        Ok(modules)
    }

    fn read(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; size];
        if size == 0 {
            return Ok(buffer);
        }

        let mut bytes_read: usize = 0;
        let ok = unsafe {
            ReadProcessMemory(
                self.handle,
                address as *const _,
                buffer.as_mut_ptr() as *mut _,
                size,
                Some(&mut bytes_read),
            )
            .is_ok()
                && bytes_read == size
        };

        if !ok {
            return Err(Error::MemoryReadFailed { addr: address, size });
        }
        Ok(buffer)
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut old_protect = PAGE_PROTECTION_FLAGS::default();
        let mut bytes_written: usize = 0;

        let ok = unsafe {
            VirtualProtectEx(
                self.handle,
                address as *const _,
                data.len(),
                PAGE_EXECUTE_READWRITE,
                &mut old_protect,
            )
            .is_ok()
                && WriteProcessMemory(
                    self.handle,
                    address as *const _,
                    data.as_ptr() as *const _,
                    data.len(),
                    Some(&mut bytes_written),
                )
                .is_ok()
                && bytes_written == data.len()
        };

        // Restore whatever protection was there, even after a failed write.
        if old_protect != PAGE_PROTECTION_FLAGS::default() {
            let mut ignored = PAGE_PROTECTION_FLAGS::default();
            let _ = unsafe {
                VirtualProtectEx(
                    self.handle,
                    address as *const _,
                    data.len(),
                    old_protect,
                    &mut ignored,
                )
            };
        }

        if !ok {
            return Err(Error::MemoryWriteFailed {
                addr: address,
                size: data.len(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// In-memory snapshot
// ============================================================================

/// Module images captured from (or built to look like) a process.
#[derive(Clone, Debug, Default)]
pub struct MemorySnapshot {
    process_id: u32,
    image_path: String,
    modules: Vec<(ModuleEntry, Vec<u8>)>,
}

impl MemorySnapshot {
    pub fn new(process_id: u32, image_path: impl Into<String>) -> Self {
        Self {
            process_id,
            image_path: image_path.into(),
            modules: Vec::new(),
        }
    }

    /// Map `image` as module `name` at `base`.
    pub fn with_module(mut self, name: impl Into<String>, base: u64, image: Vec<u8>) -> Self {
        self.add_module(name, base, image);
        self
    }

    pub fn add_module(&mut self, name: impl Into<String>, base: u64, image: Vec<u8>) {
        let entry = ModuleEntry {
            name: name.into(),
            base,
            size: image.len() as u32,
        };
        self.modules.push((entry, image));
    }

    /// Current bytes of the module loaded at `base`.
    pub fn module_image(&self, base: u64) -> Option<&[u8]> {
        self.modules
            .iter()
            .find(|(entry, _)| entry.base == base)
            .map(|(_, image)| image.as_slice())
    }

    fn locate(&self, address: u64, size: usize) -> Option<(usize, usize)> {
        self.modules.iter().enumerate().find_map(|(index, (entry, image))| {
            let offset = usize::try_from(address.checked_sub(entry.base)?).ok()?;
            (offset.checked_add(size)? <= image.len()).then_some((index, offset))
        })
    }
}

impl ProcessMemory for MemorySnapshot {
    fn process_id(&self) -> u32 {
        self.process_id
    }

    fn image_path(&self) -> Result<String> {
        Ok(self.image_path.clone())
    }

    fn modules(&self) -> Result<Vec<ModuleEntry>> {
        Ok(self.modules.iter().map(|(entry, _)| entry.clone()).collect())
    }

    fn read(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let (index, offset) = self
            .locate(address, size)
            .ok_or(Error::MemoryReadFailed { addr: address, size })?;
        Ok(self.modules[index].1[offset..offset + size].to_vec())
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let (index, offset) = self
            .locate(address, data.len())
            .ok_or(Error::MemoryWriteFailed {
                addr: address,
                size: data.len(),
            })?;
        self.modules[index].1[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MemorySnapshot {
        MemorySnapshot::new(42, r"C:\Games\Target.exe")
            .with_module("Target.exe", 0x1_4000_0000, vec![0xCC; 0x2000])
            .with_module("KERNEL32.DLL", 0x7FF8_0000_0000, vec![0; 0x1000])
    }

    #[test]
    fn test_image_file_name() {
        assert_eq!(image_file_name(r"C:\Games\Target.exe"), "Target.exe");
        assert_eq!(image_file_name("/tmp/target"), "target");
        assert_eq!(image_file_name("plain.exe"), "plain.exe");
    }

    #[test]
    fn test_find_module() {
        let process = snapshot();

        let main = process.find_module("").unwrap();
        assert_eq!(main.base, 0x1_4000_0000);

        let kernel = process.find_module("KERNEL32.DLL").unwrap();
        assert_eq!(kernel.size, 0x1000);

        // Named lookups are exact.
        assert!(matches!(
            process.find_module("kernel32.dll"),
            Err(Error::ModuleNotFound(_))
        ));
    }

    #[test]
    fn test_main_module_match_ignores_case() {
        let process = MemorySnapshot::new(1, r"C:\APP\GAME.EXE").with_module("game.exe", 0x1000, vec![0; 16]);
        assert_eq!(process.find_module("").unwrap().name, "game.exe");
    }

    #[test]
    fn test_module_containing() {
        let process = snapshot();
        let found = process.module_containing(0x7FF8_0000_0FFF).unwrap().unwrap();
        assert_eq!(found.name, "KERNEL32.DLL");
        assert!(process.module_containing(0x7FF8_0000_1000).unwrap().is_none());
    }

    #[test]
    fn test_read_write() {
        let mut process = snapshot();
        process.write(0x1_4000_1000, &[1, 2, 3]).unwrap();
        assert_eq!(process.read(0x1_4000_0FFF, 4).unwrap(), vec![0xCC, 1, 2, 3]);

        // Reads and writes must not run past the module.
        assert!(matches!(
            process.read(0x1_4000_1FFF, 2),
            Err(Error::MemoryReadFailed { .. })
        ));
        assert!(matches!(
            process.write(0x1000, &[0]),
            Err(Error::MemoryWriteFailed { .. })
        ));
    }
}
