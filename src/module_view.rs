//! Local copy of a module mapped in the target process.

use crate::error::Result;
use crate::memory::{ModuleEntry, ProcessMemory};
use crate::pe::{ExportId, PeImage};

use tracing::{debug, trace};

/// A module's image copied out of the target process, kept at virtual layout.
#[derive(Clone, Debug)]
pub struct ModuleView {
    pub process_id: u32,
    /// Module base name, empty when unknown.
    pub module_name: String,
    /// Load address in the target process.
    pub module_base: u64,
    /// Mapped size of the module.
    pub module_size: usize,
    /// Local copy of the image.
    pub image: PeImage,
}

impl ModuleView {
    /// Wrap an image that was already copied.
    pub fn new(
        process_id: u32,
        module_name: impl Into<String>,
        module_base: u64,
        module_size: usize,
        image: PeImage,
    ) -> Self {
        Self {
            process_id,
            module_name: module_name.into(),
            module_base,
            module_size,
            image,
        }
    }

    /// Copy `module` out of `process`.
    pub fn from_process<P: ProcessMemory + ?Sized>(process: &P, module: &ModuleEntry) -> Result<Self> {
        let bytes = process.read(module.base, module.size as usize)?;
        let image = PeImage::parse(bytes)?;

        debug!(
            "fetched {} at 0x{:X} ({} bytes)",
            module.name, module.base, module.size
        );

        Ok(Self::new(
            process.process_id(),
            module.name.clone(),
            module.base,
            module.size as usize,
            image,
        ))
    }

    /// Re-read the remote module into the local copy.
    pub fn fetch<P: ProcessMemory + ?Sized>(&mut self, process: &P) -> Result<()> {
        let bytes = process.read(self.module_base, self.module_size)?;
        self.image = PeImage::parse(bytes)?;
        trace!("refreshed {} from process {}", self.module_name, self.process_id);
        Ok(())
    }

    /// Write the local copy back over the remote module.
    pub fn commit<P: ProcessMemory + ?Sized>(&self, process: &mut P) -> Result<()> {
        let len = self.module_size.min(self.image.len());
        process.write(self.module_base, &self.image.bytes()[..len])?;
        debug!("committed {} bytes to {}", len, self.module_name);
        Ok(())
    }

    /// Whether `ea` lies inside the module.
    #[inline]
    pub fn within_bounds(&self, ea: u64) -> bool {
        ea >= self.module_base && ea < self.module_base + self.module_size as u64
    }

    #[inline]
    pub fn rva_to_ea(&self, rva: u64) -> u64 {
        self.module_base.wrapping_add(rva)
    }

    #[inline]
    pub fn ea_to_rva(&self, ea: u64) -> u64 {
        ea.wrapping_sub(self.module_base)
    }

    /// Export located exactly at `ea`, if any.
    pub fn get_export(&self, ea: u64) -> Option<ExportId> {
        if !self.within_bounds(ea) {
            return None;
        }

        let rva = self.ea_to_rva(ea) as u32;
        match self.image.export_for_rva(rva) {
            Ok(export) => export,
            Err(e) => {
                debug!("export table of {} is unreadable: {}", self.module_name, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySnapshot;
    use crate::pe::tests::build_test_image;
    use crate::pe::{write_pod, DataDirectory, ExportDirectory, IMAGE_DIRECTORY_ENTRY_EXPORT};

    const BASE: u64 = 0x7FF8_0000_0000;

    /// Test image exporting `Beep` at rva 0x1040 and an unnamed function at 0x1050.
    fn exporting_image() -> Vec<u8> {
        let mut image = PeImage::parse(build_test_image()).unwrap();
        let exports = ExportDirectory {
            base: 1,
            number_of_functions: 2,
            number_of_names: 1,
            address_of_functions: 0x2100,
            address_of_names: 0x2110,
            address_of_name_ordinals: 0x2120,
            ..Default::default()
        };
        write_pod(image.bytes_mut(), 0x2000, &exports).unwrap();
        image.write_bytes(0x2100, &0x1040u32.to_le_bytes()).unwrap();
        image.write_bytes(0x2104, &0x1050u32.to_le_bytes()).unwrap();
        image.write_bytes(0x2110, &0x2130u32.to_le_bytes()).unwrap();
        image.write_bytes(0x2120, &0u16.to_le_bytes()).unwrap();
        image.write_bytes(0x2130, b"Beep\0").unwrap();
        image
            .set_data_directory(
                IMAGE_DIRECTORY_ENTRY_EXPORT,
                DataDirectory { virtual_address: 0x2000, size: 0x200 },
            )
            .unwrap();
        image.into_bytes()
    }

    fn process() -> MemorySnapshot {
        MemorySnapshot::new(7, r"C:\app.exe").with_module("kernel32.dll", BASE, exporting_image())
    }

    #[test]
    fn test_fetch_and_exports() {
        let process = process();
        let module = process.find_module("kernel32.dll").unwrap();
        let view = ModuleView::from_process(&process, &module).unwrap();

        assert_eq!(view.process_id, 7);
        assert!(view.within_bounds(BASE));
        assert!(!view.within_bounds(BASE + 0x3000));
        assert_eq!(view.ea_to_rva(view.rva_to_ea(0x1040)), 0x1040);

        let beep = view.get_export(BASE + 0x1040).unwrap();
        assert_eq!(beep.name.as_deref(), Some("Beep"));
        assert_eq!(beep.ordinal, 1);

        let unnamed = view.get_export(BASE + 0x1050).unwrap();
        assert_eq!(unnamed.name, None);
        assert_eq!(unnamed.ordinal, 2);

        assert!(view.get_export(BASE + 0x1044).is_none());
        assert!(view.get_export(0x1040).is_none());
    }

    #[test]
    fn test_commit_round_trip() {
        let mut process = process();
        let module = process.find_module("kernel32.dll").unwrap();
        let mut view = ModuleView::from_process(&process, &module).unwrap();

        view.image.write_bytes(0x1000, &[0xC3]).unwrap();
        view.commit(&mut process).unwrap();
        assert_eq!(process.read(BASE + 0x1000, 1).unwrap(), vec![0xC3]);

        process.write(BASE + 0x1001, &[0xCC]).unwrap();
        view.fetch(&process).unwrap();
        assert_eq!(view.image.slice(0x1000, 2).unwrap(), &[0xC3, 0xCC]);
    }
}
