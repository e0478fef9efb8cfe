//! PE format types and a byte-buffer image.
//!
//! [`PeImage`] wraps a module image whose sections are laid out at their virtual
//! addresses, which is both how a module looks in memory and how the dumped file is
//! written (raw pointers equal virtual addresses). All header access is
//! bounds-checked and tolerant of unaligned fields.

use crate::error::{Error, Result};

use std::mem::size_of;

// PE format constants
pub const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
pub const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
pub const MACHINE_AMD64: u16 = 0x8664;
pub const OPTIONAL_HDR64_MAGIC: u16 = 0x020B;

// File characteristics
pub const IMAGE_FILE_RELOCS_STRIPPED: u16 = 0x0001;

// Section characteristics
pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

/// Characteristics a section must have to be scanned for import calls.
pub const CODE_SECTION_CHARACTERISTICS: u32 =
    IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ;

/// Characteristics of the section holding the rebuilt import table.
pub const IMPORT_SECTION_CHARACTERISTICS: u32 =
    IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ;

// Data directory indices
pub const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;
pub const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;
pub const IMAGE_DIRECTORY_ENTRY_IAT: usize = 12;
pub const IMAGE_NUMBEROF_DIRECTORY_ENTRIES: usize = 16;

/// Bit marking a 64-bit thunk as an ordinal import.
pub const IMAGE_ORDINAL_FLAG64: u64 = 1 << 63;

/// Header structs that can be copied to and from raw bytes.
///
/// # Safety
/// Implementors must be `#[repr(C, packed)]`, contain only integers and integer
/// arrays, and therefore be valid for every bit pattern.
pub unsafe trait Pod: Copy {}

unsafe impl Pod for DosHeader {}
unsafe impl Pod for FileHeader {}
unsafe impl Pod for DataDirectory {}
unsafe impl Pod for OptionalHeader64 {}
unsafe impl Pod for SectionHeader {}
unsafe impl Pod for ExportDirectory {}
unsafe impl Pod for ImportDescriptor {}

/// Read a header struct at `offset`.
pub fn read_pod<T: Pod>(bytes: &[u8], offset: usize) -> Result<T> {
    let size = size_of::<T>();
    let src = offset
        .checked_add(size)
        .and_then(|end| bytes.get(offset..end))
        .ok_or(Error::RvaOutOfBounds {
            rva: offset as u64,
            size,
        })?;

    // SAFETY: `src` holds exactly size_of::<T>() bytes and T is valid for any bits.
    Ok(unsafe { std::ptr::read_unaligned(src.as_ptr() as *const T) })
}

/// Write a header struct at `offset`.
pub fn write_pod<T: Pod>(bytes: &mut [u8], offset: usize, value: &T) -> Result<()> {
    let size = size_of::<T>();
    let dst = offset
        .checked_add(size)
        .and_then(|end| bytes.get_mut(offset..end))
        .ok_or(Error::RvaOutOfBounds {
            rva: offset as u64,
            size,
        })?;
    dst.copy_from_slice(pod_bytes(value));
    Ok(())
}

/// Raw bytes of a header struct.
pub fn pod_bytes<T: Pod>(value: &T) -> &[u8] {
    // SAFETY: T is packed plain data, so every byte is initialized.
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) }
}

/// DOS header (64 bytes).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct DosHeader {
    pub e_magic: u16,
    pub e_cblp: u16,
    pub e_cp: u16,
    pub e_crlc: u16,
    pub e_cparhdr: u16,
    pub e_minalloc: u16,
    pub e_maxalloc: u16,
    pub e_ss: u16,
    pub e_sp: u16,
    pub e_csum: u16,
    pub e_ip: u16,
    pub e_cs: u16,
    pub e_lfarlc: u16,
    pub e_ovno: u16,
    pub e_res: [u16; 4],
    pub e_oemid: u16,
    pub e_oeminfo: u16,
    pub e_res2: [u16; 10],
    pub e_lfanew: i32, // File address of new exe header (PE offset)
}

/// COFF file header (20 bytes).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct FileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// Data directory entry.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

impl DataDirectory {
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0 && self.size != 0
    }
}

/// Optional header (PE32+, 64-bit), without the data directories.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct OptionalHeader64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    // Data directories follow (typically 16)
}

/// Section header (40 bytes).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

impl SectionHeader {
    /// Get the section name as a string (trimmed of null bytes).
    pub fn name_str(&self) -> &str {
        let name_slice = &self.name;
        let end = name_slice.iter().position(|&b| b == 0).unwrap_or(8);
        std::str::from_utf8(&name_slice[..end]).unwrap_or("")
    }

    /// Create a new section header with the given name.
    pub fn new(name: &str) -> Self {
        let mut header = Self {
            name: [0; 8],
            virtual_size: 0,
            virtual_address: 0,
            size_of_raw_data: 0,
            pointer_to_raw_data: 0,
            pointer_to_relocations: 0,
            pointer_to_linenumbers: 0,
            number_of_relocations: 0,
            number_of_linenumbers: 0,
            characteristics: 0,
        };
        let name_bytes = name.as_bytes();
        let len = name_bytes.len().min(8);
        header.name[..len].copy_from_slice(&name_bytes[..len]);
        header
    }

    /// Whether `rva` falls inside the section's virtual extent.
    pub fn contains_rva(&self, rva: u64) -> bool {
        let start = u64::from(self.virtual_address);
        let size = u64::from(self.virtual_size.max(self.size_of_raw_data));
        rva >= start && rva < start + size
    }

    pub fn has_characteristics(&self, mask: u32) -> bool {
        self.characteristics & mask == mask
    }
}

/// Export directory (40 bytes).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ExportDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub name: u32,
    pub base: u32,
    pub number_of_functions: u32,
    pub number_of_names: u32,
    pub address_of_functions: u32,
    pub address_of_names: u32,
    pub address_of_name_ordinals: u32,
}

/// Import descriptor (20 bytes).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImportDescriptor {
    pub original_first_thunk: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    pub name: u32,
    pub first_thunk: u32,
}

impl ImportDescriptor {
    pub fn is_null(&self) -> bool {
        *self == Self::default()
    }
}

/// How a module exports a function.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExportId {
    /// Exported name, `None` for ordinal-only exports.
    pub name: Option<String>,
    /// Biased ordinal.
    pub ordinal: u32,
    /// Index into the export name table, used as the import hint.
    pub hint: u16,
}

/// File and optional header of an image.
#[derive(Clone, Copy, Debug)]
pub struct NtHeaders {
    pub file: FileHeader,
    pub optional: OptionalHeader64,
}

/// Align a value up to the given power-of-two alignment.
#[inline]
pub fn align_up(value: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

// ============================================================================
// Image
// ============================================================================

/// A 64-bit PE image held in a byte buffer at virtual layout.
#[derive(Clone, Debug)]
pub struct PeImage {
    bytes: Vec<u8>,
    nt_offset: usize,
}

impl PeImage {
    /// Validate the headers of `bytes` and wrap it.
    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < size_of::<DosHeader>() {
            return Err(Error::HeadersTooSmall {
                expected: size_of::<DosHeader>(),
                actual: bytes.len(),
            });
        }

        let dos: DosHeader = read_pod(&bytes, 0)?;
        if dos.e_magic != DOS_MAGIC {
            return Err(Error::InvalidDosSignature(0));
        }

        let nt_offset = dos.e_lfanew as u32 as usize;
        let min_size = nt_offset + 4 + size_of::<FileHeader>() + size_of::<OptionalHeader64>();
        if bytes.len() < min_size {
            return Err(Error::HeadersTooSmall {
                expected: min_size,
                actual: bytes.len(),
            });
        }

        let signature = u32::from_le_bytes([
            bytes[nt_offset],
            bytes[nt_offset + 1],
            bytes[nt_offset + 2],
            bytes[nt_offset + 3],
        ]);
        if signature != PE_SIGNATURE {
            return Err(Error::InvalidPeSignature(nt_offset));
        }

        let file: FileHeader = read_pod(&bytes, nt_offset + 4)?;
        let machine = file.machine;
        if machine != MACHINE_AMD64 {
            return Err(Error::UnsupportedMachine(machine));
        }

        let image = Self { bytes, nt_offset };
        let optional = image.optional_header()?;
        if optional.magic != OPTIONAL_HDR64_MAGIC {
            return Err(Error::UnsupportedMachine(machine));
        }

        let table_end = image.section_table_offset()
            + usize::from(file.number_of_sections) * size_of::<SectionHeader>();
        if image.bytes.len() < table_end {
            return Err(Error::HeadersTooSmall {
                expected: table_end,
                actual: image.bytes.len(),
            });
        }

        Ok(image)
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn file_header_offset(&self) -> usize {
        self.nt_offset + 4
    }

    fn optional_header_offset(&self) -> usize {
        self.file_header_offset() + size_of::<FileHeader>()
    }

    fn data_directory_offset(&self, index: usize) -> usize {
        self.optional_header_offset()
            + size_of::<OptionalHeader64>()
            + index * size_of::<DataDirectory>()
    }

    fn section_table_offset(&self) -> usize {
        // The header was validated in `parse`, so this read cannot fail.
        let optional_size = read_pod::<FileHeader>(&self.bytes, self.file_header_offset())
            .map(|f| f.size_of_optional_header)
            .unwrap_or(0);
        self.optional_header_offset() + usize::from(optional_size)
    }

    pub fn file_header(&self) -> Result<FileHeader> {
        read_pod(&self.bytes, self.file_header_offset())
    }

    pub fn set_file_header(&mut self, header: &FileHeader) -> Result<()> {
        let offset = self.file_header_offset();
        write_pod(&mut self.bytes, offset, header)
    }

    pub fn optional_header(&self) -> Result<OptionalHeader64> {
        read_pod(&self.bytes, self.optional_header_offset())
    }

    pub fn set_optional_header(&mut self, header: &OptionalHeader64) -> Result<()> {
        let offset = self.optional_header_offset();
        write_pod(&mut self.bytes, offset, header)
    }

    pub fn headers(&self) -> Result<NtHeaders> {
        Ok(NtHeaders {
            file: self.file_header()?,
            optional: self.optional_header()?,
        })
    }

    pub fn data_directory(&self, index: usize) -> Result<DataDirectory> {
        if index >= IMAGE_NUMBEROF_DIRECTORY_ENTRIES {
            return Ok(DataDirectory::default());
        }
        read_pod(&self.bytes, self.data_directory_offset(index))
    }

    pub fn set_data_directory(&mut self, index: usize, directory: DataDirectory) -> Result<()> {
        let offset = self.data_directory_offset(index);
        write_pod(&mut self.bytes, offset, &directory)
    }

    pub fn number_of_sections(&self) -> Result<usize> {
        Ok(usize::from(self.file_header()?.number_of_sections))
    }

    pub fn section(&self, index: usize) -> Result<SectionHeader> {
        if index >= self.number_of_sections()? {
            return Err(Error::InvalidSectionIndex(index));
        }
        let offset = self.section_table_offset() + index * size_of::<SectionHeader>();
        read_pod(&self.bytes, offset)
    }

    pub fn set_section(&mut self, index: usize, header: &SectionHeader) -> Result<()> {
        if index >= self.number_of_sections()? {
            return Err(Error::InvalidSectionIndex(index));
        }
        let offset = self.section_table_offset() + index * size_of::<SectionHeader>();
        write_pod(&mut self.bytes, offset, header)
    }

    pub fn sections(&self) -> Result<Vec<SectionHeader>> {
        (0..self.number_of_sections()?)
            .map(|i| self.section(i))
            .collect()
    }

    /// Index of the section whose virtual extent contains `rva`.
    pub fn section_index_for_rva(&self, rva: u64) -> Result<Option<usize>> {
        Ok(self
            .sections()?
            .iter()
            .position(|section| section.contains_rva(rva)))
    }

    pub fn set_section_virtual_size(&mut self, index: usize, virtual_size: u32) -> Result<()> {
        let mut section = self.section(index)?;
        section.virtual_size = virtual_size;
        self.set_section(index, &section)
    }

    /// Bytes at `[rva, rva + len)`.
    pub fn slice(&self, rva: u64, len: usize) -> Result<&[u8]> {
        usize::try_from(rva)
            .ok()
            .and_then(|start| self.bytes.get(start..start.checked_add(len)?))
            .ok_or(Error::RvaOutOfBounds { rva, size: len })
    }

    pub fn slice_mut(&mut self, rva: u64, len: usize) -> Result<&mut [u8]> {
        usize::try_from(rva)
            .ok()
            .and_then(|start| self.bytes.get_mut(start..start.checked_add(len)?))
            .ok_or(Error::RvaOutOfBounds { rva, size: len })
    }

    pub fn write_bytes(&mut self, rva: u64, data: &[u8]) -> Result<()> {
        self.slice_mut(rva, data.len())?.copy_from_slice(data);
        Ok(())
    }

    pub fn read_u16(&self, rva: u64) -> Result<u16> {
        let b = self.slice(rva, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&self, rva: u64) -> Result<u32> {
        let b = self.slice(rva, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&self, rva: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.slice(rva, 8)?);
        Ok(u64::from_le_bytes(buf))
    }

    /// Null-terminated string at `rva`.
    pub fn read_c_string(&self, rva: u64) -> Result<String> {
        let start = usize::try_from(rva)
            .ok()
            .filter(|&s| s < self.bytes.len())
            .ok_or(Error::RvaOutOfBounds { rva, size: 1 })?;
        let tail = &self.bytes[start..];
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::RvaOutOfBounds {
                rva,
                size: tail.len() + 1,
            })?;
        Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
    }

    /// Rva at which the last section ends, rounded up to the section alignment.
    pub fn sections_end(&self) -> Result<u32> {
        let optional = self.optional_header()?;
        let alignment = optional.section_alignment as usize;

        let end = self
            .sections()?
            .iter()
            .map(|s| align_up(s.virtual_address as usize + s.virtual_size as usize, alignment))
            .max()
            .unwrap_or_else(|| align_up(optional.size_of_headers as usize, alignment));
        Ok(end as u32)
    }

    /// Import descriptors of the current import directory, stopping at the null entry.
    pub fn import_descriptors(&self) -> Result<Vec<ImportDescriptor>> {
        let directory = self.data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT)?;
        if !directory.is_present() {
            return Ok(Vec::new());
        }

        let count = directory.size as usize / size_of::<ImportDescriptor>();
        let mut descriptors = Vec::with_capacity(count);
        for i in 0..count {
            let offset = directory.virtual_address as usize + i * size_of::<ImportDescriptor>();
            let descriptor: ImportDescriptor = read_pod(&self.bytes, offset)?;
            if descriptor.is_null() {
                break;
            }
            descriptors.push(descriptor);
        }
        Ok(descriptors)
    }

    /// Look up the export whose function rva is `rva`.
    pub fn export_for_rva(&self, rva: u32) -> Result<Option<ExportId>> {
        let directory = self.data_directory(IMAGE_DIRECTORY_ENTRY_EXPORT)?;
        if !directory.is_present() {
            return Ok(None);
        }

        let exports: ExportDirectory = read_pod(&self.bytes, directory.virtual_address as usize)?;
        let functions = u64::from(exports.address_of_functions);
        let names = u64::from(exports.address_of_names);
        let name_ordinals = u64::from(exports.address_of_name_ordinals);

        let mut function_index = None;
        for i in 0..u64::from(exports.number_of_functions) {
            if self.read_u32(functions + i * 4)? == rva {
                function_index = Some(i as u32);
                break;
            }
        }
        let Some(function_index) = function_index else {
            return Ok(None);
        };

        let ordinal = exports.base.wrapping_add(function_index);

        for i in 0..u64::from(exports.number_of_names) {
            if u32::from(self.read_u16(name_ordinals + i * 2)?) == function_index {
                let name_rva = self.read_u32(names + i * 4)?;
                return Ok(Some(ExportId {
                    name: Some(self.read_c_string(u64::from(name_rva))?),
                    ordinal,
                    hint: i as u16,
                }));
            }
        }

        Ok(Some(ExportId {
            name: None,
            ordinal,
            hint: 0,
        }))
    }

    /// Convert to file layout. Sections keep their virtual addresses as raw pointers,
    /// which is what packed images need since their raw data is often empty.
    pub fn to_raw_image(&self) -> Result<PeImage> {
        let optional = self.optional_header()?;
        let alignment = optional.section_alignment as usize;
        let headers_size = (optional.size_of_headers as usize).min(self.bytes.len());
        let sections = self.sections()?;

        let mut raw = self.bytes[..headers_size].to_vec();
        for section in &sections {
            let start = section.virtual_address as usize;
            let size = section.virtual_size as usize;
            let end = align_up(start + size, alignment);
            if raw.len() < end {
                raw.resize(end, 0);
            }

            let available = self.bytes.len().saturating_sub(start).min(size);
            if available > 0 {
                raw[start..start + available].copy_from_slice(&self.bytes[start..start + available]);
            }
        }

        let mut image = PeImage {
            bytes: raw,
            nt_offset: self.nt_offset,
        };
        for (index, mut section) in sections.into_iter().enumerate() {
            section.pointer_to_raw_data = section.virtual_address;
            section.size_of_raw_data = align_up(section.virtual_size as usize, alignment) as u32;
            image.set_section(index, &section)?;
        }
        Ok(image)
    }

    /// Append a section holding `data` at virtual address `va`. Returns its index.
    pub fn add_section(
        &mut self,
        name: &str,
        data: &[u8],
        va: u32,
        characteristics: u32,
    ) -> Result<usize> {
        let mut headers = self.headers()?;
        let file_alignment = headers.optional.file_alignment as usize;
        let section_alignment = headers.optional.section_alignment as usize;

        let index = usize::from(headers.file.number_of_sections);
        let table_end = self.section_table_offset() + (index + 1) * size_of::<SectionHeader>();
        if table_end > headers.optional.size_of_headers as usize {
            return Err(Error::NoSectionHeaderSpace(headers.optional.size_of_headers));
        }

        let pointer = align_up(self.bytes.len(), file_alignment);
        let raw_size = align_up(data.len(), file_alignment);
        self.bytes.resize(pointer, 0);
        self.bytes.extend_from_slice(data);
        self.bytes.resize(pointer + raw_size, 0);

        let mut section = SectionHeader::new(name);
        section.virtual_size = data.len() as u32;
        section.virtual_address = va;
        section.size_of_raw_data = raw_size as u32;
        section.pointer_to_raw_data = pointer as u32;
        section.characteristics = characteristics;

        headers.file.number_of_sections += 1;
        self.set_file_header(&headers.file)?;
        self.set_section(index, &section)?;

        let image_end = align_up(va as usize + data.len(), section_alignment) as u32;
        if headers.optional.size_of_image < image_end {
            headers.optional.size_of_image = image_end;
            self.set_optional_header(&headers.optional)?;
        }

        Ok(index)
    }

    pub fn set_entry_point(&mut self, rva: u32) -> Result<()> {
        let mut optional = self.optional_header()?;
        optional.address_of_entry_point = rva;
        self.set_optional_header(&optional)
    }

    pub fn set_relocs_stripped(&mut self) -> Result<()> {
        let mut file = self.file_header()?;
        file.characteristics |= IMAGE_FILE_RELOCS_STRIPPED;
        self.set_file_header(&file)
    }
}
