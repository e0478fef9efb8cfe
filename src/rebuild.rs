//! Import table reconstruction.
//!
//! Resolved exports are grouped per module and serialized into a conventional
//! import table: hint/name entries, module names and import descriptors go into a
//! new section placed after the last existing section. Thunk arrays are appended
//! to the existing IAT when the space after it is free, otherwise they go into
//! the new section as well.

use crate::error::Result;
use crate::pe::{
    align_up, pod_bytes, DataDirectory, ExportId, ImportDescriptor, PeImage,
    IMAGE_DIRECTORY_ENTRY_IAT, IMAGE_ORDINAL_FLAG64,
};

use std::collections::BTreeMap;
use std::mem::size_of;
use tracing::{debug, trace};

/// Size of one 64-bit thunk.
const THUNK_SIZE: usize = size_of::<u64>();

/// One entry of a serialized table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableEntry {
    /// `IMAGE_IMPORT_BY_NAME`: hint, name, terminator, padded to an even size.
    NamedImport { hint: u16, name: String },
    /// Null-terminated string.
    EmbeddedString(String),
    /// 64-bit thunk: a name rva, or an ordinal with bit 63 set.
    ThunkData(u64),
    ImportDescriptor(ImportDescriptor),
}

impl TableEntry {
    /// Thunk importing `ordinal` by ordinal.
    pub fn ordinal_thunk(ordinal: u32) -> Self {
        TableEntry::ThunkData(IMAGE_ORDINAL_FLAG64 | u64::from(ordinal & 0xFFFF))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            TableEntry::NamedImport { hint, name } => {
                let mut bytes = Vec::with_capacity(name.len() + 4);
                bytes.extend_from_slice(&hint.to_le_bytes());
                bytes.extend_from_slice(name.as_bytes());
                bytes.push(0);
                if bytes.len() % 2 != 0 {
                    bytes.push(0);
                }
                bytes
            }
            TableEntry::EmbeddedString(s) => {
                let mut bytes = s.as_bytes().to_vec();
                bytes.push(0);
                bytes
            }
            TableEntry::ThunkData(value) => value.to_le_bytes().to_vec(),
            TableEntry::ImportDescriptor(descriptor) => pod_bytes(descriptor).to_vec(),
        }
    }
}

/// Entries laid out back to back from a base rva.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SerializedTable {
    pub bytes: Vec<u8>,
    /// Rva of every entry, in input order.
    pub offsets: Vec<u32>,
    /// Rva just past the last entry.
    pub end: u32,
}

/// Serialize `entries` as if placed at `base_rva`.
pub fn serialize_table(entries: &[TableEntry], base_rva: u32) -> SerializedTable {
    let mut table = SerializedTable {
        bytes: Vec::new(),
        offsets: Vec::with_capacity(entries.len()),
        end: base_rva,
    };

    for entry in entries {
        table.offsets.push(base_rva + table.bytes.len() as u32);
        table.bytes.extend_from_slice(&entry.to_bytes());
    }

    table.end = base_rva + table.bytes.len() as u32;
    table
}

/// An export some obfuscated call resolved to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportedExport {
    pub id: ExportId,
    /// Address of the export in the target process.
    pub ea: u64,
}

/// Exports imported from one module.
#[derive(Clone, Debug, Default)]
pub struct ImportModule {
    pub name: String,
    pub exports: Vec<ImportedExport>,
}

/// Result of laying out the rebuilt import table.
#[derive(Clone, Debug)]
pub struct ImportTableLayout {
    /// Rva of the new section.
    pub section_rva: u32,
    /// Contents of the new section.
    pub section_data: Vec<u8>,
    /// New import directory entry.
    pub import_directory: DataDirectory,
    /// Rva of the first thunk array.
    pub thunks_rva: u32,
    /// Serialized thunk arrays.
    pub thunks: Vec<u8>,
    /// The thunks live in the new section instead of after the IAT.
    pub thunks_in_section: bool,
    /// Thunk rva for every imported export address.
    pub thunk_rvas: BTreeMap<u64, u32>,
}

impl ImportTableLayout {
    pub fn thunk_rva_for(&self, export_ea: u64) -> Option<u32> {
        self.thunk_rvas.get(&export_ea).copied()
    }
}

/// Collects resolved exports and lays out a new import table.
#[derive(Clone, Debug, Default)]
pub struct ImportTableBuilder {
    /// Modules keyed by load address.
    modules: BTreeMap<u64, ImportModule>,
}

impl ImportTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn modules(&self) -> impl Iterator<Item = &ImportModule> {
        self.modules.values()
    }

    /// Record `id` (at `ea`) as imported from the module at `module_base`.
    /// Returns false when the export was already recorded.
    pub fn add_export(&mut self, module_base: u64, module_name: &str, id: ExportId, ea: u64) -> bool {
        let module = self.modules.entry(module_base).or_insert_with(|| ImportModule {
            name: module_name.to_string(),
            exports: Vec::new(),
        });

        if module.exports.iter().any(|e| e.ea == ea) {
            return false;
        }
        module.exports.push(ImportedExport { id, ea });
        true
    }

    fn thunk_count(&self) -> usize {
        self.modules.values().map(|m| m.exports.len() + 1).sum()
    }

    /// Whether `len` bytes after the IAT are zero and inside the image.
    fn iat_tail(image: &PeImage, len: usize) -> Result<Option<u32>> {
        let iat = image.data_directory(IMAGE_DIRECTORY_ENTRY_IAT)?;
        if !iat.is_present() {
            return Ok(None);
        }

        let tail = iat.virtual_address + iat.size;
        let Ok(bytes) = image.slice(u64::from(tail), len) else {
            return Ok(None);
        };
        if bytes.iter().any(|&b| b != 0) {
            return Ok(None);
        }

        let first = image.section_index_for_rva(u64::from(tail))?;
        let last = image.section_index_for_rva(u64::from(tail) + len as u64 - 1)?;
        Ok(first.filter(|_| first == last).map(|_| tail))
    }

    /// Lay out the import table for `image`.
    pub fn build(&self, image: &PeImage) -> Result<ImportTableLayout> {
        let section_rva = image.sections_end()?;

        // Hint/name entries.
        let named: Vec<TableEntry> = self
            .modules
            .values()
            .flat_map(|m| m.exports.iter())
            .filter_map(|e| {
                e.id.name.as_ref().map(|name| TableEntry::NamedImport {
                    hint: e.id.hint,
                    name: name.clone(),
                })
            })
            .collect();
        let names = serialize_table(&named, section_rva);

        let module_names: Vec<TableEntry> = self
            .modules
            .values()
            .map(|m| TableEntry::EmbeddedString(m.name.clone()))
            .collect();
        let module_names = serialize_table(&module_names, names.end);

        let existing = image.import_descriptors()?;
        let descriptors_rva = module_names.end;
        let descriptor_count = existing.len() + self.modules.len() + 1;
        let descriptors_end = descriptors_rva + (descriptor_count * size_of::<ImportDescriptor>()) as u32;

        let thunks_len = self.thunk_count() * THUNK_SIZE;
        let (thunks_rva, thunks_in_section) = match Self::iat_tail(image, thunks_len)? {
            Some(tail) if thunks_len > 0 => (tail, false),
            _ => (align_up(descriptors_end as usize, THUNK_SIZE) as u32, true),
        };

        // Thunk arrays, one per module, each null-terminated.
        let mut thunk_entries = Vec::with_capacity(self.thunk_count());
        let mut name_index = 0;
        for module in self.modules.values() {
            for export in &module.exports {
                match export.id.name {
                    Some(_) => {
                        thunk_entries.push(TableEntry::ThunkData(u64::from(names.offsets[name_index])));
                        name_index += 1;
                    }
                    None => thunk_entries.push(TableEntry::ordinal_thunk(export.id.ordinal)),
                }
            }
            thunk_entries.push(TableEntry::ThunkData(0));
        }
        let thunks = serialize_table(&thunk_entries, thunks_rva);

        let mut thunk_rvas = BTreeMap::new();
        let mut descriptors: Vec<TableEntry> =
            existing.into_iter().map(TableEntry::ImportDescriptor).collect();

        let mut index = 0;
        for (module_index, module) in self.modules.values().enumerate() {
            let first_thunk = thunks.offsets[index];
            for export in &module.exports {
                thunk_rvas.insert(export.ea, thunks.offsets[index]);
                index += 1;
            }
            index += 1; // terminator

            descriptors.push(TableEntry::ImportDescriptor(ImportDescriptor {
                original_first_thunk: first_thunk,
                time_date_stamp: 0,
                forwarder_chain: 0,
                name: module_names.offsets[module_index],
                first_thunk,
            }));
            trace!("{}: {} thunks at 0x{:X}", module.name, module.exports.len(), first_thunk);
        }
        descriptors.push(TableEntry::ImportDescriptor(ImportDescriptor::default()));
        let descriptors = serialize_table(&descriptors, descriptors_rva);

        let mut section_data = names.bytes;
        section_data.extend_from_slice(&module_names.bytes);
        section_data.extend_from_slice(&descriptors.bytes);
        if thunks_in_section {
            section_data.resize((thunks_rva - section_rva) as usize, 0);
            section_data.extend_from_slice(&thunks.bytes);
        }

        debug!(
            "import table: {} modules, {} thunks at 0x{:X} ({})",
            self.modules.len(),
            self.thunk_count(),
            thunks_rva,
            if thunks_in_section { "new section" } else { "after IAT" }
        );

        Ok(ImportTableLayout {
            section_rva,
            section_data,
            import_directory: DataDirectory {
                virtual_address: descriptors_rva,
                size: descriptors.end - descriptors_rva,
            },
            thunks_rva,
            thunks: thunks.bytes,
            thunks_in_section,
            thunk_rvas,
        })
    }
}
