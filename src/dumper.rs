//! Main dump pipeline.
//!
//! This module ties together all components to rebuild a protected module:
//! 1. Copy the target module out of the process
//! 2. Scan its code sections for import stub calls
//! 3. Resolve every import to a module export
//! 4. Lay out a new import table
//! 5. Convert the stub calls to calls through the new thunks
//! 6. Build the raw output PE with the import section appended

use crate::error::{Error, Result};
use crate::memory::ProcessMemory;
use crate::module_view::ModuleView;
use crate::patcher::{CallPatcher, CodePatch, PatchError, TrampolineCache};
use crate::pe::{
    PeImage, IMAGE_DIRECTORY_ENTRY_IAT, IMAGE_DIRECTORY_ENTRY_IMPORT,
    IMPORT_SECTION_CHARACTERISTICS, IMAGE_SCN_MEM_WRITE,
};
use crate::rebuild::{ImportTableBuilder, ImportTableLayout};
use crate::scanner::{ImportCall, ImportScan, ImportScanner, ScanConfig, ScanStats};

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Name of the section holding the rebuilt import table.
pub const IMPORT_SECTION_NAME: &str = ".vmpdmp";

/// Progress stage during dump operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressStage {
    Initializing,
    ScanningImports,
    ResolvingExports,
    BuildingImports,
    ConvertingCalls,
    BuildingOutput,
    WritingFile,
    Complete,
}

impl ProgressStage {
    /// Get a human-readable name for the stage.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::ScanningImports => "Scanning for import calls",
            Self::ResolvingExports => "Resolving exports",
            Self::BuildingImports => "Building import table",
            Self::ConvertingCalls => "Converting calls",
            Self::BuildingOutput => "Building output PE",
            Self::WritingFile => "Writing file",
            Self::Complete => "Complete",
        }
    }
}

/// Progress information during dump.
#[derive(Clone, Debug)]
pub struct ProgressInfo {
    /// Current stage.
    pub stage: ProgressStage,
    /// Current item being processed (e.g., section or module name).
    pub current_item: Option<String>,
    /// Current progress (item count).
    pub current: usize,
    /// Total items.
    pub total: usize,
    /// Imports found so far.
    pub imports_found: usize,
    /// Import calls found so far.
    pub calls_found: usize,
    /// Calls converted so far.
    pub calls_converted: usize,
}

impl Default for ProgressInfo {
    fn default() -> Self {
        Self {
            stage: ProgressStage::Initializing,
            current_item: None,
            current: 0,
            total: 0,
            imports_found: 0,
            calls_found: 0,
            calls_converted: 0,
        }
    }
}

/// Progress callback type.
pub type ProgressCallback = Box<dyn Fn(&ProgressInfo) + Send + Sync>;

/// Configuration for the dump operation.
pub struct DumpConfig {
    /// New entry point rva.
    pub entry_point: Option<u32>,
    /// Mark the output as having its relocations stripped.
    pub disable_relocation: bool,
    /// Name of the appended import section.
    pub section_name: String,
    /// Output path; derived from the process image path when unset.
    pub output: Option<PathBuf>,
    /// Scanner configuration.
    pub scan: ScanConfig,
    /// Progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for DumpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DumpConfig")
            .field("entry_point", &self.entry_point)
            .field("disable_relocation", &self.disable_relocation)
            .field("section_name", &self.section_name)
            .field("output", &self.output)
            .field("scan", &self.scan)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            entry_point: None,
            disable_relocation: false,
            section_name: IMPORT_SECTION_NAME.to_string(),
            output: None,
            scan: ScanConfig::default(),
            progress_callback: None,
        }
    }
}

/// Outcome of a dump.
#[derive(Clone, Debug)]
pub struct DumpReport {
    /// Rebuilt image in file layout.
    pub image: PeImage,
    /// Distinct imports found by the scan.
    pub imports_found: usize,
    /// Import calls found by the scan.
    pub calls_found: usize,
    /// Imports mapped to a module export.
    pub exports_resolved: usize,
    pub calls_converted: usize,
    /// Calls whose patch could not be applied.
    pub calls_failed: usize,
    /// Calls whose import could not be resolved.
    pub calls_skipped: usize,
    pub trampolines: usize,
    pub scan_stats: ScanStats,
}

/// Result of resolving the scanned imports.
#[derive(Clone, Debug, Default)]
pub struct ResolvedExports {
    pub builder: ImportTableBuilder,
    /// Imports mapped to an export.
    pub resolved: usize,
    /// Imports whose module or export could not be found.
    pub unresolved: usize,
}

/// Dumps a protected module out of a process.
pub struct VmpDump<P: ProcessMemory> {
    process: P,
    /// The module being rebuilt.
    target: ModuleView,
    /// Full path of the process image.
    image_path: String,
    trampolines: TrampolineCache,
}

impl<P: ProcessMemory> VmpDump<P> {
    /// Open `module_name` in `process`. An empty name selects the process image.
    pub fn open(process: P, module_name: &str) -> Result<Self> {
        let module = process.find_module(module_name)?;
        let image_path = process.image_path()?;
        let target = ModuleView::from_process(&process, &module)?;

        info!(
            "opened process {} ({}), module {} at 0x{:X}",
            process.process_id(),
            image_path,
            module.name,
            module.base
        );

        Ok(Self {
            process,
            target,
            image_path,
            trampolines: TrampolineCache::default(),
        })
    }

    pub fn process(&self) -> &P {
        &self.process
    }

    pub fn target(&self) -> &ModuleView {
        &self.target
    }

    pub fn image_path(&self) -> &str {
        &self.image_path
    }

    /// Scan the target's code sections for import stub calls.
    pub fn scan_for_imports(&self, config: &ScanConfig) -> Result<(ImportScan, ScanStats)> {
        let mut scanner = ImportScanner::new(&self.target.image, config.clone());
        let scan = scanner.scan_all_sections()?;
        let stats = scanner.stats();

        info!(
            "found {} calls to {} imports ({} candidates, {} rejected)",
            scan.calls.len(),
            scan.imports.len(),
            stats.candidates,
            stats.rejected
        );
        Ok((scan, stats))
    }

    /// Base of the module whose image contains `ea`.
    pub fn base_from_ea(&self, ea: u64) -> Option<u64> {
        match self.process.module_containing(ea) {
            Ok(module) => module.map(|m| m.base),
            Err(e) => {
                warn!("module enumeration failed: {}", e);
                None
            }
        }
    }

    /// Copy of the module loaded at `base`.
    pub fn view_from_base(&self, base: u64) -> Option<ModuleView> {
        let module = self
            .process
            .modules()
            .ok()?
            .into_iter()
            .find(|m| m.base == base)?;

        match ModuleView::from_process(&self.process, &module) {
            Ok(view) => Some(view),
            Err(e) => {
                error!("failed to copy module {} at 0x{:X}: {}", module.name, base, e);
                None
            }
        }
    }

    /// Map every scanned import to the export it points at.
    pub fn resolve_exports(&self, scan: &ImportScan) -> ResolvedExports {
        let mut result = ResolvedExports::default();
        let mut views: BTreeMap<u64, ModuleView> = BTreeMap::new();

        for import in scan.imports.values() {
            let Some(base) = self.base_from_ea(import.target_ea) else {
                error!("failed to resolve import module of function 0x{:X}", import.target_ea);
                result.unresolved += 1;
                continue;
            };

            if !views.contains_key(&base) {
                let Some(view) = self.view_from_base(base) else {
                    error!("failed to construct module view from base 0x{:X}", base);
                    result.unresolved += 1;
                    continue;
                };
                views.insert(base, view);
            }
            let Some(view) = views.get(&base) else {
                continue;
            };

            let Some(export) = view.get_export(import.target_ea) else {
                error!(
                    "failed to resolve export 0x{:X} in module {}",
                    import.target_ea, view.module_name
                );
                result.unresolved += 1;
                continue;
            };

            match &export.name {
                Some(name) => info!("resolved export {} in module {}", name, view.module_name),
                None => info!("resolved export #{} in module {}", export.ordinal, view.module_name),
            }

            result
                .builder
                .add_export(base, &view.module_name, export, import.target_ea);
            result.resolved += 1;
        }

        result
    }

    /// Rewrite `call` in the local image to go through the thunk at `thunk_ea`.
    pub fn convert_local_call(&mut self, call: &ImportCall, thunk_ea: u64) -> std::result::Result<CodePatch, PatchError> {
        let trampolines = std::mem::take(&mut self.trampolines);
        let mut patcher =
            CallPatcher::with_trampolines(&mut self.target.image, self.target.module_base, trampolines);
        let result = patcher.convert(call, thunk_ea);
        self.trampolines = patcher.into_trampolines();
        result
    }

    /// Run the whole pipeline, returning the rebuilt image in file layout.
    pub fn dump(&mut self, config: &DumpConfig) -> Result<DumpReport> {
        let mut progress = ProgressInfo::default();
        let report = |p: &ProgressInfo| {
            if let Some(ref cb) = config.progress_callback {
                cb(p);
            }
        };

        report(&progress);

        progress.stage = ProgressStage::ScanningImports;
        progress.current_item = Some(self.target.module_name.clone());
        report(&progress);
        let (scan, scan_stats) = self.scan_for_imports(&config.scan)?;
        progress.imports_found = scan.imports.len();
        progress.calls_found = scan.calls.len();

        progress.stage = ProgressStage::ResolvingExports;
        progress.total = scan.imports.len();
        report(&progress);
        let resolved = self.resolve_exports(&scan);
        progress.current = resolved.resolved;

        progress.stage = ProgressStage::BuildingImports;
        report(&progress);
        let layout = resolved.builder.build(&self.target.image)?;

        progress.stage = ProgressStage::ConvertingCalls;
        progress.current = 0;
        progress.total = scan.calls.len();
        report(&progress);

        let (converted, failed, skipped) = self.convert_calls(&scan, &layout, &mut progress, &report);

        progress.stage = ProgressStage::BuildingOutput;
        report(&progress);
        let image = self.build_output(&layout, config)?;

        progress.stage = ProgressStage::Complete;
        report(&progress);

        Ok(DumpReport {
            image,
            imports_found: scan.imports.len(),
            calls_found: scan.calls.len(),
            exports_resolved: resolved.resolved,
            calls_converted: converted,
            calls_failed: failed,
            calls_skipped: skipped,
            trampolines: self.trampolines.len(),
            scan_stats,
        })
    }

    /// Run the pipeline and write the result. Returns the report and output path.
    pub fn dump_to_file(&mut self, config: &DumpConfig) -> Result<(DumpReport, PathBuf)> {
        let report = self.dump(config)?;
        let path = self.output_path(config);

        if let Some(ref cb) = config.progress_callback {
            cb(&ProgressInfo {
                stage: ProgressStage::WritingFile,
                current_item: Some(path.display().to_string()),
                ..Default::default()
            });
        }
        self.write_output(&path, report.image.bytes())?;

        info!("file written to: {}", path.display());
        Ok((report, path))
    }

    fn convert_calls(
        &mut self,
        scan: &ImportScan,
        layout: &ImportTableLayout,
        progress: &mut ProgressInfo,
        report: &impl Fn(&ProgressInfo),
    ) -> (usize, usize, usize) {
        let (mut converted, mut failed, mut skipped) = (0, 0, 0);
        let module_base = self.target.module_base;

        info!("converting {} calls", scan.calls.len());
        for call in &scan.calls {
            progress.current += 1;

            let thunk_rva = scan
                .import_for(call)
                .and_then(|import| layout.thunk_rva_for(import.target_ea));
            let Some(thunk_rva) = thunk_rva else {
                warn!("call at 0x{:X} has no resolved import, skipping", call.call_rva);
                skipped += 1;
                continue;
            };

            match self.convert_local_call(call, module_base + u64::from(thunk_rva)) {
                Ok(patch) => {
                    debug!("patched {} bytes at 0x{:X}", patch.patch_bytes.len(), patch.rva);
                    info!(
                        "converted call at 0x{:X} to thunk at 0x{:X}",
                        call.call_rva, thunk_rva
                    );
                    converted += 1;
                    progress.calls_converted = converted;
                }
                Err(e) => {
                    warn!("failed to convert call: {}", e);
                    failed += 1;
                }
            }

            if progress.current % 64 == 0 {
                report(progress);
            }
        }

        (converted, failed, skipped)
    }

    /// Convert the patched image to file layout and attach the import table.
    fn build_output(&self, layout: &ImportTableLayout, config: &DumpConfig) -> Result<PeImage> {
        let mut raw = self.target.image.to_raw_image()?;

        let mut characteristics = IMPORT_SECTION_CHARACTERISTICS;
        if layout.thunks_in_section {
            characteristics |= IMAGE_SCN_MEM_WRITE;
        }
        raw.add_section(
            &config.section_name,
            &layout.section_data,
            layout.section_rva,
            characteristics,
        )?;
        raw.set_data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT, layout.import_directory)?;

        if !layout.thunks_in_section && !layout.thunks.is_empty() {
            raw.write_bytes(u64::from(layout.thunks_rva), &layout.thunks)?;

            let mut iat = raw.data_directory(IMAGE_DIRECTORY_ENTRY_IAT)?;
            iat.size += layout.thunks.len() as u32;
            raw.set_data_directory(IMAGE_DIRECTORY_ENTRY_IAT, iat)?;
        }

        if let Some(entry_point) = config.entry_point {
            raw.set_entry_point(entry_point)?;
        }
        if config.disable_relocation {
            raw.set_relocs_stripped()?;
        }

        let optional = raw.optional_header()?;
        info!(
            "new ImageBase: 0x{:X}, SizeOfImage: 0x{:X}",
            { optional.image_base },
            { optional.size_of_image }
        );

        Ok(raw)
    }

    /// Where the dump is written: the configured path, or
    /// `<module stem>.VMPDump.<ext>` next to the process image.
    pub fn output_path(&self, config: &DumpConfig) -> PathBuf {
        if let Some(ref output) = config.output {
            return output.clone();
        }

        let module = Path::new(&self.target.module_name);
        let stem = module
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module".to_string());
        let file_name = match module.extension() {
            Some(ext) => format!("{}.VMPDump.{}", stem, ext.to_string_lossy()),
            None => format!("{}.VMPDump", stem),
        };

        let directory_len = self.image_path.len() - crate::memory::image_file_name(&self.image_path).len();
        PathBuf::from(&self.image_path[..directory_len]).join(file_name)
    }

    /// Write output data to file.
    pub fn write_output<Q: AsRef<Path>>(&self, path: Q, data: &[u8]) -> Result<()> {
        let mut file = File::create(path.as_ref())
            .map_err(|e| Error::OutputCreationFailed(e.to_string()))?;

        file.write_all(data)
            .map_err(|e| Error::OutputWriteFailed(e.to_string()))?;

        Ok(())
    }
}
