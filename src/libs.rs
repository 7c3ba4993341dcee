//! Copies the supplemental native libraries into the architectures that
//! actually ship the protection library.

use crate::config::{Arch, ResolvedConfig};
use crate::error::{PatchError, PatchResult};
use crate::report::{PatchEvent, Reporter};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Where to look and what to copy.
#[derive(Debug, Clone)]
pub struct LibrarySettings {
    /// Directory holding the supplemental libraries (the working directory).
    pub source_dir: PathBuf,
    /// The merged archive the tree was decompiled from.
    pub archive: Option<PathBuf>,
    /// Native library directory relative to the tree root.
    pub lib_dir: PathBuf,
    pub protection_library: String,
    pub supplemental_libraries: Vec<String>,
    pub supported_abis: Vec<Arch>,
}

impl LibrarySettings {
    pub fn from_config(config: &ResolvedConfig, source_dir: PathBuf, archive: Option<PathBuf>) -> Self {
        Self {
            source_dir,
            archive,
            lib_dir: PathBuf::from(&config.lib_dir),
            protection_library: config.protection_library.clone(),
            supplemental_libraries: config.supplemental_libraries.clone(),
            supported_abis: config.supported_abis.clone(),
        }
    }

    /// Fails with `MissingDependency` naming every supplemental library
    /// absent from the source directory.
    pub fn check_dependencies(&self) -> PatchResult<()> {
        let missing: Vec<String> = self
            .supplemental_libraries
            .iter()
            .filter(|name| !self.source_dir.join(name).is_file())
            .cloned()
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(PatchError::MissingDependency { missing })
        }
    }
}

/// ABIs whose `lib/<abi>/` folder in the archive contains `library`.
pub fn archive_architectures(archive: &Path, library: &str) -> PatchResult<BTreeSet<String>> {
    let file = File::open(archive)?;
    let zip = zip::ZipArchive::new(file)?;

    let abis = zip
        .file_names()
        .filter_map(|name| {
            let rest = name.strip_prefix("lib/")?;
            let (abi, file) = rest.split_once('/')?;
            (file == library && !abi.is_empty()).then(|| abi.to_string())
        })
        .collect();
    Ok(abis)
}

/// Directories directly under `lib_dir` that contain `library`, keyed by
/// their name. Only `<lib_dir>/<abi>/<library>` counts.
pub fn tree_architectures(lib_dir: &Path, library: &str) -> PatchResult<BTreeMap<String, PathBuf>> {
    let mut dirs = BTreeMap::new();
    for entry in WalkDir::new(lib_dir).min_depth(2).max_depth(2) {
        let entry = entry.map_err(|e| PatchError::malformed(lib_dir, e.to_string()))?;
        if !entry.file_type().is_file() || entry.file_name() != library {
            continue;
        }
        if let Some(dir) = entry.path().parent() {
            if let Some(abi) = dir.file_name().and_then(|n| n.to_str()) {
                dirs.insert(abi.to_string(), dir.to_path_buf());
            }
        }
    }
    Ok(dirs)
}

/// The outcome of matching the decompiled tree against the archive.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CopyPlan {
    pub targets: Vec<(Arch, PathBuf)>,
    pub skipped: Vec<(String, String)>,
}

/// Intersects the tree's library directories with the archive's declared
/// ABIs and the supported list.
pub fn plan_copies(
    tree: &BTreeMap<String, PathBuf>,
    declared: &BTreeSet<String>,
    supported: &[Arch],
) -> CopyPlan {
    let mut plan = CopyPlan::default();

    for (abi, dir) in tree {
        let arch = match Arch::from_abi(abi) {
            Ok(arch) if supported.contains(&arch) => arch,
            _ => {
                plan.skipped
                    .push((abi.clone(), "unsupported architecture".to_string()));
                continue;
            }
        };
        if !declared.contains(abi) {
            plan.skipped
                .push((abi.clone(), "not declared in the archive".to_string()));
            continue;
        }
        plan.targets.push((arch, dir.clone()));
    }

    plan
}

/// Copies every supplemental library into each architecture of the plan.
/// Returns the architectures patched.
pub fn reconcile(
    tree_root: &Path,
    settings: &LibrarySettings,
    reporter: &dyn Reporter,
) -> PatchResult<Vec<Arch>> {
    settings.check_dependencies()?;

    let archive = settings
        .archive
        .as_deref()
        .ok_or_else(|| PatchError::NotFound("merged archive".to_string()))?;
    if !archive.is_file() {
        return Err(PatchError::NotFound(archive.display().to_string()));
    }
    let lib_dir = tree_root.join(&settings.lib_dir);
    if !lib_dir.is_dir() {
        return Err(PatchError::NotFound(lib_dir.display().to_string()));
    }

    let declared = archive_architectures(archive, &settings.protection_library)?;
    let tree = tree_architectures(&lib_dir, &settings.protection_library)?;
    let plan = plan_copies(&tree, &declared, &settings.supported_abis);

    for (abi, reason) in &plan.skipped {
        reporter.report(PatchEvent::ArchitectureSkipped {
            abi: abi.clone(),
            reason: reason.clone(),
        });
    }
    for abi in declared.iter().filter(|abi| !tree.contains_key(*abi)) {
        reporter.report(PatchEvent::Warning(format!(
            "{abi} ships {} in the archive but has no library directory in the decompiled tree",
            settings.protection_library
        )));
    }

    let mut patched = Vec::with_capacity(plan.targets.len());
    for (arch, dir) in &plan.targets {
        for library in &settings.supplemental_libraries {
            let destination = dir.join(library);
            std::fs::copy(settings.source_dir.join(library), &destination).map_err(|source| {
                PatchError::WriteFailure {
                    path: destination.clone(),
                    source,
                }
            })?;
            reporter.report(PatchEvent::LibraryCopied {
                library: library.clone(),
                abi: arch.to_string(),
            });
        }
        patched.push(*arch);
    }
    Ok(patched)
}
