//! Drives every component over a decompiled tree and aggregates the result.

use crate::config::ResolvedConfig;
use crate::error::{PatchError, PatchResult};
use crate::libs::{self, LibrarySettings};
use crate::manifest::{self, ElementTemplate, LICENSE_CHECK_TEMPLATES};
use crate::report::{Category, PatchEvent, Reporter};
use crate::resources;
use crate::smali::{self, SmaliTarget, TARGETS};
use serde::Serialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const MANIFEST_FILE: &str = "AndroidManifest.xml";
const RESOURCE_XML_DIR: &str = "res/xml";

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryOutcome {
    pub patched: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl CategoryOutcome {
    pub fn succeeded(&self) -> bool {
        self.patched > 0
    }
}

/// What a run changed, per category.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PatchOutcome {
    pub methods: CategoryOutcome,
    pub manifest: CategoryOutcome,
    pub resources: CategoryOutcome,
    pub libraries: CategoryOutcome,
    pub architectures: Vec<String>,
}

impl PatchOutcome {
    pub fn anything_patched(&self) -> bool {
        self.methods.succeeded()
            || self.manifest.succeeded()
            || self.resources.succeeded()
            || self.libraries.succeeded()
    }

    pub fn has_failures(&self) -> bool {
        self.methods.failed + self.manifest.failed + self.resources.failed + self.libraries.failed > 0
    }

    fn category_mut(&mut self, category: Category) -> &mut CategoryOutcome {
        match category {
            Category::Methods => &mut self.methods,
            Category::Manifest => &mut self.manifest,
            Category::Resources => &mut self.resources,
            Category::Libraries => &mut self.libraries,
        }
    }
}

enum WorkItem {
    Smali(PathBuf, &'static SmaliTarget),
    Manifest(PathBuf),
    Resource(PathBuf),
}

pub struct Patcher<'a> {
    libraries: LibrarySettings,
    resource_files: Vec<String>,
    smali_targets: &'static [SmaliTarget],
    manifest_templates: &'static [ElementTemplate],
    reporter: &'a dyn Reporter,
}

impl<'a> Patcher<'a> {
    pub fn new(config: &ResolvedConfig, libraries: LibrarySettings, reporter: &'a dyn Reporter) -> Self {
        Self {
            libraries,
            resource_files: config.resource_files.clone(),
            smali_targets: TARGETS,
            manifest_templates: LICENSE_CHECK_TEMPLATES,
            reporter,
        }
    }

    /// Patches the decompiled tree at `tree_root` in place.
    ///
    /// Per-file problems are reported and counted in the outcome. The only
    /// errors returned are a missing tree and a missing supplemental
    /// library, and the latter is detected before any file is touched.
    pub fn patch(&self, tree_root: &Path) -> PatchResult<PatchOutcome> {
        if !tree_root.is_dir() {
            return Err(PatchError::NotFound(tree_root.display().to_string()));
        }
        self.libraries.check_dependencies()?;

        let work = self.collect_work(tree_root);
        let mut outcome = PatchOutcome::default();

        self.patch_methods(&work, &mut outcome);
        self.patch_manifest(&work, &mut outcome);
        self.patch_resources(&work, &mut outcome);
        self.copy_libraries(tree_root, &mut outcome)?;

        if !outcome.anything_patched() {
            self.reporter.report(PatchEvent::Warning(
                "Nothing was patched; the rebuilt app will still carry its protection".to_string(),
            ));
        }
        if outcome.has_failures() {
            self.reporter.report(PatchEvent::Warning(
                "Some patches failed; the rebuilt app may be only partially unprotected".to_string(),
            ));
        }
        Ok(outcome)
    }

    fn collect_work(&self, tree_root: &Path) -> Vec<WorkItem> {
        let mut work = Vec::new();
        for entry in WalkDir::new(tree_root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    self.reporter.report(PatchEvent::Warning(format!("Cannot read {e}")));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();

            if path.extension().is_some_and(|ext| ext == "smali") {
                if let Some(target) = self.smali_targets.iter().find(|t| t.matches(path)) {
                    work.push(WorkItem::Smali(path.to_path_buf(), target));
                }
            } else if entry.depth() == 1 && entry.file_name() == MANIFEST_FILE {
                work.push(WorkItem::Manifest(path.to_path_buf()));
            } else if self.is_resource_file(path) {
                work.push(WorkItem::Resource(path.to_path_buf()));
            }
        }
        work
    }

    fn is_resource_file(&self, path: &Path) -> bool {
        let named = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| self.resource_files.iter().any(|f| f == name));
        named && path.parent().is_some_and(|dir| dir.ends_with(RESOURCE_XML_DIR))
    }

    fn patch_methods(&self, work: &[WorkItem], outcome: &mut PatchOutcome) {
        self.reporter.report(PatchEvent::Started(Category::Methods));
        let mut patched_targets = vec![false; self.smali_targets.len()];

        for item in work {
            let WorkItem::Smali(path, target) = item else {
                continue;
            };
            let result = smali::patch_class_file(path, target, self.reporter);
            if let Ok(true) = result {
                if let Some(index) = self
                    .smali_targets
                    .iter()
                    .position(|t| t.class_file == target.class_file)
                {
                    patched_targets[index] = true;
                }
            }
            self.record(Category::Methods, path, result, outcome);
        }

        for (target, patched) in self.smali_targets.iter().zip(patched_targets) {
            if !patched {
                self.reporter.report(PatchEvent::Warning(format!(
                    "{} not found or not patched",
                    target.class_file
                )));
            }
        }
    }

    fn patch_manifest(&self, work: &[WorkItem], outcome: &mut PatchOutcome) {
        self.reporter.report(PatchEvent::Started(Category::Manifest));
        let mut found = false;

        for item in work {
            let WorkItem::Manifest(path) = item else {
                continue;
            };
            found = true;
            let result = manifest::prune_manifest_file(path, self.manifest_templates, self.reporter)
                .map(|removed| removed > 0);
            self.record(Category::Manifest, path, result, outcome);
        }

        if !found {
            self.reporter
                .report(PatchEvent::Warning(format!("{MANIFEST_FILE} not found")));
        }
    }

    fn patch_resources(&self, work: &[WorkItem], outcome: &mut PatchOutcome) {
        self.reporter.report(PatchEvent::Started(Category::Resources));

        for item in work {
            let WorkItem::Resource(path) = item else {
                continue;
            };
            let result = resources::rewrite_paths_file(path, self.reporter);
            self.record(Category::Resources, path, result, outcome);
        }

        if !outcome.resources.succeeded() {
            self.reporter.report(PatchEvent::Warning(
                "No matching <external-path> entries found".to_string(),
            ));
        }
    }

    fn copy_libraries(&self, tree_root: &Path, outcome: &mut PatchOutcome) -> PatchResult<()> {
        self.reporter.report(PatchEvent::Started(Category::Libraries));

        match libs::reconcile(tree_root, &self.libraries, self.reporter) {
            Ok(architectures) if architectures.is_empty() => {
                outcome.libraries.skipped += 1;
                self.reporter.report(PatchEvent::Warning(format!(
                    "No library directories found containing {}",
                    self.libraries.protection_library
                )));
            }
            Ok(architectures) => {
                outcome.libraries.patched += architectures.len();
                outcome.architectures = architectures.iter().map(|a| a.to_string()).collect();
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(PatchError::NotFound(what)) => {
                outcome.libraries.skipped += 1;
                self.reporter.report(PatchEvent::Warning(format!(
                    "Skipping native libraries: {what} not found"
                )));
            }
            Err(e) => {
                outcome.libraries.failed += 1;
                self.reporter.report(PatchEvent::Failed {
                    category: Category::Libraries,
                    path: tree_root.join(&self.libraries.lib_dir),
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }

    fn record(&self, category: Category, path: &Path, result: PatchResult<bool>, outcome: &mut PatchOutcome) {
        let counts = outcome.category_mut(category);
        match result {
            Ok(true) => counts.patched += 1,
            Ok(false) => counts.skipped += 1,
            Err(e) => {
                counts.failed += 1;
                self.reporter.report(PatchEvent::Failed {
                    category,
                    path: path.to_path_buf(),
                    error: e.to_string(),
                });
            }
        }
    }
}
