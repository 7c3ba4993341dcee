//! Method-level patches for the protection layer's smali classes.

pub mod bodies;
pub mod rewriter;
pub mod scanner;

use crate::error::{PatchError, PatchResult};
use crate::fsutil;
use crate::report::{Category, PatchEvent, Reporter};
use rewriter::{apply_patch, MethodPatch, ReplacementBody, Rewrite, RewriteStatus};
use scanner::MethodSignature;
use std::path::Path;

/// A protection class and the methods to rewrite in it.
#[derive(Debug, Clone, Copy)]
pub struct SmaliTarget {
    /// Trailing path components identifying the class file, e.g.
    /// `pairip/VMRunner.smali`.
    pub class_file: &'static str,
    pub patches: &'static [MethodPatch],
}

impl SmaliTarget {
    pub fn matches(&self, path: &Path) -> bool {
        path.ends_with(self.class_file)
    }
}

pub const TARGETS: &[SmaliTarget] = &[
    SmaliTarget {
        class_file: "pairip/VMRunner.smali",
        patches: &[MethodPatch {
            signature: MethodSignature::new("<clinit>", "()V"),
            rewrite: Rewrite::Replace(ReplacementBody::Verbatim(bodies::LOADER_CLINIT)),
        }],
    },
    SmaliTarget {
        class_file: "pairip/SignatureCheck.smali",
        patches: &[MethodPatch {
            signature: MethodSignature::new("verifyIntegrity", "(Landroid/content/Context;)V"),
            rewrite: Rewrite::InsertAfterPrologue {
                instruction: "return-void",
                lookahead: 4,
            },
        }],
    },
    SmaliTarget {
        class_file: "licensecheck/LicenseClient.smali",
        patches: &[
            MethodPatch {
                signature: MethodSignature::new("initializeLicenseCheck", "()V"),
                rewrite: Rewrite::Replace(ReplacementBody::Stub(bodies::RETURN_VOID)),
            },
            MethodPatch {
                signature: MethodSignature::new("connectToLicensingService", "()V"),
                rewrite: Rewrite::Replace(ReplacementBody::Stub(bodies::RETURN_VOID)),
            },
            MethodPatch {
                signature: MethodSignature::new("performLocalInstallerCheck", "()Z"),
                rewrite: Rewrite::Replace(ReplacementBody::Stub(bodies::RETURN_TRUE)),
            },
        ],
    },
];

/// Line-split view of a smali file that renders back with the original
/// line ending and final newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmaliDocument {
    pub lines: Vec<String>,
    newline: &'static str,
    trailing_newline: bool,
}

impl SmaliDocument {
    pub fn parse(text: &str) -> Self {
        let newline = if text.contains("\r\n") { "\r\n" } else { "\n" };
        Self {
            lines: text.lines().map(String::from).collect(),
            newline,
            trailing_newline: text.ends_with('\n'),
        }
    }

    pub fn render(&self) -> String {
        let mut text = self.lines.join(self.newline);
        if self.trailing_newline {
            text.push_str(self.newline);
        }
        text
    }
}

/// Applies every patch of `target` to the file at `path`, writing it back
/// once if anything changed. Returns whether at least one method of the
/// class is in its patched form afterwards.
pub fn patch_class_file(
    path: &Path,
    target: &SmaliTarget,
    reporter: &dyn Reporter,
) -> PatchResult<bool> {
    let text = fsutil::read_text(path)?;
    let mut document = SmaliDocument::parse(&text);
    let mut changed = false;
    let mut patched = false;

    for patch in target.patches {
        let status = apply_patch(&mut document.lines, patch)
            .map_err(|e| PatchError::malformed(path, e.to_string()))?;
        let detail = patch.signature.to_string();

        match status {
            RewriteStatus::Applied => {
                changed = true;
                reporter.report(PatchEvent::Patched {
                    category: Category::Methods,
                    path: path.to_path_buf(),
                    detail,
                });
            }
            RewriteStatus::AlreadyApplied => reporter.report(PatchEvent::AlreadyPatched {
                category: Category::Methods,
                path: path.to_path_buf(),
                detail,
            }),
            RewriteStatus::MethodNotFound => reporter.report(PatchEvent::Skipped {
                category: Category::Methods,
                path: path.to_path_buf(),
                reason: format!("{detail} not found"),
            }),
            RewriteStatus::MarkerNotFound => reporter.report(PatchEvent::Skipped {
                category: Category::Methods,
                path: path.to_path_buf(),
                reason: format!("{detail} has no prologue to insert after"),
            }),
        }
        patched |= status.is_patched();
    }

    if changed {
        fsutil::write_atomically(path, &document.render())?;
    }
    Ok(patched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::RecordingReporter;
    use tempfile::TempDir;

    const SIGNATURE_CHECK: &str = ".class public Lcom/pairip/SignatureCheck;\r\n.super Ljava/lang/Object;\r\n\r\n.method public static verifyIntegrity(Landroid/content/Context;)V\r\n    .registers 2\r\n\r\n    invoke-static {p0}, Lcom/pairip/SignatureCheck;->verifySignatureMatches(Landroid/content/Context;)Z\r\n    move-result v0\r\n    if-nez v0, :cond_0\r\n    invoke-static {}, Lcom/pairip/SignatureCheck;->fail()V\r\n    :cond_0\r\n    return-void\r\n.end method\r\n";

    #[test]
    fn test_document_round_trip_keeps_line_endings() {
        let document = SmaliDocument::parse(SIGNATURE_CHECK);
        assert_eq!(document.render(), SIGNATURE_CHECK);

        let unix = "a\nb";
        assert_eq!(SmaliDocument::parse(unix).render(), unix);
    }

    #[test]
    fn test_target_matching() {
        let target = &TARGETS[0];
        assert!(target.matches(Path::new("out/smali/classes2/com/pairip/VMRunner.smali")));
        assert!(!target.matches(Path::new("out/smali/com/other/VMRunner.smali")));
        assert!(!target.matches(Path::new("out/smali/com/pairip/XVMRunner.smali")));
    }

    #[test]
    fn test_patch_class_file_writes_once() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("SignatureCheck.smali");
        std::fs::write(&path, SIGNATURE_CHECK).unwrap();
        let reporter = RecordingReporter::default();

        assert!(patch_class_file(&path, &TARGETS[1], &reporter).unwrap());
        let patched = std::fs::read_to_string(&path).unwrap();
        assert!(patched.contains("    .registers 2\r\n    return-void\r\n"));
        assert!(!patched.contains("\r\r"));

        // Second run finds the early return and leaves the file alone.
        assert!(patch_class_file(&path, &TARGETS[1], &reporter).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), patched);
        assert!(matches!(
            reporter.events().last(),
            Some(PatchEvent::AlreadyPatched { .. })
        ));
    }

    #[test]
    fn test_patch_class_file_reports_missing_methods() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("LicenseClient.smali");
        let source = ".class public Lcom/pairip/licensecheck/LicenseClient;\n.super Ljava/lang/Object;\n";
        std::fs::write(&path, source).unwrap();
        let reporter = RecordingReporter::default();

        assert!(!patch_class_file(&path, &TARGETS[2], &reporter).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), source);
        assert_eq!(reporter.events().len(), 3);
    }

    #[test]
    fn test_patch_class_file_rejects_broken_method() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("VMRunner.smali");
        let source = ".class public Lcom/pairip/VMRunner;\n.method static constructor <clinit>()V\n    return-void\n";
        std::fs::write(&path, source).unwrap();

        let err = patch_class_file(&path, &TARGETS[0], &RecordingReporter::default()).unwrap_err();
        assert!(matches!(err, PatchError::MalformedInput { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), source);
    }
}
