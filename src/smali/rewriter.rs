use super::scanner::{find_method, MethodBlock, MethodSignature, ScanError};

const METHOD_END: &str = ".end method";
const INDENT: &str = "    ";

/// Lines that take the place of a method block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementBody {
    /// A complete block carrying its own declaration and terminator.
    Verbatim(&'static [&'static str]),
    /// Body lines placed between the original declaration line and a fresh
    /// `.end method`.
    Stub(&'static [&'static str]),
}

impl ReplacementBody {
    fn render(&self, declaration: &str) -> Vec<String> {
        match self {
            ReplacementBody::Verbatim(lines) => lines.iter().map(|l| l.to_string()).collect(),
            ReplacementBody::Stub(body) => std::iter::once(declaration.to_string())
                .chain(body.iter().map(|l| l.to_string()))
                .chain(std::iter::once(METHOD_END.to_string()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rewrite {
    /// Swap the whole block for the given body.
    Replace(ReplacementBody),
    /// Insert `instruction` right after the method prologue unless it
    /// already shows up within `lookahead` lines of it.
    InsertAfterPrologue {
        instruction: &'static str,
        lookahead: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodPatch {
    pub signature: MethodSignature,
    pub rewrite: Rewrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteStatus {
    Applied,
    AlreadyApplied,
    MethodNotFound,
    MarkerNotFound,
}

impl RewriteStatus {
    /// The method ends up in its patched form.
    pub fn is_patched(self) -> bool {
        matches!(self, RewriteStatus::Applied | RewriteStatus::AlreadyApplied)
    }
}

/// Applies `patch` to `lines` in memory.
pub fn apply_patch(lines: &mut Vec<String>, patch: &MethodPatch) -> Result<RewriteStatus, ScanError> {
    let Some(block) = find_method(lines.as_slice(), &patch.signature)? else {
        return Ok(RewriteStatus::MethodNotFound);
    };

    let status = match patch.rewrite {
        Rewrite::Replace(body) => replace_block(lines, &block, body),
        Rewrite::InsertAfterPrologue {
            instruction,
            lookahead,
        } => insert_after_prologue(lines, &block, instruction, lookahead),
    };
    Ok(status)
}

fn replace_block(lines: &mut Vec<String>, block: &MethodBlock, body: ReplacementBody) -> RewriteStatus {
    let replacement = body.render(&lines[block.start]);
    if lines[block.lines()] == replacement[..] {
        return RewriteStatus::AlreadyApplied;
    }
    lines.splice(block.lines(), replacement);
    RewriteStatus::Applied
}

fn insert_after_prologue(
    lines: &mut Vec<String>,
    block: &MethodBlock,
    instruction: &str,
    lookahead: usize,
) -> RewriteStatus {
    let Some(marker) = prologue_end(lines, block) else {
        return RewriteStatus::MarkerNotFound;
    };

    let window_end = (marker + 1 + lookahead).min(block.terminator());
    if lines[marker + 1..window_end]
        .iter()
        .any(|line| line.trim() == instruction)
    {
        return RewriteStatus::AlreadyApplied;
    }

    lines.insert(marker + 1, format!("{INDENT}{instruction}"));
    RewriteStatus::Applied
}

// End of the first annotation sub-block, or the register directive when the
// method carries no annotation.
fn prologue_end(lines: &[String], block: &MethodBlock) -> Option<usize> {
    if let Some(annotation) = block.annotations.first() {
        return Some(annotation.end - 1);
    }
    (block.start + 1..block.terminator()).find(|&i| {
        let trimmed = lines[i].trim_start();
        trimmed.starts_with(".registers") || trimmed.starts_with(".locals")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smali::bodies::{LOADER_CLINIT, RETURN_TRUE, RETURN_VOID};

    const CLINIT: MethodSignature = MethodSignature::new("<clinit>", "()V");
    const VERIFY: MethodSignature =
        MethodSignature::new("verifyIntegrity", "(Landroid/content/Context;)V");

    fn owned(text: &str) -> Vec<String> {
        text.lines().map(String::from).collect()
    }

    const VM_RUNNER: &str = r#".class public Lcom/pairip/VMRunner;
.super Ljava/lang/Object;

# static fields
.field private static packageName:Ljava/lang/String;

.method static constructor <clinit>()V
    .registers 2

    .line 28
    const-string v0, "pairipcore"
    invoke-static {v0}, Ljava/lang/System;->loadLibrary(Ljava/lang/String;)V

    const/4 v1, 0x0
    sput-object v1, Lcom/pairip/VMRunner;->packageName:Ljava/lang/String;

    return-void
.end method

.method public constructor <init>()V
    .registers 1
    invoke-direct {p0}, Ljava/lang/Object;-><init>()V
    return-void
.end method"#;

    #[test]
    fn test_replace_clinit_with_loader_stub() {
        let original = owned(VM_RUNNER);
        let mut lines = original.clone();
        let patch = MethodPatch {
            signature: CLINIT,
            rewrite: Rewrite::Replace(ReplacementBody::Verbatim(LOADER_CLINIT)),
        };

        assert_eq!(apply_patch(&mut lines, &patch).unwrap(), RewriteStatus::Applied);

        let declarations = lines.iter().filter(|l| l.contains("<clinit>()V")).count();
        assert_eq!(declarations, 1);
        assert_eq!(&lines[..6], &original[..6]);
        assert_eq!(&lines[6..6 + LOADER_CLINIT.len()], LOADER_CLINIT);
        assert_eq!(&lines[6 + LOADER_CLINIT.len()..], &original[18..]);

        let instructions: Vec<&str> = lines[7..6 + LOADER_CLINIT.len() - 1]
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with('.') && !l.starts_with("const-string"))
            .collect();
        assert_eq!(
            instructions,
            vec![
                "invoke-static {v0}, Ljava/lang/System;->loadLibrary(Ljava/lang/String;)V",
                "invoke-static {v0}, Ljava/lang/System;->loadLibrary(Ljava/lang/String;)V",
                "return-void",
            ]
        );
    }

    #[test]
    fn test_replace_is_idempotent() {
        let mut lines = owned(VM_RUNNER);
        let patch = MethodPatch {
            signature: CLINIT,
            rewrite: Rewrite::Replace(ReplacementBody::Verbatim(LOADER_CLINIT)),
        };
        apply_patch(&mut lines, &patch).unwrap();
        let once = lines.clone();

        assert_eq!(
            apply_patch(&mut lines, &patch).unwrap(),
            RewriteStatus::AlreadyApplied
        );
        assert_eq!(lines, once);
    }

    #[test]
    fn test_stub_keeps_declaration() {
        let mut lines = owned(
            ".method private performLocalInstallerCheck()Z\n    .registers 5\n    const/4 v0, 0x0\n    return v0\n.end method",
        );
        let patch = MethodPatch {
            signature: MethodSignature::new("performLocalInstallerCheck", "()Z"),
            rewrite: Rewrite::Replace(ReplacementBody::Stub(RETURN_TRUE)),
        };

        assert_eq!(apply_patch(&mut lines, &patch).unwrap(), RewriteStatus::Applied);
        assert_eq!(lines.first().unwrap(), ".method private performLocalInstallerCheck()Z");
        assert_eq!(lines.last().unwrap(), ".end method");
        assert_eq!(lines.len(), RETURN_TRUE.len() + 2);
    }

    #[test]
    fn test_insert_return_after_annotation() {
        let mut lines = owned(
            r#".method public static verifyIntegrity(Landroid/content/Context;)V
    .registers 3
    .annotation system Ldalvik/annotation/Throws;
        value = {
            Ljava/lang/Exception;
        }
    .end annotation

    invoke-static {p0}, Lcom/pairip/SignatureCheck;->verifySignatureMatches(Landroid/content/Context;)Z
    move-result v0

    if-nez v0, :cond_0
    new-instance v1, Ljava/lang/SecurityException;
    invoke-direct {v1}, Ljava/lang/SecurityException;-><init>()V
    throw v1

    :cond_0
    return-void
.end method"#,
        );
        let patch = MethodPatch {
            signature: VERIFY,
            rewrite: Rewrite::InsertAfterPrologue {
                instruction: "return-void",
                lookahead: 4,
            },
        };

        assert_eq!(apply_patch(&mut lines, &patch).unwrap(), RewriteStatus::Applied);
        assert_eq!(lines[6].trim(), ".end annotation");
        assert_eq!(lines[7], "    return-void");
        assert_eq!(lines.last().unwrap(), ".end method");

        assert_eq!(
            apply_patch(&mut lines, &patch).unwrap(),
            RewriteStatus::AlreadyApplied
        );
        assert_eq!(lines.iter().filter(|l| l.trim() == "return-void").count(), 2);
    }

    #[test]
    fn test_insert_without_annotation_uses_register_directive() {
        let mut lines = owned(
            ".method public static verifyIntegrity(Landroid/content/Context;)V\n    .locals 1\n\n    invoke-static {p0}, LFoo;->bar(Landroid/content/Context;)V\n\n    const/4 v0, 0x0\n    return-void\n.end method",
        );
        let patch = MethodPatch {
            signature: VERIFY,
            rewrite: Rewrite::InsertAfterPrologue {
                instruction: "return-void",
                lookahead: 4,
            },
        };

        assert_eq!(apply_patch(&mut lines, &patch).unwrap(), RewriteStatus::Applied);
        assert_eq!(lines[2], "    return-void");
    }

    #[test]
    fn test_missing_method_leaves_lines_alone() {
        let original = owned(VM_RUNNER);
        let mut lines = original.clone();
        let patch = MethodPatch {
            signature: VERIFY,
            rewrite: Rewrite::Replace(ReplacementBody::Stub(RETURN_VOID)),
        };

        assert_eq!(
            apply_patch(&mut lines, &patch).unwrap(),
            RewriteStatus::MethodNotFound
        );
        assert_eq!(lines, original);
    }
}
