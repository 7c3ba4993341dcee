//! Locates method blocks in smali disassembly without a full parser.

use std::fmt;
use std::ops::Range;
use thiserror::Error;

const METHOD_START: &str = ".method";
const METHOD_END: &str = ".end method";
const ANNOTATION_START: &str = ".annotation";
const ANNOTATION_END: &str = ".end annotation";

/// A method name plus its descriptor, e.g. `<clinit>` + `()V`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: &'static str,
    pub descriptor: &'static str,
}

impl MethodSignature {
    pub const fn new(name: &'static str, descriptor: &'static str) -> Self {
        Self { name, descriptor }
    }

    /// True if `line` is a `.method` declaration for exactly this name and
    /// descriptor. The signature is always the last token of the line;
    /// everything between `.method` and it is access flags.
    pub fn matches_declaration(&self, line: &str) -> bool {
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some(METHOD_START) {
            return false;
        }
        match tokens.last() {
            Some(token) => {
                token.len() == self.name.len() + self.descriptor.len()
                    && token.starts_with(self.name)
                    && token[self.name.len()..] == *self.descriptor
            }
            None => false,
        }
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.descriptor)
    }
}

/// Line span of one method, `start` being the `.method` line and `end`
/// one past the `.end method` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBlock {
    pub start: usize,
    pub end: usize,
    /// Annotation sub-blocks inside the method, each spanning from its
    /// `.annotation` line to one past its `.end annotation` line.
    pub annotations: Vec<Range<usize>>,
}

impl MethodBlock {
    pub fn terminator(&self) -> usize {
        self.end - 1
    }

    pub fn lines(&self) -> Range<usize> {
        self.start..self.end
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("method {signature} starting at line {line} has no .end method")]
    Unterminated { signature: String, line: usize },
    #[error("annotation starting at line {line} is never closed")]
    UnterminatedAnnotation { line: usize },
    #[error("unexpected .method at line {line} inside {signature}")]
    NestedMethod { signature: String, line: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Outside,
    InMethod,
    InAnnotation { start: usize },
}

/// Finds the first block declaring `target`. Overloads that share the name
/// but not the descriptor are ignored.
pub fn find_method<S: AsRef<str>>(
    lines: &[S],
    target: &MethodSignature,
) -> Result<Option<MethodBlock>, ScanError> {
    let mut state = ScanState::Outside;
    let mut start = 0;
    let mut annotations = Vec::new();

    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.as_ref().trim();
        state = match state {
            ScanState::Outside => {
                if target.matches_declaration(trimmed) {
                    start = index;
                    ScanState::InMethod
                } else {
                    ScanState::Outside
                }
            }
            ScanState::InMethod => {
                if trimmed == METHOD_END {
                    return Ok(Some(MethodBlock {
                        start,
                        end: index + 1,
                        annotations,
                    }));
                }
                if is_directive(trimmed, METHOD_START) {
                    return Err(ScanError::NestedMethod {
                        signature: target.to_string(),
                        line: index + 1,
                    });
                }
                if is_directive(trimmed, ANNOTATION_START) {
                    ScanState::InAnnotation { start: index }
                } else {
                    ScanState::InMethod
                }
            }
            ScanState::InAnnotation { start: annotation_start } => {
                if trimmed == ANNOTATION_END {
                    annotations.push(annotation_start..index + 1);
                    ScanState::InMethod
                } else if trimmed == METHOD_END || is_directive(trimmed, METHOD_START) {
                    return Err(ScanError::UnterminatedAnnotation {
                        line: annotation_start + 1,
                    });
                } else {
                    state
                }
            }
        };
    }

    match state {
        ScanState::Outside => Ok(None),
        ScanState::InMethod => Err(ScanError::Unterminated {
            signature: target.to_string(),
            line: start + 1,
        }),
        ScanState::InAnnotation { start } => {
            Err(ScanError::UnterminatedAnnotation { line: start + 1 })
        }
    }
}

// `.annotation` must not match `.annotations` or similar longer directives.
fn is_directive(trimmed: &str, directive: &str) -> bool {
    trimmed
        .strip_prefix(directive)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
}
