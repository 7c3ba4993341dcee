use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by the patch engine.
///
/// Once a run has started, only [`PatchError::MissingDependency`] aborts it;
/// every other variant is caught at the component boundary and turned into a
/// failed outcome for the file in question.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("malformed input {}: {reason}", path.display())]
    MalformedInput { path: PathBuf, reason: String },

    #[error("missing required files: {}", missing.join(", "))]
    MissingDependency { missing: Vec<String> },

    #[error("failed to write {}: {source}", path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to read archive: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl PatchError {
    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PatchError::MalformedInput {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, PatchError::MissingDependency { .. })
    }
}

pub type PatchResult<T> = std::result::Result<T, PatchError>;
