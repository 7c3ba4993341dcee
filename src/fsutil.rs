use crate::error::{PatchError, PatchResult};
use std::io::Write;
use std::path::Path;

pub fn read_text(path: &Path) -> PatchResult<String> {
    let bytes = std::fs::read(path)?;
    String::from_utf8(bytes).map_err(|_| PatchError::malformed(path, "file is not valid UTF-8"))
}

/// Replaces `path` with `contents` by writing a sibling temporary file and
/// renaming it over the original, so a failed write never leaves a
/// truncated file behind.
pub fn write_atomically(path: &Path, contents: &str) -> PatchResult<()> {
    let write_failure = |source| PatchError::WriteFailure {
        path: path.to_path_buf(),
        source,
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(write_failure)?;
    temp.write_all(contents.as_bytes()).map_err(write_failure)?;
    temp.flush().map_err(write_failure)?;
    temp.persist(path).map_err(|e| write_failure(e.error))?;
    Ok(())
}
