//! Rewrites FileProvider path declarations (`res/xml/file_paths.xml`).

use crate::error::{PatchError, PatchResult};
use crate::fsutil;
use crate::report::{Category, PatchEvent, Reporter};
use crate::xml_span::{self, Element};
use std::path::Path;

const SENSITIVE_KIND: &str = "external-path";
const REPLACEMENT_KIND: &str = "external-files-path";
const REPLACEMENT_NAME: &str = "my_images";
const REPLACEMENT_PATH: &str = "Pictures/";

/// `Android/data/<package>/files/Pictures`, compared case-insensitively.
fn is_sensitive(element: &Element) -> bool {
    if element.name != SENSITIVE_KIND {
        return false;
    }
    let Some(path) = element.attribute("path") else {
        return false;
    };
    let path = path.to_ascii_lowercase();
    let path = path.strip_suffix('/').unwrap_or(&path);
    path.strip_prefix("android/data/")
        .and_then(|rest| rest.strip_suffix("/files/pictures"))
        .is_some_and(|package| !package.is_empty())
}

fn is_replacement(element: &Element) -> bool {
    element.name == REPLACEMENT_KIND
        && element.attribute("name") == Some(REPLACEMENT_NAME)
        && element.attribute("path") == Some(REPLACEMENT_PATH)
}

fn replacement_element() -> String {
    format!(r#"<{REPLACEMENT_KIND} name="{REPLACEMENT_NAME}" path="{REPLACEMENT_PATH}" />"#)
}

/// Replaces sensitive `<external-path>` declarations. The replacement goes
/// where the first one stood unless an equivalent element already exists.
/// Returns `None` when there is nothing to change.
pub fn rewrite_paths(text: &str) -> Result<Option<String>, String> {
    let elements = xml_span::locate_elements(text)?;
    let sensitive: Vec<&Element> = elements.iter().filter(|e| is_sensitive(e)).collect();
    if sensitive.is_empty() {
        return Ok(None);
    }

    let mut needs_replacement = !elements.iter().any(is_replacement);
    let mut edits = Vec::with_capacity(sensitive.len());
    for element in sensitive {
        if needs_replacement {
            edits.push((element.span.clone(), replacement_element()));
            needs_replacement = false;
        } else {
            edits.push((xml_span::line_aware(text, element.span.clone()), String::new()));
        }
    }

    Ok(Some(xml_span::apply_edits(text, edits)))
}

/// Rewrites the resource file at `path` in place. Returns whether the file
/// changed.
pub fn rewrite_paths_file(path: &Path, reporter: &dyn Reporter) -> PatchResult<bool> {
    let text = fsutil::read_text(path)?;
    xml_span::validate(&text).map_err(|e| PatchError::malformed(path, e))?;

    let Some(rewritten) = rewrite_paths(&text).map_err(|e| PatchError::malformed(path, e))? else {
        reporter.report(PatchEvent::Skipped {
            category: Category::Resources,
            path: path.to_path_buf(),
            reason: format!("no matching <{SENSITIVE_KIND}> entries"),
        });
        return Ok(false);
    };

    xml_span::validate(&rewritten)
        .map_err(|e| PatchError::malformed(path, format!("rewrite would break the document: {e}")))?;
    fsutil::write_atomically(path, &rewritten)?;
    reporter.report(PatchEvent::Patched {
        category: Category::Resources,
        path: path.to_path_buf(),
        detail: format!("replaced <{SENSITIVE_KIND}> with <{REPLACEMENT_KIND}>"),
    });
    Ok(true)
}
