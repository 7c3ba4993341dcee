//! Removes the license-check components from AndroidManifest.xml.

use crate::error::{PatchError, PatchResult};
use crate::fsutil;
use crate::report::{Category, PatchEvent, Reporter};
use crate::xml_span::{self, Element};
use std::ops::Range;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeFilter {
    /// Any attribute value equals this fully qualified class name.
    ClassName(&'static str),
    /// The attribute with this local name has exactly this value.
    Equals {
        name: &'static str,
        value: &'static str,
    },
}

/// Which elements to drop: a tag name plus a filter on its attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementTemplate {
    pub kind: &'static str,
    pub filter: AttributeFilter,
}

impl ElementTemplate {
    pub fn matches(&self, element: &Element) -> bool {
        if element.name != self.kind {
            return false;
        }
        match self.filter {
            AttributeFilter::ClassName(class) => {
                element.attributes.iter().any(|attr| attr.value == class)
            }
            AttributeFilter::Equals { name, value } => element.attribute(name) == Some(value),
        }
    }
}

pub const LICENSE_CHECK_TEMPLATES: &[ElementTemplate] = &[
    ElementTemplate {
        kind: "activity",
        filter: AttributeFilter::ClassName("com.pairip.licensecheck.LicenseActivity"),
    },
    ElementTemplate {
        kind: "provider",
        filter: AttributeFilter::ClassName("com.pairip.licensecheck.LicenseContentProvider"),
    },
    ElementTemplate {
        kind: "uses-permission",
        filter: AttributeFilter::Equals {
            name: "name",
            value: "com.android.vending.CHECK_LICENSE",
        },
    },
];

/// Removes every element matching one of `templates`. Returns the new text
/// and how many elements each template removed.
pub fn prune(text: &str, templates: &[ElementTemplate]) -> Result<(String, Vec<usize>), String> {
    let elements = xml_span::locate_elements(text)?;
    let mut counts = vec![0; templates.len()];
    let mut removed: Vec<Range<usize>> = Vec::new();

    for element in &elements {
        let Some(index) = templates.iter().position(|t| t.matches(element)) else {
            continue;
        };
        // Children of an element already being removed go with it.
        if removed
            .iter()
            .any(|r| r.start <= element.span.start && element.span.end <= r.end)
        {
            continue;
        }
        counts[index] += 1;
        removed.push(element.span.clone());
    }

    let edits = removed
        .into_iter()
        .map(|span| (xml_span::line_aware(text, span), String::new()))
        .collect();
    Ok((xml_span::apply_edits(text, edits), counts))
}

/// Prunes the manifest at `path` in place. Returns the number of removed
/// elements; zero leaves the file untouched.
pub fn prune_manifest_file(
    path: &Path,
    templates: &[ElementTemplate],
    reporter: &dyn Reporter,
) -> PatchResult<usize> {
    let text = fsutil::read_text(path)?;
    xml_span::validate(&text).map_err(|e| PatchError::malformed(path, e))?;

    let (pruned, counts) = prune(&text, templates).map_err(|e| PatchError::malformed(path, e))?;
    let total: usize = counts.iter().sum();

    if total == 0 {
        reporter.report(PatchEvent::Skipped {
            category: Category::Manifest,
            path: path.to_path_buf(),
            reason: "no license check entries found".to_string(),
        });
        return Ok(0);
    }

    xml_span::validate(&pruned)
        .map_err(|e| PatchError::malformed(path, format!("pruning would break the document: {e}")))?;
    fsutil::write_atomically(path, &pruned)?;

    let detail = templates
        .iter()
        .zip(&counts)
        .filter(|(_, count)| **count > 0)
        .map(|(template, count)| format!("{count} <{}>", template.kind))
        .collect::<Vec<_>>()
        .join(", ");
    reporter.report(PatchEvent::Patched {
        category: Category::Manifest,
        path: path.to_path_buf(),
        detail: format!("removed {detail}"),
    });
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::RecordingReporter;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8" standalone="no"?>
<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.example.game">
    <uses-permission android:name="android.permission.INTERNET"/>
    <uses-permission android:name="com.android.vending.CHECK_LICENSE"/>
    <application android:label="Game">
        <activity android:name="com.example.game.MainActivity" android:exported="true">
            <intent-filter>
                <action android:name="android.intent.action.MAIN"/>
            </intent-filter>
        </activity>
        <activity android:exported="false"
            android:name="com.pairip.licensecheck.LicenseActivity"
            android:theme="@android:style/Theme.Translucent.NoTitleBar"/>
        <activity android:name="com.example.game.SettingsActivity"
            android:exported="false"/>
        <provider android:authorities="com.example.game.com.pairip.licensecheck.LicenseContentProvider"
            android:exported="false"
            android:name="com.pairip.licensecheck.LicenseContentProvider"/>
    </application>
</manifest>
"#;

    #[test]
    fn test_prune_removes_license_entries() {
        let (pruned, counts) = prune(MANIFEST, LICENSE_CHECK_TEMPLATES).unwrap();

        assert_eq!(counts, vec![1, 1, 1]);
        assert!(!pruned.contains("com.pairip.licensecheck"));
        assert!(!pruned.contains("CHECK_LICENSE"));
        assert!(pruned.contains(r#"<uses-permission android:name="android.permission.INTERNET"/>"#));
        assert!(pruned.starts_with(r#"<?xml version="1.0" encoding="utf-8" standalone="no"?>"#));
        assert!(xml_span::validate(&pruned).is_ok());
        assert!(!pruned.contains("\n\n"));
    }

    #[test]
    fn test_prune_matches_escaped_attribute_values() {
        let manifest = r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android">
    <uses-permission android:name="android.permission.INTERNET"/>
    <uses-permission android:name="com.android.vending.CHECK&#95;LICENSE"/>
    <application>
        <activity android:name="com.pairip.licensecheck.License&#x41;ctivity"/>
    </application>
</manifest>
"#;
        let (pruned, counts) = prune(manifest, LICENSE_CHECK_TEMPLATES).unwrap();

        assert_eq!(counts, vec![1, 0, 1]);
        assert!(!pruned.contains("CHECK&#95;LICENSE"));
        assert!(!pruned.contains("licensecheck"));
        assert!(pruned.contains("android.permission.INTERNET"));
        assert!(xml_span::validate(&pruned).is_ok());
    }

    #[test]
    fn test_prune_leaves_adjacent_sibling_identical() {
        let (pruned, _) = prune(MANIFEST, LICENSE_CHECK_TEMPLATES).unwrap();

        let sibling = r#"        <activity android:name="com.example.game.SettingsActivity"
            android:exported="false"/>
"#;
        assert!(MANIFEST.contains(sibling));
        assert!(pruned.contains(sibling));
        assert_eq!(pruned.matches("<activity").count(), 2);
        assert_eq!(MANIFEST.len() - pruned.len(), removed_len());
    }

    fn removed_len() -> usize {
        let lines = [
            "    <uses-permission android:name=\"com.android.vending.CHECK_LICENSE\"/>\n",
            "        <activity android:exported=\"false\"\n            android:name=\"com.pairip.licensecheck.LicenseActivity\"\n            android:theme=\"@android:style/Theme.Translucent.NoTitleBar\"/>\n",
            "        <provider android:authorities=\"com.example.game.com.pairip.licensecheck.LicenseContentProvider\"\n            android:exported=\"false\"\n            android:name=\"com.pairip.licensecheck.LicenseContentProvider\"/>\n",
        ];
        lines.iter().map(|l| l.len()).sum()
    }

    #[test]
    fn test_prune_removes_element_with_children() {
        let manifest = r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android">
    <application>
        <activity android:name="com.pairip.licensecheck.LicenseActivity">
            <intent-filter>
                <action android:name="com.pairip.licensecheck.LicenseActivity"/>
            </intent-filter>
        </activity>
    </application>
</manifest>"#;

        let (pruned, counts) = prune(manifest, LICENSE_CHECK_TEMPLATES).unwrap();
        assert_eq!(counts, vec![1, 0, 0]);
        assert_eq!(
            pruned,
            "<manifest xmlns:android=\"http://schemas.android.com/apk/res/android\">\n    <application>\n    </application>\n</manifest>"
        );
    }

    #[test]
    fn test_prune_file_without_entries_is_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("AndroidManifest.xml");
        let manifest = "<manifest>\n    <application/>\n</manifest>\n";
        std::fs::write(&path, manifest).unwrap();
        let reporter = RecordingReporter::default();

        assert_eq!(prune_manifest_file(&path, LICENSE_CHECK_TEMPLATES, &reporter).unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), manifest);
        assert!(matches!(reporter.events()[0], PatchEvent::Skipped { .. }));
    }

    #[test]
    fn test_prune_file_rejects_malformed_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("AndroidManifest.xml");
        let manifest = "<manifest>\n    <application>\n</manifest>\n";
        std::fs::write(&path, manifest).unwrap();

        let err = prune_manifest_file(&path, LICENSE_CHECK_TEMPLATES, &RecordingReporter::default())
            .unwrap_err();
        assert!(matches!(err, PatchError::MalformedInput { .. }));
    }

    #[test]
    fn test_prune_file_writes_result() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("AndroidManifest.xml");
        std::fs::write(&path, MANIFEST).unwrap();

        let removed =
            prune_manifest_file(&path, LICENSE_CHECK_TEMPLATES, &RecordingReporter::default()).unwrap();
        assert_eq!(removed, 3);
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, prune(MANIFEST, LICENSE_CHECK_TEMPLATES).unwrap().0);
    }
}
