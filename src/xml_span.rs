//! Element spans over raw XML text.
//!
//! Decompiled resources are edited in place: elements are found with the
//! `xml` event reader and cut out of the original text, so everything that
//! is not removed keeps its exact bytes. Reader positions (row and column)
//! are mapped back to byte offsets to place each splice.

use std::ops::Range;

use xml::attribute::OwnedAttribute;
use xml::common::{Position, TextPosition};
use xml::name::OwnedName;
use xml::reader::XmlEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Local name, without any namespace prefix.
    pub name: String,
    pub attributes: Vec<OwnedAttribute>,
    /// Byte range from `<` of the start tag to the end of the closing tag.
    pub span: Range<usize>,
}

impl Element {
    /// Value of the attribute with this local name (`android:name` -> `name`).
    pub fn attribute(&self, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.name.local_name == local_name)
            .map(|attr| attr.value.as_str())
    }
}

/// Byte offset of the first character of each line.
struct LineIndex<'a> {
    text: &'a str,
    starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    fn new(text: &'a str) -> Self {
        let starts = std::iter::once(0)
            .chain(text.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self { text, starts }
    }

    /// Byte offset of a reader position, never earlier than `floor`.
    fn offset(&self, position: TextPosition, floor: usize) -> usize {
        let Some(&line_start) = self.starts.get(position.row as usize) else {
            return floor;
        };
        let line = &self.text[line_start..];
        let column = line
            .char_indices()
            .nth(position.column as usize)
            .map_or(line.len(), |(i, _)| i);
        (line_start + column).max(floor)
    }
}

fn qualified(name: &OwnedName) -> String {
    match &name.prefix {
        Some(prefix) => format!("{prefix}:{}", name.local_name),
        None => name.local_name.clone(),
    }
}

/// First occurrence of `markup` at or after `from` that is followed by
/// the end of a tag name.
fn find_tag(text: &str, from: usize, markup: &str) -> Option<usize> {
    let mut pos = from;
    while let Some(i) = text[pos..].find(markup) {
        let start = pos + i;
        let after = start + markup.len();
        match text[after..].chars().next() {
            Some(c) if c.is_whitespace() || c == '/' || c == '>' => return Some(start),
            None => return None,
            Some(_) => pos = after,
        }
    }
    None
}

/// End of the start tag beginning at `start`, and whether it closes itself.
fn start_tag_end(text: &str, start: usize) -> Option<(usize, bool)> {
    let mut quote = None;
    for (i, c) in text[start..].char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '>') => {
                let end = start + i + 1;
                return Some((end, text[..end - 1].ends_with('/')));
            }
            (None, _) => {}
        }
    }
    None
}

/// End of the first `open`..`close` section at or after `from`, or `from`
/// when there is none.
fn skip_section(text: &str, from: usize, open: &str, close: &str) -> usize {
    text[from..]
        .find(open)
        .map(|i| from + i)
        .and_then(|start| text[start..].find(close).map(|j| start + j + close.len()))
        .unwrap_or(from)
}

/// Every element of `text` in document order.
pub fn locate_elements(text: &str) -> Result<Vec<Element>, String> {
    let lines = LineIndex::new(text);
    // Comments come through as events so tags quoted in them are skipped.
    let mut reader = xml::ParserConfig::new()
        .ignore_comments(false)
        .create_reader(text.as_bytes());
    let mut elements: Vec<Element> = Vec::new();
    // Index into `elements` and whether its start tag closed itself.
    let mut open: Vec<(usize, bool)> = Vec::new();
    let mut cursor = 0;

    loop {
        let event = reader.next().map_err(|e| e.to_string())?;
        let position = reader.position();
        match event {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                let reported = lines.offset(position, cursor);
                let tag = qualified(&name);
                let start = find_tag(text, reported, &format!("<{tag}"))
                    .ok_or_else(|| format!("cannot place <{tag}> near {position}"))?;
                let (end, self_closing) = start_tag_end(text, start)
                    .ok_or_else(|| format!("unterminated <{tag}> at {position}"))?;
                elements.push(Element {
                    name: name.local_name,
                    attributes,
                    span: start..end,
                });
                open.push((elements.len() - 1, self_closing));
                cursor = end;
            }
            XmlEvent::EndElement { name } => {
                let (index, self_closing) = open
                    .pop()
                    .ok_or_else(|| format!("unexpected end of <{}>", name.local_name))?;
                if self_closing {
                    continue;
                }
                let reported = lines.offset(position, cursor);
                let tag = qualified(&name);
                let start = find_tag(text, reported, &format!("</{tag}"))
                    .ok_or_else(|| format!("cannot place </{tag}> near {position}"))?;
                let end = text[start..]
                    .find('>')
                    .map(|i| start + i + 1)
                    .ok_or_else(|| format!("unterminated </{tag}> at {position}"))?;
                elements[index].span.end = end;
                cursor = end;
            }
            XmlEvent::Comment(_) => {
                let reported = lines.offset(position, cursor);
                cursor = skip_section(text, reported, "<!--", "-->");
            }
            XmlEvent::CData(_) => {
                let reported = lines.offset(position, cursor);
                cursor = skip_section(text, reported, "<![CDATA[", "]]>");
            }
            XmlEvent::EndDocument => return Ok(elements),
            _ => {}
        }
    }
}

/// Widens `span` to whole lines when nothing else shares those lines, so a
/// removed element takes its indentation and line break with it.
pub fn line_aware(text: &str, span: Range<usize>) -> Range<usize> {
    let line_start = text[..span.start].rfind('\n').map_or(0, |i| i + 1);
    let line_end = text[span.end..]
        .find('\n')
        .map_or(text.len(), |i| span.end + i + 1);

    if text[line_start..span.start].trim().is_empty() && text[span.end..line_end].trim().is_empty() {
        line_start..line_end
    } else {
        span
    }
}

/// Applies non-overlapping `(range, replacement)` edits. An edit starting
/// inside an earlier one is dropped.
pub fn apply_edits(text: &str, mut edits: Vec<(Range<usize>, String)>) -> String {
    edits.sort_by_key(|(range, _)| range.start);

    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    for (range, replacement) in edits {
        if range.start < pos {
            continue;
        }
        out.push_str(&text[pos..range.start]);
        out.push_str(&replacement);
        pos = range.end;
    }
    out.push_str(&text[pos..]);
    out
}

/// Checks that `text` parses as a complete XML document.
pub fn validate(text: &str) -> Result<(), String> {
    use xml::reader::XmlEvent;

    let reader = xml::EventReader::new(text.as_bytes());
    for event in reader {
        match event {
            Ok(XmlEvent::EndDocument) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
    Err("document ended unexpectedly".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<!-- <activity android:name="commented.Out"/> -->
<manifest xmlns:android="http://schemas.android.com/apk/res/android">
    <application android:label="a &amp; b">
        <activity android:name="com.example.Main"
            android:exported="true">
            <intent-filter>
                <action android:name="android.intent.action.MAIN"/>
            </intent-filter>
        </activity>
        <provider android:name="p" android:authorities='x/>y' />
    </application>
</manifest>
"#;

    #[test]
    fn test_locate_elements_spans() {
        let elements = locate_elements(DOC).unwrap();
        let names: Vec<&str> = elements.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["manifest", "application", "activity", "intent-filter", "action", "provider"]
        );

        let activity = &elements[2];
        assert!(DOC[activity.span.clone()].starts_with("<activity"));
        assert!(DOC[activity.span.clone()].ends_with("</activity>"));
        assert_eq!(activity.attribute("name"), Some("com.example.Main"));

        let provider = &elements[5];
        assert_eq!(provider.attribute("authorities"), Some("x/>y"));
        assert!(DOC[provider.span.clone()].starts_with("<provider"));
        assert!(DOC[provider.span.clone()].ends_with("'x/>y' />"));

        assert_eq!(elements[1].attribute("label"), Some("a & b"));
    }

    #[test]
    fn test_locate_elements_decodes_character_references() {
        let text = "<manifest xmlns:android=\"http://schemas.android.com/apk/res/android\">\n\
                    \t<uses-permission android:name=\"com.android.vending.CHECK&#95;LICENSE\"/>\n\
                    </manifest>\n";
        let elements = locate_elements(text).unwrap();
        let permission = &elements[1];
        assert_eq!(permission.attribute("name"), Some("com.android.vending.CHECK_LICENSE"));
        assert_eq!(
            &text[permission.span.clone()],
            "<uses-permission android:name=\"com.android.vending.CHECK&#95;LICENSE\"/>"
        );
    }

    #[test]
    fn test_locate_elements_with_doctype_bom_and_multibyte_text() {
        let text = "\u{feff}<?xml version=\"1.0\"?>\r\n\
                    <!DOCTYPE paths [\r\n  <!ENTITY dir \"Pictures\">\r\n]>\r\n\
                    <paths>\r\n  <!-- <external-path name=\"x\"/> -->\r\n\
                    \u{e9}\u{e9}<external-path name=\"\u{e9}\" path=\".\"></external-path>\r\n\
                    </paths>\r\n";
        let elements = locate_elements(text).unwrap();
        assert_eq!(elements.len(), 2);
        let path = &elements[1];
        assert_eq!(path.attribute("name"), Some("\u{e9}"));
        assert_eq!(
            &text[path.span.clone()],
            "<external-path name=\"\u{e9}\" path=\".\"></external-path>"
        );
        assert!(text[elements[0].span.clone()].ends_with("</paths>"));
    }

    #[test]
    fn test_malformed_document_is_error() {
        assert!(locate_elements("<a><b></a></b>").is_err());
        assert!(locate_elements("<a>").is_err());
        assert!(locate_elements("<a b=c/>").is_err());
    }

    #[test]
    fn test_line_aware_removal() {
        let text = "<a>\n    <b/>\n    <c/><d/>\n</a>\n";
        let b = text.find("<b/>").unwrap();
        assert_eq!(&text[line_aware(text, b..b + 4)], "    <b/>\n");
        let c = text.find("<c/>").unwrap();
        assert_eq!(line_aware(text, c..c + 4), c..c + 4);
    }

    #[test]
    fn test_apply_edits_in_order() {
        let text = "0123456789";
        let edits = vec![(6..8, "x".to_string()), (1..3, String::new()), (2..4, "y".to_string())];
        assert_eq!(apply_edits(text, edits), "0345x89");
    }

    #[test]
    fn test_validate() {
        assert!(validate(DOC).is_ok());
        assert!(validate("<a><b></a>").is_err());
    }
}
