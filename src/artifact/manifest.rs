//! The manifest descriptor of a library package.
//!
//! The descriptor keeps its source text as the canonical form, because every
//! later stage (merge, relocation, packaging) works on the text. Parsing
//! validates that the text is well-formed XML with a `<manifest>` root and
//! extracts the declared namespace (the root's `package` attribute).

use crate::error::{FuseError, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

/// Parsed manifest descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDescriptor {
    text: String,
    package: Option<String>,
}

impl ManifestDescriptor {
    /// Parse descriptor text.
    ///
    /// `origin` names the source in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::MalformedManifest`] if the text is not well-formed
    /// or its root element is not `<manifest>`.
    pub fn parse(text: impl Into<String>, origin: &str) -> Result<Self> {
        let source = text.into();
        let package = scan_root(&source).map_err(|reason| FuseError::MalformedManifest {
            origin: origin.to_owned(),
            reason,
        })?;
        Ok(Self { text: source, package })
    }

    /// The namespace declared on the root element.
    #[must_use]
    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    /// The canonical text form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Consume the descriptor and return its text.
    #[must_use]
    pub fn into_string(self) -> String {
        self.text
    }
}

/// Walk the whole document and return the root's `package` attribute.
fn scan_root(text: &str) -> std::result::Result<Option<String>, String> {
    let mut reader = Reader::from_str(text);
    let mut root: Option<Option<String>> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(element) | Event::Empty(element)) if root.is_none() => {
                if element.local_name().as_ref() != b"manifest" {
                    return Err(format!(
                        "root element is <{}>, expected <manifest>",
                        String::from_utf8_lossy(element.name().as_ref())
                    ));
                }
                root = Some(attribute_value(&element, b"package")?);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
    root.ok_or_else(|| "document has no root element".to_owned())
}

/// Return the unescaped value of attribute `key` (a full qualified name such
/// as `android:name`) on `element`.
pub(crate) fn attribute_value(
    element: &BytesStart<'_>,
    key: &[u8],
) -> std::result::Result<Option<String>, String> {
    for parsed in element.attributes() {
        let attribute = parsed.map_err(|e| e.to_string())?;
        if attribute.key.as_ref() == key {
            let value = attribute.unescape_value().map_err(|e| e.to_string())?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests fail loudly on broken fixtures")]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parses_package_attribute() {
        let text = r#"<?xml version="1.0" encoding="utf-8"?>
<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.acme.core">
    <application />
</manifest>"#;
        let manifest = ManifestDescriptor::parse(text, "core").expect("valid manifest");
        assert_eq!(manifest.package(), Some("com.acme.core"));
        assert_eq!(manifest.as_str(), text);
    }

    #[test]
    fn package_is_optional() {
        let manifest = ManifestDescriptor::parse("<manifest/>", "bare").expect("valid manifest");
        assert_eq!(manifest.package(), None);
    }

    #[rstest]
    #[case::wrong_root("<resources/>")]
    #[case::unclosed("<manifest package=\"a\"><application></manifest>")]
    #[case::empty("")]
    fn rejects_malformed_documents(#[case] text: &str) {
        let result = ManifestDescriptor::parse(text, "broken");
        assert!(
            matches!(result, Err(FuseError::MalformedManifest { .. })),
            "expected MalformedManifest for {text:?}"
        );
    }
}
