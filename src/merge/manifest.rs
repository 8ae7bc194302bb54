//! Manifest merging.
//!
//! Merging manifest semantics belongs to an external collaborator; the
//! planner only hands it the primary descriptor, the secondaries and the
//! caller's [`ManifestSettings`], and receives one descriptor back. The
//! [`ManifestMerger`] trait is that seam.
//!
//! [`BasicManifestMerger`] is the collaborator used when the host does not
//! supply its own. It keeps the primary document as written and splices in:
//!
//! - `uses-permission` and `uses-feature` declarations of the secondaries;
//! - `application` components (`activity`, `activity-alias`, `service`,
//!   `receiver`, `provider`, `meta-data`) of the secondaries, with relative
//!   class names (`.Foo`) expanded against the declaring package;
//! - the package override, version fields and SDK levels from the settings.
//!
//! Declarations are keyed by element name and `android:name`. The same key
//! declared with different content is a [`FuseError::ManifestMergeConflict`].
//! Placeholders such as `${applicationId}` are never substituted.

use crate::artifact::manifest::{ManifestDescriptor, attribute_value};
use crate::error::{FuseError, Result};
use log::debug;
use quick_xml::Writer;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

/// Caller-supplied values forwarded to the manifest merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManifestSettings {
    /// Replaces the primary's `package` attribute.
    pub package_override: Option<String>,
    /// Written to `android:versionCode`.
    pub version_code: Option<u32>,
    /// Written to `android:versionName`.
    pub version_name: Option<String>,
    /// Written to `<uses-sdk android:minSdkVersion>`.
    pub min_sdk: Option<u32>,
    /// Written to `<uses-sdk android:targetSdkVersion>`.
    pub target_sdk: Option<u32>,
    /// Written to `<uses-sdk android:maxSdkVersion>`.
    pub max_sdk: Option<u32>,
    /// Placeholder values; forwarded to the collaborator, never substituted
    /// by the basic merger.
    pub placeholders: BTreeMap<String, String>,
}

impl ManifestSettings {
    fn root_attributes(&self) -> Vec<(&'static str, String)> {
        let mut attributes = Vec::new();
        if let Some(package) = &self.package_override {
            attributes.push(("package", package.clone()));
        }
        if let Some(code) = self.version_code {
            attributes.push(("android:versionCode", code.to_string()));
        }
        if let Some(name) = &self.version_name {
            attributes.push(("android:versionName", name.clone()));
        }
        attributes
    }

    fn sdk_attributes(&self) -> Vec<(&'static str, String)> {
        [
            ("android:minSdkVersion", self.min_sdk),
            ("android:targetSdkVersion", self.target_sdk),
            ("android:maxSdkVersion", self.max_sdk),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key, v.to_string())))
        .collect()
    }
}

/// Inputs handed to the manifest-merge collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestMergeRequest {
    /// The base document.
    pub primary: ManifestDescriptor,
    /// Secondary documents in resolution order.
    pub secondaries: Vec<ManifestDescriptor>,
    /// Package override, version fields and placeholders.
    pub settings: ManifestSettings,
}

/// The manifest-merge collaborator.
#[cfg_attr(test, mockall::automock)]
pub trait ManifestMerger: Send + Sync {
    /// Merge `request` into one descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::ManifestMergeConflict`] when the inputs cannot be
    /// reconciled, or [`FuseError::MalformedManifest`] for unreadable input.
    fn merge(&self, request: &ManifestMergeRequest) -> Result<ManifestDescriptor>;
}

/// Default collaborator: union of permissions, features and components.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicManifestMerger;

impl ManifestMerger for BasicManifestMerger {
    fn merge(&self, request: &ManifestMergeRequest) -> Result<ManifestDescriptor> {
        let primary_origin = request.primary.package().unwrap_or("primary manifest");
        let primary_package = request.primary.package();
        let mut text = request.primary.as_str().to_owned();
        let mut layout = scan(&text, primary_package).map_err(malformed(primary_origin))?;

        let mut seen: BTreeMap<DeclarationKey, String> = layout
            .declarations
            .iter()
            .map(|d| (d.key.clone(), normalise(&d.text)))
            .collect();
        let mut permissions = Vec::new();
        let mut components = Vec::new();

        for secondary in &request.secondaries {
            let origin = secondary.package().unwrap_or("secondary manifest");
            let scanned = scan(secondary.as_str(), secondary.package()).map_err(malformed(origin))?;
            for declaration in scanned.declarations {
                let normalised = normalise(&declaration.text);
                match seen.get(&declaration.key) {
                    Some(existing) if *existing == normalised => {
                        debug!("{origin}: {} already declared", declaration.key);
                        continue;
                    }
                    Some(_) => {
                        return Err(FuseError::ManifestMergeConflict {
                            name: declaration.key.to_string(),
                            reason: format!("{origin} declares it differently"),
                        });
                    }
                    None => {}
                }
                seen.insert(declaration.key.clone(), normalised);
                match declaration.section {
                    Section::Manifest => permissions.push(declaration.text),
                    Section::Application => components.push(declaration.text),
                }
            }
        }

        if !request.settings.placeholders.is_empty() {
            debug!(
                "leaving {} manifest placeholder(s) unreplaced",
                request.settings.placeholders.len()
            );
        }

        if let Some(root) = layout.root.as_ref().filter(|r| r.empty) {
            text = open_empty_element(&text, root, "manifest");
            layout = scan(&text, primary_package).map_err(malformed(primary_origin))?;
        }
        if !components.is_empty() {
            if let Some(application) = layout.application.as_ref().filter(|a| a.tag.empty) {
                text = open_empty_element(&text, &application.tag, "application");
                layout = scan(&text, primary_package).map_err(malformed(primary_origin))?;
            }
        }

        let edits = plan_edits(&layout, &request.settings, &permissions, &components)
            .map_err(malformed(primary_origin))?;
        apply_edits(&mut text, edits);
        ManifestDescriptor::parse(text, "merged manifest")
    }
}

fn malformed(origin: &str) -> impl FnOnce(String) -> FuseError + '_ {
    move |reason| FuseError::MalformedManifest {
        origin: origin.to_owned(),
        reason,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Manifest,
    Application,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DeclarationKey {
    element: String,
    name: String,
}

impl fmt::Display for DeclarationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}>", self.element, self.name)
    }
}

#[derive(Debug)]
struct Declaration {
    key: DeclarationKey,
    section: Section,
    text: String,
}

/// Byte span of one start (or empty) tag.
#[derive(Debug)]
struct Tag {
    start: usize,
    end: usize,
    empty: bool,
    element: BytesStart<'static>,
}

#[derive(Debug)]
struct Application {
    tag: Tag,
    close: Option<usize>,
}

#[derive(Debug, Default)]
struct Layout {
    root: Option<Tag>,
    uses_sdk: Option<Tag>,
    application: Option<Application>,
    manifest_close: Option<usize>,
    declarations: Vec<Declaration>,
}

const MANIFEST_DECLARATIONS: [&str; 3] = ["uses-permission", "uses-permission-sdk-23", "uses-feature"];
const APPLICATION_COMPONENTS: [&str; 6] = [
    "activity",
    "activity-alias",
    "service",
    "receiver",
    "provider",
    "meta-data",
];

struct Capture {
    start: usize,
    depth: usize,
    key: DeclarationKey,
    section: Section,
}

/// Walk `text`, recording the spans the merge edits and every mergeable
/// declaration. Relative component names are expanded against `package`.
fn scan(text: &str, package: Option<&str>) -> std::result::Result<Layout, String> {
    let mut reader = Reader::from_str(text);
    let mut layout = Layout::default();
    let mut depth = 0usize;
    let mut in_application = false;
    let mut capture: Option<Capture> = None;

    loop {
        let event = reader.read_event().map_err(|e| e.to_string())?;
        let end = position(&reader);
        match event {
            Event::Start(element) | Event::Empty(element) if depth == 0 && layout.root.is_none() => {
                let empty = text.get(..end).is_some_and(|t| t.ends_with("/>"));
                if element.local_name().as_ref() != b"manifest" {
                    return Err("root element is not <manifest>".to_owned());
                }
                layout.root = Some(tag(text, end, empty, &element));
                if !empty {
                    depth += 1;
                }
            }
            Event::Start(element) => {
                let start = tag_start(text, end);
                if capture.is_none() {
                    if let Some((key, section)) =
                        declaration_key(&element, depth, in_application)?
                    {
                        capture = Some(Capture {
                            start,
                            depth,
                            key,
                            section,
                        });
                    }
                }
                if depth == 1 && element.name().as_ref() == b"application" {
                    in_application = true;
                    layout.application = Some(Application {
                        tag: tag(text, end, false, &element),
                        close: None,
                    });
                } else if depth == 1 && element.name().as_ref() == b"uses-sdk" {
                    layout.uses_sdk = Some(tag(text, end, false, &element));
                }
                depth += 1;
            }
            Event::Empty(element) => {
                let start = tag_start(text, end);
                if capture.is_none() {
                    if let Some((key, section)) =
                        declaration_key(&element, depth, in_application)?
                    {
                        let raw = text.get(start..end).unwrap_or_default();
                        layout.declarations.push(declaration(raw, key, section, package)?);
                    }
                }
                if depth == 1 && element.name().as_ref() == b"application" {
                    layout.application = Some(Application {
                        tag: tag(text, end, true, &element),
                        close: None,
                    });
                } else if depth == 1 && element.name().as_ref() == b"uses-sdk" {
                    layout.uses_sdk = Some(tag(text, end, true, &element));
                }
            }
            Event::End(element) => {
                depth = depth.saturating_sub(1);
                let start = tag_start(text, end);
                if let Some(open) = capture.take_if(|c| c.depth == depth) {
                    let raw = text.get(open.start..end).unwrap_or_default();
                    layout
                        .declarations
                        .push(declaration(raw, open.key, open.section, package)?);
                }
                if depth == 1 && element.name().as_ref() == b"application" {
                    in_application = false;
                    if let Some(application) = layout.application.as_mut() {
                        application.close = Some(start);
                    }
                } else if depth == 0 {
                    layout.manifest_close = Some(start);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if layout.root.is_none() {
        return Err("document has no root element".to_owned());
    }
    Ok(layout)
}

fn position(reader: &Reader<&[u8]>) -> usize {
    usize::try_from(reader.buffer_position()).unwrap_or(usize::MAX)
}

/// Start offset of the tag that ends at `end`. Markup cannot contain a raw
/// `<`, so the last one before `end` opens the tag.
fn tag_start(text: &str, end: usize) -> usize {
    text.get(..end).and_then(|t| t.rfind('<')).unwrap_or(0)
}

fn tag(text: &str, end: usize, empty: bool, element: &BytesStart<'_>) -> Tag {
    Tag {
        start: tag_start(text, end),
        end,
        empty,
        element: element.clone().into_owned(),
    }
}

fn declaration_key(
    element: &BytesStart<'_>,
    depth: usize,
    in_application: bool,
) -> std::result::Result<Option<(DeclarationKey, Section)>, String> {
    let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
    let section = match depth {
        1 if MANIFEST_DECLARATIONS.contains(&name.as_str()) => Section::Manifest,
        2 if in_application && APPLICATION_COMPONENTS.contains(&name.as_str()) => {
            Section::Application
        }
        _ => return Ok(None),
    };
    let identity = match attribute_value(element, b"android:name")? {
        Some(value) => Some(value),
        None => attribute_value(element, b"android:glEsVersion")?,
    };
    Ok(identity.map(|value| {
        (
            DeclarationKey {
                element: name,
                name: value,
            },
            section,
        )
    }))
}

fn declaration(
    raw: &str,
    mut key: DeclarationKey,
    section: Section,
    package: Option<&str>,
) -> std::result::Result<Declaration, String> {
    let mut text = raw.to_owned();
    if let (Section::Application, Some(package)) = (section, package) {
        if key.element != "meta-data" && key.name.starts_with('.') {
            key.name = format!("{package}{}", key.name);
            text = rewrite_start_tag(raw, &[("android:name", key.name.clone())])?;
        }
    }
    Ok(Declaration { key, section, text })
}

/// Replace or add attributes on the first tag of `raw`, keeping the rest of
/// `raw` untouched.
fn rewrite_start_tag(
    raw: &str,
    updates: &[(&str, String)],
) -> std::result::Result<String, String> {
    let mut reader = Reader::from_str(raw);
    let event = reader.read_event().map_err(|e| e.to_string())?;
    let end = position(&reader);
    let (element, empty) = match event {
        Event::Start(element) => (element, false),
        Event::Empty(element) => (element, true),
        _ => return Ok(raw.to_owned()),
    };
    let rendered = render_tag(&with_attributes(&element, updates)?, empty)?;
    Ok(format!("{rendered}{}", raw.get(end..).unwrap_or_default()))
}

fn with_attributes(
    element: &BytesStart<'_>,
    updates: &[(&str, String)],
) -> std::result::Result<BytesStart<'static>, String> {
    let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
    let mut rebuilt = BytesStart::new(name);
    let mut pending: Vec<&(&str, String)> = updates.iter().collect();
    for parsed in element.attributes() {
        let attribute = parsed.map_err(|e| e.to_string())?;
        let position = pending
            .iter()
            .position(|(key, _)| key.as_bytes() == attribute.key.as_ref());
        match position {
            Some(index) => {
                let (key, value) = pending.remove(index);
                rebuilt.push_attribute((*key, value.as_str()));
            }
            None => rebuilt.push_attribute(attribute),
        }
    }
    for (key, value) in pending {
        rebuilt.push_attribute((*key, value.as_str()));
    }
    Ok(rebuilt)
}

fn render_tag(element: &BytesStart<'_>, empty: bool) -> std::result::Result<String, String> {
    let mut writer = Writer::new(Vec::new());
    let event = if empty {
        Event::Empty(element.borrow())
    } else {
        Event::Start(element.borrow())
    };
    writer.write_event(event).map_err(|e| e.to_string())?;
    String::from_utf8(writer.into_inner()).map_err(|e| e.to_string())
}

/// Turn `<name .../>` into `<name ...></name>`.
fn open_empty_element(text: &str, tag: &Tag, name: &str) -> String {
    let raw = text.get(tag.start..tag.end).unwrap_or_default();
    let opened = raw.strip_suffix("/>").unwrap_or(raw).trim_end();
    format!(
        "{}{opened}></{name}>{}",
        text.get(..tag.start).unwrap_or_default(),
        text.get(tag.end..).unwrap_or_default()
    )
}

struct Edit {
    start: usize,
    end: usize,
    replacement: String,
}

fn plan_edits(
    layout: &Layout,
    settings: &ManifestSettings,
    permissions: &[String],
    components: &[String],
) -> std::result::Result<Vec<Edit>, String> {
    let mut edits = Vec::new();
    let root = layout
        .root
        .as_ref()
        .ok_or_else(|| "document has no root element".to_owned())?;

    let root_attributes = settings.root_attributes();
    if !root_attributes.is_empty() {
        edits.push(Edit {
            start: root.start,
            end: root.end,
            replacement: render_tag(&with_attributes(&root.element, &root_attributes)?, false)?,
        });
    }

    let sdk_attributes = settings.sdk_attributes();
    if !sdk_attributes.is_empty() {
        match &layout.uses_sdk {
            Some(sdk) => edits.push(Edit {
                start: sdk.start,
                end: sdk.end,
                replacement: render_tag(&with_attributes(&sdk.element, &sdk_attributes)?, sdk.empty)?,
            }),
            None => edits.push(Edit {
                start: root.end,
                end: root.end,
                replacement: format!(
                    "\n    {}",
                    render_tag(&with_attributes(&BytesStart::new("uses-sdk"), &sdk_attributes)?, true)?
                ),
            }),
        }
    }

    let manifest_close = layout
        .manifest_close
        .ok_or_else(|| "unterminated <manifest>".to_owned())?;

    if !permissions.is_empty() {
        let at = layout
            .application
            .as_ref()
            .map_or(manifest_close, |a| a.tag.start);
        let block: String = permissions.iter().map(|p| format!("{p}\n    ")).collect();
        edits.push(Edit {
            start: at,
            end: at,
            replacement: block,
        });
    }

    if !components.is_empty() {
        let block: String = components.iter().map(|c| format!("    {c}\n    ")).collect();
        match layout.application.as_ref().and_then(|a| a.close) {
            Some(close) => edits.push(Edit {
                start: close,
                end: close,
                replacement: block,
            }),
            None => edits.push(Edit {
                start: manifest_close,
                end: manifest_close,
                replacement: format!("    <application>\n    {block}</application>\n"),
            }),
        }
    }

    Ok(edits)
}

fn apply_edits(text: &mut String, mut edits: Vec<Edit>) {
    edits.sort_by(|a, b| b.start.cmp(&a.start));
    for edit in edits {
        text.replace_range(edit.start..edit.end, &edit.replacement);
    }
}

fn normalise(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests fail loudly on broken fixtures")]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    const PRIMARY: &str = r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.acme.core">
    <uses-permission android:name="android.permission.INTERNET" />
    <application>
        <activity android:name=".MainActivity" />
    </application>
</manifest>"#;

    fn descriptor(text: &str) -> ManifestDescriptor {
        ManifestDescriptor::parse(text, "test").expect("valid manifest")
    }

    #[fixture]
    fn secondary() -> ManifestDescriptor {
        descriptor(
            r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.lib">
    <uses-permission android:name="android.permission.INTERNET" />
    <uses-permission android:name="android.permission.CAMERA" />
    <application>
        <activity android:name=".LibActivity">
            <intent-filter><action android:name="com.lib.OPEN" /></intent-filter>
        </activity>
        <meta-data android:name="com.lib.key" android:value="${libKey}" />
    </application>
</manifest>"#,
        )
    }

    fn request(primary: &str, secondaries: Vec<ManifestDescriptor>) -> ManifestMergeRequest {
        ManifestMergeRequest {
            primary: descriptor(primary),
            secondaries,
            settings: ManifestSettings::default(),
        }
    }

    #[rstest]
    fn unions_permissions_and_components(secondary: ManifestDescriptor) {
        let merged = BasicManifestMerger
            .merge(&request(PRIMARY, vec![secondary]))
            .expect("merge succeeds");
        let text = merged.as_str();

        assert_eq!(text.matches("android.permission.INTERNET").count(), 1);
        assert!(text.contains("android.permission.CAMERA"));
        assert!(text.contains(r#"android:name="com.lib.LibActivity""#));
        assert!(text.contains("com.lib.OPEN"));
        assert!(text.contains("${libKey}"), "placeholders stay unreplaced");
        assert_eq!(merged.package(), Some("com.acme.core"));
        let camera = text.find("CAMERA").expect("camera permission");
        let application = text.find("<application").expect("application");
        assert!(camera < application, "permissions precede <application>");
    }

    #[test]
    fn conflicting_component_fails() {
        let primary = r#"<manifest xmlns:android="a" package="com.acme"><application><service android:name="com.lib.Sync" android:exported="false" /></application></manifest>"#;
        let secondary = descriptor(
            r#"<manifest xmlns:android="a" package="com.lib"><application><service android:name=".Sync" android:exported="true" /></application></manifest>"#,
        );
        let result = BasicManifestMerger.merge(&request(primary, vec![secondary]));
        assert!(matches!(
            result,
            Err(FuseError::ManifestMergeConflict { ref name, .. }) if name.contains("com.lib.Sync")
        ));
    }

    #[rstest]
    #[case::empty_application(r#"<manifest xmlns:android="a" package="com.acme"><application /></manifest>"#)]
    #[case::no_application(r#"<manifest xmlns:android="a" package="com.acme"></manifest>"#)]
    #[case::empty_root(r#"<manifest xmlns:android="a" package="com.acme"/>"#)]
    fn components_land_in_an_application_element(#[case] primary: &str, secondary: ManifestDescriptor) {
        let merged = BasicManifestMerger
            .merge(&request(primary, vec![secondary]))
            .expect("merge succeeds");
        let text = merged.as_str();
        let open = text.find("<application").expect("application open");
        let activity = text.find("com.lib.LibActivity").expect("activity");
        let close = text.find("</application>").expect("application close");
        assert!(open < activity && activity < close, "{text}");
    }

    #[test]
    fn settings_rewrite_root_and_sdk() {
        let mut request = request(PRIMARY, Vec::new());
        request.settings = ManifestSettings {
            package_override: Some("com.acme.fused".to_owned()),
            version_code: Some(7),
            min_sdk: Some(21),
            ..ManifestSettings::default()
        };
        let merged = BasicManifestMerger.merge(&request).expect("merge succeeds");

        assert_eq!(merged.package(), Some("com.acme.fused"));
        assert!(merged.as_str().contains(r#"android:versionCode="7""#));
        assert!(merged.as_str().contains(r#"<uses-sdk android:minSdkVersion="21"/>"#));
    }

    #[test]
    fn mock_collaborator_receives_all_secondaries() {
        let mut mock = MockManifestMerger::new();
        mock.expect_merge()
            .withf(|request| request.secondaries.len() == 2)
            .times(1)
            .returning(|request| Ok(request.primary.clone()));

        let merged = mock
            .merge(&request(
                PRIMARY,
                vec![descriptor("<manifest/>"), descriptor("<manifest/>")],
            ))
            .expect("mock merge");
        assert_eq!(merged.package(), Some("com.acme.core"));
    }
}
