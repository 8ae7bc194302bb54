//! Fixture builders for unit and integration tests.
//!
//! Enabled for the crate's own tests and, through the `test-support`
//! feature, for integration tests. Builders panic on misuse; they are never
//! part of a production code path.

use crate::archive::EntryMap;
use crate::archive::extraction::read_nested;
use crate::archive::packaging::build_nested;
use crate::artifact::ArtifactId;
use crate::artifact::layout::{CLASSES_JAR, MANIFEST_FILE};
use crate::artifact::manifest::ManifestDescriptor;
use crate::error::{FuseError, Result, io_failure};
use crate::merge::{Origin, WorkingTree, compiled_key};
use crate::report::FusionReport;
use camino::Utf8Path;
use std::collections::BTreeMap;
use std::fs;

pub use crate::relocation::class_file::MAX_SUPPORTED_MAJOR;

/// Builds a minimal but valid class file.
///
/// The class extends `java/lang/Object`, has no methods, and carries the
/// requested class references, string literals, fields and an optional
/// class-level `Signature` attribute.
#[derive(Debug, Clone)]
pub struct ClassFileBuilder {
    name: String,
    major: u16,
    class_refs: Vec<String>,
    strings: Vec<String>,
    fields: Vec<(String, String)>,
    signature: Option<String>,
}

impl ClassFileBuilder {
    /// A class declaring internal name `name`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            major: 52,
            class_refs: Vec::new(),
            strings: Vec::new(),
            fields: Vec::new(),
            signature: None,
        }
    }

    /// Add a `CONSTANT_Class` reference to internal name or array descriptor.
    #[must_use]
    pub fn class_ref(mut self, name: &str) -> Self {
        self.class_refs.push(name.to_owned());
        self
    }

    /// Add a `CONSTANT_String` literal.
    #[must_use]
    pub fn string(mut self, text: &str) -> Self {
        self.strings.push(text.to_owned());
        self
    }

    /// Add a public field.
    #[must_use]
    pub fn field(mut self, name: &str, descriptor: &str) -> Self {
        self.fields.push((name.to_owned(), descriptor.to_owned()));
        self
    }

    /// Set the class-level generic signature.
    #[must_use]
    pub fn signature(mut self, signature: &str) -> Self {
        self.signature = Some(signature.to_owned());
        self
    }

    /// Set the major format version.
    #[must_use]
    pub const fn version(mut self, major: u16) -> Self {
        self.major = major;
        self
    }

    /// Serialise the class.
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let mut pool = Pool::default();
        let this_class = pool.class(&self.name);
        let super_class = pool.class("java/lang/Object");
        for name in &self.class_refs {
            pool.class(name);
        }
        for text in &self.strings {
            let utf8 = pool.utf8(text);
            pool.push(8, &utf8.to_be_bytes());
        }
        let fields: Vec<(u16, u16)> = self
            .fields
            .iter()
            .map(|(name, descriptor)| (pool.utf8(name), pool.utf8(descriptor)))
            .collect();
        let signature = self
            .signature
            .as_ref()
            .map(|signature| (pool.utf8("Signature"), pool.utf8(signature)));

        let mut out = vec![0xCA, 0xFE, 0xBA, 0xBE, 0, 0];
        out.extend_from_slice(&self.major.to_be_bytes());
        out.extend_from_slice(&pool.count.to_be_bytes());
        out.extend_from_slice(&pool.bytes);
        out.extend_from_slice(&0x0021u16.to_be_bytes());
        out.extend_from_slice(&this_class.to_be_bytes());
        out.extend_from_slice(&super_class.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&u16_len(fields.len()).to_be_bytes());
        for (name, descriptor) in fields {
            out.extend_from_slice(&0x0001u16.to_be_bytes());
            out.extend_from_slice(&name.to_be_bytes());
            out.extend_from_slice(&descriptor.to_be_bytes());
            out.extend_from_slice(&0u16.to_be_bytes());
        }
        out.extend_from_slice(&0u16.to_be_bytes());
        match signature {
            Some((attribute, value)) => {
                out.extend_from_slice(&1u16.to_be_bytes());
                out.extend_from_slice(&attribute.to_be_bytes());
                out.extend_from_slice(&2u32.to_be_bytes());
                out.extend_from_slice(&value.to_be_bytes());
            }
            None => out.extend_from_slice(&0u16.to_be_bytes()),
        }
        out
    }
}

struct Pool {
    bytes: Vec<u8>,
    count: u16,
    utf8: BTreeMap<String, u16>,
    classes: BTreeMap<String, u16>,
}

impl Default for Pool {
    fn default() -> Self {
        Self {
            bytes: Vec::new(),
            count: 1,
            utf8: BTreeMap::new(),
            classes: BTreeMap::new(),
        }
    }
}

impl Pool {
    fn push(&mut self, tag: u8, payload: &[u8]) -> u16 {
        self.bytes.push(tag);
        self.bytes.extend_from_slice(payload);
        let index = self.count;
        self.count += 1;
        index
    }

    fn utf8(&mut self, text: &str) -> u16 {
        if let Some(index) = self.utf8.get(text) {
            return *index;
        }
        let encoded = crate::relocation::mutf8::encode(text);
        let mut payload = u16_len(encoded.len()).to_be_bytes().to_vec();
        payload.extend_from_slice(&encoded);
        let index = self.push(1, &payload);
        self.utf8.insert(text.to_owned(), index);
        index
    }

    fn class(&mut self, name: &str) -> u16 {
        if let Some(index) = self.classes.get(name) {
            return *index;
        }
        let utf8 = self.utf8(name);
        let index = self.push(7, &utf8.to_be_bytes());
        self.classes.insert(name.to_owned(), index);
        index
    }
}

#[expect(clippy::expect_used, reason = "fixture sizes are tiny")]
fn u16_len(len: usize) -> u16 {
    u16::try_from(len).expect("fixture constant fits in u16")
}

/// Every Utf8 constant of a class file, in pool order.
///
/// # Errors
///
/// Returns a description of the defect when the class cannot be parsed.
pub fn utf8_constants(bytes: &[u8]) -> std::result::Result<Vec<String>, String> {
    crate::relocation::class_file::utf8_constants(bytes)
}

/// The internal name a class file declares for itself.
///
/// # Errors
///
/// Returns a description of the defect when the class cannot be parsed.
pub fn declared_name(bytes: &[u8]) -> std::result::Result<String, String> {
    crate::relocation::class_file::declared_name(bytes)
}

/// Serialise a `.kotlin_module` record listing `(package, facades)` parts.
#[must_use]
pub fn kotlin_module(version: &[i32], packages: &[(&str, &[&str])]) -> Vec<u8> {
    crate::relocation::kotlin_module::encode_record(version, packages)
}

/// The `(package, facades)` parts of a `.kotlin_module` record.
///
/// # Errors
///
/// Returns a description of the defect when the record cannot be decoded.
pub fn kotlin_module_packages(
    bytes: &[u8],
) -> std::result::Result<Vec<(String, Vec<String>)>, String> {
    crate::relocation::kotlin_module::decode_packages(bytes)
}

/// A working tree whose inputs each contribute the named classes.
///
/// The first input is primary. Input `id` declares namespace `com.<id>`
/// and the merged manifest is the primary's.
#[must_use]
pub fn tree_with_classes(inputs: &[(&str, &[&str])]) -> WorkingTree {
    let built: Vec<(&str, Vec<Vec<u8>>)> = inputs
        .iter()
        .map(|(id, classes)| {
            let bytes = classes
                .iter()
                .map(|name| ClassFileBuilder::new(name).build())
                .collect();
            (*id, bytes)
        })
        .collect();
    tree_with_class_files(&built)
}

/// Like [`tree_with_classes`], from prebuilt class files.
///
/// # Panics
///
/// Panics when a class file cannot be parsed.
#[must_use]
#[expect(clippy::expect_used, reason = "fixtures are built from valid class files")]
pub fn tree_with_class_files(inputs: &[(&str, Vec<Vec<u8>>)]) -> WorkingTree {
    let mut class_files = EntryMap::new();
    let mut provenance = BTreeMap::new();
    let mut origins = Vec::new();
    for (index, (name, classes)) in inputs.iter().enumerate() {
        let id = ArtifactId::from(*name);
        for bytes in classes {
            let path = format!("{}.class", declared_name(bytes).expect("valid class file"));
            provenance.insert(compiled_key(&path), id.clone());
            class_files.insert(path, bytes.clone());
        }
        origins.push(Origin {
            namespace: Some(format!("com.{id}")),
            id,
            primary: index == 0,
        });
    }
    let package = origins
        .first()
        .and_then(|origin| origin.namespace.clone())
        .unwrap_or_else(|| "com.app".to_owned());
    let manifest = ManifestDescriptor::parse(manifest_text(&package), "fixture")
        .expect("fixture manifest is well-formed");
    WorkingTree {
        report: FusionReport {
            inputs: origins.iter().map(|o| o.id.clone()).collect(),
            ..FusionReport::default()
        },
        origins,
        manifest,
        class_files,
        java_resources: EntryMap::new(),
        language_metadata: EntryMap::new(),
        resource_files: EntryMap::new(),
        assets: EntryMap::new(),
        native_libraries: EntryMap::new(),
        interface_files: EntryMap::new(),
        rules: String::new(),
        symbol_list: None,
        passthrough: EntryMap::new(),
        provenance,
    }
}

/// A minimal manifest declaring `package`.
#[must_use]
pub fn manifest_text(package: &str) -> String {
    format!(
        "<manifest xmlns:android=\"http://schemas.android.com/apk/res/android\" \
         package=\"{package}\">\n    <application/>\n</manifest>\n"
    )
}

/// Builds library archives (`.aar`) on disk.
#[derive(Debug, Clone, Default)]
pub struct AarBuilder {
    manifest: Option<String>,
    classes: EntryMap,
    entries: EntryMap,
}

impl AarBuilder {
    /// An archive whose manifest declares `package`.
    #[must_use]
    pub fn new(package: &str) -> Self {
        Self {
            manifest: Some(manifest_text(package)),
            ..Self::default()
        }
    }

    /// An archive without a manifest, which is not a valid library package.
    #[must_use]
    pub fn without_manifest() -> Self {
        Self::default()
    }

    /// Replace the manifest text.
    #[must_use]
    pub fn manifest(mut self, text: &str) -> Self {
        self.manifest = Some(text.to_owned());
        self
    }

    /// Add a class built with [`ClassFileBuilder`] to `classes.jar`.
    ///
    /// # Panics
    ///
    /// Panics when `bytes` is not a parsable class file.
    #[must_use]
    #[expect(clippy::expect_used, reason = "fixtures are built from valid class files")]
    pub fn class(mut self, bytes: Vec<u8>) -> Self {
        let path = format!("{}.class", declared_name(&bytes).expect("valid class file"));
        self.classes.insert(path, bytes);
        self
    }

    /// Add a non-class entry to `classes.jar`.
    #[must_use]
    pub fn jar_entry(mut self, path: &str, bytes: &[u8]) -> Self {
        self.classes.insert(path.to_owned(), bytes.to_vec());
        self
    }

    /// Add a top-level archive entry.
    #[must_use]
    pub fn entry(mut self, path: &str, bytes: &[u8]) -> Self {
        self.entries.insert(path.to_owned(), bytes.to_vec());
        self
    }

    /// The top-level entries, with `classes.jar` assembled.
    ///
    /// # Errors
    ///
    /// Propagates archive-writing failures.
    pub fn entries(&self) -> Result<EntryMap> {
        let mut entries = self.entries.clone();
        if let Some(manifest) = &self.manifest {
            entries.insert(MANIFEST_FILE.to_owned(), manifest.clone().into_bytes());
        }
        if !self.classes.is_empty() {
            let jar = build_nested(&self.classes, Utf8Path::new(CLASSES_JAR))?;
            entries.insert(CLASSES_JAR.to_owned(), jar);
        }
        Ok(entries)
    }

    /// Write the archive to `path`.
    ///
    /// # Errors
    ///
    /// Propagates archive-writing and I/O failures.
    pub fn write(&self, path: &Utf8Path) -> Result<()> {
        let bytes = build_nested(&self.entries()?, path)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_failure(parent))?;
        }
        fs::write(path, bytes).map_err(io_failure(path))
    }
}

/// Top-level entries of the archive at `path`.
///
/// # Errors
///
/// Returns [`FuseError::CorruptArchive`] or [`FuseError::IoFailure`].
pub fn read_archive(path: &Utf8Path) -> Result<EntryMap> {
    let bytes = fs::read(path).map_err(io_failure(path))?;
    read_nested(&bytes, path)
}

/// Entries of the `classes.jar` inside the archive at `path`.
///
/// # Errors
///
/// Returns [`FuseError::CorruptArchive`] when the archive or its
/// compiled-code archive is missing or unreadable.
pub fn read_classes(path: &Utf8Path) -> Result<EntryMap> {
    let entries = read_archive(path)?;
    let jar = entries.get(CLASSES_JAR).ok_or_else(|| FuseError::CorruptArchive {
        path: path.to_owned(),
        reason: format!("no {CLASSES_JAR}"),
    })?;
    read_nested(jar, &path.join(CLASSES_JAR))
}
