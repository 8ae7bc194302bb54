//! Typed in-memory model of one library package.
//!
//! An [`Artifact`] is created by [`layout::load`] (or [`open`]) and is
//! read-only afterwards. Every file of the package lands in exactly one of its
//! typed collections; files the loader does not recognise are kept verbatim in
//! the passthrough bucket.
//!
//! # Sub-modules
//!
//! - [`layout`]: classification of an extracted package into collections.
//! - [`manifest`]: the parsed manifest descriptor.

pub mod layout;
pub mod manifest;

use crate::archive::EntryMap;
use crate::archive::extraction;
use crate::error::Result;
use camino::{Utf8Path, Utf8PathBuf};
use log::info;
use manifest::ManifestDescriptor;
use serde::Serialize;
use std::fmt;

/// Identity of one input artifact, used in provenance and error messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    /// Return the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive an id from an input path: its file name without extension.
    #[must_use]
    pub fn from_path(path: &Utf8Path) -> Self {
        let stem = path.file_stem().unwrap_or(path.as_str());
        Self(stem.to_owned())
    }
}

impl From<&str> for ArtifactId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ArtifactId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an input is laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub enum InputKind {
    /// A zipped library package (`.aar`).
    #[serde(rename = "aar")]
    LibraryArchive,
    /// A bare compiled-code archive (`.jar`); no manifest required.
    #[serde(rename = "jar")]
    ClassesArchive,
    /// An already-extracted library package.
    #[serde(rename = "directory")]
    Directory,
}

impl InputKind {
    /// Infer the kind from a path: `.jar` files are compiled-code archives,
    /// existing directories are exploded packages, anything else is a
    /// library archive.
    #[must_use]
    pub fn infer(path: &Utf8Path) -> Self {
        if path.extension() == Some("jar") {
            Self::ClassesArchive
        } else if path.is_dir() {
            Self::Directory
        } else {
            Self::LibraryArchive
        }
    }
}

/// One resolved input handed over by the dependency-resolution collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputArtifact {
    /// Identity used in provenance and diagnostics.
    pub id: ArtifactId,
    /// Location of the archive or directory.
    pub path: Utf8PathBuf,
    /// Layout of the input.
    pub kind: InputKind,
}

impl InputArtifact {
    /// Describe an input, deriving its id from the file name.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>, kind: InputKind) -> Self {
        let location = path.into();
        Self {
            id: ArtifactId::from_path(&location),
            path: location,
            kind,
        }
    }

    /// Describe an input whose kind is inferred from its path.
    #[must_use]
    pub fn inferred(path: impl Into<Utf8PathBuf>) -> Self {
        let location = path.into();
        let kind = InputKind::infer(&location);
        Self::new(location, kind)
    }

    /// Override the derived id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<ArtifactId>) -> Self {
        self.id = id.into();
        self
    }
}

/// A consumer rule file fragment together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFile {
    /// Path of the fragment inside its package.
    pub origin: String,
    /// Rule text.
    pub text: String,
}

/// One extracted package.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub(crate) id: ArtifactId,
    pub(crate) root: Utf8PathBuf,
    pub(crate) manifest: Option<ManifestDescriptor>,
    pub(crate) class_files: EntryMap,
    pub(crate) java_resources: EntryMap,
    pub(crate) language_metadata: EntryMap,
    pub(crate) resource_files: EntryMap,
    pub(crate) assets: EntryMap,
    pub(crate) native_libraries: EntryMap,
    pub(crate) interface_files: EntryMap,
    pub(crate) rule_files: Vec<RuleFile>,
    pub(crate) symbol_list: Option<String>,
    pub(crate) passthrough: EntryMap,
}

impl Artifact {
    pub(crate) const fn empty(id: ArtifactId, root: Utf8PathBuf) -> Self {
        Self {
            id,
            root,
            manifest: None,
            class_files: EntryMap::new(),
            java_resources: EntryMap::new(),
            language_metadata: EntryMap::new(),
            resource_files: EntryMap::new(),
            assets: EntryMap::new(),
            native_libraries: EntryMap::new(),
            interface_files: EntryMap::new(),
            rule_files: Vec::new(),
            symbol_list: None,
            passthrough: EntryMap::new(),
        }
    }

    /// The artifact's identity.
    #[must_use]
    pub const fn id(&self) -> &ArtifactId {
        &self.id
    }

    /// Where the artifact was loaded from.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The manifest descriptor; absent only for bare compiled-code archives.
    #[must_use]
    pub const fn manifest(&self) -> Option<&ManifestDescriptor> {
        self.manifest.as_ref()
    }

    /// The namespace declared by the manifest, if any.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.manifest.as_ref().and_then(ManifestDescriptor::package)
    }

    /// Compiled classes keyed by `com/x/Foo.class` paths.
    #[must_use]
    pub const fn class_files(&self) -> &EntryMap {
        &self.class_files
    }

    /// Dotted fully-qualified names of every compiled class.
    pub fn class_names(&self) -> impl Iterator<Item = String> + '_ {
        self.class_files.keys().map(|path| class_name_of(path))
    }

    /// Non-class entries of the compiled-code archives.
    #[must_use]
    pub const fn java_resources(&self) -> &EntryMap {
        &self.java_resources
    }

    /// `META-INF/*.kotlin_module` records.
    #[must_use]
    pub const fn language_metadata(&self) -> &EntryMap {
        &self.language_metadata
    }

    /// Resources keyed by `res/<kind>/<file>`.
    #[must_use]
    pub const fn resource_files(&self) -> &EntryMap {
        &self.resource_files
    }

    /// Raw assets keyed by `assets/...`.
    #[must_use]
    pub const fn assets(&self) -> &EntryMap {
        &self.assets
    }

    /// Native libraries keyed by `jni/<abi>/<file>`.
    #[must_use]
    pub const fn native_libraries(&self) -> &EntryMap {
        &self.native_libraries
    }

    /// Interface definitions keyed by `aidl/<namespace path>/<Type>.aidl`.
    #[must_use]
    pub const fn interface_files(&self) -> &EntryMap {
        &self.interface_files
    }

    /// Consumer rule fragments in package order.
    #[must_use]
    pub fn rule_files(&self) -> &[RuleFile] {
        &self.rule_files
    }

    /// The resource symbol list (`R.txt`), if shipped.
    #[must_use]
    pub fn symbol_list(&self) -> Option<&str> {
        self.symbol_list.as_deref()
    }

    /// Files the loader did not recognise, kept verbatim.
    #[must_use]
    pub const fn passthrough(&self) -> &EntryMap {
        &self.passthrough
    }
}

/// Convert a `com/x/Foo.class` path into the dotted name `com.x.Foo`.
#[must_use]
pub fn class_name_of(path: &str) -> String {
    path.strip_suffix(".class").unwrap_or(path).replace('/', ".")
}

/// Load one input, extracting it under `scratch_dir` when it is an archive.
///
/// Library archives are extracted to `scratch_dir` (cleared first) and then
/// loaded; compiled-code archives are read in memory; directories are loaded
/// in place.
///
/// # Errors
///
/// Propagates extraction and layout errors.
pub fn open(input: &InputArtifact, scratch_dir: &Utf8Path) -> Result<Artifact> {
    info!("loading {} ({:?}) from {}", input.id, input.kind, input.path);
    match input.kind {
        InputKind::LibraryArchive => {
            extraction::extract(&input.path, scratch_dir)?;
            layout::load(scratch_dir, input.id.clone())
        }
        InputKind::ClassesArchive => layout::load_classes_archive(&input.path, input.id.clone()),
        InputKind::Directory => layout::load(&input.path, input.id.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::aar("deps/lib-core.aar", "lib-core")]
    #[case::jar("deps/gson-2.10.jar", "gson-2.10")]
    fn id_is_derived_from_file_stem(#[case] path: &str, #[case] expected: &str) {
        let input = InputArtifact::new(path, InputKind::LibraryArchive);
        assert_eq!(input.id.as_str(), expected);
    }

    #[test]
    fn jar_inputs_are_inferred_as_classes_archives() {
        let input = InputArtifact::inferred("deps/okio.jar");
        assert_eq!(input.kind, InputKind::ClassesArchive);
    }

    #[test]
    fn class_name_of_converts_separators() {
        assert_eq!(class_name_of("com/lib/Outer$Inner.class"), "com.lib.Outer$Inner");
    }
}
