//! Merge planning: many artifacts into one [`WorkingTree`].
//!
//! Each category has its own policy:
//!
//! | Category            | Same path, same bytes | Same path, different bytes        |
//! |---------------------|-----------------------|-----------------------------------|
//! | classes             | `ClassCollision`      | `ClassCollision`                  |
//! | resources           | duplicate dropped     | secondary renamed with a prefix   |
//! | native libraries    | duplicate dropped     | `NativeLibraryCollision`          |
//! | interface files     | duplicate dropped     | `EntryCollision`                  |
//! | language metadata   | duplicate dropped     | secondary renamed with a prefix   |
//! | assets              | duplicate dropped     | `EntryCollision`                  |
//! | java resources      | duplicate dropped     | first kept, later copy skipped    |
//! | passthrough         | duplicate dropped     | first kept, later copy skipped    |
//!
//! Rule files are concatenated primary first; resource symbol lists are
//! unioned line by line; manifests go to the [`ManifestMerger`]
//! collaborator. All checks run before the tree is handed to relocation.

pub mod manifest;

use crate::archive::EntryMap;
use crate::artifact::layout::is_relocatable_class;
use crate::artifact::manifest::ManifestDescriptor;
use crate::artifact::{Artifact, ArtifactId, class_name_of};
use crate::error::{FuseError, Result};
use crate::report::{EntryRename, FusionReport};
use log::{debug, info, warn};
use manifest::{ManifestMergeRequest, ManifestMerger, ManifestSettings};
use std::collections::{BTreeMap, BTreeSet};

/// Identity and namespace of one merged input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// Unique id within the tree.
    pub id: ArtifactId,
    /// Namespace declared by the input's manifest.
    pub namespace: Option<String>,
    /// Whether this is the primary input.
    pub primary: bool,
}

/// The merged, mutable representation between merge and packaging.
///
/// Provenance maps every entry path to the input that contributed it.
/// Compiled-code entries are keyed as `classes.jar!<path>`.
#[derive(Debug, Clone)]
pub struct WorkingTree {
    pub(crate) origins: Vec<Origin>,
    pub(crate) manifest: ManifestDescriptor,
    pub(crate) class_files: EntryMap,
    pub(crate) java_resources: EntryMap,
    pub(crate) language_metadata: EntryMap,
    pub(crate) resource_files: EntryMap,
    pub(crate) assets: EntryMap,
    pub(crate) native_libraries: EntryMap,
    pub(crate) interface_files: EntryMap,
    pub(crate) rules: String,
    pub(crate) symbol_list: Option<String>,
    pub(crate) passthrough: EntryMap,
    pub(crate) provenance: BTreeMap<String, ArtifactId>,
    pub(crate) report: FusionReport,
}

/// Prefix of provenance keys for compiled-code archive entries.
pub(crate) const COMPILED_PREFIX: &str = "classes.jar!";

pub(crate) fn compiled_key(path: &str) -> String {
    format!("{COMPILED_PREFIX}{path}")
}

impl WorkingTree {
    /// Inputs in merge order, primary first.
    #[must_use]
    pub fn origins(&self) -> &[Origin] {
        &self.origins
    }

    /// The merged manifest descriptor.
    #[must_use]
    pub const fn manifest(&self) -> &ManifestDescriptor {
        &self.manifest
    }

    /// Merged compiled classes.
    #[must_use]
    pub const fn class_files(&self) -> &EntryMap {
        &self.class_files
    }

    /// Merged non-class entries of the compiled-code archives.
    #[must_use]
    pub const fn java_resources(&self) -> &EntryMap {
        &self.java_resources
    }

    /// Merged language-metadata records.
    #[must_use]
    pub const fn language_metadata(&self) -> &EntryMap {
        &self.language_metadata
    }

    /// Merged resources.
    #[must_use]
    pub const fn resource_files(&self) -> &EntryMap {
        &self.resource_files
    }

    /// Merged assets.
    #[must_use]
    pub const fn assets(&self) -> &EntryMap {
        &self.assets
    }

    /// Merged native libraries.
    #[must_use]
    pub const fn native_libraries(&self) -> &EntryMap {
        &self.native_libraries
    }

    /// Merged interface-definition files.
    #[must_use]
    pub const fn interface_files(&self) -> &EntryMap {
        &self.interface_files
    }

    /// Concatenated consumer rules.
    #[must_use]
    pub fn rules(&self) -> &str {
        &self.rules
    }

    /// Unioned resource symbol list.
    #[must_use]
    pub fn symbol_list(&self) -> Option<&str> {
        self.symbol_list.as_deref()
    }

    /// Unrecognised files carried verbatim.
    #[must_use]
    pub const fn passthrough(&self) -> &EntryMap {
        &self.passthrough
    }

    /// Which input contributed `key` (see the type docs for key format).
    #[must_use]
    pub fn provenance(&self, key: &str) -> Option<&ArtifactId> {
        self.provenance.get(key)
    }

    /// The report accumulated so far.
    #[must_use]
    pub const fn report(&self) -> &FusionReport {
        &self.report
    }

    pub(crate) fn into_report(self) -> FusionReport {
        self.report
    }

    /// Whether `id` names the primary input.
    pub(crate) fn is_primary(&self, id: &ArtifactId) -> bool {
        self.origins.iter().any(|o| o.primary && &o.id == id)
    }

    /// The namespace of the fused package.
    #[must_use]
    pub fn primary_namespace(&self) -> Option<&str> {
        self.manifest.package()
    }
}

/// Combines one primary and N secondary artifacts.
pub struct MergePlanner<'a> {
    merger: &'a dyn ManifestMerger,
    settings: &'a ManifestSettings,
}

impl<'a> MergePlanner<'a> {
    /// Create a planner that delegates manifests to `merger`.
    #[must_use]
    pub const fn new(merger: &'a dyn ManifestMerger, settings: &'a ManifestSettings) -> Self {
        Self { merger, settings }
    }

    /// Merge `primary` with `secondaries` in resolution order.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::UnknownLayout`] if the primary has no manifest,
    /// [`FuseError::ClassCollision`], [`FuseError::NativeLibraryCollision`]
    /// or [`FuseError::EntryCollision`] on unresolvable collisions, and
    /// propagates manifest-merge failures.
    pub fn merge(&self, primary: &Artifact, secondaries: &[Artifact]) -> Result<WorkingTree> {
        let primary_manifest = primary.manifest().cloned().ok_or_else(|| FuseError::UnknownLayout {
            root: primary.root().to_owned(),
            reason: "the primary input has no manifest".to_owned(),
        })?;

        let ids = unique_ids(primary, secondaries);
        let mut builder = TreeBuilder::default();
        for (artifact, id) in std::iter::once(primary).chain(secondaries).zip(&ids) {
            builder.add(artifact, id)?;
        }

        let request = ManifestMergeRequest {
            primary: primary_manifest,
            secondaries: secondaries.iter().filter_map(|a| a.manifest().cloned()).collect(),
            settings: self.settings.clone(),
        };
        let manifest = self.merger.merge(&request)?;

        let origins = std::iter::once(primary)
            .chain(secondaries)
            .zip(ids)
            .enumerate()
            .map(|(index, (artifact, id))| Origin {
                id,
                namespace: artifact.namespace().map(str::to_owned),
                primary: index == 0,
            })
            .collect::<Vec<_>>();

        let mut report = builder.report;
        report.inputs = origins.iter().map(|o| o.id.clone()).collect();
        info!(
            "merged {} inputs: {} classes, {} resources",
            origins.len(),
            builder.class_files.len(),
            builder.resource_files.len()
        );

        Ok(WorkingTree {
            origins,
            manifest,
            class_files: builder.class_files,
            java_resources: builder.java_resources,
            language_metadata: builder.language_metadata,
            resource_files: builder.resource_files,
            assets: builder.assets,
            native_libraries: builder.native_libraries,
            interface_files: builder.interface_files,
            rules: builder.rules,
            symbol_list: builder.symbol_lines.map(|lines| {
                let mut text = lines.join("\n");
                text.push('\n');
                text
            }),
            passthrough: builder.passthrough,
            provenance: builder.provenance,
            report,
        })
    }
}

/// Disambiguate repeated ids by suffixing their position.
fn unique_ids(primary: &Artifact, secondaries: &[Artifact]) -> Vec<ArtifactId> {
    let mut seen = BTreeSet::new();
    std::iter::once(primary)
        .chain(secondaries)
        .enumerate()
        .map(|(index, artifact)| {
            let mut id = artifact.id().clone();
            if !seen.insert(id.clone()) {
                id = ArtifactId::from(format!("{id}#{index}"));
                seen.insert(id.clone());
            }
            id
        })
        .collect()
}

/// What to do with a second copy of a path.
#[derive(Clone, Copy)]
enum Policy {
    /// Different bytes fail with `EntryCollision`.
    Strict(&'static str),
    /// Different bytes fail with `NativeLibraryCollision`.
    Native,
    /// Different bytes keep the first copy.
    FirstWins(&'static str),
}

#[derive(Default)]
struct TreeBuilder {
    class_files: EntryMap,
    java_resources: EntryMap,
    language_metadata: EntryMap,
    resource_files: EntryMap,
    assets: EntryMap,
    native_libraries: EntryMap,
    interface_files: EntryMap,
    rules: String,
    symbol_lines: Option<Vec<String>>,
    passthrough: EntryMap,
    provenance: BTreeMap<String, ArtifactId>,
    report: FusionReport,
}

impl TreeBuilder {
    fn add(&mut self, artifact: &Artifact, id: &ArtifactId) -> Result<()> {
        debug!("merging {id}");
        self.add_classes(artifact, id)?;
        let prefix = resource_prefix(artifact.namespace(), id);
        union_renaming(
            &mut self.language_metadata,
            &mut self.provenance,
            &mut self.report,
            artifact.language_metadata(),
            id,
            &Rename { category: "language metadata", prefix: &prefix, key: compiled_key },
        );
        union_compiled(
            &mut self.java_resources,
            &mut self.provenance,
            &mut self.report,
            artifact.java_resources(),
            id,
            Policy::FirstWins("java resource"),
        )?;
        union_renaming(
            &mut self.resource_files,
            &mut self.provenance,
            &mut self.report,
            artifact.resource_files(),
            id,
            &Rename { category: "resource", prefix: &prefix, key: str::to_owned },
        );
        union(
            &mut self.native_libraries,
            &mut self.provenance,
            &mut self.report,
            artifact.native_libraries(),
            id,
            Policy::Native,
        )?;
        union(
            &mut self.interface_files,
            &mut self.provenance,
            &mut self.report,
            artifact.interface_files(),
            id,
            Policy::Strict("interface file"),
        )?;
        union(
            &mut self.assets,
            &mut self.provenance,
            &mut self.report,
            artifact.assets(),
            id,
            Policy::Strict("asset"),
        )?;
        union(
            &mut self.passthrough,
            &mut self.provenance,
            &mut self.report,
            artifact.passthrough(),
            id,
            Policy::FirstWins("passthrough"),
        )?;
        self.add_rules(artifact, id);
        self.add_symbol_list(artifact);
        Ok(())
    }

    fn add_classes(&mut self, artifact: &Artifact, id: &ArtifactId) -> Result<()> {
        for (path, bytes) in artifact.class_files() {
            let key = compiled_key(path);
            if let Some(first) = self.provenance.get(&key) {
                return Err(FuseError::ClassCollision {
                    name: class_name_of(path),
                    first: first.clone(),
                    second: id.clone(),
                });
            }
            self.provenance.insert(key, id.clone());
            self.class_files.insert(path.clone(), bytes.clone());
        }
        Ok(())
    }

    fn add_rules(&mut self, artifact: &Artifact, id: &ArtifactId) {
        for rule_file in artifact.rule_files() {
            if rule_file.text.trim().is_empty() {
                continue;
            }
            if !self.rules.is_empty() && !self.rules.ends_with('\n') {
                self.rules.push('\n');
            }
            self.rules
                .push_str(&format!("# ---- rules from {id} ({}) ----\n", rule_file.origin));
            self.rules.push_str(&rule_file.text);
            if !self.rules.ends_with('\n') {
                self.rules.push('\n');
            }
        }
    }

    fn add_symbol_list(&mut self, artifact: &Artifact) {
        let Some(text) = artifact.symbol_list() else {
            return;
        };
        let lines = self.symbol_lines.get_or_insert_with(Vec::new);
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            if !lines.iter().any(|existing| existing == line) {
                lines.push(line.to_owned());
            }
        }
    }
}

/// How a colliding entry is renamed.
struct Rename<'p> {
    category: &'static str,
    prefix: &'p str,
    /// Provenance key of an entry path.
    key: fn(&str) -> String,
}

/// Union `source` into `target`, renaming a secondary's differing copy to
/// `<folder>/<prefix>_<file>`.
fn union_renaming(
    target: &mut EntryMap,
    provenance: &mut BTreeMap<String, ArtifactId>,
    report: &mut FusionReport,
    source: &EntryMap,
    id: &ArtifactId,
    rename: &Rename<'_>,
) {
    let category = rename.category;
    for (path, bytes) in source {
        let key = (rename.key)(path);
        match target.get(path) {
            None => {
                provenance.insert(key, id.clone());
                target.insert(path.clone(), bytes.clone());
            }
            Some(existing) if existing == bytes => {
                let kept = provenance.get(&key).cloned().unwrap_or_else(|| id.clone());
                debug!("{id}: dropping identical {category} {path}");
                report.duplicate(category, path, &kept, id);
            }
            Some(_) => {
                let renamed = free_name(target, path, rename.prefix);
                warn!("{id}: {category} {path} collides; renamed to {renamed}");
                report.renames.push(EntryRename {
                    artifact: id.clone(),
                    from: path.clone(),
                    to: renamed.clone(),
                });
                provenance.insert((rename.key)(&renamed), id.clone());
                target.insert(renamed, bytes.clone());
            }
        }
    }
}

/// First free `<folder>/<prefix>_<file>` in `taken`, counting up on clashes.
fn free_name(taken: &EntryMap, path: &str, prefix: &str) -> String {
    let (folder, file) = path.rsplit_once('/').unwrap_or(("", path));
    let named = |stem: String| {
        if folder.is_empty() {
            stem
        } else {
            format!("{folder}/{stem}")
        }
    };
    let mut candidate = named(format!("{prefix}_{file}"));
    let mut counter = 2_u32;
    while taken.contains_key(&candidate) {
        candidate = named(format!("{prefix}_{counter}_{file}"));
        counter += 1;
    }
    candidate
}

fn union_compiled(
    target: &mut EntryMap,
    provenance: &mut BTreeMap<String, ArtifactId>,
    report: &mut FusionReport,
    source: &EntryMap,
    id: &ArtifactId,
    policy: Policy,
) -> Result<()> {
    for (path, bytes) in source {
        let key = compiled_key(path);
        insert_entry(target, provenance, report, path, &key, bytes, id, policy)?;
    }
    Ok(())
}

fn union(
    target: &mut EntryMap,
    provenance: &mut BTreeMap<String, ArtifactId>,
    report: &mut FusionReport,
    source: &EntryMap,
    id: &ArtifactId,
    policy: Policy,
) -> Result<()> {
    for (path, bytes) in source {
        insert_entry(target, provenance, report, path, path, bytes, id, policy)?;
    }
    Ok(())
}

#[expect(
    clippy::too_many_arguments,
    reason = "the tree builder's buffers are borrowed field by field"
)]
fn insert_entry(
    target: &mut EntryMap,
    provenance: &mut BTreeMap<String, ArtifactId>,
    report: &mut FusionReport,
    path: &str,
    key: &str,
    bytes: &[u8],
    id: &ArtifactId,
    policy: Policy,
) -> Result<()> {
    let Some(existing) = target.get(path) else {
        provenance.insert(key.to_owned(), id.clone());
        target.insert(path.to_owned(), bytes.to_vec());
        return Ok(());
    };
    let first = provenance.get(key).cloned().unwrap_or_else(|| id.clone());
    let category = match policy {
        Policy::Strict(category) | Policy::FirstWins(category) => category,
        Policy::Native => "native library",
    };
    if existing.as_slice() == bytes {
        debug!("{id}: dropping identical {category} {path}");
        report.duplicate(category, path, &first, id);
        return Ok(());
    }
    match policy {
        Policy::Native => Err(FuseError::NativeLibraryCollision {
            path: path.to_owned(),
            first,
            second: id.clone(),
        }),
        Policy::Strict(category) => Err(FuseError::EntryCollision {
            category,
            path: path.to_owned(),
            first,
            second: id.clone(),
        }),
        Policy::FirstWins(category) => {
            warn!("{id}: {category} {path} differs from the copy in {first}; keeping {first}");
            report.skip(category, path, id, format!("differs from the copy kept from {first}"));
            Ok(())
        }
    }
}

/// Prefix for renamed resources: the namespace (or the artifact id when no
/// namespace is declared) with non-alphanumerics mapped to `_`, lowercased.
pub(crate) fn resource_prefix(namespace: Option<&str>, id: &ArtifactId) -> String {
    namespace
        .unwrap_or(id.as_str())
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Internal package (`com/lib`) of an internal class name or class path.
pub(crate) fn package_of(internal: &str) -> &str {
    internal.rsplit_once('/').map_or("", |(package, _)| package)
}

/// Internal class names of every class contributed by `id`.
pub(crate) fn classes_from<'t>(
    tree: &'t WorkingTree,
    id: &'t ArtifactId,
) -> impl Iterator<Item = &'t str> + 't {
    tree.class_files.keys().filter_map(move |path| {
        let from = tree.provenance.get(&compiled_key(path))?;
        (from == id && is_relocatable_class(path)).then(|| path.strip_suffix(".class").unwrap_or(path))
    })
}

#[cfg(test)]
#[expect(
    clippy::expect_used,
    clippy::indexing_slicing,
    reason = "tests fail loudly on broken fixtures and missing entries"
)]
mod tests {
    use super::*;
    use crate::artifact::RuleFile;
    use camino::Utf8PathBuf;
    use manifest::BasicManifestMerger;
    use rstest::{fixture, rstest};

    fn artifact(id: &str, package: &str) -> Artifact {
        let mut artifact = Artifact::empty(ArtifactId::from(id), Utf8PathBuf::from(id));
        artifact.manifest = Some(
            ManifestDescriptor::parse(format!("<manifest package=\"{package}\"/>"), id)
                .expect("valid manifest"),
        );
        artifact
    }

    fn entry(map: &mut EntryMap, path: &str, bytes: &[u8]) {
        map.insert(path.to_owned(), bytes.to_vec());
    }

    #[fixture]
    fn settings() -> ManifestSettings {
        ManifestSettings::default()
    }

    fn merge(primary: &Artifact, secondaries: &[Artifact]) -> Result<WorkingTree> {
        let settings = ManifestSettings::default();
        MergePlanner::new(&BasicManifestMerger, &settings).merge(primary, secondaries)
    }

    #[test]
    fn duplicate_class_is_a_collision() {
        let mut a = artifact("app", "com.app");
        let mut b = artifact("lib", "com.lib");
        entry(&mut a.class_files, "com/x/Foo.class", b"a");
        entry(&mut b.class_files, "com/x/Foo.class", b"b");

        let result = merge(&a, &[b]);
        assert!(matches!(
            result,
            Err(FuseError::ClassCollision { ref name, ref first, ref second })
                if name == "com.x.Foo" && first.as_str() == "app" && second.as_str() == "lib"
        ));
    }

    #[test]
    fn colliding_resource_is_renamed_with_namespace_prefix() {
        let mut a = artifact("app", "com.app");
        let mut b = artifact("lib", "com.Lib-x");
        entry(&mut a.resource_files, "res/layout/main.xml", b"<a/>");
        entry(&mut b.resource_files, "res/layout/main.xml", b"<b/>");

        let tree = merge(&a, &[b]).expect("merge");
        assert_eq!(tree.resource_files()["res/layout/main.xml"], b"<a/>");
        assert_eq!(tree.resource_files()["res/layout/com_lib_x_main.xml"], b"<b/>");
        assert_eq!(
            tree.provenance("res/layout/com_lib_x_main.xml").map(ArtifactId::as_str),
            Some("lib")
        );
        assert_eq!(tree.report().renames.len(), 1);
    }

    #[test]
    fn differing_module_metadata_is_renamed() {
        let mut a = artifact("app", "com.app");
        let mut b = artifact("lib", "com.lib");
        let path = "META-INF/library_release.kotlin_module";
        entry(&mut a.language_metadata, path, b"app");
        entry(&mut b.language_metadata, path, b"lib");

        let tree = merge(&a, &[b]).expect("merge");
        let renamed = "META-INF/com_lib_library_release.kotlin_module";
        assert_eq!(tree.language_metadata()[path], b"app");
        assert_eq!(tree.language_metadata()[renamed], b"lib");
        assert_eq!(
            tree.provenance(&compiled_key(renamed)).map(ArtifactId::as_str),
            Some("lib")
        );
        assert_eq!(tree.report().renames.len(), 1);
        assert_eq!(tree.report().renames[0].to, renamed);
    }

    #[rstest]
    #[case::free("res/layout/main.xml", "res/layout/p_main.xml")]
    #[case::taken("res/values/strings.xml", "res/values/p_2_strings.xml")]
    #[case::no_folder("top.txt", "p_top.txt")]
    fn free_names_count_up_past_taken_ones(#[case] path: &str, #[case] expected: &str) {
        let mut taken = EntryMap::new();
        entry(&mut taken, "res/values/p_strings.xml", b"");
        assert_eq!(free_name(&taken, path, "p"), expected);
    }

    #[rstest]
    #[case::identical(b"elf".as_slice(), true)]
    #[case::different(b"other".as_slice(), false)]
    fn native_libraries_collide_only_when_different(#[case] second: &[u8], #[case] ok: bool) {
        let mut a = artifact("app", "com.app");
        let mut b = artifact("lib", "com.lib");
        entry(&mut a.native_libraries, "jni/arm64-v8a/libx.so", b"elf");
        entry(&mut b.native_libraries, "jni/arm64-v8a/libx.so", second);

        let result = merge(&a, &[b]);
        if ok {
            let tree = result.expect("identical libraries merge");
            assert_eq!(tree.report().duplicates.len(), 1);
        } else {
            assert!(matches!(result, Err(FuseError::NativeLibraryCollision { .. })));
        }
    }

    #[rstest]
    fn differing_interface_files_collide(settings: ManifestSettings) {
        let mut a = artifact("app", "com.app");
        let mut b = artifact("lib", "com.lib");
        entry(&mut a.interface_files, "aidl/com/lib/IThing.aidl", b"interface IThing {}");
        entry(&mut b.interface_files, "aidl/com/lib/IThing.aidl", b"interface IThing { void x(); }");

        let result = MergePlanner::new(&BasicManifestMerger, &settings).merge(&a, &[b]);
        assert!(matches!(
            result,
            Err(FuseError::EntryCollision { category: "interface file", .. })
        ));
    }

    #[test]
    fn differing_java_resource_keeps_first_and_reports() {
        let mut a = artifact("app", "com.app");
        let mut b = artifact("lib", "com.lib");
        entry(&mut a.java_resources, "version.properties", b"1");
        entry(&mut b.java_resources, "version.properties", b"2");

        let tree = merge(&a, &[b]).expect("merge");
        assert_eq!(tree.java_resources()["version.properties"], b"1");
        assert_eq!(tree.report().skipped.len(), 1);
    }

    #[test]
    fn rules_are_concatenated_primary_first() {
        let mut a = artifact("app", "com.app");
        let mut b = artifact("lib", "com.lib");
        a.rule_files.push(RuleFile {
            origin: "proguard.txt".to_owned(),
            text: "-keep class com.app.** { *; }".to_owned(),
        });
        b.rule_files.push(RuleFile {
            origin: "proguard.txt".to_owned(),
            text: "-dontwarn com.lib.**\n".to_owned(),
        });

        let tree = merge(&a, &[b]).expect("merge");
        let app = tree.rules().find("com.app").expect("primary rules");
        let lib = tree.rules().find("com.lib").expect("secondary rules");
        assert!(app < lib);
        assert_eq!(tree.rules().matches("# ---- rules from").count(), 2);
    }

    #[test]
    fn symbol_lists_are_unioned() {
        let mut a = artifact("app", "com.app");
        let mut b = artifact("lib", "com.lib");
        a.symbol_list = Some("int string a 0x1\n".to_owned());
        b.symbol_list = Some("int string a 0x1\nint string b 0x2\n".to_owned());

        let tree = merge(&a, &[b]).expect("merge");
        assert_eq!(tree.symbol_list(), Some("int string a 0x1\nint string b 0x2\n"));
    }

    #[test]
    fn primary_without_manifest_is_unknown_layout() {
        let primary = Artifact::empty(ArtifactId::from("bare"), Utf8PathBuf::from("bare.jar"));
        assert!(matches!(merge(&primary, &[]), Err(FuseError::UnknownLayout { .. })));
    }

    #[test]
    fn repeated_ids_are_disambiguated() {
        let a = artifact("lib", "com.app");
        let b = artifact("lib", "com.lib");
        let tree = merge(&a, &[b]).expect("merge");
        let ids: Vec<_> = tree.origins().iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, ["lib", "lib#1"]);
    }
}
