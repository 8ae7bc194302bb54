//! Classification of an extracted library package.
//!
//! Every file under the package root lands in exactly one typed collection of
//! [`Artifact`]. Nested compiled-code archives (`classes.jar`, `libs/*.jar`)
//! are read explicitly with [`extraction::read_nested`] and their entries are
//! split into classes, language metadata and Java resources.

use super::manifest::ManifestDescriptor;
use super::{Artifact, ArtifactId, RuleFile, class_name_of};
use crate::archive::{EntryMap, extraction};
use crate::error::{FuseError, Result, io_failure};
use camino::{Utf8Path, Utf8PathBuf};
use log::debug;
use std::collections::BTreeMap;
use std::fs;
use walkdir::WalkDir;

/// The mandatory descriptor file of a library package.
pub const MANIFEST_FILE: &str = "AndroidManifest.xml";
/// The primary compiled-code archive.
pub const CLASSES_JAR: &str = "classes.jar";
/// The consumer rule file.
pub const RULE_FILE: &str = "proguard.txt";
/// The resource symbol list.
pub const SYMBOL_LIST: &str = "R.txt";
/// Extension of language-metadata records.
pub const METADATA_EXTENSION: &str = ".kotlin_module";

const LIBS_DIR: &str = "libs/";
const RES_DIR: &str = "res/";
const ASSETS_DIR: &str = "assets/";
const JNI_DIR: &str = "jni/";
const AIDL_DIR: &str = "aidl/";

/// Load the extracted package rooted at `root`.
///
/// # Errors
///
/// Returns [`FuseError::UnknownLayout`] if `root` has no manifest descriptor,
/// [`FuseError::ClassCollision`] if two of the package's own compiled-code
/// archives declare the same class, and propagates read and parse errors.
pub fn load(root: &Utf8Path, id: ArtifactId) -> Result<Artifact> {
    if !root.join(MANIFEST_FILE).is_file() {
        return Err(FuseError::UnknownLayout {
            root: root.to_owned(),
            reason: format!("missing {MANIFEST_FILE}"),
        });
    }

    let mut artifact = Artifact::empty(id, root.to_owned());
    let mut class_origins = BTreeMap::new();
    for (relative, path) in walk_files(root)? {
        let bytes = fs::read(&path).map_err(io_failure(&path))?;
        classify(&mut artifact, &mut class_origins, &relative, bytes)?;
    }

    debug!(
        "loaded {}: {} classes, {} resources, {} native libraries, {} interface files",
        artifact.id,
        artifact.class_files.len(),
        artifact.resource_files.len(),
        artifact.native_libraries.len(),
        artifact.interface_files.len()
    );
    Ok(artifact)
}

/// Load a bare compiled-code archive as a manifest-less artifact.
///
/// # Errors
///
/// Returns [`FuseError::CorruptArchive`] for unreadable archives and
/// [`FuseError::IoFailure`] if the file cannot be read.
pub fn load_classes_archive(path: &Utf8Path, id: ArtifactId) -> Result<Artifact> {
    let bytes = fs::read(path).map_err(io_failure(path))?;
    let entries = extraction::read_nested(&bytes, path)?;
    let mut artifact = Artifact::empty(id, path.to_owned());
    let mut class_origins = BTreeMap::new();
    add_compiled_entries(&mut artifact, &mut class_origins, path.as_str(), entries)?;
    Ok(artifact)
}

/// Collect `(relative slash path, absolute path)` pairs in a stable order.
fn walk_files(root: &Utf8Path) -> Result<Vec<(String, Utf8PathBuf)>> {
    let mut files = Vec::new();
    for walked in WalkDir::new(root).sort_by_file_name() {
        let entry = walked.map_err(|e| FuseError::IoFailure {
            path: root.to_owned(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = Utf8PathBuf::try_from(entry.into_path()).map_err(|e| {
            FuseError::UnknownLayout {
                root: root.to_owned(),
                reason: format!("non UTF-8 path: {e}"),
            }
        })?;
        let relative = path
            .strip_prefix(root)
            .map(|p| p.components().map(|c| c.as_str()).collect::<Vec<_>>().join("/"))
            .unwrap_or_else(|_| path.to_string());
        files.push((relative, path));
    }
    Ok(files)
}

fn classify(
    artifact: &mut Artifact,
    class_origins: &mut BTreeMap<String, String>,
    relative: &str,
    bytes: Vec<u8>,
) -> Result<()> {
    match relative {
        MANIFEST_FILE => {
            let text = String::from_utf8(bytes).map_err(|e| FuseError::MalformedManifest {
                origin: artifact.id.to_string(),
                reason: e.to_string(),
            })?;
            artifact.manifest = Some(ManifestDescriptor::parse(text, artifact.id.as_str())?);
        }
        CLASSES_JAR => {
            let origin = Utf8PathBuf::from(format!("{}!{CLASSES_JAR}", artifact.root));
            let entries = extraction::read_nested(&bytes, &origin)?;
            add_compiled_entries(artifact, class_origins, CLASSES_JAR, entries)?;
        }
        RULE_FILE => artifact.rule_files.push(RuleFile {
            origin: RULE_FILE.to_owned(),
            text: String::from_utf8_lossy(&bytes).into_owned(),
        }),
        SYMBOL_LIST => {
            artifact.symbol_list = Some(String::from_utf8_lossy(&bytes).into_owned());
        }
        _ if relative.starts_with(LIBS_DIR) && relative.ends_with(".jar") => {
            let origin = Utf8PathBuf::from(format!("{}!{relative}", artifact.root));
            let entries = extraction::read_nested(&bytes, &origin)?;
            add_compiled_entries(artifact, class_origins, relative, entries)?;
        }
        _ if is_resource(relative) => {
            artifact.resource_files.insert(relative.to_owned(), bytes);
        }
        _ if relative.starts_with(ASSETS_DIR) => {
            artifact.assets.insert(relative.to_owned(), bytes);
        }
        _ if is_native_library(relative) => {
            artifact.native_libraries.insert(relative.to_owned(), bytes);
        }
        _ if relative.starts_with(AIDL_DIR) && relative.ends_with(".aidl") => {
            artifact.interface_files.insert(relative.to_owned(), bytes);
        }
        _ => {
            debug!("{}: keeping unrecognised file {relative}", artifact.id);
            artifact.passthrough.insert(relative.to_owned(), bytes);
        }
    }
    Ok(())
}

/// Split the entries of one compiled-code archive into the artifact's
/// class, metadata and Java resource collections.
fn add_compiled_entries(
    artifact: &mut Artifact,
    class_origins: &mut BTreeMap<String, String>,
    jar: &str,
    entries: EntryMap,
) -> Result<()> {
    for (name, bytes) in entries {
        if is_relocatable_class(&name) {
            if let Some(previous) = class_origins.insert(name.clone(), jar.to_owned()) {
                return Err(FuseError::ClassCollision {
                    name: class_name_of(&name),
                    first: ArtifactId::from(format!("{} ({previous})", artifact.id)),
                    second: ArtifactId::from(format!("{} ({jar})", artifact.id)),
                });
            }
            artifact.class_files.insert(name, bytes);
        } else if is_language_metadata(&name) {
            insert_first(&mut artifact.language_metadata, name, bytes, jar);
        } else {
            insert_first(&mut artifact.java_resources, name, bytes, jar);
        }
    }
    Ok(())
}

fn insert_first(map: &mut EntryMap, name: String, bytes: Vec<u8>, jar: &str) {
    if map.contains_key(&name) {
        debug!("{jar}: duplicate entry {name} ignored in favour of the first copy");
    } else {
        map.insert(name, bytes);
    }
}

/// Class entries that participate in merging and relocation.
///
/// `module-info.class` and multi-release variants under `META-INF/` are kept
/// as Java resources.
pub(crate) fn is_relocatable_class(name: &str) -> bool {
    name.ends_with(".class")
        && !name.starts_with("META-INF/")
        && !name.ends_with("module-info.class")
        && !name.ends_with("package-info.class")
}

fn is_language_metadata(name: &str) -> bool {
    name.strip_prefix("META-INF/")
        .is_some_and(|rest| !rest.contains('/') && rest.ends_with(METADATA_EXTENSION))
}

/// `res/<kind>/<file>`; anything shallower or deeper is passthrough.
fn is_resource(relative: &str) -> bool {
    relative
        .strip_prefix(RES_DIR)
        .is_some_and(|rest| rest.split('/').count() == 2)
}

/// `jni/<abi>/<file>.so`.
fn is_native_library(relative: &str) -> bool {
    relative
        .strip_prefix(JNI_DIR)
        .is_some_and(|rest| rest.split('/').count() == 2 && rest.ends_with(".so"))
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests fail loudly on broken fixtures")]
mod tests {
    use super::*;
    use crate::archive::packaging::build_nested;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    #[fixture]
    fn package_dir() -> (TempDir, Utf8PathBuf) {
        let dir = TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).expect("utf8");
        (dir, root)
    }

    fn write(root: &Utf8Path, relative: &str, bytes: &[u8]) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().expect("has parent")).expect("mkdir");
        fs::write(path, bytes).expect("write");
    }

    fn jar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let map: EntryMap = entries
            .iter()
            .map(|(n, b)| ((*n).to_owned(), b.to_vec()))
            .collect();
        build_nested(&map, Utf8Path::new("test.jar")).expect("build jar")
    }

    #[rstest]
    fn classifies_every_category(package_dir: (TempDir, Utf8PathBuf)) {
        let (_guard, root) = package_dir;
        write(&root, MANIFEST_FILE, b"<manifest package=\"com.lib\"/>");
        write(
            &root,
            CLASSES_JAR,
            &jar(&[
                ("com/lib/A.class", b"a"),
                ("META-INF/lib.kotlin_module", b"m"),
                ("META-INF/services/com.lib.Api", b"com.lib.A"),
                ("module-info.class", b"mi"),
            ]),
        );
        write(&root, "libs/extra.jar", &jar(&[("com/lib/extra/B.class", b"b")]));
        write(&root, "res/values/values.xml", b"<resources/>");
        write(&root, "assets/data.bin", b"d");
        write(&root, "jni/arm64-v8a/libx.so", b"elf");
        write(&root, "aidl/com/lib/IThing.aidl", b"package com.lib;");
        write(&root, RULE_FILE, b"-keep class com.lib.** { *; }");
        write(&root, SYMBOL_LIST, b"int string app_name 0x7f010001");
        write(&root, "public.txt", b"string app_name");

        let artifact = load(&root, ArtifactId::from("lib")).expect("load");

        assert_eq!(artifact.namespace(), Some("com.lib"));
        assert!(artifact.class_files().contains_key("com/lib/A.class"));
        assert!(artifact.class_files().contains_key("com/lib/extra/B.class"));
        assert!(artifact.language_metadata().contains_key("META-INF/lib.kotlin_module"));
        assert!(artifact.java_resources().contains_key("META-INF/services/com.lib.Api"));
        assert!(artifact.java_resources().contains_key("module-info.class"));
        assert!(artifact.resource_files().contains_key("res/values/values.xml"));
        assert!(artifact.assets().contains_key("assets/data.bin"));
        assert!(artifact.native_libraries().contains_key("jni/arm64-v8a/libx.so"));
        assert!(artifact.interface_files().contains_key("aidl/com/lib/IThing.aidl"));
        assert_eq!(artifact.rule_files().len(), 1);
        assert!(artifact.symbol_list().is_some());
        assert!(artifact.passthrough().contains_key("public.txt"));
    }

    #[rstest]
    fn missing_manifest_is_unknown_layout(package_dir: (TempDir, Utf8PathBuf)) {
        let (_guard, root) = package_dir;
        write(&root, "res/values/values.xml", b"<resources/>");

        let result = load(&root, ArtifactId::from("lib"));
        assert!(matches!(result, Err(FuseError::UnknownLayout { .. })));
    }

    #[rstest]
    fn class_in_two_own_jars_collides(package_dir: (TempDir, Utf8PathBuf)) {
        let (_guard, root) = package_dir;
        write(&root, MANIFEST_FILE, b"<manifest/>");
        write(&root, CLASSES_JAR, &jar(&[("com/lib/A.class", b"a")]));
        write(&root, "libs/dup.jar", &jar(&[("com/lib/A.class", b"b")]));

        let result = load(&root, ArtifactId::from("lib"));
        assert!(matches!(
            result,
            Err(FuseError::ClassCollision { ref name, .. }) if name == "com.lib.A"
        ));
    }

    #[rstest]
    #[case::shallow_res("res/stray.xml", false)]
    #[case::kind_folder("res/layout/main.xml", true)]
    #[case::deep_res("res/raw/nested/file.bin", false)]
    fn resource_paths_need_a_kind_folder(#[case] path: &str, #[case] expected: bool) {
        assert_eq!(is_resource(path), expected);
    }

    #[rstest]
    #[case::class("com/lib/A.class", true)]
    #[case::module_info("module-info.class", false)]
    #[case::multi_release("META-INF/versions/9/com/lib/A.class", false)]
    #[case::resource("com/lib/strings.properties", false)]
    fn relocatable_classes(#[case] name: &str, #[case] expected: bool) {
        assert_eq!(is_relocatable_class(name), expected);
    }
}
