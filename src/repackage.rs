//! Serialisation of a [`WorkingTree`] into the fused library archive.
//!
//! Every collection maps back to its archive location: classes, Java
//! resources and language metadata form one `classes.jar`, everything else
//! lands at the top level. The destination is replaced atomically.

use crate::archive::EntryMap;
use crate::archive::packaging::{build_nested, compute_sha256, replace_atomically};
use crate::artifact::layout::{CLASSES_JAR, MANIFEST_FILE, RULE_FILE, SYMBOL_LIST};
use crate::error::Result;
use crate::merge::WorkingTree;
use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, info};

/// What was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSummary {
    /// Number of top-level entries.
    pub entries: usize,
    /// Lowercase hex SHA-256 digest of the archive.
    pub sha256: String,
}

/// Top-level entries for `tree`, in archive order.
///
/// # Errors
///
/// Returns [`crate::error::FuseError::IoFailure`] if the nested
/// compiled-code archive cannot be assembled.
pub fn compose(tree: &WorkingTree, destination: &Utf8Path) -> Result<EntryMap> {
    let mut entries = EntryMap::new();
    entries.insert(MANIFEST_FILE.to_owned(), tree.manifest().as_str().as_bytes().to_vec());

    let compiled: EntryMap = tree
        .class_files()
        .iter()
        .chain(tree.java_resources())
        .chain(tree.language_metadata())
        .map(|(path, bytes)| (path.clone(), bytes.clone()))
        .collect();
    let origin = Utf8PathBuf::from(format!("{destination}!{CLASSES_JAR}"));
    entries.insert(CLASSES_JAR.to_owned(), build_nested(&compiled, &origin)?);

    for collection in [
        tree.resource_files(),
        tree.assets(),
        tree.native_libraries(),
        tree.interface_files(),
        tree.passthrough(),
    ] {
        entries.extend(collection.iter().map(|(path, bytes)| (path.clone(), bytes.clone())));
    }
    if !tree.rules().trim().is_empty() {
        entries.insert(RULE_FILE.to_owned(), tree.rules().as_bytes().to_vec());
    }
    if let Some(symbols) = tree.symbol_list() {
        entries.insert(SYMBOL_LIST.to_owned(), symbols.as_bytes().to_vec());
    }
    debug!(
        "composed {} entries ({} in {CLASSES_JAR})",
        entries.len(),
        compiled.len()
    );
    Ok(entries)
}

/// Write `tree` to `destination`, replacing any previous archive.
///
/// A failure leaves `destination` as it was.
///
/// # Errors
///
/// Returns [`crate::error::FuseError::IoFailure`] if the archive cannot be
/// written or hashed.
pub fn write(tree: &WorkingTree, destination: &Utf8Path) -> Result<PackageSummary> {
    let entries = compose(tree, destination)?;
    replace_atomically(destination, &entries)?;
    let sha256 = compute_sha256(destination)?;
    info!("wrote {destination} ({} entries, sha256 {sha256})", entries.len());
    Ok(PackageSummary {
        entries: entries.len(),
        sha256,
    })
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests fail loudly on broken fixtures")]
mod tests {
    use super::*;
    use crate::testing::{read_archive, read_classes, tree_with_classes};
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    #[fixture]
    fn tree() -> WorkingTree {
        let mut tree = tree_with_classes(&[("app", &["com/app/Main"])]);
        tree.java_resources
            .insert("META-INF/services/com.app.Api".to_owned(), b"com.app.Main\n".to_vec());
        tree.language_metadata
            .insert("META-INF/app.kotlin_module".to_owned(), vec![0, 0, 0, 0]);
        tree.resource_files
            .insert("res/values/strings.xml".to_owned(), b"<resources/>".to_vec());
        tree.native_libraries
            .insert("jni/arm64-v8a/libx.so".to_owned(), b"elf".to_vec());
        tree.passthrough.insert("lint.jar".to_owned(), b"opaque".to_vec());
        tree.rules = "-keep class com.app.** { *; }\n".to_owned();
        tree
    }

    fn scratch() -> (TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("out.aar")).expect("utf8 path");
        (dir, path)
    }

    #[rstest]
    fn every_collection_is_written(tree: WorkingTree) {
        let (_dir, path) = scratch();
        let summary = write(&tree, &path).expect("write");

        let entries = read_archive(&path).expect("read");
        let names: Vec<&str> = entries.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            [
                "AndroidManifest.xml",
                "classes.jar",
                "jni/arm64-v8a/libx.so",
                "lint.jar",
                "proguard.txt",
                "res/values/strings.xml",
            ]
        );
        assert_eq!(summary.entries, names.len());
        assert_eq!(summary.sha256.len(), 64);

        let classes = read_classes(&path).expect("classes.jar");
        assert!(classes.contains_key("com/app/Main.class"));
        assert!(classes.contains_key("META-INF/services/com.app.Api"));
        assert!(classes.contains_key("META-INF/app.kotlin_module"));
    }

    #[rstest]
    fn identical_trees_produce_identical_archives(tree: WorkingTree) {
        let (_dir, path) = scratch();
        let first = write(&tree, &path).expect("first");
        let second = write(&tree, &path).expect("second");
        assert_eq!(first, second);
    }

    #[test]
    fn empty_rules_are_not_written() {
        let tree = tree_with_classes(&[("app", &[])]);
        let entries = compose(&tree, Utf8Path::new("out.aar")).expect("compose");
        assert!(!entries.contains_key(RULE_FILE));
        assert!(!entries.contains_key(SYMBOL_LIST));
    }
}
