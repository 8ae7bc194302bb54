//! Archive extraction for library packages.
//!
//! Extracts zip archives with path traversal protection to prevent zip-slip
//! attacks, and verifies that every entry's decompressed length matches the
//! size recorded in the central directory. Nested archives (a `classes.jar`
//! inside a library archive) are never expanded implicitly; callers read
//! them with [`read_nested`] as a separate step.

use super::EntryMap;
use crate::error::{FuseError, Result, io_failure};
use camino::{Utf8Path, Utf8PathBuf};
use log::debug;
use std::fs;
use std::io::{Cursor, Read, Seek};
use std::path::{Component, Path};

/// Extract the archive at `archive_path` into `dest_dir`.
///
/// `dest_dir` is cleared first, so re-running against a scratch directory
/// left behind by an aborted build never fails on leftover files. Returns
/// the extracted entry paths in archive order.
///
/// # Errors
///
/// Returns [`FuseError::CorruptArchive`] if the central directory cannot be
/// read, an entry escapes the destination, or an entry's size mismatches its
/// content. Returns [`FuseError::IoFailure`] on file-system failures.
pub fn extract(archive_path: &Utf8Path, dest_dir: &Utf8Path) -> Result<Vec<String>> {
    prepare_scratch_dir(dest_dir)?;
    let file = fs::File::open(archive_path).map_err(io_failure(archive_path))?;
    let entries = read_entries(file, archive_path)?;

    for (name, bytes) in &entries {
        let dest_path = dest_dir.join(name);
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).map_err(io_failure(parent))?;
        }
        fs::write(&dest_path, bytes).map_err(io_failure(&dest_path))?;
    }

    debug!("extracted {} entries from {archive_path}", entries.len());
    Ok(entries.into_keys().collect())
}

/// Read a nested archive held in memory.
///
/// `origin` names the nested archive in error messages, conventionally as
/// `outer/path!inner.jar`.
///
/// # Errors
///
/// Returns [`FuseError::CorruptArchive`] under the same conditions as
/// [`extract`].
pub fn read_nested(bytes: &[u8], origin: &Utf8Path) -> Result<EntryMap> {
    read_entries(Cursor::new(bytes), origin)
}

/// Remove any stale content at `dir` and recreate it empty.
///
/// # Errors
///
/// Returns [`FuseError::IoFailure`] if the directory cannot be removed or
/// created.
pub fn prepare_scratch_dir(dir: &Utf8Path) -> Result<()> {
    if dir.exists() {
        debug!("clearing stale scratch directory {dir}");
        fs::remove_dir_all(dir).map_err(io_failure(dir))?;
    }
    fs::create_dir_all(dir).map_err(io_failure(dir))
}

fn read_entries<R: Read + Seek>(reader: R, origin: &Utf8Path) -> Result<EntryMap> {
    let mut archive =
        zip::ZipArchive::new(reader).map_err(|e| corrupt(origin, format!("unreadable: {e}")))?;
    let mut entries = EntryMap::new();

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| corrupt(origin, format!("entry {index}: {e}")))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_owned();
        validate_entry_path(&name).map_err(|reason| corrupt(origin, reason))?;

        let declared = entry.size();
        let mut bytes = Vec::with_capacity(usize::try_from(declared).unwrap_or_default());
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| corrupt(origin, format!("{name}: {e}")))?;
        if u64::try_from(bytes.len()).ok() != Some(declared) {
            return Err(corrupt(
                origin,
                format!(
                    "{name}: declared {declared} bytes but read {}",
                    bytes.len()
                ),
            ));
        }
        if entries.insert(name.clone(), bytes).is_some() {
            return Err(corrupt(origin, format!("duplicate entry {name}")));
        }
    }

    Ok(entries)
}

/// Validate that an entry path does not escape the destination directory
/// via `..` components or absolute paths.
fn validate_entry_path(name: &str) -> std::result::Result<(), String> {
    let path = Path::new(name);
    if name.is_empty() || path.is_absolute() || name.starts_with('/') || name.contains('\\') {
        return Err(format!("unsafe entry path {name:?}"));
    }
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(format!("path traversal in entry {name:?}"));
    }
    Ok(())
}

fn corrupt(origin: &Utf8Path, reason: String) -> FuseError {
    FuseError::CorruptArchive {
        path: Utf8PathBuf::from(origin),
        reason,
    }
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests fail loudly on broken fixtures")]
mod tests {
    use super::*;
    use crate::archive::packaging::build_nested;
    use rstest::{fixture, rstest};
    use std::io::Write;
    use tempfile::TempDir;

    #[fixture]
    fn temp_dir() -> TempDir {
        TempDir::new().expect("temp dir creation succeeds")
    }

    fn utf8(path: &Path) -> Utf8PathBuf {
        Utf8PathBuf::try_from(path.to_path_buf()).expect("temp path is UTF-8")
    }

    fn sample_entries() -> EntryMap {
        let mut entries = EntryMap::new();
        entries.insert("AndroidManifest.xml".to_owned(), b"<manifest/>".to_vec());
        entries.insert("res/values/values.xml".to_owned(), b"<resources/>".to_vec());
        entries
    }

    #[rstest]
    fn extract_real_archive(temp_dir: TempDir) {
        let root = utf8(temp_dir.path());
        let archive_path = root.join("lib.aar");
        let bytes = build_nested(&sample_entries(), &archive_path).expect("build archive");
        fs::write(&archive_path, bytes).expect("write archive");

        let dest = root.join("out");
        let names = extract(&archive_path, &dest).expect("extract");

        assert_eq!(names, vec!["AndroidManifest.xml", "res/values/values.xml"]);
        assert!(dest.join("res/values/values.xml").exists());
    }

    #[rstest]
    fn extract_clears_stale_scratch_content(temp_dir: TempDir) {
        let root = utf8(temp_dir.path());
        let archive_path = root.join("lib.aar");
        let bytes = build_nested(&sample_entries(), &archive_path).expect("build archive");
        fs::write(&archive_path, bytes).expect("write archive");

        let dest = root.join("out");
        fs::create_dir_all(dest.join("stale")).expect("mkdir stale");
        fs::write(dest.join("stale/leftover.txt"), b"old").expect("write stale");

        extract(&archive_path, &dest).expect("extract over stale dir");
        assert!(!dest.join("stale").exists());
    }

    #[rstest]
    fn unreadable_archive_is_corrupt(temp_dir: TempDir) {
        let root = utf8(temp_dir.path());
        let archive_path = root.join("broken.aar");
        fs::write(&archive_path, b"definitely not a zip").expect("write");

        let result = extract(&archive_path, &root.join("out"));
        assert!(matches!(result, Err(FuseError::CorruptArchive { .. })));
    }

    #[test]
    fn nested_archive_rejects_traversal_entries() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("../escape.class", zip::write::SimpleFileOptions::default())
            .expect("start file");
        writer.write_all(b"x").expect("write");
        let bytes = writer.finish().expect("finish").into_inner();

        let result = read_nested(&bytes, Utf8Path::new("lib.aar!classes.jar"));
        assert!(matches!(result, Err(FuseError::CorruptArchive { .. })));
    }

    #[rstest]
    #[case::parent_dir("../escape.txt")]
    #[case::nested_parent("foo/../../escape.txt")]
    #[case::absolute("/etc/passwd")]
    #[case::backslash("res\\values.xml")]
    fn rejects_unsafe_paths(#[case] bad_path: &str) {
        assert!(validate_entry_path(bad_path).is_err(), "{bad_path} accepted");
    }

    #[test]
    fn accepts_normal_paths() {
        assert!(validate_entry_path("jni/arm64-v8a/libx.so").is_ok());
    }
}
