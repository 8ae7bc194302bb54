//! Deterministic archive writing.
//!
//! Entries are written in [`EntryMap`] order with a fixed timestamp and
//! fixed permissions, so identical inputs always produce byte-identical
//! archives. The final output replaces its destination atomically: it is
//! written to a temp file beside the destination and renamed over it.

use super::EntryMap;
use crate::error::{FuseError, Result, io_failure};
use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Cursor, Read, Seek, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

/// Write `entries` as a zip archive into `writer`.
///
/// `origin` names the archive in error messages.
///
/// # Errors
///
/// Returns [`FuseError::IoFailure`] if writing fails.
pub fn write_archive<W: Write + Seek>(writer: W, entries: &EntryMap, origin: &Utf8Path) -> Result<W> {
    let mut zip = ZipWriter::new(writer);
    for (name, bytes) in entries {
        zip.start_file(name.as_str(), entry_options())
            .map_err(|e| zip_failure(origin, e))?;
        zip.write_all(bytes).map_err(io_failure(origin))?;
    }
    zip.finish().map_err(|e| zip_failure(origin, e))
}

/// Build a nested archive (such as `classes.jar`) in memory.
///
/// # Errors
///
/// Returns [`FuseError::IoFailure`] if the archive cannot be assembled.
pub fn build_nested(entries: &EntryMap, origin: &Utf8Path) -> Result<Vec<u8>> {
    let cursor = write_archive(Cursor::new(Vec::new()), entries, origin)?;
    Ok(cursor.into_inner())
}

/// Write `entries` to `dest`, replacing any existing file atomically.
///
/// A failure at any point leaves `dest` exactly as it was.
///
/// # Errors
///
/// Returns [`FuseError::IoFailure`] if the temp file cannot be written or
/// renamed over `dest`.
pub fn replace_atomically(dest: &Utf8Path, entries: &EntryMap) -> Result<()> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    fs::create_dir_all(parent).map_err(io_failure(parent))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".aar-fuse-")
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(io_failure(parent))?;
    write_archive(temp.as_file_mut(), entries, dest)?;
    temp.as_file().sync_all().map_err(io_failure(dest))?;
    temp.persist(dest).map_err(|e| FuseError::IoFailure {
        path: Utf8PathBuf::from(dest),
        source: e.error,
    })?;
    Ok(())
}

/// Compute the lowercase hex SHA-256 digest of the file at `path`.
///
/// # Errors
///
/// Returns [`FuseError::IoFailure`] if the file cannot be read.
pub fn compute_sha256(path: &Utf8Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(io_failure(path))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = file.read(&mut buffer).map_err(io_failure(path))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(buffer.get(..bytes_read).unwrap_or_default());
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644)
}

fn zip_failure(origin: &Utf8Path, error: zip::result::ZipError) -> FuseError {
    match error {
        zip::result::ZipError::Io(source) => FuseError::IoFailure {
            path: Utf8PathBuf::from(origin),
            source,
        },
        other => FuseError::IoFailure {
            path: Utf8PathBuf::from(origin),
            source: std::io::Error::other(other.to_string()),
        },
    }
}
