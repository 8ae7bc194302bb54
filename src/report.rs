//! Diagnostics report for one fusion run.
//!
//! The report is accumulated by the merge and relocation stages and, when
//! requested, written as pretty-printed JSON next to the fused archive.

use crate::artifact::ArtifactId;
use crate::error::{FuseError, Result};
use camino::Utf8Path;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;

/// An entry shipped by several inputs with identical content; one copy kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateEntry {
    /// Entry category (`native library`, `asset`, ...).
    pub category: &'static str,
    /// Archive path of the entry.
    pub path: String,
    /// Artifact whose copy was kept.
    pub kept: ArtifactId,
    /// Artifact whose copy was dropped.
    pub dropped: ArtifactId,
}

/// An entry renamed to avoid a file-name collision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryRename {
    /// Artifact that contributed the renamed file.
    pub artifact: ArtifactId,
    /// Original archive path.
    pub from: String,
    /// Path in the fused archive.
    pub to: String,
}

/// Something deliberately left out of the fused archive or of relocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    /// What kind of thing was skipped (`java resource`, `package`, ...).
    pub category: &'static str,
    /// Path or symbol name.
    pub name: String,
    /// Artifact the entry came from.
    pub artifact: ArtifactId,
    /// Human-readable reason.
    pub reason: String,
}

/// Summary of the written archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputSummary {
    /// Destination path.
    pub path: String,
    /// Lowercase hex SHA-256 digest of the archive.
    pub sha256: String,
    /// Number of top-level archive entries.
    pub entries: usize,
}

/// Everything a caller needs to audit a fusion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FusionReport {
    /// Variant the report belongs to.
    pub variant: String,
    /// Input ids, primary first.
    pub inputs: Vec<ArtifactId>,
    /// Identical duplicates that were collapsed.
    pub duplicates: Vec<DuplicateEntry>,
    /// Resource files and metadata records renamed to resolve collisions.
    pub renames: Vec<EntryRename>,
    /// Entries and symbols left out.
    pub skipped: Vec<SkippedEntry>,
    /// Relocated classes, original dotted name to new dotted name.
    pub relocated: BTreeMap<String, String>,
    /// The written archive; absent until packaging succeeds.
    pub output: Option<OutputSummary>,
}

impl FusionReport {
    pub(crate) fn duplicate(
        &mut self,
        category: &'static str,
        path: &str,
        kept: &ArtifactId,
        dropped: &ArtifactId,
    ) {
        self.duplicates.push(DuplicateEntry {
            category,
            path: path.to_owned(),
            kept: kept.clone(),
            dropped: dropped.clone(),
        });
    }

    pub(crate) fn skip(
        &mut self,
        category: &'static str,
        name: impl Into<String>,
        artifact: &ArtifactId,
        reason: impl Into<String>,
    ) {
        self.skipped.push(SkippedEntry {
            category,
            name: name.into(),
            artifact: artifact.clone(),
            reason: reason.into(),
        });
    }

    /// Write the report as pretty-printed JSON to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::IoFailure`] if the file cannot be written.
    pub fn write_json(&self, path: &Utf8Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| FuseError::IoFailure {
            path: path.to_owned(),
            source: std::io::Error::other(e),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
            fs::create_dir_all(parent).map_err(crate::error::io_failure(parent))?;
        }
        fs::write(path, json).map_err(crate::error::io_failure(path))
    }
}

#[cfg(test)]
#[expect(
    clippy::expect_used,
    clippy::indexing_slicing,
    reason = "tests fail loudly on broken fixtures and missing entries"
)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    #[test]
    fn report_serialises_collections() {
        let mut report = FusionReport {
            variant: "release".to_owned(),
            ..FusionReport::default()
        };
        report.duplicate(
            "native library",
            "jni/x86/liba.so",
            &ArtifactId::from("core"),
            &ArtifactId::from("extra"),
        );
        report.skip("package", "com.shared", &ArtifactId::from("extra"), "split package");
        report
            .relocated
            .insert("com.lib.A".to_owned(), "shaded.com.lib.A".to_owned());

        let value = serde_json::to_value(&report).expect("serialise");
        assert_eq!(value["variant"], "release");
        assert_eq!(value["duplicates"][0]["kept"], "core");
        assert_eq!(value["skipped"][0]["name"], "com.shared");
        assert_eq!(value["relocated"]["com.lib.A"], "shaded.com.lib.A");
        assert!(value["output"].is_null());
    }

    #[test]
    fn write_json_creates_parent_directories() {
        let dir = TempDir::new().expect("temp dir");
        let path = Utf8PathBuf::try_from(dir.path().join("reports/out.report.json"))
            .expect("utf8 path");

        FusionReport::default().write_json(&path).expect("write report");

        let text = fs::read_to_string(&path).expect("read back");
        assert!(text.contains("\"relocated\""));
    }
}
