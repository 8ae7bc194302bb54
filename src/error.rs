//! Error types for the fusion pipeline.
//!
//! [`FuseError`] enumerates every way a single stage can fail. Planning
//! errors (collisions, relocation cycles) are raised before any bytes are
//! rewritten; format errors abort the file being rewritten and with it the
//! whole pipeline. [`PipelineError`] adds the variant and stage so callers can
//! act on a failure without inspecting engine internals.

use crate::artifact::ArtifactId;
use crate::variant::VariantName;
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;
use thiserror::Error;

/// Errors raised by the individual fusion stages.
#[derive(Debug, Error)]
pub enum FuseError {
    /// An archive's central directory or one of its entries is unreadable.
    #[error("corrupt archive {path}: {reason}")]
    CorruptArchive {
        /// The archive (or `outer!inner` nested archive) that failed.
        path: Utf8PathBuf,
        /// Description of the defect.
        reason: String,
    },

    /// An extracted package lacks its mandatory descriptor file.
    #[error("unknown package layout at {root}: {reason}")]
    UnknownLayout {
        /// Root directory of the extracted package.
        root: Utf8PathBuf,
        /// What was missing.
        reason: String,
    },

    /// Two inputs declare the same fully-qualified class.
    #[error("class {name} is declared by both {first} and {second}")]
    ClassCollision {
        /// Dotted fully-qualified class name.
        name: String,
        /// Artifact that contributed the class first.
        first: ArtifactId,
        /// Artifact that declared it again.
        second: ArtifactId,
    },

    /// Two inputs ship different native libraries for the same ABI and name.
    #[error("native library {path} differs between {first} and {second}")]
    NativeLibraryCollision {
        /// Archive path, `jni/<abi>/<file>`.
        path: String,
        /// Artifact that contributed the library first.
        first: ArtifactId,
        /// Artifact with the conflicting copy.
        second: ArtifactId,
    },

    /// Two inputs ship different content under the same path in a category
    /// that cannot be disambiguated (interface files, metadata, assets).
    #[error("{category} entry {path} differs between {first} and {second}")]
    EntryCollision {
        /// Category of the colliding entry.
        category: &'static str,
        /// Archive path of the entry.
        path: String,
        /// Artifact that contributed the entry first.
        first: ArtifactId,
        /// Artifact with the conflicting copy.
        second: ArtifactId,
    },

    /// A class file uses a format version newer than the rewriter supports.
    #[error(
        "class {path} has version {major}.{minor}; the newest supported major version is {max_major}"
    )]
    UnsupportedClassVersion {
        /// Path of the class inside the compiled-code archive.
        path: String,
        /// Major version found in the header.
        major: u16,
        /// Minor version found in the header.
        minor: u16,
        /// Highest major version the rewriter accepts.
        max_major: u16,
    },

    /// A class file cannot be parsed or does not match its path.
    #[error("malformed class {path}: {reason}")]
    MalformedClass {
        /// Path of the class inside the compiled-code archive.
        path: String,
        /// Description of the defect.
        reason: String,
    },

    /// A language-metadata record cannot be rewritten safely.
    #[error("unsupported metadata record {path}: {reason}")]
    MetadataFormatUnsupported {
        /// Path of the record inside the compiled-code archive.
        path: String,
        /// Why the record was rejected.
        reason: String,
    },

    /// A relocation rule targets a namespace that another rule relocates.
    #[error("relocation rule {from} -> {to} feeds rule {other}")]
    RelocationCycle {
        /// Source pattern of the offending rule.
        from: String,
        /// Target prefix of the offending rule.
        to: String,
        /// Source pattern of the rule it would feed.
        other: String,
    },

    /// A relocation rule is syntactically invalid.
    #[error("invalid relocation rule {rule}: {reason}")]
    InvalidRelocationRule {
        /// Rendering of the rejected rule.
        rule: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A manifest descriptor is not well-formed XML or lacks its root.
    #[error("malformed manifest from {origin}: {reason}")]
    MalformedManifest {
        /// Artifact or path the descriptor came from.
        origin: String,
        /// Parser message.
        reason: String,
    },

    /// The manifest-merge collaborator rejected the inputs.
    #[error("manifest merge conflict on {name}: {reason}")]
    ManifestMergeConflict {
        /// Element or attribute the conflict was found on.
        name: String,
        /// Description of the conflict.
        reason: String,
    },

    /// A file-system operation failed.
    #[error("I/O failure at {path}")]
    IoFailure {
        /// Path being read or written.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A build variant name is empty or unsafe as a path component.
    #[error("invalid variant name \"{value}\": {reason}")]
    InvalidVariant {
        /// The rejected name.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The configuration file is missing, unparsable or inconsistent.
    #[error("invalid configuration {path}: {reason}")]
    Config {
        /// Path of the configuration file.
        path: Utf8PathBuf,
        /// Description of the problem.
        reason: String,
    },

    /// A single-use pipeline was asked to run a second time.
    #[error("pipeline for variant {variant} has already run")]
    PipelineReused {
        /// Variant whose pipeline was reused.
        variant: VariantName,
    },
}

/// Result type alias using [`FuseError`].
pub type Result<T> = std::result::Result<T, FuseError>;

/// Build a closure mapping an [`std::io::Error`] to [`FuseError::IoFailure`]
/// at `path`.
pub(crate) fn io_failure(path: &Utf8Path) -> impl FnOnce(std::io::Error) -> FuseError + '_ {
    move |source| FuseError::IoFailure {
        path: path.to_owned(),
        source,
    }
}

/// Pipeline stage names, used to report where a variant failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Archive extraction and package loading.
    Extract,
    /// Merge planning into the working tree.
    Merge,
    /// Symbol-table construction and rewriting.
    Relocate,
    /// Writing the fused archive.
    Package,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Extract => "extract",
            Self::Merge => "merge",
            Self::Relocate => "relocate",
            Self::Package => "package",
        };
        f.write_str(name)
    }
}

/// A stage failure annotated with the variant and stage it occurred in.
#[derive(Debug, Error)]
#[error("variant {variant} failed during {stage}: {source}")]
pub struct PipelineError {
    /// Variant whose pipeline failed.
    pub variant: VariantName,
    /// Stage that raised the error.
    pub stage: Stage,
    /// The stage error.
    #[source]
    pub source: Box<FuseError>,
}

impl PipelineError {
    /// Wrap `source` with its variant and stage.
    #[must_use]
    pub fn new(variant: VariantName, stage: Stage, source: FuseError) -> Self {
        Self {
            variant,
            stage,
            source: Box::new(source),
        }
    }

    /// The underlying stage error.
    #[must_use]
    pub fn kind(&self) -> &FuseError {
        &self.source
    }
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests fail loudly on broken fixtures")]
mod tests {
    use super::*;

    #[test]
    fn class_collision_names_both_sources() {
        let err = FuseError::ClassCollision {
            name: "com.x.Foo".to_owned(),
            first: ArtifactId::from("lib-a"),
            second: ArtifactId::from("lib-b"),
        };
        let msg = err.to_string();
        assert!(msg.contains("com.x.Foo"));
        assert!(msg.contains("lib-a"));
        assert!(msg.contains("lib-b"));
    }

    #[test]
    fn unsupported_class_version_reports_limit() {
        let err = FuseError::UnsupportedClassVersion {
            path: "com/x/Foo.class".to_owned(),
            major: 99,
            minor: 0,
            max_major: 65,
        };
        let msg = err.to_string();
        assert!(msg.contains("99.0"));
        assert!(msg.contains("65"));
    }

    #[test]
    fn io_failure_preserves_source() {
        let err = io_failure(Utf8Path::new("/tmp/out.aar"))(std::io::Error::other("disk full"));
        assert!(err.to_string().contains("/tmp/out.aar"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn pipeline_error_names_variant_and_stage() {
        let variant = VariantName::try_from("release").expect("valid variant");
        let err = PipelineError::new(
            variant,
            Stage::Merge,
            FuseError::RelocationCycle {
                from: "a".to_owned(),
                to: "b".to_owned(),
                other: "b".to_owned(),
            },
        );
        let msg = err.to_string();
        assert!(msg.contains("release"));
        assert!(msg.contains("merge"));
        assert!(matches!(err.kind(), FuseError::RelocationCycle { .. }));
    }
}
