//! Per-variant orchestration of extract, merge, relocate and package.
//!
//! A [`VariantPipeline`] is single-use and walks
//! `Idle → Extracted → Merged → Relocated → Packaged → Done`; any stage
//! failure moves it to `Failed(stage)` and nothing is written to the
//! destination. Each variant extracts into its own scratch directory,
//! `<scratch_root>/<variant>/`, so pipelines for different variants can run
//! on separate threads without sharing any path.

use crate::archive::extraction::prepare_scratch_dir;
use crate::artifact::{self, Artifact, InputArtifact};
use crate::error::{FuseError, PipelineError, Result, Stage};
use crate::merge::manifest::{ManifestMerger, ManifestSettings};
use crate::merge::{MergePlanner, WorkingTree};
use crate::relocation::symbols::SymbolTable;
use crate::relocation::{self, RelocationInput};
use crate::repackage;
use crate::report::{FusionReport, OutputSummary};
use crate::variant::VariantName;
use camino::{Utf8Path, Utf8PathBuf};
use log::{error, info};

/// Everything needed to fuse one variant.
#[derive(Debug, Clone)]
pub struct FusionRequest {
    /// Variant being built.
    pub variant: VariantName,
    /// The library whose manifest and namespace the fused package keeps.
    pub primary: InputArtifact,
    /// Dependencies to fold in, in resolution order.
    pub secondaries: Vec<InputArtifact>,
    /// How symbols are relocated.
    pub relocation: RelocationInput,
    /// Values handed to the manifest merger.
    pub manifest: ManifestSettings,
    /// Where the fused archive is written; replaced atomically.
    pub destination: Utf8PathBuf,
    /// Where to write the JSON diagnostics report, if anywhere.
    pub report: Option<Utf8PathBuf>,
}

/// Position of a pipeline in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Not started.
    Idle,
    /// Inputs extracted and loaded.
    Extracted,
    /// Inputs merged into a working tree.
    Merged,
    /// Symbols relocated.
    Relocated,
    /// Archive written.
    Packaged,
    /// Report written; the pipeline is finished.
    Done,
    /// The named stage failed.
    Failed(Stage),
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct FusionOutcome {
    /// The written archive.
    pub destination: Utf8PathBuf,
    /// Lowercase hex SHA-256 digest of the archive.
    pub sha256: String,
    /// Number of top-level archive entries.
    pub entries: usize,
    /// Diagnostics collected during the run.
    pub report: FusionReport,
}

/// Single-use pipeline for one variant.
pub struct VariantPipeline<'a> {
    request: FusionRequest,
    scratch_root: Utf8PathBuf,
    merger: &'a dyn ManifestMerger,
    state: PipelineState,
}

impl<'a> VariantPipeline<'a> {
    /// Prepare a pipeline that extracts under `scratch_root/<variant>`.
    #[must_use]
    pub fn new(
        request: FusionRequest,
        scratch_root: impl Into<Utf8PathBuf>,
        merger: &'a dyn ManifestMerger,
    ) -> Self {
        Self {
            request,
            scratch_root: scratch_root.into(),
            merger,
            state: PipelineState::Idle,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> PipelineState {
        self.state
    }

    /// The scratch directory owned by this variant.
    #[must_use]
    pub fn scratch_dir(&self) -> Utf8PathBuf {
        self.scratch_root.join(self.request.variant.as_str())
    }

    /// Run every stage in order.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] naming the variant and the failing stage.
    /// A pipeline that has already run fails with
    /// [`FuseError::PipelineReused`] and keeps its state.
    pub fn run(&mut self) -> std::result::Result<FusionOutcome, PipelineError> {
        let variant = self.request.variant.clone();
        if self.state != PipelineState::Idle {
            return Err(PipelineError::new(
                variant.clone(),
                Stage::Extract,
                FuseError::PipelineReused { variant },
            ));
        }
        info!("variant {variant}: fusing into {}", self.request.destination);
        self.request
            .relocation
            .validate()
            .map_err(|e| self.fail(Stage::Relocate, e))?;

        let (primary, secondaries) = self.extract().map_err(|e| self.fail(Stage::Extract, e))?;
        self.state = PipelineState::Extracted;

        let mut tree = self
            .merge(&primary, &secondaries)
            .map_err(|e| self.fail(Stage::Merge, e))?;
        self.state = PipelineState::Merged;

        self.relocate(&mut tree)
            .map_err(|e| self.fail(Stage::Relocate, e))?;
        self.state = PipelineState::Relocated;

        let outcome = self.package(tree).map_err(|e| self.fail(Stage::Package, e))?;
        self.state = PipelineState::Packaged;

        if let Some(path) = self.request.report.clone() {
            outcome
                .report
                .write_json(&path)
                .map_err(|e| self.fail(Stage::Package, e))?;
        }
        self.state = PipelineState::Done;
        info!("variant {variant}: done ({})", outcome.sha256);
        Ok(outcome)
    }

    fn fail(&mut self, stage: Stage, source: FuseError) -> PipelineError {
        error!("variant {}: {stage} failed: {source}", self.request.variant);
        self.state = PipelineState::Failed(stage);
        PipelineError::new(self.request.variant.clone(), stage, source)
    }

    /// Clears this variant's input scratch area, then loads every input
    /// into its own subdirectory.
    fn extract(&self) -> Result<(Artifact, Vec<Artifact>)> {
        let inputs_dir = self.scratch_dir().join("inputs");
        prepare_scratch_dir(&inputs_dir)?;
        let open = |index: usize, input: &InputArtifact| {
            artifact::open(input, &inputs_dir.join(format!("{index}-{}", input.id)))
        };
        let primary = open(0, &self.request.primary)?;
        let secondaries = self
            .request
            .secondaries
            .iter()
            .enumerate()
            .map(|(index, input)| open(index + 1, input))
            .collect::<Result<Vec<_>>>()?;
        Ok((primary, secondaries))
    }

    fn merge(&self, primary: &Artifact, secondaries: &[Artifact]) -> Result<WorkingTree> {
        let mut tree =
            MergePlanner::new(self.merger, &self.request.manifest).merge(primary, secondaries)?;
        tree.report.variant = self.request.variant.to_string();
        Ok(tree)
    }

    fn relocate(&self, tree: &mut WorkingTree) -> Result<()> {
        let spec = self.request.relocation.resolve(tree)?;
        let table = SymbolTable::build(&spec, tree)?;
        relocation::apply(tree, &table)
    }

    fn package(&self, tree: WorkingTree) -> Result<FusionOutcome> {
        let destination = self.request.destination.clone();
        let summary = repackage::write(&tree, &destination)?;
        let mut report = tree.into_report();
        report.output = Some(OutputSummary {
            path: destination.to_string(),
            sha256: summary.sha256.clone(),
            entries: summary.entries,
        });
        Ok(FusionOutcome {
            destination,
            sha256: summary.sha256,
            entries: summary.entries,
            report,
        })
    }
}

/// Run one pipeline per request, each on its own thread.
///
/// Results are returned in request order. Requests must name distinct
/// variants and destinations; [`crate::config::FuseConfig::requests`]
/// guarantees both.
#[must_use]
pub fn run_all(
    requests: Vec<FusionRequest>,
    scratch_root: &Utf8Path,
    merger: &dyn ManifestMerger,
) -> Vec<std::result::Result<FusionOutcome, PipelineError>> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let variant = request.variant.clone();
                let handle =
                    scope.spawn(move || VariantPipeline::new(request, scratch_root, merger).run());
                (variant, handle)
            })
            .collect();
        handles
            .into_iter()
            .map(|(variant, handle)| {
                handle.join().unwrap_or_else(|_| {
                    Err(PipelineError::new(
                        variant.clone(),
                        Stage::Package,
                        FuseError::IoFailure {
                            path: scratch_root.join(variant.as_str()),
                            source: std::io::Error::other("pipeline thread panicked"),
                        },
                    ))
                })
            })
            .collect()
    })
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests fail loudly on broken fixtures")]
mod tests {
    use super::*;
    use crate::artifact::InputKind;
    use crate::merge::manifest::BasicManifestMerger;
    use crate::testing::{AarBuilder, ClassFileBuilder};
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    struct Workspace {
        _dir: TempDir,
        root: Utf8PathBuf,
    }

    #[fixture]
    fn workspace() -> Workspace {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
        Workspace { _dir: dir, root }
    }

    fn request(root: &Utf8Path, variant: &str, secondaries: Vec<InputArtifact>) -> FusionRequest {
        let primary = root.join("app.aar");
        AarBuilder::new("com.app")
            .class(ClassFileBuilder::new("com/app/Main").build())
            .write(&primary)
            .expect("primary");
        FusionRequest {
            variant: VariantName::try_from(variant).expect("variant"),
            primary: InputArtifact::new(primary, InputKind::LibraryArchive),
            secondaries,
            relocation: RelocationInput::Prefix("shaded".to_owned()),
            manifest: ManifestSettings::default(),
            destination: root.join(format!("out/{variant}.aar")),
            report: None,
        }
    }

    fn library(root: &Utf8Path, name: &str, class: &str) -> InputArtifact {
        let path = root.join(format!("{name}.aar"));
        AarBuilder::new(&format!("com.{name}"))
            .class(ClassFileBuilder::new(class).build())
            .write(&path)
            .expect("library");
        InputArtifact::new(path, InputKind::LibraryArchive)
    }

    #[rstest]
    fn successful_run_ends_done(workspace: Workspace) {
        let lib = library(&workspace.root, "lib", "com/lib/A");
        let mut pipeline = VariantPipeline::new(
            request(&workspace.root, "release", vec![lib]),
            workspace.root.join("scratch"),
            &BasicManifestMerger,
        );
        let outcome = pipeline.run().expect("run");

        assert_eq!(pipeline.state(), PipelineState::Done);
        assert!(outcome.destination.is_file());
        assert_eq!(outcome.report.variant, "release");
        assert!(outcome.report.relocated.contains_key("com.lib.A"));
        assert!(workspace.root.join("scratch/release/inputs/0-app").is_dir());
    }

    #[rstest]
    fn second_run_is_refused(workspace: Workspace) {
        let mut pipeline = VariantPipeline::new(
            request(&workspace.root, "debug", Vec::new()),
            workspace.root.join("scratch"),
            &BasicManifestMerger,
        );
        pipeline.run().expect("first run");
        let err = pipeline.run().expect_err("second run");
        assert!(matches!(err.kind(), FuseError::PipelineReused { .. }));
        assert_eq!(pipeline.state(), PipelineState::Done);
    }

    #[rstest]
    fn merge_failure_is_reported_with_its_stage(workspace: Workspace) {
        let clash = library(&workspace.root, "clash", "com/app/Main");
        let mut pipeline = VariantPipeline::new(
            request(&workspace.root, "release", vec![clash]),
            workspace.root.join("scratch"),
            &BasicManifestMerger,
        );
        let err = pipeline.run().expect_err("collision");

        assert_eq!(err.stage, Stage::Merge);
        assert!(matches!(err.kind(), FuseError::ClassCollision { .. }));
        assert_eq!(pipeline.state(), PipelineState::Failed(Stage::Merge));
        assert!(!workspace.root.join("out/release.aar").exists());
    }

    #[rstest]
    fn cyclic_rules_fail_before_extraction(workspace: Workspace) {
        let mut request = request(&workspace.root, "release", Vec::new());
        request.relocation = RelocationInput::Rules(vec![
            relocation::RelocationRule::new("a", "b").expect("rule"),
            relocation::RelocationRule::new("b", "c").expect("rule"),
        ]);
        let mut pipeline =
            VariantPipeline::new(request, workspace.root.join("scratch"), &BasicManifestMerger);
        let err = pipeline.run().expect_err("cycle");

        assert_eq!(err.stage, Stage::Relocate);
        assert!(!workspace.root.join("scratch/release").exists());
    }

    #[rstest]
    fn stale_scratch_content_is_cleared(workspace: Workspace) {
        let stale = workspace.root.join("scratch/release/inputs/0-app/stale.txt");
        std::fs::create_dir_all(stale.parent().expect("parent")).expect("mkdir");
        std::fs::write(&stale, "left over").expect("write");

        let mut pipeline = VariantPipeline::new(
            request(&workspace.root, "release", Vec::new()),
            workspace.root.join("scratch"),
            &BasicManifestMerger,
        );
        pipeline.run().expect("run");
        assert!(!stale.exists());
    }

    #[rstest]
    fn variants_run_side_by_side(workspace: Workspace) {
        let requests = vec![
            request(&workspace.root, "debug", Vec::new()),
            request(&workspace.root, "release", Vec::new()),
        ];
        let results = run_all(requests, &workspace.root.join("scratch"), &BasicManifestMerger);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(std::result::Result::is_ok));
        assert!(workspace.root.join("out/debug.aar").is_file());
        assert!(workspace.root.join("out/release.aar").is_file());
    }
}
