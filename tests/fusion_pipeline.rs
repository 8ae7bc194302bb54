//! End-to-end fusion runs over synthesised library archives.

#![expect(
    clippy::expect_used,
    clippy::indexing_slicing,
    reason = "tests fail loudly on broken fixtures and missing entries"
)]

use aar_fuse::artifact::manifest::ManifestDescriptor;
use aar_fuse::artifact::{self, InputArtifact, InputKind};
use aar_fuse::error::{FuseError, Stage};
use aar_fuse::merge::manifest::{BasicManifestMerger, ManifestSettings};
use aar_fuse::merge::{MergePlanner, WorkingTree};
use aar_fuse::pipeline::{self, FusionRequest, PipelineState, VariantPipeline};
use aar_fuse::relocation::symbols::SymbolTable;
use aar_fuse::relocation::{self, RelocationInput};
use aar_fuse::testing::{
    AarBuilder, ClassFileBuilder, manifest_text, read_archive, read_classes, utf8_constants,
};
use aar_fuse::variant::VariantName;
use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use std::fs;
use tempfile::TempDir;

struct Workspace {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    fn path(&self, name: &str) -> Utf8PathBuf {
        self.root.join(name)
    }

    fn write(&self, name: &str, builder: &AarBuilder) -> InputArtifact {
        let path = self.path(name);
        builder.write(&path).expect("write fixture archive");
        InputArtifact::new(path, InputKind::LibraryArchive)
    }

    fn request(&self, primary: InputArtifact, secondaries: Vec<InputArtifact>) -> FusionRequest {
        FusionRequest {
            variant: VariantName::try_from("release").expect("variant"),
            primary,
            secondaries,
            relocation: RelocationInput::Prefix("shaded".to_owned()),
            manifest: ManifestSettings::default(),
            destination: self.path("out/fused.aar"),
            report: None,
        }
    }
}

#[fixture]
fn workspace() -> Workspace {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
    Workspace { _dir: dir, root }
}

/// A primary that starts `com.lib.A` from its manifest and links `com.lib.B`.
fn primary_archive() -> AarBuilder {
    let manifest = manifest_text("com.app").replace(
        "<application/>",
        "<application>\n        <activity android:name=\"com.lib.A\"/>\n    </application>",
    );
    AarBuilder::new("com.app")
        .manifest(&manifest)
        .class(
            ClassFileBuilder::new("com/app/Main")
                .class_ref("com/lib/B")
                .field("helper", "Lcom/lib/A;")
                .string("com.lib.A")
                .build(),
        )
        .entry(
            "res/values/strings.xml",
            b"<resources><string name=\"app\">x</string></resources>",
        )
        .entry("assets/app.txt", b"app")
}

fn lib_archive(class: &str) -> AarBuilder {
    AarBuilder::new("com.lib").class(
        ClassFileBuilder::new(class)
            .class_ref("com/lib/R$string")
            .build(),
    )
}

fn run(
    request: FusionRequest,
    scratch: &Utf8Path,
) -> Result<pipeline::FusionOutcome, aar_fuse::PipelineError> {
    VariantPipeline::new(request, scratch, &BasicManifestMerger).run()
}

/// Every text mention of a relocatable name that is not under `shaded`.
fn leftover_mentions(text: &str) -> usize {
    let stripped = text.replace("shaded.com.lib", "").replace("shaded/com/lib", "");
    stripped.matches("com.lib.").count() + stripped.matches("com/lib/").count()
}

// ---------------------------------------------------------------------------
// Round trip
// ---------------------------------------------------------------------------

#[rstest]
fn single_input_round_trips_without_relocation(workspace: Workspace) {
    let builder = primary_archive().entry("jni/arm64-v8a/libapp.so", b"elf");
    let primary = workspace.write("app.aar", &builder);
    let mut request = workspace.request(primary, Vec::new());
    request.relocation = RelocationInput::None;
    let destination = request.destination.clone();

    run(request, &workspace.path("scratch")).expect("fusion");

    let original = builder.entries().expect("fixture entries");
    let fused = read_archive(&destination).expect("fused archive");
    assert_eq!(
        original.keys().collect::<Vec<_>>(),
        fused.keys().collect::<Vec<_>>()
    );
    for (path, bytes) in &original {
        if path != "classes.jar" {
            assert_eq!(fused.get(path), Some(bytes), "{path} changed");
        }
    }
    let original_classes = read_classes(&workspace.path("app.aar")).expect("original classes");
    let fused_classes = read_classes(&destination).expect("fused classes");
    assert_eq!(original_classes, fused_classes);

    let manifest = ManifestDescriptor::parse(
        String::from_utf8(fused["AndroidManifest.xml"].clone()).expect("utf8 manifest"),
        "fused",
    )
    .expect("manifest");
    assert_eq!(manifest.package(), Some("com.app"));
}

// ---------------------------------------------------------------------------
// Prefix relocation of two secondaries sharing a namespace
// ---------------------------------------------------------------------------

#[rstest]
fn prefix_relocates_secondary_classes_and_references(workspace: Workspace) {
    let primary = workspace.write("app.aar", &primary_archive());
    let first = workspace.write("lib-a.aar", &lib_archive("com/lib/A"));
    let second = workspace.write("lib-b.aar", &lib_archive("com/lib/B"));
    let request = workspace.request(primary, vec![first, second]);
    let destination = request.destination.clone();

    let outcome = run(request, &workspace.path("scratch")).expect("fusion");

    let classes = read_classes(&destination).expect("fused classes");
    let names: Vec<&str> = classes.keys().map(String::as_str).collect();
    assert_eq!(
        names,
        ["com/app/Main.class", "shaded/com/lib/A.class", "shaded/com/lib/B.class"]
    );
    let relocated = &outcome.report.relocated;
    assert_eq!(relocated.get("com.lib.A").map(String::as_str), Some("shaded.com.lib.A"));
    assert_eq!(relocated.get("com.lib.B").map(String::as_str), Some("shaded.com.lib.B"));

    let main = utf8_constants(&classes["com/app/Main.class"]).expect("main constants");
    assert!(main.iter().any(|c| c == "shaded/com/lib/B"));
    assert!(main.iter().any(|c| c == "Lshaded/com/lib/A;"));
    assert!(main.iter().any(|c| c == "shaded.com.lib.A"));

    let archive = read_archive(&destination).expect("archive");
    let manifest =
        String::from_utf8(archive["AndroidManifest.xml"].clone()).expect("utf8 manifest");
    assert!(manifest.contains("android:name=\"shaded.com.lib.A\""));
    assert!(manifest.contains("package=\"com.app\""));
}

#[rstest]
fn relocated_output_mentions_no_original_names(workspace: Workspace) {
    let primary = workspace.write("app.aar", &primary_archive());
    let lib_builder = lib_archive("com/lib/A")
        .class(
            ClassFileBuilder::new("com/lib/B")
                .signature("Ljava/util/List<Lcom/lib/A;>;")
                .build(),
        )
        .entry(
            "aidl/com/lib/IThing.aidl",
            b"package com.lib;\n\ninterface IThing {\n    com.lib.A get();\n}\n",
        )
        .entry("proguard.txt", b"-keep class com.lib.** { *; }\n");
    let lib = workspace.write("lib.aar", &lib_builder);
    let request = workspace.request(primary, vec![lib]);
    let destination = request.destination.clone();

    run(request, &workspace.path("scratch")).expect("fusion");

    for (path, bytes) in read_classes(&destination).expect("classes") {
        for constant in utf8_constants(&bytes).expect("constants") {
            assert_eq!(leftover_mentions(&constant), 0, "{path} mentions {constant}");
        }
    }
    for (path, bytes) in read_archive(&destination).expect("archive") {
        if path == "classes.jar" {
            continue;
        }
        let text = String::from_utf8_lossy(&bytes);
        assert_eq!(leftover_mentions(&text), 0, "{path} still mentions com.lib:\n{text}");
    }
}

// ---------------------------------------------------------------------------
// Interface files
// ---------------------------------------------------------------------------

#[rstest]
fn interface_files_move_with_their_type(workspace: Workspace) {
    let app_builder = AarBuilder::new("com.app")
        .class(ClassFileBuilder::new("com/app/Main").class_ref("com/lib/IThing").build());
    let primary = workspace.write("app.aar", &app_builder);
    let lib_builder = AarBuilder::new("com.lib")
        .class(ClassFileBuilder::new("com/lib/Impl").build())
        .entry("aidl/com/lib/IThing.aidl", b"package com.lib;\n\ninterface IThing {}\n");
    let lib = workspace.write("lib.aar", &lib_builder);
    let request = workspace.request(primary, vec![lib]);
    let destination = request.destination.clone();

    run(request, &workspace.path("scratch")).expect("fusion");

    let archive = read_archive(&destination).expect("archive");
    assert!(!archive.contains_key("aidl/com/lib/IThing.aidl"));
    let interface =
        String::from_utf8(archive["aidl/shaded/com/lib/IThing.aidl"].clone()).expect("utf8");
    assert!(interface.starts_with("package shaded.com.lib;"));

    let classes = read_classes(&destination).expect("classes");
    let main = utf8_constants(&classes["com/app/Main.class"]).expect("constants");
    assert!(main.iter().any(|c| c == "shaded/com/lib/IThing"));
    assert!(!main.iter().any(|c| c == "com/lib/IThing"));
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[rstest]
fn class_collision_produces_no_output(workspace: Workspace) {
    let primary = workspace.write("app.aar", &primary_archive());
    let foo = ClassFileBuilder::new("com/x/Foo").build();
    let first = workspace.write("x1.aar", &AarBuilder::new("com.x1").class(foo.clone()));
    let second = workspace.write("x2.aar", &AarBuilder::new("com.x2").class(foo));
    let request = workspace.request(primary, vec![first, second]);
    let destination = request.destination.clone();

    let err = run(request, &workspace.path("scratch")).expect_err("collision");
    assert_eq!(err.stage, Stage::Merge);
    assert!(matches!(err.kind(), FuseError::ClassCollision { name, .. } if name == "com.x.Foo"));
    assert!(!destination.exists());
}

#[rstest]
fn native_collision_leaves_destination_unchanged(workspace: Workspace) {
    let primary = workspace.write("app.aar", &primary_archive());
    let library = |package: &str, bytes: &[u8]| {
        AarBuilder::new(package).entry("jni/arm64-v8a/libx.so", bytes)
    };
    let first = workspace.write("n1.aar", &library("com.n1", b"one"));
    let second = workspace.write("n2.aar", &library("com.n2", b"two"));
    let request = workspace.request(primary, vec![first, second]);
    let destination = request.destination.clone();
    fs::create_dir_all(destination.parent().expect("parent")).expect("output dir");
    fs::write(&destination, b"previous build").expect("seed destination");

    let mut pipeline =
        VariantPipeline::new(request, workspace.path("scratch"), &BasicManifestMerger);
    let err = pipeline.run().expect_err("collision");

    assert!(matches!(err.kind(), FuseError::NativeLibraryCollision { .. }));
    assert_eq!(pipeline.state(), PipelineState::Failed(Stage::Merge));
    assert_eq!(fs::read(&destination).expect("destination"), b"previous build");
}

// ---------------------------------------------------------------------------
// Idempotence over the public stages
// ---------------------------------------------------------------------------

fn relocate(tree: &mut WorkingTree, input: &RelocationInput) {
    let spec = input.resolve(tree).expect("resolve");
    let table = SymbolTable::build(&spec, tree).expect("symbol table");
    relocation::apply(tree, &table).expect("apply");
}

#[rstest]
fn relocating_twice_changes_nothing(workspace: Workspace) {
    let primary_input = workspace.write("app.aar", &primary_archive());
    let lib_input = workspace.write(
        "lib.aar",
        &lib_archive("com/lib/A")
            .class(ClassFileBuilder::new("com/lib/R$string").build())
            .entry("aidl/com/lib/IThing.aidl", b"package com.lib;\ninterface IThing {}\n"),
    );
    let primary = artifact::open(&primary_input, &workspace.path("scratch/0")).expect("primary");
    let lib = artifact::open(&lib_input, &workspace.path("scratch/1")).expect("lib");
    let settings = ManifestSettings::default();
    let mut tree = MergePlanner::new(&BasicManifestMerger, &settings)
        .merge(&primary, &[lib])
        .expect("merge");
    let input = RelocationInput::Prefix("shaded".to_owned());

    relocate(&mut tree, &input);
    let classes = tree.class_files().clone();
    let interfaces = tree.interface_files().clone();
    let manifest = tree.manifest().as_str().to_owned();
    assert!(classes.contains_key("com/app/R$string.class"));

    relocate(&mut tree, &input);
    assert_eq!(tree.class_files(), &classes);
    assert_eq!(tree.interface_files(), &interfaces);
    assert_eq!(tree.manifest().as_str(), manifest);
}

// ---------------------------------------------------------------------------
// Concurrent variants
// ---------------------------------------------------------------------------

#[rstest]
fn variants_run_side_by_side(workspace: Workspace) {
    let primary = workspace.write("app.aar", &primary_archive());
    let lib = workspace.write("lib.aar", &lib_archive("com/lib/A"));
    let requests: Vec<FusionRequest> = ["debug", "release"]
        .into_iter()
        .map(|variant| FusionRequest {
            variant: VariantName::try_from(variant).expect("variant"),
            destination: workspace.path(&format!("out/{variant}.aar")),
            ..workspace.request(primary.clone(), vec![lib.clone()])
        })
        .collect();

    let results = pipeline::run_all(requests, &workspace.path("scratch"), &BasicManifestMerger);

    let digests: Vec<String> = results
        .into_iter()
        .map(|result| result.expect("variant").sha256)
        .collect();
    assert_eq!(digests.len(), 2);
    assert_eq!(digests[0], digests[1]);
    assert!(workspace.path("scratch/debug").is_dir());
    assert!(workspace.path("scratch/release").is_dir());
}
