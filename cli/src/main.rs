//! `aar-fuse` entrypoint.
//!
//! Reads the fusion configuration, builds one request per selected variant
//! and runs the variant pipelines concurrently. Each fused archive is
//! reported on stderr; any failure makes the process exit non-zero.

mod cli;

use aar_fuse::config::FuseConfig;
use aar_fuse::error::{FuseError, Result};
use aar_fuse::merge::manifest::BasicManifestMerger;
use aar_fuse::pipeline::{self, FusionOutcome, FusionRequest};
use aar_fuse::PipelineError;
use clap::Parser;
use cli::Cli;
use log::debug;
use std::io::Write;

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);
    let mut stderr = std::io::stderr();
    let run_result = run(&cli, &mut stderr);
    let exit_code = exit_code_for_run_result(run_result, &mut stderr);
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

fn init_logging(cli: &Cli) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(cli.log_level()).parse_default_env();
    if builder.try_init().is_err() {
        // A logger is already installed.
    }
}

/// Number of variants that failed.
fn run(cli: &Cli, stderr: &mut dyn Write) -> Result<usize> {
    let config = FuseConfig::load(&cli.config)?;
    let requests = select_requests(cli, &config)?;
    let scratch_root = config.scratch_root();
    debug!("fusing {} variant(s) in {scratch_root}", requests.len());

    let results = pipeline::run_all(requests, &scratch_root, &BasicManifestMerger);
    let mut failures = 0;
    for result in results {
        match result {
            Ok(outcome) => report_outcome(&outcome, stderr),
            Err(err) => {
                failures += 1;
                report_failure(&err, stderr);
            }
        }
    }
    Ok(failures)
}

fn select_requests(cli: &Cli, config: &FuseConfig) -> Result<Vec<FusionRequest>> {
    let requests = config.requests()?;
    if let Some(unknown) = cli
        .variants
        .iter()
        .find(|name| !requests.iter().any(|r| r.variant.as_str() == name.as_str()))
    {
        return Err(FuseError::Config {
            path: cli.config.clone(),
            reason: format!("no variant named `{unknown}`"),
        });
    }
    Ok(requests
        .into_iter()
        .filter(|request| cli.selects(request.variant.as_str()))
        .collect())
}

fn report_outcome(outcome: &FusionOutcome, stderr: &mut dyn Write) {
    let report = &outcome.report;
    write_stderr_line(
        stderr,
        format!(
            "{}: wrote {} ({} entries, {} relocated, sha256 {})",
            report.variant,
            outcome.destination,
            outcome.entries,
            report.relocated.len(),
            outcome.sha256
        ),
    );
    for skipped in &report.skipped {
        write_stderr_line(
            stderr,
            format!(
                "  skipped {} {} from {}: {}",
                skipped.category, skipped.name, skipped.artifact, skipped.reason
            ),
        );
    }
}

fn report_failure(err: &PipelineError, stderr: &mut dyn Write) {
    write_stderr_line(stderr, format!("error: {err}"));
}

fn exit_code_for_run_result(result: Result<usize>, stderr: &mut dyn Write) -> i32 {
    match result {
        Ok(0) => 0,
        Ok(failures) => {
            write_stderr_line(stderr, format!("{failures} variant(s) failed"));
            1
        }
        Err(err) => {
            write_stderr_line(stderr, format!("error: {err}"));
            2
        }
    }
}

fn write_stderr_line(stderr: &mut dyn Write, message: impl std::fmt::Display) {
    if writeln!(stderr, "{message}").is_err() {
        // Best-effort output; ignore write failures.
    }
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests fail loudly on broken fixtures")]
mod tests {
    use super::*;
    use aar_fuse::testing::{AarBuilder, ClassFileBuilder, read_classes};
    use camino::{Utf8Path, Utf8PathBuf};
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    struct Project {
        _dir: TempDir,
        root: Utf8PathBuf,
    }

    impl Project {
        fn config(&self) -> Utf8PathBuf {
            self.root.join("aar-fuse.toml")
        }

        fn cli(&self, variants: &[&str]) -> Cli {
            let mut args = vec![
                "aar-fuse".to_owned(),
                "--config".to_owned(),
                self.config().to_string(),
            ];
            for variant in variants {
                args.push("--variant".to_owned());
                args.push((*variant).to_owned());
            }
            Cli::parse_from(args)
        }
    }

    fn write_fixture(root: &Utf8Path) {
        AarBuilder::new("com.app")
            .class(ClassFileBuilder::new("com/app/Main").class_ref("com/lib/Util").build())
            .write(&root.join("app.aar"))
            .expect("write primary");
        AarBuilder::new("com.lib")
            .class(ClassFileBuilder::new("com/lib/Util").build())
            .write(&root.join("lib.aar"))
            .expect("write secondary");
        std::fs::write(
            root.join("aar-fuse.toml"),
            concat!(
                "scratch_dir = \"scratch\"\n",
                "[relocation]\nprefix = \"shaded\"\n",
                "[[variant]]\nname = \"debug\"\nprimary = \"app.aar\"\n",
                "output = \"out/debug.aar\"\n",
                "secondaries = [{ path = \"lib.aar\" }]\n",
                "[[variant]]\nname = \"release\"\nprimary = \"app.aar\"\n",
                "output = \"out/release.aar\"\n",
                "secondaries = [{ path = \"lib.aar\" }]\n",
            ),
        )
        .expect("write config");
    }

    #[fixture]
    fn project() -> Project {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
        write_fixture(&root);
        Project { _dir: dir, root }
    }

    #[test]
    fn exit_code_is_zero_when_every_variant_succeeds() {
        let mut stderr = Vec::new();
        assert_eq!(exit_code_for_run_result(Ok(0), &mut stderr), 0);
        assert!(stderr.is_empty());
    }

    #[test]
    fn exit_code_reports_failed_variants() {
        let mut stderr = Vec::new();
        assert_eq!(exit_code_for_run_result(Ok(2), &mut stderr), 1);
        let text = String::from_utf8(stderr).expect("stderr was not UTF-8");
        assert!(text.contains("2 variant(s) failed"));
    }

    #[test]
    fn exit_code_reports_configuration_errors() {
        let err = FuseError::Config {
            path: Utf8PathBuf::from("aar-fuse.toml"),
            reason: "no variants".to_owned(),
        };
        let mut stderr = Vec::new();
        assert_eq!(exit_code_for_run_result(Err(err), &mut stderr), 2);
        let text = String::from_utf8(stderr).expect("stderr was not UTF-8");
        assert!(text.contains("invalid configuration aar-fuse.toml: no variants"));
    }

    #[rstest]
    fn run_fuses_every_variant(project: Project) {
        let mut stderr = Vec::new();
        let failures = run(&project.cli(&[]), &mut stderr).expect("run");
        assert_eq!(failures, 0);

        for variant in ["debug", "release"] {
            let output = project.root.join(format!("out/{variant}.aar"));
            let classes = read_classes(&output).expect("classes");
            assert!(classes.contains_key("com/app/Main.class"));
            assert!(classes.contains_key("shaded/com/lib/Util.class"));
        }
        let text = String::from_utf8(stderr).expect("stderr was not UTF-8");
        assert!(text.contains("debug: wrote"));
        assert!(text.contains("release: wrote"));
    }

    #[rstest]
    fn variant_filter_limits_the_run(project: Project) {
        let mut stderr = Vec::new();
        run(&project.cli(&["release"]), &mut stderr).expect("run");
        assert!(project.root.join("out/release.aar").exists());
        assert!(!project.root.join("out/debug.aar").exists());
    }

    #[rstest]
    fn unknown_variant_is_a_configuration_error(project: Project) {
        let mut stderr = Vec::new();
        let err = run(&project.cli(&["staging"]), &mut stderr).expect_err("unknown variant");
        assert!(matches!(err, FuseError::Config { .. }));
    }

    #[rstest]
    fn failing_variant_is_counted(project: Project) {
        std::fs::write(project.root.join("lib.aar"), b"not an archive").expect("corrupt secondary");
        let mut stderr = Vec::new();
        let failures = run(&project.cli(&["debug"]), &mut stderr).expect("run");
        assert_eq!(failures, 1);
        let text = String::from_utf8(stderr).expect("stderr was not UTF-8");
        assert!(text.contains("variant debug failed during extract"));
    }
}
