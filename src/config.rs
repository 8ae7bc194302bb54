//! Configuration file loader (`aar-fuse.toml`).
//!
//! One file describes every variant to fuse plus the shared relocation and
//! manifest settings:
//!
//! ```toml
//! scratch_dir = "build/aar-fuse"
//! report = true
//!
//! [relocation]
//! prefix = "shaded"
//!
//! [manifest]
//! min_sdk = 21
//!
//! [[variant]]
//! name = "release"
//! primary = "build/outputs/aar/app-release.aar"
//! secondaries = [{ path = "libs/core.aar" }, { path = "libs/okio.jar", kind = "jar" }]
//! ```
//!
//! Relative paths resolve against the directory holding the file.

use crate::artifact::{InputArtifact, InputKind};
use crate::error::{FuseError, Result, io_failure};
use crate::merge::manifest::ManifestSettings;
use crate::pipeline::FusionRequest;
use crate::relocation::{RelocationInput, RelocationRule};
use crate::variant::VariantName;
use camino::{Utf8Path, Utf8PathBuf};
use log::debug;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;

/// Conventional configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "aar-fuse.toml";

/// Parsed configuration file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FuseConfig {
    /// Root of the per-variant scratch directories.
    #[serde(default = "FuseConfig::default_scratch_dir")]
    pub scratch_dir: Utf8PathBuf,
    /// Write `<output>.report.json` next to every fused archive.
    pub report: bool,
    /// Relocation settings shared by every variant.
    pub relocation: RelocationConfig,
    /// Values forwarded to the manifest merger.
    pub manifest: ManifestSettings,
    /// Variants to fuse.
    #[serde(rename = "variant")]
    pub variants: Vec<VariantConfig>,
    #[serde(skip)]
    source: Utf8PathBuf,
}

impl Default for FuseConfig {
    fn default() -> Self {
        Self {
            scratch_dir: Self::default_scratch_dir(),
            report: false,
            relocation: RelocationConfig::default(),
            manifest: ManifestSettings::default(),
            variants: Vec::new(),
            source: Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        }
    }
}

/// `[relocation]`: a prefix or explicit rules, never both.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RelocationConfig {
    /// Prefix every package contributed by a secondary input.
    pub prefix: Option<String>,
    /// Explicit rules, first match wins.
    pub rules: Vec<RuleConfig>,
}

/// One `[[relocation.rules]]` entry.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Dotted source package.
    pub from: String,
    /// Dotted target package.
    pub to: String,
    /// Globs over internal class names (`com/lib/**`) the rule is limited to.
    #[serde(default)]
    pub include: Vec<String>,
    /// Globs over internal class names the rule never touches.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Whether subpackages of `from` move too.
    #[serde(default = "RuleConfig::default_subpackages")]
    pub subpackages: bool,
}

impl RuleConfig {
    const fn default_subpackages() -> bool {
        true
    }

    fn to_rule(&self) -> Result<RelocationRule> {
        let mut rule = RelocationRule::new(self.from.as_str(), self.to.as_str())?
            .with_subpackages(self.subpackages);
        for glob in &self.include {
            rule = rule.include(glob)?;
        }
        for glob in &self.exclude {
            rule = rule.exclude(glob)?;
        }
        Ok(rule)
    }
}

/// One `[[variant]]` table.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VariantConfig {
    /// Variant name; keys the scratch directory.
    pub name: String,
    /// The primary library package.
    pub primary: Utf8PathBuf,
    /// Destination; defaults to `primary`, replacing it.
    #[serde(default)]
    pub output: Option<Utf8PathBuf>,
    /// Dependencies in resolution order.
    #[serde(default)]
    pub secondaries: Vec<SecondaryConfig>,
}

/// One secondary input.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SecondaryConfig {
    /// Archive or directory.
    pub path: Utf8PathBuf,
    /// Layout; inferred from the path when absent.
    #[serde(default)]
    pub kind: Option<InputKind>,
    /// Identity in diagnostics; the file stem when absent.
    #[serde(default)]
    pub id: Option<String>,
}

impl FuseConfig {
    fn default_scratch_dir() -> Utf8PathBuf {
        Utf8PathBuf::from("build/aar-fuse")
    }

    /// Read and parse the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::IoFailure`] if the file cannot be read and
    /// [`FuseError::Config`] if it is not valid configuration.
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(io_failure(path))?;
        Self::parse(&text, path)
    }

    /// Parse `text` as if it had been read from `source`.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::Config`] for TOML or schema errors.
    pub fn parse(text: &str, source: &Utf8Path) -> Result<Self> {
        let mut config: Self = toml::from_str(text).map_err(|e| FuseError::Config {
            path: source.to_owned(),
            reason: e.to_string(),
        })?;
        config.source = source.to_owned();
        debug!("loaded {} variant(s) from {source}", config.variants.len());
        Ok(config)
    }

    /// Scratch root, resolved against the configuration directory.
    #[must_use]
    pub fn scratch_root(&self) -> Utf8PathBuf {
        self.resolve(&self.scratch_dir)
    }

    /// The relocation request shared by every variant.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::Config`] when both a prefix and rules are given,
    /// or when a rule is invalid.
    pub fn relocation_input(&self) -> Result<RelocationInput> {
        let input = match (&self.relocation.prefix, self.relocation.rules.as_slice()) {
            (Some(_), [_, ..]) => {
                return Err(self.invalid("[relocation] takes either `prefix` or `rules`, not both"));
            }
            (Some(prefix), []) => RelocationInput::Prefix(prefix.clone()),
            (None, []) => RelocationInput::None,
            (None, rules) => RelocationInput::Rules(
                rules
                    .iter()
                    .map(RuleConfig::to_rule)
                    .collect::<Result<Vec<_>>>()
                    .map_err(|e| self.invalid(e.to_string()))?,
            ),
        };
        input.validate().map_err(|e| self.invalid(e.to_string()))?;
        Ok(input)
    }

    /// One fusion request per `[[variant]]`, in file order.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::Config`] when no variant is declared, a variant
    /// name is invalid or repeated, two variants share an output, or the
    /// relocation settings are invalid.
    pub fn requests(&self) -> Result<Vec<FusionRequest>> {
        if self.variants.is_empty() {
            return Err(self.invalid("no [[variant]] tables"));
        }
        let relocation = self.relocation_input()?;
        let mut names = BTreeSet::new();
        let mut outputs = BTreeSet::new();
        let mut requests = Vec::with_capacity(self.variants.len());
        for variant in &self.variants {
            let name = VariantName::try_from(variant.name.as_str()).map_err(|e| self.invalid(e.to_string()))?;
            if !names.insert(name.clone()) {
                return Err(self.invalid(format!("variant {name} is declared twice")));
            }
            let primary = self.resolve(&variant.primary);
            let destination = variant
                .output
                .as_ref()
                .map_or_else(|| primary.clone(), |output| self.resolve(output));
            if !outputs.insert(destination.clone()) {
                return Err(self.invalid(format!(
                    "output {destination} is shared by more than one variant"
                )));
            }
            let secondaries = variant
                .secondaries
                .iter()
                .map(|secondary| self.input(secondary))
                .collect();
            requests.push(FusionRequest {
                variant: name,
                primary: InputArtifact::inferred(primary),
                secondaries,
                relocation: relocation.clone(),
                manifest: self.manifest.clone(),
                report: self
                    .report
                    .then(|| Utf8PathBuf::from(format!("{destination}.report.json"))),
                destination,
            });
        }
        Ok(requests)
    }

    fn input(&self, secondary: &SecondaryConfig) -> InputArtifact {
        let path = self.resolve(&secondary.path);
        let input = match secondary.kind {
            Some(kind) => InputArtifact::new(path, kind),
            None => InputArtifact::inferred(path),
        };
        match &secondary.id {
            Some(id) => input.with_id(id.as_str()),
            None => input,
        }
    }

    fn resolve(&self, path: &Utf8Path) -> Utf8PathBuf {
        if path.is_absolute() {
            return path.to_owned();
        }
        match self.source.parent().filter(|p| !p.as_str().is_empty()) {
            Some(base) => base.join(path),
            None => path.to_owned(),
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> FuseError {
        FuseError::Config {
            path: self.source.clone(),
            reason: reason.into(),
        }
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
    use rstest::rstest;

    const SOURCE: &str = "/work/app/aar-fuse.toml";

    fn parse(text: &str) -> Result<FuseConfig> {
        FuseConfig::parse(text, Utf8Path::new(SOURCE))
    }

    #[rstest]
    fn defaults_apply_when_omitted() {
        let config = parse("[[variant]]\nname = \"release\"\nprimary = \"app.aar\"\n").expect("parse");

        assert_eq!(config.scratch_root(), Utf8Path::new("/work/app/build/aar-fuse"));
        assert!(!config.report);
        assert_eq!(config.relocation_input().expect("relocation"), RelocationInput::None);
    }

    #[rstest]
    fn full_file_becomes_requests() {
        let config = parse(concat!(
            "report = true\n",
            "[relocation]\n",
            "prefix = \"shaded\"\n",
            "[manifest]\n",
            "min_sdk = 21\n",
            "[[variant]]\n",
            "name = \"release\"\n",
            "primary = \"out/app.aar\"\n",
            "output = \"/dist/app.aar\"\n",
            "secondaries = [{ path = \"libs/core.aar\" }, { path = \"libs/okio.jar\", id = \"okio\" }]\n",
        ))
        .expect("parse");
        let requests = config.requests().expect("requests");

        let request = &requests[0];
        assert_eq!(request.variant.as_str(), "release");
        assert_eq!(request.primary.path, Utf8Path::new("/work/app/out/app.aar"));
        assert_eq!(request.destination, Utf8Path::new("/dist/app.aar"));
        assert_eq!(request.report.as_deref(), Some(Utf8Path::new("/dist/app.aar.report.json")));
        assert_eq!(request.relocation, RelocationInput::Prefix("shaded".to_owned()));
        assert_eq!(request.manifest.min_sdk, Some(21));
        assert_eq!(request.secondaries[0].kind, InputKind::LibraryArchive);
        assert_eq!(request.secondaries[1].kind, InputKind::ClassesArchive);
        assert_eq!(request.secondaries[1].id.as_str(), "okio");
    }

    #[rstest]
    fn output_defaults_to_the_primary() {
        let config = parse("[[variant]]\nname = \"debug\"\nprimary = \"app.aar\"\n").expect("parse");
        let requests = config.requests().expect("requests");
        assert_eq!(requests[0].destination, Utf8Path::new("/work/app/app.aar"));
        assert_eq!(requests[0].report, None);
    }

    #[rstest]
    fn rules_carry_filters() {
        let config = parse(concat!(
            "[[relocation.rules]]\n",
            "from = \"com.lib\"\n",
            "to = \"shaded.com.lib\"\n",
            "exclude = [\"com/lib/api/**\"]\n",
            "subpackages = false\n",
        ))
        .expect("parse");
        let RelocationInput::Rules(rules) = config.relocation_input().expect("relocation") else {
            panic!("expected explicit rules");
        };
        assert!(!rules[0].includes_subpackages());
        assert!(!rules[0].accepts_class("com/lib/api/Client"));
        assert!(rules[0].accepts_class("com/lib/Core"));
    }

    #[rstest]
    #[case::prefix_and_rules(
        "[relocation]\nprefix = \"x\"\n[[relocation.rules]]\nfrom = \"a\"\nto = \"b\"\n[[variant]]\nname = \"r\"\nprimary = \"a.aar\"\n"
    )]
    #[case::no_variants("report = true\n")]
    #[case::shared_output(
        "[[variant]]\nname = \"a\"\nprimary = \"x.aar\"\n[[variant]]\nname = \"b\"\nprimary = \"x.aar\"\n"
    )]
    #[case::repeated_variant(
        "[[variant]]\nname = \"a\"\nprimary = \"x.aar\"\n[[variant]]\nname = \"a\"\nprimary = \"y.aar\"\n"
    )]
    #[case::bad_variant_name("[[variant]]\nname = \"../up\"\nprimary = \"x.aar\"\n")]
    #[case::cyclic_rules(
        "[[relocation.rules]]\nfrom = \"a\"\nto = \"b\"\n[[relocation.rules]]\nfrom = \"b\"\nto = \"c\"\n[[variant]]\nname = \"r\"\nprimary = \"a.aar\"\n"
    )]
    fn inconsistent_files_are_config_errors(#[case] text: &str) {
        let result = parse(text).and_then(|config| config.requests());
        assert!(matches!(result, Err(FuseError::Config { .. })), "{result:?}");
    }

    #[rstest]
    #[case::unknown_field("colour = \"blue\"\n")]
    #[case::wrong_type("report = \"yes\"\n")]
    #[case::unknown_kind("[[variant]]\nname = \"r\"\nprimary = \"a.aar\"\nsecondaries = [{ path = \"b\", kind = \"zip\" }]\n")]
    fn malformed_files_are_rejected(#[case] text: &str) {
        assert!(matches!(parse(text), Err(FuseError::Config { .. })));
    }

    #[test]
    fn missing_file_is_an_io_failure() {
        let result = FuseConfig::load(Utf8Path::new("/nonexistent/aar-fuse.toml"));
        assert!(matches!(result, Err(FuseError::IoFailure { .. })));
    }
}
