//! Symbol relocation across every encoding of a name.
//!
//! A [`RelocationSpec`] holds ordered package rules and the generated
//! accessor rules. [`SymbolTable::build`] turns it into one read-only rename
//! map, and [`apply`] pushes that map through class files, the manifest,
//! interface files, rule and service files, and language metadata. Nothing
//! in the [`WorkingTree`] changes until every carrier has been rewritten.

pub mod class_file;
pub mod kotlin_module;
pub(crate) mod mutf8;
pub(crate) mod signature;
pub mod symbols;
pub(crate) mod text;

use crate::archive::EntryMap;
use crate::artifact::ArtifactId;
use crate::artifact::layout::{METADATA_EXTENSION, is_relocatable_class};
use crate::artifact::manifest::ManifestDescriptor;
use crate::error::{FuseError, Result};
use crate::merge::{WorkingTree, classes_from, compiled_key, package_of};
use crate::report::FusionReport;
use glob::{MatchOptions, Pattern};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use symbols::{SymbolTable, dotted, interface_type, internal};
use text::Scope;

const SERVICES_DIR: &str = "META-INF/services/";

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Moves one package (and by default its subpackages) under a new name.
#[derive(Debug, Clone, PartialEq)]
pub struct RelocationRule {
    from: String,
    to: String,
    include_subpackages: bool,
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
}

impl RelocationRule {
    /// Relocate dotted package `from` (and its subpackages) to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::InvalidRelocationRule`] when either side is not a
    /// dotted package name or both are the same.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Result<Self> {
        let rule = Self {
            from: from.into(),
            to: to.into(),
            include_subpackages: true,
            includes: Vec::new(),
            excludes: Vec::new(),
        };
        for (side, name) in [("source", &rule.from), ("target", &rule.to)] {
            if let Err(reason) = check_package_name(name) {
                return Err(rule.invalid(format!("{side} {reason}")));
            }
        }
        if rule.from == rule.to {
            return Err(rule.invalid("source and target are the same package".to_owned()));
        }
        Ok(rule)
    }

    /// Restrict the rule to the `from` package itself.
    #[must_use]
    pub const fn exact(self) -> Self {
        self.with_subpackages(false)
    }

    /// Choose whether subpackages of `from` move with it.
    #[must_use]
    pub const fn with_subpackages(mut self, include: bool) -> Self {
        self.include_subpackages = include;
        self
    }

    /// Only relocate classes whose internal name matches `glob`.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::InvalidRelocationRule`] for malformed globs.
    pub fn include(mut self, glob: &str) -> Result<Self> {
        let pattern = self.pattern(glob)?;
        self.includes.push(pattern);
        Ok(self)
    }

    /// Never relocate classes whose internal name matches `glob`.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::InvalidRelocationRule`] for malformed globs.
    pub fn exclude(mut self, glob: &str) -> Result<Self> {
        let pattern = self.pattern(glob)?;
        self.excludes.push(pattern);
        Ok(self)
    }

    /// Source package, dotted.
    #[must_use]
    pub fn from(&self) -> &str {
        &self.from
    }

    /// Target package, dotted.
    #[must_use]
    pub fn to(&self) -> &str {
        &self.to
    }

    /// Whether subpackages of [`from`](Self::from) are relocated too.
    #[must_use]
    pub const fn includes_subpackages(&self) -> bool {
        self.include_subpackages
    }

    /// New name of dotted `package`, if this rule moves it.
    ///
    /// When the target lies inside the source, packages already under the
    /// target are never moved again.
    #[must_use]
    pub fn relocate_package(&self, package: &str) -> Option<String> {
        if is_under(&self.to, &self.from) && is_under(package, &self.to) {
            return None;
        }
        if package == self.from {
            return Some(self.to.clone());
        }
        let rest = package.strip_prefix(&self.from)?.strip_prefix('.')?;
        self.include_subpackages.then(|| format!("{}.{rest}", self.to))
    }

    /// Whether the class filters accept internal class name `class`.
    #[must_use]
    pub fn accepts_class(&self, class: &str) -> bool {
        let included = self.includes.is_empty()
            || self.includes.iter().any(|p| p.matches_with(class, GLOB_OPTIONS));
        included && !self.excludes.iter().any(|p| p.matches_with(class, GLOB_OPTIONS))
    }

    /// Whether the rule has class filters, so it may split a package.
    #[must_use]
    pub fn is_filtered(&self) -> bool {
        !self.includes.is_empty() || !self.excludes.is_empty()
    }

    fn pattern(&self, glob: &str) -> Result<Pattern> {
        Pattern::new(glob).map_err(|e| self.invalid(format!("bad class filter {glob:?}: {e}")))
    }

    fn invalid(&self, reason: String) -> FuseError {
        FuseError::InvalidRelocationRule {
            rule: self.to_string(),
            reason,
        }
    }

    /// Whether a name this rule produces could be matched by `other`.
    fn feeds(&self, other: &Self) -> bool {
        self.to == other.from
            || (other.include_subpackages && is_under(&self.to, &other.from))
            || (self.include_subpackages && is_under(&other.from, &self.to))
    }
}

impl fmt::Display for RelocationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Moves the generated accessors (`R`, `R$*`) of one namespace into another.
///
/// Accessor bodies are never rewritten; only their location and references
/// to them elsewhere change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessorRule {
    from_namespace: String,
    to_namespace: String,
}

impl AccessorRule {
    /// Move the accessors of `from_namespace` into `to_namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::InvalidRelocationRule`] for invalid or identical
    /// namespaces.
    pub fn new(from_namespace: impl Into<String>, to_namespace: impl Into<String>) -> Result<Self> {
        let rule = Self {
            from_namespace: from_namespace.into(),
            to_namespace: to_namespace.into(),
        };
        let invalid = |reason: String| FuseError::InvalidRelocationRule {
            rule: format!("accessors {} -> {}", rule.from_namespace, rule.to_namespace),
            reason,
        };
        check_package_name(&rule.from_namespace).map_err(|r| invalid(format!("source {r}")))?;
        check_package_name(&rule.to_namespace).map_err(|r| invalid(format!("target {r}")))?;
        if rule.from_namespace == rule.to_namespace {
            return Err(invalid("source and target are the same namespace".to_owned()));
        }
        Ok(rule)
    }

    /// Namespace the accessors are generated in.
    #[must_use]
    pub fn from_namespace(&self) -> &str {
        &self.from_namespace
    }

    /// Namespace the accessors move to.
    #[must_use]
    pub fn to_namespace(&self) -> &str {
        &self.to_namespace
    }
}

/// Ordered, cycle-free relocation rules plus accessor rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelocationSpec {
    rules: Vec<RelocationRule>,
    accessors: Vec<AccessorRule>,
}

impl RelocationSpec {
    /// Validate and assemble a spec.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::RelocationCycle`] when a rule's target falls
    /// under the source of any other rule, in either order, or the other
    /// way round. A second pass over relocated output would otherwise move
    /// the same symbol again.
    pub fn new(rules: Vec<RelocationRule>, accessors: Vec<AccessorRule>) -> Result<Self> {
        for (index, rule) in rules.iter().enumerate() {
            let fed = rules
                .iter()
                .enumerate()
                .find(|(position, other)| *position != index && rule.feeds(other));
            if let Some((_, other)) = fed {
                return Err(FuseError::RelocationCycle {
                    from: rule.from.clone(),
                    to: rule.to.clone(),
                    other: other.from.clone(),
                });
            }
        }
        for accessor in &accessors {
            let fed = accessors
                .iter()
                .find(|other| other.from_namespace == accessor.to_namespace);
            if let Some(other) = fed {
                return Err(FuseError::RelocationCycle {
                    from: accessor.from_namespace.clone(),
                    to: accessor.to_namespace.clone(),
                    other: other.from_namespace.clone(),
                });
            }
        }
        Ok(Self { rules, accessors })
    }

    /// A spec that renames nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Package rules in evaluation order.
    #[must_use]
    pub fn rules(&self) -> &[RelocationRule] {
        &self.rules
    }

    /// Accessor rules.
    #[must_use]
    pub fn accessors(&self) -> &[AccessorRule] {
        &self.accessors
    }

    /// Whether the spec has no rules of either kind.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.accessors.is_empty()
    }
}

/// How the caller asked for relocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RelocationInput {
    /// Only generated accessors move.
    #[default]
    None,
    /// Every package contributed by a secondary input moves under the prefix.
    Prefix(String),
    /// Explicit rules, evaluated in order.
    Rules(Vec<RelocationRule>),
}

impl RelocationInput {
    /// Check what can be checked before any input is read.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::InvalidRelocationRule`] for a malformed prefix
    /// and [`FuseError::RelocationCycle`] for cyclic explicit rules.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::None => Ok(()),
            Self::Prefix(prefix) => {
                check_package_name(prefix).map_err(|reason| FuseError::InvalidRelocationRule {
                    rule: format!("prefix {prefix}"),
                    reason,
                })
            }
            Self::Rules(rules) => RelocationSpec::new(rules.clone(), Vec::new()).map(drop),
        }
    }

    /// Turn the request into a spec for `tree`.
    ///
    /// Accessor rules are synthesised for every secondary namespace that
    /// differs from the fused package's namespace. With a prefix, one exact
    /// rule is synthesised per package contributed by a secondary; packages
    /// shared with the primary input or in the default package stay put and
    /// are reported as skipped.
    ///
    /// # Errors
    ///
    /// Propagates rule validation errors.
    pub fn resolve(&self, tree: &mut WorkingTree) -> Result<RelocationSpec> {
        let accessors = accessor_rules(tree)?;
        let rules = match self {
            Self::None => Vec::new(),
            Self::Prefix(prefix) => prefix_rules(tree, prefix)?,
            Self::Rules(rules) => rules.clone(),
        };
        let spec = RelocationSpec::new(rules, accessors)?;
        info!(
            "relocation: {} package rules, {} accessor rules",
            spec.rules.len(),
            spec.accessors.len()
        );
        Ok(spec)
    }
}

fn accessor_rules(tree: &WorkingTree) -> Result<Vec<AccessorRule>> {
    let Some(primary) = tree.primary_namespace() else {
        return Ok(Vec::new());
    };
    let mut seen = BTreeSet::new();
    let mut rules = Vec::new();
    for origin in tree.origins.iter().filter(|o| !o.primary) {
        let Some(namespace) = origin.namespace.as_deref() else {
            continue;
        };
        if namespace != primary && seen.insert(namespace) {
            rules.push(AccessorRule::new(namespace, primary)?);
        }
    }
    Ok(rules)
}

fn prefix_rules(tree: &mut WorkingTree, prefix: &str) -> Result<Vec<RelocationRule>> {
    let mut primary_packages = BTreeSet::new();
    let mut secondary_packages: BTreeMap<String, ArtifactId> = BTreeMap::new();
    for origin in &tree.origins {
        for package in packages_from(tree, &origin.id) {
            if origin.primary {
                primary_packages.insert(package);
            } else {
                secondary_packages.entry(package).or_insert_with(|| origin.id.clone());
            }
        }
    }

    let mut rules = Vec::new();
    for (internal_package, id) in secondary_packages {
        let package = dotted(&internal_package);
        if package.is_empty() {
            warn!("{id}: classes in the default package cannot be relocated");
            tree.report.skip("package", "<default>", &id, "default package cannot be relocated");
        } else if primary_packages.contains(&internal_package) {
            warn!("{id}: package {package} is shared with the primary input; not relocated");
            tree.report.skip("package", package, &id, "shared with the primary input");
        } else if is_under(&package, prefix) {
            debug!("{id}: package {package} is already under {prefix}");
        } else {
            let target = format!("{prefix}.{package}");
            rules.push(RelocationRule::new(package, target)?.exact());
        }
    }
    Ok(rules)
}

/// Internal packages of every class and interface type contributed by `id`.
fn packages_from(tree: &WorkingTree, id: &ArtifactId) -> BTreeSet<String> {
    let classes = classes_from(tree, id).map(package_of);
    let interfaces = tree
        .interface_files
        .keys()
        .filter(|path| tree.provenance(path) == Some(id))
        .filter_map(|path| interface_type(path))
        .map(package_of);
    classes.chain(interfaces).map(str::to_owned).collect()
}

/// Rewrite every carrier in `tree` through `table`.
///
/// Classes come first and language metadata last; the tree is only updated
/// once every carrier has been rewritten, so a failure leaves it untouched.
///
/// # Errors
///
/// Propagates [`FuseError::UnsupportedClassVersion`],
/// [`FuseError::MalformedClass`], [`FuseError::MalformedManifest`] and
/// [`FuseError::MetadataFormatUnsupported`] from the individual rewriters.
pub fn apply(tree: &mut WorkingTree, table: &SymbolTable) -> Result<()> {
    if table.is_empty() {
        debug!("relocation: nothing to rename");
        return Ok(());
    }
    let mut pass = Pass::new(tree);
    pass.classes(table)?;
    let relocated_manifest = text::rewrite(tree.manifest.as_str(), table, Scope::KnownClasses)
        .map(|text| ManifestDescriptor::parse(text, "relocated manifest"))
        .transpose()?;
    pass.resources(table);
    pass.interface_files(table);
    let relocated_rules = text::rewrite(&tree.rules, table, Scope::Source);
    pass.java_resources(table)?;
    pass.metadata(table)?;

    let Pass {
        class_files,
        java_resources,
        language_metadata,
        resource_files,
        interface_files,
        provenance,
        report,
        moved,
        ..
    } = pass;
    tree.class_files = class_files;
    tree.java_resources = java_resources;
    tree.language_metadata = language_metadata;
    tree.resource_files = resource_files;
    tree.interface_files = interface_files;
    tree.provenance = provenance;
    tree.report = report;
    if let Some(manifest) = relocated_manifest {
        tree.manifest = manifest;
    }
    if let Some(rules) = relocated_rules {
        tree.rules = rules;
    }
    info!("relocation: moved {moved} classes");
    Ok(())
}

/// Rewritten copies of the tree's collections, committed by [`apply`].
struct Pass<'t> {
    tree: &'t WorkingTree,
    class_files: EntryMap,
    java_resources: EntryMap,
    language_metadata: EntryMap,
    resource_files: EntryMap,
    interface_files: EntryMap,
    provenance: BTreeMap<String, ArtifactId>,
    report: FusionReport,
    moved: usize,
}

impl<'t> Pass<'t> {
    fn new(tree: &'t WorkingTree) -> Self {
        Self {
            tree,
            class_files: EntryMap::new(),
            java_resources: EntryMap::new(),
            language_metadata: EntryMap::new(),
            resource_files: EntryMap::new(),
            interface_files: EntryMap::new(),
            provenance: tree.provenance.clone(),
            report: tree.report.clone(),
            moved: 0,
        }
    }

    fn rekey(&mut self, from: &str, to: &str) {
        if from != to {
            if let Some(id) = self.provenance.remove(from) {
                self.provenance.insert(to.to_owned(), id);
            }
        }
    }

    fn classes(&mut self, table: &SymbolTable) -> Result<()> {
        let tree = self.tree;
        for (path, bytes) in &tree.class_files {
            let Some(name) = path.strip_suffix(".class").filter(|_| is_relocatable_class(path)) else {
                self.class_files.insert(path.clone(), bytes.clone());
                continue;
            };
            if table.is_accessor(name) {
                self.move_accessor(path, name, bytes, table);
                continue;
            }
            let (target, content) = if table.is_accessor_target(name) {
                (path.clone(), bytes.clone())
            } else {
                let rewritten = class_file::rewrite(path, bytes, table)?;
                let target = table
                    .map_known_class(name)
                    .map_or_else(|| path.clone(), |to| format!("{to}.class"));
                (target, rewritten.unwrap_or_else(|| bytes.clone()))
            };
            if self.class_files.contains_key(&target) {
                return Err(FuseError::ClassCollision {
                    name: dotted(target.strip_suffix(".class").unwrap_or(&target)),
                    first: self.source_of(&compiled_key(&target)),
                    second: self.source_of(&compiled_key(path)),
                });
            }
            if &target != path {
                self.moved += 1;
                self.report.relocated.insert(dotted(name), dotted(internal_name_of(&target)));
            }
            self.rekey(&compiled_key(path), &compiled_key(&target));
            self.class_files.insert(target, content);
        }
        Ok(())
    }

    /// Accessors keep their bytes; a copy whose destination is taken is
    /// dropped.
    fn move_accessor(&mut self, path: &str, name: &str, bytes: &[u8], table: &SymbolTable) {
        let Some(to) = table.map_known_class(name) else {
            return;
        };
        let target = format!("{to}.class");
        let key = compiled_key(path);
        if self.tree.class_files.contains_key(&target) || self.class_files.contains_key(&target) {
            let id = self.source_of(&key);
            debug!("{id}: accessor {name} dropped; {to} already exists");
            self.report
                .skip("accessor", dotted(name), &id, format!("{} already exists", dotted(&to)));
            self.provenance.remove(&key);
            return;
        }
        self.moved += 1;
        self.report.relocated.insert(dotted(name), dotted(&to));
        self.rekey(&key, &compiled_key(&target));
        self.class_files.insert(target, bytes.to_vec());
    }

    /// Class names in XML resources (custom views, fragments).
    fn resources(&mut self, table: &SymbolTable) {
        for (path, bytes) in &self.tree.resource_files {
            let rewritten = path
                .ends_with(".xml")
                .then(|| std::str::from_utf8(bytes).ok())
                .flatten()
                .and_then(|text| text::rewrite(text, table, Scope::KnownClasses));
            let content = rewritten.map_or_else(|| bytes.clone(), String::into_bytes);
            self.resource_files.insert(path.clone(), content);
        }
    }

    /// Moves each interface file to the path of its relocated type and
    /// rewrites the names inside it.
    fn interface_files(&mut self, table: &SymbolTable) {
        let tree = self.tree;
        for (path, bytes) in &tree.interface_files {
            let target = interface_type(path)
                .and_then(|name| table.map_known_class(name))
                .map_or_else(|| path.clone(), |to| format!("aidl/{to}.aidl"));
            let content = std::str::from_utf8(bytes)
                .ok()
                .and_then(|text| text::rewrite(text, table, Scope::Source))
                .map_or_else(|| bytes.clone(), String::into_bytes);
            self.rekey(path, &target);
            self.interface_files.insert(target, content);
        }
    }

    /// Service registrations are renamed and rewritten; `package-info`
    /// classes follow their package.
    fn java_resources(&mut self, table: &SymbolTable) -> Result<()> {
        let tree = self.tree;
        for (path, bytes) in &tree.java_resources {
            let (target, content) = if let Some(service) = path.strip_prefix(SERVICES_DIR) {
                relocate_service(service, bytes, table)
            } else if is_package_info(path) {
                let target = table
                    .map_package(package_of(path))
                    .map_or_else(|| path.clone(), |to| format!("{to}/package-info.class"));
                let rewritten = class_file::rewrite(path, bytes, table)?;
                (target, rewritten.unwrap_or_else(|| bytes.clone()))
            } else {
                (path.clone(), bytes.clone())
            };
            self.rekey(&compiled_key(path), &compiled_key(&target));
            match self.java_resources.get_mut(&target) {
                Some(existing) if target.starts_with(SERVICES_DIR) => {
                    union_lines(existing, &content);
                }
                Some(_) => {
                    warn!("java resource {path} relocated onto an existing {target}; keeping the first");
                }
                None => {
                    self.java_resources.insert(target, content);
                }
            }
        }
        Ok(())
    }

    fn metadata(&mut self, table: &SymbolTable) -> Result<()> {
        let tree = self.tree;
        for (path, bytes) in &tree.language_metadata {
            let content = if path.ends_with(METADATA_EXTENSION) {
                kotlin_module::rewrite(path, bytes, table)?.unwrap_or_else(|| bytes.clone())
            } else {
                bytes.clone()
            };
            self.language_metadata.insert(path.clone(), content);
        }
        Ok(())
    }

    fn source_of(&self, key: &str) -> ArtifactId {
        self.provenance
            .get(key)
            .cloned()
            .unwrap_or_else(|| ArtifactId::from("unknown"))
    }
}

fn internal_name_of(path: &str) -> &str {
    path.strip_suffix(".class").unwrap_or(path)
}

fn is_package_info(path: &str) -> bool {
    !path.starts_with("META-INF/") && path.ends_with("/package-info.class")
}

/// `META-INF/services/<type>`: the file name is a dotted type name and each
/// line names an implementation.
fn relocate_service(service: &str, bytes: &[u8], table: &SymbolTable) -> (String, Vec<u8>) {
    let renamed = table
        .map_class(&internal(service))
        .map_or_else(|| service.to_owned(), |to| dotted(&to));
    let content = std::str::from_utf8(bytes)
        .ok()
        .and_then(|text| text::rewrite(text, table, Scope::Source))
        .map_or_else(|| bytes.to_vec(), String::into_bytes);
    (format!("{SERVICES_DIR}{renamed}"), content)
}

fn union_lines(existing: &mut Vec<u8>, addition: &[u8]) {
    let present: BTreeSet<Vec<u8>> = existing
        .split(|b| *b == b'\n')
        .map(<[u8]>::to_vec)
        .collect();
    for line in addition.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
        if !present.contains(line) {
            if !existing.is_empty() && !existing.ends_with(b"\n") {
                existing.push(b'\n');
            }
            existing.extend_from_slice(line);
            existing.push(b'\n');
        }
    }
}

/// `name` equals `prefix` or lies beneath it, in dotted form.
fn is_under(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

/// Dotted Java package name: non-empty identifier segments.
fn check_package_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("is empty".to_owned());
    }
    let valid_segment = |segment: &str| {
        segment
            .chars()
            .next()
            .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$')
            && segment.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '$')
    };
    if name.split('.').all(valid_segment) {
        Ok(())
    } else {
        Err(format!("{name:?} is not a dotted package name"))
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
    use crate::testing::{ClassFileBuilder, tree_with_classes, tree_with_class_files};
    use rstest::rstest;

    fn rule(from: &str, to: &str) -> RelocationRule {
        RelocationRule::new(from, to).expect("valid rule")
    }

    #[rstest]
    #[case::empty("", "x")]
    #[case::same("com.lib", "com.lib")]
    #[case::slash("com/lib", "x")]
    #[case::trailing_dot("com.lib.", "x")]
    #[case::digit_segment("com.1lib", "x")]
    fn malformed_rules_are_rejected(#[case] from: &str, #[case] to: &str) {
        assert!(matches!(
            RelocationRule::new(from, to),
            Err(FuseError::InvalidRelocationRule { .. })
        ));
    }

    #[rstest]
    #[case::itself("com.lib", Some("shaded.com.lib"))]
    #[case::subpackage("com.lib.io", Some("shaded.com.lib.io"))]
    #[case::sibling("com.library", None)]
    #[case::parent("com", None)]
    fn relocate_package_matches_whole_segments(#[case] package: &str, #[case] expected: Option<&str>) {
        assert_eq!(rule("com.lib", "shaded.com.lib").relocate_package(package).as_deref(), expected);
    }

    #[rstest]
    #[case::itself("com.lib.sub", Some("com.lib"))]
    #[case::subpackage("com.lib.sub.io", Some("com.lib.io"))]
    #[case::target("com.lib", None)]
    fn rules_may_move_a_package_into_its_parent(
        #[case] package: &str,
        #[case] expected: Option<&str>,
    ) {
        let upward = rule("com.lib.sub", "com.lib");
        assert_eq!(upward.relocate_package(package).as_deref(), expected);
    }

    #[test]
    fn exact_rules_leave_subpackages() {
        let exact = rule("com.lib", "shaded.com.lib").exact();
        assert_eq!(exact.relocate_package("com.lib.io"), None);
        assert!(!exact.includes_subpackages());
    }

    #[test]
    fn target_inside_source_is_not_moved_again() {
        let nested = rule("com.lib", "com.lib.internal");
        assert_eq!(nested.relocate_package("com.lib.internal.io"), None);
        assert_eq!(nested.relocate_package("com.lib.io").as_deref(), Some("com.lib.internal.io"));
    }

    #[test]
    fn class_filters_use_internal_paths() {
        let filtered = rule("com.lib", "x")
            .include("com/lib/**")
            .expect("glob")
            .exclude("com/lib/internal/*")
            .expect("glob");
        assert!(filtered.accepts_class("com/lib/A"));
        assert!(filtered.accepts_class("com/lib/io/B"));
        assert!(!filtered.accepts_class("com/lib/internal/C"));
        assert!(filtered.is_filtered());
    }

    #[test]
    fn bad_globs_are_rejected() {
        assert!(matches!(
            rule("com.lib", "x").include("com/[lib"),
            Err(FuseError::InvalidRelocationRule { .. })
        ));
    }

    #[rstest]
    #[case::direct(vec![rule("a", "b"), rule("b", "c")])]
    #[case::into_subpackage(vec![rule("a", "b.x"), rule("b", "c")])]
    #[case::covers_later(vec![rule("a", "b"), rule("b.x", "c")])]
    #[case::reversed(vec![rule("b", "c"), rule("a", "b")])]
    #[case::reversed_into_subpackage(vec![rule("b", "c"), rule("a", "b.x")])]
    fn chained_rules_are_cycles(#[case] rules: Vec<RelocationRule>) {
        assert!(matches!(
            RelocationSpec::new(rules, Vec::new()),
            Err(FuseError::RelocationCycle { .. })
        ));
    }

    #[rstest]
    #[case::siblings(vec![rule("com.lib.io", "moved.io"), rule("com.lib", "shaded.lib")])]
    #[case::exact_parent(vec![rule("a", "b").exact(), rule("b.x", "c")])]
    fn independent_rules_are_accepted(#[case] rules: Vec<RelocationRule>) {
        assert!(RelocationSpec::new(rules, Vec::new()).is_ok());
    }

    #[test]
    fn chained_accessors_are_cycles() {
        let accessors = vec![
            AccessorRule::new("com.a", "com.b").expect("accessor"),
            AccessorRule::new("com.b", "com.c").expect("accessor"),
        ];
        assert!(matches!(
            RelocationSpec::new(Vec::new(), accessors),
            Err(FuseError::RelocationCycle { .. })
        ));
    }

    #[test]
    fn validate_rejects_a_malformed_prefix() {
        let input = RelocationInput::Prefix("shaded..x".to_owned());
        assert!(matches!(input.validate(), Err(FuseError::InvalidRelocationRule { .. })));
    }

    #[test]
    fn validate_rejects_cyclic_rules() {
        let input = RelocationInput::Rules(vec![rule("a", "b"), rule("b", "c")]);
        assert!(matches!(input.validate(), Err(FuseError::RelocationCycle { .. })));
    }

    #[test]
    fn prefix_skips_packages_shared_with_the_primary() {
        let mut tree = tree_with_classes(&[
            ("app", &["com/app/Main", "com/shared/P"]),
            ("lib", &["com/lib/A", "com/shared/S", "shaded/com/old/O"]),
        ]);
        let spec = RelocationInput::Prefix("shaded".to_owned())
            .resolve(&mut tree)
            .expect("spec");

        let rules: Vec<String> = spec.rules().iter().map(ToString::to_string).collect();
        assert_eq!(rules, ["com.lib -> shaded.com.lib"]);
        assert_eq!(spec.accessors().len(), 1);
        assert_eq!(spec.accessors()[0].from_namespace(), "com.lib");
        assert_eq!(spec.accessors()[0].to_namespace(), "com.app");
        assert!(tree.report().skipped.iter().any(|s| s.name == "com.shared"));
    }

    fn relocated_tree() -> WorkingTree {
        let mut tree = tree_with_class_files(
            &[
                (
                    "app",
                    vec![
                        ClassFileBuilder::new("com/app/Main").class_ref("com/lib/A").build(),
                    ],
                ),
                (
                    "lib",
                    vec![
                        ClassFileBuilder::new("com/lib/A").class_ref("com/lib/R$string").build(),
                        ClassFileBuilder::new("com/lib/R$string").class_ref("com/lib/R").build(),
                    ],
                ),
            ],
        );
        tree.interface_files.insert(
            "aidl/com/lib/IThing.aidl".to_owned(),
            b"package com.lib;\ninterface IThing { com.lib.A get(); }\n".to_vec(),
        );
        tree.provenance
            .insert("aidl/com/lib/IThing.aidl".to_owned(), ArtifactId::from("lib"));
        tree.rules = "-keep class com.lib.** { *; }\n".to_owned();
        tree
    }

    fn relocate(tree: &mut WorkingTree) {
        let spec = RelocationInput::Prefix("shaded".to_owned())
            .resolve(tree)
            .expect("spec");
        let table = SymbolTable::build(&spec, tree).expect("table");
        apply(tree, &table).expect("apply");
    }

    #[test]
    fn apply_moves_every_carrier() {
        let mut tree = relocated_tree();
        relocate(&mut tree);

        let classes: Vec<&str> = tree.class_files().keys().map(String::as_str).collect();
        assert_eq!(
            classes,
            ["com/app/Main.class", "com/app/R$string.class", "shaded/com/lib/A.class"]
        );
        assert!(tree.interface_files().contains_key("aidl/shaded/com/lib/IThing.aidl"));
        let aidl = String::from_utf8(tree.interface_files()["aidl/shaded/com/lib/IThing.aidl"].clone())
            .expect("utf8");
        assert!(aidl.contains("package shaded.com.lib;"));
        assert!(aidl.contains("shaded.com.lib.A get()"));
        assert!(tree.rules().contains("shaded.com.lib.**"));
        assert_eq!(
            tree.provenance(&compiled_key("shaded/com/lib/A.class")).map(ArtifactId::as_str),
            Some("lib")
        );
        assert_eq!(
            tree.report().relocated.get("com.lib.A").map(String::as_str),
            Some("shaded.com.lib.A")
        );
    }

    #[test]
    fn relocating_twice_changes_nothing() {
        let mut tree = relocated_tree();
        relocate(&mut tree);
        let once = (
            tree.class_files().clone(),
            tree.interface_files().clone(),
            tree.rules().to_owned(),
        );
        relocate(&mut tree);
        assert_eq!(once.0, *tree.class_files());
        assert_eq!(once.1, *tree.interface_files());
        assert_eq!(once.2, tree.rules());
    }

    fn relocate_with(tree: &mut WorkingTree, rules: Vec<RelocationRule>) {
        let spec = RelocationInput::Rules(rules).resolve(tree).expect("spec");
        let table = SymbolTable::build(&spec, tree).expect("table");
        apply(tree, &table).expect("apply");
    }

    #[test]
    fn explicit_rules_relocate_once() {
        let mut tree = tree_with_classes(&[
            ("app", &["com/app/Main"]),
            ("lib", &["com/lib/A", "com/lib/io/B"]),
        ]);
        let rules = vec![rule("com.lib.io", "moved.io"), rule("com.lib", "shaded.lib")];

        relocate_with(&mut tree, rules.clone());
        let once = tree.class_files().clone();
        relocate_with(&mut tree, rules);

        let classes: Vec<&str> = once.keys().map(String::as_str).collect();
        assert_eq!(classes, ["com/app/Main.class", "moved/io/B.class", "shaded/lib/A.class"]);
        assert_eq!(once, *tree.class_files());
    }

    #[test]
    fn apply_moves_a_subpackage_into_its_parent() {
        let mut tree = tree_with_classes(&[
            ("app", &["com/app/Main"]),
            ("lib", &["com/lib/sub/X", "com/lib/sub/io/Y"]),
        ]);
        relocate_with(&mut tree, vec![rule("com.lib.sub", "com.lib")]);

        let classes: Vec<&str> = tree.class_files().keys().map(String::as_str).collect();
        assert_eq!(classes, ["com/app/Main.class", "com/lib/X.class", "com/lib/io/Y.class"]);
    }

    #[test]
    fn failed_rewrite_leaves_the_tree_untouched() {
        let mut tree = relocated_tree();
        tree.class_files.insert(
            "com/lib/Broken.class".to_owned(),
            ClassFileBuilder::new("com/lib/Broken").version(99).build(),
        );
        tree.provenance
            .insert(compiled_key("com/lib/Broken.class"), ArtifactId::from("lib"));
        let before = tree.class_files().clone();

        let spec = RelocationInput::Prefix("shaded".to_owned())
            .resolve(&mut tree)
            .expect("spec");
        let table = SymbolTable::build(&spec, &tree).expect("table");
        assert!(matches!(
            apply(&mut tree, &table),
            Err(FuseError::UnsupportedClassVersion { .. })
        ));
        assert_eq!(before, *tree.class_files());
    }

    #[test]
    fn service_files_follow_their_type() {
        let mut tree = relocated_tree();
        tree.java_resources.insert(
            "META-INF/services/com.lib.A".to_owned(),
            b"com.lib.A\n".to_vec(),
        );
        relocate(&mut tree);
        assert_eq!(
            tree.java_resources().get("META-INF/services/shaded.com.lib.A").map(Vec::as_slice),
            Some(b"shaded.com.lib.A\n".as_slice())
        );
    }

    #[rstest]
    #[case("a.b", "a", true)]
    #[case("a", "a", true)]
    #[case("ab", "a", false)]
    fn under_checks_segments(#[case] name: &str, #[case] prefix: &str, #[case] expected: bool) {
        assert_eq!(is_under(name, prefix), expected);
    }
}
