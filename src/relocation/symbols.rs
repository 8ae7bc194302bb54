//! The rename map shared by every rewriter.
//!
//! Names are held in internal form (`com/lib/A`, packages as `com/lib`).
//! The table is built once from a [`RelocationSpec`] and the working tree
//! and is read-only afterwards.

use super::RelocationSpec;
use crate::artifact::ArtifactId;
use crate::error::{FuseError, Result};
use crate::merge::{WorkingTree, compiled_key, package_of};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

/// Original name to relocated name, for classes, packages and accessors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    classes: BTreeMap<String, String>,
    packages: BTreeMap<String, String>,
    accessors: BTreeMap<String, String>,
    accessor_targets: BTreeSet<String>,
}

impl SymbolTable {
    /// Build the table for `tree`.
    ///
    /// Every class and interface type in the tree is matched against the
    /// rules in order; the first rule whose package pattern and class
    /// filters accept it decides its new name. Generated accessors (`R`,
    /// `R$*`) are handled by the accessor rules alone.
    ///
    /// # Errors
    ///
    /// Returns [`FuseError::ClassCollision`] when two classes would end up
    /// with the same name.
    pub fn build(spec: &RelocationSpec, tree: &WorkingTree) -> Result<Self> {
        let mut table = Self::default();
        for accessor in spec.accessors() {
            table
                .accessors
                .insert(internal(accessor.from_namespace()), internal(accessor.to_namespace()));
            table.accessor_targets.insert(internal(accessor.to_namespace()));
        }

        let known = known_types(tree);
        let mut packages = BTreeSet::new();
        for name in &known {
            packages.insert(package_of(name).to_owned());
            if table.is_accessor(name) || table.is_accessor_target(name) {
                continue;
            }
            let dotted_package = dotted(package_of(name));
            let relocated = spec.rules().iter().find_map(|rule| {
                rule.relocate_package(&dotted_package)
                    .filter(|_| rule.accepts_class(name))
            });
            if let Some(package) = relocated {
                table
                    .classes
                    .insert(name.clone(), join(&internal(&package), simple_name(name)));
            }
        }

        for package in packages {
            let dotted_package = dotted(&package);
            let first = spec
                .rules()
                .iter()
                .find_map(|rule| rule.relocate_package(&dotted_package).map(|to| (rule, to)));
            if let Some((rule, to)) = first {
                if rule.is_filtered() {
                    debug!("package {dotted_package} is split by class filters; not mapped as a whole");
                } else {
                    table.packages.insert(package, internal(&to));
                }
            }
        }

        table.check_targets(tree, &known)?;
        debug!(
            "symbol table: {} classes, {} packages, {} accessor namespaces",
            table.classes.len(),
            table.packages.len(),
            table.accessors.len()
        );
        Ok(table)
    }

    fn check_targets(&self, tree: &WorkingTree, known: &BTreeSet<String>) -> Result<()> {
        let mut claimed: BTreeMap<&str, &str> = BTreeMap::new();
        for (from, to) in &self.classes {
            let occupied = known.contains(to) && !self.classes.contains_key(to);
            if let Some(previous) = claimed.insert(to, from) {
                return Err(collision(tree, to, previous, from));
            }
            if occupied {
                return Err(collision(tree, to, to, from));
            }
        }
        Ok(())
    }

    /// Whether the table renames nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.packages.is_empty() && self.accessors.is_empty()
    }

    /// New internal name for a class reference, falling back to the package
    /// map for classes the tree does not contain.
    #[must_use]
    pub fn map_class(&self, name: &str) -> Option<String> {
        self.map_known_class(name).or_else(|| {
            let (package, simple) = name.rsplit_once('/')?;
            self.packages.get(package).map(|to| join(to, simple))
        })
    }

    /// New internal name for a class the tree contains, or for a generated
    /// accessor. Never guesses from the package alone.
    #[must_use]
    pub fn map_known_class(&self, name: &str) -> Option<String> {
        if let Some(to) = self.accessor_namespace(name) {
            return Some(join(to, simple_name(name)));
        }
        self.classes.get(name).cloned()
    }

    /// New internal name for a package.
    #[must_use]
    pub fn map_package(&self, package: &str) -> Option<String> {
        self.packages.get(package).cloned()
    }

    /// Whether `name` is a generated accessor moved by an accessor rule.
    #[must_use]
    pub fn is_accessor(&self, name: &str) -> bool {
        self.accessor_namespace(name).is_some()
    }

    /// Whether `name` is an accessor in a namespace accessors are moved to.
    #[must_use]
    pub fn is_accessor_target(&self, name: &str) -> bool {
        is_accessor_name(name) && self.accessor_targets.contains(package_of(name))
    }

    /// Relocated classes in internal form.
    pub fn relocated_classes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.classes.iter().map(|(from, to)| (from.as_str(), to.as_str()))
    }

    /// Target namespace for an accessor in a source namespace or one of its
    /// sub-packages. The longest matching source wins; accessors already
    /// inside a target namespace stay put.
    fn accessor_namespace(&self, name: &str) -> Option<&str> {
        if !is_accessor_name(name) {
            return None;
        }
        let package = package_of(name);
        if self.accessor_targets.iter().any(|target| is_within(package, target)) {
            return None;
        }
        self.accessors
            .iter()
            .filter(|(from, _)| is_within(package, from))
            .max_by_key(|(from, _)| from.len())
            .map(|(_, to)| to.as_str())
    }
}

/// `R` or `R$kind`, in any package.
fn is_accessor_name(name: &str) -> bool {
    let simple = simple_name(name);
    simple == "R" || simple.starts_with("R$")
}

/// Whether internal `package` is `parent` or one of its sub-packages.
fn is_within(package: &str, parent: &str) -> bool {
    package
        .strip_prefix(parent)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn simple_name(name: &str) -> &str {
    name.rsplit_once('/').map_or(name, |(_, simple)| simple)
}

fn join(package: &str, simple: &str) -> String {
    if package.is_empty() {
        simple.to_owned()
    } else {
        format!("{package}/{simple}")
    }
}

/// Internal names of every class and interface type in `tree`.
fn known_types(tree: &WorkingTree) -> BTreeSet<String> {
    let classes = tree
        .class_files
        .keys()
        .filter_map(|path| path.strip_suffix(".class"));
    let interfaces = tree.interface_files.keys().filter_map(|path| interface_type(path));
    classes.chain(interfaces).map(str::to_owned).collect()
}

/// `aidl/com/lib/IThing.aidl` → `com/lib/IThing`.
pub(crate) fn interface_type(path: &str) -> Option<&str> {
    path.strip_prefix("aidl/")?.strip_suffix(".aidl")
}

pub(crate) fn internal(dotted: &str) -> String {
    dotted.replace('.', "/")
}

pub(crate) fn dotted(internal: &str) -> String {
    internal.replace('/', ".")
}

fn provenance_of(tree: &WorkingTree, name: &str) -> ArtifactId {
    tree.provenance(&compiled_key(&format!("{name}.class")))
        .or_else(|| tree.provenance(&format!("aidl/{name}.aidl")))
        .cloned()
        .unwrap_or_else(|| ArtifactId::from("unknown"))
}

fn collision(tree: &WorkingTree, target: &str, first: &str, second: &str) -> FuseError {
    FuseError::ClassCollision {
        name: dotted(target),
        first: provenance_of(tree, first),
        second: provenance_of(tree, second),
    }
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests fail loudly on broken fixtures")]
mod tests {
    use super::*;
    use crate::relocation::{AccessorRule, RelocationRule};
    use crate::testing::tree_with_classes;
    use rstest::rstest;

    fn spec(rules: Vec<RelocationRule>, accessors: Vec<AccessorRule>) -> RelocationSpec {
        RelocationSpec::new(rules, accessors).expect("valid spec")
    }

    fn rule(from: &str, to: &str) -> RelocationRule {
        RelocationRule::new(from, to).expect("valid rule")
    }

    #[test]
    fn first_matching_rule_wins() {
        let tree = tree_with_classes(&[("lib", &["com/lib/A", "com/lib/sub/B"])]);
        let table = SymbolTable::build(
            &spec(
                vec![rule("com.lib.sub", "first.sub"), rule("com.lib", "second")],
                Vec::new(),
            ),
            &tree,
        )
        .expect("table");

        assert_eq!(table.map_class("com/lib/A").as_deref(), Some("second/A"));
        assert_eq!(table.map_class("com/lib/sub/B").as_deref(), Some("first/sub/B"));
    }

    #[test]
    fn missing_classes_fall_back_to_the_package_map() {
        let tree = tree_with_classes(&[("lib", &["com/lib/A"])]);
        let table =
            SymbolTable::build(&spec(vec![rule("com.lib", "shaded.com.lib")], Vec::new()), &tree)
                .expect("table");

        assert_eq!(table.map_class("com/lib/Gone").as_deref(), Some("shaded/com/lib/Gone"));
        assert_eq!(table.map_known_class("com/lib/Gone"), None);
        assert_eq!(table.map_package("com/lib").as_deref(), Some("shaded/com/lib"));
    }

    #[rstest]
    #[case::accessor("com/lib/R", Some("com/app/R"))]
    #[case::nested_accessor("com/lib/R$string", Some("com/app/R$string"))]
    #[case::lookalike("com/lib/Registry", Some("shaded/com/lib/Registry"))]
    #[case::sub_package("com/lib/sub/R$id", Some("com/app/R$id"))]
    #[case::sibling_namespace("com/library/R", None)]
    #[case::primary_sub_package("com/app/sub/R", None)]
    fn accessors_move_to_the_primary_namespace(#[case] name: &str, #[case] expected: Option<&str>) {
        let tree = tree_with_classes(&[("lib", &["com/lib/Registry"])]);
        let table = SymbolTable::build(
            &spec(
                vec![rule("com.lib", "shaded.com.lib")],
                vec![AccessorRule::new("com.lib", "com.app").expect("valid accessor")],
            ),
            &tree,
        )
        .expect("table");

        assert_eq!(table.map_class(name).as_deref(), expected);
    }

    #[test]
    fn already_relocated_names_are_not_relocated_again() {
        let tree = tree_with_classes(&[("lib", &["shaded/com/lib/A", "com/lib/B"])]);
        let table =
            SymbolTable::build(&spec(vec![rule("com.lib", "shaded.com.lib")], Vec::new()), &tree)
                .expect("table");

        assert_eq!(table.map_class("shaded/com/lib/A"), None);
        assert_eq!(table.map_class("com/lib/B").as_deref(), Some("shaded/com/lib/B"));
    }

    #[test]
    fn the_most_specific_accessor_namespace_wins() {
        let tree = tree_with_classes(&[("lib", &["com/lib/A"])]);
        let table = SymbolTable::build(
            &spec(
                Vec::new(),
                vec![
                    AccessorRule::new("com", "org.app").expect("valid accessor"),
                    AccessorRule::new("com.lib", "org.lib").expect("valid accessor"),
                ],
            ),
            &tree,
        )
        .expect("table");

        assert_eq!(table.map_class("com/lib/io/R").as_deref(), Some("org/lib/R"));
        assert_eq!(table.map_class("com/other/R$raw").as_deref(), Some("org/app/R$raw"));
        assert!(table.is_accessor("com/lib/R"));
    }

    #[test]
    fn relocating_onto_an_existing_class_collides() {
        let tree = tree_with_classes(&[("app", &["com/app/A"]), ("lib", &["com/lib/A"])]);
        let result =
            SymbolTable::build(&spec(vec![rule("com.lib", "com.app")], Vec::new()), &tree);
        assert!(matches!(
            result,
            Err(FuseError::ClassCollision { ref name, .. }) if name == "com.app.A"
        ));
    }
}
