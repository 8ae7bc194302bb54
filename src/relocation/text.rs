//! Whole-token rewriting of dotted names in text.
//!
//! A token is a maximal run of `[A-Za-z0-9_$.]`; leading and trailing dots
//! are kept out of the name, so `.Relative` and `com.lib.**` work as
//! expected. A token that merely contains a relocated name as a substring
//! (`xcom.lib.A`, `com.lib.AB`) is never touched.

use super::symbols::{SymbolTable, dotted, internal};

/// Which names a text carrier may refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    /// Only classes the tree contains and generated accessors. Used for
    /// manifests, where action and permission strings share the namespace
    /// of class names.
    KnownClasses,
    /// Classes, nested class references (`Outer.Inner`), packages, and
    /// classes of relocated packages the tree does not contain. Used for
    /// interface definitions, rule files and service registrations.
    Source,
}

/// Rewrite every relocated name in `text`; `None` when nothing changed.
pub(crate) fn rewrite(text: &str, table: &SymbolTable, scope: Scope) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut changed = false;
    let mut rest = text;
    while let Some(start) = rest.find(is_token_char) {
        let (before, from_start) = rest.split_at(start);
        out.push_str(before);
        let end = from_start
            .find(|c: char| !is_token_char(c))
            .unwrap_or(from_start.len());
        let (token, after) = from_start.split_at(end);
        match rewrite_token(token, table, scope) {
            Some(rewritten) => {
                out.push_str(&rewritten);
                changed = true;
            }
            None => out.push_str(token),
        }
        rest = after;
    }
    out.push_str(rest);
    changed.then_some(out)
}

const fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '.')
}

fn rewrite_token(token: &str, table: &SymbolTable, scope: Scope) -> Option<String> {
    let core_start = token.find(|c| c != '.')?;
    let core_end = token.trim_end_matches('.').len();
    let leading = token.get(..core_start)?;
    let core = token.get(core_start..core_end)?;
    let trailing = token.get(core_end..)?;
    if !leading.is_empty() || !core.contains('.') || core.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let mapped = map_name(core, table, scope)?;
    Some(format!("{leading}{mapped}{trailing}"))
}

fn map_name(name: &str, table: &SymbolTable, scope: Scope) -> Option<String> {
    let as_internal = internal(name);
    if let Some(mapped) = table.map_known_class(&as_internal) {
        return Some(dotted(&mapped));
    }
    if scope == Scope::KnownClasses {
        return None;
    }
    if let Some(mapped) = table.map_package(&as_internal) {
        return Some(dotted(&mapped));
    }
    for (split, _) in name.rmatch_indices('.') {
        let (outer, nested) = name.split_at(split);
        if let Some(mapped) = table.map_known_class(&internal(outer)) {
            return Some(format!("{}{nested}", dotted(&mapped)));
        }
    }
    table.map_class(&as_internal).map(|mapped| dotted(&mapped))
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests fail loudly on broken fixtures")]
mod tests {
    use super::*;
    use crate::relocation::{AccessorRule, RelocationRule, RelocationSpec};
    use crate::testing::tree_with_classes;
    use rstest::{fixture, rstest};

    #[fixture]
    fn table() -> SymbolTable {
        let tree = tree_with_classes(&[
            ("app", &["com/app/Main"]),
            ("lib", &["com/lib/A", "com/lib/Outer"]),
        ]);
        let spec = RelocationSpec::new(
            vec![RelocationRule::new("com.lib", "shaded.com.lib").expect("rule")],
            vec![AccessorRule::new("com.lib", "com.app").expect("accessor")],
        )
        .expect("spec");
        SymbolTable::build(&spec, &tree).expect("table")
    }

    #[rstest]
    #[case::attribute(r#"android:name="com.lib.A""#, r#"android:name="shaded.com.lib.A""#)]
    #[case::accessor("com.lib.R$string", "com.app.R$string")]
    #[case::action_string("com.lib.OPEN", "com.lib.OPEN")]
    #[case::substring("xcom.lib.A com.lib.AB", "xcom.lib.A com.lib.AB")]
    #[case::relative(".A", ".A")]
    fn manifest_scope_only_touches_known_classes(
        table: SymbolTable,
        #[case] input: &str,
        #[case] expected: &str,
    ) {
        let output = rewrite(input, &table, Scope::KnownClasses).unwrap_or_else(|| input.to_owned());
        assert_eq!(output, expected);
    }

    #[rstest]
    #[case::package_statement("package com.lib;", "package shaded.com.lib;")]
    #[case::wildcard("-keep class com.lib.** { *; }", "-keep class shaded.com.lib.** { *; }")]
    #[case::nested("import com.lib.Outer.Inner;", "import shaded.com.lib.Outer.Inner;")]
    #[case::missing_class("-dontwarn com.lib.Gone", "-dontwarn shaded.com.lib.Gone")]
    #[case::foreign("import android.os.Bundle;", "import android.os.Bundle;")]
    fn source_scope_follows_packages(
        table: SymbolTable,
        #[case] input: &str,
        #[case] expected: &str,
    ) {
        let output = rewrite(input, &table, Scope::Source).unwrap_or_else(|| input.to_owned());
        assert_eq!(output, expected);
    }

    #[rstest]
    fn already_relocated_text_is_stable(table: SymbolTable) {
        assert_eq!(rewrite("shaded.com.lib.A", &table, Scope::Source), None);
    }
}
