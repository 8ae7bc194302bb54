//! Build variant names.
//!
//! A variant name keys the scratch area of one pipeline, so it must be safe
//! to use as a single path component: ASCII letters, digits, `-` and `_`.

use crate::error::{FuseError, Result};
use std::fmt;

/// A validated build variant name such as `release` or `freeDebug`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariantName(String);

impl VariantName {
    /// Return the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for VariantName {
    type Error = FuseError;

    fn try_from(value: &str) -> Result<Self> {
        validate_variant_name(value)?;
        Ok(Self(value.to_owned()))
    }
}

impl TryFrom<String> for VariantName {
    type Error = FuseError;

    fn try_from(value: String) -> Result<Self> {
        validate_variant_name(&value)?;
        Ok(Self(value))
    }
}

impl AsRef<str> for VariantName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VariantName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn validate_variant_name(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(FuseError::InvalidVariant {
            value: value.to_owned(),
            reason: "name must not be empty".to_owned(),
        });
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(FuseError::InvalidVariant {
            value: value.to_owned(),
            reason: format!("character '{bad}' is not allowed"),
        });
    }
    Ok(())
}

#[cfg(test)]
#[expect(clippy::expect_used, reason = "tests fail loudly on broken fixtures")]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain("release")]
    #[case::flavoured("freeDebug")]
    #[case::dashed("arm64-release_2")]
    fn accepts_path_safe_names(#[case] name: &str) {
        let variant = VariantName::try_from(name).expect("valid name");
        assert_eq!(variant.as_str(), name);
    }

    #[rstest]
    #[case::empty("")]
    #[case::traversal("../release")]
    #[case::separator("free/debug")]
    #[case::space("free debug")]
    fn rejects_unsafe_names(#[case] name: &str) {
        let result = VariantName::try_from(name);
        assert!(
            matches!(result, Err(FuseError::InvalidVariant { .. })),
            "expected InvalidVariant for {name:?}"
        );
    }
}
