//! Zip archive I/O for library packages and their nested compiled-code
//! archives.
//!
//! # Sub-modules
//!
//! - [`extraction`]: path-safe extraction to disk and in-memory reading of
//!   nested archives.
//! - [`packaging`]: deterministic archive writing and atomic replacement of
//!   the final output.

pub mod extraction;
pub mod packaging;

use std::collections::BTreeMap;

/// Archive entries keyed by their slash-separated path.
///
/// The ordered map gives every writer a stable entry order independent of
/// file-system iteration order.
pub type EntryMap = BTreeMap<String, Vec<u8>>;
