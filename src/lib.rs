//! Fusion of Android library archives with consistent symbol relocation.
//!
//! A primary library package and its secondary dependencies are extracted
//! ([`artifact`]), merged into one working tree ([`merge`]), relocated so
//! that every name the dependencies contribute moves under a new package
//! ([`relocation`]), and written back as one archive ([`repackage`]).
//! [`pipeline`] sequences those stages per build variant and [`config`]
//! turns an `aar-fuse.toml` file into pipeline requests.

pub mod archive;
pub mod artifact;
pub mod config;
pub mod error;
pub mod merge;
pub mod pipeline;
pub mod relocation;
pub mod repackage;
pub mod report;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod variant;

pub use config::FuseConfig;
pub use error::{FuseError, PipelineError, Result, Stage};
pub use pipeline::{FusionOutcome, FusionRequest, PipelineState, VariantPipeline};
pub use variant::VariantName;
