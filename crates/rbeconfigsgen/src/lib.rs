//! Generates Bazel toolchain configs for remote build execution from a
//! toolchain container image or the local host.

pub mod error;
pub mod manifest;
pub mod monitoring;
pub mod options;
pub mod output;
pub mod pipeline;
pub mod runner;
pub mod templates;
pub mod version;

pub use error::{GenError, Result, Step};
pub use manifest::Manifest;
pub use options::{Options, Os, RunnerKind};
pub use runner::{Runner, RunnerSession};
pub use version::{FixedVersion, GithubReleaseResolver, VersionResolver};
