use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{GenError, Result};

/// Object name of the manifest inside each publish directory.
pub const MANIFEST_OBJECT: &str = "manifest.json";
/// Object name of the configs tarball inside each publish directory.
pub const TARBALL_OBJECT: &str = "rbe_default.tar";

/// Record of one generation run, consumed by the configs publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub bazel_version: String,
    /// Digest-pinned reference of the toolchain image the configs came from.
    pub toolchain_container: String,
    pub exec_os: String,
    pub target_os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpp_toolchain_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub java_toolchain_target: Option<String>,
    /// Hex sha256 of the configs tarball, when one was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configs_tarball_digest: Option<String>,
    pub generation_time: DateTime<Utc>,
    /// Filled in by the publisher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_time: Option<DateTime<Utc>>,
}

impl Manifest {
    pub fn write(&self, path: &Path) -> Result<()> {
        let blob = serde_json::to_vec_pretty(self).map_err(|e| {
            GenError::io(
                "failed to serialize manifest",
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        fs::write(path, blob).map_err(|e| {
            GenError::io(format!("failed to write manifest to {}", path.display()), e)
        })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let blob = fs::read(path).map_err(|e| {
            GenError::io(format!("unable to read manifest {}", path.display()), e)
        })?;
        let manifest: Manifest = serde_json::from_slice(&blob).map_err(|e| {
            GenError::validation(format!(
                "error parsing contents of manifest file {} as JSON: {}",
                path.display(),
                e
            ))
        })?;
        if manifest.bazel_version.is_empty() {
            return Err(GenError::validation(format!(
                "manifest {} did not specify bazel version",
                path.display()
            )));
        }
        Ok(manifest)
    }

    /// Remote directories the configs are published under.
    pub fn publish_dirs(&self) -> [String; 2] {
        publish_dirs(&self.bazel_version)
    }
}

pub fn publish_dirs(bazel_version: &str) -> [String; 2] {
    [
        "configs/latest".to_string(),
        format!("configs/bazel_{}/latest", bazel_version),
    ]
}
