//! Packaging of the staged config tree.

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::Path;
use tracing::info;
use walkdir::WalkDir;

use crate::error::{GenError, Result};

/// Top level directories of a generated config tree.
pub const CONFIG_SUBDIRS: [&str; 3] = ["cc", "java", "platforms"];

/// Writes `staging` as an uncompressed tarball at `dest` and returns its sha256.
pub fn write_tarball(staging: &Path, dest: &Path) -> Result<String> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| GenError::io(format!("failed to create {}", parent.display()), e))?;
    }
    let file = File::create(dest)
        .map_err(|e| GenError::io(format!("failed to create {}", dest.display()), e))?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);

    for sub in CONFIG_SUBDIRS {
        let dir = staging.join(sub);
        if dir.is_dir() {
            builder.append_dir_all(sub, &dir).map_err(|e| {
                GenError::io(format!("failed to add {} to the configs tarball", sub), e)
            })?;
        }
    }
    builder
        .into_inner()
        .map_err(|e| GenError::io("failed to finish the configs tarball", e))?;

    let digest = sha256_file(dest)?;
    info!("Wrote configs tarball {} (sha256 {})", dest.display(), digest);
    Ok(digest)
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| GenError::io(format!("failed to open {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .map_err(|e| GenError::io(format!("failed to hash {}", path.display()), e))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Unpacks a tarball produced inside the execution environment into `dest`.
pub fn extract_tarball(tarball: &Path, dest: &Path) -> Result<()> {
    let file = File::open(tarball)
        .map_err(|e| GenError::io(format!("failed to open {}", tarball.display()), e))?;
    fs::create_dir_all(dest)
        .map_err(|e| GenError::io(format!("failed to create {}", dest.display()), e))?;
    tar::Archive::new(file).unpack(dest).map_err(|e| {
        GenError::io(
            format!("failed to extract {} into {}", tarball.display(), dest.display()),
            e,
        )
    })
}

/// Copies the staged tree into `source_root/config_path`, replacing whatever
/// generated subdirectories were there before.
pub fn copy_to_source_root(staging: &Path, source_root: &Path, config_path: &str) -> Result<()> {
    let dest_root = if config_path.is_empty() {
        source_root.to_path_buf()
    } else {
        source_root.join(config_path.replace('\\', "/"))
    };

    for sub in CONFIG_SUBDIRS {
        let src = staging.join(sub);
        if !src.is_dir() {
            continue;
        }
        let dest = dest_root.join(sub);
        if dest.exists() {
            fs::remove_dir_all(&dest).map_err(|e| {
                GenError::io(format!("failed to remove stale {}", dest.display()), e)
            })?;
        }
        copy_dir(&src, &dest)?;
    }
    info!("Copied generated configs to {}", dest_root.display());
    Ok(())
}

fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            let message = format!("failed to walk {}", src.display());
            GenError::io(message, e.into())
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| GenError::io("unexpected path outside copy source", io::Error::other(e)))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| GenError::io(format!("failed to create {}", target.display()), e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| {
                GenError::io(
                    format!(
                        "failed to copy {} to {}",
                        entry.path().display(),
                        target.display()
                    ),
                    e,
                )
            })?;
        }
    }
    Ok(())
}
