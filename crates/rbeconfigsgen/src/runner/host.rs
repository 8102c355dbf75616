use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

use super::{
    run_checked, CommandExecutor, CommandOutput, ExecOptions, Runner, SystemCommandExecutor,
};
use crate::error::{GenError, Result};

/// Runs commands directly on the local machine inside a scratch directory.
///
/// The working directory can be moved around but never outside the scratch root.
pub struct HostRunner<E: CommandExecutor = SystemCommandExecutor> {
    executor: E,
    root: PathBuf,
    workdir: PathBuf,
    workdir_display: String,
    env_snapshot: BTreeMap<String, String>,
    additional_env: BTreeMap<String, String>,
    delete_workdir: bool,
    cleaned: bool,
}

impl HostRunner<SystemCommandExecutor> {
    pub fn new(temp_parent: Option<&Path>, delete_workdir: bool) -> Result<Self> {
        Self::with_executor(SystemCommandExecutor, temp_parent, delete_workdir)
    }
}

impl<E: CommandExecutor> HostRunner<E> {
    /// Allocates a fresh scratch root, under `temp_parent` when given, and snapshots
    /// the process environment.
    pub fn with_executor(
        executor: E,
        temp_parent: Option<&Path>,
        delete_workdir: bool,
    ) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("host_runner_");
        let scratch = match temp_parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|e| {
            GenError::io(
                "failed to create a temporary local directory for the host runner",
                e,
            )
        })?;
        // Removal is handled by cleanup() so that it can be skipped for debugging.
        let root = scratch.keep();

        let env_snapshot = env::vars_os()
            .filter_map(|(k, v)| {
                let key = k.to_string_lossy().trim().to_string();
                if key.is_empty() {
                    None
                } else {
                    Some((key, v.to_string_lossy().to_string()))
                }
            })
            .collect();

        info!("Host runner scratch directory is {}", root.display());
        Ok(Self {
            executor,
            workdir_display: root.display().to_string(),
            workdir: root.clone(),
            root,
            env_snapshot,
            additional_env: BTreeMap::new(),
            delete_workdir,
            cleaned: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `requested` against the current workdir without touching the
    /// filesystem and checks it stays under the scratch root.
    fn confine(&self, requested: &str) -> Result<PathBuf> {
        let requested_path = Path::new(requested);
        let joined = if requested_path.is_absolute() {
            requested_path.to_path_buf()
        } else {
            self.workdir.join(requested_path)
        };

        let mut normalized = PathBuf::new();
        for comp in joined.components() {
            match comp {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(GenError::validation(format!(
                            "workdir '{}' escapes the filesystem root",
                            requested
                        )));
                    }
                }
                Component::CurDir => {}
                other => normalized.push(other.as_os_str()),
            }
        }

        if !normalized.starts_with(&self.root) {
            return Err(GenError::validation(format!(
                "workdir '{}' must be nested under the host runner root '{}'",
                requested,
                self.root.display()
            )));
        }
        Ok(normalized)
    }
}

impl<E: CommandExecutor> Runner for HostRunner<E> {
    fn exec(&self, args: &[&str]) -> Result<CommandOutput> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| GenError::validation("no command given to execute"))?;
        let rest: Vec<String> = rest.iter().map(|a| a.to_string()).collect();
        let options = ExecOptions {
            cwd: Some(self.workdir.clone()),
            env: self.additional_env.clone(),
        };
        run_checked(&self.executor, program, &rest, &options)
    }

    fn copy_to(&self, src: &Path, dst: &str) -> Result<()> {
        copy_file(src, Path::new(dst))
    }

    fn copy_from(&self, src: &str, dst: &Path) -> Result<()> {
        copy_file(Path::new(src), dst)
    }

    fn get_env(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.env_snapshot.clone())
    }

    fn set_additional_env(&mut self, env: BTreeMap<String, String>) {
        self.additional_env = env;
    }

    fn additional_env(&self) -> &BTreeMap<String, String> {
        &self.additional_env
    }

    fn set_workdir(&mut self, workdir: &str) -> Result<()> {
        let confined = self.confine(workdir)?;
        self.workdir_display = confined.display().to_string();
        self.workdir = confined;
        Ok(())
    }

    fn workdir(&self) -> &str {
        &self.workdir_display
    }

    fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;

        if !self.delete_workdir {
            info!(
                "Not deleting workdir {} because the cleanup option was set to false.",
                self.root.display()
            );
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.root) {
            warn!("Failed to delete {}: {}", self.root.display(), e);
        }
    }
}

fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    info!("Copying {} to {}", src.display(), dst.display());
    fs::copy(src, dst).map(|_| ()).map_err(|e| {
        GenError::io(
            format!("failed to copy {} to {}", src.display(), dst.display()),
            e,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, ScriptedCommandExecutor};

    #[test]
    fn exec_cmd_uses_workdir_and_additional_env() {
        let executor = ScriptedCommandExecutor::new()
            .respond("bazel info", CommandOutput::success("/out\n"));
        let mut runner = HostRunner::with_executor(executor.clone(), None, true).unwrap();
        fs::create_dir_all(runner.root().join("ws")).unwrap();
        runner.set_workdir("ws").unwrap();
        runner.set_additional_env(BTreeMap::from([("CC".to_string(), "clang".to_string())]));

        let out = runner.exec_cmd(&["bazel", "info", "output_base"]).unwrap();
        assert_eq!(out, "/out");

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].cwd.as_deref(), Some(runner.root().join("ws").as_path()));
        assert_eq!(calls[0].env.get("CC").map(String::as_str), Some("clang"));
        runner.cleanup();
    }

    #[test]
    fn exec_cmd_rejects_empty_command() {
        let mut runner =
            HostRunner::with_executor(ScriptedCommandExecutor::new(), None, true).unwrap();
        assert!(matches!(
            runner.exec_cmd(&[]),
            Err(GenError::Validation { .. })
        ));
        runner.cleanup();
    }

    #[test]
    fn confine_normalizes_parent_components() {
        let mut runner =
            HostRunner::with_executor(ScriptedCommandExecutor::new(), None, true).unwrap();
        runner.set_workdir("a/b/../c").unwrap();
        assert_eq!(
            PathBuf::from(runner.workdir()),
            runner.root().join("a").join("c")
        );
        assert!(runner.set_workdir("../../..").is_err());
        runner.cleanup();
    }
}
