//! Execution environments that config generation runs inside.
//!
//! A [`Runner`] is a place to run commands, move files in and out of, and read
//! environment variables from. [`HostRunner`] works in a scratch directory on the
//! local machine, [`DockerRunner`] drives a toolchain container through the docker
//! CLI. Both shell out through a [`CommandExecutor`] so tests can script the
//! external processes.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{GenError, Result};

pub mod docker;
pub mod host;

pub use docker::{DockerRunner, DockerRunnerConfig, ProvisionStage};
pub use host::HostRunner;

/// Capabilities the generation pipeline needs from an execution environment.
pub trait Runner {
    /// Runs `args` in the current workdir with the additional env applied and
    /// returns both output streams. A non-zero exit is an error.
    fn exec(&self, args: &[&str]) -> Result<CommandOutput>;

    /// Like [`Runner::exec`] but returns stdout only, with surrounding whitespace
    /// trimmed.
    fn exec_cmd(&self, args: &[&str]) -> Result<String> {
        Ok(self.exec(args)?.stdout.trim().to_string())
    }

    /// Copies the local file `src` to `dst` inside the environment. The workdir
    /// has no effect on either path.
    fn copy_to(&self, src: &Path, dst: &str) -> Result<()>;

    /// Copies `src` from inside the environment to the local path `dst`.
    fn copy_from(&self, src: &str, dst: &Path) -> Result<()>;

    /// Variables declared by the environment itself. Changes made by commands run
    /// after acquisition are not reflected.
    fn get_env(&self) -> Result<BTreeMap<String, String>>;

    fn set_additional_env(&mut self, env: BTreeMap<String, String>);

    fn additional_env(&self) -> &BTreeMap<String, String>;

    fn set_workdir(&mut self, workdir: &str) -> Result<()>;

    fn workdir(&self) -> &str;

    /// Digest-pinned image the environment runs, when there is one.
    fn resolved_image(&self) -> Option<&str> {
        None
    }

    /// Releases the environment. Calling it more than once is a no-op and it never
    /// fails: problems are logged.
    fn cleanup(&mut self);
}

/// Owns a runner for the length of one generation session and releases it on drop.
pub struct RunnerSession {
    runner: Box<dyn Runner>,
}

impl RunnerSession {
    pub fn new(runner: Box<dyn Runner>) -> Self {
        Self { runner }
    }
}

impl Deref for RunnerSession {
    type Target = dyn Runner;

    fn deref(&self) -> &Self::Target {
        self.runner.as_ref()
    }
}

impl DerefMut for RunnerSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.runner.as_mut()
    }
}

impl Drop for RunnerSession {
    fn drop(&mut self) {
        self.runner.cleanup();
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(stderr: impl Into<String>) -> Self {
        Self {
            status: 1,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.clone();
        combined.push_str(&self.stderr);
        combined
    }
}

pub trait CommandExecutor {
    fn execute(&self, program: &str, args: &[String], options: &ExecOptions)
        -> Result<CommandOutput>;
}

pub struct SystemCommandExecutor;

impl CommandExecutor for SystemCommandExecutor {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        options: &ExecOptions,
    ) -> Result<CommandOutput> {
        let mut cmd = Command::new(program);
        cmd.args(args).envs(&options.env);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }

        let output = cmd.output().map_err(|source| GenError::Spawn {
            program: program.to_string(),
            source,
        })?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// A command line seen by [`ScriptedCommandExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub command_line: String,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// Deterministic command executor used in tests where shelling out is undesirable.
///
/// Responses are matched in registration order against the full command line by
/// substring. Unmatched commands succeed with empty output.
#[derive(Clone, Default)]
pub struct ScriptedCommandExecutor {
    responses: Arc<Mutex<Vec<(String, CommandOutput)>>>,
    calls: Arc<Mutex<Vec<RecordedCommand>>>,
}

impl ScriptedCommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, pattern: impl Into<String>, output: CommandOutput) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push((pattern.into(), output));
        }
        self
    }

    pub fn calls(&self) -> Vec<RecordedCommand> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command_line).collect()
    }
}

impl CommandExecutor for ScriptedCommandExecutor {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        options: &ExecOptions,
    ) -> Result<CommandOutput> {
        let command_line = command_line(program, args);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCommand {
                command_line: command_line.clone(),
                env: options.env.clone(),
                cwd: options.cwd.clone(),
            });
        }

        let responses = self
            .responses
            .lock()
            .map_err(|_| GenError::validation("scripted executor state poisoned"))?;
        Ok(responses
            .iter()
            .find(|(pattern, _)| command_line.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CommandOutput::success("")))
    }
}

pub(crate) fn command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Runs a command, logging it, and turns a non-zero exit into
/// [`GenError::Command`] carrying both streams. Stderr of a successful command
/// is logged and never mixed into stdout.
pub(crate) fn run_checked<E: CommandExecutor + ?Sized>(
    executor: &E,
    program: &str,
    args: &[String],
    options: &ExecOptions,
) -> Result<CommandOutput> {
    let line = command_line(program, args);
    info!("Running: '{}'", line);
    let output = executor.execute(program, args, options)?;
    if output.status != 0 {
        let combined = output.combined();
        warn!("Output: {}", combined.trim());
        return Err(GenError::Command {
            command: line,
            status: output.status,
            output: combined,
        });
    }
    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        debug!("Stderr of '{}': {}", line, stderr);
    }
    Ok(output)
}

/// Parses `KEY=VALUE` lines. Later duplicates win, a bare `KEY` maps to an empty
/// value and lines without a key are skipped.
pub fn parse_env_lines(text: &str) -> BTreeMap<String, String> {
    let mut result = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key, value),
            None => (line, ""),
        };
        if key.is_empty() {
            continue;
        }
        result.insert(key.to_string(), value.to_string());
    }
    result
}
