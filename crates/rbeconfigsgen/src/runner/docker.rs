use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

use super::{
    parse_env_lines, run_checked, CommandExecutor, CommandOutput, ExecOptions, Runner,
    SystemCommandExecutor,
};
use crate::error::{GenError, Result};
use crate::options::Os;

const CONTAINER_ID_LEN: usize = 64;

/// Provisioning stages of a toolchain container, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProvisionStage {
    Uncreated,
    ImagePulled,
    ImageResolved,
    ContainerCreated,
    ContainerStarted,
    WorkdirProvisioned,
    Ready,
}

impl ProvisionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionStage::Uncreated => "uncreated",
            ProvisionStage::ImagePulled => "image pulled",
            ProvisionStage::ImageResolved => "image resolved by digest",
            ProvisionStage::ContainerCreated => "container created",
            ProvisionStage::ContainerStarted => "container started",
            ProvisionStage::WorkdirProvisioned => "workdir provisioned",
            ProvisionStage::Ready => "ready",
        }
    }
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct DockerRunnerConfig {
    /// Tagged or floating reference accepted by the docker client.
    pub image: String,
    pub exec_os: Os,
    /// Passed as `--platform` to pull and create when set.
    pub platform: Option<String>,
    /// When false, cleanup leaves the container running for inspection.
    pub stop_container: bool,
    pub docker_path: String,
}

impl DockerRunnerConfig {
    pub fn new(image: impl Into<String>, exec_os: Os) -> Self {
        Self {
            image: image.into(),
            exec_os,
            platform: None,
            stop_container: true,
            docker_path: "docker".to_string(),
        }
    }
}

/// Root working directory inside a toolchain container of the given OS.
pub fn container_workdir(os: Os) -> &'static str {
    match os {
        Os::Linux => "/workdir",
        Os::Windows => "C:/workdir",
    }
}

/// Runs commands inside a toolchain container started from a digest-pinned image.
pub struct DockerRunner<E: CommandExecutor = SystemCommandExecutor> {
    executor: E,
    docker_path: String,
    image: String,
    resolved_image: String,
    container_id: String,
    stop_container: bool,
    workdir: String,
    additional_env: BTreeMap<String, String>,
    cleaned: bool,
}

impl DockerRunner<SystemCommandExecutor> {
    pub fn provision(config: &DockerRunnerConfig) -> Result<Self> {
        Self::provision_with(SystemCommandExecutor, config)
    }
}

impl<E: CommandExecutor> DockerRunner<E> {
    /// Pulls the image, pins it by digest, then creates and starts a container
    /// with a fresh workdir. Any failure removes the partially created container
    /// before the error is returned.
    pub fn provision_with(executor: E, config: &DockerRunnerConfig) -> Result<Self> {
        if config.image.trim().is_empty() {
            return Err(GenError::Provision {
                stage: ProvisionStage::Uncreated.as_str(),
                message: "container image was not specified".to_string(),
                source: None,
            });
        }

        let mut runner = Self {
            executor,
            docker_path: config.docker_path.clone(),
            image: config.image.clone(),
            resolved_image: String::new(),
            container_id: String::new(),
            stop_container: config.stop_container,
            workdir: String::new(),
            additional_env: BTreeMap::new(),
            cleaned: false,
        };

        let mut stage = ProvisionStage::Uncreated;
        match runner.advance(config, &mut stage) {
            Ok(()) => Ok(runner),
            Err(err) => {
                runner.rollback(stage);
                Err(err)
            }
        }
    }

    fn advance(&mut self, config: &DockerRunnerConfig, stage: &mut ProvisionStage) -> Result<()> {
        let platform_args: Vec<String> = config
            .platform
            .iter()
            .flat_map(|p| ["--platform".to_string(), p.clone()])
            .collect();

        let mut pull = vec!["pull".to_string()];
        pull.extend(platform_args.iter().cloned());
        pull.push(self.image.clone());
        self.docker(&pull).map_err(|e| {
            provision_error(
                *stage,
                format!(
                    "docker was unable to pull the toolchain container image '{}'",
                    self.image
                ),
                e,
            )
        })?;
        *stage = ProvisionStage::ImagePulled;

        let resolved = self
            .docker(&[
                "inspect".to_string(),
                "--format={{index .RepoDigests 0}}".to_string(),
                self.image.clone(),
            ])
            .map_err(|e| {
                provision_error(
                    *stage,
                    format!(
                        "failed to convert toolchain container image '{}' into a fully qualified image name by digest",
                        self.image
                    ),
                    e,
                )
            })?;
        if !resolved.contains("@sha256:") {
            return Err(GenError::Provision {
                stage: stage.as_str(),
                message: format!(
                    "image '{}' resolved to '{}' which is not a digest reference",
                    self.image, resolved
                ),
                source: None,
            });
        }
        info!(
            "Resolved toolchain image '{}' to fully qualified reference '{}'.",
            self.image, resolved
        );
        self.resolved_image = resolved;
        *stage = ProvisionStage::ImageResolved;

        let mut create = vec!["create".to_string(), "--rm".to_string()];
        create.extend(platform_args);
        create.extend([
            self.resolved_image.clone(),
            "sleep".to_string(),
            "infinity".to_string(),
        ]);
        let created = self.docker_output(&create).map_err(|e| {
            provision_error(
                *stage,
                "failed to create a container with the toolchain container image".to_string(),
                e,
            )
        })?;
        let cid = created.stdout.trim().to_string();
        if cid.len() != CONTAINER_ID_LEN {
            let failed_at = stage.as_str();
            // Docker may still have created a container. Remove it if its ID shows
            // up anywhere in the output.
            if let Some(id) = find_container_id(&created.combined()) {
                self.container_id = id;
                *stage = ProvisionStage::ContainerCreated;
            }
            return Err(GenError::Provision {
                stage: failed_at,
                message: format!(
                    "container ID '{}' extracted from the stdout of the container create command had unexpected length, got {}, want {}",
                    cid,
                    cid.len(),
                    CONTAINER_ID_LEN
                ),
                source: None,
            });
        }
        info!(
            "Created container ID {} for toolchain container image {}.",
            cid, self.resolved_image
        );
        self.container_id = cid;
        *stage = ProvisionStage::ContainerCreated;

        self.docker(&["start".to_string(), self.container_id.clone()])
            .map_err(|e| {
                provision_error(*stage, "failed to run the toolchain container".to_string(), e)
            })?;
        *stage = ProvisionStage::ContainerStarted;

        let workdir = container_workdir(config.exec_os);
        self.exec_cmd(&["mkdir", workdir]).map_err(|e| {
            provision_error(
                *stage,
                "failed to create workdir in toolchain container".to_string(),
                e,
            )
        })?;
        self.workdir = workdir.to_string();
        *stage = ProvisionStage::WorkdirProvisioned;

        *stage = ProvisionStage::Ready;
        debug!("Toolchain container {} is {}", self.container_id, stage);
        Ok(())
    }

    /// Undoes whatever `stage` left behind. Errors are logged only.
    fn rollback(&mut self, stage: ProvisionStage) {
        self.cleaned = true;
        let result = match stage {
            ProvisionStage::ContainerCreated => {
                self.docker(&["rm".to_string(), "-f".to_string(), self.container_id.clone()])
            }
            ProvisionStage::ContainerStarted | ProvisionStage::WorkdirProvisioned => self.docker(&[
                "stop".to_string(),
                "-t".to_string(),
                "0".to_string(),
                self.container_id.clone(),
            ]),
            _ => return,
        };
        if let Err(e) = result {
            warn!(
                "Failed to remove partially provisioned container {}: {}",
                self.container_id, e
            );
        }
    }

    fn docker(&self, args: &[String]) -> Result<String> {
        Ok(self.docker_output(args)?.stdout.trim().to_string())
    }

    fn docker_output(&self, args: &[String]) -> Result<CommandOutput> {
        run_checked(&self.executor, &self.docker_path, args, &ExecOptions::default())
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }
}

fn find_container_id(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .find(|token| {
            token.len() == CONTAINER_ID_LEN && token.bytes().all(|b| b.is_ascii_hexdigit())
        })
        .map(str::to_string)
}

fn provision_error(stage: ProvisionStage, message: String, source: GenError) -> GenError {
    GenError::Provision {
        stage: stage.as_str(),
        message,
        source: Some(Box::new(source)),
    }
}

impl<E: CommandExecutor> Runner for DockerRunner<E> {
    fn exec(&self, args: &[&str]) -> Result<CommandOutput> {
        if args.is_empty() {
            return Err(GenError::validation("no command given to execute"));
        }
        let mut full = vec!["exec".to_string()];
        if !self.workdir.is_empty() {
            full.push("-w".to_string());
            full.push(self.workdir.clone());
        }
        for (key, value) in &self.additional_env {
            full.push("-e".to_string());
            full.push(format!("{}={}", key, value));
        }
        full.push(self.container_id.clone());
        full.extend(args.iter().map(|a| a.to_string()));
        self.docker_output(&full)
    }

    fn copy_to(&self, src: &Path, dst: &str) -> Result<()> {
        self.docker(&[
            "cp".to_string(),
            src.display().to_string(),
            format!("{}:{}", self.container_id, dst),
        ])
        .map(|_| ())
    }

    fn copy_from(&self, src: &str, dst: &Path) -> Result<()> {
        self.docker(&[
            "cp".to_string(),
            format!("{}:{}", self.container_id, src),
            dst.display().to_string(),
        ])
        .map(|_| ())
    }

    fn get_env(&self) -> Result<BTreeMap<String, String>> {
        let out = self
            .docker(&[
                "inspect".to_string(),
                "-f".to_string(),
                "{{range $i, $v := .Config.Env}}{{println $v}}{{end}}".to_string(),
                self.resolved_image.clone(),
            ])
            .map_err(|e| GenError::Provision {
                stage: ProvisionStage::Ready.as_str(),
                message: "failed to inspect the docker image to get environment variables"
                    .to_string(),
                source: Some(Box::new(e)),
            })?;
        Ok(parse_env_lines(&out))
    }

    fn set_additional_env(&mut self, env: BTreeMap<String, String>) {
        self.additional_env = env;
    }

    fn additional_env(&self) -> &BTreeMap<String, String> {
        &self.additional_env
    }

    fn set_workdir(&mut self, workdir: &str) -> Result<()> {
        if workdir.trim().is_empty() {
            return Err(GenError::validation("container workdir cannot be empty"));
        }
        self.workdir = workdir.to_string();
        Ok(())
    }

    fn workdir(&self) -> &str {
        &self.workdir
    }

    fn resolved_image(&self) -> Option<&str> {
        Some(&self.resolved_image)
    }

    fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;

        if !self.stop_container {
            info!(
                "Not stopping container {} of image {} because the cleanup option was set to false.",
                self.container_id, self.resolved_image
            );
            return;
        }
        let stop = [
            "stop".to_string(),
            "-t".to_string(),
            "0".to_string(),
            self.container_id.clone(),
        ];
        if let Err(e) = self.docker(&stop) {
            warn!(
                "Failed to stop container {} of toolchain image {} but it's ok to ignore this error if config generation & extraction succeeded: {}",
                self.container_id, self.resolved_image, e
            );
        }
    }
}
