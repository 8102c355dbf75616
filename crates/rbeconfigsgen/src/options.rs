use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

use crate::error::{GenError, Result};
use crate::version::{parse_base_version, VersionResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Linux,
    Windows,
}

impl Os {
    pub const ALL: [Os; 2] = [Os::Linux, Os::Windows];

    pub fn as_str(&self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::Windows => "windows",
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn valid_os_list() -> String {
    Os::ALL
        .iter()
        .map(Os::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl FromStr for Os {
    type Err = GenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linux" => Ok(Os::Linux),
            "windows" => Ok(Os::Windows),
            other => Err(GenError::validation(format!(
                "got unknown OS {:?}, want one of {}",
                other,
                valid_os_list()
            ))),
        }
    }
}

/// Where config generation runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    #[default]
    Docker,
    Host,
}

impl FromStr for RunnerKind {
    type Err = GenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "docker" => Ok(RunnerKind::Docker),
            "host" => Ok(RunnerKind::Host),
            other => Err(GenError::validation(format!(
                "got unknown runner {:?}, want one of docker, host",
                other
            ))),
        }
    }
}

/// Constraints and OS family written into the generated platform BUILD file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformToolchainsTemplateParams {
    pub exec_constraints: Vec<String>,
    pub target_constraints: Vec<String>,
    pub os_family: String,
}

/// Per exec OS values that fill the unset fields of [`Options`].
#[derive(Debug, Clone)]
pub struct DefaultOptions {
    pub platform_params: PlatformToolchainsTemplateParams,
    pub cpp_config_targets: Vec<String>,
    pub cpp_config_repo: String,
    pub cpp_bazel_cmd: String,
    pub cpp_gen_env: BTreeMap<String, String>,
    pub cpp_toolchain_target_name: String,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn default_exec_options(os: Os) -> DefaultOptions {
    match os {
        Os::Linux => DefaultOptions {
            platform_params: PlatformToolchainsTemplateParams {
                exec_constraints: strings(&[
                    "@platforms//os:linux",
                    "@platforms//cpu:x86_64",
                    "@bazel_tools//tools/cpp:clang",
                ]),
                target_constraints: strings(&["@platforms//os:linux", "@platforms//cpu:x86_64"]),
                os_family: "Linux".to_string(),
            },
            cpp_config_targets: strings(&["@local_config_cc//..."]),
            cpp_config_repo: "local_config_cc".to_string(),
            cpp_bazel_cmd: "build".to_string(),
            cpp_gen_env: [
                ("ABI_LIBC_VERSION", "glibc_2.19"),
                ("ABI_VERSION", "clang"),
                ("BAZEL_COMPILER", "clang"),
                ("BAZEL_HOST_SYSTEM", "i686-unknown-linux-gnu"),
                ("BAZEL_TARGET_CPU", "k8"),
                ("BAZEL_TARGET_LIBC", "glibc_2.19"),
                ("BAZEL_TARGET_SYSTEM", "x86_64-unknown-linux-gnu"),
                ("CC", "clang"),
                ("CC_TOOLCHAIN_NAME", "linux_gnu_x86"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            cpp_toolchain_target_name: "cc-compiler-k8".to_string(),
        },
        Os::Windows => DefaultOptions {
            platform_params: PlatformToolchainsTemplateParams {
                exec_constraints: strings(&["@platforms//os:windows", "@platforms//cpu:x86_64"]),
                target_constraints: strings(&["@platforms//os:windows", "@platforms//cpu:x86_64"]),
                os_family: "Windows".to_string(),
            },
            cpp_config_targets: strings(&["@local_config_cc//..."]),
            cpp_config_repo: "local_config_cc".to_string(),
            cpp_bazel_cmd: "query".to_string(),
            cpp_gen_env: BTreeMap::new(),
            cpp_toolchain_target_name: "cc-compiler-x64_windows".to_string(),
        },
    }
}

/// Options controlling one C++/Java toolchain config generation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Resolved to the latest release by [`Options::validate`] when unset.
    pub bazel_version: Option<String>,
    /// Preinstalled Bazel inside the environment. Bazelisk is installed when unset.
    pub bazel_path: Option<String>,
    pub toolchain_container: String,
    pub docker_platform: Option<String>,
    pub runner: RunnerKind,
    pub exec_os: String,
    pub target_os: String,

    pub output_tarball: Option<PathBuf>,
    pub output_source_root: Option<PathBuf>,
    /// Relative to `output_source_root`; empty means the root itself.
    pub output_config_path: String,
    pub output_manifest: Option<PathBuf>,

    pub platform_params: Option<PlatformToolchainsTemplateParams>,

    pub gen_cpp_configs: bool,
    pub cpp_config_targets: Vec<String>,
    pub cpp_config_repo: String,
    pub cpp_bazel_cmd: String,
    pub cpp_gen_env: BTreeMap<String, String>,
    pub cpp_gen_env_json: Option<PathBuf>,
    pub cpp_toolchain_target_name: String,

    pub gen_java_configs: bool,
    /// Forces the local_java_runtime based template where the Bazel version has it.
    pub java_use_local_runtime: bool,

    pub temp_work_dir: Option<PathBuf>,
    /// Stop the container and delete intermediate files when done.
    pub cleanup: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            bazel_version: None,
            bazel_path: None,
            toolchain_container: String::new(),
            docker_platform: None,
            runner: RunnerKind::Docker,
            exec_os: String::new(),
            target_os: String::new(),
            output_tarball: None,
            output_source_root: None,
            output_config_path: String::new(),
            output_manifest: None,
            platform_params: None,
            gen_cpp_configs: true,
            cpp_config_targets: Vec::new(),
            cpp_config_repo: String::new(),
            cpp_bazel_cmd: String::new(),
            cpp_gen_env: BTreeMap::new(),
            cpp_gen_env_json: None,
            cpp_toolchain_target_name: String::new(),
            gen_java_configs: true,
            java_use_local_runtime: false,
            temp_work_dir: None,
            cleanup: true,
        }
    }
}

impl Options {
    /// Fills OS dependent fields the caller left unset. Target constraints and the
    /// OS family always come from the defaults; exec constraints only when empty.
    pub fn apply_defaults(&mut self, os: &str) -> Result<()> {
        let defaults = default_exec_options(os.parse()?);

        let params = self.platform_params.get_or_insert_with(Default::default);
        if params.exec_constraints.is_empty() {
            params.exec_constraints = defaults.platform_params.exec_constraints;
        }
        params.target_constraints = defaults.platform_params.target_constraints;
        params.os_family = defaults.platform_params.os_family;

        if self.cpp_config_targets.is_empty() {
            self.cpp_config_targets = defaults.cpp_config_targets;
        }
        if self.cpp_config_repo.is_empty() {
            self.cpp_config_repo = defaults.cpp_config_repo;
        }
        if self.cpp_bazel_cmd.is_empty() {
            self.cpp_bazel_cmd = defaults.cpp_bazel_cmd;
        }
        // A JSON env file replaces the defaults entirely.
        if self.cpp_gen_env.is_empty() && self.cpp_gen_env_json.is_none() {
            self.cpp_gen_env = defaults.cpp_gen_env;
        }
        if self.cpp_toolchain_target_name.is_empty() {
            self.cpp_toolchain_target_name = defaults.cpp_toolchain_target_name;
        }
        Ok(())
    }

    /// Resolves an unset Bazel version, then checks the options are usable. The
    /// first violated precondition is reported.
    pub fn validate(&mut self, resolver: &dyn VersionResolver) -> Result<()> {
        if self.bazel_version.as_deref().unwrap_or("").is_empty() {
            let latest = resolver.latest()?;
            info!("Bazel version wasn't specified, using the latest release {}", latest);
            self.bazel_version = Some(latest);
        }
        self.check()?;
        self.log_resolved();
        Ok(())
    }

    fn check(&self) -> Result<()> {
        if self.toolchain_container.is_empty() {
            return Err(GenError::validation("toolchain container was not specified"));
        }
        if self.exec_os.is_empty() {
            return Err(GenError::validation("exec OS was not specified"));
        }
        if self.exec_os.parse::<Os>().is_err() {
            return Err(GenError::validation(format!(
                "invalid exec OS, got {:?}, want one of {}",
                self.exec_os,
                valid_os_list()
            )));
        }
        if self.target_os.is_empty() {
            return Err(GenError::validation("target OS was not specified"));
        }
        if self.target_os.parse::<Os>().is_err() {
            return Err(GenError::validation(format!(
                "invalid target OS, got {:?}, want one of {}",
                self.target_os,
                valid_os_list()
            )));
        }
        if let Err(e) = parse_base_version(self.bazel_version()) {
            return Err(GenError::validation(e.to_string()));
        }
        if self.output_tarball.is_none() && self.output_source_root.is_none() {
            return Err(GenError::validation(
                "at least one of output tarball or output source root must be specified or no output would be generated",
            ));
        }
        if self.output_source_root.is_none() && !self.output_config_path.is_empty() {
            return Err(GenError::validation(
                "output source root is required because output config path was specified",
            ));
        }
        if is_absolute_config_path(&self.output_config_path) {
            return Err(GenError::validation(format!(
                "output config path {:?} should be a relative path",
                self.output_config_path
            )));
        }
        if self.platform_params.is_none() {
            return Err(GenError::validation(
                "platform params were not initialized, apply defaults first",
            ));
        }
        if !self.gen_cpp_configs && !self.gen_java_configs {
            return Err(GenError::validation(
                "both C++ and Java config generation are disabled so there are no configs to generate",
            ));
        }
        if self.gen_cpp_configs && self.cpp_config_targets.is_empty() {
            return Err(GenError::validation(
                "C++ config generation is enabled but no C++ config targets were specified",
            ));
        }
        if self.gen_cpp_configs && self.cpp_bazel_cmd.is_empty() {
            return Err(GenError::validation(
                "C++ config generation is enabled but the C++ bazel command was not specified",
            ));
        }
        if !self.cpp_gen_env.is_empty() && self.cpp_gen_env_json.is_some() {
            return Err(GenError::validation(format!(
                "only one of C++ env {:?} or C++ env JSON file {:?} must be specified",
                self.cpp_gen_env, self.cpp_gen_env_json
            )));
        }
        Ok(())
    }

    fn log_resolved(&self) {
        info!("rbeconfigsgen options:");
        info!("BazelVersion={:?}", self.bazel_version);
        info!("BazelPath={:?}", self.bazel_path);
        info!("ToolchainContainer={:?}", self.toolchain_container);
        info!("Runner={:?}", self.runner);
        info!("ExecOS={:?}", self.exec_os);
        info!("TargetOS={:?}", self.target_os);
        info!("DockerPlatform={:?}", self.docker_platform);
        info!("OutputTarball={:?}", self.output_tarball);
        info!("OutputSourceRoot={:?}", self.output_source_root);
        info!("OutputConfigPath={:?}", self.output_config_path);
        info!("OutputManifest={:?}", self.output_manifest);
        info!("PlatformParams={:?}", self.platform_params);
        info!("GenCPPConfigs={}", self.gen_cpp_configs);
        info!("CPPConfigTargets={:?}", self.cpp_config_targets);
        info!("CPPConfigRepo={:?}", self.cpp_config_repo);
        info!("CppBazelCmd={:?}", self.cpp_bazel_cmd);
        info!("CppGenEnv={:?}", self.cpp_gen_env);
        info!("CppGenEnvJSON={:?}", self.cpp_gen_env_json);
        info!("CPPToolchainTargetName={:?}", self.cpp_toolchain_target_name);
        info!("GenJavaConfigs={}", self.gen_java_configs);
        info!("JavaUseLocalRuntime={}", self.java_use_local_runtime);
        info!("TempWorkDir={:?}", self.temp_work_dir);
        info!("Cleanup={}", self.cleanup);
    }

    pub fn exec_os(&self) -> Result<Os> {
        self.exec_os.parse()
    }

    pub fn target_os(&self) -> Result<Os> {
        self.target_os.parse()
    }

    pub fn bazel_version(&self) -> &str {
        self.bazel_version.as_deref().unwrap_or("")
    }

    /// Environment applied while generating C++ configs, read from the JSON file
    /// when one was given.
    pub fn cpp_env(&self) -> Result<BTreeMap<String, String>> {
        match &self.cpp_gen_env_json {
            Some(path) => read_env_json(path),
            None => Ok(self.cpp_gen_env.clone()),
        }
    }
}

fn read_env_json(path: &Path) -> Result<BTreeMap<String, String>> {
    let blob = fs::read(path).map_err(|e| {
        GenError::io(
            format!("unable to read C++ env JSON file {}", path.display()),
            e,
        )
    })?;
    serde_json::from_slice(&blob).map_err(|e| {
        GenError::validation(format!(
            "error parsing C++ env JSON file {} as a string to string map: {}",
            path.display(),
            e
        ))
    })
}

/// Config paths are Bazel package paths, so both separators count and a drive
/// prefix is absolute regardless of the host OS.
fn is_absolute_config_path(path: &str) -> bool {
    if path.starts_with('/') || path.starts_with('\\') {
        return true;
    }
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
