//! Drives one config generation session: acquire an environment, harvest the
//! C++ and Java autoconf output, render the BUILD files and package the result.
//!
//! The environment is released exactly once whichever step fails, and nothing
//! is written to the output destinations unless every generation step
//! succeeded.

use chrono::Utc;
use semver::Version;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

use crate::error::{GenError, Result, Step};
use crate::manifest::Manifest;
use crate::options::{Options, Os, PlatformToolchainsTemplateParams, RunnerKind};
use crate::output::{copy_to_source_root, extract_tarball, write_tarball};
use crate::runner::{DockerRunner, DockerRunnerConfig, HostRunner, Runner, RunnerSession};
use crate::templates::{
    cpp_toolchain_target, java_template, java_toolchain_target, render_java_build,
    render_platform_build,
};
use crate::version::parse_base_version;

const BAZELISK_RELEASE: &str = "v1.19.0";
const CPP_CONFIGS_TARBALL: &str = "cpp_configs.tar";
/// Files bazel adds to an external repository that don't belong in the configs.
const CPP_BOOKKEEPING_FILES: [&str; 2] = ["WORKSPACE", "WORKSPACE.bazel"];

/// Extra bazel flags needed from a given release on, so that external
/// repositories keep their WORKSPACE names.
const BAZEL_COMPAT_FLAGS: [(Version, &str); 2] = [
    (Version::new(7, 0, 0), "--noenable_bzlmod"),
    (Version::new(8, 0, 0), "--enable_workspace"),
];

/// How to invoke bazel inside the environment.
#[derive(Debug, Clone)]
pub struct BazelCommand {
    pub path: String,
    pub env: BTreeMap<String, String>,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JavaRuntime {
    pub java_home: String,
    pub version: String,
}

/// Acquires the environment named by `options` and generates configs in it.
#[instrument(skip_all, fields(toolchain_container = %options.toolchain_container))]
pub fn run(options: &Options) -> Result<Manifest> {
    info!("Acquiring execution environment ({:?})", options.runner);
    let runner = acquire_runner(options).map_err(|e| e.at(Step::AcquireRunner))?;
    generate(options, runner)
}

pub fn acquire_runner(options: &Options) -> Result<Box<dyn Runner>> {
    let exec_os = options.exec_os()?;
    match options.runner {
        RunnerKind::Docker => {
            let mut config = DockerRunnerConfig::new(options.toolchain_container.clone(), exec_os);
            config.platform = options.docker_platform.clone();
            config.stop_container = options.cleanup;
            Ok(Box::new(DockerRunner::provision(&config)?))
        }
        RunnerKind::Host => Ok(Box::new(HostRunner::new(
            options.temp_work_dir.as_deref(),
            options.cleanup,
        )?)),
    }
}

/// Generates configs inside an already acquired `runner`, which is cleaned up
/// before this returns.
pub fn generate(options: &Options, runner: Box<dyn Runner>) -> Result<Manifest> {
    let mut session = RunnerSession::new(runner);
    let staging = Staging::create(options).map_err(|e| e.at(Step::Stage))?;
    let exec_os = options.exec_os().map_err(|e| e.at(Step::Stage))?;
    let params = options
        .platform_params
        .clone()
        .ok_or_else(|| GenError::validation("platform params were not initialized"))
        .map_err(|e| e.at(Step::Stage))?;

    info!("Installing bazel");
    let bazel = install_bazel(&mut *session, options, exec_os, staging.scratch())
        .map_err(|e| e.at(Step::InstallBazel))?;

    let cpp_target = if options.gen_cpp_configs {
        info!("Generating C++ configs");
        let cc_dir = staging.configs().join("cc");
        generate_cpp_configs(&mut *session, options, &bazel, staging.scratch(), &cc_dir)
            .map_err(|e| e.at(Step::GenerateCpp))?;
        Some(cpp_toolchain_target(
            &options.output_config_path,
            &options.cpp_toolchain_target_name,
        ))
    } else {
        None
    };

    let java_runtime = if options.gen_java_configs {
        info!("Generating Java configs");
        Some(locate_java_runtime(&*session).map_err(|e| e.at(Step::GenerateJava))?)
    } else {
        None
    };

    let image = session
        .resolved_image()
        .unwrap_or(options.toolchain_container.as_str())
        .to_string();

    info!("Rendering BUILD files");
    render_builds(
        options,
        &params,
        &image,
        cpp_target.as_deref(),
        java_runtime.as_ref(),
        staging.configs(),
    )
    .map_err(|e| e.at(Step::RenderTemplates))?;

    let mut manifest = Manifest {
        bazel_version: options.bazel_version().to_string(),
        toolchain_container: image,
        exec_os: options.exec_os.clone(),
        target_os: options.target_os.clone(),
        cpp_toolchain_target: cpp_target,
        java_toolchain_target: java_runtime
            .as_ref()
            .map(|_| java_toolchain_target(&options.output_config_path)),
        configs_tarball_digest: None,
        generation_time: Utc::now(),
        upload_time: None,
    };

    if let Some(tarball) = &options.output_tarball {
        info!("Writing configs tarball to {}", tarball.display());
        let digest =
            write_tarball(staging.configs(), tarball).map_err(|e| e.at(Step::WriteTarball))?;
        manifest.configs_tarball_digest = Some(digest);
    }
    if let Some(root) = &options.output_source_root {
        info!(
            "Copying configs to {}/{}",
            root.display(),
            options.output_config_path
        );
        copy_to_source_root(staging.configs(), root, &options.output_config_path)
            .map_err(|e| e.at(Step::CopyToSourceRoot))?;
    }
    if let Some(path) = &options.output_manifest {
        info!("Writing manifest to {}", path.display());
        manifest.write(path).map_err(|e| e.at(Step::WriteManifest))?;
    }

    Ok(manifest)
}

fn bazel_compat_flags(bazel_version: &str) -> Result<Vec<String>> {
    let version = parse_base_version(bazel_version)?;
    Ok(BAZEL_COMPAT_FLAGS
        .iter()
        .filter(|(min, _)| version >= *min)
        .map(|(_, flag)| flag.to_string())
        .collect())
}

fn bazelisk_asset(os: Os) -> &'static str {
    match os {
        Os::Linux => "bazelisk-linux-amd64",
        Os::Windows => "bazelisk-windows-amd64.exe",
    }
}

/// Uses the preinstalled bazel when one was given, otherwise downloads Bazelisk
/// locally and copies it into the environment.
fn install_bazel(
    runner: &mut dyn Runner,
    options: &Options,
    os: Os,
    scratch: &Path,
) -> Result<BazelCommand> {
    let flags = bazel_compat_flags(options.bazel_version())?;
    if let Some(path) = options.bazel_path.as_deref().filter(|p| !p.is_empty()) {
        info!("Using preinstalled bazel at {}", path);
        return Ok(BazelCommand {
            path: path.to_string(),
            env: BTreeMap::new(),
            flags,
        });
    }

    let asset = bazelisk_asset(os);
    let local = scratch.join(asset);
    download_bazelisk(asset, &local)?;

    let dest = format!("{}/{}", runner.workdir().trim_end_matches('/'), asset);
    runner.copy_to(&local, &dest)?;
    if os == Os::Linux {
        runner.exec_cmd(&["chmod", "+x", dest.as_str()])?;
    }
    Ok(BazelCommand {
        path: dest,
        env: BTreeMap::from([(
            "USE_BAZEL_VERSION".to_string(),
            options.bazel_version().to_string(),
        )]),
        flags,
    })
}

fn download_bazelisk(asset: &str, dest: &Path) -> Result<()> {
    let url = format!(
        "https://github.com/bazelbuild/bazelisk/releases/download/{}/{}",
        BAZELISK_RELEASE, asset
    );
    info!("Downloading Bazelisk from {}", url);
    let to_io = |e: reqwest::Error| std::io::Error::other(e);
    let bytes = reqwest::blocking::get(&url)
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.bytes())
        .map_err(|e| GenError::io(format!("failed to download {}", url), to_io(e)))?;
    fs::write(dest, &bytes)
        .map_err(|e| GenError::io(format!("failed to write {}", dest.display()), e))
}

fn generate_cpp_configs(
    runner: &mut dyn Runner,
    options: &Options,
    bazel: &BazelCommand,
    scratch: &Path,
    dest: &Path,
) -> Result<()> {
    let workdir = runner.workdir().trim_end_matches('/').to_string();

    // An empty WORKSPACE makes the workdir a bazel workspace root.
    let workspace = scratch.join("WORKSPACE");
    fs::write(&workspace, "")
        .map_err(|e| GenError::io(format!("failed to write {}", workspace.display()), e))?;
    runner.copy_to(&workspace, &format!("{}/WORKSPACE", workdir))?;

    let mut env = options.cpp_env()?;
    env.extend(bazel.env.clone());
    runner.set_additional_env(env);

    let mut args = vec![bazel.path.as_str(), options.cpp_bazel_cmd.as_str()];
    args.extend(bazel.flags.iter().map(String::as_str));
    args.extend(options.cpp_config_targets.iter().map(String::as_str));
    runner.exec_cmd(&args)?;

    // Server startup chatter goes to stderr, which exec_cmd leaves out.
    let info = runner.exec_cmd(&[bazel.path.as_str(), "info", "output_base"])?;
    let output_base = info
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| GenError::Command {
            command: format!("{} info output_base", bazel.path),
            status: 0,
            output: info.clone(),
        })?
        .replace('\\', "/");
    let config_dir = format!("{}/external/{}", output_base, options.cpp_config_repo);
    info!("Extracting C++ configs from {}", config_dir);

    let remote_tar = format!("{}/{}", workdir, CPP_CONFIGS_TARBALL);
    runner.exec_cmd(&["tar", "-cf", remote_tar.as_str(), "-C", config_dir.as_str(), "."])?;
    let local_tar = scratch.join(CPP_CONFIGS_TARBALL);
    runner.copy_from(&remote_tar, &local_tar)?;
    runner.set_additional_env(BTreeMap::new());

    extract_tarball(&local_tar, dest)?;
    for name in CPP_BOOKKEEPING_FILES {
        let path = dest.join(name);
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| GenError::io(format!("failed to remove {}", path.display()), e))?;
        }
    }
    Ok(())
}

fn locate_java_runtime(runner: &dyn Runner) -> Result<JavaRuntime> {
    let env = runner.get_env()?;
    let java_home = env
        .get("JAVA_HOME")
        .map(|h| h.trim().trim_end_matches('/').to_string())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| {
            GenError::environment("JAVA_HOME is not set, unable to generate Java configs")
        })?;
    info!("Found JAVA_HOME={}", java_home);

    let java = format!("{}/bin/java", java_home);
    // The JVM prints its settings to stderr.
    let out = runner.exec(&[java.as_str(), "-XshowSettings:properties", "-version"])?;
    let version = parse_java_version(&out.combined()).ok_or_else(|| {
        GenError::environment(format!(
            "unable to find java.version in the output of '{} -XshowSettings:properties -version'",
            java
        ))
    })?;
    info!("Java version is {}", version);
    Ok(JavaRuntime { java_home, version })
}

/// Extracts the `java.version = X` property from `-XshowSettings:properties`.
pub fn parse_java_version(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        if key.trim() == "java.version" {
            Some(value.trim().to_string()).filter(|v| !v.is_empty())
        } else {
            None
        }
    })
}

fn render_builds(
    options: &Options,
    params: &PlatformToolchainsTemplateParams,
    image: &str,
    cpp_target: Option<&str>,
    java_runtime: Option<&JavaRuntime>,
    configs: &Path,
) -> Result<()> {
    let platform = render_platform_build(params, image, cpp_target)?;
    write_build(&configs.join("platforms"), &platform)?;

    if let Some(runtime) = java_runtime {
        let template = java_template(options.bazel_version(), options.java_use_local_runtime)?;
        info!("Using {:?} java BUILD template", template);
        let java = render_java_build(template, params, &runtime.java_home, &runtime.version)?;
        write_build(&configs.join("java"), &java)?;
    }
    Ok(())
}

fn write_build(dir: &Path, content: &str) -> Result<()> {
    fs::create_dir_all(dir)
        .map_err(|e| GenError::io(format!("failed to create {}", dir.display()), e))?;
    let path = dir.join("BUILD");
    fs::write(&path, content)
        .map_err(|e| GenError::io(format!("failed to write {}", path.display()), e))
}

/// Local working area: `configs/` holds the generated tree, `scratch/` holds
/// downloads and intermediate tarballs.
struct Staging {
    root: PathBuf,
    configs: PathBuf,
    scratch: PathBuf,
    delete: bool,
}

impl Staging {
    fn create(options: &Options) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("rbe_configs_gen_");
        let dir = match &options.temp_work_dir {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|e| GenError::io("failed to create a temporary working directory", e))?;
        let root = dir.keep();
        let configs = root.join("configs");
        let scratch = root.join("scratch");
        for dir in [&configs, &scratch] {
            fs::create_dir_all(dir)
                .map_err(|e| GenError::io(format!("failed to create {}", dir.display()), e))?;
        }
        Ok(Self {
            root,
            configs,
            scratch,
            delete: options.cleanup,
        })
    }

    fn configs(&self) -> &Path {
        &self.configs
    }

    fn scratch(&self) -> &Path {
        &self.scratch
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if !self.delete {
            info!(
                "Not deleting temporary working directory {} because the cleanup option was set to false.",
                self.root.display()
            );
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.root) {
            warn!("Failed to delete {}: {}", self.root.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn java_version_is_read_from_properties() {
        let out = "Property settings:\n    java.home = /usr/lib/jvm/java-11\n    java.version = 11.0.21\n    java.version.date = 2023-10-17\nopenjdk version \"11.0.21\"";
        assert_eq!(parse_java_version(out).as_deref(), Some("11.0.21"));
        assert_eq!(parse_java_version("openjdk version \"11\""), None);
    }

    #[test]
    fn compat_flags_follow_bazel_release() {
        assert!(bazel_compat_flags("6.4.0").unwrap().is_empty());
        assert_eq!(
            bazel_compat_flags("7.0.0-pre.20230724.1").unwrap(),
            vec!["--noenable_bzlmod"]
        );
        assert_eq!(
            bazel_compat_flags("8.1.0").unwrap(),
            vec!["--noenable_bzlmod", "--enable_workspace"]
        );
    }

    #[test]
    fn compat_flags_reject_malformed_versions() {
        assert!(matches!(
            bazel_compat_flags("7.x"),
            Err(GenError::Version { .. })
        ));
    }
}
