use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use rbeconfigsgen::monitoring::{LogSink, Reporter};
use rbeconfigsgen::options::PlatformToolchainsTemplateParams;
use rbeconfigsgen::{pipeline, GithubReleaseResolver, Options, RunnerKind};

/// Generates C++ and Java toolchain configs for remote build execution from a
/// toolchain container.
#[derive(Parser, Debug)]
#[command(name = "rbe_configs_gen", version)]
struct Cli {
    /// Docker image of the toolchain container to generate configs from.
    #[arg(long = "toolchain_container", env = "RBE_CONFIGS_GEN_TOOLCHAIN_CONTAINER", default_value = "")]
    toolchain_container: String,

    /// OS of the toolchain container, one of linux, windows.
    #[arg(long = "exec_os", env = "RBE_CONFIGS_GEN_EXEC_OS", default_value = "")]
    exec_os: String,

    /// OS of the artifacts the build produces, one of linux, windows.
    #[arg(long = "target_os", env = "RBE_CONFIGS_GEN_TARGET_OS", default_value = "")]
    target_os: String,

    /// Bazel release to generate configs for. Defaults to the latest release.
    #[arg(long = "bazel_version", env = "RBE_CONFIGS_GEN_BAZEL_VERSION")]
    bazel_version: Option<String>,

    /// Preinstalled bazel inside the toolchain container. Bazelisk is installed when unset.
    #[arg(long = "bazel_path", env = "RBE_CONFIGS_GEN_BAZEL_PATH")]
    bazel_path: Option<String>,

    /// Where to run config generation, one of docker, host.
    #[arg(long = "runner", env = "RBE_CONFIGS_GEN_RUNNER", default_value = "docker")]
    runner: RunnerKind,

    /// Platform passed to docker pull and docker create, e.g. linux/amd64.
    #[arg(long = "docker_platform", env = "RBE_CONFIGS_GEN_DOCKER_PLATFORM")]
    docker_platform: Option<String>,

    /// Path of the tarball to write the generated configs to.
    #[arg(long = "output_tarball", env = "RBE_CONFIGS_GEN_OUTPUT_TARBALL")]
    output_tarball: Option<PathBuf>,

    /// Root of the source tree to copy the generated configs into.
    #[arg(long = "output_src_root", env = "RBE_CONFIGS_GEN_OUTPUT_SRC_ROOT")]
    output_src_root: Option<PathBuf>,

    /// Path relative to --output_src_root to copy the configs into.
    #[arg(long = "output_config_path", env = "RBE_CONFIGS_GEN_OUTPUT_CONFIG_PATH", default_value = "")]
    output_config_path: String,

    /// Path of the JSON manifest describing the generated configs.
    #[arg(long = "output_manifest", env = "RBE_CONFIGS_GEN_OUTPUT_MANIFEST")]
    output_manifest: Option<PathBuf>,

    /// Comma separated exec constraints of the generated platform.
    #[arg(long = "exec_constraints", env = "RBE_CONFIGS_GEN_EXEC_CONSTRAINTS", value_delimiter = ',')]
    exec_constraints: Vec<String>,

    #[arg(long = "generate_cpp_configs", env = "RBE_CONFIGS_GEN_GENERATE_CPP_CONFIGS", action = ArgAction::Set, default_value_t = true)]
    generate_cpp_configs: bool,

    /// JSON file with the environment to set while generating C++ configs.
    #[arg(long = "cpp_env_json", env = "RBE_CONFIGS_GEN_CPP_ENV_JSON")]
    cpp_env_json: Option<PathBuf>,

    /// Name of the C++ toolchain target in the generated cc package.
    #[arg(long = "cpp_toolchain_target", env = "RBE_CONFIGS_GEN_CPP_TOOLCHAIN_TARGET", default_value = "")]
    cpp_toolchain_target: String,

    #[arg(long = "generate_java_configs", env = "RBE_CONFIGS_GEN_GENERATE_JAVA_CONFIGS", action = ArgAction::Set, default_value_t = true)]
    generate_java_configs: bool,

    /// Use local_java_runtime even for Bazel releases that default to java_runtime.
    #[arg(long = "java_use_local_runtime", env = "RBE_CONFIGS_GEN_JAVA_USE_LOCAL_RUNTIME", action = ArgAction::Set, default_value_t = false)]
    java_use_local_runtime: bool,

    /// Directory for intermediate files.
    #[arg(long = "temp_work_dir", env = "RBE_CONFIGS_GEN_TEMP_WORK_DIR")]
    temp_work_dir: Option<PathBuf>,

    /// Stop the toolchain container and delete intermediate files when done.
    #[arg(long = "cleanup", env = "RBE_CONFIGS_GEN_CLEANUP", action = ArgAction::Set, default_value_t = true)]
    cleanup: bool,

    #[arg(long = "enable_monitoring", env = "RBE_CONFIGS_GEN_ENABLE_MONITORING", action = ArgAction::Set, default_value_t = false)]
    enable_monitoring: bool,

    /// Project the run counters are reported under. Required with --enable_monitoring.
    #[arg(long = "monitoring_project_id", env = "RBE_CONFIGS_GEN_MONITORING_PROJECT_ID", default_value = "")]
    monitoring_project_id: String,

    /// Image name counters are labelled with. Defaults to --toolchain_container.
    #[arg(long = "monitoring_docker_image", env = "RBE_CONFIGS_GEN_MONITORING_DOCKER_IMAGE", default_value = "")]
    monitoring_docker_image: String,
}

impl Cli {
    fn options(&self) -> Options {
        let platform_params = if self.exec_constraints.is_empty() {
            None
        } else {
            Some(PlatformToolchainsTemplateParams {
                exec_constraints: self.exec_constraints.clone(),
                ..Default::default()
            })
        };
        Options {
            bazel_version: self.bazel_version.clone(),
            bazel_path: self.bazel_path.clone(),
            toolchain_container: self.toolchain_container.clone(),
            docker_platform: self.docker_platform.clone(),
            runner: self.runner,
            exec_os: self.exec_os.clone(),
            target_os: self.target_os.clone(),
            output_tarball: self.output_tarball.clone(),
            output_source_root: self.output_src_root.clone(),
            output_config_path: self.output_config_path.clone(),
            output_manifest: self.output_manifest.clone(),
            platform_params,
            gen_cpp_configs: self.generate_cpp_configs,
            cpp_gen_env_json: self.cpp_env_json.clone(),
            cpp_toolchain_target_name: self.cpp_toolchain_target.clone(),
            gen_java_configs: self.generate_java_configs,
            java_use_local_runtime: self.java_use_local_runtime,
            temp_work_dir: self.temp_work_dir.clone(),
            cleanup: self.cleanup,
            ..Options::default()
        }
    }

    fn reporter(&self) -> Result<Option<(Reporter<LogSink>, String)>> {
        if !self.enable_monitoring {
            return Ok(None);
        }
        if self.monitoring_project_id.is_empty() {
            bail!("--monitoring_project_id is required when --enable_monitoring is true");
        }
        let image = if self.monitoring_docker_image.is_empty() {
            self.toolchain_container.clone()
        } else {
            self.monitoring_docker_image.clone()
        };
        Ok(Some((
            Reporter::new(LogSink::new(&self.monitoring_project_id)),
            image,
        )))
    }
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(cli: &Cli) -> Result<()> {
    let reporter = cli.reporter()?;

    let mut options = cli.options();
    // An empty OS is reported by validation along with the other required options.
    if !options.exec_os.is_empty() {
        let os = options.exec_os.clone();
        options
            .apply_defaults(&os)
            .context("failed to apply default options")?;
    }
    let resolver = GithubReleaseResolver::new()?;
    options.validate(&resolver)?;

    let result = pipeline::run(&options);
    if let Some((reporter, image)) = &reporter {
        if let Err(e) = reporter.report_generation(image, result.is_ok()) {
            warn!("Failed to report config generation result: {}", e);
        }
    }
    let manifest = result?;

    if let Some(digest) = &manifest.configs_tarball_digest {
        info!("Configs tarball sha256 is {}", digest);
    }
    info!("Config generation was successful.");
    Ok(())
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        error!("Config generation failed: {:#}", e);
        std::process::exit(1);
    }
}
