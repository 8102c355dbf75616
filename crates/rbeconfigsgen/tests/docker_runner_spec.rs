use anyhow::Result;
use rbeconfigsgen::runner::{
    CommandOutput, DockerRunner, DockerRunnerConfig, ProvisionStage, ScriptedCommandExecutor,
};
use rbeconfigsgen::{GenError, Os, Runner};

const IMAGE: &str = "gcr.io/rbe/ubuntu:latest";
const DIGEST: &str = "gcr.io/rbe/ubuntu@sha256:9f2a";

fn cid() -> String {
    "c".repeat(64)
}

fn healthy() -> ScriptedCommandExecutor {
    ScriptedCommandExecutor::new()
        .respond("docker inspect --format", CommandOutput::success(DIGEST))
        .respond("docker create", CommandOutput::success(format!("{}\n", cid())))
}

fn provision_stage(err: &GenError) -> &'static str {
    match err {
        GenError::Provision { stage, .. } => *stage,
        other => panic!("expected a provisioning error, got {other:?}"),
    }
}

#[test]
fn provisions_pinned_container_with_workdir() -> Result<()> {
    let executor = healthy();
    let runner = DockerRunner::provision_with(
        executor.clone(),
        &DockerRunnerConfig::new(IMAGE, Os::Linux),
    )?;

    assert_eq!(runner.resolved_image(), Some(DIGEST));
    assert_eq!(runner.container_id(), cid());
    assert_eq!(runner.workdir(), "/workdir");
    assert_eq!(
        executor.command_lines(),
        vec![
            format!("docker pull {}", IMAGE),
            format!("docker inspect --format={{{{index .RepoDigests 0}}}} {}", IMAGE),
            format!("docker create --rm {} sleep infinity", DIGEST),
            format!("docker start {}", cid()),
            format!("docker exec {} mkdir /workdir", cid()),
        ]
    );
    Ok(())
}

#[test]
fn pull_failure_leaves_nothing_behind() {
    let executor = ScriptedCommandExecutor::new()
        .respond("docker pull", CommandOutput::failure("manifest unknown"));

    let err = DockerRunner::provision_with(
        executor.clone(),
        &DockerRunnerConfig::new(IMAGE, Os::Linux),
    )
    .err()
    .expect("pull failure is reported");

    assert_eq!(provision_stage(&err), ProvisionStage::Uncreated.as_str());
    assert_eq!(executor.command_lines().len(), 1);
}

#[test]
fn tag_without_digest_is_rejected_before_create() {
    let executor = ScriptedCommandExecutor::new()
        .respond("docker inspect --format", CommandOutput::success(IMAGE));

    let err = DockerRunner::provision_with(
        executor.clone(),
        &DockerRunnerConfig::new(IMAGE, Os::Linux),
    )
    .err()
    .expect("undigested reference is reported");

    assert!(err.to_string().contains("not a digest reference"));
    assert!(!executor
        .command_lines()
        .iter()
        .any(|line| line.starts_with("docker create")));
}

#[test]
fn unexpected_container_id_length_is_rejected() {
    let executor = ScriptedCommandExecutor::new()
        .respond("docker inspect --format", CommandOutput::success(DIGEST))
        .respond("docker create", CommandOutput::success("abc123"));

    let err = DockerRunner::provision_with(
        executor.clone(),
        &DockerRunnerConfig::new(IMAGE, Os::Linux),
    )
    .err()
    .expect("short container id is reported");

    assert!(err.to_string().contains("unexpected length, got 6, want 64"));
    assert!(!executor
        .command_lines()
        .iter()
        .any(|line| line.starts_with("docker start") || line.starts_with("docker rm")));
}

#[test]
fn platform_warning_on_stderr_is_not_part_of_the_container_id() -> Result<()> {
    let warning = "WARNING: The requested image's platform (linux/arm64) does not match the detected host platform (linux/amd64/v3) and no specific platform was requested\n";
    let executor = ScriptedCommandExecutor::new()
        .respond(
            "docker inspect --format",
            CommandOutput {
                status: 0,
                stdout: format!("{}\n", DIGEST),
                stderr: warning.to_string(),
            },
        )
        .respond(
            "docker create",
            CommandOutput {
                status: 0,
                stdout: format!("{}\n", cid()),
                stderr: warning.to_string(),
            },
        );
    let mut config = DockerRunnerConfig::new(IMAGE, Os::Linux);
    config.platform = Some("linux/arm64".to_string());

    let runner = DockerRunner::provision_with(executor.clone(), &config)?;

    assert_eq!(runner.resolved_image(), Some(DIGEST));
    assert_eq!(runner.container_id(), cid());
    assert_eq!(
        executor.command_lines().last().cloned(),
        Some(format!("docker exec {} mkdir /workdir", cid()))
    );
    Ok(())
}

#[test]
fn created_container_is_removed_when_id_is_buried_in_output() {
    let executor = ScriptedCommandExecutor::new()
        .respond("docker inspect --format", CommandOutput::success(DIGEST))
        .respond(
            "docker create",
            CommandOutput::success(format!("Unable to find image locally\n{}\n", cid())),
        );

    let err = DockerRunner::provision_with(
        executor.clone(),
        &DockerRunnerConfig::new(IMAGE, Os::Linux),
    )
    .err()
    .expect("noisy create output is reported");

    assert!(err.to_string().contains("unexpected length"));
    assert_eq!(provision_stage(&err), ProvisionStage::ImageResolved.as_str());
    let lines = executor.command_lines();
    assert_eq!(lines.last().cloned(), Some(format!("docker rm -f {}", cid())));
    assert!(!lines.iter().any(|line| line.starts_with("docker start")));
}

#[test]
fn start_failure_removes_created_container() {
    let executor = healthy().respond("docker start", CommandOutput::failure("no such image"));

    let err = DockerRunner::provision_with(
        executor.clone(),
        &DockerRunnerConfig::new(IMAGE, Os::Linux),
    )
    .err()
    .expect("start failure is reported");

    assert_eq!(provision_stage(&err), ProvisionStage::ContainerCreated.as_str());
    assert_eq!(
        executor.command_lines().last(),
        Some(&format!("docker rm -f {}", cid()))
    );
}

#[test]
fn workdir_failure_stops_started_container_even_without_cleanup() {
    let executor = healthy().respond("mkdir", CommandOutput::failure("read-only file system"));
    let mut config = DockerRunnerConfig::new(IMAGE, Os::Linux);
    config.stop_container = false;

    let err = DockerRunner::provision_with(executor.clone(), &config)
        .err()
        .expect("mkdir failure is reported");

    assert_eq!(provision_stage(&err), ProvisionStage::ContainerStarted.as_str());
    assert_eq!(
        executor.command_lines().last(),
        Some(&format!("docker stop -t 0 {}", cid()))
    );
}

#[test]
fn cleanup_stops_container_once() -> Result<()> {
    let executor = healthy();
    let mut runner = DockerRunner::provision_with(
        executor.clone(),
        &DockerRunnerConfig::new(IMAGE, Os::Linux),
    )?;

    runner.cleanup();
    runner.cleanup();

    let stops = executor
        .command_lines()
        .into_iter()
        .filter(|line| line.starts_with("docker stop"))
        .count();
    assert_eq!(stops, 1);
    Ok(())
}

#[test]
fn cleanup_failure_is_not_an_error() -> Result<()> {
    let executor = healthy().respond("docker stop", CommandOutput::failure("daemon gone"));
    let mut runner = DockerRunner::provision_with(
        executor.clone(),
        &DockerRunnerConfig::new(IMAGE, Os::Linux),
    )?;

    runner.cleanup();

    assert_eq!(
        executor.command_lines().last(),
        Some(&format!("docker stop -t 0 {}", cid()))
    );
    Ok(())
}

#[test]
fn disabled_cleanup_leaves_container_running() -> Result<()> {
    let executor = healthy();
    let mut config = DockerRunnerConfig::new(IMAGE, Os::Linux);
    config.stop_container = false;
    let mut runner = DockerRunner::provision_with(executor.clone(), &config)?;

    runner.cleanup();

    assert!(!executor
        .command_lines()
        .iter()
        .any(|line| line.starts_with("docker stop")));
    Ok(())
}

#[test]
fn get_env_reads_image_config() -> Result<()> {
    let executor = healthy().respond(
        "{{range $i, $v := .Config.Env}}",
        CommandOutput::success("PATH=/usr/local/bin:/usr/bin\nJAVA_HOME=/usr/lib/jvm/java-11\n"),
    );
    let runner = DockerRunner::provision_with(
        executor.clone(),
        &DockerRunnerConfig::new(IMAGE, Os::Linux),
    )?;

    let env = runner.get_env()?;

    assert_eq!(
        env.get("JAVA_HOME").map(String::as_str),
        Some("/usr/lib/jvm/java-11")
    );
    assert!(executor
        .command_lines()
        .last()
        .is_some_and(|line| line.ends_with(DIGEST)));
    Ok(())
}
