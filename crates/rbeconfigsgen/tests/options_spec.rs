use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use rbeconfigsgen::{FixedVersion, GenError, Options, VersionResolver};

struct Unreachable;

impl VersionResolver for Unreachable {
    fn latest(&self) -> rbeconfigsgen::Result<String> {
        Err(GenError::VersionResolution {
            message: "connection refused".to_string(),
        })
    }
}

fn valid() -> Options {
    let mut options = Options {
        bazel_version: Some("7.1.0".to_string()),
        toolchain_container: "gcr.io/rbe/ubuntu:latest".to_string(),
        exec_os: "linux".to_string(),
        target_os: "linux".to_string(),
        output_tarball: Some(PathBuf::from("/tmp/configs.tar")),
        ..Options::default()
    };
    options.apply_defaults("linux").unwrap();
    options
}

fn validation_message(options: &mut Options) -> String {
    match options.validate(&FixedVersion("7.1.0".to_string())) {
        Err(GenError::Validation { message }) => message,
        other => panic!("expected a validation error, got {other:?}"),
    }
}

#[test]
fn linux_defaults_fill_unset_fields() {
    let options = valid();
    let params = options.platform_params.clone().unwrap();
    assert_eq!(params.os_family, "Linux");
    assert!(params
        .exec_constraints
        .contains(&"@bazel_tools//tools/cpp:clang".to_string()));
    assert_eq!(options.cpp_config_targets, vec!["@local_config_cc//..."]);
    assert_eq!(options.cpp_config_repo, "local_config_cc");
    assert_eq!(options.cpp_bazel_cmd, "build");
    assert_eq!(options.cpp_toolchain_target_name, "cc-compiler-k8");
    assert_eq!(
        options.cpp_gen_env.get("BAZEL_TARGET_CPU").map(String::as_str),
        Some("k8")
    );
}

#[test]
fn caller_values_survive_defaults_except_target_constraints() {
    let mut options = Options {
        cpp_toolchain_target_name: "cc-compiler-x64_windows_mingw".to_string(),
        cpp_gen_env_json: Some(PathBuf::from("env.json")),
        ..Options::default()
    };
    options.platform_params = Some(rbeconfigsgen::options::PlatformToolchainsTemplateParams {
        exec_constraints: vec!["@platforms//os:windows".to_string()],
        target_constraints: vec!["//custom:constraint".to_string()],
        os_family: "Custom".to_string(),
    });

    options.apply_defaults("windows").unwrap();

    let params = options.platform_params.unwrap();
    assert_eq!(params.exec_constraints, vec!["@platforms//os:windows"]);
    assert_eq!(
        params.target_constraints,
        vec!["@platforms//os:windows", "@platforms//cpu:x86_64"]
    );
    assert_eq!(params.os_family, "Windows");
    assert_eq!(
        options.cpp_toolchain_target_name,
        "cc-compiler-x64_windows_mingw"
    );
    assert!(options.cpp_gen_env.is_empty());
}

#[test]
fn unknown_os_is_rejected_by_defaults() {
    let err = Options::default().apply_defaults("darwin").unwrap_err();
    assert!(err.to_string().contains("want one of linux, windows"));
}

#[test]
fn missing_bazel_version_is_resolved() -> Result<()> {
    let mut options = valid();
    options.bazel_version = None;
    options.validate(&FixedVersion("8.0.1".to_string()))?;
    assert_eq!(options.bazel_version(), "8.0.1");

    let mut pinned = valid();
    pinned.validate(&Unreachable)?;
    assert_eq!(pinned.bazel_version(), "7.1.0");
    Ok(())
}

#[test]
fn malformed_resolved_version_is_rejected() {
    let mut options = valid();
    options.bazel_version = None;
    match options.validate(&FixedVersion("latest".to_string())) {
        Err(GenError::Validation { message }) => {
            assert!(message.contains("invalid Bazel version 'latest'"), "{message}")
        }
        other => panic!("expected a validation error, got {other:?}"),
    }
}

#[test]
fn resolution_failure_is_reported() {
    let mut options = valid();
    options.bazel_version = Some(String::new());
    assert!(matches!(
        options.validate(&Unreachable),
        Err(GenError::VersionResolution { .. })
    ));
}

#[test]
fn first_violated_precondition_is_reported() {
    let mut options = valid();
    options.toolchain_container.clear();
    options.exec_os = "darwin".to_string();
    assert_eq!(
        validation_message(&mut options),
        "toolchain container was not specified"
    );
}

#[test]
fn invalid_options_are_rejected() {
    let cases: Vec<(&str, Box<dyn Fn(&mut Options)>)> = vec![
        ("exec OS was not specified", Box::new(|o: &mut Options| o.exec_os.clear())),
        (
            "invalid exec OS",
            Box::new(|o: &mut Options| o.exec_os = "darwin".to_string()),
        ),
        (
            "invalid target OS",
            Box::new(|o: &mut Options| o.target_os = "freebsd".to_string()),
        ),
        (
            "invalid Bazel version '7.x'",
            Box::new(|o: &mut Options| o.bazel_version = Some("7.x".to_string())),
        ),
        (
            "invalid Bazel version '7.0'",
            Box::new(|o: &mut Options| o.bazel_version = Some("7.0".to_string())),
        ),
        (
            "no output would be generated",
            Box::new(|o: &mut Options| o.output_tarball = None),
        ),
        (
            "output source root is required",
            Box::new(|o: &mut Options| o.output_config_path = "configs/linux".to_string()),
        ),
        (
            "should be a relative path",
            Box::new(|o: &mut Options| {
                o.output_source_root = Some(PathBuf::from("/src"));
                o.output_config_path = "/configs".to_string();
            }),
        ),
        (
            "platform params were not initialized",
            Box::new(|o: &mut Options| o.platform_params = None),
        ),
        (
            "no configs to generate",
            Box::new(|o: &mut Options| {
                o.gen_cpp_configs = false;
                o.gen_java_configs = false;
            }),
        ),
        (
            "no C++ config targets",
            Box::new(|o: &mut Options| o.cpp_config_targets.clear()),
        ),
        (
            "C++ bazel command was not specified",
            Box::new(|o: &mut Options| o.cpp_bazel_cmd.clear()),
        ),
        (
            "only one of C++ env",
            Box::new(|o: &mut Options| o.cpp_gen_env_json = Some(PathBuf::from("env.json"))),
        ),
    ];

    for (want, mutate) in cases {
        let mut options = valid();
        mutate(&mut options);
        let message = validation_message(&mut options);
        assert!(
            message.contains(want),
            "expected {want:?} in {message:?}"
        );
    }
}

#[test]
fn cpp_only_generation_does_not_need_java() -> Result<()> {
    let mut options = valid();
    options.gen_java_configs = false;
    options.validate(&Unreachable)?;

    let mut java_only = valid();
    java_only.gen_cpp_configs = false;
    java_only.cpp_config_targets.clear();
    java_only.validate(&Unreachable)?;
    Ok(())
}

#[test]
fn cpp_env_is_read_from_json_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("env.json");
    fs::write(&path, r#"{"CC": "gcc", "BAZEL_COMPILER": "gcc"}"#)?;

    let mut options = Options {
        cpp_gen_env_json: Some(path.clone()),
        ..Options::default()
    };
    options.apply_defaults("linux")?;

    assert!(options.cpp_gen_env.is_empty());
    assert_eq!(
        options.cpp_env()?,
        BTreeMap::from([
            ("BAZEL_COMPILER".to_string(), "gcc".to_string()),
            ("CC".to_string(), "gcc".to_string()),
        ])
    );

    fs::write(&path, "[1, 2]")?;
    assert!(matches!(
        options.cpp_env(),
        Err(GenError::Validation { .. })
    ));
    Ok(())
}
