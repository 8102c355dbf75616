//! BUILD file templates and the rules that pick between them.

use semver::Version;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{GenError, Result};
use crate::options::PlatformToolchainsTemplateParams;
use crate::version::parse_base_version;

pub const PLATFORM_BUILD_TEMPLATE: &str = r#"package(default_visibility = ["//visibility:public"])

platform(
    name = "platform",
    constraint_values = [
{{ .ExecConstraints }}
    ],
    exec_properties = {
        "container-image": "docker://{{ .ToolchainContainer }}",
        "OSFamily": "{{ .OSFamily }}",
    },
    parents = ["@local_config_platform//:host"],
)
"#;

pub const CC_TOOLCHAIN_TEMPLATE: &str = r#"
toolchain(
    name = "cc-toolchain",
    exec_compatible_with = [
{{ .ExecConstraints }}
    ],
    target_compatible_with = [
{{ .TargetConstraints }}
    ],
    toolchain = "{{ .CppToolchainTarget }}",
    toolchain_type = "@bazel_tools//tools/cpp:toolchain_type",
)
"#;

pub const LEGACY_JAVA_BUILD_TEMPLATE: &str = r#"package(default_visibility = ["//visibility:public"])

java_runtime(
    name = "jdk",
    srcs = [],
    java_home = "{{ .JavaHome }}",
)
"#;

pub const JAVA_BUILD_TEMPLATE_LT7: &str = r#"load("@bazel_tools//tools/jdk:local_java_repository.bzl", "local_java_runtime")

package(default_visibility = ["//visibility:public"])

local_java_runtime(
    name = "jdk",
    java_home = "{{ .JavaHome }}",
    version = "{{ .JavaVersion }}",
)
"#;

pub const JAVA_BUILD_TEMPLATE: &str = r#"load("@rules_java//toolchains:local_java_repository.bzl", "local_java_runtime")

package(default_visibility = ["//visibility:public"])

alias(
    name = "jdk",
    actual = "rbe_jdk",
)

local_java_runtime(
    name = "rbe_jdk",
    java_home = "{{ .JavaHome }}",
    runtime_name = "rbe_jdk",
    version = "{{ .JavaVersion }}",
    exec_compatible_with = [
{{ .ExecConstraints }}
    ],
)
"#;

/// The java/BUILD flavors, one per range of Bazel releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JavaTemplate {
    /// `java_runtime`, for Bazel before 5.
    Legacy,
    /// `local_java_runtime` from `@bazel_tools`, Bazel 5 and 6.
    Intermediate,
    /// `local_java_runtime` from `@rules_java`, Bazel 7 onwards.
    Current,
}

impl JavaTemplate {
    pub fn content(&self) -> &'static str {
        match self {
            JavaTemplate::Legacy => LEGACY_JAVA_BUILD_TEMPLATE,
            JavaTemplate::Intermediate => JAVA_BUILD_TEMPLATE_LT7,
            JavaTemplate::Current => JAVA_BUILD_TEMPLATE,
        }
    }
}

/// Lowest Bazel release each template applies to, newest first.
const JAVA_TEMPLATE_BRACKETS: [(Version, JavaTemplate); 3] = [
    // Bazel 7 moved local_java_runtime into rules_java.
    (Version::new(7, 0, 0), JavaTemplate::Current),
    // Bazel 5 made local_java_runtime the way to declare a JDK.
    (Version::new(5, 0, 0), JavaTemplate::Intermediate),
    (Version::new(0, 0, 0), JavaTemplate::Legacy),
];

/// Picks the java/BUILD template for `bazel_version`. Forcing the local runtime
/// lifts the legacy bracket to [`JavaTemplate::Intermediate`] and never changes
/// the others. A forced selection with no version at all assumes the newest.
pub fn java_template(bazel_version: &str, use_local_runtime: bool) -> Result<JavaTemplate> {
    if use_local_runtime && bazel_version.trim().is_empty() {
        return Ok(JavaTemplate::Current);
    }
    let version = parse_base_version(bazel_version)?;
    let selected = JAVA_TEMPLATE_BRACKETS
        .iter()
        .find(|(min, _)| version >= *min)
        .map(|(_, template)| *template)
        .unwrap_or(JavaTemplate::Legacy);

    if use_local_runtime && selected == JavaTemplate::Legacy {
        return Ok(JavaTemplate::Intermediate);
    }
    Ok(selected)
}

/// Converts backslashes and trims slashes so the path can be used in a label.
pub fn normalize_config_path(config_path: &str) -> String {
    config_path.replace('\\', "/").trim_matches('/').to_string()
}

/// Label of the generated C++ toolchain, e.g. `//configs/linux/cc:cc-compiler-k8`.
pub fn cpp_toolchain_target(config_path: &str, target_name: &str) -> String {
    let path = normalize_config_path(config_path);
    if path.is_empty() {
        format!("//cc:{}", target_name)
    } else {
        format!("//{}/cc:{}", path, target_name)
    }
}

/// Label of the generated Java runtime.
pub fn java_toolchain_target(config_path: &str) -> String {
    let path = normalize_config_path(config_path);
    if path.is_empty() {
        "//java:jdk".to_string()
    } else {
        format!("//{}/java:jdk", path)
    }
}

/// Substitutes `{{ .Key }}` placeholders from a JSON context.
pub struct TemplateRenderer {
    context: HashMap<String, Value>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self {
            context: HashMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn render(&self, template: &str) -> Result<String> {
        let mut result = template.to_string();
        for (key, value) in &self.context {
            let placeholder = format!("{{{{ .{} }}}}", key);
            if result.contains(&placeholder) {
                let replacement = self.value_to_string(value, key)?;
                result = result.replace(&placeholder, &replacement);
            }
        }

        if let Some(start) = result.find("{{ .") {
            let end = result[start..]
                .find("}}")
                .map(|i| start + i + 2)
                .unwrap_or(result.len());
            return Err(GenError::template(format!(
                "unresolved placeholder {}",
                &result[start..end]
            )));
        }
        Ok(result)
    }

    fn value_to_string(&self, value: &Value, key: &str) -> Result<String> {
        match value {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            // Lists become Starlark list items, one per line.
            Value::Array(arr) => {
                let items: Result<Vec<String>> = arr
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => Ok(format!("        \"{}\",", s)),
                        _ => Err(GenError::template(format!(
                            "array element of '{}' is not a string",
                            key
                        ))),
                    })
                    .collect();
                Ok(items?.join("\n"))
            }
            Value::Object(_) => Err(GenError::template(format!(
                "object value of '{}' cannot be substituted",
                key
            ))),
            Value::Null => Ok(String::new()),
        }
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders platforms/BUILD. The C++ toolchain target is only emitted when a
/// C++ toolchain label is given.
pub fn render_platform_build(
    params: &PlatformToolchainsTemplateParams,
    toolchain_container: &str,
    cpp_toolchain_target: Option<&str>,
) -> Result<String> {
    let renderer = TemplateRenderer::new()
        .with("ExecConstraints", params.exec_constraints.clone())
        .with("TargetConstraints", params.target_constraints.clone())
        .with("OSFamily", params.os_family.clone())
        .with("ToolchainContainer", toolchain_container);

    let mut build = renderer.render(PLATFORM_BUILD_TEMPLATE)?;
    if let Some(target) = cpp_toolchain_target {
        build.push_str(
            &renderer
                .with("CppToolchainTarget", target)
                .render(CC_TOOLCHAIN_TEMPLATE)?,
        );
    }
    Ok(build)
}

/// Renders java/BUILD with the chosen template.
pub fn render_java_build(
    template: JavaTemplate,
    params: &PlatformToolchainsTemplateParams,
    java_home: &str,
    java_version: &str,
) -> Result<String> {
    TemplateRenderer::new()
        .with("JavaHome", java_home)
        .with("JavaVersion", java_version)
        .with("ExecConstraints", params.exec_constraints.clone())
        .render(template.content())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux_params() -> PlatformToolchainsTemplateParams {
        PlatformToolchainsTemplateParams {
            exec_constraints: vec![
                "@platforms//os:linux".to_string(),
                "@platforms//cpu:x86_64".to_string(),
            ],
            target_constraints: vec!["@platforms//os:linux".to_string()],
            os_family: "Linux".to_string(),
        }
    }

    #[test]
    fn renderer_reports_unresolved_placeholders() {
        let err = TemplateRenderer::new()
            .with("A", "x")
            .render("{{ .A }} {{ .B }}")
            .unwrap_err();
        assert!(err.to_string().contains("{{ .B }}"));
    }

    #[test]
    fn platform_build_includes_toolchain_only_with_cpp() {
        let params = linux_params();
        let without = render_platform_build(&params, "gcr.io/x@sha256:1", None).unwrap();
        assert!(without.contains("\"container-image\": \"docker://gcr.io/x@sha256:1\""));
        assert!(without.contains("        \"@platforms//cpu:x86_64\","));
        assert!(!without.contains("cc-toolchain"));

        let with =
            render_platform_build(&params, "gcr.io/x@sha256:1", Some("//cc:cc-compiler-k8"))
                .unwrap();
        assert!(with.contains("toolchain = \"//cc:cc-compiler-k8\""));
        assert!(with.contains("\"OSFamily\": \"Linux\""));
    }

    #[test]
    fn java_build_renders_home_and_version() {
        let build = render_java_build(
            JavaTemplate::Intermediate,
            &linux_params(),
            "/usr/lib/jvm/java-11",
            "11.0.21",
        )
        .unwrap();
        assert!(build.contains("java_home = \"/usr/lib/jvm/java-11\""));
        assert!(build.contains("version = \"11.0.21\""));
        assert!(build.contains("@bazel_tools//tools/jdk:local_java_repository.bzl"));
    }

    #[test]
    fn java_toolchain_target_uses_config_path() {
        assert_eq!(java_toolchain_target(""), "//java:jdk");
        assert_eq!(java_toolchain_target("configs\\linux"), "//configs/linux/java:jdk");
    }
}
