use std::fmt;
use thiserror::Error;

pub type Result<T, E = GenError> = std::result::Result<T, E>;

/// Pipeline steps, used to label errors surfaced from [`crate::pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AcquireRunner,
    Stage,
    InstallBazel,
    GenerateCpp,
    GenerateJava,
    RenderTemplates,
    WriteTarball,
    CopyToSourceRoot,
    WriteManifest,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::AcquireRunner => "acquire execution environment",
            Step::Stage => "prepare local staging directory",
            Step::InstallBazel => "install bazel",
            Step::GenerateCpp => "generate C++ configs",
            Step::GenerateJava => "generate Java configs",
            Step::RenderTemplates => "render BUILD templates",
            Step::WriteTarball => "write configs tarball",
            Step::CopyToSourceRoot => "copy configs to source root",
            Step::WriteManifest => "write manifest",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum GenError {
    #[error("invalid options: {message}")]
    Validation { message: String },

    #[error("unable to determine the latest available Bazel release: {message}")]
    VersionResolution { message: String },

    #[error("failed to provision execution environment at stage '{stage}': {message}")]
    Provision {
        stage: &'static str,
        message: String,
        #[source]
        source: Option<Box<GenError>>,
    },

    #[error("failed to spawn '{program}'")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("command '{command}' exited with status {status}")]
    Command {
        command: String,
        status: i32,
        output: String,
    },

    #[error("invalid Bazel version '{version}': {message}")]
    Version { version: String, message: String },

    #[error("template error: {message}")]
    Template { message: String },

    #[error("{message}")]
    Io {
        message: String,
        source: std::io::Error,
    },

    #[error("toolchain environment: {message}")]
    Environment { message: String },

    #[error("step '{step}' failed")]
    Step {
        step: Step,
        #[source]
        source: Box<GenError>,
    },
}

impl GenError {
    pub fn validation(message: impl Into<String>) -> Self {
        GenError::Validation {
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        GenError::Io {
            message: message.into(),
            source,
        }
    }

    pub fn environment(message: impl Into<String>) -> Self {
        GenError::Environment {
            message: message.into(),
        }
    }

    pub fn template(message: impl Into<String>) -> Self {
        GenError::Template {
            message: message.into(),
        }
    }

    /// Wraps `self` with the pipeline step it occurred in.
    pub fn at(self, step: Step) -> Self {
        GenError::Step {
            step,
            source: Box::new(self),
        }
    }

    /// The pipeline step this error was raised in, if it was wrapped by one.
    pub fn step(&self) -> Option<Step> {
        match self {
            GenError::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}
