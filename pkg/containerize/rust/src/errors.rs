// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single external command invocation.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("could not run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with {}: {}", describe_code(*code), stderr.trim())]
    Status {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("`{command}` reported diagnostics: {}", stderr.trim())]
    Diagnostics { command: String, stderr: String },
}

fn describe_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

/// The process-filesystem entry that could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcfsEntry {
    Cmdline,
    Exe,
    Cwd,
}

impl fmt::Display for ProcfsEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcfsEntry::Cmdline => "cmdline",
            ProcfsEntry::Exe => "exe",
            ProcfsEntry::Cwd => "cwd",
        })
    }
}

/// Which package-manager query failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageStage {
    Owners,
    Dependencies,
    ReverseDependencies,
    ReverseBuildDependencies,
    BaseImage,
    Prerequisites,
}

impl fmt::Display for PackageStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PackageStage::Owners => "owner lookup",
            PackageStage::Dependencies => "dependency query",
            PackageStage::ReverseDependencies => "reverse dependency query",
            PackageStage::ReverseBuildDependencies => "reverse build dependency query",
            PackageStage::BaseImage => "base image membership check",
            PackageStage::Prerequisites => "prerequisite check",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("dependency cycle found through package {0}")]
    Cycle(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("listening socket discovery failed: {context}")]
    Discovery { context: String },
    #[error("could not read {entry} of pid {pid}: {source}")]
    Procfs {
        pid: i32,
        entry: ProcfsEntry,
        #[source]
        source: io::Error,
    },
    #[error("package {stage} failed: {source}")]
    PackageQuery {
        stage: PackageStage,
        #[source]
        source: CommandError,
    },
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("tracing failed: {context}")]
    Trace { context: String },
    #[error("could not resolve {}: {source}", path.display())]
    FileResolution {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("image build failed: {context}")]
    ImageBuild { context: String },
    #[error("Cannot find progress key {0}")]
    ProgressKey(String),
}

impl Error {
    /// Stable name of the error kind, as reported to HTTP clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Discovery { .. } => "DiscoveryError",
            Error::Procfs { .. } => "ProcfsError",
            Error::PackageQuery { .. } => "PackageQueryError",
            Error::Graph(_) => "GraphError",
            Error::Trace { .. } => "TraceError",
            Error::FileResolution { .. } => "FileResolutionError",
            Error::ImageBuild { .. } => "ImageBuildError",
            Error::ProgressKey(_) => "ProgressKeyError",
        }
    }

    pub(crate) fn trace(context: impl Into<String>) -> Self {
        Error::Trace {
            context: context.into(),
        }
    }

    pub(crate) fn image_build(context: impl Into<String>) -> Self {
        Error::ImageBuild {
            context: context.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        let err = Error::Procfs {
            pid: -1,
            entry: ProcfsEntry::Cmdline,
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(err.kind(), "ProcfsError");
        assert!(err.to_string().starts_with("could not read cmdline of pid -1"));

        let err = Error::from(GraphError::Cycle("libc6".to_string()));
        assert_eq!(err.kind(), "GraphError");
        assert_eq!(err.to_string(), "dependency cycle found through package libc6");
    }

    #[test]
    fn test_command_error_messages() {
        let err = CommandError::Status {
            command: "dpkg -S /bin/true".to_string(),
            code: Some(2),
            stderr: "boom\n".to_string(),
        };
        assert_eq!(err.to_string(), "`dpkg -S /bin/true` exited with status 2: boom");

        let err = CommandError::Status {
            command: "strace".to_string(),
            code: None,
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "`strace` exited with a signal: ");
    }
}
