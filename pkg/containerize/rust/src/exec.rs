// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Typed external command execution.
//!
//! Every host tool the converter relies on (netstat, dpkg, strace, docker, ...)
//! is invoked through [`CommandExecutor`] with an explicit argument vector.
//! Nothing is ever passed through a shell.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, trace, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::errors::CommandError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Output on stderr is not treated as a failure.
    pub tolerate_diagnostics: bool,
    /// Exit codes considered successful.
    pub accepted_codes: Vec<i32>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            tolerate_diagnostics: false,
            accepted_codes: vec![0],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn tolerate_diagnostics(mut self) -> Self {
        self.tolerate_diagnostics = true;
        self
    }

    pub fn accept_codes(mut self, codes: &[i32]) -> Self {
        self.accepted_codes.extend_from_slice(codes);
        self
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let argv: Vec<&str> = self.argv().collect();
        f.write_str(&argv.join(" "))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the command was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// A long-running child started with [`CommandExecutor::spawn`].
#[async_trait]
pub trait SpawnedProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Waits for the child to exit. Cancel safe.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Kills the child together with its process group and reaps it.
    async fn terminate(&mut self) -> io::Result<()>;

    /// Everything the child wrote to stderr. Only complete once the child exited.
    async fn collect_stderr(&mut self) -> String;
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs the command to completion and captures its output.
    async fn output(&self, spec: &CommandSpec) -> io::Result<CommandOutput>;

    /// Starts the command in its own process group, capturing stderr.
    async fn spawn(&self, spec: &CommandSpec) -> io::Result<Box<dyn SpawnedProcess>>;

    /// Starts the command detached from the converter and returns its pid.
    async fn launch_detached(&self, spec: &CommandSpec) -> io::Result<u32>;
}

/// Runs `spec` and turns a rejected exit code, or unexpected stderr output,
/// into an error.
pub async fn run_checked(
    executor: &dyn CommandExecutor,
    spec: &CommandSpec,
) -> Result<CommandOutput, CommandError> {
    debug!("running `{spec}`");
    let output = executor
        .output(spec)
        .await
        .map_err(|source| CommandError::Spawn {
            command: spec.to_string(),
            source,
        })?;
    trace!("`{spec}` stdout: {}", output.stdout);
    trace!("`{spec}` stderr: {}", output.stderr);

    if !output
        .code
        .is_some_and(|code| spec.accepted_codes.contains(&code))
    {
        return Err(CommandError::Status {
            command: spec.to_string(),
            code: output.code,
            stderr: output.stderr,
        });
    }

    if !spec.tolerate_diagnostics && !output.stderr.trim().is_empty() {
        return Err(CommandError::Diagnostics {
            command: spec.to_string(),
            stderr: output.stderr,
        });
    }

    Ok(output)
}

/// Executes commands on the host with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioExecutor;

impl TokioExecutor {
    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).stdin(Stdio::null());
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

#[async_trait]
impl CommandExecutor for TokioExecutor {
    async fn output(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        let output = Self::command(spec).kill_on_drop(true).output().await?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn spawn(&self, spec: &CommandSpec) -> io::Result<Box<dyn SpawnedProcess>> {
        let mut child = Self::command(spec)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;
        debug!("spawned `{spec}` (pid={:?})", child.id());

        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if let Err(e) = pipe.read_to_end(&mut buf).await {
                    warn!("failed to read child stderr: {e}");
                }
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        Ok(Box::new(TokioProcess { child, stderr }))
    }

    async fn launch_detached(&self, spec: &CommandSpec) -> io::Result<u32> {
        let mut child = Self::command(spec)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("detached child exited before reporting a pid"))?;

        // Reap the child whenever it exits so it never lingers as a zombie.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("detached child {pid} exited with {status}"),
                Err(e) => warn!("failed to wait for detached child {pid}: {e}"),
            }
        });

        Ok(pid)
    }
}

struct TokioProcess {
    child: Child,
    stderr: Option<JoinHandle<String>>,
}

#[async_trait]
impl SpawnedProcess for TokioProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }

    async fn terminate(&mut self) -> io::Result<()> {
        if let Some(pid) = self.child.id() {
            let pgid = i32::try_from(pid).map_err(io::Error::other)?;
            if let Err(e) = signal::killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                warn!("failed to kill process group {pgid}: {e}");
                self.child.start_kill()?;
            }
        }
        self.child.wait().await?;
        Ok(())
    }

    async fn collect_stderr(&mut self) -> String {
        match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                warn!("stderr reader task failed: {e}");
                String::new()
            }),
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_display() {
        let spec = CommandSpec::new("dpkg").args(["-S", "/usr/sbin/nginx"]);
        assert_eq!(spec.to_string(), "dpkg -S /usr/sbin/nginx");
        assert_eq!(spec.accepted_codes, vec![0]);
    }

    #[tokio::test]
    async fn test_run_checked_success() {
        let spec = CommandSpec::new("echo").arg("hello");
        let output = run_checked(&TokioExecutor, &spec).await.unwrap();
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.code, Some(0));
    }

    #[tokio::test]
    async fn test_run_checked_rejects_status() {
        let spec = CommandSpec::new("false");
        let err = run_checked(&TokioExecutor, &spec).await.unwrap_err();
        assert!(matches!(err, CommandError::Status { code: Some(1), .. }));

        let spec = CommandSpec::new("false").accept_codes(&[1]);
        assert!(run_checked(&TokioExecutor, &spec).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_checked_rejects_diagnostics() {
        let spec = CommandSpec::new("sh").args(["-c", "echo warning >&2"]);
        let err = run_checked(&TokioExecutor, &spec).await.unwrap_err();
        assert!(matches!(err, CommandError::Diagnostics { .. }));

        let spec = spec.tolerate_diagnostics();
        assert!(run_checked(&TokioExecutor, &spec).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_checked_missing_binary() {
        let spec = CommandSpec::new("/nonexistent/binary");
        let err = run_checked(&TokioExecutor, &spec).await.unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_spawn_collects_stderr() {
        let spec = CommandSpec::new("sh").args(["-c", "echo traced >&2"]);
        let mut child = TokioExecutor.spawn(&spec).await.unwrap();
        assert_eq!(child.wait().await.unwrap(), Some(0));
        assert_eq!(child.collect_stderr().await, "traced\n");
    }

    #[tokio::test]
    async fn test_spawn_terminate() {
        let spec = CommandSpec::new("sleep").arg("300");
        let mut child = TokioExecutor.spawn(&spec).await.unwrap();
        assert!(child.id().is_some());
        child.terminate().await.unwrap();
        assert!(child.id().is_none());
    }
}
