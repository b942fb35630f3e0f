// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Discovery of the files a program uses, by tracing it in a copy of the host.

pub mod context;
pub mod paths;
pub mod quiescence;
pub mod strace;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::Config;
use crate::errors::Error;
use crate::exec::{CommandExecutor, CommandSpec, run_checked};
use crate::introspect::ProcessImage;
use context::TraceContext;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenedFile {
    pub path: PathBuf,
    pub is_directory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Symlink {
    pub link_path: PathBuf,
    pub real_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TracedFileSet {
    pub opened_files: Vec<OpenedFile>,
    pub symlinks: Vec<Symlink>,
    pub directories_to_create: Vec<PathBuf>,
    pub symlink_directories: Vec<PathBuf>,
}

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stops the process `pid`, reruns it under strace inside the tracing
/// context and returns the files it used. The original process is started
/// again afterwards, whether tracing succeeded or not.
pub async fn trace(
    executor: Arc<dyn CommandExecutor>,
    config: &Config,
    pid: i32,
    image: &ProcessImage,
) -> Result<TracedFileSet, Error> {
    let context = TraceContext::new(executor.as_ref(), config.rootfs(), config.app_space.clone());
    context.ensure().await?;

    stop_process(executor.as_ref(), pid, &image.bin, config.trace.stop_timeout()).await?;
    let captured = capture(executor.clone(), &context, config, image).await;
    restart_process(executor.as_ref(), image).await;
    let captured = captured?;

    let observed = strace::parse_output(&captured, &image.cwd, &config.app_space);
    debug!(
        "trace of {} observed {} opened and {} missing paths",
        image.bin,
        observed.opened.len(),
        observed.failed.len()
    );
    paths::resolve(observed).await
}

/// Graceful service stop, then SIGTERM, then SIGKILL. Each accepted attempt
/// gets `timeout` for the process to exit before the next one is tried.
async fn stop_process(
    executor: &dyn CommandExecutor,
    pid: i32,
    bin: &str,
    timeout: Duration,
) -> Result<(), Error> {
    let pid_arg = pid.to_string();
    let attempts = [
        CommandSpec::new("service")
            .args([bin, "stop"])
            .tolerate_diagnostics(),
        CommandSpec::new("kill").args(["-TERM", pid_arg.as_str()]),
        CommandSpec::new("kill").args(["-KILL", pid_arg.as_str()]),
    ];

    for spec in &attempts {
        if let Err(e) = run_checked(executor, spec).await {
            debug!("could not stop pid {pid}: {e}");
            continue;
        }
        if wait_for_exit(executor, pid, timeout).await? {
            info!("stopped pid {pid} with `{spec}`");
            return Ok(());
        }
        warn!("pid {pid} still running {timeout:?} after `{spec}`");
    }
    Err(Error::trace(format!("cannot stop process {pid}")))
}

/// Polls `kill -0` until `pid` is gone. Returns false if it outlives `timeout`.
async fn wait_for_exit(
    executor: &dyn CommandExecutor,
    pid: i32,
    timeout: Duration,
) -> Result<bool, Error> {
    let deadline = tokio::time::Instant::now() + timeout;
    let probe = CommandSpec::new("kill").args(["-0".to_string(), pid.to_string()]);
    loop {
        let alive = executor
            .output(&probe)
            .await
            .map_err(|e| Error::trace(format!("checking pid {pid}: {e}")))?
            .code
            == Some(0);
        if !alive {
            return Ok(true);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

/// Runs the traced program until it settles and returns the tracer output.
async fn capture(
    executor: Arc<dyn CommandExecutor>,
    context: &TraceContext<'_>,
    config: &Config,
    image: &ProcessImage,
) -> Result<String, Error> {
    if let Err(e) = context.mount().await {
        context.teardown().await;
        return Err(e);
    }

    let spec = CommandSpec::new("chroot")
        .arg(context.rootfs().to_string_lossy())
        .arg("env")
        .arg(format!("--chdir={}", image.cwd.display()))
        .args(["strace", "-f", "-qq", "-y", "-s", "4096", "-e", "trace=%file", "--"])
        .arg(image.entrypoint_cmd.as_str())
        .args(image.entrypoint_args.iter().map(String::as_str));
    info!("tracing `{spec}`");

    let mut child = match executor.spawn(&spec).await {
        Ok(child) => child,
        Err(e) => {
            context.teardown().await;
            return Err(Error::trace(format!("starting `{spec}`: {e}")));
        }
    };

    let outcome = quiescence::watch(
        executor.clone(),
        child.as_mut(),
        config.trace.poll_interval(),
        config.trace.timeout(),
    )
    .await;
    if let Err(e) = child.terminate().await {
        warn!("failed to stop tracer: {e}");
    }
    context.teardown().await;
    let output = child.collect_stderr().await;

    outcome?;
    Ok(output)
}

/// Best effort: a process that cannot be restarted is only logged.
async fn restart_process(executor: &dyn CommandExecutor, image: &ProcessImage) {
    let service = CommandSpec::new("service")
        .args([image.bin.as_str(), "start"])
        .tolerate_diagnostics();
    match run_checked(executor, &service).await {
        Ok(_) => {
            info!("restarted {} with `{service}`", image.bin);
            return;
        }
        Err(e) => debug!("{e}"),
    }

    let spec = CommandSpec::new(image.entrypoint_cmd.as_str())
        .args(image.entrypoint_args.iter().map(String::as_str))
        .current_dir(&image.cwd);
    match executor.launch_detached(&spec).await {
        Ok(pid) => info!("restarted {} as pid {pid}", image.bin),
        Err(e) => warn!("failed to restart {}: {e}", image.bin),
    }
}
