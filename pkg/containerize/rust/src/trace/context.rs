// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Whole-filesystem copy of the host that traced programs run in.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::errors::Error;
use crate::exec::{CommandExecutor, CommandSpec, run_checked};
use crate::procfs;

/// Written once the copy is complete.
const MARKER: &str = ".dd-containerize-rootfs";

/// Host directories left out of the copy. They are recreated empty.
const EXCLUDED: &[&str] = &["proc", "sys", "dev", "run", "tmp"];

/// Host directories bind-mounted while a trace runs.
const BIND_MOUNTS: &[&str] = &["proc", "dev"];

pub struct TraceContext<'a> {
    executor: &'a dyn CommandExecutor,
    rootfs: PathBuf,
    scratch: PathBuf,
}

impl<'a> TraceContext<'a> {
    pub fn new(executor: &'a dyn CommandExecutor, rootfs: PathBuf, scratch: PathBuf) -> Self {
        TraceContext {
            executor,
            rootfs,
            scratch,
        }
    }

    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Copies the host filesystem into the context, unless an earlier
    /// conversion already did.
    pub async fn ensure(&self) -> Result<(), Error> {
        if self.rootfs.join(MARKER).exists() {
            debug!("reusing tracing context at {}", self.rootfs.display());
            return Ok(());
        }

        info!("building tracing context at {}", self.rootfs.display());
        tokio::fs::create_dir_all(&self.rootfs)
            .await
            .map_err(|e| Error::trace(format!("creating {}: {e}", self.rootfs.display())))?;

        let mut spec = CommandSpec::new("rsync").args(["-a", "--one-file-system"]);
        for dir in EXCLUDED {
            spec = spec.arg(format!("--exclude=/{dir}"));
        }
        spec = spec
            .arg(format!("--exclude={}", self.scratch.display()))
            .arg(format!("--exclude={}", self.rootfs.display()))
            .arg("/")
            .arg(format!("{}/", self.rootfs.display()))
            // 24: source files vanished during the copy.
            .accept_codes(&[24])
            .tolerate_diagnostics();
        run_checked(self.executor, &spec)
            .await
            .map_err(|e| Error::trace(format!("copying host filesystem: {e}")))?;

        for dir in EXCLUDED {
            let path = self.rootfs.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| Error::trace(format!("creating {}: {e}", path.display())))?;
        }
        tokio::fs::write(self.rootfs.join(MARKER), b"")
            .await
            .map_err(|e| Error::trace(format!("marking tracing context: {e}")))?;
        Ok(())
    }

    /// Bind-mounts the host's virtual filesystems into the context.
    pub async fn mount(&self) -> Result<(), Error> {
        for dir in BIND_MOUNTS {
            let spec = CommandSpec::new("mount")
                .arg("--bind")
                .arg(format!("/{dir}"))
                .arg(self.rootfs.join(dir).to_string_lossy());
            run_checked(self.executor, &spec)
                .await
                .map_err(|e| Error::trace(format!("mounting /{dir}: {e}")))?;
        }
        Ok(())
    }

    /// Kills whatever still runs inside the context and unmounts it.
    /// Failures are logged: the context stays usable for the next trace.
    pub async fn teardown(&self) {
        self.kill_contained();
        for dir in BIND_MOUNTS.iter().rev() {
            let spec = CommandSpec::new("umount")
                .arg("-l")
                .arg(self.rootfs.join(dir).to_string_lossy());
            if let Err(e) = run_checked(self.executor, &spec).await {
                warn!("failed to unmount {}: {e}", self.rootfs.join(dir).display());
            }
        }
    }

    // Daemons leave the tracer's process group, so find them by root directory.
    fn kill_contained(&self) {
        let pids = match procfs::pids() {
            Ok(pids) => pids,
            Err(e) => {
                warn!("failed to list processes: {e}");
                return;
            }
        };
        for pid in pids {
            if procfs::root(pid).is_ok_and(|root| root == self.rootfs) {
                debug!("killing pid {pid} left in tracing context");
                if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
                    warn!("failed to kill pid {pid}: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedExecutor;

    #[tokio::test]
    async fn test_ensure_builds_once() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        let executor = ScriptedExecutor::new();
        executor.on(&["rsync"], 24, "");
        let context = TraceContext::new(&executor, rootfs.clone(), dir.path().to_path_buf());

        context.ensure().await.unwrap();
        assert!(rootfs.join(MARKER).exists());
        assert!(rootfs.join("proc").is_dir());
        assert!(rootfs.join("tmp").is_dir());
        let rsync = &executor.calls()[0];
        assert!(rsync.contains(&format!("--exclude={}", dir.path().display())));
        assert_eq!(rsync.last().unwrap(), &format!("{}/", rootfs.display()));

        context.ensure().await.unwrap();
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_copy_failure() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new();
        executor.on(&["rsync"], 23, "");
        let context = TraceContext::new(&executor, dir.path().join("rootfs"), dir.path().into());

        let err = context.ensure().await.unwrap_err();
        assert_eq!(err.kind(), "TraceError");
        assert!(!dir.path().join("rootfs").join(MARKER).exists());
    }

    #[tokio::test]
    async fn test_mount_and_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        let executor = ScriptedExecutor::new();
        executor.on(&["umount"], 32, "");
        let context = TraceContext::new(&executor, rootfs.clone(), dir.path().into());

        context.mount().await.unwrap();
        context.teardown().await;

        let proc_dir = rootfs.join("proc").to_string_lossy().into_owned();
        assert!(executor.ran(&["mount", "--bind", "/proc", proc_dir.as_str()]));
        assert!(executor.ran(&["umount", "-l", proc_dir.as_str()]));
    }
}
