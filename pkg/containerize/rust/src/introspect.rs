// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::env;
use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Serialize;

use crate::errors::{Error, ProcfsEntry};
use crate::procfs::{self, Cmdline};

/// Snapshot of how a process was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessImage {
    pub cmdline: String,
    pub exe: PathBuf,
    pub bin: String,
    pub entrypoint_cmd: String,
    pub entrypoint_args: Vec<String>,
    pub cwd: PathBuf,
}

pub fn introspect(pid: i32) -> Result<ProcessImage, Error> {
    let procfs_error = |entry| {
        move |source| Error::Procfs {
            pid,
            entry,
            source,
        }
    };

    let cmdline = Cmdline::get(pid).map_err(procfs_error(ProcfsEntry::Cmdline))?;
    let exe = procfs::exe(pid).map_err(procfs_error(ProcfsEntry::Exe))?;
    let bin = procfs::basename(&exe).unwrap_or_default().to_string();

    let search_path = env::var_os("PATH");
    let entrypoint_cmd = if !bin.is_empty() && find_in_path(&bin, search_path.as_deref()).is_some() {
        bin.clone()
    } else {
        exe.to_string_lossy().into_owned()
    };

    let entrypoint_args = if cmdline.is_rewritten() {
        debug!("pid {pid} rewrote its command line, not reusing its arguments");
        Vec::new()
    } else {
        let base = procfs::entry_path(pid, "cwd");
        cmdline
            .args()
            .skip(1)
            .map(str::trim)
            .filter(|arg| !arg.is_empty())
            .map(|arg| resolve_argument(arg, &base))
            .collect()
    };

    let cwd = procfs::cwd(pid).map_err(procfs_error(ProcfsEntry::Cwd))?;

    Ok(ProcessImage {
        cmdline: cmdline.args().collect::<Vec<_>>().join(" "),
        exe,
        bin,
        entrypoint_cmd,
        entrypoint_args,
        cwd,
    })
}

/// Replaces an argument naming an existing file with its canonical path.
/// Anything else, including paths that fail to resolve, is kept verbatim.
fn resolve_argument(arg: &str, base: &Path) -> String {
    if arg.starts_with('-') {
        return arg.to_string();
    }
    match fs::canonicalize(base.join(arg)) {
        Ok(path) => path.to_string_lossy().into_owned(),
        Err(_) => arg.to_string(),
    }
}

/// Looks up an executable by name in a `PATH`-style search list.
pub fn find_in_path(name: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    env::split_paths(search_path?)
        .map(|dir| dir.join(name))
        .find(|candidate| {
            fs::metadata(candidate)
                .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        })
}
