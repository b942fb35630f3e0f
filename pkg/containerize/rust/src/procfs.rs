// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static PROC_ROOT: OnceLock<PathBuf> = OnceLock::new();

pub fn root_path() -> &'static Path {
    PROC_ROOT.get_or_init(|| {
        if let Ok(v) = env::var("HOST_PROC") {
            return v.into();
        }

        "/proc".into()
    })
}

/// Path of an entry in the process-filesystem directory of `pid`.
pub fn entry_path(pid: i32, entry: &str) -> PathBuf {
    root_path().join(pid.to_string()).join(entry)
}

#[derive(Debug)]
pub struct Cmdline {
    cmdline: String,
    separator: char,
}

impl Cmdline {
    pub fn new(mut cmdline: String) -> Self {
        // Processes that rewrote their command line can leave trailing NULs.
        let trim_len = cmdline.trim_end_matches('\0').len();
        cmdline.truncate(trim_len);

        // A rewritten command line (nginx: master process, gunicorn -n, ...)
        // may be packed into a single space separated string.
        let mut args = cmdline.split_terminator('\0');
        let separator = if let (Some(first), None) = (args.next(), args.next())
            && first.contains(' ')
        {
            ' '
        } else {
            '\0'
        };

        Cmdline { cmdline, separator }
    }

    pub fn get(pid: i32) -> Result<Self, io::Error> {
        let bytes = fs::read(entry_path(pid, "cmdline"))?;
        Ok(Self::new(String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub fn args(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.cmdline.split_terminator(self.separator)
    }

    pub fn is_empty(&self) -> bool {
        self.cmdline.is_empty()
    }

    /// The process overwrote its argument vector with a descriptive title.
    pub fn is_rewritten(&self) -> bool {
        self.separator == ' '
    }
}

/// Resolved executable of `pid`.
pub fn exe(pid: i32) -> Result<PathBuf, io::Error> {
    fs::read_link(entry_path(pid, "exe"))
}

/// Working directory of `pid`.
pub fn cwd(pid: i32) -> Result<PathBuf, io::Error> {
    fs::read_link(entry_path(pid, "cwd"))
}

/// Root directory of `pid`, as seen from the host.
pub fn root(pid: i32) -> Result<PathBuf, io::Error> {
    fs::read_link(entry_path(pid, "root"))
}

/// Pids of every process currently visible.
pub fn pids() -> Result<Vec<i32>, io::Error> {
    let mut pids = Vec::new();
    for entry in fs::read_dir(root_path())? {
        let entry = entry?;
        if let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        {
            pids.push(pid);
        }
    }
    Ok(pids)
}

/// Returns the final path component of `path` as a string.
pub fn basename(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}
