// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Parsing of `strace -f -y` output for open-family syscalls.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_till},
    character::complete::{char, digit1, space1},
    combinator::{map, opt, value},
    sequence::{delimited, terminated},
};
use normalize_path::NormalizePath;

/// Paths never worth copying into an image.
const DENIED_PREFIXES: &[&str] = &["/proc", "/sys", "/dev", "/run"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenCall {
    /// Directory a relative path is resolved against, when not the cwd.
    pub dir: Option<PathBuf>,
    pub path: PathBuf,
    pub failed: bool,
}

/// Paths seen by the traced process, split by syscall outcome.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Observed {
    pub opened: BTreeSet<PathBuf>,
    pub failed: BTreeSet<PathBuf>,
}

fn pid_prefix(input: &str) -> IResult<&str, Option<(&str, &str, &str, char, &str)>> {
    opt((tag("[pid"), space1, digit1, char(']'), space1)).parse(input)
}

fn syscall(input: &str) -> IResult<&str, &str> {
    terminated(
        alt((tag("openat2"), tag("openat"), tag("open"), tag("creat"))),
        char('('),
    )
    .parse(input)
}

// AT_FDCWD, or a descriptor decorated by -y as `3</etc/nginx>`.
fn dirfd(input: &str) -> IResult<&str, Option<PathBuf>> {
    terminated(
        alt((
            value(None, tag("AT_FDCWD")),
            map(
                (
                    digit1,
                    opt(delimited(char('<'), take_till(|c: char| c == '>'), char('>'))),
                ),
                |(_, dir): (&str, Option<&str>)| dir.map(PathBuf::from),
            ),
        )),
        tag(", "),
    )
    .parse(input)
}

fn quoted(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_till(|c: char| c == '"'), char('"')).parse(input)
}

fn call(input: &str) -> IResult<&str, (Option<PathBuf>, &str)> {
    let (input, _) = pid_prefix(input)?;
    let (input, name) = syscall(input)?;
    let (input, dir) = if name.starts_with("openat") {
        dirfd(input)?
    } else {
        (input, None)
    };
    let (input, path) = quoted(input)?;
    Ok((input, (dir, path)))
}

/// Parses one line of trace output. Lines for other syscalls, and calls split
/// across `<unfinished ...>`/`resumed` lines, yield `None`.
pub fn parse_line(line: &str) -> Option<OpenCall> {
    let (rest, (dir, path)) = call(line.trim_start()).ok()?;
    if path.is_empty() || rest.contains("<unfinished ...>") {
        return None;
    }
    let (_, result) = rest.rsplit_once(" = ")?;
    Some(OpenCall {
        dir,
        path: PathBuf::from(path),
        failed: result.trim_start().starts_with('-'),
    })
}

/// Collects the absolute paths of every open-family call in `output`,
/// dropping virtual filesystems, the scratch directory and the bare `/tmp`.
pub fn parse_output(output: &str, cwd: &Path, scratch: &Path) -> Observed {
    let mut observed = Observed::default();
    for call in output.lines().filter_map(parse_line) {
        let base = call.dir.as_deref().unwrap_or(cwd);
        let path = base.join(&call.path).normalize();
        if is_denied(&path, scratch) {
            continue;
        }
        if call.failed {
            observed.failed.insert(path);
        } else {
            observed.opened.insert(path);
        }
    }
    observed
}

fn is_denied(path: &Path, scratch: &Path) -> bool {
    path == Path::new("/tmp")
        || path == Path::new("/")
        || path.starts_with(scratch)
        || DENIED_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}
