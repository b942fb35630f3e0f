// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Resolution and reduction of traced paths into a copyable set.

use std::collections::BTreeSet;
use std::io;
use std::path::{Component, Path, PathBuf};

use log::{debug, trace};
use tokio::task::JoinSet;

use super::strace::Observed;
use super::{OpenedFile, Symlink, TracedFileSet};
use crate::errors::Error;

/// Top-level directories whose deep paths may be generalized to a shared ancestor.
const GENERALIZABLE_ROOTS: &[&str] = &["home", "root", "opt", "usr", "var", "srv"];

/// Minimum number of components of an ancestor that paths are generalized to.
const MIN_SHARED_DEPTH: usize = 4;

struct Resolution {
    path: PathBuf,
    real: PathBuf,
    is_dir: bool,
}

/// A path that disappeared, or never existed, is not an error.
fn vanished(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

async fn resolve_one(path: PathBuf) -> Result<Option<Resolution>, Error> {
    let resolution_error = |source| Error::FileResolution {
        path: path.clone(),
        source,
    };
    let real = match tokio::fs::canonicalize(&path).await {
        Ok(real) => real,
        Err(e) if vanished(&e) => {
            trace!("{} vanished", path.display());
            return Ok(None);
        }
        Err(e) => return Err(resolution_error(e)),
    };
    let is_dir = match tokio::fs::metadata(&real).await {
        Ok(meta) => meta.is_dir(),
        Err(e) if vanished(&e) => return Ok(None),
        Err(e) => return Err(resolution_error(e)),
    };
    Ok(Some(Resolution { path, real, is_dir }))
}

/// Closest existing ancestor of a path, the root excluded.
async fn existing_ancestor(path: &Path) -> Option<PathBuf> {
    for ancestor in path.ancestors().skip(1) {
        if ancestor.parent().is_none() {
            return None;
        }
        if tokio::fs::metadata(ancestor)
            .await
            .is_ok_and(|meta| meta.is_dir())
        {
            return Some(ancestor.to_path_buf());
        }
    }
    None
}

/// Resolves every observed path and reduces the result to what an image
/// needs to recreate.
pub async fn resolve(observed: Observed) -> Result<TracedFileSet, Error> {
    let mut tasks = JoinSet::new();
    for path in observed.opened {
        tasks.spawn(resolve_one(path));
    }

    let mut resolved = BTreeSet::new();
    let mut symlinks = BTreeSet::new();
    let mut directories = BTreeSet::new();
    let mut symlink_directories = BTreeSet::new();

    while let Some(joined) = tasks.join_next().await {
        let resolution = joined.map_err(|e| Error::FileResolution {
            path: PathBuf::new(),
            source: io::Error::other(e),
        })??;
        let Some(Resolution { path, real, is_dir }) = resolution else {
            continue;
        };

        if real != path {
            if let Some(parent) = path.parent().filter(|p| p.parent().is_some()) {
                symlink_directories.insert(parent.to_path_buf());
            }
            symlinks.insert(Symlink {
                link_path: path,
                real_path: real.clone(),
            });
        }
        let directory = if is_dir {
            Some(real.as_path())
        } else {
            real.parent()
        };
        if let Some(directory) = directory.filter(|d| d.parent().is_some()) {
            directories.insert(directory.to_path_buf());
        }
        resolved.insert(real);
    }

    for path in &observed.failed {
        if let Some(ancestor) = existing_ancestor(path).await {
            directories.insert(ancestor);
        }
    }

    let shortened = shorten_paths(&resolved);
    debug!(
        "shortened {} resolved paths to {}",
        resolved.len(),
        shortened.len()
    );

    Ok(TracedFileSet {
        opened_files: classify(shortened).await?,
        symlinks: symlinks.into_iter().collect(),
        directories_to_create: minimize_directories(&directories),
        symlink_directories: minimize_directories(&symlink_directories),
    })
}

async fn classify(paths: BTreeSet<PathBuf>) -> Result<Vec<OpenedFile>, Error> {
    let mut tasks = JoinSet::new();
    for path in paths {
        tasks.spawn(async move {
            let meta = tokio::fs::metadata(&path).await;
            (path, meta)
        });
    }

    let mut files = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (path, meta) = joined.map_err(|e| Error::FileResolution {
            path: PathBuf::new(),
            source: io::Error::other(e),
        })?;
        match meta {
            Ok(meta) => files.push(OpenedFile {
                path,
                is_directory: meta.is_dir(),
            }),
            Err(e) if vanished(&e) => {}
            Err(source) => return Err(Error::FileResolution { path, source }),
        }
    }
    files.sort();
    Ok(files)
}

/// Keeps only paths that no shorter kept path is a prefix of.
pub fn minimize_directories(paths: &BTreeSet<PathBuf>) -> Vec<PathBuf> {
    let mut sorted: Vec<&PathBuf> = paths.iter().collect();
    sorted.sort_by_key(|p| (p.components().count(), p.as_os_str().len()));

    let mut kept: Vec<PathBuf> = Vec::new();
    for path in sorted {
        if !kept.iter().any(|k| path.starts_with(k)) {
            kept.push(path.clone());
        }
    }
    kept.sort();
    kept
}

fn normal_components(path: &Path) -> Vec<&std::ffi::OsStr> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name),
            _ => None,
        })
        .collect()
}

fn is_generalizable(path: &Path) -> bool {
    normal_components(path)
        .first()
        .and_then(|top| top.to_str())
        .is_some_and(|top| GENERALIZABLE_ROOTS.contains(&top))
}

fn shared_depth(a: &[&std::ffi::OsStr], b: &[&std::ffi::OsStr]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn shorten_once(paths: &BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
    let split: Vec<(&PathBuf, Vec<&std::ffi::OsStr>)> =
        paths.iter().map(|p| (p, normal_components(p))).collect();

    split
        .iter()
        .map(|(path, components)| {
            if !is_generalizable(path) {
                return (*path).clone();
            }
            let depth = split
                .iter()
                .filter(|(other, _)| other != path)
                .map(|(_, other)| shared_depth(components, other))
                .max()
                .unwrap_or(0);
            if depth >= MIN_SHARED_DEPTH {
                components
                    .iter()
                    .take(depth)
                    .fold(PathBuf::from("/"), |acc, c| acc.join(c))
            } else {
                (*path).clone()
            }
        })
        .collect()
}

/// Generalizes deep paths sharing an ancestor to that ancestor, until the
/// set stops changing.
pub fn shorten_paths(paths: &BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
    let mut current = paths.clone();
    loop {
        let next = shorten_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}
