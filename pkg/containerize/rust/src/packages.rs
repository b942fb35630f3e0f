// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Install-ordered package set required by an executable.

pub mod graph;

use std::collections::HashSet;
use std::path::Path;

use log::{debug, info};

use crate::errors::{Error, PackageStage};
use crate::exec::{CommandExecutor, CommandSpec, run_checked};
use graph::DependencyGraph;

/// One `"pkg" -> "dep"` edge of `apt-rdepends -d` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub pkg: String,
    pub dep: String,
}

const MERGED_DIRS: &[&str] = &["bin", "sbin", "lib", "lib32", "lib64", "libx32"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
    ReverseBuild,
}

impl Direction {
    fn stage(self) -> PackageStage {
        match self {
            Direction::Forward => PackageStage::Dependencies,
            Direction::Reverse => PackageStage::ReverseDependencies,
            Direction::ReverseBuild => PackageStage::ReverseBuildDependencies,
        }
    }
}

/// Packages to install, dependencies first, that the base image lacks.
/// An executable owned by no package yields an empty sequence.
pub async fn resolve(
    executor: &dyn CommandExecutor,
    exe: &Path,
    base_image: &str,
) -> Result<Vec<String>, Error> {
    let owners = owning_packages(executor, exe).await?;
    if owners.is_empty() {
        info!("{} is not owned by any package", exe.display());
        return Ok(Vec::new());
    }
    info!("{} is owned by {}", exe.display(), owners.join(", "));

    let mut edges = Vec::new();
    for package in &owners {
        edges.extend(query_dependencies(executor, package, Direction::Forward).await?);
    }

    let mut reverse = Vec::new();
    for package in &owners {
        reverse.extend(query_dependencies(executor, package, Direction::Reverse).await?);
    }

    let mut queried = HashSet::new();
    for Dependency { pkg, .. } in &reverse {
        if queried.insert(pkg.as_str()) {
            edges.extend(query_dependencies(executor, pkg, Direction::ReverseBuild).await?);
        }
    }

    let mut graph = DependencyGraph::new();
    for package in &owners {
        graph.add_node(package);
    }
    let dropped = edges
        .iter()
        .filter(|edge| !graph.add_dependency(&edge.pkg, &edge.dep))
        .count();
    debug!(
        "dependency graph has {} packages, {dropped} cyclic edges dropped",
        graph.len()
    );
    let order = graph.overall_order()?;

    let installed = base_image_packages(executor, base_image).await?;
    let sequence: Vec<String> = order
        .into_iter()
        .filter(|package| !installed.contains(package))
        .collect();
    info!(
        "{} packages to install on top of {base_image}: {}",
        sequence.len(),
        sequence.join(" ")
    );
    Ok(sequence)
}

async fn owning_packages(
    executor: &dyn CommandExecutor,
    exe: &Path,
) -> Result<Vec<String>, Error> {
    let mut candidates = vec![exe.to_path_buf()];
    // Merged-/usr systems install under /usr while dpkg may record the
    // unmerged location.
    if let Ok(unmerged) = exe.strip_prefix("/usr")
        && unmerged
            .components()
            .next()
            .and_then(|top| top.as_os_str().to_str())
            .is_some_and(|top| MERGED_DIRS.contains(&top))
    {
        candidates.push(Path::new("/").join(unmerged));
    }

    for candidate in candidates {
        let spec = CommandSpec::new("dpkg")
            .arg("-S")
            .arg(candidate.to_string_lossy())
            .accept_codes(&[1])
            .tolerate_diagnostics();
        let output = run_checked(executor, &spec)
            .await
            .map_err(|source| Error::PackageQuery {
                stage: PackageStage::Owners,
                source,
            })?;
        if output.code == Some(0) {
            return Ok(parse_owners(&output.stdout));
        }
    }
    Ok(Vec::new())
}

async fn query_dependencies(
    executor: &dyn CommandExecutor,
    package: &str,
    direction: Direction,
) -> Result<Vec<Dependency>, Error> {
    let mut spec = CommandSpec::new("apt-rdepends").arg(package);
    match direction {
        Direction::Forward => {}
        Direction::Reverse => spec = spec.arg("-r"),
        Direction::ReverseBuild => spec = spec.arg("--build-depends"),
    }
    // apt-rdepends always prints "Reading package lists..." on stderr.
    let spec = spec
        .args(["--state-follow=Installed", "--state-show=Installed", "-d"])
        .tolerate_diagnostics();

    let output = run_checked(executor, &spec)
        .await
        .map_err(|source| Error::PackageQuery {
            stage: direction.stage(),
            source,
        })?;
    Ok(parse_dependencies(&output.stdout))
}

/// Every package installed in `base_image`, listed by a single container run.
async fn base_image_packages(
    executor: &dyn CommandExecutor,
    base_image: &str,
) -> Result<HashSet<String>, Error> {
    let spec = CommandSpec::new("docker")
        .args(["run", "--rm", "--entrypoint", "dpkg-query", base_image])
        .args(["-W", "--showformat=${Package}\\n"])
        .tolerate_diagnostics();
    let output = run_checked(executor, &spec)
        .await
        .map_err(|source| Error::PackageQuery {
            stage: PackageStage::BaseImage,
            source,
        })?;
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Package names from `dpkg -S` output (`pkg[:arch][, pkg...]: /path`).
pub fn parse_owners(output: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    output
        .lines()
        .filter(|line| !line.starts_with("diversion by"))
        .filter_map(|line| line.split_once(": ").map(|(packages, _)| packages))
        .flat_map(|packages| packages.split(", "))
        .filter_map(|package| package.split(':').next())
        .map(str::trim)
        .filter(|package| !package.is_empty() && seen.insert(package.to_string()))
        .map(str::to_string)
        .collect()
}

/// Edges of `apt-rdepends -d` dot output. Lines that are not edges are ignored.
pub fn parse_dependencies(output: &str) -> Vec<Dependency> {
    output
        .lines()
        .filter_map(|line| line.split_once(" -> "))
        .filter_map(|(pkg, dep)| {
            let pkg = clean_node(pkg);
            let dep = clean_node(dep);
            (!pkg.is_empty() && !dep.is_empty()).then(|| Dependency {
                pkg: pkg.to_string(),
                dep: dep.to_string(),
            })
        })
        .collect()
}

fn clean_node(node: &str) -> &str {
    let node = node.split('[').next().unwrap_or_default();
    node.trim_matches(|c: char| c == '"' || c == ';' || c.is_whitespace())
}
