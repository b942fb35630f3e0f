// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Checks that the host carries the tools a conversion shells out to.

use log::{debug, warn};
use serde::Serialize;

use crate::errors::{Error, PackageStage};
use crate::exec::{CommandExecutor, CommandSpec, run_checked};

/// Packages providing the commands run during a conversion.
pub const REQUIRED_PACKAGES: &[&str] = &["net-tools", "rsync", "strace", "apt-rdepends", "dpkg-repack"];

const OS_RELEASE: &str = "/etc/os-release";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostReport {
    pub os: String,
    pub missing_packages: Vec<String>,
    pub docker_available: bool,
}

impl HostReport {
    pub fn message(&self) -> String {
        let mut parts = vec![format!("Host OS: {}", self.os)];
        if self.missing_packages.is_empty() {
            parts.push("All required packages installed".to_string());
        } else {
            parts.push(format!(
                "Missing required packages: {}",
                self.missing_packages.join(" ")
            ));
        }
        if !self.docker_available {
            parts.push("docker is not available".to_string());
        }
        parts.join(", ")
    }
}

pub async fn check(executor: &dyn CommandExecutor) -> Result<HostReport, Error> {
    let os = match tokio::fs::read_to_string(OS_RELEASE).await {
        Ok(contents) => pretty_name(&contents).unwrap_or_else(|| "unknown".to_string()),
        Err(e) => {
            warn!("could not read {OS_RELEASE}: {e}");
            "unknown".to_string()
        }
    };

    // dpkg-query exits 1 when any of the packages is unknown.
    let spec = CommandSpec::new("dpkg-query")
        .args(["-W", "--showformat=${Package}\t${Status}\n"])
        .args(REQUIRED_PACKAGES.iter().copied())
        .accept_codes(&[1])
        .tolerate_diagnostics();
    let output = run_checked(executor, &spec)
        .await
        .map_err(|source| Error::PackageQuery {
            stage: PackageStage::Prerequisites,
            source,
        })?;
    let missing_packages = missing(&output.stdout);

    let docker_available = run_checked(executor, &CommandSpec::new("docker").arg("version"))
        .await
        .inspect_err(|e| debug!("docker check failed: {e}"))
        .is_ok();

    Ok(HostReport {
        os,
        missing_packages,
        docker_available,
    })
}

/// `PRETTY_NAME` of an os-release file, unquoted.
fn pretty_name(contents: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let value = line.strip_prefix("PRETTY_NAME=")?;
        Some(value.trim().trim_matches('"').to_string())
    })
}

/// Required packages not reported as installed by `dpkg-query`.
fn missing(output: &str) -> Vec<String> {
    let installed: Vec<&str> = output
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .filter(|(_, status)| status.ends_with(" installed"))
        .map(|(package, _)| package.split(':').next().unwrap_or(package))
        .collect();
    REQUIRED_PACKAGES
        .iter()
        .filter(|package| !installed.contains(package))
        .map(|package| package.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedExecutor;

    #[test]
    fn test_pretty_name() {
        let contents = "NAME=\"Ubuntu\"\nPRETTY_NAME=\"Ubuntu 22.04.4 LTS\"\nID=ubuntu\n";
        assert_eq!(pretty_name(contents).as_deref(), Some("Ubuntu 22.04.4 LTS"));
        assert_eq!(pretty_name("ID=debian\n"), None);
    }

    #[test]
    fn test_missing() {
        let output = "net-tools\tinstall ok installed\n\
                      rsync\tinstall ok installed\n\
                      strace:amd64\tinstall ok installed\n\
                      apt-rdepends\tdeinstall ok config-files\n";
        assert_eq!(missing(output), vec!["apt-rdepends", "dpkg-repack"]);
    }

    #[tokio::test]
    async fn test_check_reports_missing_packages() {
        let executor = ScriptedExecutor::new();
        executor.on_output(
            &["dpkg-query"],
            1,
            "net-tools\tinstall ok installed\nrsync\tinstall ok installed\n",
            "dpkg-query: no packages found matching strace\n",
        );
        executor.on(&["docker", "version"], 0, "");

        let report = check(&executor).await.unwrap();
        assert_eq!(
            report.missing_packages,
            vec!["strace", "apt-rdepends", "dpkg-repack"]
        );
        assert!(report.docker_available);
        assert!(
            report
                .message()
                .contains("Missing required packages: strace apt-rdepends dpkg-repack")
        );
    }

    #[tokio::test]
    async fn test_check_fails_on_unexpected_status() {
        let executor = ScriptedExecutor::new();
        executor.on(&["dpkg-query"], 2, "");

        let err = check(&executor).await.unwrap_err();
        assert_eq!(err.kind(), "PackageQueryError");
    }

    #[tokio::test]
    async fn test_check_without_docker() {
        let executor = ScriptedExecutor::new();
        let installed: String = REQUIRED_PACKAGES
            .iter()
            .map(|p| format!("{p}\tinstall ok installed\n"))
            .collect();
        executor.on(&["dpkg-query"], 0, &installed);
        executor.on(&["docker"], 127, "");

        let report = check(&executor).await.unwrap();
        assert!(report.missing_packages.is_empty());
        assert!(!report.docker_available);
        assert!(report.message().ends_with("docker is not available"));
    }
}
