// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "/etc/datadog-agent/containerize.yaml";

pub fn config_path() -> PathBuf {
    std::env::var("DD_CONTAINERIZE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_address: String,
    pub log_level: String,
    /// Scratch root holding the tracing context and one build context per program.
    pub app_space: PathBuf,
    pub base_image: String,
    pub image_repository: String,
    pub ignored_ports: Vec<String>,
    pub ignored_programs: Vec<String>,
    pub trace: TraceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_address: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
            app_space: PathBuf::from("/var/lib/dd-containerize"),
            base_image: "dd-agent/baseimage".to_string(),
            image_repository: "dd-agent".to_string(),
            ignored_ports: vec!["22".to_string(), "111".to_string()],
            ignored_programs: vec!["rpc.statd".to_string()],
            trace: TraceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
    /// How long to wait for the target process to disappear once stopped.
    pub stop_timeout_secs: u64,
    pub rootfs: Option<PathBuf>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            poll_interval_ms: 2000,
            timeout_secs: 300,
            stop_timeout_secs: 10,
            rootfs: None,
        }
    }
}

impl TraceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Config {
    /// Loads the configuration file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(
                "config file {} does not exist, using defaults",
                path.display()
            );
            return Ok(Config::default());
        }

        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        debug!("loaded config from {}: {config:?}", path.display());
        Ok(config)
    }

    pub fn log_level(&self) -> Result<log::Level> {
        log::Level::from_str(&self.log_level)
            .with_context(|| format!("invalid log level: {}", self.log_level))
    }

    /// Copy of the host filesystem the traced program runs in.
    pub fn rootfs(&self) -> PathBuf {
        self.trace
            .rootfs
            .clone()
            .unwrap_or_else(|| self.app_space.join("rootfs"))
    }

    /// Build context directory of a program. Never the tracing rootfs, which
    /// staging would otherwise wipe.
    pub fn build_dir(&self, program: &str) -> PathBuf {
        let dir = self.app_space.join(program);
        if dir == self.rootfs() {
            return self.app_space.join(format!("{program}-build"));
        }
        dir
    }

    /// Never offer the converter's own socket for conversion.
    pub fn ignore_port(&mut self, port: u16) {
        let port = port.to_string();
        if !self.ignored_ports.contains(&port) {
            self.ignored_ports.push(port);
        }
    }
}
