// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::path::PathBuf;

use clap::Parser;
use dd_containerize::Config;

#[derive(Parser, Debug, Default)]
#[command(name = "dd-containerize")]
#[command(about = "Turn a running Linux process into a container image")]
pub struct Args {
    /// Config file (defaults to $DD_CONTAINERIZE_CONFIG, then /etc/datadog-agent/containerize.yaml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address the HTTP service listens on
    #[arg(long)]
    pub listen: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Args {
    /// Command line values take precedence over the file.
    pub fn apply(&self, config: &mut Config) {
        if let Some(listen) = &self.listen {
            config.listen_address = listen.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }

    /// Level used until the config file has been read.
    pub fn startup_log_level(&self) -> log::LevelFilter {
        self.log_level
            .as_deref()
            .and_then(|level| level.parse().ok())
            .unwrap_or(log::LevelFilter::Info)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let args = Args::try_parse_from(["dd-containerize"]).unwrap();
        assert_eq!(args.config, None);
        assert_eq!(args.listen, None);
        assert_eq!(args.log_level, None);
    }

    #[test]
    fn test_parse_all() {
        let args = Args::try_parse_from([
            "dd-containerize",
            "-c",
            "/tmp/containerize.yaml",
            "--listen",
            "127.0.0.1:9090",
            "--log-level=debug",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/tmp/containerize.yaml")));
        assert_eq!(args.listen.as_deref(), Some("127.0.0.1:9090"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_apply_overrides() {
        let args = Args {
            listen: Some("127.0.0.1:9090".to_string()),
            ..Default::default()
        };
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.listen_address, "127.0.0.1:9090");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_startup_log_level() {
        assert_eq!(Args::default().startup_log_level(), log::LevelFilter::Info);
        let args = Args {
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        assert_eq!(args.startup_log_level(), log::LevelFilter::Debug);
        let args = Args {
            log_level: Some("loud".to_string()),
            ..Default::default()
        };
        assert_eq!(args.startup_log_level(), log::LevelFilter::Info);
    }

    #[test]
    fn test_unknown_flag() {
        assert!(Args::try_parse_from(["dd-containerize", "--pid", "1"]).is_err());
    }
}
