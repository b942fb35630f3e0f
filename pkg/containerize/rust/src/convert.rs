// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::sync::Arc;

use log::info;
use serde::Serialize;

use crate::builder;
use crate::config::Config;
use crate::errors::Error;
use crate::exec::CommandExecutor;
use crate::image::{self, Target};
use crate::introspect::{ProcessImage, introspect};
use crate::listening::{self, Filters, ListeningProcess};
use crate::packages;
use crate::progress::{ProgressReporter, ProgressStore};
use crate::trace::{self, TracedFileSet};

const CONVERT_STAGES: usize = 6;
const INSPECT_STAGES: usize = 3;

/// What a process is made of, as reported by an inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inspection {
    #[serde(flatten)]
    pub image: ProcessImage,
    pub packages_sequence: Vec<String>,
    #[serde(flatten)]
    pub files: TracedFileSet,
}

/// Runs inspections and conversions of listening processes.
#[derive(Clone)]
pub struct Converter {
    config: Arc<Config>,
    executor: Arc<dyn CommandExecutor>,
    progress: Arc<dyn ProgressStore>,
}

impl Converter {
    pub fn new(
        config: Arc<Config>,
        executor: Arc<dyn CommandExecutor>,
        progress: Arc<dyn ProgressStore>,
    ) -> Self {
        Converter {
            config,
            executor,
            progress,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn executor(&self) -> &dyn CommandExecutor {
        self.executor.as_ref()
    }

    pub fn progress(&self) -> &dyn ProgressStore {
        self.progress.as_ref()
    }

    fn filters(&self) -> Filters<'_> {
        Filters {
            ignored_ports: &self.config.ignored_ports,
            ignored_programs: &self.config.ignored_programs,
        }
    }

    /// Every process currently accepting TCP connections.
    pub async fn list(&self) -> Result<Vec<ListeningProcess>, Error> {
        listening::list_listening(self.executor.as_ref(), self.filters(), None).await
    }

    async fn locate(&self, pid: i32) -> Result<ListeningProcess, Error> {
        let pid_str = pid.to_string();
        let mut located =
            listening::list_listening(self.executor.as_ref(), self.filters(), Some(&pid_str))
                .await?;
        match (located.pop(), located.is_empty()) {
            (Some(process), true) => Ok(process),
            _ => Err(Error::Discovery {
                context: format!("no unique listening socket found for pid {pid}"),
            }),
        }
    }

    /// Introspects, resolves packages for and traces `pid`.
    pub async fn inspect(&self, pid: i32, token: Option<String>) -> Result<Inspection, Error> {
        let mut progress = ProgressReporter::new(self.progress.clone(), token, INSPECT_STAGES);

        let image = introspect(pid)?;
        progress.stage_completed("introspect");

        let packages_sequence =
            packages::resolve(self.executor.as_ref(), &image.exe, &self.config.base_image).await?;
        progress.stage_completed("resolve-packages");

        let files = trace::trace(self.executor.clone(), &self.config, pid, &image).await?;
        progress.stage_completed("trace");

        Ok(Inspection {
            image,
            packages_sequence,
            files,
        })
    }

    /// Converts `pid` into an image and returns the image tag.
    pub async fn convert(&self, pid: i32, token: Option<String>) -> Result<String, Error> {
        let mut progress = ProgressReporter::new(self.progress.clone(), token, CONVERT_STAGES);
        info!("converting pid {pid}");

        let listening = self.locate(pid).await?;
        progress.stage_completed("locate");

        let image = introspect(pid)?;
        progress.stage_completed("introspect");

        let packages =
            packages::resolve(self.executor.as_ref(), &image.exe, &self.config.base_image).await?;
        progress.stage_completed("resolve-packages");

        let files = trace::trace(self.executor.clone(), &self.config, pid, &image).await?;
        progress.stage_completed("trace");

        let target = Target {
            base_image: &self.config.base_image,
            repository: &self.config.image_repository,
            program: &listening.program,
            port: &listening.port,
        };
        let spec = image::synthesize(target, &image, &packages, &files);
        let dir = self.config.build_dir(&context_name(&listening.program));
        builder::stage(self.executor.as_ref(), &dir, &spec).await?;
        progress.stage_completed("stage-context");

        builder::build(self.executor.as_ref(), &dir, &spec.tag).await?;
        progress.stage_completed("build");

        info!("converted pid {pid} into {}", spec.tag);
        Ok(spec.tag)
    }
}

/// Build context directory name for a program.
fn context_name(program: &str) -> String {
    let name: String = program
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        "program".to_string()
    } else {
        name
    }
}
