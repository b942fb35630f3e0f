// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Scripted command executor for tests.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::exec::{CommandExecutor, CommandOutput, CommandSpec, SpawnedProcess};

struct Rule {
    prefix: Vec<String>,
    output: CommandOutput,
}

/// Answers commands from canned outputs, matched by argv prefix in the order
/// the rules were added. Unmatched commands succeed with empty output.
/// Every invocation is recorded.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Vec<String>>>,
    next_pid: AtomicU32,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        ScriptedExecutor {
            next_pid: AtomicU32::new(40_000),
            ..Default::default()
        }
    }

    /// Replies to commands starting with `prefix` with `code` and `stdout`.
    pub fn on(&self, prefix: &[&str], code: i32, stdout: &str) -> &Self {
        self.on_output(prefix, code, stdout, "")
    }

    pub fn on_output(&self, prefix: &[&str], code: i32, stdout: &str, stderr: &str) -> &Self {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Rule {
                prefix: prefix.iter().map(|s| s.to_string()).collect(),
                output: CommandOutput {
                    code: Some(code),
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                },
            });
        self
    }

    /// Argument vectors of every command run so far.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a command starting with `prefix` was run.
    pub fn ran(&self, prefix: &[&str]) -> bool {
        self.calls().iter().any(|argv| starts_with(argv, prefix))
    }

    fn answer(&self, spec: &CommandSpec) -> CommandOutput {
        let argv: Vec<String> = spec.argv().map(str::to_string).collect();
        let output = self
            .rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|rule| starts_with(&argv, rule.prefix.as_slice()))
            .map(|rule| rule.output.clone())
            .unwrap_or_else(|| CommandOutput {
                code: Some(0),
                ..Default::default()
            });
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(argv);
        output
    }
}

fn starts_with<S: AsRef<str>>(argv: &[String], prefix: &[S]) -> bool {
    prefix.len() <= argv.len()
        && argv
            .iter()
            .zip(prefix)
            .all(|(arg, expected)| arg == expected.as_ref())
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn output(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        Ok(self.answer(spec))
    }

    async fn spawn(&self, spec: &CommandSpec) -> io::Result<Box<dyn SpawnedProcess>> {
        let output = self.answer(spec);
        Ok(Box::new(ScriptedProcess {
            pid: Some(self.next_pid.fetch_add(1, Ordering::Relaxed)),
            code: output.code,
            stderr: Some(output.stderr),
        }))
    }

    async fn launch_detached(&self, spec: &CommandSpec) -> io::Result<u32> {
        self.answer(spec);
        Ok(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }
}

/// A spawned command that has already finished with its scripted output.
struct ScriptedProcess {
    pid: Option<u32>,
    code: Option<i32>,
    stderr: Option<String>,
}

#[async_trait]
impl SpawnedProcess for ScriptedProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        self.pid = None;
        Ok(self.code)
    }

    async fn terminate(&mut self) -> io::Result<()> {
        self.pid = None;
        Ok(())
    }

    async fn collect_stderr(&mut self) -> String {
        self.stderr.take().unwrap_or_default()
    }
}
