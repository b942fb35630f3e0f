// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Detects when a traced program has settled down.
//!
//! A traced program rarely exits on its own, so tracing stops once the tracer
//! is observed sleeping, which usually means the program is blocked waiting
//! for connections.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

use crate::errors::Error;
use crate::exec::{CommandExecutor, CommandSpec, SpawnedProcess};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    /// Started, no probe issued yet.
    Tracing,
    /// A probe is in flight.
    Polling,
    /// The last probe saw the tracer running.
    Active,
    /// The tracer was seen sleeping.
    Quiescent,
    /// The tracer exited on its own.
    Exited,
    /// The timeout expired first.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Sleeping,
    Running,
    Gone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Tick,
    Probed(Probe),
    Exited,
    Deadline,
}

impl TraceState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TraceState::Quiescent | TraceState::Exited | TraceState::Aborted
        )
    }

    pub fn next(self, event: Event) -> TraceState {
        if self.is_terminal() {
            return self;
        }
        match event {
            Event::Deadline => TraceState::Aborted,
            Event::Exited | Event::Probed(Probe::Gone) => TraceState::Exited,
            Event::Tick => TraceState::Polling,
            Event::Probed(Probe::Sleeping) => TraceState::Quiescent,
            Event::Probed(Probe::Running) => TraceState::Active,
        }
    }
}

/// Reads the scheduler state of `pid` with `ps`.
async fn probe(executor: &dyn CommandExecutor, pid: u32) -> Result<Probe, Error> {
    let spec = CommandSpec::new("ps").args(["-o", "state=", "-p"]).arg(pid.to_string());
    let output = executor
        .output(&spec)
        .await
        .map_err(|e| Error::trace(format!("could not probe pid {pid}: {e}")))?;
    match output.code {
        // Interruptible or uninterruptible sleep.
        Some(0) if matches!(output.stdout.trim_start().chars().next(), Some('S' | 'D')) => {
            Ok(Probe::Sleeping)
        }
        Some(0) => Ok(Probe::Running),
        // ps exits with 1 when no process matched.
        Some(1) => Ok(Probe::Gone),
        code => Err(Error::trace(format!(
            "`{spec}` failed with {code:?}: {}",
            output.stderr.trim()
        ))),
    }
}

/// Drives the trace until the tracer is quiescent, exits, or `timeout`
/// expires. Probe ticks that find the previous probe still running are
/// skipped.
pub async fn watch(
    executor: Arc<dyn CommandExecutor>,
    child: &mut dyn SpawnedProcess,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<TraceState, Error> {
    let pid = child
        .id()
        .ok_or_else(|| Error::trace("tracer exited before it could be watched"))?;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let in_flight = Arc::new(Mutex::new(()));
    let (tx, mut rx) = mpsc::channel(1);
    let mut state = TraceState::Tracing;

    while !state.is_terminal() {
        let event = tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| Error::trace(format!("waiting for tracer: {e}")))?;
                debug!("tracer {pid} exited with {status:?}");
                Event::Exited
            }
            _ = &mut deadline => {
                warn!("tracer {pid} still active after {timeout:?}, stopping it");
                Event::Deadline
            }
            _ = ticker.tick() => {
                let Ok(guard) = in_flight.clone().try_lock_owned() else {
                    debug!("previous probe of {pid} still running, skipping tick");
                    continue;
                };
                let executor = executor.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    let _ = tx.send(probe(executor.as_ref(), pid).await).await;
                });
                Event::Tick
            }
            Some(result) = rx.recv() => Event::Probed(result?),
        };
        let next = state.next(event);
        if next != state {
            debug!("trace of {pid}: {state:?} -> {next:?}");
        }
        state = next;
    }

    info!("trace of {pid} finished: {state:?}");
    Ok(state)
}
