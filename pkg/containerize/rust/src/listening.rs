// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Listening TCP sockets and the processes owning them.

use std::collections::HashSet;

use log::debug;
use serde::Serialize;

use crate::errors::Error;
use crate::exec::{CommandExecutor, CommandSpec, run_checked};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListeningProcess {
    pub port: String,
    pub pid: String,
    pub program: String,
}

/// Ports and programs never offered for conversion.
#[derive(Debug, Clone, Copy)]
pub struct Filters<'a> {
    pub ignored_ports: &'a [String],
    pub ignored_programs: &'a [String],
}

pub async fn list_listening(
    executor: &dyn CommandExecutor,
    filters: Filters<'_>,
    pid: Option<&str>,
) -> Result<Vec<ListeningProcess>, Error> {
    let spec = CommandSpec::new("netstat").args(["--tcp", "--listening", "--numeric", "--program"]);
    let output = run_checked(executor, &spec)
        .await
        .map_err(|e| Error::Discovery {
            context: e.to_string(),
        })?;

    let processes = parse_listening(&output.stdout, filters, pid);
    debug!("found {} listening processes", processes.len());
    Ok(processes)
}

/// Parses `netstat --tcp --listening --numeric --program` output, keeping the
/// first socket of every pid.
pub fn parse_listening(
    table: &str,
    filters: Filters<'_>,
    pid: Option<&str>,
) -> Vec<ListeningProcess> {
    let mut seen = HashSet::new();
    table
        .lines()
        .filter_map(parse_line)
        .filter(|p| {
            !filters.ignored_ports.contains(&p.port)
                && !filters.ignored_programs.contains(&p.program)
        })
        .filter(|p| seen.insert(p.pid.clone()))
        .filter(|p| pid.is_none_or(|pid| p.pid == pid))
        .collect()
}

// Proto Recv-Q Send-Q Local-Address Foreign-Address State PID/Program
fn parse_line(line: &str) -> Option<ListeningProcess> {
    let mut fields = line.split_whitespace();
    let local = fields.nth(3)?;
    let owner = fields.nth(2)?;

    let (address, port) = local.rsplit_once(':')?;
    normalize_address(address)?;
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let (pid, program) = owner.split_once('/')?;
    if pid.is_empty() || !pid.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // "nginx: master" is split by whitespace into "nginx:" and "master".
    let program = program.trim_end_matches(':');
    if program.is_empty() {
        return None;
    }

    Some(ListeningProcess {
        port: port.to_string(),
        pid: pid.to_string(),
        program: program.to_string(),
    })
}

/// Keeps wildcard and loopback addresses, mapping the IPv6 wildcard to its
/// IPv4 form.
fn normalize_address(address: &str) -> Option<&str> {
    match address {
        "0.0.0.0" | "127.0.0.1" => Some(address),
        "::" | ":::" | "[::]" => Some("0.0.0.0"),
        _ => None,
    }
}
