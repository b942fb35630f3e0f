// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::undocumented_unsafe_blocks)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dd_containerize::exec::TokioExecutor;
use dd_containerize::progress::InMemoryProgressStore;
use dd_containerize::server::{handle_request, internal_error};
use dd_containerize::{Config, Converter, config};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{error, info};
use simple_logger::SimpleLogger;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};

mod cli;

use cli::Args;

async fn run(mut config: Config) -> Result<()> {
    let listener = TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("could not listen on {}", config.listen_address))?;
    let local = listener.local_addr().context("could not read listening address")?;
    info!("Listening on {local}");
    config.ignore_port(local.port());

    let converter = Converter::new(
        Arc::new(config),
        Arc::new(TokioExecutor),
        Arc::new(InMemoryProgressStore::new()),
    );

    // Setup signal handlers
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, peer) = accept_result?;
                let io = TokioIo::new(stream);
                let converter = converter.clone();

                tokio::task::spawn(async move {
                    if let Err(err) = http1::Builder::new()
                        .serve_connection(
                            io,
                            service_fn(|req| {
                                let converter = converter.clone();
                                async move {
                                    Ok::<_, anyhow::Error>(handle_request(converter, req).await.unwrap_or_else(|e| {
                                        error!("Request handling failed: {e}");
                                        internal_error()
                                    }))
                                }
                            }),
                        )
                        .await
                    {
                        error!("Error serving connection from {peer}: {err}");
                    }
                });
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    // The logger is installed before the config is read so that load
    // warnings are not lost. The configured level is applied afterwards.
    SimpleLogger::new().init()?;
    log::set_max_level(args.startup_log_level());

    let path = args.config.clone().unwrap_or_else(config::config_path);
    let mut config = Config::load(&path)?;
    args.apply(&mut config);

    let log_level = config.log_level()?;
    log::set_max_level(log_level.to_level_filter());
    info!("Log level set to: {:?}", log_level);

    run(config).await
}
