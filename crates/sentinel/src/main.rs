// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sentinel::config::{Config, LogFormat};
use sentinel::engine::QuotaEngine;
use sentinel::usage::QuotaEvent;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    init_tracing(&config);

    let engine = match config.engine_settings().and_then(QuotaEngine::new) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("invalid configuration: {e:#}");
            std::process::exit(2);
        }
    };

    // Exit explicitly: a pending stdin read would otherwise hold the runtime open.
    match run(engine).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("fatal: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Logs go to stderr; stdout carries only events.
fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    match config.log_format().unwrap_or_default() {
        LogFormat::Json => {
            fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).json().init();
        }
        LogFormat::Text => {
            fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
        }
    }
}

async fn run(engine: Arc<QuotaEngine>) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let printer_done = CancellationToken::new();
    let printer = tokio::spawn(print_events(engine.subscribe(), printer_done.clone()));
    spawn_signal_handler(Arc::clone(&engine), shutdown.clone());

    engine.start()?;
    // Observers see every configured bucket without waiting for usage.
    engine.request_snapshot().await;

    tokio::spawn(read_commands(Arc::clone(&engine), shutdown.clone()));

    shutdown.cancelled().await;
    engine.stop().await;

    printer_done.cancel();
    if let Err(e) = printer.await {
        warn!(err = %e, "event printer failed");
    }
    Ok(())
}

/// Write each event as one JSON line on stdout. Drains pending events
/// before honouring `done`.
async fn print_events(mut events: broadcast::Receiver<QuotaEvent>, done: CancellationToken) {
    let mut stdout = tokio::io::stdout();
    loop {
        let received = tokio::select! {
            biased;
            received = events.recv() => received,
            _ = done.cancelled() => break,
        };
        match received {
            Ok(event) => {
                let line = match serde_json::to_string(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(err = %e, "cannot serialize event");
                        continue;
                    }
                };
                if let Err(e) = write_line(&mut stdout, &line).await {
                    warn!(err = %e, "stdout closed; no longer printing events");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer lagged; events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

/// Handle `refresh`, `stats`, and `quit` commands on stdin. EOF leaves the
/// engine running.
async fn read_commands(engine: Arc<QuotaEngine>, shutdown: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => match line.trim() {
                "" => {}
                "refresh" => {
                    engine.request_snapshot().await;
                }
                "stats" => {
                    let stats = engine.stats();
                    info!(
                        lines_seen = stats.lines_seen,
                        parse_failures = stats.parse_failures,
                        records_applied = stats.records_applied,
                        unmatched_records = stats.unmatched_records,
                        resets = stats.resets,
                        events_published = stats.events_published,
                        "engine stats"
                    );
                }
                "quit" => {
                    info!("quit requested");
                    shutdown.cancel();
                    break;
                }
                other => warn!(command = other, "unknown command"),
            },
            Ok(None) => {
                debug!("stdin closed");
                break;
            }
            Err(e) => {
                warn!(err = %e, "stdin read failed");
                break;
            }
        }
    }
}

/// Signals are registered before returning so none hit the default action.
fn spawn_signal_handler(engine: Arc<QuotaEngine>, shutdown: CancellationToken) {
    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();
    let mut sigusr1 = signal(SignalKind::user_defined1()).ok();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(()) = recv_or_pending(&mut sigterm) => {
                    info!("received SIGTERM");
                    shutdown.cancel();
                    break;
                }
                Some(()) = recv_or_pending(&mut sigint) => {
                    info!("received SIGINT");
                    shutdown.cancel();
                    break;
                }
                Some(()) = recv_or_pending(&mut sigusr1) => {
                    debug!("received SIGUSR1");
                    engine.request_snapshot().await;
                }
            }
        }
    });
}

async fn recv_or_pending(signal: &mut Option<Signal>) -> Option<()> {
    match signal {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}
