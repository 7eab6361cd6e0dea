// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The quota engine: wires the log tailer, entry parser, bucket state, and
//! reset scheduler together and owns their background tasks.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bucket::{BucketRegistry, BucketSpec, BucketView};
use crate::record::parse_batch;
use crate::reset::{Clock, ResetScheduler, SystemClock, DEFAULT_RESET_TICK};
use crate::tail::{LogTailer, DEFAULT_MAX_READ_BYTES, DEFAULT_POLL_INTERVAL};
use crate::usage::{EngineStats, QuotaEvent, QuotaState};

/// Batches of lines buffered between the tailer and the consumer.
const LINE_CHANNEL_CAPACITY: usize = 16;

/// Everything the engine needs to run.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub log_path: PathBuf,
    pub buckets: Vec<BucketSpec>,
    pub timezone: Tz,
    pub max_read_bytes: u64,
    pub reset_tick: Duration,
    pub poll_interval: Duration,
}

impl EngineSettings {
    /// Settings with default timezone, read cap, and cadences.
    pub fn new(log_path: PathBuf, buckets: Vec<BucketSpec>) -> Self {
        Self {
            log_path,
            buckets,
            timezone: Tz::America__Mexico_City,
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
            reset_tick: DEFAULT_RESET_TICK,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_read_bytes == 0 {
            anyhow::bail!("max read bytes must be positive");
        }
        if self.reset_tick.is_zero() {
            anyhow::bail!("reset tick must be positive");
        }
        if self.poll_interval.is_zero() {
            anyhow::bail!("poll interval must be positive");
        }
        Ok(())
    }
}

pub struct QuotaEngine {
    settings: EngineSettings,
    state: Arc<QuotaState>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl QuotaEngine {
    /// Validate settings and build the bucket registry. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(settings: EngineSettings) -> anyhow::Result<Self> {
        settings.validate()?;
        let registry = BucketRegistry::new(&settings.buckets)?;
        Ok(Self {
            settings,
            state: Arc::new(QuotaState::new(registry)),
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QuotaEvent> {
        self.state.subscribe()
    }

    /// True between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.shutdown.is_cancelled()
    }

    /// Begin tailing from the current end of the log and start the reset
    /// ticker. Returns immediately; must be called inside a Tokio runtime.
    /// A second call while running is a no-op.
    pub fn start(&self) -> anyhow::Result<()> {
        if self.shutdown.is_cancelled() {
            anyhow::bail!("engine has been stopped");
        }
        if self.started.swap(true, Ordering::AcqRel) {
            debug!("engine already started");
            return Ok(());
        }

        let settings = &self.settings;
        let mut tailer = LogTailer::new(settings.log_path.clone())
            .with_max_read(settings.max_read_bytes)
            .with_poll_interval(settings.poll_interval);
        if let Err(e) = tailer.seek_to_end() {
            warn!(path = %settings.log_path.display(), err = %e, "cannot read log; seeking to end once readable");
        }

        let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let scheduler = ResetScheduler::new(settings.timezone, self.clock.now());

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(tailer.run(line_tx, self.shutdown.clone())));
        tasks.push(tokio::spawn(consume_lines(
            line_rx,
            Arc::clone(&self.state),
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(scheduler.run(
            Arc::clone(&self.clock),
            Arc::clone(&self.state),
            settings.reset_tick,
            self.shutdown.clone(),
        )));

        info!(
            path = %settings.log_path.display(),
            buckets = settings.buckets.len(),
            timezone = %settings.timezone,
            "quota engine started"
        );
        Ok(())
    }

    /// Publish the current state to all subscribers. `None` once stopped.
    pub async fn request_snapshot(&self) -> Option<QuotaEvent> {
        self.state.refresh().await
    }

    /// Current bucket views without publishing.
    pub async fn snapshot(&self) -> IndexMap<String, BucketView> {
        self.state.snapshot().await
    }

    pub fn stats(&self) -> EngineStats {
        self.state.stats()
    }

    /// Stop tailing and ticking. When this returns no further bucket
    /// mutation or event can happen. Safe to call more than once.
    pub async fn stop(&self) {
        let first = !self.shutdown.is_cancelled();
        self.shutdown.cancel();
        self.state.close().await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(err = %e, "engine task failed");
            }
        }
        if first {
            info!(stats = ?self.state.stats(), "quota engine stopped");
        }
    }
}

impl std::fmt::Debug for QuotaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaEngine")
            .field("settings", &self.settings)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Drop for QuotaEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Parse each batch from the tailer and apply it.
async fn consume_lines(
    mut line_rx: mpsc::Receiver<Vec<String>>,
    state: Arc<QuotaState>,
    shutdown: CancellationToken,
) {
    loop {
        let lines = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            lines = line_rx.recv() => match lines {
                Some(lines) => lines,
                None => break,
            },
        };
        let batch = parse_batch(&lines);
        if batch.failures > 0 {
            debug!(lines = batch.lines, failures = batch.failures, "batch had malformed lines");
        }
        state.apply_batch(&batch).await;
    }
    debug!("line consumer stopped");
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
