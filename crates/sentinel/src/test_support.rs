// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: a hand-driven clock, settings builders, and
//! assertion helpers.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::bucket::BucketSpec;
use crate::engine::EngineSettings;
use crate::reset::Clock;

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Two overlapping buckets: `A` tracks `m1`, `B` tracks `m1` and `m2`.
pub fn overlapping_buckets() -> Vec<BucketSpec> {
    vec![BucketSpec::new("A", 100, &["m1"]), BucketSpec::new("B", 200, &["m1", "m2"])]
}

/// Engine settings tuned for tests: fast polling and reset ticks.
pub fn fast_settings(log_path: PathBuf, buckets: Vec<BucketSpec>) -> EngineSettings {
    EngineSettings {
        poll_interval: Duration::from_millis(20),
        reset_tick: Duration::from_millis(20),
        ..EngineSettings::new(log_path, buckets)
    }
}

/// Append raw text to `path`, creating the file if needed.
pub fn append(path: &Path, data: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(data.as_bytes())?;
    file.flush()
}

/// Append one JSON usage line per `(model, tokens)` pair.
pub fn append_usage(path: &Path, entries: &[(&str, f64)]) -> std::io::Result<()> {
    let text: String = entries
        .iter()
        .map(|(model, tokens)| format!("{{\"model\":\"{model}\",\"token_count\":{tokens}}}\n"))
        .collect();
    append(path, &text)
}

/// Assert that an expression evaluates to `Err` whose Display output
/// contains the given substring.
#[macro_export]
macro_rules! assert_err_contains {
    ($expr:expr, $substr:expr) => {{
        let result = $expr;
        let err = result.expect_err(concat!("expected Err for: ", stringify!($expr)));
        let msg = err.to_string();
        assert!(msg.contains($substr), "expected error containing {:?}, got: {msg:?}", $substr);
    }};
}
