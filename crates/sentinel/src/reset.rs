// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daily usage reset keyed to a fixed timezone.
//!
//! The scheduler remembers the local calendar date of the last reset and
//! fires only when the current local date is strictly later. The periodic
//! tick is just the cadence at which that comparison is made, so a missed
//! or late tick delays a reset but never skips or repeats one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::usage::QuotaState;

/// Default timezone for the reset boundary.
pub const DEFAULT_TIMEZONE: &str = "America/Mexico_City";

/// Default cadence of boundary checks.
pub const DEFAULT_RESET_TICK: Duration = Duration::from_secs(60);

/// Source of "now". Production uses [`SystemClock`]; tests drive time by hand.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Resolve an IANA timezone identifier such as `America/Mexico_City`.
pub fn parse_timezone(name: &str) -> anyhow::Result<Tz> {
    name.parse::<Tz>().map_err(|e| anyhow::anyhow!("unknown timezone {name:?}: {e}"))
}

/// Result of one scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Same local day as the last reset (or the clock moved backwards).
    Idle,
    /// A day boundary was crossed; buckets must be zeroed.
    Boundary { previous: NaiveDate, current: NaiveDate },
}

/// Day-boundary detector for one timezone.
#[derive(Debug, Clone)]
pub struct ResetScheduler {
    tz: Tz,
    last_reset: NaiveDate,
}

impl ResetScheduler {
    /// Usage starts at zero on construction, so the current local day counts
    /// as already reset.
    pub fn new(tz: Tz, now: DateTime<Utc>) -> Self {
        Self { tz, last_reset: now.with_timezone(&tz).date_naive() }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn last_reset(&self) -> NaiveDate {
        self.last_reset
    }

    /// Calendar date of `now` in the configured timezone.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    /// Compare `now` against the last reset and record a crossing.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Tick {
        let current = self.local_date(now);
        if current > self.last_reset {
            let previous = self.last_reset;
            self.last_reset = current;
            return Tick::Boundary { previous, current };
        }
        if current < self.last_reset {
            warn!(
                timezone = %self.tz,
                local_date = %current,
                last_reset = %self.last_reset,
                "clock moved backwards; keeping last reset date"
            );
        }
        Tick::Idle
    }

    /// Check for a boundary every `period` until `shutdown` is cancelled,
    /// zeroing all buckets in `state` when one is crossed.
    pub async fn run(
        mut self,
        clock: Arc<dyn Clock>,
        state: Arc<QuotaState>,
        period: Duration,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.tick(clock.now()) {
                Tick::Idle => {}
                Tick::Boundary { previous, current } => {
                    info!(
                        timezone = %self.tz,
                        %previous,
                        %current,
                        "local day boundary crossed; resetting buckets"
                    );
                    state.reset_all().await;
                }
            }
        }
        debug!("reset scheduler stopped");
    }
}

#[cfg(test)]
#[path = "reset_tests.rs"]
mod tests;
