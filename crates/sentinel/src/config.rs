// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::bucket::BucketSpec;
use crate::engine::EngineSettings;
use crate::reset::{parse_timezone, DEFAULT_TIMEZONE};

/// Output format for the log subscriber.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::Text => f.write_str("text"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            other => anyhow::bail!("invalid log format: {other}"),
        }
    }
}

/// Tracks model token usage from a local log against daily quota buckets.
#[derive(Debug, Parser)]
#[command(name = "quota-sentinel", version, about)]
pub struct Config {
    /// Usage log to tail [default: $HOME/.gemini/logs/antigravity.log].
    #[arg(long, env = "SENTINEL_LOG_PATH")]
    pub log_path: Option<PathBuf>,

    /// JSON bucket file; built-in buckets are used when absent.
    #[arg(long, env = "SENTINEL_BUCKETS")]
    pub buckets: Option<PathBuf>,

    /// IANA timezone whose midnight resets all buckets.
    #[arg(long, env = "SENTINEL_TIMEZONE", default_value = DEFAULT_TIMEZONE)]
    pub timezone: String,

    /// Most bytes pulled from the log in one read.
    #[arg(long, env = "SENTINEL_MAX_READ_BYTES", default_value = "1048576")]
    pub max_read_bytes: u64,

    /// Milliseconds between day-boundary checks.
    #[arg(long, env = "SENTINEL_RESET_TICK_MS", default_value = "60000")]
    pub reset_tick_ms: u64,

    /// Milliseconds between fallback polls of the log.
    #[arg(long, env = "SENTINEL_POLL_MS", default_value = "3000")]
    pub poll_ms: u64,

    /// Log format (json or text).
    #[arg(long, env = "SENTINEL_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level.
    #[arg(long, env = "SENTINEL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing. Does not touch the bucket
    /// file; that happens in [`engine_settings`](Self::engine_settings).
    pub fn validate(&self) -> anyhow::Result<()> {
        parse_timezone(&self.timezone)?;
        self.log_format()?;
        if self.max_read_bytes == 0 {
            anyhow::bail!("--max-read-bytes must be positive");
        }
        if self.reset_tick_ms == 0 {
            anyhow::bail!("--reset-tick-ms must be positive");
        }
        if self.poll_ms == 0 {
            anyhow::bail!("--poll-ms must be positive");
        }
        Ok(())
    }

    pub fn log_format(&self) -> anyhow::Result<LogFormat> {
        self.log_format.parse()
    }

    /// The explicit log path, or the default under `$HOME`.
    pub fn log_path(&self) -> PathBuf {
        self.log_path.clone().unwrap_or_else(default_log_path)
    }

    pub fn reset_tick(&self) -> Duration {
        Duration::from_millis(self.reset_tick_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    /// Resolve the timezone, load buckets, and assemble engine settings.
    pub fn engine_settings(&self) -> anyhow::Result<EngineSettings> {
        let buckets = match self.buckets {
            Some(ref path) => load_bucket_file(path)?,
            None => default_buckets(),
        };
        let settings = EngineSettings {
            log_path: self.log_path(),
            buckets,
            timezone: parse_timezone(&self.timezone)?,
            max_read_bytes: self.max_read_bytes,
            reset_tick: self.reset_tick(),
            poll_interval: self.poll_interval(),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Build a minimal `Config` for tests (fast cadences, debug logging).
    #[doc(hidden)]
    pub fn test() -> Self {
        Self {
            log_path: Some(PathBuf::from("usage.log")),
            buckets: None,
            timezone: DEFAULT_TIMEZONE.into(),
            max_read_bytes: 64 * 1024,
            reset_tick_ms: 20,
            poll_ms: 20,
            log_format: "text".into(),
            log_level: "debug".into(),
        }
    }
}

/// `$HOME/.gemini/logs/antigravity.log`, falling back to `%USERPROFILE%`.
pub fn default_log_path() -> PathBuf {
    let home = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")).unwrap_or_default();
    PathBuf::from(home).join(".gemini").join("logs").join("antigravity.log")
}

/// Buckets used when no bucket file is given.
pub fn default_buckets() -> Vec<BucketSpec> {
    vec![
        BucketSpec::new("tier-1", 1_000_000, &["claude-3-5-sonnet", "claude-3-opus"]),
        BucketSpec::new("tier-2", 2_000_000, &["claude-3-haiku", "gemini-flash"]),
    ]
}

/// Contents of the `--buckets` JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketFile {
    pub buckets: Vec<BucketSpec>,
}

/// Load and parse the bucket file at `path`.
pub fn load_bucket_file(path: &Path) -> anyhow::Result<Vec<BucketSpec>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read bucket file {}: {e}", path.display()))?;
    let file: BucketFile = serde_json::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("invalid bucket file {}: {e}", path.display()))?;
    Ok(file.buckets)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
