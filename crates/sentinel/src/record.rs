// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Entry parser: one log line in, one usage record (or a rejection) out.
//!
//! Lines are JSON objects. The consumer identifier is read from `source`
//! (falling back to `model`) and the quantity from `amount` (falling back to
//! `token_count`). Unknown fields are ignored.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::error::LineError;

/// Longest line prefix echoed into debug logs for a rejected line.
const PREVIEW_CHARS: usize = 120;

/// A single validated usage record.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub source: String,
    /// Finite and non-negative; fractional values are kept as-is.
    pub amount: f64,
    /// Informational only; never consulted by the reset logic.
    pub timestamp: Option<DateTime<Utc>>,
}

impl UsageRecord {
    pub fn new(source: impl Into<String>, amount: f64) -> Self {
        Self { source: source.into(), amount, timestamp: None }
    }
}

/// Outcome of parsing one batch of raw lines.
#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub records: Vec<UsageRecord>,
    /// Non-blank lines examined.
    pub lines: u64,
    /// Non-blank lines rejected.
    pub failures: u64,
}

/// Parse a single raw line.
pub fn parse_line(line: &str) -> Result<UsageRecord, LineError> {
    let json: Value = serde_json::from_str(line).map_err(|_| LineError::NotJson)?;
    parse_value(&json)
}

/// Extract a [`UsageRecord`] from an already-decoded JSON value.
pub fn parse_value(json: &Value) -> Result<UsageRecord, LineError> {
    if !json.is_object() {
        return Err(LineError::NotAnObject);
    }

    let source = first_field(json, &["source", "model"])
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or(LineError::MissingSource)?;

    let amount = first_field(json, &["amount", "token_count"]).ok_or(LineError::MissingAmount)?;
    let amount = parse_amount(amount).ok_or(LineError::InvalidAmount)?;

    let timestamp = first_field(json, &["timestamp", "ts", "time"]).and_then(parse_timestamp);

    Ok(UsageRecord { source: source.to_owned(), amount, timestamp })
}

/// Parse every non-blank line, dropping (and counting) the ones that fail.
pub fn parse_batch<I, S>(lines: I) -> ParsedBatch
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut batch = ParsedBatch::default();
    for line in lines {
        let line = line.as_ref().trim();
        if line.is_empty() {
            continue;
        }
        batch.lines += 1;
        match parse_line(line) {
            Ok(record) => batch.records.push(record),
            Err(e) => {
                batch.failures += 1;
                debug!(code = %e, reason = e.describe(), line = %preview(line), "dropped log line");
            }
        }
    }
    batch
}

/// First of `keys` present with a non-null value.
fn first_field<'a>(json: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().filter_map(|k| json.get(*k)).find(|v| !v.is_null())
}

fn parse_amount(value: &Value) -> Option<f64> {
    let f = value.as_f64()?;
    (f.is_finite() && f >= 0.0).then_some(f)
}

/// Accepts RFC 3339 strings or epoch seconds/milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(raw) = value.as_str() {
        return DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc));
    }
    let n = value.as_i64()?;
    // Anything past year ~5138 in seconds is assumed to be milliseconds.
    if n.unsigned_abs() > 100_000_000_000 {
        DateTime::from_timestamp_millis(n)
    } else {
        DateTime::from_timestamp(n, 0)
    }
}

fn preview(line: &str) -> &str {
    match line.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
#[path = "record_tests.rs"]
mod tests;
