// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

/// Why a single log line was rejected by the entry parser.
///
/// Line errors are always recovered locally: the line is dropped and counted
/// while the rest of the batch keeps flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineError {
    NotJson,
    NotAnObject,
    MissingSource,
    MissingAmount,
    InvalidAmount,
}

impl LineError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotJson => "NOT_JSON",
            Self::NotAnObject => "NOT_AN_OBJECT",
            Self::MissingSource => "MISSING_SOURCE",
            Self::MissingAmount => "MISSING_AMOUNT",
            Self::InvalidAmount => "INVALID_AMOUNT",
        }
    }

    /// Human-readable description used in log output.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::NotJson => "line is not valid JSON",
            Self::NotAnObject => "line is JSON but not an object",
            Self::MissingSource => "record has no string `source`/`model` field",
            Self::MissingAmount => "record has no `amount`/`token_count` field",
            Self::InvalidAmount => "record amount is not a non-negative number",
        }
    }
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for LineError {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
