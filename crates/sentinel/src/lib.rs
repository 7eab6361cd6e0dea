// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod bucket;
pub mod config;
pub mod engine;
pub mod error;
pub mod record;
pub mod reset;
pub mod tail;
pub mod test_support;
pub mod usage;
