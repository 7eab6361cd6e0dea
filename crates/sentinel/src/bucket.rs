// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Quota buckets, the registry that owns them, and usage attribution.
//!
//! The registry is built once from static configuration and never gains or
//! loses buckets afterwards. Iteration follows configuration order.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::record::UsageRecord;

/// Static definition of one bucket, as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSpec {
    pub id: String,
    pub limit: u64,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl BucketSpec {
    pub fn new(id: impl Into<String>, limit: u64, sources: &[&str]) -> Self {
        Self { id: id.into(), limit, sources: sources.iter().map(|s| (*s).to_owned()).collect() }
    }
}

/// A named quota accumulating usage from a fixed set of sources.
#[derive(Debug, Clone)]
pub struct Bucket {
    id: String,
    limit: u64,
    sources: IndexSet<String>,
    usage: f64,
}

impl Bucket {
    fn from_spec(spec: &BucketSpec) -> Self {
        Self {
            id: spec.id.clone(),
            limit: spec.limit,
            sources: spec.sources.iter().cloned().collect(),
            usage: 0.0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn usage(&self) -> f64 {
        self.usage
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().map(String::as_str)
    }

    pub fn matches(&self, source: &str) -> bool {
        self.sources.contains(source)
    }

    pub fn add_usage(&mut self, amount: f64) {
        self.usage += amount;
    }

    pub fn reset(&mut self) {
        self.usage = 0.0;
    }

    /// Usage as a percentage of the limit. Not clamped: overshoot reads above 100.
    pub fn percentage(&self) -> f64 {
        self.usage / self.limit as f64 * 100.0
    }

    pub fn view(&self) -> BucketView {
        BucketView {
            usage: self.usage,
            limit: self.limit,
            percentage: self.percentage(),
            sources: self.sources.iter().cloned().collect(),
        }
    }
}

/// Serializable point-in-time view of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketView {
    pub usage: f64,
    pub limit: u64,
    pub percentage: f64,
    pub sources: Vec<String>,
}

/// Bucket id → bucket, in configuration order.
#[derive(Debug, Clone)]
pub struct BucketRegistry {
    buckets: IndexMap<String, Bucket>,
}

impl BucketRegistry {
    /// Build the registry, rejecting invalid static configuration.
    pub fn new(specs: &[BucketSpec]) -> anyhow::Result<Self> {
        if specs.is_empty() {
            anyhow::bail!("no buckets configured");
        }
        let mut buckets = IndexMap::with_capacity(specs.len());
        for spec in specs {
            if spec.id.trim().is_empty() {
                anyhow::bail!("bucket id must not be empty");
            }
            if spec.limit == 0 {
                anyhow::bail!("bucket {:?} has a non-positive limit", spec.id);
            }
            if buckets.contains_key(&spec.id) {
                anyhow::bail!("duplicate bucket id {:?}", spec.id);
            }
            if spec.sources.is_empty() {
                tracing::warn!(bucket = %spec.id, "bucket has no sources and will never accrue usage");
            }
            buckets.insert(spec.id.clone(), Bucket::from_spec(spec));
        }
        Ok(Self { buckets })
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Bucket> {
        self.buckets.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.values()
    }

    /// Credit `record` to every bucket listing its source. Returns the
    /// number of buckets credited; zero means the source is untracked.
    pub fn attribute(&mut self, record: &UsageRecord) -> usize {
        let mut matched = 0;
        for bucket in self.buckets.values_mut() {
            if bucket.matches(&record.source) {
                bucket.add_usage(record.amount);
                matched += 1;
            }
        }
        matched
    }

    pub fn reset_all(&mut self) {
        for bucket in self.buckets.values_mut() {
            bucket.reset();
        }
    }

    pub fn views(&self) -> IndexMap<String, BucketView> {
        self.buckets.iter().map(|(id, bucket)| (id.clone(), bucket.view())).collect()
    }
}

#[cfg(test)]
#[path = "bucket_tests.rs"]
mod tests;
