//! Per-run shared state: identity, mode flags, metrics and the error log.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PipelineConfig;

/// A metric value. Numbers sum on merge; anything else collects into a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<MetricValue>),
    Map(BTreeMap<String, MetricValue>),
}

impl MetricValue {
    /// Fold `incoming` into `self`:
    /// numeric + numeric sums (staying integral when both are),
    /// a list absorbs a list by extension and anything else by append,
    /// any other pair becomes a two-element list `[existing, incoming]`.
    pub fn absorb(&mut self, incoming: MetricValue) {
        use MetricValue::*;

        let current = std::mem::replace(self, Int(0));
        *self = match (current, incoming) {
            (Int(a), Int(b)) => Int(a.saturating_add(b)),
            (Int(a), Float(b)) => Float(a as f64 + b),
            (Float(a), Int(b)) => Float(a + b as f64),
            (Float(a), Float(b)) => Float(a + b),
            (List(mut items), List(more)) => {
                items.extend(more);
                List(items)
            }
            (List(mut items), other) => {
                items.push(other);
                List(items)
            }
            (current, other) => List(vec![current, other]),
        };
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Non-negative integral view; non-numeric values read as zero.
    pub fn as_u64(&self) -> u64 {
        match self {
            Self::Int(n) => (*n).max(0) as u64,
            Self::Float(f) if *f > 0.0 => *f as u64,
            _ => 0,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Build a `Map` of integer counts.
    pub fn counts<'a>(counts: impl IntoIterator<Item = (&'a String, &'a u64)>) -> Self {
        Self::Map(
            counts
                .into_iter()
                .map(|(k, v)| (k.clone(), MetricValue::from(*v)))
                .collect(),
        )
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<usize> for MetricValue {
    fn from(v: usize) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<MetricValue>> for MetricValue {
    fn from(v: Vec<MetricValue>) -> Self {
        Self::List(v)
    }
}

/// Mode flags fixed for the lifetime of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunMode {
    /// No mutation of external state.
    pub dry_run: bool,
    /// Fabricate classification and action outcomes instead of calling out.
    pub preview: bool,
    /// Use the fixed test classification instead of the classifier.
    pub test: bool,
}

/// State shared by every stage of one run.
///
/// The run id and start time are set at construction and cannot change.
/// Metrics and errors only grow while the run is in progress.
#[derive(Debug)]
pub struct RunContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    config: Arc<PipelineConfig>,
    mode: RunMode,
    metrics: BTreeMap<String, MetricValue>,
    errors: Vec<String>,
}

impl RunContext {
    pub fn new(config: Arc<PipelineConfig>, mode: RunMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            config,
            mode,
            metrics: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Record a metric, merging with any existing value under `key`.
    pub fn merge_metric(&mut self, key: impl Into<String>, value: impl Into<MetricValue>) {
        match self.metrics.entry(key.into()) {
            Entry::Occupied(mut existing) => existing.get_mut().absorb(value.into()),
            Entry::Vacant(slot) => {
                slot.insert(value.into());
            }
        }
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn metric(&self, key: &str) -> Option<&MetricValue> {
        self.metrics.get(key)
    }

    pub fn metrics(&self) -> &BTreeMap<String, MetricValue> {
        &self.metrics
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }
}
