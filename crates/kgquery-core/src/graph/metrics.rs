// Query Metrics - per-key execution statistics
// One record per normalized cache key; reports read a snapshot copy

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kgquery_common::Parameters;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Serialize)]
pub struct QueryMetricSample {
    pub key: String,
    /// Successful executions.
    pub count: u64,
    pub total_time: f64,
    pub avg_time: f64,
    pub min_time: f64,
    pub max_time: f64,
    pub errors: u64,
    /// Time spent in failed runs, kept apart from the success averages.
    pub error_time: f64,
    pub slow_count: u64,
    /// Parameters of the latest successful execution, values cut to a preview.
    pub last_parameters: Option<BTreeMap<String, String>>,
    pub plan_preview: String,
    pub last_executed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    touched: u64,
}

impl QueryMetricSample {
    fn new(key: &str, plan_preview: String) -> Self {
        Self {
            key: key.to_string(),
            count: 0,
            total_time: 0.0,
            avg_time: 0.0,
            min_time: 0.0,
            max_time: 0.0,
            errors: 0,
            error_time: 0.0,
            slow_count: 0,
            last_parameters: None,
            plan_preview,
            last_executed_at: None,
            touched: 0,
        }
    }
}

pub struct QueryMetrics {
    table: DashMap<String, QueryMetricSample>,
    /// 0 = unbounded.
    capacity: usize,
    parameter_preview_len: usize,
    plan_preview_len: usize,
    clock: AtomicU64,
}

impl QueryMetrics {
    pub fn new(capacity: usize, parameter_preview_len: usize, plan_preview_len: usize) -> Self {
        Self {
            table: DashMap::new(),
            capacity,
            parameter_preview_len,
            plan_preview_len,
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Makes sure a record exists for `key`, even if the query never runs.
    pub fn touch(&self, key: &str, plan: &str) {
        let tick = self.tick();
        self.table
            .entry(key.to_string())
            .or_insert_with(|| QueryMetricSample::new(key, preview(plan, self.plan_preview_len)))
            .touched = tick;
        self.enforce_capacity();
    }

    pub fn record_success(&self, key: &str, plan: &str, elapsed_secs: f64, parameters: &Parameters, slow: bool) {
        let tick = self.tick();
        let last_parameters = parameters
            .iter()
            .map(|(name, value)| (name.clone(), preview(&render(value), self.parameter_preview_len)))
            .collect();

        let mut sample = self
            .table
            .entry(key.to_string())
            .or_insert_with(|| QueryMetricSample::new(key, preview(plan, self.plan_preview_len)));
        sample.count += 1;
        sample.total_time += elapsed_secs;
        sample.avg_time = sample.total_time / sample.count as f64;
        sample.min_time = if sample.count == 1 {
            elapsed_secs
        } else {
            sample.min_time.min(elapsed_secs)
        };
        sample.max_time = sample.max_time.max(elapsed_secs);
        if slow {
            sample.slow_count += 1;
        }
        sample.last_parameters = Some(last_parameters);
        sample.last_executed_at = Some(Utc::now());
        sample.touched = tick;
        drop(sample);
        self.enforce_capacity();
    }

    /// Failed runs are counted but do not feed the timing averages.
    pub fn record_failure(&self, key: &str, plan: &str, elapsed_secs: f64) {
        let tick = self.tick();
        let mut sample = self
            .table
            .entry(key.to_string())
            .or_insert_with(|| QueryMetricSample::new(key, preview(plan, self.plan_preview_len)));
        sample.errors += 1;
        sample.error_time += elapsed_secs;
        sample.last_executed_at = Some(Utc::now());
        sample.touched = tick;
        drop(sample);
        self.enforce_capacity();
    }

    pub fn get(&self, key: &str) -> Option<QueryMetricSample> {
        self.table.get(key).map(|sample| sample.value().clone())
    }

    /// Keys with at least one successful run, slowest average first.
    pub fn slowest(&self, limit: usize) -> Vec<QueryMetricSample> {
        let mut samples: Vec<QueryMetricSample> = self
            .table
            .iter()
            .filter(|entry| entry.value().count > 0)
            .map(|entry| entry.value().clone())
            .collect();
        samples.sort_by(|a, b| b.avg_time.total_cmp(&a.avg_time));
        samples.truncate(limit);
        samples
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn reset(&self) {
        self.table.clear();
        tracing::info!("Query metrics reset");
    }

    // Runs after the insert, so racing inserts of new keys each trim back
    // down and the table settles at or below capacity.
    fn enforce_capacity(&self) {
        if self.capacity == 0 {
            return;
        }
        while self.table.len() > self.capacity {
            if !self.evict_stalest() {
                break;
            }
        }
    }

    fn evict_stalest(&self) -> bool {
        let victim = self
            .table
            .iter()
            .min_by_key(|entry| entry.value().touched)
            .map(|entry| entry.key().clone());
        match victim {
            Some(key) => {
                self.table.remove(&key);
                tracing::debug!("Evicted metrics record: {}", key);
                true
            }
            None => false,
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// First `max_chars` characters of `text`.
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
