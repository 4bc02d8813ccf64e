use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct PipelineCounters {
    pushed: AtomicU64,
    push_failed: AtomicU64,
    reserved: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    abandoned: AtomicU64,
    broker_errors: AtomicU64,
}

impl PipelineCounters {
    fn snapshot(&self) -> PipelineMetrics {
        PipelineMetrics {
            pushed: self.pushed.load(Ordering::Relaxed),
            push_failed: self.push_failed.load(Ordering::Relaxed),
            reserved: self.reserved.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            broker_errors: self.broker_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters of one pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub pushed: u64,
    pub push_failed: u64,
    pub reserved: u64,
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub abandoned: u64,
    pub broker_errors: u64,
}

impl PipelineMetrics {
    /// Share of resolved jobs that were acked, as a percentage
    pub fn success_rate(&self) -> f64 {
        let resolved = self.acked + self.dead_lettered;
        if resolved == 0 {
            100.0
        } else {
            (self.acked as f64 / resolved as f64) * 100.0
        }
    }

    fn add(&mut self, other: &PipelineMetrics) {
        self.pushed += other.pushed;
        self.push_failed += other.push_failed;
        self.reserved += other.reserved;
        self.acked += other.acked;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.abandoned += other.abandoned;
        self.broker_errors += other.broker_errors;
    }
}

/// Live per-pipeline counters
#[derive(Default)]
pub struct LiveMetrics {
    pipelines: RwLock<HashMap<String, Arc<PipelineCounters>>>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, pipeline: &str) -> Arc<PipelineCounters> {
        if let Some(counters) = self.pipelines.read().get(pipeline) {
            return counters.clone();
        }
        self.pipelines
            .write()
            .entry(pipeline.to_string())
            .or_default()
            .clone()
    }

    pub fn increment_pushed(&self, pipeline: &str) {
        self.counters(pipeline).pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_push_failed(&self, pipeline: &str) {
        self.counters(pipeline).push_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reserved(&self, pipeline: &str) {
        self.counters(pipeline).reserved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_acked(&self, pipeline: &str) {
        self.counters(pipeline).acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retried(&self, pipeline: &str) {
        self.counters(pipeline).retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dead_lettered(&self, pipeline: &str) {
        self.counters(pipeline).dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_abandoned(&self, pipeline: &str) {
        self.counters(pipeline).abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_broker_errors(&self, pipeline: &str) {
        self.counters(pipeline).broker_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counters of one pipeline; zeros if nothing was recorded yet
    pub fn pipeline(&self, pipeline: &str) -> PipelineMetrics {
        self.pipelines
            .read()
            .get(pipeline)
            .map(|counters| counters.snapshot())
            .unwrap_or_default()
    }

    pub fn all(&self) -> HashMap<String, PipelineMetrics> {
        self.pipelines
            .read()
            .iter()
            .map(|(name, counters)| (name.clone(), counters.snapshot()))
            .collect()
    }

    /// Sum over every pipeline
    pub fn totals(&self) -> PipelineMetrics {
        let mut totals = PipelineMetrics::default();
        for counters in self.pipelines.read().values() {
            totals.add(&counters.snapshot());
        }
        totals
    }
}
