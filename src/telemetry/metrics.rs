//! Metrics for the packet pipeline.
//!
//! Thread-safe counters and a fixed-bucket latency histogram, collected in
//! a registry whose `export()` yields plain `(name, value)` pairs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Atomic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

const BUCKET_BOUNDS_US: [u64; 6] = [10, 100, 1_000, 10_000, 100_000, 1_000_000];

/// Histogram over microsecond observations with fixed bucket bounds.
#[derive(Debug, Default)]
pub struct Histogram {
    buckets: [Counter; BUCKET_BOUNDS_US.len() + 1],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, micros: u64) {
        let idx = BUCKET_BOUNDS_US
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(BUCKET_BOUNDS_US.len());
        self.buckets[idx].inc();
        self.sum.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() as f64 / count as f64
        }
    }

    fn export_into(&self, name: &str, out: &mut Vec<(String, u64)>) {
        for (i, bound) in BUCKET_BOUNDS_US.iter().enumerate() {
            out.push((format!("{name}_le_{bound}us"), self.buckets[i].get()));
        }
        out.push((format!("{name}_gt_{}us", BUCKET_BOUNDS_US[5]), self.buckets[6].get()));
        out.push((format!("{name}_count"), self.count()));
        out.push((format!("{name}_sum_us"), self.sum()));
    }
}

/// Named counters and histograms for one pipeline.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, Arc<Counter>>>,
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter registered under `name`, creating it on first use.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        if let Some(counter) = self.counters.read().unwrap().get(name) {
            return counter.clone();
        }
        self.counters
            .write()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn histogram(&self, name: &str) -> Arc<Histogram> {
        if let Some(histogram) = self.histograms.read().unwrap().get(name) {
            return histogram.clone();
        }
        self.histograms
            .write()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// All metrics as key-value pairs, sorted by name.
    pub fn export(&self) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        for (name, counter) in self.counters.read().unwrap().iter() {
            out.push((name.clone(), counter.get()));
        }
        for (name, histogram) in self.histograms.read().unwrap().iter() {
            histogram.export_into(name, &mut out);
        }
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_basic() {
        let counter = Counter::new();
        counter.inc();
        counter.add(10);
        assert_eq!(counter.get(), 11);
    }

    #[test]
    fn test_histogram_buckets_and_mean() {
        let histogram = Histogram::new();
        histogram.observe(5);
        histogram.observe(50);
        histogram.observe(5_000_000);
        assert_eq!(histogram.count(), 3);
        assert_eq!(histogram.sum(), 5_000_055);
        assert!((histogram.mean() - 5_000_055.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_registry_reuses_instances() {
        let registry = MetricsRegistry::new();
        let a = registry.counter("packets_processed");
        let b = registry.counter("packets_processed");
        a.inc();
        assert_eq!(b.get(), 1);

        let export = registry.export();
        assert!(export.contains(&("packets_processed".to_string(), 1)));
    }

    #[test]
    fn test_histogram_export_names() {
        let registry = MetricsRegistry::new();
        registry.histogram("latency").observe(42);
        let export = registry.export();
        assert!(export.iter().any(|(name, v)| name == "latency_le_100us" && *v == 1));
        assert!(export.iter().any(|(name, v)| name == "latency_count" && *v == 1));
    }
}
