use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::debug;

pub const NOTIFICATIONS_TOTAL: &str = "ingest_notifications_total";
pub const CONTROL_DUPLICATES_TOTAL: &str = "ingest_control_duplicates_total";
pub const ORCHESTRATOR_OUTCOMES_TOTAL: &str = "ingest_orchestrator_outcomes_total";

/// Counter sink handed to handlers and the orchestrator.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str, labels: &[(&'static str, &str)]);
}

/// Counters kept in memory, keyed by `name{k=v,...}` with labels in call order.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<BTreeMap<String, u64>>,
}

fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    let labels: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", labels.join(","))
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = series_key(name, labels);
        match self.counters.lock() {
            Ok(c) => c.get(&key).copied().unwrap_or(0),
            Err(poisoned) => poisoned.into_inner().get(&key).copied().unwrap_or(0),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        match self.counters.lock() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        let key = series_key(name, labels);
        let mut counters = match self.counters.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        *counters.entry(key).or_insert(0) += 1;
    }
}

/// Emits one debug event per increment.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        debug!(metric = name, labels = %series_key(name, labels), "counter increment");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_label_set() {
        let m = InMemoryMetrics::new();
        m.increment(NOTIFICATIONS_TOTAL, &[("source", "build"), ("outcome", "processed")]);
        m.increment(NOTIFICATIONS_TOTAL, &[("source", "build"), ("outcome", "processed")]);
        m.increment(NOTIFICATIONS_TOTAL, &[("source", "run"), ("outcome", "ignored")]);
        assert_eq!(m.get(NOTIFICATIONS_TOTAL, &[("source", "build"), ("outcome", "processed")]), 2);
        assert_eq!(m.get(NOTIFICATIONS_TOTAL, &[("source", "run"), ("outcome", "ignored")]), 1);
        assert_eq!(m.get(NOTIFICATIONS_TOTAL, &[("source", "run"), ("outcome", "processed")]), 0);
        assert_eq!(m.snapshot().len(), 2);
    }
}
