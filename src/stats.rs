use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::Serialize;

use crate::error::{ConfigError, ConfigResult};

/// A named, monotonically updated statistic.  The component that registered it owns the handle
/// and bumps it directly; the sink keeps a second handle for reporting.
#[derive(Debug, Clone, Default)]
pub struct Counter(Rc<Cell<u64>>);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.set(self.0.get().saturating_add(n));
    }

    pub fn sub(&self, n: u64) {
        self.0.set(self.0.get().saturating_sub(n));
    }

    pub fn set(&self, v: u64) {
        self.0.set(v);
    }

    pub fn record_max(&self, v: u64) {
        self.0.set(self.0.get().max(v));
    }

    pub fn value(&self) -> u64 {
        self.0.get()
    }
}

/// Indexed group of counters sharing a base name, e.g. `l2.hits::128KiB`.
#[derive(Debug, Clone, Default)]
pub struct CounterVec {
    counters: Vec<Counter>,
}

impl CounterVec {
    pub fn get(&self, idx: usize) -> &Counter {
        &self.counters[idx]
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn values(&self) -> Vec<u64> {
        self.counters.iter().map(Counter::value).collect()
    }

    pub fn total(&self) -> u64 {
        self.counters
            .iter()
            .fold(0u64, |acc, c| acc.saturating_add(c.value()))
    }
}

#[derive(Debug, Default)]
struct Registry {
    counters: BTreeMap<String, Counter>,
}

/// Explicit statistics registry handed to every component constructor.  Cloning the sink shares
/// the registry.
#[derive(Debug, Clone, Default)]
pub struct StatsSink {
    inner: Rc<RefCell<Registry>>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub counters: BTreeMap<String, u64>,
}

impl StatsSnapshot {
    pub fn get(&self, name: &str) -> Option<u64> {
        self.counters.get(name).copied()
    }
}

impl StatsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: impl Into<String>) -> ConfigResult<Counter> {
        let name = name.into();
        let mut reg = self.inner.borrow_mut();
        if reg.counters.contains_key(&name) {
            return Err(ConfigError::DuplicateStat(name));
        }
        let counter = Counter::default();
        reg.counters.insert(name, counter.clone());
        Ok(counter)
    }

    /// Register `name::label` for every label.  Nothing is registered if any name is taken.
    pub fn counter_vec<S: AsRef<str>>(&self, name: &str, labels: &[S]) -> ConfigResult<CounterVec> {
        let names: Vec<String> = labels
            .iter()
            .map(|label| format!("{}::{}", name, label.as_ref()))
            .collect();
        let mut reg = self.inner.borrow_mut();
        for (i, full) in names.iter().enumerate() {
            if reg.counters.contains_key(full) || names[..i].contains(full) {
                return Err(ConfigError::DuplicateStat(full.clone()));
            }
        }
        let counters: Vec<Counter> = names
            .into_iter()
            .map(|full| {
                let counter = Counter::default();
                reg.counters.insert(full, counter.clone());
                counter
            })
            .collect();
        Ok(CounterVec { counters })
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.inner.borrow().counters.get(name).map(Counter::value)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().counters.is_empty()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self
            .inner
            .borrow()
            .counters
            .iter()
            .map(|(name, c)| (name.clone(), c.value()))
            .collect();
        StatsSnapshot { counters }
    }

    pub fn dump_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.snapshot())
    }

    /// Zero every registered counter, e.g. at the end of a warm-up phase.
    pub fn reset(&self) {
        self.inner
            .borrow()
            .counters
            .values()
            .for_each(|c| c.set(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_shared_with_the_sink() {
        let sink = StatsSink::new();
        let c = sink.counter("bus.grants").unwrap();
        c.inc();
        c.add(4);
        assert_eq!(Some(5), sink.get("bus.grants"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let sink = StatsSink::new();
        sink.counter("x").unwrap();
        assert_eq!(
            ConfigError::DuplicateStat("x".to_string()),
            sink.counter("x").unwrap_err()
        );
    }

    #[test]
    fn counter_vec_names_use_labels() {
        let sink = StatsSink::new();
        let v = sink.counter_vec("l2.hits", &["128KiB", "256KiB"]).unwrap();
        v.get(1).add(3);
        assert_eq!(2, v.len());
        assert_eq!(Some(3), sink.get("l2.hits::256KiB"));
        assert_eq!(3, v.total());
    }

    #[test]
    fn colliding_counter_vec_registers_nothing() {
        let sink = StatsSink::new();
        sink.counter("l2.hits::256KiB").unwrap();
        assert!(sink.counter_vec("l2.hits", &["128KiB", "256KiB"]).is_err());
        assert_eq!(1, sink.len());
        assert_eq!(None, sink.get("l2.hits::128KiB"));
        assert!(sink.counter_vec("dup", &["a", "a"]).is_err());
        assert_eq!(1, sink.len());
    }

    #[test]
    fn record_max_keeps_the_peak() {
        let sink = StatsSink::new();
        let c = sink.counter("q.peak").unwrap();
        c.record_max(3);
        c.record_max(1);
        assert_eq!(Some(3), sink.get("q.peak"));
    }

    #[test]
    fn snapshot_is_sorted_and_json_dumpable() {
        let sink = StatsSink::new();
        sink.counter("b").unwrap().set(2);
        sink.counter("a").unwrap().set(1);
        let snap = sink.snapshot();
        let names: Vec<_> = snap.counters.keys().cloned().collect();
        assert_eq!(vec!["a".to_string(), "b".to_string()], names);
        let json = sink.dump_json().unwrap();
        assert!(json.contains("\"a\": 1"));
    }

    #[test]
    fn reset_zeroes_counters() {
        let sink = StatsSink::new();
        let c = sink.counter("c").unwrap();
        c.add(9);
        sink.reset();
        assert_eq!(0, c.value());
    }
}
