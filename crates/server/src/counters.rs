//! Per-type performance counters, maintained when enabled and reported
//! at shutdown.

use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, Copy)]
pub struct TypeCounters {
    pub enqueued: u64,
    pub dispatched: u64,
    pub stolen_out: u64,
    pub stolen_in: u64,
}

#[derive(Debug, Default)]
pub struct Counters {
    enabled: bool,
    by_type: BTreeMap<i32, TypeCounters>,
}

impl Counters {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            by_type: BTreeMap::new(),
        }
    }

    fn entry(&mut self, work_type: i32) -> Option<&mut TypeCounters> {
        self.enabled.then(|| self.by_type.entry(work_type).or_default())
    }

    pub fn enqueued(&mut self, work_type: i32) {
        metrics::counter!("tasks_enqueued").increment(1);
        if let Some(c) = self.entry(work_type) {
            c.enqueued += 1;
        }
    }

    pub fn dispatched(&mut self, work_type: i32) {
        metrics::counter!("tasks_dispatched").increment(1);
        if let Some(c) = self.entry(work_type) {
            c.dispatched += 1;
        }
    }

    pub fn stolen_out(&mut self, work_type: i32, count: u64) {
        metrics::counter!("tasks_stolen_out").increment(count);
        if let Some(c) = self.entry(work_type) {
            c.stolen_out += count;
        }
    }

    pub fn stolen_in(&mut self, work_type: i32, count: u64) {
        metrics::counter!("tasks_stolen_in").increment(count);
        if let Some(c) = self.entry(work_type) {
            c.stolen_in += count;
        }
    }

    /// Log accumulated counts, once, at shutdown.
    pub fn report(&self) {
        if !self.enabled {
            return;
        }
        for (work_type, c) in &self.by_type {
            tracing::info!(
                work_type,
                enqueued = c.enqueued,
                dispatched = c.dispatched,
                stolen_out = c.stolen_out,
                stolen_in = c.stolen_in,
                "work type counters"
            );
        }
    }
}
