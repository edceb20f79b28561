//! Controller self-metrics, rendered in Prometheus text exposition format.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

pub const RECONCILE_TOTAL: &str = "aas_reconcile_total";
pub const RECONCILE_ERRORS_TOTAL: &str = "aas_reconcile_errors_total";
pub const RECONCILE_DROPPED_TOTAL: &str = "aas_reconcile_dropped_total";
pub const APPLY_TOTAL: &str = "aas_apply_cycles_total";
pub const APPLY_ERRORS_TOTAL: &str = "aas_apply_errors_total";
pub const STRATEGY_RELOADS_TOTAL: &str = "aas_strategy_reloads_total";
pub const POLICY_EVALUATIONS_TOTAL: &str = "aas_policy_evaluations_total";
pub const POLICY_ACTIONS_TOTAL: &str = "aas_policy_actions_total";
pub const POLICY_ACTION_ERRORS_TOTAL: &str = "aas_policy_action_errors_total";
pub const ACTIVE_TASKS: &str = "aas_active_tasks";
pub const ACTIVE_POLICIES: &str = "aas_active_policies";

/// A lightweight, thread-safe metrics registry.
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Counter>>,
    gauges: RwLock<BTreeMap<String, Gauge>>,
}

/// Monotonically increasing counter.
struct Counter {
    value: AtomicU64,
    help: String,
}

/// Value that can go up or down.
struct Gauge {
    value: AtomicI64,
    help: String,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registry pre-populated with every metric the controller reports.
    pub fn for_controller() -> Self {
        let registry = Self::new();
        registry.register_counter(RECONCILE_TOTAL, "Reconciliations processed from the work queue");
        registry.register_counter(RECONCILE_ERRORS_TOTAL, "Reconciliations requeued after a transient error");
        registry.register_counter(RECONCILE_DROPPED_TOTAL, "Work items dropped as structurally invalid");
        registry.register_counter(APPLY_TOTAL, "Apply cycles run by scaling tasks");
        registry.register_counter(APPLY_ERRORS_TOTAL, "Apply cycles abandoned after an error");
        registry.register_counter(STRATEGY_RELOADS_TOTAL, "Schedules rebuilt after a strategy change");
        registry.register_counter(POLICY_EVALUATIONS_TOTAL, "Metric policy evaluations");
        registry.register_counter(POLICY_ACTIONS_TOTAL, "Scaling actions executed successfully");
        registry.register_counter(POLICY_ACTION_ERRORS_TOTAL, "Scaling actions that failed");
        registry.register_gauge(ACTIVE_TASKS, "Scaling tasks currently running");
        registry.register_gauge(ACTIVE_POLICIES, "Metric policy evaluators currently running");
        registry
    }

    /// Register a counter. If it already exists, this is a no-op.
    pub fn register_counter(&self, name: &str, help: &str) {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        counters.entry(name.to_string()).or_insert_with(|| Counter {
            value: AtomicU64::new(0),
            help: help.to_string(),
        });
    }

    /// Register a gauge. If it already exists, this is a no-op.
    pub fn register_gauge(&self, name: &str, help: &str) {
        let mut gauges = self.gauges.write().unwrap_or_else(PoisonError::into_inner);
        gauges.entry(name.to_string()).or_insert_with(|| Gauge {
            value: AtomicI64::new(0),
            help: help.to_string(),
        });
    }

    /// Increment a counter by 1. Unregistered names are ignored.
    pub fn counter_inc(&self, name: &str) {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(c) = counters.get(name) {
            c.value.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn counter_get(&self, name: &str) -> u64 {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        counters
            .get(name)
            .map(|c| c.value.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Set a gauge to a specific value.
    pub fn gauge_set(&self, name: &str, val: i64) {
        let gauges = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(g) = gauges.get(name) {
            g.value.store(val, Ordering::Relaxed);
        }
    }

    pub fn gauge_get(&self, name: &str) -> i64 {
        let gauges = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
        gauges
            .get(name)
            .map(|g| g.value.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut output = String::new();

        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        for (name, counter) in counters.iter() {
            let _ = writeln!(output, "# HELP {} {}", name, counter.help);
            let _ = writeln!(output, "# TYPE {} counter", name);
            let _ = writeln!(output, "{} {}", name, counter.value.load(Ordering::Relaxed));
        }

        let gauges = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
        for (name, gauge) in gauges.iter() {
            let _ = writeln!(output, "# HELP {} {}", name, gauge.help);
            let _ = writeln!(output, "# TYPE {} gauge", name);
            let _ = writeln!(output, "{} {}", name, gauge.value.load(Ordering::Relaxed));
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
