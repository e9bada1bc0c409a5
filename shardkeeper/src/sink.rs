//! The metrics sink injected into the allocator & protocol handlers.

use std::sync::Arc;
use std::time::Duration;

use shardkeeper_core::prom::*;

/// A shared handle to a metrics sink.
pub type SinkRef = Arc<dyn MetricsSink>;

/// A receiver of allocator & protocol metrics.
pub trait MetricsSink: Send + Sync + 'static {
    fn assignments_added(&self, count: u64);
    fn assignments_removed(&self, count: u64);
    fn assignments_packed(&self, count: u64);
    /// Record the start of a convergence pass.
    fn converge_pass(&self);
    fn solver_runtime(&self, elapsed: Duration);
    /// Record the size of the allocation problem observed by a convergence pass.
    fn allocation_size(&self, items: usize, members: usize, desired_slots: usize, unassigned_slots: usize);
    fn leader(&self, is_leader: bool);
    fn watch_error(&self);
    fn changes_applied(&self, count: u64);
}

/// A sink forwarding to the globally installed `metrics` recorder.
pub struct PrometheusSink;

impl PrometheusSink {
    /// Create a new instance, registering metric descriptions with the installed recorder.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        register_metrics();
        Self
    }
}

impl MetricsSink for PrometheusSink {
    fn assignments_added(&self, count: u64) {
        metrics::counter!(METRIC_ASSIGNMENT_ADDED, count);
    }

    fn assignments_removed(&self, count: u64) {
        metrics::counter!(METRIC_ASSIGNMENT_REMOVED, count);
    }

    fn assignments_packed(&self, count: u64) {
        metrics::counter!(METRIC_ASSIGNMENT_PACKED, count);
    }

    fn converge_pass(&self) {
        metrics::increment_counter!(METRIC_CONVERGE);
    }

    fn solver_runtime(&self, elapsed: Duration) {
        metrics::histogram!(METRIC_MAX_FLOW_RUNTIME, elapsed.as_secs_f64());
    }

    fn allocation_size(&self, items: usize, members: usize, desired_slots: usize, unassigned_slots: usize) {
        metrics::gauge!(METRIC_ITEMS, items as f64);
        metrics::gauge!(METRIC_MEMBERS, members as f64);
        metrics::gauge!(METRIC_DESIRED_SLOTS, desired_slots as f64);
        metrics::gauge!(METRIC_UNASSIGNED_SLOTS, unassigned_slots as f64);
    }

    fn leader(&self, is_leader: bool) {
        let value = if is_leader { 1.0 } else { 0.0 };
        metrics::gauge!(METRIC_IS_LEADER, value);
    }

    fn watch_error(&self) {
        metrics::increment_counter!(METRIC_WATCH_ERRORS);
    }

    fn changes_applied(&self, count: u64) {
        metrics::counter!(METRIC_APPLIED_CHANGES, count);
    }
}
