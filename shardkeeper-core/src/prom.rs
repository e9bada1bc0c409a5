//! Prometheus metric names & descriptions.

pub const METRIC_ASSIGNMENT_ADDED: &str = "shardkeeper_allocator_assignment_added_total";
pub const METRIC_ASSIGNMENT_REMOVED: &str = "shardkeeper_allocator_assignment_removed_total";
pub const METRIC_ASSIGNMENT_PACKED: &str = "shardkeeper_allocator_assignment_packed_total";
pub const METRIC_CONVERGE: &str = "shardkeeper_allocator_converge_total";
pub const METRIC_MAX_FLOW_RUNTIME: &str = "shardkeeper_allocator_max_flow_runtime_seconds";
pub const METRIC_ITEMS: &str = "shardkeeper_allocator_items";
pub const METRIC_MEMBERS: &str = "shardkeeper_allocator_members";
pub const METRIC_DESIRED_SLOTS: &str = "shardkeeper_allocator_desired_replication_slots";
pub const METRIC_UNASSIGNED_SLOTS: &str = "shardkeeper_allocator_unassigned_slots";
pub const METRIC_IS_LEADER: &str = "shardkeeper_is_leader";
pub const METRIC_WATCH_ERRORS: &str = "shardkeeper_keyspace_watch_errors";
pub const METRIC_APPLIED_CHANGES: &str = "shardkeeper_apply_changes_total";

/// Register descriptions of all shardkeeper metrics.
///
/// This function should be called only once, after the global recorder is installed.
pub fn register_metrics() {
    metrics::register_counter!(METRIC_ASSIGNMENT_ADDED, metrics::Unit::Count, "Cumulative number of item / member assignments added by the allocator.");
    metrics::register_counter!(METRIC_ASSIGNMENT_REMOVED, metrics::Unit::Count, "Cumulative number of item / member assignments removed by the allocator.");
    metrics::register_counter!(
        METRIC_ASSIGNMENT_PACKED,
        metrics::Unit::Count,
        "Cumulative number of assignments moved to a different member within a single convergence pass."
    );
    metrics::register_counter!(METRIC_CONVERGE, metrics::Unit::Count, "Cumulative number of allocator convergence passes.");
    metrics::register_histogram!(METRIC_MAX_FLOW_RUNTIME, metrics::Unit::Seconds, "Duration required to re-solve the maximum assignment network flow.");
    metrics::register_gauge!(METRIC_ITEMS, metrics::Unit::Count, "Number of items known to the allocator.");
    metrics::register_gauge!(METRIC_MEMBERS, metrics::Unit::Count, "Number of members known to the allocator.");
    metrics::register_gauge!(METRIC_DESIRED_SLOTS, metrics::Unit::Count, "Number of desired item replication slots summed across all items.");
    metrics::register_gauge!(METRIC_UNASSIGNED_SLOTS, metrics::Unit::Count, "Number of desired replication slots which could not be placed.");
    metrics::register_gauge!(
        METRIC_IS_LEADER,
        metrics::Unit::Count,
        "a gauge indicating if this node is the allocator leader, where 1.0 indicates leadership, any other value does not"
    );
    metrics::register_counter!(METRIC_WATCH_ERRORS, metrics::Unit::Count, "errors observed on the keyspace watch stream");
    metrics::register_counter!(METRIC_APPLIED_CHANGES, metrics::Unit::Count, "Cumulative number of item changes committed by apply requests.");
}
