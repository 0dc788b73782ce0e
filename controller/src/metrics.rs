//! Prometheus metrics for the control plane loops.

use metrics::{counter, gauge, histogram};

pub fn leadership(acquired: bool) {
    gauge!("controller_is_leader").set(if acquired { 1.0 } else { 0.0 });
    if acquired {
        counter!("controller_leader_acquisitions_total").increment(1);
    } else {
        counter!("controller_leader_losses_total").increment(1);
    }
}

pub fn observe_tick(workspaces: usize, duration_secs: f64) {
    counter!("observer_ticks_total").increment(1);
    gauge!("observer_workspaces").set(workspaces as f64);
    histogram!("observer_tick_duration_seconds").record(duration_secs);
}

pub fn phase_count(phase: &str, count: usize) {
    gauge!("workspaces_by_phase", "phase" => phase.to_string()).set(count as f64);
}

pub fn operation_claimed(operation: &str) {
    counter!("operations_claimed_total", "operation" => operation.to_string()).increment(1);
}

pub fn operation_completed(operation: &str) {
    counter!("operations_completed_total", "operation" => operation.to_string()).increment(1);
}

pub fn operation_failed(operation: &str, reason: &str, terminal: bool) {
    counter!(
        "operation_failures_total",
        "operation" => operation.to_string(),
        "reason" => reason.to_string(),
        "terminal" => terminal.to_string(),
    )
    .increment(1);
}

pub fn ttl_transition(target: &str) {
    counter!("ttl_transitions_total", "target" => target.to_string()).increment(1);
}

pub fn gc_sweep(objects_seen: usize, deleted: usize, protected: usize) {
    counter!("gc_sweeps_total").increment(1);
    counter!("gc_objects_deleted_total").increment(deleted as u64);
    gauge!("gc_objects_seen").set(objects_seen as f64);
    gauge!("gc_objects_protected").set(protected as f64);
}

pub fn cdc_forwarded() {
    counter!("cdc_notifications_forwarded_total").increment(1);
}
