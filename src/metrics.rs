//! Metrics emitted by the processor runtime
//!
//! All metrics go through the `metrics` facade; the embedding application
//! installs whatever recorder/exporter it wants. When the `metrics`
//! feature is disabled every function here compiles to a no-op, keeping
//! call sites unconditional.

#[cfg(feature = "metrics")]
use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register descriptions for every capstan metric with the installed
/// recorder. Optional; call it once after installing a recorder if your
/// exporter surfaces help texts.
#[cfg(feature = "metrics")]
pub fn describe_metrics() {
    describe_counter!(
        "capstan_batches_delivered_total",
        "Event batches delivered to the application"
    );
    describe_counter!(
        "capstan_events_delivered_total",
        "Events delivered to the application"
    );
    describe_counter!(
        "capstan_handler_failures_total",
        "Batch deliveries that failed in application code"
    );
    describe_counter!(
        "capstan_checkpoints_written_total",
        "Checkpoints successfully written"
    );
    describe_counter!(
        "capstan_checkpoint_write_failures_total",
        "Checkpoint writes that failed"
    );
    describe_counter!(
        "capstan_leases_claimed_total",
        "Partition leases claimed by this instance"
    );
    describe_counter!(
        "capstan_leases_released_total",
        "Partition leases voluntarily released by this instance"
    );
    describe_counter!(
        "capstan_leases_lost_total",
        "Partition leases lost to other instances"
    );
    describe_counter!("capstan_pump_faults_total", "Pumps closed by a fault");
    describe_gauge!(
        "capstan_owned_partitions",
        "Partitions currently owned by this instance"
    );
}

/// Record a batch delivered to the application.
#[cfg(feature = "metrics")]
pub fn record_batch_delivered(partition_id: &str, event_count: usize) {
    counter!(
        "capstan_batches_delivered_total",
        "partition" => partition_id.to_string()
    )
    .increment(1);
    counter!(
        "capstan_events_delivered_total",
        "partition" => partition_id.to_string()
    )
    .increment(event_count as u64);
}

/// Record a batch delivery that failed in application code.
#[cfg(feature = "metrics")]
pub fn record_handler_failure(partition_id: &str) {
    counter!(
        "capstan_handler_failures_total",
        "partition" => partition_id.to_string()
    )
    .increment(1);
}

/// Record a checkpoint write.
#[cfg(feature = "metrics")]
pub fn record_checkpoint_written(partition_id: &str) {
    counter!(
        "capstan_checkpoints_written_total",
        "partition" => partition_id.to_string()
    )
    .increment(1);
}

/// Record a failed checkpoint write.
#[cfg(feature = "metrics")]
pub fn record_checkpoint_write_failure(partition_id: &str) {
    counter!(
        "capstan_checkpoint_write_failures_total",
        "partition" => partition_id.to_string()
    )
    .increment(1);
}

/// Record a claimed partition lease.
#[cfg(feature = "metrics")]
pub fn record_lease_claimed(partition_id: &str) {
    counter!(
        "capstan_leases_claimed_total",
        "partition" => partition_id.to_string()
    )
    .increment(1);
}

/// Record a voluntarily released partition lease.
#[cfg(feature = "metrics")]
pub fn record_lease_released(partition_id: &str) {
    counter!(
        "capstan_leases_released_total",
        "partition" => partition_id.to_string()
    )
    .increment(1);
}

/// Record a lease lost to another instance.
#[cfg(feature = "metrics")]
pub fn record_lease_lost(partition_id: &str) {
    counter!(
        "capstan_leases_lost_total",
        "partition" => partition_id.to_string()
    )
    .increment(1);
}

/// Record a pump closed by a fault.
#[cfg(feature = "metrics")]
pub fn record_pump_fault(partition_id: &str) {
    counter!(
        "capstan_pump_faults_total",
        "partition" => partition_id.to_string()
    )
    .increment(1);
}

/// Update the owned-partition gauge.
#[cfg(feature = "metrics")]
pub fn record_owned_partitions(count: usize) {
    gauge!("capstan_owned_partitions").set(count as f64);
}

// ============================================================================
// No-op implementations when metrics feature is disabled
// ============================================================================

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn describe_metrics() {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_batch_delivered(_partition_id: &str, _event_count: usize) {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_handler_failure(_partition_id: &str) {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_checkpoint_written(_partition_id: &str) {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_checkpoint_write_failure(_partition_id: &str) {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_lease_claimed(_partition_id: &str) {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_lease_released(_partition_id: &str) {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_lease_lost(_partition_id: &str) {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_pump_fault(_partition_id: &str) {}

#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_owned_partitions(_count: usize) {}
