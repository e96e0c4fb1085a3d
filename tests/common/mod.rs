//! Shared test fixtures and utilities for capstan integration tests
//!
//! This module provides common test infrastructure that can be reused
//! across multiple test files, reducing code duplication and ensuring
//! consistent test patterns.
//!
//! # Usage
//!
//! In your test file, add:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```
//!
//! # Features
//!
//! - `fast_config`: processor configuration tuned for quick test cycles
//! - `DeliveryLog` / `ErrorLog`: thread-safe recorders for callback output
//! - `FlakyCheckpointStore` / `FlakySource`: fault-injecting wrappers
//! - `wait_until`: polling helper with a hard deadline
//! - `init_logging`: tracing subscriber wired to the test writer

#![allow(dead_code)]

use async_trait::async_trait;
use capstan::{
    CapstanError, Checkpoint, CheckpointStore, ClaimOutcome, EventBatch, FetchPosition,
    InMemoryCheckpointStore, InMemorySource, Operation, OwnershipRecord, PartitionId,
    PartitionSource, ProcessorConfig, ProcessorError, Result, RetryConfig, StartPosition,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Logging
// ============================================================================

/// Initialize test logging. Safe to call from every test; only the first
/// call installs the subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("capstan=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Configuration
// ============================================================================

/// Processor configuration tuned for tests: tight refresh and poll
/// intervals, a lease long enough that tokens never expire mid-test.
pub fn fast_config(consumer_group: &str, instance_id: &str) -> ProcessorConfig {
    ProcessorConfig::new(consumer_group)
        .with_instance_id(instance_id)
        .with_lease_duration(Duration::from_secs(2))
        .with_lease_refresh_interval(Duration::from_millis(25))
        .with_fetch_idle_timeout(Duration::from_millis(25))
        .with_start_position(StartPosition::Earliest)
        .with_shutdown_grace(Duration::from_millis(500))
        .with_fetch_retry(RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
        })
}

// ============================================================================
// Polling
// ============================================================================

/// Poll `condition` until it holds, panicking with `what` after ten
/// seconds. Generous deadline so loaded CI machines do not flake.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Callback Recorders
// ============================================================================

/// Records every delivered batch, preserving per-partition order.
#[derive(Default)]
pub struct DeliveryLog {
    batches: Mutex<Vec<(PartitionId, Vec<String>)>>,
    events: AtomicUsize,
}

impl DeliveryLog {
    pub fn new() -> Arc<Self> {
        Arc::new(DeliveryLog::default())
    }

    pub fn record(&self, batch: &EventBatch) {
        let bodies = batch
            .events
            .iter()
            .map(|event| String::from_utf8_lossy(&event.body).into_owned())
            .collect();
        self.batches
            .lock()
            .push((batch.partition_id.clone(), bodies));
        self.events.fetch_add(batch.len(), Ordering::SeqCst);
    }

    /// Total events delivered so far, across all partitions.
    pub fn event_count(&self) -> usize {
        self.events.load(Ordering::SeqCst)
    }

    /// Batches delivered so far, including empty idle batches.
    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    /// Event bodies delivered for one partition, in delivery order.
    pub fn bodies_for(&self, partition_id: &PartitionId) -> Vec<String> {
        self.batches
            .lock()
            .iter()
            .filter(|(id, _)| id == partition_id)
            .flat_map(|(_, bodies)| bodies.iter().cloned())
            .collect()
    }
}

/// Records every error reported through the `on_error` callback.
#[derive(Default)]
pub struct ErrorLog {
    entries: Mutex<Vec<(Option<PartitionId>, Operation, String)>>,
}

impl ErrorLog {
    pub fn new() -> Arc<Self> {
        Arc::new(ErrorLog::default())
    }

    pub fn record(&self, error: &ProcessorError) {
        self.entries.lock().push((
            error.partition_id.clone(),
            error.operation,
            error.error.to_string(),
        ));
    }

    pub fn count_for(&self, operation: Operation) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|(_, op, _)| *op == operation)
            .count()
    }

    pub fn entries(&self) -> Vec<(Option<PartitionId>, Operation, String)> {
        self.entries.lock().clone()
    }
}

// ============================================================================
// Fault Injection
// ============================================================================

/// Checkpoint store wrapper that fails a fixed number of checkpoint
/// writes before recovering. Everything else delegates to the wrapped
/// in-memory store.
pub struct FlakyCheckpointStore {
    inner: InMemoryCheckpointStore,
    write_failures_left: AtomicUsize,
}

impl FlakyCheckpointStore {
    pub fn failing_writes(count: usize) -> Arc<Self> {
        Arc::new(FlakyCheckpointStore {
            inner: InMemoryCheckpointStore::new(),
            write_failures_left: AtomicUsize::new(count),
        })
    }

    fn take_failure(&self) -> bool {
        self.write_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl CheckpointStore for FlakyCheckpointStore {
    async fn read_checkpoint(
        &self,
        consumer_group: &str,
        partition_id: &PartitionId,
    ) -> Result<Option<Checkpoint>> {
        self.inner.read_checkpoint(consumer_group, partition_id).await
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        if self.take_failure() {
            return Err(CapstanError::store(
                "write_checkpoint",
                "injected write failure",
            ));
        }
        self.inner.write_checkpoint(checkpoint).await
    }

    async fn read_ownership(&self, partition_id: &PartitionId) -> Result<Option<OwnershipRecord>> {
        self.inner.read_ownership(partition_id).await
    }

    async fn list_ownership(&self) -> Result<Vec<OwnershipRecord>> {
        self.inner.list_ownership().await
    }

    async fn claim_ownership(
        &self,
        partition_id: &PartitionId,
        owner_id: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome> {
        self.inner.claim_ownership(partition_id, owner_id, lease).await
    }

    async fn release_ownership(&self, partition_id: &PartitionId, owner_id: &str) -> Result<()> {
        self.inner.release_ownership(partition_id, owner_id).await
    }
}

/// Partition source wrapper that fails fetches for one partition until
/// the failure budget is spent. Other partitions are untouched.
pub struct FlakySource {
    inner: Arc<InMemorySource>,
    failing_partition: PartitionId,
    fetch_failures_left: AtomicUsize,
}

impl FlakySource {
    pub fn failing_fetches(
        inner: Arc<InMemorySource>,
        partition_id: impl Into<PartitionId>,
        count: usize,
    ) -> Arc<Self> {
        Arc::new(FlakySource {
            inner,
            failing_partition: partition_id.into(),
            fetch_failures_left: AtomicUsize::new(count),
        })
    }

    fn take_failure(&self) -> bool {
        self.fetch_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl PartitionSource for FlakySource {
    async fn list_partitions(&self) -> Result<Vec<PartitionId>> {
        self.inner.list_partitions().await
    }

    async fn fetch(
        &self,
        partition_id: &PartitionId,
        position: FetchPosition,
        max_count: usize,
        idle_timeout: Duration,
    ) -> Result<EventBatch> {
        if *partition_id == self.failing_partition && self.take_failure() {
            return Err(CapstanError::fetch(
                partition_id.as_str(),
                "injected fetch failure",
            ));
        }
        self.inner
            .fetch(partition_id, position, max_count, idle_timeout)
            .await
    }
}
