//! Per-partition event pump
//!
//! One [`PartitionPump`] runs per owned partition. Its loop is:
//! resolve the starting position from the stored checkpoint, then fetch a
//! batch, deliver it to the application, and write a checkpoint from the
//! batch's last event. The ownership token is checked before the fetch,
//! before delivery, before each retry and before the checkpoint write, so
//! a revocation stops the pump at the next step boundary without cutting
//! a batch in half.
//!
//! Failure policy:
//!
//! - Fetch errors are retried with bounded exponential backoff; when the
//!   retry budget is spent the pump closes with
//!   [`CloseReason::PumpFault`].
//! - Delivery errors (including panics in application code) rewind the
//!   read position to the last recorded checkpoint, so the same events
//!   are delivered again. The pump itself keeps running.
//! - Checkpoint write errors are reported but do not stop delivery: the
//!   in-memory position advances, and the next successful write catches
//!   the stored position up.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::{ProcessorConfig, RetryConfig, StartPosition};
use crate::event::{EventBatch, PartitionId};
use crate::handler::{contain, Handlers, Operation, PartitionContext, ProcessorError};
use crate::lifecycle::{CloseReason, OwnershipToken};
use crate::metrics;
use crate::source::{FetchPosition, PartitionSource};

/// Fetch-deliver-checkpoint loop for one owned partition.
pub(crate) struct PartitionPump {
    partition_id: PartitionId,
    consumer_group: String,
    instance_id: String,
    store: Arc<dyn CheckpointStore>,
    source: Arc<dyn PartitionSource>,
    handlers: Arc<Handlers>,
    max_batch_size: usize,
    fetch_idle_timeout: std::time::Duration,
    start_position: StartPosition,
    retry: RetryConfig,
    token: OwnershipToken,
    in_flight: Arc<Mutex<Option<AbortHandle>>>,
}

impl PartitionPump {
    pub(crate) fn new(
        partition_id: PartitionId,
        config: &ProcessorConfig,
        store: Arc<dyn CheckpointStore>,
        source: Arc<dyn PartitionSource>,
        handlers: Arc<Handlers>,
        token: OwnershipToken,
    ) -> Self {
        PartitionPump {
            partition_id,
            consumer_group: config.consumer_group.clone(),
            instance_id: config.instance_id.clone(),
            store,
            source,
            handlers,
            max_batch_size: config.max_batch_size,
            fetch_idle_timeout: config.fetch_idle_timeout,
            start_position: config.start_position,
            retry: config.fetch_retry.clone(),
            token,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    /// Abort handle slot for the batch delivery currently in flight, if
    /// any. Forced shutdown uses it to cut an abandoned handler loose.
    pub(crate) fn in_flight_slot(&self) -> Arc<Mutex<Option<AbortHandle>>> {
        self.in_flight.clone()
    }

    /// Run until the token is pulled or the pump faults.
    pub(crate) async fn run(self) -> CloseReason {
        debug!(partition_id = %self.partition_id, "pump starting");

        let mut position = match self.starting_position().await {
            Ok(position) => position,
            Err(reason) => return reason,
        };
        // where delivery failures rewind to; advanced only by a recorded
        // checkpoint
        let mut resume = position;

        loop {
            if let Some(reason) = self.token.close_reason() {
                return reason;
            }

            let batch = match self.fetch_batch(position).await {
                Ok(batch) => batch,
                Err(reason) => return reason,
            };

            if let Some(reason) = self.token.close_reason() {
                return reason;
            }

            let last_position = batch
                .last_event()
                .map(|event| (event.offset, event.sequence_number));

            match self.deliver(batch).await {
                Ok(()) => {
                    if let Some((offset, sequence_number)) = last_position {
                        position = FetchPosition::After(sequence_number);
                        // a revoked pump must not write checkpoints
                        if let Some(reason) = self.token.close_reason() {
                            return reason;
                        }
                        if self.write_checkpoint(offset, sequence_number).await {
                            resume = FetchPosition::After(sequence_number);
                        }
                    }
                }
                Err(err) => {
                    metrics::record_handler_failure(self.partition_id.as_str());
                    self.handlers
                        .report_error(ProcessorError::new(
                            Some(self.partition_id.clone()),
                            Operation::Deliver,
                            err,
                        ))
                        .await;
                    position = resume;
                }
            }
        }
    }

    /// Resolve where to start reading: the stored checkpoint when there is
    /// one, the configured start position otherwise.
    async fn starting_position(&self) -> Result<FetchPosition, CloseReason> {
        let mut attempt = 0u32;
        loop {
            if let Some(reason) = self.token.close_reason() {
                return Err(reason);
            }
            match self
                .store
                .read_checkpoint(&self.consumer_group, &self.partition_id)
                .await
            {
                Ok(Some(checkpoint)) => {
                    info!(
                        partition_id = %self.partition_id,
                        sequence_number = checkpoint.sequence_number,
                        "resuming from checkpoint"
                    );
                    return Ok(FetchPosition::After(checkpoint.sequence_number));
                }
                Ok(None) => {
                    let position = match self.start_position {
                        StartPosition::Latest => FetchPosition::Latest,
                        StartPosition::Earliest | StartPosition::FromCheckpoint => {
                            FetchPosition::Earliest
                        }
                    };
                    debug!(
                        partition_id = %self.partition_id,
                        position = ?position,
                        "no checkpoint, starting from configured position"
                    );
                    return Ok(position);
                }
                Err(err) => {
                    attempt += 1;
                    self.handlers
                        .report_error(ProcessorError::new(
                            Some(self.partition_id.clone()),
                            Operation::Initialize,
                            err,
                        ))
                        .await;
                    if attempt >= self.retry.max_attempts {
                        warn!(
                            partition_id = %self.partition_id,
                            attempts = attempt,
                            "could not load starting checkpoint, pump faulting"
                        );
                        return Err(CloseReason::PumpFault);
                    }
                    if let Some(reason) = self.backoff(attempt - 1).await {
                        return Err(reason);
                    }
                }
            }
        }
    }

    /// Fetch one batch, retrying transient failures with bounded backoff.
    async fn fetch_batch(&self, position: FetchPosition) -> Result<EventBatch, CloseReason> {
        let mut attempt = 0u32;
        loop {
            if let Some(reason) = self.token.close_reason() {
                return Err(reason);
            }
            match self
                .source
                .fetch(
                    &self.partition_id,
                    position,
                    self.max_batch_size,
                    self.fetch_idle_timeout,
                )
                .await
            {
                Ok(batch) => return Ok(batch),
                Err(err) => {
                    attempt += 1;
                    warn!(
                        partition_id = %self.partition_id,
                        attempt,
                        error = %err,
                        "fetch failed"
                    );
                    self.handlers
                        .report_error(ProcessorError::new(
                            Some(self.partition_id.clone()),
                            Operation::Fetch,
                            err,
                        ))
                        .await;
                    if attempt >= self.retry.max_attempts {
                        warn!(
                            partition_id = %self.partition_id,
                            attempts = attempt,
                            "fetch retries exhausted, pump faulting"
                        );
                        return Err(CloseReason::PumpFault);
                    }
                    if let Some(reason) = self.backoff(attempt - 1).await {
                        return Err(reason);
                    }
                }
            }
        }
    }

    /// Hand a batch to the application in its own task, containing panics.
    async fn deliver(&self, batch: EventBatch) -> Result<(), crate::error::CapstanError> {
        let event_count = batch.len();
        let ctx = PartitionContext::new(
            self.partition_id.clone(),
            self.consumer_group.clone(),
            self.instance_id.clone(),
        );
        let handler = self.handlers.on_batch.clone();
        let join_handle = tokio::spawn(async move { handler(ctx, batch).await });
        *self.in_flight.lock() = Some(join_handle.abort_handle());
        let joined = join_handle.await;
        *self.in_flight.lock() = None;

        let result = contain(&self.partition_id, joined);
        if result.is_ok() {
            metrics::record_batch_delivered(self.partition_id.as_str(), event_count);
            if event_count > 0 {
                debug!(
                    partition_id = %self.partition_id,
                    events = event_count,
                    "batch delivered"
                );
            }
        }
        result
    }

    /// Write a checkpoint for a delivered batch. Returns whether the write
    /// was recorded.
    async fn write_checkpoint(&self, offset: i64, sequence_number: i64) -> bool {
        let checkpoint = Checkpoint::new(
            self.partition_id.clone(),
            self.consumer_group.clone(),
            offset,
            sequence_number,
        );
        match self.store.write_checkpoint(&checkpoint).await {
            Ok(()) => {
                metrics::record_checkpoint_written(self.partition_id.as_str());
                true
            }
            Err(err) => {
                metrics::record_checkpoint_write_failure(self.partition_id.as_str());
                self.handlers
                    .report_error(ProcessorError::new(
                        Some(self.partition_id.clone()),
                        Operation::Checkpoint,
                        err,
                    ))
                    .await;
                false
            }
        }
    }

    /// Sleep out a retry delay, waking early when the token is revoked.
    async fn backoff(&self, attempt: u32) -> Option<CloseReason> {
        let mut token = self.token.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.retry.delay_for(attempt)) => None,
            reason = token.revoked() => Some(reason),
        }
    }
}
