//! Event processor façade and lifecycle coordinator
//!
//! [`EventProcessor`] ties the pieces together: a [`LeaseManager`] that
//! decides which partitions this instance owns, one pump task per owned
//! partition, and the application's callback slots. `start()` spawns a
//! coordinator task that ticks every lease refresh interval; each tick it
//! renews leases, starts pumps for newly owned partitions, revokes pumps
//! for lost ones, and reaps pumps that have finished.
//!
//! Fault containment is per partition: a pump that faults is closed and
//! its partition, still leased, gets a fresh pump on a later tick, which
//! resumes from the last checkpoint. Other partitions never notice.
//!
//! `stop()` revokes every pump, waits up to the shutdown grace for
//! in-flight batches to finish, aborts and reports whatever is still
//! running, releases this instance's leases, and returns the processor to
//! the stopped state. A stopped processor can be started again.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointStore, OwnershipRecord};
use crate::config::ProcessorConfig;
use crate::error::{CapstanError, Result};
use crate::event::{EventBatch, PartitionId};
use crate::handler::{
    BatchHandler, CloseHandler, ErrorHandler, HandlerError, Handlers, InitHandler, Operation,
    PartitionContext, ProcessorError,
};
use crate::lease::LeaseManager;
use crate::lifecycle::{CloseReason, OwnershipHandle, PartitionState};
use crate::metrics;
use crate::pump::PartitionPump;
use crate::source::PartitionSource;

// extra time granted after aborting an abandoned handler, so the pump can
// observe the revoke and run its close path
const FORCED_DRAIN: Duration = Duration::from_secs(1);

/// Builder for [`EventProcessor`]. Created by [`EventProcessor::builder`].
pub struct EventProcessorBuilder {
    config: ProcessorConfig,
    store: Arc<dyn CheckpointStore>,
    source: Arc<dyn PartitionSource>,
    on_batch: Option<BatchHandler>,
    on_error: Option<ErrorHandler>,
    on_initializing: Option<InitHandler>,
    on_closing: Option<CloseHandler>,
}

impl EventProcessorBuilder {
    /// Register the required batch delivery callback. It receives every
    /// batch, including empty idle ticks.
    pub fn on_batch<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(PartitionContext, EventBatch) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.on_batch = Some(Arc::new(move |ctx, batch| Box::pin(handler(ctx, batch))));
        self
    }

    /// Register the error callback. It receives every contained failure
    /// with partition and operation context.
    pub fn on_error<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ProcessorError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(Arc::new(move |err| Box::pin(handler(err))));
        self
    }

    /// Register the partition initialization callback. Failures are
    /// reported through the error callback but never stop the pump from
    /// starting.
    pub fn on_initializing<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(PartitionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.on_initializing = Some(Arc::new(move |ctx| Box::pin(handler(ctx))));
        self
    }

    /// Register the partition close callback. It runs when a pump
    /// finishes, with the reason it stopped.
    pub fn on_closing<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(PartitionContext, CloseReason) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.on_closing = Some(Arc::new(move |ctx, reason| Box::pin(handler(ctx, reason))));
        self
    }

    /// Validate the configuration and build the processor.
    ///
    /// # Errors
    ///
    /// Returns [`CapstanError::Config`] when the configuration is invalid
    /// or no `on_batch` callback was registered.
    pub fn build(self) -> Result<EventProcessor> {
        self.config.validate()?;
        let on_batch = self
            .on_batch
            .ok_or_else(|| CapstanError::config("an on_batch callback is required"))?;
        let handlers = Arc::new(Handlers {
            on_batch,
            on_error: self.on_error,
            on_initializing: self.on_initializing,
            on_closing: self.on_closing,
        });
        let lease = Arc::new(LeaseManager::new(
            self.store.clone(),
            self.config.instance_id.clone(),
            self.config.lease_duration,
        ));
        Ok(EventProcessor {
            config: self.config,
            store: self.store,
            source: self.source,
            handlers,
            lease,
            pumps: Arc::new(DashMap::new()),
            state: Mutex::new(RunState::Stopped),
        })
    }
}

enum RunState {
    Stopped,
    Running {
        shutdown_tx: watch::Sender<bool>,
        coordinator: JoinHandle<()>,
    },
}

struct PartitionHandle {
    handle: OwnershipHandle,
    task: JoinHandle<CloseReason>,
    in_flight: Arc<Mutex<Option<AbortHandle>>>,
    state: Arc<Mutex<PartitionState>>,
}

/// A partitioned event-stream processor instance.
///
/// Share it behind an [`Arc`] if several tasks need access; all methods
/// take `&self`.
pub struct EventProcessor {
    config: ProcessorConfig,
    store: Arc<dyn CheckpointStore>,
    source: Arc<dyn PartitionSource>,
    handlers: Arc<Handlers>,
    lease: Arc<LeaseManager>,
    pumps: Arc<DashMap<PartitionId, PartitionHandle>>,
    state: Mutex<RunState>,
}

impl EventProcessor {
    /// Start building a processor over a store and a source.
    pub fn builder(
        config: ProcessorConfig,
        store: Arc<dyn CheckpointStore>,
        source: Arc<dyn PartitionSource>,
    ) -> EventProcessorBuilder {
        EventProcessorBuilder {
            config,
            store,
            source,
            on_batch: None,
            on_error: None,
            on_initializing: None,
            on_closing: None,
        }
    }

    /// The instance id used in ownership records.
    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Whether the processor is currently running.
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), RunState::Running { .. })
    }

    /// Partitions this instance currently runs pumps for, sorted.
    pub fn owned_partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> =
            self.pumps.iter().map(|entry| entry.key().clone()).collect();
        partitions.sort();
        partitions
    }

    /// Lifecycle state of every partition with a pump, sorted by
    /// partition.
    pub fn partition_states(&self) -> Vec<(PartitionId, PartitionState)> {
        let mut states: Vec<(PartitionId, PartitionState)> = self
            .pumps
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value().state.lock()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Begin claiming partitions and delivering events.
    ///
    /// Returns immediately after spawning the coordinator; partitions are
    /// claimed gradually across lease refresh cycles.
    ///
    /// # Errors
    ///
    /// Returns [`CapstanError::InvalidState`] if the processor is already
    /// running.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if matches!(*state, RunState::Running { .. }) {
            return Err(CapstanError::invalid_state("start", "running"));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let coordinator = Coordinator {
            config: self.config.clone(),
            store: self.store.clone(),
            source: self.source.clone(),
            handlers: self.handlers.clone(),
            lease: self.lease.clone(),
            pumps: self.pumps.clone(),
        };
        let task = tokio::spawn(coordinator.run(shutdown_rx));
        *state = RunState::Running {
            shutdown_tx,
            coordinator: task,
        };
        info!(
            instance_id = %self.config.instance_id,
            consumer_group = %self.config.consumer_group,
            "processor started"
        );
        Ok(())
    }

    /// Stop processing: revoke every pump, drain in-flight batches within
    /// the shutdown grace, release held leases.
    ///
    /// Batches still running when the grace expires are aborted and
    /// reported as abandoned through the error callback. Stopping a
    /// processor that is not running is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let (shutdown_tx, coordinator) = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, RunState::Stopped) {
                RunState::Stopped => return Ok(()),
                RunState::Running {
                    shutdown_tx,
                    coordinator,
                } => (shutdown_tx, coordinator),
            }
        };

        info!(instance_id = %self.config.instance_id, "processor stopping");
        let _ = shutdown_tx.send(true);
        if coordinator.await.is_err() {
            warn!("coordinator task panicked");
        }

        // revoke everything, then drain against one shared deadline
        for entry in self.pumps.iter() {
            *entry.value().state.lock() = PartitionState::Closing;
            entry.value().handle.revoke(CloseReason::Shutdown);
        }

        let keys: Vec<PartitionId> = self.pumps.iter().map(|entry| entry.key().clone()).collect();
        let mut draining = Vec::new();
        for key in &keys {
            if let Some((partition_id, handle)) = self.pumps.remove(key) {
                draining.push((partition_id, handle));
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        let mut abandoned = Vec::new();
        for (partition_id, mut handle) in draining {
            match tokio::time::timeout_at(deadline, &mut handle.task).await {
                Ok(Ok(reason)) => {
                    debug!(partition_id = %partition_id, %reason, "pump drained")
                }
                Ok(Err(_)) => warn!(partition_id = %partition_id, "pump task panicked"),
                Err(_) => abandoned.push((partition_id, handle)),
            }
        }

        if !abandoned.is_empty() {
            for (partition_id, handle) in &abandoned {
                warn!(
                    partition_id = %partition_id,
                    "shutdown grace expired, abandoning in-flight batch handler"
                );
                if let Some(abort) = handle.in_flight.lock().take() {
                    abort.abort();
                }
                self.handlers
                    .report_error(ProcessorError::new(
                        Some(partition_id.clone()),
                        Operation::Close,
                        CapstanError::handler(
                            partition_id.as_str(),
                            "batch handler abandoned at shutdown",
                        ),
                    ))
                    .await;
            }
            let force_deadline = tokio::time::Instant::now() + FORCED_DRAIN;
            for (partition_id, mut handle) in abandoned {
                if tokio::time::timeout_at(force_deadline, &mut handle.task)
                    .await
                    .is_err()
                {
                    warn!(partition_id = %partition_id, "force-aborting pump task");
                    handle.task.abort();
                }
            }
        }

        // hand the leases back; anything we fail to enumerate expires on
        // its own
        let owned: Vec<PartitionId> = match self.store.list_ownership().await {
            Ok(records) => records
                .into_iter()
                .filter(|record| record.is_owned_by(self.config.instance_id.as_str()))
                .map(|record| record.partition_id)
                .collect(),
            Err(err) => {
                warn!(error = %err, "could not enumerate leases at shutdown");
                Vec::new()
            }
        };
        self.lease.release_all(&owned).await;
        metrics::record_owned_partitions(0);

        info!(instance_id = %self.config.instance_id, "processor stopped");
        Ok(())
    }
}

struct Coordinator {
    config: ProcessorConfig,
    store: Arc<dyn CheckpointStore>,
    source: Arc<dyn PartitionSource>,
    handlers: Arc<Handlers>,
    lease: Arc<LeaseManager>,
    pumps: Arc<DashMap<PartitionId, PartitionHandle>>,
}

impl Coordinator {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.lease_refresh_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh_cycle().await,
                _ = shutdown_rx.changed() => {
                    debug!("coordinator stopping");
                    break;
                }
            }
        }
    }

    /// One lease refresh tick: reap finished pumps, refresh assignments,
    /// reconcile running pumps with what we own.
    async fn refresh_cycle(&self) {
        self.reap_finished_pumps();

        let partitions = match self.source.list_partitions().await {
            Ok(partitions) => partitions,
            Err(err) => {
                self.handlers
                    .report_error(ProcessorError::new(None, Operation::LeaseRefresh, err))
                    .await;
                return;
            }
        };

        let assignment = match self.lease.refresh_assignments(&partitions).await {
            Ok(assignment) => assignment,
            Err(err) => {
                self.handlers
                    .report_error(ProcessorError::new(None, Operation::LeaseRefresh, err))
                    .await;
                return;
            }
        };

        let owned: HashSet<&PartitionId> = assignment
            .owned
            .iter()
            .map(|record| &record.partition_id)
            .collect();

        // pumps for partitions we no longer own get revoked; this also
        // covers partitions voluntarily released this cycle
        for entry in self.pumps.iter() {
            if !owned.contains(entry.key()) {
                warn!(partition_id = %entry.key(), "ownership lost, revoking pump");
                *entry.value().state.lock() = PartitionState::Closing;
                entry.value().handle.revoke(CloseReason::OwnershipLost);
            }
        }

        for record in &assignment.owned {
            match self.pumps.get(&record.partition_id) {
                Some(entry) => entry.value().handle.extend(record.expires_at),
                None => self.start_partition(record),
            }
        }

        metrics::record_owned_partitions(assignment.owned.len());
    }

    fn reap_finished_pumps(&self) {
        self.pumps.retain(|partition_id, handle| {
            if handle.task.is_finished() {
                debug!(partition_id = %partition_id, "pump finished, removing");
                false
            } else {
                true
            }
        });
    }

    fn start_partition(&self, record: &OwnershipRecord) {
        info!(partition_id = %record.partition_id, "starting pump");
        let (handle, token) = OwnershipHandle::new(record.expires_at);
        let pump = PartitionPump::new(
            record.partition_id.clone(),
            &self.config,
            self.store.clone(),
            self.source.clone(),
            self.handlers.clone(),
            token,
        );
        let in_flight = pump.in_flight_slot();
        let state = Arc::new(Mutex::new(PartitionState::Initializing));
        let ctx = PartitionContext::new(
            record.partition_id.clone(),
            self.config.consumer_group.clone(),
            self.config.instance_id.clone(),
        );
        let task = tokio::spawn(partition_task(
            pump,
            self.handlers.clone(),
            ctx,
            state.clone(),
        ));
        self.pumps.insert(
            record.partition_id.clone(),
            PartitionHandle {
                handle,
                task,
                in_flight,
                state,
            },
        );
    }
}

/// The full life of one pump: initialization callback, the pump loop,
/// then the close callback with the reason it stopped.
async fn partition_task(
    pump: PartitionPump,
    handlers: Arc<Handlers>,
    ctx: PartitionContext,
    state: Arc<Mutex<PartitionState>>,
) -> CloseReason {
    if let Err(err) = handlers.invoke_initializing(ctx.clone()).await {
        // reported but never gating
        handlers
            .report_error(ProcessorError::new(
                Some(ctx.partition_id.clone()),
                Operation::Initialize,
                err,
            ))
            .await;
    }
    *state.lock() = PartitionState::Active;

    let reason = pump.run().await;
    *state.lock() = PartitionState::Closing;

    match reason {
        CloseReason::PumpFault => {
            metrics::record_pump_fault(ctx.partition_id.as_str());
            warn!(partition_id = %ctx.partition_id, "pump closed by fault");
        }
        reason => info!(partition_id = %ctx.partition_id, %reason, "pump closed"),
    }

    handlers.invoke_closing(ctx, reason).await;
    *state.lock() = PartitionState::Closed;
    reason
}
