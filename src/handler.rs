//! Application callback slots
//!
//! The application plugs into the processor through four typed function
//! slots registered on the builder:
//!
//! - `on_batch` (required): receives every delivered [`EventBatch`],
//!   including empty idle ticks.
//! - `on_error` (optional): receives every contained failure as a
//!   [`ProcessorError`] naming the partition and operation.
//! - `on_initializing` (optional): runs before a partition's pump starts
//!   fetching. Failures are reported but never block the pump.
//! - `on_closing` (optional): runs when a pump finishes, with the
//!   [`CloseReason`].
//!
//! Every slot is invoked inside its own spawned task, so a panic in
//! application code surfaces as a reported failure on that partition
//! instead of tearing down the runtime. Failures thrown by `on_error`
//! itself are logged and swallowed.

use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::{error, warn};

use crate::error::CapstanError;
use crate::event::{EventBatch, PartitionId};
use crate::lifecycle::CloseReason;

/// Error type application callbacks may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Batch delivery slot.
pub type BatchHandler = Arc<
    dyn Fn(PartitionContext, EventBatch) -> BoxFuture<'static, Result<(), HandlerError>>
        + Send
        + Sync,
>;

/// Error notification slot.
pub type ErrorHandler = Arc<dyn Fn(ProcessorError) -> BoxFuture<'static, ()> + Send + Sync>;

/// Partition initialization slot.
pub type InitHandler =
    Arc<dyn Fn(PartitionContext) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Partition close slot.
pub type CloseHandler = Arc<
    dyn Fn(PartitionContext, CloseReason) -> BoxFuture<'static, Result<(), HandlerError>>
        + Send
        + Sync,
>;

/// Identity of the partition a callback is invoked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionContext {
    /// The partition being processed
    pub partition_id: PartitionId,
    /// Consumer group the processor reads on behalf of
    pub consumer_group: String,
    /// Processor instance running the pump
    pub instance_id: String,
}

impl PartitionContext {
    /// Create a context.
    pub fn new(
        partition_id: impl Into<PartitionId>,
        consumer_group: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        PartitionContext {
            partition_id: partition_id.into(),
            consumer_group: consumer_group.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for PartitionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.consumer_group, self.partition_id)
    }
}

/// The runtime operation a contained failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Running the initialization callback or resolving the start position
    Initialize,
    /// Fetching events from the source
    Fetch,
    /// Delivering a batch to the application
    Deliver,
    /// Writing a checkpoint
    Checkpoint,
    /// Renewing or rebalancing partition leases
    LeaseRefresh,
    /// Stopping a pump
    Close,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Initialize => write!(f, "initialize"),
            Operation::Fetch => write!(f, "fetch"),
            Operation::Deliver => write!(f, "deliver"),
            Operation::Checkpoint => write!(f, "checkpoint"),
            Operation::LeaseRefresh => write!(f, "lease refresh"),
            Operation::Close => write!(f, "close"),
        }
    }
}

/// A contained failure delivered to the `on_error` slot.
#[derive(Debug)]
pub struct ProcessorError {
    /// Partition the failure belongs to, `None` for instance-wide work
    /// such as lease refresh
    pub partition_id: Option<PartitionId>,
    /// What the runtime was doing when the failure happened
    pub operation: Operation,
    /// The failure itself
    pub error: CapstanError,
}

impl ProcessorError {
    /// Create a processor error.
    pub fn new(
        partition_id: Option<PartitionId>,
        operation: Operation,
        error: CapstanError,
    ) -> Self {
        ProcessorError {
            partition_id,
            operation,
            error,
        }
    }
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.partition_id {
            Some(partition_id) => write!(
                f,
                "{} failed on partition '{}': {}",
                self.operation, partition_id, self.error
            ),
            None => write!(f, "{} failed: {}", self.operation, self.error),
        }
    }
}

/// The registered callback slots of one processor.
pub(crate) struct Handlers {
    pub(crate) on_batch: BatchHandler,
    pub(crate) on_error: Option<ErrorHandler>,
    pub(crate) on_initializing: Option<InitHandler>,
    pub(crate) on_closing: Option<CloseHandler>,
}

impl Handlers {
    /// Run the initialization slot for a partition. Never blocks the pump:
    /// the caller reports the error and proceeds.
    pub(crate) async fn invoke_initializing(
        &self,
        ctx: PartitionContext,
    ) -> Result<(), CapstanError> {
        let Some(on_initializing) = self.on_initializing.clone() else {
            return Ok(());
        };
        let partition_id = ctx.partition_id.clone();
        let joined = tokio::spawn(async move { on_initializing(ctx).await }).await;
        contain(&partition_id, joined)
    }

    /// Run the close slot for a partition. Failures are logged; a close
    /// callback cannot fail the close.
    pub(crate) async fn invoke_closing(&self, ctx: PartitionContext, reason: CloseReason) {
        let Some(on_closing) = self.on_closing.clone() else {
            return;
        };
        let partition_id = ctx.partition_id.clone();
        let joined = tokio::spawn(async move { on_closing(ctx, reason).await }).await;
        if let Err(err) = contain(&partition_id, joined) {
            warn!(partition_id = %partition_id, %reason, error = %err, "close callback failed");
        }
    }

    /// Deliver a failure to the error slot, logging it either way.
    pub(crate) async fn report_error(&self, processor_error: ProcessorError) {
        warn!(
            partition_id = processor_error
                .partition_id
                .as_ref()
                .map(|p| p.as_str())
                .unwrap_or("-"),
            operation = %processor_error.operation,
            error = %processor_error.error,
            "processing error"
        );
        let Some(on_error) = self.on_error.clone() else {
            return;
        };
        let joined = tokio::spawn(async move { on_error(processor_error).await }).await;
        if let Err(join_err) = joined {
            if join_err.is_panic() {
                error!("error callback panicked");
            }
        }
    }
}

/// Collapse a spawned callback's join result into a single error, turning
/// panics into [`CapstanError::Handler`].
pub(crate) fn contain(
    partition_id: &PartitionId,
    joined: Result<Result<(), HandlerError>, JoinError>,
) -> Result<(), CapstanError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(CapstanError::handler(partition_id.as_str(), err.to_string())),
        Err(join_err) => Err(CapstanError::handler(
            partition_id.as_str(),
            panic_detail(join_err),
        )),
    }
}

fn panic_detail(join_err: JoinError) -> String {
    if !join_err.is_panic() {
        return "callback task was cancelled".to_string();
    }
    let panic = join_err.into_panic();
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("callback panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("callback panicked: {message}")
    } else {
        "callback panicked".to_string()
    }
}
