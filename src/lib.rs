#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Capstan
//!
//! Capstan is a partitioned event-stream processor runtime. A fleet of
//! identical instances shares the partitions of a stream through leased
//! ownership records in a checkpoint store; each instance runs one pump
//! per owned partition, delivers event batches to application callbacks,
//! and records progress as durable checkpoints so processing resumes
//! where it left off after restarts and failovers.
//!
//! ## Features
//!
//! - **Leased ownership**: partitions are claimed through compare-and-set
//!   ownership records; instances join and leave without coordination
//! - **Gradual balancing**: each instance claims one partition per refresh
//!   cycle and hands surplus partitions back, converging on an even split
//! - **At-least-once delivery**: checkpoints are written after successful
//!   delivery; failures replay from the last recorded checkpoint
//! - **Fault isolation**: a panicking callback or a faulted pump never
//!   takes down the processor or its other partitions
//! - **Pluggable persistence**: [`CheckpointStore`] and [`PartitionSource`]
//!   are traits; in-memory and file-backed stores ship in the crate
//!
//! ## Quick Start
//!
//! ```no_run
//! use capstan::{EventProcessor, InMemoryCheckpointStore, InMemorySource, ProcessorConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> capstan::Result<()> {
//!     let store = Arc::new(InMemoryCheckpointStore::new());
//!     let source = Arc::new(InMemorySource::with_partition_count(4));
//!
//!     let processor = EventProcessor::builder(
//!         ProcessorConfig::new("billing"),
//!         store,
//!         source.clone(),
//!     )
//!     .on_batch(|ctx, batch| async move {
//!         for event in &batch.events {
//!             println!("{}: {} bytes", ctx.partition_id, event.body.len());
//!         }
//!         Ok(())
//!     })
//!     .build()?;
//!
//!     processor.start().await?;
//!     source.append("0", "hello")?;
//!     tokio::time::sleep(Duration::from_secs(1)).await;
//!     processor.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`processor`]: the [`EventProcessor`] façade and lease coordinator,
//!   driving one internal pump per owned partition
//! - [`lease`]: lease renewal, claiming and load balancing
//! - [`checkpoint`]: checkpoint and ownership records, the store trait
//! - [`store`]: in-memory and file-backed [`CheckpointStore`]s
//! - [`source`]: the [`PartitionSource`] trait and an in-memory stream
//! - [`handler`]: application callback slots and error reporting
//! - [`lifecycle`]: partition states, close reasons, ownership tokens
//! - [`config`]: processor configuration and retry policy
//! - [`error`]: error types and Result alias

// Deny .unwrap() in production code to prevent panics in the runtime.
// Test code is exempt via #[cfg(test)] and --cfg test.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod lease;
pub mod lifecycle;
pub mod processor;
pub mod source;
pub mod store;

pub(crate) mod pump;

// Metrics module - always available (provides no-ops when feature disabled)
pub(crate) mod metrics;

// Re-export commonly used types
pub use checkpoint::{resolve_claim, Checkpoint, CheckpointStore, ClaimOutcome, OwnershipRecord};
pub use config::{ProcessorConfig, RetryConfig, StartPosition};
pub use error::{CapstanError, Result};
pub use event::{Event, EventBatch, PartitionId};
pub use handler::{HandlerError, Operation, PartitionContext, ProcessorError};
pub use lease::{LeaseAssignment, LeaseManager};
pub use lifecycle::{CloseReason, PartitionState};
pub use metrics::describe_metrics;
pub use processor::{EventProcessor, EventProcessorBuilder};
pub use source::{FetchPosition, InMemorySource, PartitionSource};
pub use store::{FileCheckpointStore, InMemoryCheckpointStore};
