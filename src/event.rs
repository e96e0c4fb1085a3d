//! Core event types
//!
//! An [`Event`] is a single record read from one partition of a stream:
//! an opaque payload plus the positional metadata (offset, sequence number)
//! the runtime needs to checkpoint progress. Events are handed to the
//! application grouped into an [`EventBatch`], always from a single
//! partition and ordered by sequence number.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::checkpoint::Checkpoint;

/// Identifier of a single partition within the stream.
///
/// Partition ids are opaque strings assigned by the source (`"0"`, `"1"`,
/// ...). Ordering is lexicographic and is only used to make assignment and
/// release decisions deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    /// Create a partition id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        PartitionId(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(id: &str) -> Self {
        PartitionId(id.to_string())
    }
}

impl From<String> for PartitionId {
    fn from(id: String) -> Self {
        PartitionId(id)
    }
}

/// A single event read from a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Partition this event was read from
    pub partition_id: PartitionId,
    /// Byte position of the event within the partition
    pub offset: i64,
    /// Monotonically increasing per-partition sequence number
    pub sequence_number: i64,
    /// Opaque event payload
    pub body: Bytes,
    /// When the event was appended to the partition
    pub enqueued_at: DateTime<Utc>,
}

impl Event {
    /// Create an event enqueued now.
    pub fn new(
        partition_id: impl Into<PartitionId>,
        offset: i64,
        sequence_number: i64,
        body: impl Into<Bytes>,
    ) -> Self {
        Event {
            partition_id: partition_id.into(),
            offset,
            sequence_number,
            body: body.into(),
            enqueued_at: Utc::now(),
        }
    }
}

/// An ordered run of events from one partition, delivered to the
/// application as a single unit.
///
/// A batch may be empty: when a fetch reaches its idle timeout without any
/// events arriving, the pump still delivers an empty batch so the
/// application observes liveness. Empty batches never produce checkpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    /// Partition every event in this batch belongs to
    pub partition_id: PartitionId,
    /// Events ordered by sequence number
    pub events: Vec<Event>,
}

impl EventBatch {
    /// Create a batch from already-ordered events.
    pub fn new(partition_id: impl Into<PartitionId>, events: Vec<Event>) -> Self {
        EventBatch {
            partition_id: partition_id.into(),
            events,
        }
    }

    /// Create an empty batch (an idle tick).
    pub fn empty(partition_id: impl Into<PartitionId>) -> Self {
        EventBatch {
            partition_id: partition_id.into(),
            events: Vec::new(),
        }
    }

    /// Number of events in the batch.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the batch carries no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The last event of the batch, if any.
    pub fn last_event(&self) -> Option<&Event> {
        self.events.last()
    }

    /// Derive the checkpoint a successful delivery of this batch produces:
    /// the position of the batch's last event, or `None` for an empty batch.
    pub fn checkpoint(&self, consumer_group: &str) -> Option<Checkpoint> {
        self.last_event().map(|last| {
            Checkpoint::new(
                self.partition_id.clone(),
                consumer_group,
                last.offset,
                last.sequence_number,
            )
        })
    }
}
