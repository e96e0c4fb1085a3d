//! Partition source contract
//!
//! The [`PartitionSource`] trait is the ingestion seam: it enumerates the
//! stream's partitions and serves ordered event batches from a position.
//! The runtime never interprets event payloads; it only tracks positions.
//!
//! [`InMemorySource`] is the shipped implementation, an append-only buffer
//! per partition. It backs the integration tests and works as a
//! single-process bus; real deployments implement the trait over their
//! broker client.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{CapstanError, Result};
use crate::event::{Event, EventBatch, PartitionId};

/// Where a fetch starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPosition {
    /// From the oldest retained event.
    Earliest,
    /// From the partition tail as of the fetch call; only events appended
    /// afterwards are returned.
    Latest,
    /// Events with a sequence number strictly greater than this one.
    After(i64),
}

/// Read access to a partitioned event stream.
///
/// # Contract
///
/// - `fetch` returns as soon as at least one event is available, with up
///   to `max_count` events ordered by sequence number, all from the
///   requested partition.
/// - When no event arrives within `idle_timeout` the fetch resolves with
///   an empty batch rather than an error, so callers can observe liveness.
/// - Transient failures are reported as [`CapstanError::Fetch`]; the pump
///   retries those with bounded backoff.
#[async_trait]
pub trait PartitionSource: Send + Sync {
    /// Enumerate the partitions of the stream.
    async fn list_partitions(&self) -> Result<Vec<PartitionId>>;

    /// Read a batch from one partition starting at `position`.
    async fn fetch(
        &self,
        partition_id: &PartitionId,
        position: FetchPosition,
        max_count: usize,
        idle_timeout: Duration,
    ) -> Result<EventBatch>;
}

// Sequence numbers are assigned densely from 0, so an event's index in the
// buffer equals its sequence number.
struct PartitionBuffer {
    events: RwLock<Vec<Event>>,
    // last appended sequence number, -1 while empty; fetches wait on this
    tail: watch::Sender<i64>,
}

impl PartitionBuffer {
    fn new() -> Self {
        PartitionBuffer {
            events: RwLock::new(Vec::new()),
            tail: watch::Sender::new(-1),
        }
    }
}

/// In-process [`PartitionSource`] over append-only buffers.
///
/// The partition set is fixed at construction. Appends wake any fetch
/// currently waiting on that partition.
pub struct InMemorySource {
    partitions: RwLock<BTreeMap<PartitionId, Arc<PartitionBuffer>>>,
}

impl InMemorySource {
    /// Create a source with the given partitions.
    pub fn new<I, P>(partition_ids: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PartitionId>,
    {
        let partitions = partition_ids
            .into_iter()
            .map(|id| (id.into(), Arc::new(PartitionBuffer::new())))
            .collect();
        InMemorySource {
            partitions: RwLock::new(partitions),
        }
    }

    /// Create a source with `count` partitions named `"0"` through
    /// `"count - 1"`.
    pub fn with_partition_count(count: usize) -> Self {
        Self::new((0..count).map(|i| i.to_string()))
    }

    /// Append an event to a partition, waking any waiting fetch. Returns
    /// the event with its assigned offset and sequence number.
    pub fn append(
        &self,
        partition_id: impl Into<PartitionId>,
        body: impl Into<Bytes>,
    ) -> Result<Event> {
        let partition_id = partition_id.into();
        let buffer = self
            .buffer(&partition_id)
            .ok_or_else(|| CapstanError::unknown_partition(partition_id.as_str()))?;

        let event = {
            let mut events = buffer.events.write();
            let (offset, sequence_number) = match events.last() {
                Some(last) => (last.offset + last.body.len() as i64, last.sequence_number + 1),
                None => (0, 0),
            };
            let event = Event {
                partition_id: partition_id.clone(),
                offset,
                sequence_number,
                body: body.into(),
                enqueued_at: Utc::now(),
            };
            events.push(event.clone());
            event
        };
        buffer.tail.send_replace(event.sequence_number);
        Ok(event)
    }

    fn buffer(&self, partition_id: &PartitionId) -> Option<Arc<PartitionBuffer>> {
        self.partitions.read().get(partition_id).cloned()
    }
}

#[async_trait]
impl PartitionSource for InMemorySource {
    async fn list_partitions(&self) -> Result<Vec<PartitionId>> {
        Ok(self.partitions.read().keys().cloned().collect())
    }

    async fn fetch(
        &self,
        partition_id: &PartitionId,
        position: FetchPosition,
        max_count: usize,
        idle_timeout: Duration,
    ) -> Result<EventBatch> {
        let buffer = self
            .buffer(partition_id)
            .ok_or_else(|| CapstanError::unknown_partition(partition_id.as_str()))?;

        // subscribing before the first read means an append between the
        // read and the wait still wakes us
        let mut tail_rx = buffer.tail.subscribe();
        let min_exclusive = match position {
            FetchPosition::Earliest => -1,
            FetchPosition::After(sequence) => sequence,
            FetchPosition::Latest => *tail_rx.borrow(),
        };

        let deadline = tokio::time::Instant::now() + idle_timeout;
        loop {
            let events: Vec<Event> = {
                let events = buffer.events.read();
                let start = (min_exclusive + 1).max(0) as usize;
                if start < events.len() {
                    events[start..].iter().take(max_count).cloned().collect()
                } else {
                    Vec::new()
                }
            };
            if !events.is_empty() {
                return Ok(EventBatch::new(partition_id.clone(), events));
            }

            match tokio::time::timeout_at(deadline, tail_rx.changed()).await {
                Ok(Ok(())) => continue,
                // sender dropped or idle timeout: report an empty batch
                Ok(Err(_)) | Err(_) => return Ok(EventBatch::empty(partition_id.clone())),
            }
        }
    }
}
