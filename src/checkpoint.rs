//! Checkpoint store contract
//!
//! The [`CheckpointStore`] trait is the durability seam of the runtime. It
//! persists two kinds of records:
//!
//! - [`Checkpoint`]: the last position a consumer group has finished
//!   processing in one partition. Written after each delivered batch, read
//!   on pump start to resume where a previous owner left off.
//! - [`OwnershipRecord`]: a leased claim of one partition by one processor
//!   instance. Claims are granted through a test-and-set against the
//!   current record, so two instances racing for the same partition can
//!   never both win.
//!
//! Implementations must be safe to call from concurrent tasks. The crate
//! ships [`InMemoryCheckpointStore`](crate::store::InMemoryCheckpointStore)
//! for tests and single-process use and
//! [`FileCheckpointStore`](crate::store::FileCheckpointStore) for simple
//! persistent deployments; production systems point this trait at shared
//! storage so instances on different hosts coordinate through it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::event::PartitionId;

/// A consumer group's recorded position in one partition.
///
/// The position identifies the last event that was fully processed; a pump
/// resuming from this checkpoint starts delivery at the next sequence
/// number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Partition the position belongs to
    pub partition_id: PartitionId,
    /// Consumer group that recorded the position
    pub consumer_group: String,
    /// Byte offset of the last processed event
    pub offset: i64,
    /// Sequence number of the last processed event
    pub sequence_number: i64,
    /// When the checkpoint was written
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a checkpoint recorded now.
    pub fn new(
        partition_id: impl Into<PartitionId>,
        consumer_group: impl Into<String>,
        offset: i64,
        sequence_number: i64,
    ) -> Self {
        Checkpoint {
            partition_id: partition_id.into(),
            consumer_group: consumer_group.into(),
            offset,
            sequence_number,
            updated_at: Utc::now(),
        }
    }
}

/// A leased claim of one partition by one processor instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    /// The claimed partition
    pub partition_id: PartitionId,
    /// Instance holding the lease
    pub owner_id: String,
    /// When the lease lapses unless renewed
    pub expires_at: DateTime<Utc>,
    /// When this owner first acquired the partition
    pub acquired_at: DateTime<Utc>,
}

impl OwnershipRecord {
    /// Create a record owned from now until `lease` from now.
    pub fn new(
        partition_id: impl Into<PartitionId>,
        owner_id: impl Into<String>,
        lease: Duration,
    ) -> Self {
        let now = Utc::now();
        OwnershipRecord {
            partition_id: partition_id.into(),
            owner_id: owner_id.into(),
            expires_at: now + clamp_lease(lease),
            acquired_at: now,
        }
    }

    /// Whether the lease had lapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the lease has lapsed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether `owner_id` holds this record.
    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner_id == owner_id
    }

    /// Extend the lease to `lease` from now, keeping the original
    /// `acquired_at`.
    pub fn renewed(&self, lease: Duration) -> Self {
        OwnershipRecord {
            expires_at: Utc::now() + clamp_lease(lease),
            ..self.clone()
        }
    }
}

fn clamp_lease(lease: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(lease.as_millis().min(i64::MAX as u128) as i64)
}

/// Result of a [`CheckpointStore::claim_ownership`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The claim won; the returned record is what the store now holds.
    Granted(OwnershipRecord),
    /// Another instance holds an unexpired lease on the partition.
    Rejected {
        /// The instance currently holding the lease
        current_owner: String,
        /// When that lease lapses unless renewed
        expires_at: DateTime<Utc>,
    },
}

impl ClaimOutcome {
    /// Whether the claim was granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, ClaimOutcome::Granted(_))
    }
}

/// Durable storage for checkpoints and partition ownership.
///
/// # Contract
///
/// - `write_checkpoint` must never move a partition's recorded position
///   backwards: writes with a sequence number below the stored one are
///   ignored. Writes with an equal sequence number overwrite, so retrying
///   the same write is idempotent.
/// - `claim_ownership` is a test-and-set against the current record: the
///   claim is granted when the partition is unowned, the existing lease has
///   expired, or the caller already holds it (renewal). Exactly one of any
///   set of concurrent claimants may be granted.
/// - `release_ownership` removes the record only when `owner_id` still
///   holds it; releasing a partition owned by someone else (or nobody) is
///   a no-op, so a release racing a competitor's claim cannot revoke the
///   winner.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read the recorded position of `consumer_group` in `partition_id`.
    async fn read_checkpoint(
        &self,
        consumer_group: &str,
        partition_id: &PartitionId,
    ) -> Result<Option<Checkpoint>>;

    /// Record a position. Stale writes (lower sequence number than what is
    /// stored) are ignored.
    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Read the current ownership record of one partition, expired or not.
    async fn read_ownership(&self, partition_id: &PartitionId) -> Result<Option<OwnershipRecord>>;

    /// List every ownership record the store holds, expired or not.
    async fn list_ownership(&self) -> Result<Vec<OwnershipRecord>>;

    /// Try to claim `partition_id` for `owner_id` with a lease of `lease`
    /// from now. Also used for renewal: a claim by the current holder
    /// extends the lease.
    async fn claim_ownership(
        &self,
        partition_id: &PartitionId,
        owner_id: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome>;

    /// Drop the ownership record if `owner_id` still holds it.
    async fn release_ownership(&self, partition_id: &PartitionId, owner_id: &str) -> Result<()>;
}

/// Arbitrate a claim against the current ownership record.
///
/// This is the test-and-set rule the shipped stores apply while holding
/// their per-partition lock; custom [`CheckpointStore`] implementations can
/// reuse it to get identical semantics. On `Granted` the caller must
/// persist the returned record atomically with the read of `current`.
pub fn resolve_claim(
    current: Option<&OwnershipRecord>,
    partition_id: &PartitionId,
    owner_id: &str,
    lease: Duration,
) -> ClaimOutcome {
    match current {
        Some(record) if record.is_owned_by(owner_id) => {
            ClaimOutcome::Granted(record.renewed(lease))
        }
        Some(record) if !record.is_expired() => ClaimOutcome::Rejected {
            current_owner: record.owner_id.clone(),
            expires_at: record.expires_at,
        },
        _ => ClaimOutcome::Granted(OwnershipRecord::new(partition_id.clone(), owner_id, lease)),
    }
}
