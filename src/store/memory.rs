//! In-memory checkpoint store
//!
//! Keeps checkpoints and ownership records in concurrent maps. The
//! per-key entry lock makes `claim_ownership` an atomic test-and-set, so
//! several processor instances sharing one store instance (the usual test
//! topology) race exactly like they would against shared storage.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

use crate::checkpoint::{
    resolve_claim, Checkpoint, CheckpointStore, ClaimOutcome, OwnershipRecord,
};
use crate::error::Result;
use crate::event::PartitionId;

/// Volatile [`CheckpointStore`] backed by concurrent maps.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: DashMap<(String, PartitionId), Checkpoint>,
    ownership: DashMap<PartitionId, OwnershipRecord>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn read_checkpoint(
        &self,
        consumer_group: &str,
        partition_id: &PartitionId,
    ) -> Result<Option<Checkpoint>> {
        let key = (consumer_group.to_string(), partition_id.clone());
        Ok(self.checkpoints.get(&key).map(|entry| entry.clone()))
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let key = (
            checkpoint.consumer_group.clone(),
            checkpoint.partition_id.clone(),
        );
        match self.checkpoints.entry(key) {
            Entry::Occupied(mut occupied) => {
                if checkpoint.sequence_number < occupied.get().sequence_number {
                    debug!(
                        partition_id = %checkpoint.partition_id,
                        stored = occupied.get().sequence_number,
                        incoming = checkpoint.sequence_number,
                        "ignoring stale checkpoint write"
                    );
                    return Ok(());
                }
                occupied.insert(checkpoint.clone());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(checkpoint.clone());
            }
        }
        Ok(())
    }

    async fn read_ownership(&self, partition_id: &PartitionId) -> Result<Option<OwnershipRecord>> {
        Ok(self.ownership.get(partition_id).map(|entry| entry.clone()))
    }

    async fn list_ownership(&self) -> Result<Vec<OwnershipRecord>> {
        Ok(self
            .ownership
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn claim_ownership(
        &self,
        partition_id: &PartitionId,
        owner_id: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome> {
        // the entry guard holds the shard lock, making the read and the
        // conditional write one atomic step
        match self.ownership.entry(partition_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let outcome = resolve_claim(Some(occupied.get()), partition_id, owner_id, lease);
                if let ClaimOutcome::Granted(record) = &outcome {
                    occupied.insert(record.clone());
                }
                Ok(outcome)
            }
            Entry::Vacant(vacant) => {
                let outcome = resolve_claim(None, partition_id, owner_id, lease);
                if let ClaimOutcome::Granted(record) = &outcome {
                    vacant.insert(record.clone());
                }
                Ok(outcome)
            }
        }
    }

    async fn release_ownership(&self, partition_id: &PartitionId, owner_id: &str) -> Result<()> {
        let removed = self
            .ownership
            .remove_if(partition_id, |_, record| record.is_owned_by(owner_id));
        if removed.is_some() {
            debug!(partition_id = %partition_id, owner_id, "released ownership");
        }
        Ok(())
    }
}
