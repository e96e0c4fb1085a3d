//! File-based checkpoint store
//!
//! Persists checkpoints and ownership records as JSON under a base
//! directory:
//!
//! ```text
//! <base>/
//!   ownership.json                      # partition -> ownership record
//!   groups/<group>/checkpoints.json     # partition -> checkpoint
//! ```
//!
//! Writes go through an internal mutex, so claims are atomic with respect
//! to other tasks using the same store instance. Instances in separate
//! processes must not share a base directory; point the trait at shared
//! storage for cross-host deployments.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::checkpoint::{
    resolve_claim, Checkpoint, CheckpointStore, ClaimOutcome, OwnershipRecord,
};
use crate::error::Result;
use crate::event::PartitionId;

/// Durable [`CheckpointStore`] backed by JSON files.
#[derive(Debug)]
pub struct FileCheckpointStore {
    base_path: PathBuf,
    // serializes read-modify-write cycles; held across no awaits
    lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// Create a store rooted at `base_path`, creating the directory if
    /// needed.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(FileCheckpointStore {
            base_path,
            lock: Mutex::new(()),
        })
    }

    fn ownership_path(&self) -> PathBuf {
        self.base_path.join("ownership.json")
    }

    fn group_dir(&self, consumer_group: &str) -> PathBuf {
        self.base_path.join("groups").join(consumer_group)
    }

    fn checkpoints_path(&self, consumer_group: &str) -> PathBuf {
        self.group_dir(consumer_group).join("checkpoints.json")
    }

    fn load_checkpoints(&self, consumer_group: &str) -> Result<HashMap<PartitionId, Checkpoint>> {
        let path = self.checkpoints_path(consumer_group);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let json = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    fn save_checkpoints(
        &self,
        consumer_group: &str,
        checkpoints: &HashMap<PartitionId, Checkpoint>,
    ) -> Result<()> {
        let dir = self.group_dir(consumer_group);
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(checkpoints)?;
        fs::write(self.checkpoints_path(consumer_group), json)?;
        Ok(())
    }

    fn load_ownership_map(&self) -> Result<HashMap<PartitionId, OwnershipRecord>> {
        let path = self.ownership_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let json = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    fn save_ownership_map(&self, ownership: &HashMap<PartitionId, OwnershipRecord>) -> Result<()> {
        let json = serde_json::to_string_pretty(ownership)?;
        fs::write(self.ownership_path(), json)?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn read_checkpoint(
        &self,
        consumer_group: &str,
        partition_id: &PartitionId,
    ) -> Result<Option<Checkpoint>> {
        let _guard = self.lock.lock();
        Ok(self.load_checkpoints(consumer_group)?.remove(partition_id))
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let _guard = self.lock.lock();
        let mut checkpoints = self.load_checkpoints(&checkpoint.consumer_group)?;
        if let Some(stored) = checkpoints.get(&checkpoint.partition_id) {
            if checkpoint.sequence_number < stored.sequence_number {
                debug!(
                    partition_id = %checkpoint.partition_id,
                    stored = stored.sequence_number,
                    incoming = checkpoint.sequence_number,
                    "ignoring stale checkpoint write"
                );
                return Ok(());
            }
        }
        checkpoints.insert(checkpoint.partition_id.clone(), checkpoint.clone());
        self.save_checkpoints(&checkpoint.consumer_group, &checkpoints)?;
        debug!(
            partition_id = %checkpoint.partition_id,
            consumer_group = %checkpoint.consumer_group,
            sequence_number = checkpoint.sequence_number,
            "saved checkpoint"
        );
        Ok(())
    }

    async fn read_ownership(&self, partition_id: &PartitionId) -> Result<Option<OwnershipRecord>> {
        let _guard = self.lock.lock();
        Ok(self.load_ownership_map()?.remove(partition_id))
    }

    async fn list_ownership(&self) -> Result<Vec<OwnershipRecord>> {
        let _guard = self.lock.lock();
        Ok(self.load_ownership_map()?.into_values().collect())
    }

    async fn claim_ownership(
        &self,
        partition_id: &PartitionId,
        owner_id: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome> {
        let _guard = self.lock.lock();
        let mut ownership = self.load_ownership_map()?;
        let outcome = resolve_claim(ownership.get(partition_id), partition_id, owner_id, lease);
        if let ClaimOutcome::Granted(record) = &outcome {
            ownership.insert(partition_id.clone(), record.clone());
            self.save_ownership_map(&ownership)?;
        }
        Ok(outcome)
    }

    async fn release_ownership(&self, partition_id: &PartitionId, owner_id: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut ownership = self.load_ownership_map()?;
        let held = ownership
            .get(partition_id)
            .is_some_and(|record| record.is_owned_by(owner_id));
        if held {
            ownership.remove(partition_id);
            self.save_ownership_map(&ownership)?;
            debug!(partition_id = %partition_id, owner_id, "released ownership");
        }
        Ok(())
    }
}
