//! Partition lease acquisition and balancing
//!
//! Each processor instance runs one [`LeaseManager`]. Every refresh cycle
//! it renews the leases the store says the instance holds, claims at most
//! one unowned (or expired) partition while under its target load, and
//! voluntarily releases surplus partitions when the store shows another
//! live owner below target. The target load is
//! `ceil(partitions / live instances)`, where instances are counted from
//! the unexpired ownership records plus this instance itself.
//!
//! Two rules keep ownership safe:
//!
//! - an unexpired lease held by someone else is never touched, and
//! - a partition is only counted as owned after the store grants the
//!   claim, so two racing instances converge on the store's answer.
//!
//! Claiming one partition per cycle instead of grabbing everything at once
//! is what lets instances discover each other: a peer becomes visible the
//! moment its first claim lands, lowering this instance's target before it
//! overshoots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointStore, ClaimOutcome, OwnershipRecord};
use crate::error::Result;
use crate::event::PartitionId;
use crate::metrics;

/// Outcome of one lease refresh cycle.
#[derive(Debug, Clone, Default)]
pub struct LeaseAssignment {
    /// Records this instance holds after the cycle, sorted by partition
    pub owned: Vec<OwnershipRecord>,
    /// Partitions newly claimed this cycle
    pub acquired: Vec<PartitionId>,
    /// Partitions voluntarily released this cycle
    pub released: Vec<PartitionId>,
}

impl LeaseAssignment {
    /// The owned partition ids, sorted.
    pub fn owned_partitions(&self) -> Vec<PartitionId> {
        self.owned
            .iter()
            .map(|record| record.partition_id.clone())
            .collect()
    }
}

/// Claims, renews and releases partition leases for one instance.
pub struct LeaseManager {
    store: Arc<dyn CheckpointStore>,
    instance_id: String,
    lease_duration: Duration,
}

impl LeaseManager {
    /// Create a manager claiming on behalf of `instance_id`.
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        instance_id: impl Into<String>,
        lease_duration: Duration,
    ) -> Self {
        LeaseManager {
            store,
            instance_id: instance_id.into(),
            lease_duration,
        }
    }

    /// The instance this manager claims for.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Run one refresh cycle over the given partition set.
    ///
    /// Renews held leases, claims at most one new partition while under
    /// target, and releases surplus partitions when another live owner is
    /// visibly under target. Partitions whose renewal is rejected are
    /// simply absent from the returned assignment; the caller compares
    /// against its running pumps to find them.
    ///
    /// # Errors
    ///
    /// Propagates the first store failure; the cycle is abandoned and can
    /// be retried on the next tick.
    pub async fn refresh_assignments(&self, partitions: &[PartitionId]) -> Result<LeaseAssignment> {
        let mut sorted: Vec<PartitionId> = partitions.to_vec();
        sorted.sort();
        sorted.dedup();

        let records: HashMap<PartitionId, OwnershipRecord> = self
            .store
            .list_ownership()
            .await?
            .into_iter()
            .filter(|record| sorted.contains(&record.partition_id))
            .map(|record| (record.partition_id.clone(), record))
            .collect();

        let mut mine: Vec<PartitionId> = Vec::new();
        let mut claimable: Vec<PartitionId> = Vec::new();
        let mut other_loads: HashMap<String, usize> = HashMap::new();
        for partition_id in &sorted {
            match records.get(partition_id) {
                // renew our own records even when already expired, as long
                // as nobody else has taken them
                Some(record) if record.is_owned_by(&self.instance_id) => {
                    mine.push(partition_id.clone());
                }
                Some(record) if !record.is_expired() => {
                    *other_loads.entry(record.owner_id.clone()).or_default() += 1;
                }
                _ => claimable.push(partition_id.clone()),
            }
        }

        let live_instances = other_loads.len() + 1;
        let target = sorted.len().div_ceil(live_instances);

        let mut owned: Vec<OwnershipRecord> = Vec::new();
        for partition_id in &mine {
            match self
                .store
                .claim_ownership(partition_id, &self.instance_id, self.lease_duration)
                .await?
            {
                ClaimOutcome::Granted(record) => owned.push(record),
                ClaimOutcome::Rejected { current_owner, .. } => {
                    warn!(
                        partition_id = %partition_id,
                        new_owner = %current_owner,
                        "lease renewal rejected, partition lost"
                    );
                    metrics::record_lease_lost(partition_id.as_str());
                }
            }
        }

        let mut acquired: Vec<PartitionId> = Vec::new();
        if owned.len() < target {
            for partition_id in &claimable {
                match self
                    .store
                    .claim_ownership(partition_id, &self.instance_id, self.lease_duration)
                    .await?
                {
                    ClaimOutcome::Granted(record) => {
                        info!(
                            partition_id = %partition_id,
                            instance_id = %self.instance_id,
                            "claimed partition"
                        );
                        metrics::record_lease_claimed(partition_id.as_str());
                        owned.push(record);
                        acquired.push(partition_id.clone());
                        // one new claim per cycle keeps the ramp gradual
                        break;
                    }
                    ClaimOutcome::Rejected { current_owner, .. } => {
                        debug!(
                            partition_id = %partition_id,
                            winner = %current_owner,
                            "lost claim race"
                        );
                    }
                }
            }
        }

        owned.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));

        let mut released: Vec<PartitionId> = Vec::new();
        let someone_under_target = other_loads.values().any(|&count| count < target);
        if someone_under_target {
            while owned.len() > target {
                let Some(record) = owned.pop() else { break };
                self.store
                    .release_ownership(&record.partition_id, &self.instance_id)
                    .await?;
                info!(
                    partition_id = %record.partition_id,
                    instance_id = %self.instance_id,
                    "released partition to rebalance"
                );
                metrics::record_lease_released(record.partition_id.as_str());
                released.push(record.partition_id);
            }
        }

        Ok(LeaseAssignment {
            owned,
            acquired,
            released,
        })
    }

    /// Release every given partition, best effort. Failures are logged;
    /// an unreleased lease simply expires on its own.
    pub async fn release_all(&self, partitions: &[PartitionId]) {
        for partition_id in partitions {
            if let Err(err) = self
                .store
                .release_ownership(partition_id, &self.instance_id)
                .await
            {
                warn!(
                    partition_id = %partition_id,
                    error = %err,
                    "failed to release lease during shutdown"
                );
            } else {
                metrics::record_lease_released(partition_id.as_str());
            }
        }
    }
}
