//! Pump lifecycle primitives
//!
//! Every owned partition moves through [`PartitionState`]:
//! `Initializing -> Active -> Closing -> Closed`. The transition into
//! `Closing` carries a [`CloseReason`] that the application sees in its
//! closing callback.
//!
//! The coordinator talks to a running pump through an ownership token
//! pair: it keeps the [`OwnershipHandle`] and gives the pump the
//! [`OwnershipToken`]. Renewals push the lease deadline forward through
//! the handle; revocation flips the token so the pump stops at its next
//! validity check instead of being cancelled mid-batch.

use chrono::{DateTime, Utc};
use std::fmt;
use tokio::sync::watch;

/// Lifecycle state of one partition's pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    /// Ownership granted, initialization callback running
    Initializing,
    /// Pump task fetching and delivering
    Active,
    /// Revoked or faulted, waiting for the pump task to finish
    Closing,
    /// Pump task finished and close callback delivered
    Closed,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionState::Initializing => write!(f, "initializing"),
            PartitionState::Active => write!(f, "active"),
            PartitionState::Closing => write!(f, "closing"),
            PartitionState::Closed => write!(f, "closed"),
        }
    }
}

/// Why a pump stopped processing its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The processor is shutting down
    Shutdown,
    /// The partition's lease was lost or expired
    OwnershipLost,
    /// The pump gave up after exhausting fetch retries
    PumpFault,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::OwnershipLost => write!(f, "ownership lost"),
            CloseReason::PumpFault => write!(f, "pump fault"),
        }
    }
}

#[derive(Debug, Clone)]
enum TokenState {
    Active { expires_at: DateTime<Utc> },
    Revoked(CloseReason),
}

/// Validity of an [`OwnershipToken`] at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    /// The lease is live and unrevoked
    Valid,
    /// The lease deadline passed without a renewal reaching the token
    Expired,
    /// The coordinator revoked the token
    Revoked(CloseReason),
}

/// Coordinator side of the ownership signal for one pump.
#[derive(Debug)]
pub struct OwnershipHandle {
    tx: watch::Sender<TokenState>,
}

impl OwnershipHandle {
    /// Create a token pair valid until `expires_at`.
    pub fn new(expires_at: DateTime<Utc>) -> (OwnershipHandle, OwnershipToken) {
        let tx = watch::Sender::new(TokenState::Active { expires_at });
        let rx = tx.subscribe();
        (OwnershipHandle { tx }, OwnershipToken { rx })
    }

    /// Push the lease deadline forward after a successful renewal. A
    /// revoked token stays revoked.
    pub fn extend(&self, expires_at: DateTime<Utc>) {
        self.tx.send_if_modified(|state| match state {
            TokenState::Active { .. } => {
                *state = TokenState::Active { expires_at };
                true
            }
            TokenState::Revoked(_) => false,
        });
    }

    /// Invalidate the token. The pump observes this at its next validity
    /// check; revoking twice keeps the first reason.
    pub fn revoke(&self, reason: CloseReason) {
        self.tx.send_if_modified(|state| match state {
            TokenState::Active { .. } => {
                *state = TokenState::Revoked(reason);
                true
            }
            TokenState::Revoked(_) => false,
        });
    }
}

/// Pump side of the ownership signal.
///
/// The pump checks this before fetching, before delivering, before each
/// retry, and before writing a checkpoint, so a revocation takes effect at
/// the next step boundary.
#[derive(Debug, Clone)]
pub struct OwnershipToken {
    rx: watch::Receiver<TokenState>,
}

impl OwnershipToken {
    /// Current validity, accounting for wall-clock lease expiry.
    pub fn status(&self) -> TokenStatus {
        let state = self.rx.borrow().clone();
        match state {
            TokenState::Revoked(reason) => TokenStatus::Revoked(reason),
            TokenState::Active { expires_at } => {
                if Utc::now() >= expires_at {
                    TokenStatus::Expired
                } else {
                    TokenStatus::Valid
                }
            }
        }
    }

    /// The close reason implied by the current status, or `None` while
    /// the token is valid. Expiry without revocation means the lease
    /// lapsed, which is a lost partition.
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self.status() {
            TokenStatus::Valid => None,
            TokenStatus::Expired => Some(CloseReason::OwnershipLost),
            TokenStatus::Revoked(reason) => Some(reason),
        }
    }

    /// Wait until the token is revoked. Used to cut backoff sleeps short
    /// when the coordinator pulls the partition.
    pub async fn revoked(&mut self) -> CloseReason {
        loop {
            {
                if let TokenState::Revoked(reason) = &*self.rx.borrow_and_update() {
                    return *reason;
                }
            }
            if self.rx.changed().await.is_err() {
                // handle dropped without an explicit revoke; treat as a
                // shutdown so the pump unwinds
                return CloseReason::Shutdown;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn soon() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(30)
    }

    #[test]
    fn test_token_valid_until_revoked() {
        let (handle, token) = OwnershipHandle::new(soon());
        assert_eq!(token.status(), TokenStatus::Valid);
        assert_eq!(token.close_reason(), None);

        handle.revoke(CloseReason::OwnershipLost);
        assert_eq!(token.status(), TokenStatus::Revoked(CloseReason::OwnershipLost));
        assert_eq!(token.close_reason(), Some(CloseReason::OwnershipLost));
    }

    #[test]
    fn test_first_revoke_reason_wins() {
        let (handle, token) = OwnershipHandle::new(soon());
        handle.revoke(CloseReason::Shutdown);
        handle.revoke(CloseReason::OwnershipLost);
        assert_eq!(token.close_reason(), Some(CloseReason::Shutdown));
    }

    #[test]
    fn test_extend_does_not_revive_a_revoked_token() {
        let (handle, token) = OwnershipHandle::new(soon());
        handle.revoke(CloseReason::OwnershipLost);
        handle.extend(soon());
        assert_eq!(token.close_reason(), Some(CloseReason::OwnershipLost));
    }

    #[test]
    fn test_token_expires_without_renewal() {
        let (handle, token) = OwnershipHandle::new(Utc::now() - chrono::Duration::seconds(1));
        assert_eq!(token.status(), TokenStatus::Expired);
        assert_eq!(token.close_reason(), Some(CloseReason::OwnershipLost));

        // a renewal restores validity
        handle.extend(soon());
        assert_eq!(token.status(), TokenStatus::Valid);
    }

    #[tokio::test]
    async fn test_revoked_wait_resolves() {
        let (handle, mut token) = OwnershipHandle::new(soon());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.revoke(CloseReason::Shutdown);
        });
        let reason = token.revoked().await;
        assert_eq!(reason, CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn test_dropped_handle_reads_as_shutdown() {
        let (handle, mut token) = OwnershipHandle::new(soon());
        drop(handle);
        assert_eq!(token.revoked().await, CloseReason::Shutdown);
    }
}
