use std::sync::Arc;

use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    clients::claims::ClaimStore,
    models::{
        message::Envelope,
        outcome::{DropReason, Outcome},
    },
};

/// Steps every stage runs around its own work: the retry ceiling, the claim,
/// and the release of the claim when the work must be retried.
#[derive(Clone)]
pub struct ClaimGuard {
    claims: Arc<dyn ClaimStore>,
    max_retry_count: u64,
}

impl ClaimGuard {
    pub fn new(claims: Arc<dyn ClaimStore>, max_retry_count: u64) -> Self {
        Self {
            claims,
            max_retry_count,
        }
    }

    /// `Some(drop)` when the message has been through the retry loop too often.
    pub fn check_retry_limit(&self, envelope: &Envelope) -> Option<Outcome> {
        (envelope.death_count > self.max_retry_count).then(|| {
            Outcome::Drop(DropReason::RetryLimitExceeded {
                count: envelope.death_count,
                max: self.max_retry_count,
            })
        })
    }

    /// Takes the claim on `id`. `Err` carries the outcome to settle with instead.
    pub async fn claim(&self, id: Uuid) -> Result<(), Outcome> {
        match self.claims.claim(id).await {
            Ok(true) => {
                debug!(notification_id = %id, "Claim taken");
                Ok(())
            }
            Ok(false) => Err(Outcome::Drop(DropReason::AlreadyClaimed)),
            Err(e) => Err(Outcome::Retry(e.context("claim failed"))),
        }
    }

    /// Releases the claim when `outcome` sends the message back for a retry.
    pub async fn settle(&self, id: Uuid, outcome: Outcome) -> Outcome {
        let Outcome::Retry(cause) = outcome else {
            return outcome;
        };

        match self.claims.release(id).await {
            Ok(()) => Outcome::Retry(cause),
            Err(e) => {
                error!(
                    notification_id = %id,
                    error = %e,
                    cause = %cause,
                    "Failed to release claim, notification stays locked"
                );
                Outcome::Retry(e.context(format!("release after failure: {:#}", cause)))
            }
        }
    }
}
