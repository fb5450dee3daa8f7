use std::{sync::Arc, time::Duration};

use anyhow::{Context, Error, Result};
use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::{
    clients::{
        identity::IdentityDirectory, notifications::NotificationStore, rbmq::MessagePublisher,
    },
    models::{
        message::Envelope,
        notification::NewNotification,
        outcome::{DropReason, Outcome},
    },
    pipeline::{MessageHandler, claim::ClaimGuard},
};

/// Expands a group notification into one delayed single notification per member.
pub struct FanoutStage {
    guard: ClaimGuard,
    store: Arc<dyn NotificationStore>,
    identity: Arc<dyn IdentityDirectory>,
    publisher: Arc<dyn MessagePublisher>,
    single_queue: String,
}

impl FanoutStage {
    pub fn new(
        guard: ClaimGuard,
        store: Arc<dyn NotificationStore>,
        identity: Arc<dyn IdentityDirectory>,
        publisher: Arc<dyn MessagePublisher>,
        single_queue: String,
    ) -> Self {
        Self {
            guard,
            store,
            identity,
            publisher,
            single_queue,
        }
    }

    async fn fan_out(&self, id: Uuid, envelope: &Envelope) -> Result<Outcome, Error> {
        let Some(group) = self.store.group_notification(id).await? else {
            return Ok(Outcome::Drop(DropReason::NotificationMissing));
        };

        let members = self
            .identity
            .users_by_group(group.destination_group_id, &envelope.correlation_id)
            .await?;

        let children: Vec<NewNotification> =
            members.iter().map(|member| group.child_for(member)).collect();

        let inserted = self.store.insert_notifications(&children).await?;

        // Every child is republished so a retry covers the ones a failed attempt missed.
        for child in &children {
            let delay = Duration::from_secs(u64::try_from(child.delay).unwrap_or_default());

            self.publisher
                .publish(
                    &self.single_queue,
                    child.id.to_string().as_bytes(),
                    &envelope.correlation_id,
                    delay,
                )
                .await
                .with_context(|| format!("publishing child notification {}", child.id))?;
        }

        info!(
            group_notification_id = %id,
            destination_group_id = %group.destination_group_id,
            recipients = children.len(),
            inserted,
            send_with_gmt = group.send_with_gmt,
            "Group notification fanned out"
        );

        Ok(Outcome::Completed)
    }
}

#[async_trait]
impl MessageHandler for FanoutStage {
    async fn handle(&self, envelope: &Envelope) -> Outcome {
        if let Some(dropped) = self.guard.check_retry_limit(envelope) {
            return dropped;
        }

        let id = match envelope.notification_id() {
            Ok(id) => id,
            Err(e) => return Outcome::Retry(e.context("malformed group notification id")),
        };

        if let Err(outcome) = self.guard.claim(id).await {
            return outcome;
        }

        let outcome = self
            .fan_out(id, envelope)
            .await
            .unwrap_or_else(Outcome::Retry);

        self.guard.settle(id, outcome).await
    }
}
