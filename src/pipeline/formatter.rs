use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result};
use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::{
    clients::{
        identity::IdentityDirectory, notifications::NotificationStore, rbmq::MessagePublisher,
        template,
    },
    models::{
        message::{Envelope, FormattedEmail},
        outcome::{DropReason, Outcome},
    },
    pipeline::{MessageHandler, claim::ClaimGuard},
};

/// Turns a raw notification id into a rendered email for the delivery stage.
pub struct FormattingStage {
    guard: ClaimGuard,
    store: Arc<dyn NotificationStore>,
    identity: Arc<dyn IdentityDirectory>,
    publisher: Arc<dyn MessagePublisher>,
    formatted_queue: String,
}

impl FormattingStage {
    pub fn new(
        guard: ClaimGuard,
        store: Arc<dyn NotificationStore>,
        identity: Arc<dyn IdentityDirectory>,
        publisher: Arc<dyn MessagePublisher>,
        formatted_queue: String,
    ) -> Self {
        Self {
            guard,
            store,
            identity,
            publisher,
            formatted_queue,
        }
    }

    async fn format(&self, id: Uuid, envelope: &Envelope) -> Result<Outcome, Error> {
        let Some(notification) = self.store.notification(id).await? else {
            return Ok(Outcome::Drop(DropReason::NotificationMissing));
        };

        let Some(template) = self.store.template(notification.template_id).await? else {
            return Ok(Outcome::Drop(DropReason::TemplateMissing));
        };

        let Some(profile) = self
            .identity
            .user_by_id(notification.destination_id, &envelope.correlation_id)
            .await?
        else {
            return Ok(Outcome::Drop(DropReason::RecipientMissing));
        };

        if !profile.is_subscribed(notification.target_group) {
            return Ok(Outcome::Drop(DropReason::NotSubscribed));
        }

        let Some(to) = profile.email.clone().filter(|email| !email.trim().is_empty()) else {
            return Ok(Outcome::Drop(DropReason::RecipientWithoutAddress));
        };

        let context = template::render_context(&profile, &notification.message);
        let html = template::render(&template.body, &context)?;

        let email = FormattedEmail {
            notification_id: id,
            html,
            to,
            reply_to: notification.source,
            subject: notification.subject,
        };
        let payload = serde_json::to_vec(&email)?;

        self.publisher
            .publish(
                &self.formatted_queue,
                &payload,
                &envelope.correlation_id,
                Duration::ZERO,
            )
            .await?;

        info!(
            notification_id = %id,
            template_id = %template.id,
            queue = %self.formatted_queue,
            "Notification formatted"
        );

        Ok(Outcome::Completed)
    }
}

#[async_trait]
impl MessageHandler for FormattingStage {
    async fn handle(&self, envelope: &Envelope) -> Outcome {
        if let Some(dropped) = self.guard.check_retry_limit(envelope) {
            return dropped;
        }

        let id = match envelope.notification_id() {
            Ok(id) => id,
            Err(e) => return Outcome::Retry(e.context("malformed notification id")),
        };

        if let Err(outcome) = self.guard.claim(id).await {
            return outcome;
        }

        let outcome = self
            .format(id, envelope)
            .await
            .unwrap_or_else(Outcome::Retry);

        self.guard.settle(id, outcome).await
    }
}
