use std::sync::Arc;

use anyhow::{Context, Error, Result};
use async_trait::async_trait;
use tracing::info;

use crate::{
    clients::{notifications::NotificationStore, smtp::MailTransport},
    models::{
        message::{Envelope, FormattedEmail},
        outcome::Outcome,
    },
    pipeline::{MessageHandler, claim::ClaimGuard},
};

/// Sends formatted emails and records what the server answered.
pub struct DeliveryStage {
    guard: ClaimGuard,
    store: Arc<dyn NotificationStore>,
    transport: Arc<dyn MailTransport>,
}

impl DeliveryStage {
    pub fn new(
        guard: ClaimGuard,
        store: Arc<dyn NotificationStore>,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            guard,
            store,
            transport,
        }
    }

    async fn deliver(&self, email: &FormattedEmail) -> Result<Outcome, Error> {
        let response = self
            .transport
            .send(email)
            .await
            .context("transport refused message")?;

        self.store
            .record_sent_result(email.notification_id, &response)
            .await?;

        info!(
            notification_id = %email.notification_id,
            response = %response,
            "Notification sent"
        );

        Ok(Outcome::Completed)
    }
}

#[async_trait]
impl MessageHandler for DeliveryStage {
    async fn handle(&self, envelope: &Envelope) -> Outcome {
        if let Some(dropped) = self.guard.check_retry_limit(envelope) {
            return dropped;
        }

        let email: FormattedEmail = match serde_json::from_slice(&envelope.body) {
            Ok(email) => email,
            Err(e) => return Outcome::Retry(Error::new(e).context("malformed formatted email")),
        };

        if let Err(outcome) = self.guard.claim(email.notification_id).await {
            return outcome;
        }

        let outcome = self.deliver(&email).await.unwrap_or_else(Outcome::Retry);

        self.guard.settle(email.notification_id, outcome).await
    }
}
