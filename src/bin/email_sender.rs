use std::sync::Arc;

use anyhow::{Error, Result};
use notify_pipeline::{
    clients::{claims::ClaimScope, smtp::SmtpMailer},
    models::circuit_breaker::SMTP_SERVICE,
    pipeline::sender::DeliveryStage,
    runtime::Runtime,
};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Runtime::bootstrap()?;
    let runtime = Runtime::start(config).await?;

    let breaker = runtime.circuit_breaker(SMTP_SERVICE);
    let mailer = Arc::new(SmtpMailer::new(&runtime.config, Some(breaker.clone()))?);

    let stage = DeliveryStage::new(
        runtime.claim_guard(ClaimScope::Delivery),
        runtime.notification_store(),
        mailer,
    );

    let queue = runtime.config.queue_formatted_single_messages.clone();
    runtime
        .serve("email_sender", &queue, Arc::new(stage), vec![breaker])
        .await
}
