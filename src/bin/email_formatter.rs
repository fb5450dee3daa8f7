use std::sync::Arc;

use anyhow::{Error, Result};
use notify_pipeline::{
    clients::{claims::ClaimScope, identity::IdentityClient},
    models::circuit_breaker::IDENTITY_SERVICE,
    pipeline::formatter::FormattingStage,
    runtime::Runtime,
};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Runtime::bootstrap()?;
    let runtime = Runtime::start(config).await?;

    let breaker = runtime.circuit_breaker(IDENTITY_SERVICE);
    let identity = Arc::new(IdentityClient::new(&runtime.config, Some(breaker.clone()))?);

    let stage = FormattingStage::new(
        runtime.claim_guard(ClaimScope::Formatting),
        runtime.notification_store(),
        identity,
        runtime.broker.clone(),
        runtime.config.queue_formatted_single_messages.clone(),
    );

    let queue = runtime.config.queue_raw_single_messages.clone();
    runtime
        .serve("email_formatter", &queue, Arc::new(stage), vec![breaker])
        .await
}
