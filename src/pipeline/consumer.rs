use std::{future::Future, pin::pin, sync::Arc};

use anyhow::{Error, Result, anyhow};
use futures_util::{Stream, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicRejectOptions},
};
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, error, info, info_span, warn};

use crate::{
    clients::rbmq::RabbitMqClient,
    models::{
        message::Envelope,
        outcome::{Action, DropReason, Outcome},
    },
    pipeline::MessageHandler,
};

/// Consumes `queue` until `shutdown` resolves, the connection fails or a
/// handler reports a fatal outcome. Each delivery is handled on its own task.
///
/// Deliveries already being handled are always settled before this returns,
/// so no claim is left behind when the process exits. Returns `Ok` only for
/// a requested shutdown.
pub async fn run_consumer(
    broker: &RabbitMqClient,
    queue: &str,
    consumer_tag: &str,
    handler: Arc<dyn MessageHandler>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Error> {
    let consumer = broker.create_consumer(queue, consumer_tag).await?;
    let deliveries = consumer
        .map(|delivery| delivery.map_err(|e| anyhow!("Consumer for {} failed: {}", queue, e)));

    info!(queue, "Waiting for messages");

    let queue_name = queue.to_string();
    dispatch(queue, deliveries, shutdown, move |delivery| {
        let handler = Arc::clone(&handler);
        let queue = queue_name.clone();
        async move { process_delivery(&queue, delivery, handler.as_ref()).await }
    })
    .await
}

/// Spawns `process` for every item of `deliveries` until one of them turns
/// out fatal, the stream stops, or `shutdown` resolves; then waits for the
/// tasks still running.
async fn dispatch<D, S, F, Fut>(
    queue: &str,
    deliveries: S,
    shutdown: impl Future<Output = ()>,
    process: F,
) -> Result<(), Error>
where
    S: Stream<Item = Result<D, Error>>,
    F: Fn(D) -> Fut,
    Fut: Future<Output = Option<Error>> + Send + 'static,
{
    let mut deliveries = pin!(deliveries);
    let mut shutdown = pin!(shutdown);
    let mut in_flight = JoinSet::new();

    let mut result = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(queue, "Shutdown requested, no longer taking deliveries");
                break Ok(());
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Some(fatal) = fatal_cause(joined) {
                    break Err(fatal);
                }
            }
            delivery = deliveries.next() => match delivery {
                Some(Ok(delivery)) => {
                    in_flight.spawn(process(delivery));
                }
                Some(Err(e)) => break Err(e),
                None => {
                    error!(queue, "Consumer stream ended");
                    break Err(anyhow!("Consumer stream for {} ended", queue));
                }
            }
        }
    };

    if !in_flight.is_empty() {
        info!(queue, in_flight = in_flight.len(), "Waiting for in-flight messages to settle");
    }
    while let Some(joined) = in_flight.join_next().await {
        match fatal_cause(joined) {
            Some(fatal) if result.is_ok() => result = Err(fatal),
            Some(fatal) => warn!(error = %format!("{:#}", fatal), "Another fatal failure while draining"),
            None => {}
        }
    }

    if let Err(fatal) = &result {
        error!(queue, error = %format!("{:#}", fatal), "Fatal failure, consumer stopped");
    }

    result
}

fn fatal_cause(joined: Result<Option<Error>, JoinError>) -> Option<Error> {
    match joined {
        Ok(fatal) => fatal,
        Err(e) => {
            error!(error = %e, "Message handler task failed");
            None
        }
    }
}

/// Handles one delivery and settles it. Returns the cause when the outcome
/// is fatal to the process.
async fn process_delivery(
    queue: &str,
    mut delivery: Delivery,
    handler: &dyn MessageHandler,
) -> Option<Error> {
    let body = std::mem::take(&mut delivery.data);
    let envelope = Envelope::from_delivery(queue, delivery.properties.headers().as_ref(), body);

    let span = info_span!(
        "message",
        queue,
        correlation_id = %envelope.correlation_id,
        death_count = envelope.death_count
    );

    async move {
        let outcome = handler.handle(&envelope).await;
        log_outcome(&outcome);
        settle(&delivery.acker, outcome.action()).await;

        match outcome {
            Outcome::Retry(cause) if Outcome::is_fatal_error(&cause) => Some(cause),
            _ => None,
        }
    }
    .instrument(span)
    .await
}

async fn settle(acker: &Acker, action: Action) {
    let result = match action {
        Action::Ack => acker.ack(BasicAckOptions::default()).await.map(|_| ()),
        Action::Reject => acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map(|_| ()),
    };

    if let Err(e) = result {
        error!(error = %e, ?action, "Failed to settle message");
    }
}

pub fn log_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Completed => info!("Message processed"),
        Outcome::Drop(reason @ DropReason::RetryLimitExceeded { .. }) => {
            error!(reason = %reason, "Dropping message")
        }
        Outcome::Drop(reason) => warn!(reason = %reason, "Dropping message"),
        Outcome::Retry(cause) => {
            warn!(error = %format!("{:#}", cause), "Processing failed, message sent to retry")
        }
    }
}
