pub mod claim;
pub mod consumer;
pub mod fanout;
pub mod formatter;
pub mod sender;

use async_trait::async_trait;

use crate::models::{message::Envelope, outcome::Outcome};

/// One pipeline stage. Every delivered message ends in exactly one outcome,
/// which the consume loop turns into an ack or a reject.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Outcome;
}
