use lapin::types::{AMQPValue, FieldTable};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CORRELATION_ID_HEADER: &str = "x-request-id";
pub const DEATH_HEADER: &str = "x-death";

/// A delivered broker message, validated once at the consumer boundary.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub correlation_id: String,
    /// How many times the message was rejected out of its live queue.
    pub death_count: u64,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn from_delivery(queue: &str, headers: Option<&FieldTable>, body: Vec<u8>) -> Self {
        let correlation_id = headers
            .and_then(|table| header_string(table, CORRELATION_ID_HEADER))
            .unwrap_or_else(|| {
                let generated = Uuid::new_v4().to_string();
                tracing::warn!(
                    correlation_id = %generated,
                    queue,
                    "Delivery has no correlation id, generated one"
                );
                generated
            });

        let death_count = headers
            .map(|table| rejected_count(table, queue))
            .unwrap_or(0);

        Self {
            correlation_id,
            death_count,
            body,
        }
    }

    /// Raw stages carry the bare notification id as the message body.
    pub fn notification_id(&self) -> anyhow::Result<Uuid> {
        let text = std::str::from_utf8(&self.body)?;
        Ok(Uuid::parse_str(text.trim())?)
    }
}

/// Payload published by the formatting stage for the delivery stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattedEmail {
    pub notification_id: Uuid,
    pub html: String,
    pub to: String,
    pub reply_to: String,
    pub subject: String,
}

fn header_string(table: &FieldTable, name: &str) -> Option<String> {
    table
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .and_then(|(_, value)| amqp_string(value))
}

fn amqp_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

fn amqp_u64(value: &AMQPValue) -> Option<u64> {
    match value {
        AMQPValue::LongLongInt(v) => u64::try_from(*v).ok(),
        AMQPValue::LongInt(v) => u64::try_from(*v).ok(),
        AMQPValue::LongUInt(v) => Some(u64::from(*v)),
        AMQPValue::ShortInt(v) => u64::try_from(*v).ok(),
        AMQPValue::ShortUInt(v) => Some(u64::from(*v)),
        _ => None,
    }
}

/// Reads the broker-maintained `x-death` header.
///
/// The broker keeps one entry per (queue, reason) pair and bumps its `count`
/// on every repeat, so the `rejected` entry of the live queue counts exactly
/// the reject cycles this message went through.
fn rejected_count(table: &FieldTable, queue: &str) -> u64 {
    let Some((_, AMQPValue::FieldArray(deaths))) = table
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == DEATH_HEADER)
    else {
        return 0;
    };

    deaths
        .as_slice()
        .iter()
        .filter_map(|entry| match entry {
            AMQPValue::FieldTable(death) => Some(death),
            _ => None,
        })
        .filter(|death| {
            header_string(death, "reason").as_deref() == Some("rejected")
                && header_string(death, "queue").as_deref() == Some(queue)
        })
        .filter_map(|death| {
            death
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == "count")
                .and_then(|(_, value)| amqp_u64(value))
        })
        .max()
        .unwrap_or(0)
}
