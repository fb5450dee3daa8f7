use anyhow::Error;
use thiserror::Error as ThisError;

use crate::clients::database::DatabaseError;

/// Why a message is acknowledged without being processed to completion.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum DropReason {
    #[error("too many repeat deliveries ({count} > {max})")]
    RetryLimitExceeded { count: u64, max: u64 },

    #[error("already being processed, processed or deleted")]
    AlreadyClaimed,

    #[error("notification row not found")]
    NotificationMissing,

    #[error("template not found")]
    TemplateMissing,

    #[error("recipient not found")]
    RecipientMissing,

    #[error("recipient has no email address")]
    RecipientWithoutAddress,

    #[error("recipient is not subscribed to the notification group")]
    NotSubscribed,
}

/// Result of one stage handling one message.
#[derive(Debug)]
pub enum Outcome {
    Completed,
    Drop(DropReason),
    Retry(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Ack,
    Reject,
}

impl Outcome {
    pub fn action(&self) -> Action {
        match self {
            Outcome::Completed | Outcome::Drop(_) => Action::Ack,
            Outcome::Retry(_) => Action::Reject,
        }
    }

    /// A retry caused by the store giving up means this process should stop.
    pub fn is_fatal(&self) -> bool {
        match self {
            Outcome::Retry(error) => Self::is_fatal_error(error),
            _ => false,
        }
    }

    pub fn is_fatal_error(error: &Error) -> bool {
        matches!(
            error.downcast_ref::<DatabaseError>(),
            Some(DatabaseError::Unavailable { .. })
        )
    }
}

impl From<Error> for Outcome {
    fn from(error: Error) -> Self {
        Outcome::Retry(error)
    }
}
