use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A single, individually addressed notification as the formatting stage sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: Uuid,
    pub source: String,
    pub destination_id: Uuid,
    pub template_id: Uuid,
    pub group_id: Option<Uuid>,
    /// Target user group of the parent group notification, if any.
    pub target_group: Option<Uuid>,
    pub subject: String,
    pub message: JsonValue,
}

/// A group-addressed notification waiting to be expanded into single notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupNotification {
    pub id: Uuid,
    pub source: String,
    pub destination_group_id: Uuid,
    pub template_id: Uuid,
    pub subject: String,
    pub message: JsonValue,
    pub send_with_gmt: bool,
}

/// Child row produced by the group fan-out, inserted into the single notification table.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub id: Uuid,
    pub source: String,
    pub destination_id: Uuid,
    pub template_id: Uuid,
    pub group_id: Uuid,
    pub subject: String,
    pub message: JsonValue,
    /// Seconds to hold the message before its first delivery.
    pub delay: i32,
}

/// Recipient profile returned by the identity service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub groups: Vec<String>,
}

impl UserProfile {
    /// Notifications without a target group are urgent and always pass.
    pub fn is_subscribed(&self, target_group: Option<Uuid>) -> bool {
        match target_group {
            None => true,
            Some(group) => {
                let group = group.to_string();
                let groups: HashSet<&str> = self.groups.iter().map(String::as_str).collect();
                groups.contains(group.as_str())
            }
        }
    }
}

/// Signed UTC offset of one group member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientTimeOffset {
    pub user_id: Uuid,

    #[serde(default)]
    pub hours: i32,

    #[serde(default)]
    pub minutes: i32,
}

const SECONDS_IN_DAY: i64 = 24 * 60 * 60;

impl RecipientTimeOffset {
    /// Dispatch delay in seconds for this recipient.
    ///
    /// Without `send_with_gmt` the message goes out immediately. With it, a
    /// positive offset yields `86400 - total` and any other offset yields
    /// `total`, where `total = |hours| * 3600 + minutes * 60`.
    pub fn delay_seconds(&self, send_with_gmt: bool) -> i64 {
        if !send_with_gmt {
            return 0;
        }

        let total = i64::from(self.hours).abs() * 3600 + i64::from(self.minutes) * 60;

        if self.hours > 0 {
            SECONDS_IN_DAY - total
        } else {
            total
        }
    }
}

impl GroupNotification {
    /// Deterministic id of the child notification for `user_id`.
    ///
    /// A retried fan-out regenerates the same ids, so re-inserting the batch
    /// is absorbed by the primary key.
    pub fn child_id(&self, user_id: Uuid) -> Uuid {
        Uuid::new_v5(&self.id, user_id.as_bytes())
    }

    pub fn child_for(&self, recipient: &RecipientTimeOffset) -> NewNotification {
        let delay = recipient
            .delay_seconds(self.send_with_gmt)
            .clamp(0, i64::from(i32::MAX)) as i32;

        NewNotification {
            id: self.child_id(recipient.user_id),
            source: self.source.clone(),
            destination_id: recipient.user_id,
            template_id: self.template_id,
            group_id: self.id,
            subject: self.subject.clone(),
            message: self.message.clone(),
            delay,
        }
    }
}
