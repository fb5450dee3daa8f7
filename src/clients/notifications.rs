use std::sync::Arc;

use anyhow::{Error, Result};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_postgres::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clients::database::{DatabaseClient, DatabaseError},
    models::{
        notification::{GroupNotification, NewNotification, Notification},
        template::Template,
    },
};

/// Row lookups and writes the pipeline stages need besides claiming.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn notification(&self, id: Uuid) -> Result<Option<Notification>, Error>;

    async fn template(&self, id: Uuid) -> Result<Option<Template>, Error>;

    async fn group_notification(&self, id: Uuid) -> Result<Option<GroupNotification>, Error>;

    /// Inserts the rows in one statement, skipping ids that already exist.
    async fn insert_notifications(&self, rows: &[NewNotification]) -> Result<u64, Error>;

    async fn record_sent_result(&self, id: Uuid, result: &str) -> Result<(), Error>;
}

const SELECT_NOTIFICATION: &str = "\
    SELECT s.id, s.source, s.destination_id, s.template_id, s.group_id, \
           s.subject, s.message, g.destination_id AS target_group \
    FROM email.single_emails s \
    LEFT JOIN email.group_emails g ON g.id = s.group_id \
    WHERE s.id = $1 AND s.deleted_at IS NULL";

const SELECT_TEMPLATE: &str = "\
    SELECT id, title, template FROM email.html_templates \
    WHERE id = $1 AND deleted_at IS NULL";

const SELECT_GROUP_NOTIFICATION: &str = "\
    SELECT id, source, destination_id, template_id, subject, message, send_with_gmt \
    FROM email.group_emails \
    WHERE id = $1 AND deleted_at IS NULL";

const INSERT_NOTIFICATIONS: &str = "\
    INSERT INTO email.single_emails \
        (id, source, destination_id, template_id, group_id, subject, message, delay) \
    SELECT * FROM UNNEST( \
        $1::uuid[], $2::text[], $3::uuid[], $4::uuid[], \
        $5::uuid[], $6::text[], $7::jsonb[], $8::int4[]) \
    ON CONFLICT (id) DO NOTHING";

const UPDATE_SENT_RESULT: &str = "\
    UPDATE email.single_emails SET sent_result = $2, updated_at = now() \
    WHERE id = $1 AND deleted_at IS NULL";

pub struct PgNotificationStore {
    database: Arc<DatabaseClient>,
}

impl PgNotificationStore {
    pub fn new(database: Arc<DatabaseClient>) -> Self {
        Self { database }
    }

    fn notification_from_row(row: &Row) -> Result<Notification, DatabaseError> {
        Ok(Notification {
            id: row.try_get("id")?,
            source: row.try_get("source")?,
            destination_id: row.try_get("destination_id")?,
            template_id: row.try_get("template_id")?,
            group_id: row.try_get("group_id")?,
            target_group: row.try_get("target_group")?,
            subject: row.try_get("subject")?,
            message: row.try_get("message")?,
        })
    }

    fn group_notification_from_row(row: &Row) -> Result<GroupNotification, DatabaseError> {
        Ok(GroupNotification {
            id: row.try_get("id")?,
            source: row.try_get("source")?,
            destination_group_id: row.try_get("destination_id")?,
            template_id: row.try_get("template_id")?,
            subject: row.try_get("subject")?,
            message: row.try_get("message")?,
            send_with_gmt: row.try_get("send_with_gmt")?,
        })
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn notification(&self, id: Uuid) -> Result<Option<Notification>, Error> {
        let Some(row) = self.database.query_opt(SELECT_NOTIFICATION, &[&id]).await? else {
            warn!(notification_id = %id, "Notification not found in single_emails");
            return Ok(None);
        };

        debug!(notification_id = %id, "Notification loaded");
        Ok(Some(Self::notification_from_row(&row)?))
    }

    async fn template(&self, id: Uuid) -> Result<Option<Template>, Error> {
        let Some(row) = self.database.query_opt(SELECT_TEMPLATE, &[&id]).await? else {
            warn!(template_id = %id, "Template not found in html_templates");
            return Ok(None);
        };

        Ok(Some(Template {
            id: row.try_get("id").map_err(DatabaseError::from)?,
            title: row.try_get("title").map_err(DatabaseError::from)?,
            body: row.try_get("template").map_err(DatabaseError::from)?,
        }))
    }

    async fn group_notification(&self, id: Uuid) -> Result<Option<GroupNotification>, Error> {
        let Some(row) = self
            .database
            .query_opt(SELECT_GROUP_NOTIFICATION, &[&id])
            .await?
        else {
            warn!(group_notification_id = %id, "Group notification not found in group_emails");
            return Ok(None);
        };

        Ok(Some(Self::group_notification_from_row(&row)?))
    }

    async fn insert_notifications(&self, rows: &[NewNotification]) -> Result<u64, Error> {
        if rows.is_empty() {
            return Ok(0);
        }

        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let sources: Vec<&str> = rows.iter().map(|r| r.source.as_str()).collect();
        let destinations: Vec<Uuid> = rows.iter().map(|r| r.destination_id).collect();
        let templates: Vec<Uuid> = rows.iter().map(|r| r.template_id).collect();
        let groups: Vec<Uuid> = rows.iter().map(|r| r.group_id).collect();
        let subjects: Vec<&str> = rows.iter().map(|r| r.subject.as_str()).collect();
        let messages: Vec<JsonValue> = rows.iter().map(|r| r.message.clone()).collect();
        let delays: Vec<i32> = rows.iter().map(|r| r.delay).collect();

        let inserted = self
            .database
            .execute(
                INSERT_NOTIFICATIONS,
                &[
                    &ids,
                    &sources,
                    &destinations,
                    &templates,
                    &groups,
                    &subjects,
                    &messages,
                    &delays,
                ],
            )
            .await?;

        info!(
            requested = rows.len(),
            inserted, "Child notifications inserted"
        );

        Ok(inserted)
    }

    async fn record_sent_result(&self, id: Uuid, result: &str) -> Result<(), Error> {
        self.database
            .execute(UPDATE_SENT_RESULT, &[&id, &result])
            .await?;

        debug!(notification_id = %id, "Transport result recorded");
        Ok(())
    }
}
