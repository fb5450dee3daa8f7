//! In-memory stand-ins for the pipeline's collaborators.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use notify_pipeline::{
    clients::{
        claims::ClaimStore, database::DatabaseError, identity::IdentityDirectory,
        notifications::NotificationStore, rbmq::MessagePublisher, smtp::MailTransport,
    },
    models::{
        message::{Envelope, FormattedEmail},
        notification::{GroupNotification, NewNotification, Notification, RecipientTimeOffset, UserProfile},
        template::Template,
    },
};
use uuid::Uuid;

pub fn envelope(body: impl Into<Vec<u8>>) -> Envelope {
    Envelope {
        correlation_id: "req-test".to_string(),
        death_count: 0,
        body: body.into(),
    }
}

pub fn id_envelope(id: Uuid) -> Envelope {
    envelope(id.to_string())
}

#[derive(Debug, Default, Clone, Copy)]
struct ClaimRow {
    claimed: bool,
    deleted: bool,
}

/// One claim flag per row, with the same semantics as the conditional update.
#[derive(Default)]
pub struct MemoryClaims {
    rows: Mutex<HashMap<Uuid, ClaimRow>>,
    unavailable: AtomicBool,
    pub releases: AtomicUsize,
}

impl MemoryClaims {
    pub fn with_rows(ids: &[Uuid]) -> Self {
        let claims = Self::default();
        for id in ids {
            claims.add(*id);
        }
        claims
    }

    pub fn add(&self, id: Uuid) {
        self.rows.lock().unwrap().insert(id, ClaimRow::default());
    }

    pub fn delete(&self, id: Uuid) {
        if let Some(row) = self.rows.lock().unwrap().get_mut(&id) {
            row.deleted = true;
        }
    }

    pub fn is_claimed(&self, id: Uuid) -> bool {
        self.rows
            .lock()
            .unwrap()
            .get(&id)
            .is_some_and(|row| row.claimed)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DatabaseError::Unavailable {
                attempts: 3,
                reason: "connection refused".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl ClaimStore for MemoryClaims {
    async fn claim(&self, id: Uuid) -> Result<bool, Error> {
        self.check_available()?;
        tokio::task::yield_now().await;

        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&id) {
            Some(row) if !row.claimed && !row.deleted => {
                row.claimed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, id: Uuid) -> Result<(), Error> {
        self.check_available()?;
        self.releases.fetch_add(1, Ordering::SeqCst);

        if let Some(row) = self.rows.lock().unwrap().get_mut(&id) {
            if !row.deleted {
                row.claimed = false;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub notifications: Mutex<HashMap<Uuid, Notification>>,
    pub templates: Mutex<HashMap<Uuid, Template>>,
    pub groups: Mutex<HashMap<Uuid, GroupNotification>>,
    pub inserted: Mutex<HashMap<Uuid, NewNotification>>,
    pub sent_results: Mutex<HashMap<Uuid, String>>,
    pub insert_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn add_notification(&self, notification: Notification) {
        self.notifications
            .lock()
            .unwrap()
            .insert(notification.id, notification);
    }

    pub fn add_template(&self, template: Template) {
        self.templates.lock().unwrap().insert(template.id, template);
    }

    pub fn add_group(&self, group: GroupNotification) {
        self.groups.lock().unwrap().insert(group.id, group);
    }

    pub fn sent_result(&self, id: Uuid) -> Option<String> {
        self.sent_results.lock().unwrap().get(&id).cloned()
    }

    pub fn inserted_count(&self) -> usize {
        self.inserted.lock().unwrap().len()
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn notification(&self, id: Uuid) -> Result<Option<Notification>, Error> {
        Ok(self.notifications.lock().unwrap().get(&id).cloned())
    }

    async fn template(&self, id: Uuid) -> Result<Option<Template>, Error> {
        Ok(self.templates.lock().unwrap().get(&id).cloned())
    }

    async fn group_notification(&self, id: Uuid) -> Result<Option<GroupNotification>, Error> {
        Ok(self.groups.lock().unwrap().get(&id).cloned())
    }

    async fn insert_notifications(&self, rows: &[NewNotification]) -> Result<u64, Error> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);

        let mut inserted = self.inserted.lock().unwrap();
        let mut count = 0;
        for row in rows {
            if !inserted.contains_key(&row.id) {
                inserted.insert(row.id, row.clone());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn record_sent_result(&self, id: Uuid, result: &str) -> Result<(), Error> {
        self.sent_results
            .lock()
            .unwrap()
            .insert(id, result.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeIdentity {
    pub users: Mutex<HashMap<Uuid, UserProfile>>,
    pub groups: Mutex<HashMap<Uuid, Vec<RecipientTimeOffset>>>,
    pub failing: AtomicBool,
    pub correlation_ids: Mutex<Vec<String>>,
}

impl FakeIdentity {
    pub fn add_user(&self, id: Uuid, profile: UserProfile) {
        self.users.lock().unwrap().insert(id, profile);
    }

    pub fn add_group(&self, id: Uuid, members: Vec<RecipientTimeOffset>) {
        self.groups.lock().unwrap().insert(id, members);
    }

    fn observe(&self, correlation_id: &str) -> Result<()> {
        self.correlation_ids
            .lock()
            .unwrap()
            .push(correlation_id.to_string());

        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("identity service returned status 503"));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityDirectory for FakeIdentity {
    async fn user_by_id(
        &self,
        user_id: Uuid,
        correlation_id: &str,
    ) -> Result<Option<UserProfile>, Error> {
        self.observe(correlation_id)?;
        Ok(self.users.lock().unwrap().get(&user_id).cloned())
    }

    async fn users_by_group(
        &self,
        group_id: Uuid,
        correlation_id: &str,
    ) -> Result<Vec<RecipientTimeOffset>, Error> {
        self.observe(correlation_id)?;
        Ok(self
            .groups
            .lock()
            .unwrap()
            .get(&group_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub queue: String,
    pub body: Vec<u8>,
    pub correlation_id: String,
    pub delay: Duration,
}

/// Records publishes. `fail_from` makes the n-th and later publishes fail.
#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<Published>>,
    attempts: AtomicUsize,
    fail_from: Mutex<Option<usize>>,
}

impl RecordingPublisher {
    pub fn fail_from(&self, attempt: Option<usize>) {
        *self.fail_from.lock().unwrap() = attempt;
        self.attempts.store(0, Ordering::SeqCst);
    }

    pub fn take(&self) -> Vec<Published> {
        std::mem::take(&mut *self.published.lock().unwrap())
    }

    pub fn count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

#[async_trait]
impl MessagePublisher for RecordingPublisher {
    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        correlation_id: &str,
        delay: Duration,
    ) -> Result<(), Error> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(fail_from) = *self.fail_from.lock().unwrap() {
            if attempt >= fail_from {
                return Err(anyhow!("Broker refused message for {}", queue));
            }
        }

        self.published.lock().unwrap().push(Published {
            queue: queue.to_string(),
            body: body.to_vec(),
            correlation_id: correlation_id.to_string(),
            delay,
        });
        Ok(())
    }
}

pub const SMTP_OK: &str = "250 2.0.0 Ok: queued";

#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<FormattedEmail>>,
    pub failing: AtomicBool,
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, email: &FormattedEmail) -> Result<String, Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("SMTP transport error: connection reset"));
        }

        self.sent.lock().unwrap().push(email.clone());
        Ok(SMTP_OK.to_string())
    }
}
