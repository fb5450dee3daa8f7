use std::sync::Arc;

use anyhow::{Error, Result};
use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::clients::database::DatabaseClient;

/// Mutual exclusion over "who may process notification X right now".
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Returns `true` only to the single caller that set the claim.
    async fn claim(&self, id: Uuid) -> Result<bool, Error>;

    /// Clears the claim so a later attempt can take it again.
    async fn release(&self, id: Uuid) -> Result<(), Error>;
}

/// Which flag a pipeline stage claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimScope {
    /// `single_emails.claimed_at`, taken by the formatting stage.
    Formatting,
    /// `single_emails.sent_at`, taken by the delivery stage.
    Delivery,
    /// `group_emails.claimed_at`, taken by the group fan-out stage.
    GroupFanout,
}

impl ClaimScope {
    pub fn table(&self) -> &'static str {
        match self {
            ClaimScope::Formatting | ClaimScope::Delivery => "email.single_emails",
            ClaimScope::GroupFanout => "email.group_emails",
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            ClaimScope::Formatting | ClaimScope::GroupFanout => "claimed_at",
            ClaimScope::Delivery => "sent_at",
        }
    }

    fn claim_statement(&self) -> String {
        format!(
            "UPDATE {table} SET {column} = now() \
             WHERE id = $1 AND {column} IS NULL AND deleted_at IS NULL",
            table = self.table(),
            column = self.column(),
        )
    }

    fn release_statement(&self) -> String {
        format!(
            "UPDATE {table} SET {column} = NULL WHERE id = $1 AND deleted_at IS NULL",
            table = self.table(),
            column = self.column(),
        )
    }
}

/// Claim store backed by a single conditional `UPDATE` per operation.
pub struct PgClaimStore {
    database: Arc<DatabaseClient>,
    scope: ClaimScope,
    claim_sql: String,
    release_sql: String,
}

impl PgClaimStore {
    pub fn new(database: Arc<DatabaseClient>, scope: ClaimScope) -> Self {
        Self {
            database,
            scope,
            claim_sql: scope.claim_statement(),
            release_sql: scope.release_statement(),
        }
    }
}

#[async_trait]
impl ClaimStore for PgClaimStore {
    async fn claim(&self, id: Uuid) -> Result<bool, Error> {
        let affected = self.database.execute(&self.claim_sql, &[&id]).await?;

        debug!(notification_id = %id, scope = ?self.scope, claimed = affected > 0, "Claim attempted");

        Ok(affected > 0)
    }

    async fn release(&self, id: Uuid) -> Result<(), Error> {
        self.database.execute(&self.release_sql, &[&id]).await?;

        debug!(notification_id = %id, scope = ?self.scope, "Claim released");

        Ok(())
    }
}
