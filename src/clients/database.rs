use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result};
use thiserror::Error as ThisError;
use tokio::sync::RwLock;
use tokio_postgres::{Client, NoTls, Row, types::ToSql};
use tracing::{debug, error, info, warn};

use crate::{models::retry::RetryConfig, utils::retry_with_backoff};

const SCHEMA: &str = include_str!("../../schema/notifications.sql");
const PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, ThisError)]
pub enum DatabaseError {
    /// Connectivity was not restored within the backoff ceiling.
    #[error("database unavailable after {attempts} attempts: {reason}")]
    Unavailable { attempts: u32, reason: String },

    #[error("database statement failed: {0}")]
    Statement(#[from] tokio_postgres::Error),
}

type Params<'a> = &'a [&'a (dyn ToSql + Sync)];

/// PostgreSQL client that reconnects on demand and retries connectivity
/// failures with bounded backoff.
pub struct DatabaseClient {
    database_url: String,
    client: RwLock<Arc<Client>>,
    retry_config: RetryConfig,
}

impl DatabaseClient {
    pub async fn connect(database_url: &str, retry_config: RetryConfig) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let client = retry_with_backoff(&retry_config, || Self::open(database_url))
            .await
            .map_err(|e| DatabaseError::Unavailable {
                attempts: retry_config.max_attempts,
                reason: e.to_string(),
            })?;

        info!("PostgreSQL connection established");

        Ok(Self {
            database_url: database_url.to_string(),
            client: RwLock::new(client),
            retry_config,
        })
    }

    async fn open(database_url: &str) -> Result<Arc<Client>, tokio_postgres::Error> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection terminated");
            }
        });

        Ok(Arc::new(client))
    }

    async fn client(&self) -> Result<Arc<Client>, tokio_postgres::Error> {
        {
            let current = self.client.read().await;
            if !current.is_closed() {
                return Ok(Arc::clone(&current));
            }
        }

        let mut current = self.client.write().await;
        if current.is_closed() {
            warn!("PostgreSQL connection closed, reconnecting");
            *current = Self::open(&self.database_url).await?;
        }

        Ok(Arc::clone(&current))
    }

    /// Runs `operation` with a live client.
    ///
    /// Lost connections and socket errors are retried; everything else,
    /// including client-side encoding errors, is returned immediately.
    async fn run<T, F, Fut>(&self, operation: F) -> Result<T, DatabaseError>
    where
        F: Fn(Arc<Client>) -> Fut,
        Fut: Future<Output = Result<T, tokio_postgres::Error>>,
    {
        let operation = &operation;
        let outcome = retry_with_backoff(&self.retry_config, move || async move {
            let client = self.client().await?;
            match operation(client).await {
                Ok(value) => Ok(Ok(value)),
                Err(e) if is_connectivity_error(&e) => Err(e),
                Err(e) => Ok(Err(e)),
            }
        })
        .await;

        match outcome {
            Ok(result) => result.map_err(DatabaseError::from),
            Err(e) => {
                error!(
                    error = %e,
                    attempts = self.retry_config.max_attempts,
                    "PostgreSQL unreachable, giving up"
                );
                Err(DatabaseError::Unavailable {
                    attempts: self.retry_config.max_attempts,
                    reason: e.to_string(),
                })
            }
        }
    }

    pub async fn execute(&self, statement: &str, params: Params<'_>) -> Result<u64, DatabaseError> {
        let affected = self
            .run(move |client| async move { client.execute(statement, params).await })
            .await?;

        debug!(affected, "Statement executed");
        Ok(affected)
    }

    pub async fn query(&self, statement: &str, params: Params<'_>) -> Result<Vec<Row>, DatabaseError> {
        self.run(move |client| async move { client.query(statement, params).await })
            .await
    }

    pub async fn query_opt(
        &self,
        statement: &str,
        params: Params<'_>,
    ) -> Result<Option<Row>, DatabaseError> {
        self.run(move |client| async move { client.query_opt(statement, params).await })
            .await
    }

    /// Creates the notification tables when they do not exist yet.
    pub async fn apply_schema(&self) -> Result<(), DatabaseError> {
        self.run(move |client| async move { client.batch_execute(SCHEMA).await })
            .await?;

        info!("Notification schema applied");
        Ok(())
    }

    /// One bounded attempt, without the backoff used for pipeline work.
    pub async fn health_check(&self) -> Result<(), DatabaseError> {
        let ping = async {
            let client = self.client().await?;
            client.simple_query("SELECT 1").await
        };

        match tokio::time::timeout(PING_TIMEOUT, ping).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if is_connectivity_error(&e) => Err(DatabaseError::Unavailable {
                attempts: 1,
                reason: e.to_string(),
            }),
            Ok(Err(e)) => Err(DatabaseError::Statement(e)),
            Err(_) => Err(DatabaseError::Unavailable {
                attempts: 1,
                reason: format!("no answer within {:?}", PING_TIMEOUT),
            }),
        }
    }
}

/// True when the connection itself failed rather than the statement.
fn is_connectivity_error(error: &tokio_postgres::Error) -> bool {
    error.is_closed()
        || std::error::Error::source(error).is_some_and(|source| source.is::<std::io::Error>())
}
