use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, header::AUTHORIZATION};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clients::circuit_breaker::CircuitBreaker,
    config::Config,
    models::{
        notification::{RecipientTimeOffset, UserProfile},
        retry::RetryConfig,
    },
    utils::retry_with_backoff,
};

const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Recipient lookups served by the identity service.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// `None` when the service does not know the user.
    async fn user_by_id(
        &self,
        user_id: Uuid,
        correlation_id: &str,
    ) -> Result<Option<UserProfile>, Error>;

    /// Members of `group_id` with their UTC offsets; empty for an unknown group.
    async fn users_by_group(
        &self,
        group_id: Uuid,
        correlation_id: &str,
    ) -> Result<Vec<RecipientTimeOffset>, Error>;
}

pub struct IdentityClient {
    http_client: Client,
    base_url: String,
    user_path: String,
    group_path: String,
    access_token: String,
    retry_config: RetryConfig,
    circuit_breaker: Option<CircuitBreaker>,
}

impl IdentityClient {
    pub fn new(config: &Config, circuit_breaker: Option<CircuitBreaker>) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        info!(base_url = %config.auth_service_url, "Identity service client initialized");

        Ok(Self {
            http_client,
            base_url: config.auth_service_url.trim_end_matches('/').to_string(),
            user_path: config.auth_user_path.clone(),
            group_path: config.auth_group_path.clone(),
            access_token: config.auth_access_token.clone(),
            retry_config: config.retry_config(),
            circuit_breaker,
        })
    }

    fn url(&self, path: &str, id: Uuid) -> String {
        format!("{}{}/{}", self.base_url, path, id)
    }

    async fn get_json<T>(&self, url: &str, correlation_id: &str) -> Result<Option<T>, Error>
    where
        T: DeserializeOwned + Send,
    {
        let fetch = move || self.fetch_with_retry::<T>(url, correlation_id);

        match &self.circuit_breaker {
            Some(breaker) => breaker.call(fetch).await,
            None => fetch().await,
        }
    }

    async fn fetch_with_retry<T>(&self, url: &str, correlation_id: &str) -> Result<Option<T>, Error>
    where
        T: DeserializeOwned + Send,
    {
        let http_client = &self.http_client;
        let access_token = self.access_token.as_str();

        retry_with_backoff(&self.retry_config, move || async move {
            let response = http_client
                .get(url)
                .header(AUTHORIZATION, access_token)
                .header(REQUEST_ID_HEADER, correlation_id)
                .send()
                .await
                .map_err(|e| e.to_string())?;

            let status = response.status();

            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }

            if !status.is_success() {
                return Err(format!("Identity service returned status {}", status));
            }

            let body: T = response
                .json()
                .await
                .map_err(|e| format!("Failed to parse identity service JSON: {}", e))?;

            Ok(Some(body))
        })
        .await
        .map_err(|e| anyhow!("Identity service request failed: {}", e))
    }
}

#[async_trait]
impl IdentityDirectory for IdentityClient {
    async fn user_by_id(
        &self,
        user_id: Uuid,
        correlation_id: &str,
    ) -> Result<Option<UserProfile>, Error> {
        let url = self.url(&self.user_path, user_id);
        let profile = self.get_json::<UserProfile>(&url, correlation_id).await?;

        match &profile {
            Some(_) => debug!(%user_id, correlation_id, "Recipient profile fetched"),
            None => warn!(%user_id, correlation_id, "Identity service does not know recipient"),
        }

        Ok(profile)
    }

    async fn users_by_group(
        &self,
        group_id: Uuid,
        correlation_id: &str,
    ) -> Result<Vec<RecipientTimeOffset>, Error> {
        let url = self.url(&self.group_path, group_id);
        let members = self
            .get_json::<Vec<RecipientTimeOffset>>(&url, correlation_id)
            .await?
            .unwrap_or_default();

        debug!(%group_id, correlation_id, members = members.len(), "Group members fetched");

        Ok(members)
    }
}
