use anyhow::{Error, Result, anyhow};
use chrono::Utc;
use redis::{AsyncCommands, aio::MultiplexedConnection};
use tracing::{debug, info, warn};

use crate::models::circuit_breaker::{CircuitBreakerConfig, CircuitState};

/// Breaker whose state lives in Redis, so every worker instance guarding the
/// same collaborator trips and recovers together.
#[derive(Clone)]
pub struct CircuitBreaker {
    service_name: String,
    connection: MultiplexedConnection,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(
        service_name: &str,
        connection: MultiplexedConnection,
        config: CircuitBreakerConfig,
    ) -> Self {
        info!(service = service_name, "Circuit breaker initialized");

        Self {
            service_name: service_name.to_string(),
            connection,
            config,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        match self.state().await? {
            CircuitState::Open => {
                if self.should_attempt_reset().await? {
                    info!(service = %self.service_name, "Circuit breaker attempting reset");
                    self.set_state(CircuitState::HalfOpen).await?;
                    return self.try_operation(operation).await;
                }
                warn!(service = %self.service_name, "Circuit breaker is open, rejecting request");
                Err(anyhow!("Circuit breaker is open for {}", self.service_name))
            }
            CircuitState::HalfOpen => {
                debug!(service = %self.service_name, "Circuit breaker in half-open state");
                self.try_operation(operation).await
            }
            CircuitState::Closed => self.try_operation(operation).await,
        }
    }

    pub async fn state(&self) -> Result<CircuitState, Error> {
        let mut connection = self.connection.clone();
        let value: Option<String> = connection.get(self.key("state")).await?;

        Ok(CircuitState::from_stored(value.as_deref()))
    }

    async fn try_operation<F, Fut, T>(&self, operation: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        // Bookkeeping failures never replace the operation's own result.
        match operation().await {
            Ok(result) => {
                if let Err(e) = self.record_success().await {
                    warn!(
                        service = %self.service_name,
                        error = %e,
                        "Failed to record circuit breaker success"
                    );
                }
                Ok(result)
            }
            Err(e) => {
                if let Err(record_error) = self.record_failure().await {
                    warn!(
                        service = %self.service_name,
                        error = %record_error,
                        "Failed to record circuit breaker failure"
                    );
                }
                Err(e)
            }
        }
    }

    async fn record_success(&self) -> Result<(), Error> {
        let mut connection = self.connection.clone();

        match self.state().await? {
            CircuitState::HalfOpen => {
                let successes: u32 = connection.incr(self.key("successes"), 1).await?;
                debug!(
                    service = %self.service_name,
                    successes,
                    threshold = self.config.success_threshold,
                    "Circuit breaker success recorded"
                );

                if successes >= self.config.success_threshold {
                    self.set_state(CircuitState::Closed).await?;
                    connection
                        .del::<_, ()>(vec![
                            self.key("failures"),
                            self.key("successes"),
                            self.key("opened_at"),
                        ])
                        .await?;
                    info!(service = %self.service_name, "Circuit breaker closed after successful recovery");
                }
            }
            CircuitState::Closed => {
                connection.del::<_, ()>(self.key("failures")).await?;
            }
            CircuitState::Open => {}
        }

        Ok(())
    }

    async fn record_failure(&self) -> Result<(), Error> {
        if self.state().await? == CircuitState::HalfOpen {
            self.trip().await?;
            warn!(service = %self.service_name, "Circuit breaker reopened after failed recovery attempt");
            return Ok(());
        }

        let mut connection = self.connection.clone();
        let failures_key = self.key("failures");
        let failures: u32 = connection.incr(&failures_key, 1).await?;
        connection
            .expire::<_, ()>(&failures_key, self.config.timeout_seconds as i64)
            .await?;

        debug!(
            service = %self.service_name,
            failures,
            threshold = self.config.failure_threshold,
            "Circuit breaker failure recorded"
        );

        if failures >= self.config.failure_threshold {
            self.trip().await?;
            warn!(
                service = %self.service_name,
                failures,
                "Circuit breaker opened due to consecutive failures"
            );
        }

        Ok(())
    }

    async fn trip(&self) -> Result<(), Error> {
        let mut connection = self.connection.clone();

        self.set_state(CircuitState::Open).await?;
        connection
            .set::<_, _, ()>(self.key("opened_at"), Utc::now().timestamp())
            .await?;
        connection.del::<_, ()>(self.key("successes")).await?;

        Ok(())
    }

    async fn set_state(&self, state: CircuitState) -> Result<(), Error> {
        let mut connection = self.connection.clone();
        connection
            .set::<_, _, ()>(self.key("state"), state.as_str())
            .await?;
        Ok(())
    }

    async fn should_attempt_reset(&self) -> Result<bool, Error> {
        let mut connection = self.connection.clone();
        let opened_at: Option<i64> = connection.get(self.key("opened_at")).await?;

        Ok(opened_at.is_none_or(|opened_at| {
            let elapsed = Utc::now().timestamp().saturating_sub(opened_at);
            elapsed >= self.config.timeout_seconds as i64
        }))
    }

    fn key(&self, suffix: &str) -> String {
        state_key(&self.service_name, suffix)
    }
}

/// Redis key holding one piece of a breaker's shared state.
pub fn state_key(service_name: &str, suffix: &str) -> String {
    format!("circuit:{}:{}", service_name, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_per_service() {
        assert_eq!(state_key("smtp", "state"), "circuit:smtp:state");
        assert_eq!(
            state_key("identity_service", "opened_at"),
            "circuit:identity_service:opened_at"
        );
    }
}
