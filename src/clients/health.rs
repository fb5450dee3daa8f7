use std::{collections::HashMap, sync::Arc, time::Instant};

use chrono::Utc;
use redis::aio::MultiplexedConnection;
use tracing::{debug, warn};

use crate::{
    clients::{circuit_breaker::CircuitBreaker, database::DatabaseClient, rbmq::RabbitMqClient},
    models::{
        circuit_breaker::CircuitState,
        health::{HealthCheckResponse, HealthStatus, ServiceHealth},
    },
};

const CRITICAL: [&str; 3] = ["database", "cache_service", "message_broker"];

/// Probes the dependencies one worker process holds open.
pub struct HealthChecker {
    worker: String,
    database: Arc<DatabaseClient>,
    redis: MultiplexedConnection,
    broker: Arc<RabbitMqClient>,
    breakers: Vec<CircuitBreaker>,
}

impl HealthChecker {
    pub fn new(
        worker: &str,
        database: Arc<DatabaseClient>,
        redis: MultiplexedConnection,
        broker: Arc<RabbitMqClient>,
        breakers: Vec<CircuitBreaker>,
    ) -> Self {
        Self {
            worker: worker.to_string(),
            database,
            redis,
            broker,
            breakers,
        }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        checks.insert("database".to_string(), self.check_database().await);
        checks.insert("cache_service".to_string(), self.check_redis().await);
        checks.insert("message_broker".to_string(), self.check_rabbitmq());

        for breaker in &self.breakers {
            checks.insert(
                breaker.service_name().to_string(),
                Self::check_circuit_breaker(breaker).await,
            );
        }

        HealthCheckResponse {
            status: overall_status(&checks),
            worker: self.worker.clone(),
            timestamp: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            checks,
        }
    }

    async fn check_database(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.database.health_check().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Database health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                ServiceHealth::unhealthy(format!("Health check query failed: {}", e))
            }
        }
    }

    async fn check_redis(&self) -> ServiceHealth {
        let start = Instant::now();
        let mut connection = self.redis.clone();

        match redis::cmd("PING").query_async::<String>(&mut connection).await {
            Ok(_) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Redis health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Redis ping failed");
                ServiceHealth::unhealthy(format!("Ping failed: {}", e))
            }
        }
    }

    fn check_rabbitmq(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.broker.health_check() {
            Ok(()) => ServiceHealth::healthy(start.elapsed().as_millis() as u64),
            Err(e) => {
                warn!(error = %e, "RabbitMQ health check failed");
                ServiceHealth::unhealthy(e.to_string())
            }
        }
    }

    async fn check_circuit_breaker(breaker: &CircuitBreaker) -> ServiceHealth {
        match breaker.state().await {
            Ok(state) => {
                debug!(
                    service = breaker.service_name(),
                    circuit_state = %state,
                    "Circuit breaker state checked"
                );
                ServiceHealth::circuit(state.as_str(), circuit_status(state))
            }
            Err(e) => {
                warn!(
                    service = breaker.service_name(),
                    error = %e,
                    "Failed to check circuit breaker state"
                );
                ServiceHealth::unhealthy(format!("Cannot check circuit breaker: {}", e))
            }
        }
    }
}

fn circuit_status(state: CircuitState) -> HealthStatus {
    match state {
        CircuitState::Closed => HealthStatus::Healthy,
        CircuitState::Open | CircuitState::HalfOpen => HealthStatus::Degraded,
    }
}

/// Unhealthy when a critical dependency is down, degraded when only a
/// collaborator is impaired.
pub fn overall_status(checks: &HashMap<String, ServiceHealth>) -> HealthStatus {
    let critical_unhealthy = checks
        .iter()
        .filter(|(name, _)| CRITICAL.contains(&name.as_str()))
        .any(|(_, health)| health.status == HealthStatus::Unhealthy);

    if critical_unhealthy {
        HealthStatus::Unhealthy
    } else if checks
        .values()
        .any(|health| health.status != HealthStatus::Healthy)
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
