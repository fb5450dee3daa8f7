use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use redis::aio::MultiplexedConnection;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    clients::{
        circuit_breaker::CircuitBreaker,
        claims::{ClaimScope, PgClaimStore},
        database::DatabaseClient,
        health::HealthChecker,
        notifications::PgNotificationStore,
        rbmq::RabbitMqClient,
    },
    config::Config,
    models::health::{HealthCheckResponse, HealthStatus},
    pipeline::{MessageHandler, claim::ClaimGuard, consumer::run_consumer},
    utils::{init_tracing, retry_with_backoff},
};

/// Clients shared by every worker process, built once in `main`.
pub struct Runtime {
    pub config: Config,
    pub database: Arc<DatabaseClient>,
    pub redis: MultiplexedConnection,
    pub broker: Arc<RabbitMqClient>,
}

impl Runtime {
    /// Installs the TLS provider and logging, then loads configuration.
    pub fn bootstrap() -> Result<Config, Error> {
        rustls::crypto::ring::default_provider()
            .install_default()
            .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

        init_tracing();

        Config::load()
    }

    pub async fn start(config: Config) -> Result<Self, Error> {
        let retry_config = config.retry_config();

        let database = Arc::new(DatabaseClient::connect(&config.database_url, retry_config.clone()).await?);

        info!("Connecting to Redis");
        let redis_client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| anyhow!("Failed to create redis client: {}", e))?;
        let redis = retry_with_backoff(&retry_config, || {
            redis_client.get_multiplexed_async_connection()
        })
        .await
        .map_err(|e| anyhow!("Failed to connect to redis: {}", e))?;
        info!("Redis connection established");

        let broker = Arc::new(
            RabbitMqClient::connect(&config.rabbitmq_url, config.prefetch_count, config.topology())
                .await?,
        );
        broker.declare_topology().await?;

        Ok(Self {
            config,
            database,
            redis,
            broker,
        })
    }

    pub fn circuit_breaker(&self, service_name: &str) -> CircuitBreaker {
        CircuitBreaker::new(
            service_name,
            self.redis.clone(),
            self.config.circuit_breaker_config(),
        )
    }

    pub fn claim_guard(&self, scope: ClaimScope) -> ClaimGuard {
        ClaimGuard::new(
            Arc::new(PgClaimStore::new(Arc::clone(&self.database), scope)),
            self.config.max_retry_count,
        )
    }

    pub fn notification_store(&self) -> Arc<PgNotificationStore> {
        Arc::new(PgNotificationStore::new(Arc::clone(&self.database)))
    }

    /// Serves the health endpoint and consumes `queue` until the consumer
    /// fails or the process is interrupted. Interrupting stops new deliveries
    /// and lets the ones in flight settle.
    pub async fn serve(
        self,
        worker: &str,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        breakers: Vec<CircuitBreaker>,
    ) -> Result<(), Error> {
        let health_checker = HealthChecker::new(
            worker,
            Arc::clone(&self.database),
            self.redis.clone(),
            Arc::clone(&self.broker),
            breakers,
        );

        let port = self.config.server_port;
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "Health check server started");

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, health_routes(health_checker)).await {
                error!(error = %e, "Health check server stopped");
            }
        });

        info!(worker, queue, "Worker started");

        let shutdown = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!(worker, "Shutdown signal received"),
                Err(e) => {
                    error!(error = %e, "Cannot listen for shutdown signal");
                    std::future::pending::<()>().await;
                }
            }
        };

        run_consumer(&self.broker, queue, worker, handler, shutdown).await
    }
}

/// `GET /health` for one worker process.
pub fn health_routes(health_checker: HealthChecker) -> Router {
    Router::new()
        .route("/health", get(report_health))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(health_checker))
}

async fn report_health(
    State(health_checker): State<Arc<HealthChecker>>,
) -> (StatusCode, Json<HealthCheckResponse>) {
    let health = health_checker.check_all().await;
    (http_status(health.status), Json(health))
}

/// Only an unhealthy worker fails the health check; degraded still answers 200.
fn http_status(status: HealthStatus) -> StatusCode {
    match status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}
