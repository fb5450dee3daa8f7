use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::models::{circuit_breaker::CircuitBreakerConfig, retry::RetryConfig};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,

    #[serde(default = "default_exchange_incoming")]
    pub exchange_incoming: String,
    #[serde(default = "default_exchange_sorter")]
    pub exchange_sorter: String,
    #[serde(default = "default_exchange_retry")]
    pub exchange_retry: String,
    #[serde(default = "default_queue_waiting_depart")]
    pub queue_waiting_depart: String,
    #[serde(default = "default_queue_waiting_retry")]
    pub queue_waiting_retry: String,
    #[serde(default = "default_message_ttl_ms")]
    pub default_message_ttl_ms: u32,
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u64,

    #[serde(default = "default_queue_raw_single_messages")]
    pub queue_raw_single_messages: String,
    #[serde(default = "default_queue_raw_group_messages")]
    pub queue_raw_group_messages: String,
    #[serde(default = "default_queue_formatted_single_messages")]
    pub queue_formatted_single_messages: String,

    pub database_url: String,

    pub redis_url: String,

    pub auth_service_url: String,
    pub auth_access_token: String,
    #[serde(default = "default_auth_user_path")]
    pub auth_user_path: String,
    #[serde(default = "default_auth_group_path")]
    pub auth_group_path: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,

    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_login: String,
    pub smtp_password: String,
    pub smtp_from_address: String,

    #[serde(default = "default_circuit_breaker_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_circuit_breaker_timeout_seconds")]
    pub circuit_breaker_timeout_seconds: u64,
    #[serde(default = "default_circuit_breaker_success_threshold")]
    pub circuit_breaker_success_threshold: u32,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

/// Wire names and timings of the broker graph shared by every worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub exchange_incoming: String,
    pub exchange_sorter: String,
    pub exchange_retry: String,
    pub queue_waiting_depart: String,
    pub queue_waiting_retry: String,
    pub default_message_ttl_ms: u32,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange_incoming: default_exchange_incoming(),
            exchange_sorter: default_exchange_sorter(),
            exchange_retry: default_exchange_retry(),
            queue_waiting_depart: default_queue_waiting_depart(),
            queue_waiting_retry: default_queue_waiting_retry(),
            default_message_ttl_ms: default_message_ttl_ms(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        Ok(config)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            timeout_seconds: self.circuit_breaker_timeout_seconds,
            success_threshold: self.circuit_breaker_success_threshold,
        }
    }

    pub fn topology(&self) -> Topology {
        Topology {
            exchange_incoming: self.exchange_incoming.clone(),
            exchange_sorter: self.exchange_sorter.clone(),
            exchange_retry: self.exchange_retry.clone(),
            queue_waiting_depart: self.queue_waiting_depart.clone(),
            queue_waiting_retry: self.queue_waiting_retry.clone(),
            default_message_ttl_ms: self.default_message_ttl_ms,
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }
}

fn default_prefetch_count() -> u16 {
    10
}

fn default_exchange_incoming() -> String {
    "exchange_incoming".to_string()
}

fn default_exchange_sorter() -> String {
    "exchange_sorter".to_string()
}

fn default_exchange_retry() -> String {
    "exchange_retry".to_string()
}

fn default_queue_waiting_depart() -> String {
    "queue_waiting_depart".to_string()
}

fn default_queue_waiting_retry() -> String {
    "queue_waiting_retry".to_string()
}

fn default_message_ttl_ms() -> u32 {
    60_000
}

fn default_max_retry_count() -> u64 {
    5
}

fn default_queue_raw_single_messages() -> String {
    "queue_raw_single_messages".to_string()
}

fn default_queue_raw_group_messages() -> String {
    "queue_raw_group_messages".to_string()
}

fn default_queue_formatted_single_messages() -> String {
    "queue_formatted_single_messages".to_string()
}

fn default_auth_user_path() -> String {
    "/api/v1/users".to_string()
}

fn default_auth_group_path() -> String {
    "/api/v1/groups".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    10
}

fn default_smtp_port() -> u16 {
    465
}

fn default_circuit_breaker_failure_threshold() -> u32 {
    5
}

fn default_circuit_breaker_timeout_seconds() -> u64 {
    30
}

fn default_circuit_breaker_success_threshold() -> u32 {
    2
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_initial_retry_delay_ms() -> u64 {
    100
}

fn default_max_retry_delay_ms() -> u64 {
    10_000
}

fn default_retry_backoff_multiplier() -> u64 {
    2
}

fn default_server_port() -> u16 {
    8080
}
