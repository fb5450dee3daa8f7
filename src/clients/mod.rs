pub mod circuit_breaker;
pub mod claims;
pub mod database;
pub mod health;
pub mod identity;
pub mod notifications;
pub mod rbmq;
pub mod smtp;
pub mod template;
