pub mod clients;
pub mod config;
pub mod models;
pub mod pipeline;
pub mod runtime;
pub mod utils;
