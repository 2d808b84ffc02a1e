pub mod cache;
pub mod city;
pub mod client_ip;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod history;
pub mod metrics;
pub mod openapi;
pub mod orchestrator;
pub mod provider;
pub mod rate_limit;
pub mod sweeper;
