// Strava Sync - Library root

pub mod auth;
pub mod config;
pub mod error;
pub mod extractor;
pub mod http_client;
pub mod loader;
pub mod models;
pub mod pipeline;
pub mod transform;
