//! HTTP request handlers.

pub mod events;
pub mod health;
pub mod webhooks;

pub use events::{get_event, list_events};
pub use health::{health_check, integration_health, liveness_check, readiness_check};
pub use webhooks::ingest_webhook;
