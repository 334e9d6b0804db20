//! Core domain models, error taxonomy, and storage for the integration
//! engine.
//!
//! Provides strongly-typed identifiers, the normalized webhook envelope,
//! processed-event records, the clock abstraction, and the narrow data-access
//! interface to the external CRUD subsystem. Every other crate builds on
//! these foundations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod access;
pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use access::{DataAccess, Entity, Transition};
pub use error::{CoreError, Result};
pub use models::{
    AuditEntry, DedupeKey, EntityRef, HealthStatus, IntegrationHealth, ProcessedEventRecord,
    ProcessedStatus, SourceService, TenantId, WebhookEvent,
};
pub use time::{now_utc, Clock, RealClock, TestClock};
