//! Webhook intake: validation, signature verification, normalization.
//!
//! The three upstream services duck-type their payloads differently, so each
//! gets its own normalizer producing the common [`WebhookEvent`] envelope.
//! Intake performs no side effects beyond validation; it never touches
//! tenant state.

use std::{collections::HashMap, sync::Arc};

use conflux_core::{now_utc, Clock, SourceService, TenantId, WebhookEvent};
use serde_json::Value;
use tracing::warn;

use crate::{
    crypto,
    error::{EngineError, Result},
};

/// Per-service webhook signing secrets.
///
/// A service without a configured secret accepts unsigned deliveries; once a
/// secret is present, a missing or mismatched signature is a security
/// failure.
#[derive(Debug, Clone, Default)]
pub struct SigningSecrets {
    secrets: HashMap<SourceService, String>,
}

impl SigningSecrets {
    /// Creates an empty secret set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the secret for one service.
    pub fn set(&mut self, service: SourceService, secret: impl Into<String>) {
        self.secrets.insert(service, secret.into());
    }

    /// Secret configured for a service, if any.
    pub fn secret_for(&self, service: SourceService) -> Option<&str> {
        self.secrets.get(&service).map(String::as_str)
    }
}

/// Raw inbound delivery as received by the HTTP layer.
#[derive(Debug, Clone, Copy)]
pub struct RawDelivery<'a> {
    /// Raw request body.
    pub body: &'a [u8],
    /// `X-Tenant-ID` header value, if present.
    pub tenant_header: Option<&'a str>,
    /// `X-Webhook-Signature` header value, if present.
    pub signature: Option<&'a str>,
}

/// Validates and normalizes inbound webhooks.
#[derive(Debug, Clone)]
pub struct WebhookIntake {
    secrets: SigningSecrets,
    clock: Arc<dyn Clock>,
}

impl WebhookIntake {
    /// Creates an intake with the given signing secrets.
    pub fn new(secrets: SigningSecrets, clock: Arc<dyn Clock>) -> Self {
        Self { secrets, clock }
    }

    /// Validates a raw delivery and produces the normalized envelope.
    ///
    /// Signature verification runs before any payload parsing: a bad
    /// signature is a security failure and must not leak parse errors.
    pub fn normalize(
        &self,
        service: SourceService,
        delivery: RawDelivery<'_>,
    ) -> Result<WebhookEvent> {
        if let Some(secret) = self.secrets.secret_for(service) {
            let signature = delivery.signature.unwrap_or("");
            if let Err(err) = crypto::verify_signature(delivery.body, signature, secret) {
                warn!(service = %service, error = %err, "webhook signature rejected");
                return Err(EngineError::invalid_signature(service));
            }
        }

        let payload: Value = serde_json::from_slice(delivery.body)
            .map_err(|e| EngineError::malformed(format!("invalid JSON payload: {e}")))?;

        if !payload.is_object() {
            return Err(EngineError::malformed("payload must be a JSON object"));
        }

        let (tenant_id, data) = match service {
            SourceService::User => normalize_user(&payload, delivery.tenant_header)?,
            SourceService::Payment => normalize_payment(&payload, delivery.tenant_header)?,
            SourceService::Communication => {
                normalize_communication(&payload, delivery.tenant_header)?
            },
        };

        Ok(WebhookEvent {
            event_id: require_str(&payload, "event_id")?.to_string(),
            service,
            event_type: require_str(&payload, "event_type")?.to_string(),
            tenant_id,
            payload: data,
            received_at: now_utc(self.clock.as_ref()),
            signature: delivery.signature.map(str::to_string),
        })
    }
}

/// User-service payloads carry the tenant as `organization_id`.
fn normalize_user(payload: &Value, tenant_header: Option<&str>) -> Result<(TenantId, Value)> {
    let tenant = resolve_tenant(&[payload.get("organization_id")], tenant_header)?;
    Ok((tenant, data_object(payload)))
}

/// Payment-service payloads embed `tenant_id` at the top level.
fn normalize_payment(payload: &Value, tenant_header: Option<&str>) -> Result<(TenantId, Value)> {
    let tenant = resolve_tenant(&[payload.get("tenant_id")], tenant_header)?;
    Ok((tenant, data_object(payload)))
}

/// Communication-service payloads put the tenant at the top level or inside
/// `metadata`.
fn normalize_communication(
    payload: &Value,
    tenant_header: Option<&str>,
) -> Result<(TenantId, Value)> {
    let metadata_tenant = payload.get("metadata").and_then(|m| m.get("tenant_id"));
    let tenant = resolve_tenant(&[payload.get("tenant_id"), metadata_tenant], tenant_header)?;
    Ok((tenant, data_object(payload)))
}

/// Resolves the tenant from embedded candidates, falling back to the header.
fn resolve_tenant(candidates: &[Option<&Value>], tenant_header: Option<&str>) -> Result<TenantId> {
    for candidate in candidates.iter().flatten() {
        if let Some(id) = candidate.as_str() {
            if !id.is_empty() {
                return Ok(TenantId::from(id));
            }
        }
    }

    match tenant_header {
        Some(id) if !id.is_empty() => Ok(TenantId::from(id)),
        _ => Err(EngineError::malformed("tenant id not resolvable")),
    }
}

/// The upstream `data` object, or an empty object when absent.
fn data_object(payload: &Value) -> Value {
    payload.get("data").cloned().unwrap_or_else(|| Value::Object(serde_json::Map::new()))
}

/// Requires a non-empty string field on the payload.
fn require_str<'a>(payload: &'a Value, key: &str) -> Result<&'a str> {
    match payload.get(key).and_then(Value::as_str) {
        Some(value) if !value.is_empty() => Ok(value),
        Some(_) => Err(EngineError::malformed(format!("field '{key}' is empty"))),
        None => Err(EngineError::malformed(format!("missing required field '{key}'"))),
    }
}
