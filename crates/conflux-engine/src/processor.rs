//! Event processor: applies validated webhooks to internal state.
//!
//! Each event maps to one business transition on one entity, optionally
//! followed by a notification to another external service through the
//! circuit gateway. The processor owns the reservation lifecycle: every
//! exit path either completes the record (applied/ignored/failed), defers
//! it to the retry scheduler, or releases it.

use std::sync::Arc;

use conflux_core::{
    now_utc, AuditEntry, Clock, DataAccess, EntityRef, SourceService, Transition, WebhookEvent,
};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{
    error::{EngineError, Result},
    idempotency::{IdempotencyStore, ReservationVerdict},
    outbound::{CircuitGateway, OutboundMethod, OutboundRequest},
    retry::{RetryDecision, RetryPolicy},
    scheduler::{DeliveryAttempt, RetryScheduler},
};

/// Outcome of processing one webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    /// Side effects applied by this delivery.
    Applied,
    /// The event had already been applied; nothing re-ran.
    DuplicateApplied,
    /// Accepted; the outbound leg is queued for retry.
    Deferred,
    /// Permanently rejected; surfaced to operators, never retried.
    Ignored {
        /// Why the event was rejected.
        reason: String,
    },
}

impl ProcessingResult {
    /// Wire representation for HTTP responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::DuplicateApplied => "duplicate_applied",
            Self::Deferred => "deferred",
            Self::Ignored { .. } => "ignored",
        }
    }
}

/// What an event does: one transition, optionally one notification.
struct ApplyPlan {
    entity: EntityRef,
    transition: Transition,
    notify: Option<OutboundRequest>,
}

/// Applies events to internal state with exactly-once semantics.
pub struct EventProcessor {
    store: Arc<IdempotencyStore>,
    access: Arc<dyn DataAccess>,
    gateway: Arc<CircuitGateway>,
    scheduler: Arc<RetryScheduler>,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl EventProcessor {
    /// Creates a processor over the shared engine components.
    pub fn new(
        store: Arc<IdempotencyStore>,
        access: Arc<dyn DataAccess>,
        gateway: Arc<CircuitGateway>,
        scheduler: Arc<RetryScheduler>,
        retry_policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, access, gateway, scheduler, retry_policy, clock }
    }

    /// Processes a normalized webhook event.
    ///
    /// Errors returned here are intake-visible: `ConcurrentProcessing` and
    /// `StorageUnavailable`. Everything after the reservation resolves to a
    /// [`ProcessingResult`] and is never surfaced as an HTTP failure.
    pub async fn process(&self, event: WebhookEvent) -> Result<ProcessingResult> {
        let key = event.dedupe_key();

        match self.store.check_and_reserve(&event).await? {
            ReservationVerdict::Fresh => {},
            ReservationVerdict::DuplicateApplied => {
                debug!(key = %key, "duplicate of applied event, short-circuiting");
                return Ok(ProcessingResult::DuplicateApplied);
            },
            ReservationVerdict::DuplicateIgnored => {
                return Ok(ProcessingResult::Ignored {
                    reason: "previously rejected by internal state".to_string(),
                });
            },
        }

        let notify = match self.apply_local(&event).await {
            Ok(notify) => notify,
            Err(EngineError::PermanentApply { reason }) => {
                return self.finish_ignored(&event, reason).await;
            },
            Err(err) => {
                // The transition never ran; release so a redelivery starts
                // fresh instead of waiting out the staleness threshold.
                if let Err(release_err) = self.store.release(&key).await {
                    warn!(key = %key, error = %release_err, "failed to release reservation");
                }
                return Err(err);
            },
        };

        if let Some(request) = notify {
            match self.gateway.call(&request).await {
                Ok(_) => {},
                Err(EngineError::CircuitOpen { service }) => {
                    // No call went out; the deferred dispatch performs the
                    // first real attempt and the budget is untouched.
                    self.defer(&event, request, 1, EngineError::circuit_open(service)).await;
                    return Ok(ProcessingResult::Deferred);
                },
                Err(err) if err.is_transient() => {
                    self.defer(&event, request, 2, err).await;
                    return Ok(ProcessingResult::Deferred);
                },
                Err(err) => {
                    return self.finish_ignored(&event, err.to_string()).await;
                },
            }
        }

        self.store.mark_applied(&key).await?;
        info!(key = %key, event_type = %event.event_type, "event applied");
        Ok(ProcessingResult::Applied)
    }

    /// Handles a due delivery attempt from the retry scheduler.
    ///
    /// Completion failures are logged, not propagated: the reservation stays
    /// pending and becomes reclaimable after the staleness threshold.
    pub async fn handle_due_attempt(&self, attempt: DeliveryAttempt) {
        let target = attempt.request.target;

        // Breaker still open with the probe window ahead: push the attempt
        // to the probe time without consuming retry budget. A probe time in
        // the past falls through; the gateway admits this attempt as the
        // probe.
        if let Some(probe_at) = self.gateway.circuits().next_probe_at(target).await {
            let now = now_utc(self.clock.as_ref());
            if probe_at > now {
                debug!(key = %attempt.key, target = %target, "breaker open, deferring attempt");
                self.scheduler
                    .schedule(DeliveryAttempt { scheduled_at: probe_at, ..attempt })
                    .await;
                return;
            }
        }

        match self.gateway.call(&attempt.request).await {
            Ok(_) => {
                if let Err(err) = self.store.mark_applied(&attempt.key).await {
                    warn!(key = %attempt.key, error = %err, "failed to mark record applied");
                    return;
                }
                info!(
                    key = %attempt.key,
                    attempt = attempt.attempt_number,
                    "deferred delivery succeeded"
                );
            },
            Err(EngineError::CircuitOpen { .. }) => {
                // Probe slot taken or breaker reopened between the check and
                // the call; retry shortly without consuming budget.
                let retry_at =
                    now_utc(self.clock.as_ref())
                        + chrono::Duration::from_std(self.retry_policy.base_delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(1));
                self.scheduler
                    .schedule(DeliveryAttempt { scheduled_at: retry_at, ..attempt })
                    .await;
            },
            Err(err) if err.is_transient() => {
                match self.retry_policy.decide(attempt.attempt_number, &err) {
                    RetryDecision::Retry { delay } => {
                        let retry_at = now_utc(self.clock.as_ref())
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::seconds(1));
                        warn!(
                            key = %attempt.key,
                            attempt = attempt.attempt_number,
                            next_retry_at = %retry_at,
                            error = %err,
                            "delivery attempt failed, retry scheduled"
                        );
                        self.scheduler
                            .schedule(DeliveryAttempt {
                                attempt_number: attempt.attempt_number + 1,
                                scheduled_at: retry_at,
                                last_error: Some(err.to_string()),
                                ..attempt
                            })
                            .await;
                    },
                    RetryDecision::GiveUp { reason } => {
                        error!(
                            key = %attempt.key,
                            attempts = attempt.attempt_number,
                            reason = %reason,
                            "delivery terminally failed"
                        );
                        if let Err(mark_err) = self
                            .store
                            .mark_failed(&attempt.key, attempt.attempt_number, &err.to_string())
                            .await
                        {
                            warn!(key = %attempt.key, error = %mark_err, "failed to mark record failed");
                        }
                    },
                }
            },
            Err(err) => {
                error!(key = %attempt.key, error = %err, "deferred delivery permanently rejected");
                if let Err(mark_err) = self.store.mark_ignored(&attempt.key, &err.to_string()).await
                {
                    warn!(key = %attempt.key, error = %mark_err, "failed to mark record ignored");
                }
            },
        }
    }

    /// Applies the local transition and audit entry; returns the outbound
    /// notification still to be made, if the event requires one.
    async fn apply_local(&self, event: &WebhookEvent) -> Result<Option<OutboundRequest>> {
        let plan = self.plan_for(event)?;

        let tenant_ref = EntityRef::new("tenant", event.tenant_id.as_str());
        let tenant = self.access.get_entity(&event.tenant_id, &tenant_ref).await?;
        if tenant.is_none() {
            return Err(EngineError::permanent(format!(
                "tenant {} does not exist",
                event.tenant_id
            )));
        }

        let action = format!("webhook.{}", event.event_type);
        self.access.apply_transition(&event.tenant_id, &plan.entity, plan.transition).await?;
        self.access
            .write_audit_entry(AuditEntry {
                tenant_id: event.tenant_id.clone(),
                action,
                entity: plan.entity,
                detail: event.payload.clone(),
                recorded_at: now_utc(self.clock.as_ref()),
            })
            .await?;

        Ok(plan.notify)
    }

    /// Maps `(service, event_type)` to the transition and notification it
    /// implies. Unknown event types are permanent failures.
    fn plan_for(&self, event: &WebhookEvent) -> Result<ApplyPlan> {
        let key = event.dedupe_key();

        match (event.service, event.event_type.as_str()) {
            (SourceService::User, "user.created" | "user.updated") => {
                let user_id = data_str(event, "user_id")?;
                Ok(ApplyPlan {
                    entity: EntityRef::new("user", user_id),
                    transition: Transition::UpsertUser { attributes: event.payload.clone() },
                    notify: None,
                })
            },
            (SourceService::User, "user.deleted") => {
                let user_id = data_str(event, "user_id")?;
                Ok(ApplyPlan {
                    entity: EntityRef::new("user", user_id),
                    transition: Transition::DeactivateUser,
                    notify: Some(OutboundRequest::new(
                        &key,
                        SourceService::Communication,
                        OutboundMethod::Post,
                        "/notifications",
                        serde_json::json!({
                            "type": "user.deactivated",
                            "tenant_id": event.tenant_id.as_str(),
                            "user_id": user_id,
                        }),
                    )),
                })
            },
            (SourceService::Payment, "subscription.created" | "subscription.activated") => {
                let subscription_id = data_str(event, "subscription_id")?;
                Ok(ApplyPlan {
                    entity: EntityRef::new("subscription", subscription_id),
                    transition: Transition::ActivateSubscription,
                    notify: None,
                })
            },
            (SourceService::Payment, "subscription.cancelled") => {
                let subscription_id = data_str(event, "subscription_id")?;
                Ok(ApplyPlan {
                    entity: EntityRef::new("subscription", subscription_id),
                    transition: Transition::CancelSubscription,
                    notify: None,
                })
            },
            (SourceService::Payment, "payment.failed") => {
                let subscription_id = data_str(event, "subscription_id")?;
                Ok(ApplyPlan {
                    entity: EntityRef::new("subscription", subscription_id),
                    transition: Transition::MarkSubscriptionPastDue,
                    notify: Some(OutboundRequest::new(
                        &key,
                        SourceService::Communication,
                        OutboundMethod::Post,
                        "/emails",
                        serde_json::json!({
                            "template": "payment_failed",
                            "tenant_id": event.tenant_id.as_str(),
                            "subscription_id": subscription_id,
                        }),
                    )),
                })
            },
            (SourceService::Communication, "message.delivered") => {
                let message_id = data_str(event, "message_id")?;
                Ok(ApplyPlan {
                    entity: EntityRef::new("message", message_id),
                    transition: Transition::RecordMessageDelivered,
                    notify: None,
                })
            },
            (SourceService::Communication, "message.bounced") => {
                let message_id = data_str(event, "message_id")?;
                Ok(ApplyPlan {
                    entity: EntityRef::new("message", message_id),
                    transition: Transition::RecordMessageBounced,
                    notify: Some(OutboundRequest::new(
                        &key,
                        SourceService::User,
                        OutboundMethod::Post,
                        "/contacts/flags",
                        serde_json::json!({
                            "tenant_id": event.tenant_id.as_str(),
                            "message_id": message_id,
                            "reason": "bounce",
                        }),
                    )),
                })
            },
            (service, other) => Err(EngineError::permanent(format!(
                "unrecognized event type '{other}' from {service}"
            ))),
        }
    }

    /// Queues a retry for the outbound leg and leaves the record pending,
    /// so duplicate deliveries in the retry window see duplicate-pending.
    async fn defer(
        &self,
        event: &WebhookEvent,
        request: OutboundRequest,
        attempt_number: u32,
        cause: EngineError,
    ) {
        let scheduled_at = match &cause {
            EngineError::CircuitOpen { service } => {
                self.gateway.circuits().next_probe_at(*service).await.unwrap_or_else(|| {
                    now_utc(self.clock.as_ref())
                        + chrono::Duration::from_std(self.retry_policy.base_delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(1))
                })
            },
            _ => {
                now_utc(self.clock.as_ref())
                    + chrono::Duration::from_std(
                        self.retry_policy.jittered_delay(attempt_number.saturating_sub(1)),
                    )
                    .unwrap_or_else(|_| chrono::Duration::seconds(1))
            },
        };

        warn!(
            key = %event.dedupe_key(),
            target = %request.target,
            scheduled_at = %scheduled_at,
            error = %cause,
            "outbound leg deferred to retry scheduler"
        );

        self.scheduler
            .schedule(DeliveryAttempt {
                key: event.dedupe_key(),
                request,
                attempt_number,
                scheduled_at,
                last_error: Some(cause.to_string()),
            })
            .await;
    }

    /// Marks the record ignored and surfaces the rejection.
    async fn finish_ignored(
        &self,
        event: &WebhookEvent,
        reason: String,
    ) -> Result<ProcessingResult> {
        error!(
            key = %event.dedupe_key(),
            event_type = %event.event_type,
            reason = %reason,
            "event permanently rejected"
        );
        self.store.mark_ignored(&event.dedupe_key(), &reason).await?;
        Ok(ProcessingResult::Ignored { reason })
    }
}

/// Requires a non-empty string field on the event's data object.
fn data_str<'a>(event: &'a WebhookEvent, field: &str) -> Result<&'a str> {
    match event.payload.get(field).and_then(Value::as_str) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(EngineError::permanent(format!("event data missing '{field}'"))),
    }
}
