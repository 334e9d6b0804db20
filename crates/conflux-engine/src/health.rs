//! Integration health derivation.
//!
//! Combines circuit state with a short rolling window of call outcomes into
//! a per-service status. Pure read: recomputed on every query, never cached,
//! never persisted as a source of truth.

use std::{collections::HashMap, collections::VecDeque, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use conflux_core::{now_utc, Clock, HealthStatus, IntegrationHealth, SourceService};
use tokio::sync::Mutex;

use crate::circuit::{CircuitRegistry, CircuitState};

/// Tuning for health derivation.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// How far back call outcomes count toward the failure rate.
    pub window: Duration,
    /// Failure rate within the window that degrades a closed circuit.
    pub degraded_failure_rate: f64,
    /// Minimum outcomes in the window before the rate is considered.
    pub min_samples: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(600),
            degraded_failure_rate: 0.3,
            min_samples: 3,
        }
    }
}

/// One recorded call outcome.
#[derive(Debug, Clone, Copy)]
struct CallOutcome {
    at: DateTime<Utc>,
    success: bool,
}

/// Aggregated view over the rolling window.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowStats {
    /// Outcomes in the window.
    pub total: u32,
    /// Failed outcomes in the window.
    pub failures: u32,
    /// Most recent success, if any.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Most recent failure, if any.
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl WindowStats {
    /// Failure rate over the window.
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.failures) / f64::from(self.total)
        }
    }
}

/// Rolling per-service log of outbound call outcomes.
///
/// Bounded per service; old entries are pruned on insert so the log never
/// grows past the window.
#[derive(Debug)]
pub struct OutcomeLog {
    window: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<SourceService, VecDeque<CallOutcome>>>,
}

impl OutcomeLog {
    /// Creates a log covering the given window.
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Self { window, max_entries, entries: Mutex::new(HashMap::new()) }
    }

    /// Records a call outcome.
    pub async fn record(&self, service: SourceService, success: bool, at: DateTime<Utc>) {
        let mut entries = self.entries.lock().await;
        let log = entries.entry(service).or_default();

        log.push_back(CallOutcome { at, success });

        let cutoff = at - chrono::Duration::from_std(self.window).unwrap_or_default();
        while log.front().is_some_and(|o| o.at < cutoff) {
            log.pop_front();
        }
        while log.len() > self.max_entries {
            log.pop_front();
        }
    }

    /// Stats over outcomes still inside the window at `now`.
    pub async fn window_stats(&self, service: SourceService, now: DateTime<Utc>) -> WindowStats {
        let entries = self.entries.lock().await;
        let cutoff = now - chrono::Duration::from_std(self.window).unwrap_or_default();

        let mut stats = WindowStats::default();
        if let Some(log) = entries.get(&service) {
            for outcome in log.iter().filter(|o| o.at >= cutoff) {
                stats.total += 1;
                if outcome.success {
                    stats.last_success_at = Some(outcome.at);
                } else {
                    stats.failures += 1;
                    stats.last_failure_at = Some(outcome.at);
                }
            }
        }
        stats
    }
}

impl Default for OutcomeLog {
    fn default() -> Self {
        Self::new(Duration::from_secs(600), 256)
    }
}

/// Derives per-service health from breaker state and recent outcomes.
pub struct HealthAggregator {
    circuits: Arc<CircuitRegistry>,
    outcomes: Arc<OutcomeLog>,
    config: HealthConfig,
    clock: Arc<dyn Clock>,
}

impl HealthAggregator {
    /// Creates an aggregator over the shared breaker registry and outcome
    /// log.
    pub fn new(
        circuits: Arc<CircuitRegistry>,
        outcomes: Arc<OutcomeLog>,
        config: HealthConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { circuits, outcomes, config, clock }
    }

    /// Health of one service.
    pub async fn service_health(&self, service: SourceService) -> IntegrationHealth {
        let now = now_utc(self.clock.as_ref());
        let circuit = self.circuits.snapshot(service).await;
        let stats = self.outcomes.window_stats(service, now).await;

        let status = match circuit.state {
            CircuitState::Open => HealthStatus::Down,
            CircuitState::HalfOpen => HealthStatus::Degraded,
            CircuitState::Closed => {
                let elevated = stats.total >= self.config.min_samples
                    && stats.failure_rate() >= self.config.degraded_failure_rate;
                if elevated {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            },
        };

        IntegrationHealth {
            service,
            status,
            last_success_at: stats.last_success_at,
            last_failure_at: stats.last_failure_at,
            consecutive_failures: circuit.consecutive_failures,
        }
    }

    /// Health of every known service, in stable order.
    pub async fn snapshot(&self) -> Vec<IntegrationHealth> {
        let mut all = Vec::with_capacity(SourceService::ALL.len());
        for service in SourceService::ALL {
            all.push(self.service_health(service).await);
        }
        all
    }
}
