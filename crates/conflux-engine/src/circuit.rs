//! Per-service circuit breakers gating outbound calls.
//!
//! One breaker per external service: the failure mode being guarded against
//! is the remote service being down, which no tenant-level breaker would
//! catch. All state changes go through the registry's synchronized
//! outcome-reporting operations; callers never read-then-write breaker state.
//!
//! # State machine
//!
//! ```text
//! closed ──(threshold failures or failure rate)──▶ open
//! open ──(cooldown elapsed, one probe admitted)──▶ half_open
//! half_open ──(M consecutive probe successes)──▶ closed
//! half_open ──(any probe failure)──▶ open (escalated cooldown)
//! ```

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use conflux_core::{now_utc, Clock, SourceService};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{EngineError, Result};

/// Circuit breaker tuning, shared by all services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Minimum calls in the window before the failure rate is considered.
    pub min_samples_for_rate: u32,
    /// Failure rate (0.0 to 1.0) that opens the circuit.
    pub failure_rate_threshold: f64,
    /// Base cooldown before an open circuit admits a probe.
    pub cooldown: Duration,
    /// Cooldown multiplier applied per consecutive reopen from half-open.
    pub cooldown_escalation: f64,
    /// Upper bound on the escalated cooldown.
    pub max_cooldown: Duration,
    /// Consecutive probe successes required to close from half-open.
    pub success_threshold: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            min_samples_for_rate: 10,
            failure_rate_threshold: 0.5,
            cooldown: Duration::from_secs(30),
            cooldown_escalation: 2.0,
            max_cooldown: Duration::from_secs(300),
            success_threshold: 2,
        }
    }
}

/// Current state of one service's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls fail fast; no network call is attempted.
    Open,
    /// A single probe call is testing recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Read-only view of one service's breaker, for health derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Service this breaker guards.
    pub service: SourceService,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures reported.
    pub consecutive_failures: u32,
    /// Consecutive probe successes in half-open.
    pub consecutive_successes: u32,
    /// Calls in the current window.
    pub window_requests: u32,
    /// Failed calls in the current window.
    pub window_failures: u32,
    /// When the circuit last opened.
    pub opened_at: Option<DateTime<Utc>>,
    /// When an open circuit next admits a probe.
    pub next_probe_at: Option<DateTime<Utc>>,
}

impl CircuitSnapshot {
    /// Failure rate over the current window.
    pub fn failure_rate(&self) -> f64 {
        if self.window_requests == 0 {
            0.0
        } else {
            f64::from(self.window_failures) / f64::from(self.window_requests)
        }
    }
}

/// Internal mutable state for one service.
#[derive(Debug)]
struct CircuitCell {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    window_requests: u32,
    window_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    next_probe_at: Option<DateTime<Utc>>,
    reopen_count: u32,
    probe_in_flight: bool,
}

impl CircuitCell {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            window_requests: 0,
            window_failures: 0,
            opened_at: None,
            next_probe_at: None,
            reopen_count: 0,
            probe_in_flight: false,
        }
    }

    fn reset_window(&mut self) {
        self.window_requests = 0;
        self.window_failures = 0;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.probe_in_flight = false;
    }

    fn failure_rate(&self) -> f64 {
        if self.window_requests == 0 {
            0.0
        } else {
            f64::from(self.window_failures) / f64::from(self.window_requests)
        }
    }
}

/// Registry of per-service circuit breakers.
///
/// Shared across all concurrent callers targeting the external services.
/// Pass it explicitly to components that need it; there are no ambient
/// globals.
#[derive(Debug)]
pub struct CircuitRegistry {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    circuits: Mutex<HashMap<SourceService, CircuitCell>>,
}

impl CircuitRegistry {
    /// Creates a registry with all circuits closed.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, circuits: Mutex::new(HashMap::new()) }
    }

    /// Admits or rejects a call to the given service.
    ///
    /// Closed circuits always admit. An open circuit whose cooldown has
    /// elapsed transitions to half-open and admits the caller as the probe;
    /// while a probe is in flight every other caller is rejected. The
    /// admitted caller must report the outcome via [`Self::record_success`]
    /// or [`Self::record_failure`].
    pub async fn try_acquire(&self, service: SourceService) -> Result<()> {
        let now = now_utc(self.clock.as_ref());
        let mut circuits = self.circuits.lock().await;
        let cell = circuits.entry(service).or_insert_with(CircuitCell::new);

        match cell.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if cell.next_probe_at.is_some_and(|probe_at| now >= probe_at) {
                    tracing::info!(service = %service, "circuit half-open, admitting probe");
                    cell.state = CircuitState::HalfOpen;
                    cell.consecutive_successes = 0;
                    cell.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(EngineError::circuit_open(service))
                }
            },
            CircuitState::HalfOpen => {
                if cell.probe_in_flight {
                    Err(EngineError::circuit_open(service))
                } else {
                    cell.probe_in_flight = true;
                    Ok(())
                }
            },
        }
    }

    /// Records a successful call outcome.
    pub async fn record_success(&self, service: SourceService) {
        let mut circuits = self.circuits.lock().await;
        let cell = circuits.entry(service).or_insert_with(CircuitCell::new);

        cell.window_requests += 1;
        cell.consecutive_failures = 0;

        match cell.state {
            CircuitState::Closed => {},
            CircuitState::Open => {
                tracing::warn!(service = %service, "success recorded for open circuit");
            },
            CircuitState::HalfOpen => {
                cell.probe_in_flight = false;
                cell.consecutive_successes += 1;

                if cell.consecutive_successes >= self.config.success_threshold {
                    tracing::info!(service = %service, "circuit closed, service recovered");
                    cell.state = CircuitState::Closed;
                    cell.opened_at = None;
                    cell.next_probe_at = None;
                    cell.reopen_count = 0;
                    cell.reset_window();
                }
            },
        }
    }

    /// Records a failed call outcome. Timeouts count as failures.
    pub async fn record_failure(&self, service: SourceService) {
        let now = now_utc(self.clock.as_ref());
        let mut circuits = self.circuits.lock().await;
        let cell = circuits.entry(service).or_insert_with(CircuitCell::new);

        cell.window_requests += 1;
        cell.window_failures += 1;
        cell.consecutive_failures += 1;
        cell.consecutive_successes = 0;

        match cell.state {
            CircuitState::Closed => {
                let threshold_hit = cell.consecutive_failures >= self.config.failure_threshold;
                let rate_hit = cell.window_requests >= self.config.min_samples_for_rate
                    && cell.failure_rate() >= self.config.failure_rate_threshold;

                if threshold_hit || rate_hit {
                    self.open_cell(cell, service, now, false);
                }
            },
            CircuitState::Open => {},
            CircuitState::HalfOpen => {
                cell.probe_in_flight = false;
                self.open_cell(cell, service, now, true);
            },
        }
    }

    /// Current state of a service's circuit.
    pub async fn state(&self, service: SourceService) -> CircuitState {
        let circuits = self.circuits.lock().await;
        circuits.get(&service).map_or(CircuitState::Closed, |cell| cell.state)
    }

    /// When an open circuit next admits a probe, if it is open.
    pub async fn next_probe_at(&self, service: SourceService) -> Option<DateTime<Utc>> {
        let circuits = self.circuits.lock().await;
        circuits
            .get(&service)
            .filter(|cell| cell.state == CircuitState::Open)
            .and_then(|cell| cell.next_probe_at)
    }

    /// Read-only snapshot of one service's breaker.
    pub async fn snapshot(&self, service: SourceService) -> CircuitSnapshot {
        let mut circuits = self.circuits.lock().await;
        let cell = circuits.entry(service).or_insert_with(CircuitCell::new);

        CircuitSnapshot {
            service,
            state: cell.state,
            consecutive_failures: cell.consecutive_failures,
            consecutive_successes: cell.consecutive_successes,
            window_requests: cell.window_requests,
            window_failures: cell.window_failures,
            opened_at: cell.opened_at,
            next_probe_at: cell.next_probe_at,
        }
    }

    /// Snapshots for every known service, in stable order.
    pub async fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut all = Vec::with_capacity(SourceService::ALL.len());
        for service in SourceService::ALL {
            all.push(self.snapshot(service).await);
        }
        all
    }

    /// Forces a circuit into a state. Admin/test escape hatch.
    pub async fn force_state(&self, service: SourceService, state: CircuitState) {
        let now = now_utc(self.clock.as_ref());
        let mut circuits = self.circuits.lock().await;
        let cell = circuits.entry(service).or_insert_with(CircuitCell::new);

        cell.state = state;
        match state {
            CircuitState::Open => {
                cell.opened_at = Some(now);
                cell.next_probe_at = Some(now + self.chrono_cooldown(0));
            },
            CircuitState::Closed => {
                cell.opened_at = None;
                cell.next_probe_at = None;
                cell.reopen_count = 0;
                cell.reset_window();
            },
            CircuitState::HalfOpen => {
                cell.probe_in_flight = false;
                cell.consecutive_successes = 0;
            },
        }
    }

    /// Opens a circuit, escalating the cooldown on reopens from half-open.
    fn open_cell(
        &self,
        cell: &mut CircuitCell,
        service: SourceService,
        now: DateTime<Utc>,
        reopened: bool,
    ) {
        if reopened {
            cell.reopen_count += 1;
        } else {
            cell.reopen_count = 0;
        }

        let cooldown = self.chrono_cooldown(cell.reopen_count);
        cell.state = CircuitState::Open;
        cell.opened_at = Some(now);
        cell.next_probe_at = Some(now + cooldown);

        tracing::warn!(
            service = %service,
            consecutive_failures = cell.consecutive_failures,
            failure_rate = cell.failure_rate(),
            cooldown_secs = cooldown.num_seconds(),
            reopen_count = cell.reopen_count,
            "circuit opened"
        );
    }

    /// Cooldown for the given reopen count, escalated and capped.
    fn chrono_cooldown(&self, reopen_count: u32) -> chrono::Duration {
        let factor = self.config.cooldown_escalation.max(1.0).powi(
            i32::try_from(reopen_count).unwrap_or(i32::MAX),
        );
        let escalated = self.config.cooldown.as_secs_f64() * factor;
        let capped = escalated.min(self.config.max_cooldown.as_secs_f64());
        chrono::Duration::from_std(Duration::from_secs_f64(capped))
            .unwrap_or_else(|_| chrono::Duration::seconds(300))
    }
}
