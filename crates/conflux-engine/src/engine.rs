//! Engine assembly: wires intake, idempotency, breakers, retries, and
//! health into one unit with managed background tasks.
//!
//! Two tasks run for the engine's lifetime: the retry scheduler loop feeding
//! due attempts into a channel, and the dispatcher draining that channel
//! through the event processor. Both stop cooperatively on shutdown.

use std::{sync::Arc, time::Duration};

use conflux_core::{now_utc, Clock, DataAccess, SourceService, WebhookEvent};
use tokio::{sync::mpsc, sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    circuit::{CircuitConfig, CircuitRegistry},
    error::Result,
    health::{HealthAggregator, HealthConfig, OutcomeLog},
    idempotency::{IdempotencyConfig, IdempotencyStore},
    intake::{RawDelivery, SigningSecrets, WebhookIntake},
    outbound::{CircuitGateway, OutboundClient},
    processor::{EventProcessor, ProcessingResult},
    retry::RetryPolicy,
    scheduler::RetryScheduler,
    storage::RecordStore,
};

/// Engine-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Circuit breaker tuning, shared by all services.
    pub circuit: CircuitConfig,
    /// Retry backoff policy for failed outbound legs.
    pub retry: RetryPolicy,
    /// Reservation and staleness tuning.
    pub idempotency: IdempotencyConfig,
    /// Health derivation tuning.
    pub health: HealthConfig,
    /// Per-service webhook signing secrets.
    pub secrets: SigningSecrets,
}

/// The external integration engine.
///
/// One instance per process. Shared state (circuit registry, outcome log,
/// idempotency store) is owned here and passed explicitly to the components
/// that need it.
pub struct IntegrationEngine {
    intake: WebhookIntake,
    processor: Arc<EventProcessor>,
    store: Arc<IdempotencyStore>,
    scheduler: Arc<RetryScheduler>,
    health: Arc<HealthAggregator>,
    circuits: Arc<CircuitRegistry>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IntegrationEngine {
    /// Buffer between the scheduler and the dispatcher.
    const DISPATCH_BUFFER: usize = 64;

    /// Assembles an engine from its injected dependencies.
    pub fn new(
        config: EngineConfig,
        records: Arc<dyn RecordStore>,
        access: Arc<dyn DataAccess>,
        client: Arc<dyn OutboundClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let circuits = Arc::new(CircuitRegistry::new(config.circuit.clone(), clock.clone()));
        let outcomes = Arc::new(OutcomeLog::new(config.health.window, 256));
        let gateway = Arc::new(CircuitGateway::new(
            client,
            circuits.clone(),
            outcomes.clone(),
            clock.clone(),
        ));
        let store = Arc::new(IdempotencyStore::new(
            records,
            config.idempotency.clone(),
            clock.clone(),
        ));
        let scheduler = Arc::new(RetryScheduler::new(clock.clone()));
        let processor = Arc::new(EventProcessor::new(
            store.clone(),
            access,
            gateway,
            scheduler.clone(),
            config.retry.clone(),
            clock.clone(),
        ));
        let health = Arc::new(HealthAggregator::new(
            circuits.clone(),
            outcomes,
            config.health.clone(),
            clock.clone(),
        ));
        let intake = WebhookIntake::new(config.secrets.clone(), clock.clone());

        Self {
            intake,
            processor,
            store,
            scheduler,
            health,
            circuits,
            clock,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Validates, normalizes, and processes one raw webhook delivery.
    ///
    /// Returns the normalized event alongside the processing result so the
    /// HTTP layer can echo the event id. Intake failures (malformed,
    /// signature, storage down, contention) surface as errors; everything
    /// after acceptance resolves to a [`ProcessingResult`].
    pub async fn ingest(
        &self,
        service: SourceService,
        delivery: RawDelivery<'_>,
    ) -> Result<(WebhookEvent, ProcessingResult)> {
        let event = self.intake.normalize(service, delivery)?;
        let result = self.processor.process(event.clone()).await?;
        Ok((event, result))
    }

    /// Starts the scheduler and dispatcher background tasks.
    pub async fn start(&self) {
        let (tx, mut rx) = mpsc::channel(Self::DISPATCH_BUFFER);

        let scheduler_task = {
            let scheduler = self.scheduler.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { scheduler.run(tx, shutdown).await })
        };

        let dispatcher_task = {
            let processor = self.processor.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        received = rx.recv() => match received {
                            Some(attempt) => processor.handle_due_attempt(attempt).await,
                            None => break,
                        },
                        () = shutdown.cancelled() => break,
                    }
                }
                info!("retry dispatcher stopped");
            })
        };

        let mut tasks = self.tasks.lock().await;
        tasks.push(scheduler_task);
        tasks.push(dispatcher_task);
        info!("integration engine started");
    }

    /// Signals shutdown and waits for background tasks to stop.
    pub async fn shutdown(&self, timeout: Duration) {
        info!("shutting down integration engine");
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        let join_all = async {
            for task in tasks {
                if let Err(err) = task.await {
                    warn!(error = %err, "engine task panicked during shutdown");
                }
            }
        };

        if tokio::time::timeout(timeout, join_all).await.is_err() {
            warn!(timeout_secs = timeout.as_secs(), "engine shutdown timed out");
        } else {
            info!("integration engine stopped");
        }
    }

    /// Pops and handles every currently-due retry attempt.
    ///
    /// Deterministic alternative to the background tasks, used by tests and
    /// ops tooling. Returns the number of attempts handled.
    pub async fn drain_due_retries(&self) -> usize {
        let due = self.scheduler.pop_due(now_utc(self.clock.as_ref())).await;
        let count = due.len();
        for attempt in due {
            self.processor.handle_due_attempt(attempt).await;
        }
        count
    }

    /// The idempotency store, for the read endpoints.
    pub fn store(&self) -> Arc<IdempotencyStore> {
        self.store.clone()
    }

    /// The health aggregator, for the health endpoint.
    pub fn health(&self) -> Arc<HealthAggregator> {
        self.health.clone()
    }

    /// The retry scheduler, for cancellation of superseded attempts.
    pub fn scheduler(&self) -> Arc<RetryScheduler> {
        self.scheduler.clone()
    }

    /// The circuit registry, for admin inspection.
    pub fn circuits(&self) -> Arc<CircuitRegistry> {
        self.circuits.clone()
    }
}
