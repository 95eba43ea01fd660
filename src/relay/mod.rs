//! Outbox relay.
//!
//! Polls the outbox on a fixed interval, publishes each claimed event to a
//! topic exchange and records the outcome:
//!
//! ```text
//! Idle -> Polling -> Publishing -> Completing -> Idle
//!                              \-> Reverting  -> Idle
//! ```
//!
//! A failed publish returns the event to `incomplete`, so a later tick
//! retries it. If the process dies between claim and completion, the event
//! stays `pending` until `reset_stale` (enabled with `stale_after`) makes it
//! claimable again. Delivery is therefore at-least-once.
//!
//! `stale_after` must outlast a whole cycle, see
//! [`RelayConfig::min_stale_after`]. If a cycle overruns it anyway, the
//! claim is fenced: the slow relay gets [`CycleOutcome::ClaimLost`] and
//! leaves the event to its new holder.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::bus::topology::{ExchangeSpec, TopologyManager};
use crate::bus::{publish_json, BusError, Publisher};
use crate::storage::{OutboxError, OutboxEvent, OutboxStore};

/// Default exchange outbox events are published to.
pub const DEFAULT_EXCHANGE: &str = "outpost.events";

/// Relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Exchange declared at start and published to.
    pub exchange: ExchangeSpec,
    /// Time between ticks.
    pub interval: Duration,
    /// Maximum claim-publish cycles per tick.
    pub batch_size: usize,
    /// Reset `pending` events older than this at the start of every tick.
    pub stale_after: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            exchange: ExchangeSpec::topic(DEFAULT_EXCHANGE),
            interval: Duration::from_secs(5),
            batch_size: 1,
            stale_after: None,
        }
    }
}

impl RelayConfig {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: ExchangeSpec::topic(exchange),
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    /// Shortest safe `stale_after`: one tick interval plus the longest a
    /// publish may take, including its retries.
    pub fn min_stale_after(&self, publish_budget: Duration) -> Duration {
        self.interval.saturating_add(publish_budget)
    }
}

/// What the relay is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Polling,
    Publishing,
    Completing,
    Reverting,
}

/// Result of one claim-publish cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was claimable.
    Idle,
    /// Published and marked completed.
    Published(Uuid),
    /// Publish failed; returned to incomplete for retry.
    Reverted(Uuid),
    /// The claim was reset as stale before it could be settled.
    ClaimLost(Uuid),
}

/// Moves outbox events to the broker.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn Publisher>,
    topology: Arc<dyn TopologyManager>,
    config: RelayConfig,
    state: watch::Sender<RelayState>,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn Publisher>,
        topology: Arc<dyn TopologyManager>,
        config: RelayConfig,
    ) -> Self {
        let (state, _) = watch::channel(RelayState::Idle);
        Self {
            store,
            publisher,
            topology,
            config,
            state,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    fn set_state(&self, state: RelayState) {
        self.state.send_replace(state);
    }

    /// Claim one event, publish it and record the outcome.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, OutboxError> {
        let outcome = self.cycle().await;
        self.set_state(RelayState::Idle);
        outcome
    }

    async fn cycle(&self) -> Result<CycleOutcome, OutboxError> {
        self.set_state(RelayState::Polling);
        let Some(event) = self.store.claim_next().await? else {
            return Ok(CycleOutcome::Idle);
        };

        self.set_state(RelayState::Publishing);
        let settled = match self.publish(&event).await {
            Ok(()) => {
                self.set_state(RelayState::Completing);
                self.store
                    .mark_completed(&event)
                    .await
                    .map(|()| CycleOutcome::Published(event.id))
            }
            Err(e) => {
                warn!(
                    event_id = %event.id,
                    routing_key = %event.routing_key(),
                    error = %e,
                    "Publish failed, event returned for retry"
                );
                self.set_state(RelayState::Reverting);
                self.store
                    .mark_incomplete(&event)
                    .await
                    .map(|()| CycleOutcome::Reverted(event.id))
            }
        };

        match settled {
            Ok(outcome) => {
                if let CycleOutcome::Published(id) = outcome {
                    info!(event_id = %id, routing_key = %event.routing_key(), "Relayed outbox event");
                }
                Ok(outcome)
            }
            Err(OutboxError::ClaimLost(id)) => {
                warn!(
                    event_id = %id,
                    "Claim reset as stale before it was settled, leaving event to its new holder"
                );
                Ok(CycleOutcome::ClaimLost(id))
            }
            Err(e) => Err(e),
        }
    }

    async fn publish(&self, event: &OutboxEvent) -> Result<(), BusError> {
        publish_json(
            self.publisher.as_ref(),
            &self.config.exchange.name,
            &event.routing_key(),
            &event.envelope(),
        )
        .await
    }

    /// One timer tick: optional stale reset, then up to `batch_size` cycles.
    ///
    /// Stops early when nothing is claimable, when a publish fails (the
    /// broker is likely down) or when the store errors. Never fails; errors
    /// are logged. Returns the outcome of every non-idle cycle.
    pub async fn tick(&self) -> Vec<CycleOutcome> {
        if let Some(stale_after) = self.config.stale_after {
            match self.store.reset_stale(stale_after).await {
                Ok(0) => {}
                Ok(reset) => warn!(reset, "Reset stale pending outbox events"),
                Err(e) => error!(error = %e, "Failed to reset stale outbox events"),
            }
        }

        let mut outcomes = Vec::new();
        for _ in 0..self.config.batch_size.max(1) {
            match self.run_cycle().instrument(info_span!("relay.cycle")).await {
                Ok(CycleOutcome::Idle) => {
                    debug!("No outbox event available");
                    break;
                }
                Ok(outcome @ (CycleOutcome::Published(_) | CycleOutcome::ClaimLost(_))) => {
                    outcomes.push(outcome)
                }
                Ok(outcome @ CycleOutcome::Reverted(_)) => {
                    outcomes.push(outcome);
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Relay cycle failed");
                    break;
                }
            }
        }
        outcomes
    }

    /// Declare the exchange, then run ticks on a background task.
    ///
    /// A declaration failure is returned and nothing is spawned.
    pub async fn start(self) -> Result<RelayHandle, BusError> {
        self.topology.declare_exchange(&self.config.exchange).await?;

        info!(
            exchange = %self.config.exchange.name,
            interval_ms = %self.config.interval.as_millis(),
            batch_size = self.config.batch_size,
            stale_after_secs = ?self.config.stale_after.map(|d| d.as_secs()),
            "Outbox relay started"
        );

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let state = self.state.subscribe();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => {
                        info!("Outbox relay stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
        });

        Ok(RelayHandle {
            cancel: cancel_tx,
            state,
            task,
        })
    }
}

/// Handle to a running relay.
///
/// Dropping the handle stops the relay.
pub struct RelayHandle {
    cancel: watch::Sender<bool>,
    state: watch::Receiver<RelayState>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Signal the relay to stop. An in-flight tick finishes first.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the relay task to exit.
    pub async fn join(self) {
        let RelayHandle { cancel, task, .. } = self;
        if let Err(e) = task.await {
            error!(error = %e, "Relay task failed");
        }
        drop(cancel);
    }

    /// Stop and wait for the in-flight tick to finish.
    pub async fn shutdown(self) {
        self.stop();
        self.join().await;
    }
}
