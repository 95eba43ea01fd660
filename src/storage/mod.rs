//! Transactional outbox storage.
//!
//! An outbox row is written in the same database transaction as the domain
//! change it describes. The relay later claims rows one at a time, publishes
//! them and records the outcome:
//!
//! ```text
//! incomplete --claim--> pending --published--> completed
//!                          \--publish failed--> incomplete
//! ```
//!
//! `incomplete` means "retry eligible"; there is no terminal failure state.
//!
//! Every claim stamps the row with a fresh `claim_id`. Completing or
//! reverting an event requires the claim it was handed, so a relay whose
//! claim was reset as stale and re-claimed elsewhere cannot settle the new
//! holder's claim.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryOutboxStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresOutboxStore;

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Event does not exist or is not in the state the operation requires.
    #[error("Outbox event not found or not pending: {0}")]
    NotFound(Uuid),

    #[error("Outbox event already exists: {0}")]
    Conflict(Uuid),

    /// The claim was reset as stale and the event now belongs to another
    /// claimant (or to nobody).
    #[error("Outbox claim no longer held: {0}")]
    ClaimLost(Uuid),

    #[error("Invalid outbox status: {0}")]
    InvalidStatus(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Outbox store unavailable: {0}")]
    Unavailable(String),
}

/// Delivery state of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    /// Written, not yet published. Also the retry state.
    Incomplete,
    /// Claimed by a relay worker.
    Pending,
    /// Published and confirmed.
    Completed,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Incomplete => "incomplete",
            OutboxStatus::Pending => "pending",
            OutboxStatus::Completed => "completed",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: OutboxStatus) -> bool {
        matches!(
            (self, next),
            (OutboxStatus::Incomplete, OutboxStatus::Pending)
                | (OutboxStatus::Pending, OutboxStatus::Completed)
                | (OutboxStatus::Pending, OutboxStatus::Incomplete)
        )
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "incomplete" => Ok(OutboxStatus::Incomplete),
            "pending" => Ok(OutboxStatus::Pending),
            "completed" => Ok(OutboxStatus::Completed),
            other => Err(OutboxError::InvalidStatus(other.to_string())),
        }
    }
}

/// A stored outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// The domain entity the event describes.
    pub entity_id: Uuid,
    /// Entity kind, e.g. `anime`. First word of the routing key.
    pub domain: String,
    /// What happened, e.g. `create`. Second word of the routing key.
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    /// Token of the current claim. Set while `pending`, kept on completion.
    pub claim_id: Option<Uuid>,
}

impl OutboxEvent {
    /// Routing key the relay publishes under: `{domain}.{event_type}`.
    pub fn routing_key(&self) -> String {
        format!("{}.{}", self.domain, self.event_type)
    }

    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            id: self.id,
            entity_id: self.entity_id,
            domain: self.domain.clone(),
            event_type: self.event_type.clone(),
            occurred_at: self.created_at,
            payload: self.payload.clone(),
        }
    }
}

/// An outbox row about to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub domain: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl NewOutboxEvent {
    /// Build an event, serializing `payload` to JSON.
    pub fn new<T: Serialize + ?Sized>(
        domain: impl Into<String>,
        event_type: impl Into<String>,
        entity_id: Uuid,
        payload: &T,
    ) -> Result<Self> {
        Ok(Self::from_value(
            domain,
            event_type,
            entity_id,
            serde_json::to_value(payload)?,
        ))
    }

    pub fn from_value(
        domain: impl Into<String>,
        event_type: impl Into<String>,
        entity_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id,
            domain: domain.into(),
            event_type: event_type.into(),
            payload,
        }
    }
}

/// JSON document published for one outbox event.
///
/// Consumers should ignore fields they do not know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub domain: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Relay-side view of the outbox.
///
/// Writing events is not part of this trait: each backend enqueues inside
/// its own transaction type.
///
/// Implementations:
/// - `PostgresOutboxStore`: `FOR UPDATE SKIP LOCKED` claims
/// - `MemoryOutboxStore`: mutex-guarded, for tests and local runs
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim the oldest `incomplete` event and mark it `pending` under a new
    /// `claim_id`.
    ///
    /// Returns `None` when nothing is claimable. Concurrent callers never
    /// receive the same event.
    async fn claim_next(&self) -> Result<Option<OutboxEvent>>;

    /// `pending` -> `completed` for the event as returned by `claim_next`.
    ///
    /// `ClaimLost` if the event is held under another claim, `NotFound` if
    /// it is missing or not pending.
    async fn mark_completed(&self, claimed: &OutboxEvent) -> Result<()>;

    /// `pending` -> `incomplete` so the event is retried. Same claim check
    /// as [`mark_completed`](Self::mark_completed).
    async fn mark_incomplete(&self, claimed: &OutboxEvent) -> Result<()>;

    /// Return `pending` events untouched for at least `older_than` to
    /// `incomplete`, dropping their claims. Returns how many were reset.
    ///
    /// Age is measured on the store's own clock.
    async fn reset_stale(&self, older_than: Duration) -> Result<u64>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>>;
}

/// Settle check shared by the stores: which error a failed guarded update
/// means, given the row as it is now.
pub(crate) fn settle_failure(claimed: &OutboxEvent, current: Option<&OutboxEvent>) -> OutboxError {
    match current {
        Some(row) if row.claim_id != claimed.claim_id => OutboxError::ClaimLost(claimed.id),
        _ => OutboxError::NotFound(claimed.id),
    }
}

/// Oldest `updated_at` a pending event may have before it counts as stale.
pub(crate) fn stale_cutoff(older_than: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(older_than)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
