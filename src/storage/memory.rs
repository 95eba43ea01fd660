//! In-memory outbox store for tests and local runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{
    settle_failure, stale_cutoff, NewOutboxEvent, OutboxError, OutboxEvent, OutboxStatus,
    OutboxStore, Result,
};

/// Mutex-guarded outbox. Claims are serialized by the lock, which gives the
/// same "one claimant per event" guarantee as a skip-locked claim.
#[derive(Default)]
pub struct MemoryOutboxStore {
    events: Mutex<Vec<OutboxEvent>>,
    unavailable: AtomicBool,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn events(&self) -> MutexGuard<'_, Vec<OutboxEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OutboxError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    /// Simulate a database outage: every operation fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Store a new `incomplete` event.
    pub fn enqueue(&self, event: NewOutboxEvent) -> Result<OutboxEvent> {
        self.check_available()?;
        let mut events = self.events();
        if events.iter().any(|e| e.id == event.id) {
            return Err(OutboxError::Conflict(event.id));
        }

        let now = Utc::now();
        let stored = OutboxEvent {
            id: event.id,
            created_at: now,
            updated_at: now,
            entity_id: event.entity_id,
            domain: event.domain,
            event_type: event.event_type,
            payload: event.payload,
            status: OutboxStatus::Incomplete,
            claim_id: None,
        };
        events.push(stored.clone());
        Ok(stored)
    }

    /// Snapshot of every stored event in insertion order.
    pub fn all(&self) -> Vec<OutboxEvent> {
        self.events().clone()
    }

    pub fn count_with_status(&self, status: OutboxStatus) -> usize {
        self.events().iter().filter(|e| e.status == status).count()
    }

    fn transition(&self, claimed: &OutboxEvent, to: OutboxStatus) -> Result<()> {
        self.check_available()?;
        let mut events = self.events();
        let Some(event) = events.iter_mut().find(|e| e.id == claimed.id) else {
            return Err(OutboxError::NotFound(claimed.id));
        };
        if event.status != OutboxStatus::Pending || event.claim_id != claimed.claim_id {
            return Err(settle_failure(claimed, Some(&*event)));
        }

        debug_assert!(event.status.can_transition_to(to));
        event.status = to;
        event.updated_at = Utc::now();
        if to == OutboxStatus::Incomplete {
            event.claim_id = None;
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn claim_next(&self) -> Result<Option<OutboxEvent>> {
        self.check_available()?;
        let mut events = self.events();
        let next = events
            .iter_mut()
            .filter(|e| e.status == OutboxStatus::Incomplete)
            .min_by_key(|e| (e.created_at, e.id));

        Ok(next.map(|event| {
            event.status = OutboxStatus::Pending;
            event.updated_at = Utc::now();
            event.claim_id = Some(Uuid::new_v4());
            event.clone()
        }))
    }

    async fn mark_completed(&self, claimed: &OutboxEvent) -> Result<()> {
        self.transition(claimed, OutboxStatus::Completed)
    }

    async fn mark_incomplete(&self, claimed: &OutboxEvent) -> Result<()> {
        self.transition(claimed, OutboxStatus::Incomplete)
    }

    async fn reset_stale(&self, older_than: Duration) -> Result<u64> {
        self.check_available()?;
        let cutoff = stale_cutoff(older_than);
        let now = Utc::now();
        let mut reset = 0;
        for event in self.events().iter_mut() {
            if event.status == OutboxStatus::Pending && event.updated_at <= cutoff {
                event.status = OutboxStatus::Incomplete;
                event.updated_at = now;
                event.claim_id = None;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>> {
        self.check_available()?;
        Ok(self.events().iter().find(|e| e.id == id).cloned())
    }
}
