//! PostgreSQL outbox store.
//!
//! Queries are built with sea-query and bound through sea-query-binder,
//! except the claim, which needs `FOR UPDATE SKIP LOCKED` inside a subquery
//! and is kept as plain SQL.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, PostgresQueryBuilder, Query};
use sea_query_binder::{SqlxBinder, SqlxValues};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    settle_failure, NewOutboxEvent, OutboxError, OutboxEvent, OutboxStatus, OutboxStore, Result,
};

mod schema;

use schema::{Outbox, ALL_COLUMNS, CLAIM_NEXT, CREATE_OUTBOX_TABLE, RESET_STALE};

/// Longest stale age passed to Postgres; larger values overflow `interval`.
const MAX_STALE_SECS: f64 = i32::MAX as f64;

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    entity_id: Uuid,
    domain: String,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    claim_id: Option<Uuid>,
}

impl TryFrom<OutboxRow> for OutboxEvent {
    type Error = OutboxError;

    fn try_from(row: OutboxRow) -> Result<Self> {
        Ok(OutboxEvent {
            id: row.id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            entity_id: row.entity_id,
            domain: row.domain,
            event_type: row.event_type,
            payload: row.payload,
            status: row.status.parse()?,
            claim_id: row.claim_id,
        })
    }
}

/// PostgreSQL implementation of [`OutboxStore`].
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox table and index if they do not exist.
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_OUTBOX_TABLE).execute(&self.pool).await?;
        info!("Outbox table initialized (PostgreSQL)");
        Ok(())
    }

    /// Insert `event` as `incomplete` inside the caller's transaction.
    ///
    /// The row becomes visible to the relay only if `tx` commits, which is
    /// what makes the domain write and the event atomic.
    pub async fn enqueue(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &NewOutboxEvent,
    ) -> Result<OutboxEvent> {
        let (sql, values) = Query::insert()
            .into_table(Outbox::Table)
            .columns([
                Outbox::Id,
                Outbox::EntityId,
                Outbox::Domain,
                Outbox::EventType,
                Outbox::Payload,
                Outbox::Status,
            ])
            .values_panic([
                event.id.into(),
                event.entity_id.into(),
                event.domain.clone().into(),
                event.event_type.clone().into(),
                event.payload.clone().into(),
                OutboxStatus::Incomplete.as_str().into(),
            ])
            .returning(Query::returning().columns(ALL_COLUMNS))
            .build_sqlx(PostgresQueryBuilder);

        let row = sqlx::query_as_with::<_, OutboxRow, _>(&sql, values)
            .fetch_one(&mut **tx)
            .await?;

        debug!(
            event_id = %event.id,
            domain = %event.domain,
            event_type = %event.event_type,
            "Event written to outbox"
        );
        row.try_into()
    }

    /// Move `claimed` to `to` if it is still pending under the same claim.
    async fn finish_pending(&self, claimed: &OutboxEvent, to: OutboxStatus) -> Result<()> {
        let (sql, values) = finish_query(claimed, to);

        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            let current = self.get(claimed.id).await?;
            return Err(settle_failure(claimed, current.as_ref()));
        }

        debug!(event_id = %claimed.id, status = %to, "Outbox event updated");
        Ok(())
    }
}

/// Guarded status update for a claimed event.
///
/// Matches only while the row is `pending` under `claimed.claim_id`.
/// Reverting to `incomplete` drops the claim.
fn finish_query(claimed: &OutboxEvent, to: OutboxStatus) -> (String, SqlxValues) {
    let mut update = Query::update();
    update
        .table(Outbox::Table)
        .value(Outbox::Status, to.as_str())
        .value(Outbox::UpdatedAt, Expr::current_timestamp());
    if to == OutboxStatus::Incomplete {
        update.value(Outbox::ClaimId, Option::<Uuid>::None);
    }
    update
        .and_where(Expr::col(Outbox::Id).eq(claimed.id))
        .and_where(Expr::col(Outbox::Status).eq(OutboxStatus::Pending.as_str()))
        .and_where(Expr::col(Outbox::ClaimId).eq(claimed.claim_id))
        .build_sqlx(PostgresQueryBuilder)
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn claim_next(&self) -> Result<Option<OutboxEvent>> {
        let row = sqlx::query_as::<_, OutboxRow>(CLAIM_NEXT)
            .bind(Uuid::new_v4())
            .fetch_optional(&self.pool)
            .await?;

        row.map(OutboxEvent::try_from).transpose()
    }

    async fn mark_completed(&self, claimed: &OutboxEvent) -> Result<()> {
        self.finish_pending(claimed, OutboxStatus::Completed).await
    }

    async fn mark_incomplete(&self, claimed: &OutboxEvent) -> Result<()> {
        self.finish_pending(claimed, OutboxStatus::Incomplete).await
    }

    async fn reset_stale(&self, older_than: Duration) -> Result<u64> {
        let result = sqlx::query(RESET_STALE)
            .bind(older_than.as_secs_f64().min(MAX_STALE_SECS))
            .execute(&self.pool)
            .await?;
        let reset = result.rows_affected();
        if reset > 0 {
            info!(reset, "Reset stale pending outbox events");
        }
        Ok(reset)
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>> {
        let (sql, values) = Query::select()
            .columns(ALL_COLUMNS)
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::Id).eq(id))
            .build_sqlx(PostgresQueryBuilder);

        let row = sqlx::query_as_with::<_, OutboxRow, _>(&sql, values)
            .fetch_optional(&self.pool)
            .await?;

        row.map(OutboxEvent::try_from).transpose()
    }
}
