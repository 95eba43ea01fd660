//! Outbox table definition.

use sea_query::Iden;

/// Outbox table schema.
#[derive(Iden, Clone, Copy)]
pub enum Outbox {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
    #[iden = "entity_id"]
    EntityId,
    #[iden = "domain"]
    Domain,
    #[iden = "event_type"]
    EventType,
    #[iden = "payload"]
    Payload,
    #[iden = "status"]
    Status,
    #[iden = "claim_id"]
    ClaimId,
}

/// Every column, in table order.
pub const ALL_COLUMNS: [Outbox; 9] = [
    Outbox::Id,
    Outbox::CreatedAt,
    Outbox::UpdatedAt,
    Outbox::EntityId,
    Outbox::Domain,
    Outbox::EventType,
    Outbox::Payload,
    Outbox::Status,
    Outbox::ClaimId,
];

/// SQL for creating the outbox table and its claim index.
pub const CREATE_OUTBOX_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS outbox (
    id UUID PRIMARY KEY,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    entity_id UUID NOT NULL,
    domain TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload JSONB NOT NULL,
    status TEXT NOT NULL DEFAULT 'incomplete'
        CHECK (status IN ('incomplete', 'pending', 'completed')),
    claim_id UUID
);

ALTER TABLE outbox ADD COLUMN IF NOT EXISTS claim_id UUID;

CREATE INDEX IF NOT EXISTS idx_outbox_status_created_at ON outbox(status, created_at);
"#;

/// Flip the oldest unlocked `incomplete` row to `pending` under claim `$1`
/// and return it.
///
/// Rows locked by a concurrent claimant are skipped rather than waited on,
/// so parallel relays never claim the same row.
pub const CLAIM_NEXT: &str = r#"
UPDATE outbox
SET status = 'pending', updated_at = NOW(), claim_id = $1
WHERE id = (
    SELECT id FROM outbox
    WHERE status = 'incomplete'
    ORDER BY created_at, id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
AND status = 'incomplete'
RETURNING id, created_at, updated_at, entity_id, domain, event_type, payload, status, claim_id
"#;

/// Return `pending` rows untouched for `$1` seconds to `incomplete`.
///
/// The cutoff is taken from the database clock, the same clock that stamped
/// `updated_at`.
pub const RESET_STALE: &str = r#"
UPDATE outbox
SET status = 'incomplete', updated_at = NOW(), claim_id = NULL
WHERE status = 'pending'
AND updated_at <= NOW() - make_interval(secs => $1)
"#;
