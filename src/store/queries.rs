//! SQL query constants
//!
//! Every statement the PostgreSQL stores run.

/// Last known snapshot per entity
pub const CREATE_SNAPSHOTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS entity_snapshots (
        entity_id      TEXT PRIMARY KEY,
        entity_type    TEXT NOT NULL,
        snapshot       JSONB NOT NULL,
        last_sequence  BIGINT NOT NULL DEFAULT 0,
        observed_at    TIMESTAMPTZ NOT NULL
    )
"#;

/// Append-only change history, one row per (entity, sequence key)
pub const CREATE_EVENTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS change_events (
        entity_id      TEXT NOT NULL,
        sequence_key   BIGINT NOT NULL,
        entity_type    TEXT NOT NULL,
        category       TEXT NOT NULL,
        deltas         JSONB NOT NULL,
        observed_at    TIMESTAMPTZ NOT NULL,
        recorded_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (entity_id, sequence_key)
    )
"#;

pub const CREATE_EVENTS_RECENT_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_change_events_type_observed
        ON change_events (entity_type, observed_at)
"#;

pub const GET_SNAPSHOT: &str = r#"
    SELECT snapshot, last_sequence, observed_at
    FROM entity_snapshots
    WHERE entity_id = $1
"#;

pub const UPSERT_SNAPSHOT: &str = r#"
    INSERT INTO entity_snapshots (entity_id, entity_type, snapshot, last_sequence, observed_at)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (entity_id) DO UPDATE
        SET entity_type   = EXCLUDED.entity_type,
            snapshot      = EXCLUDED.snapshot,
            last_sequence = GREATEST(entity_snapshots.last_sequence, EXCLUDED.last_sequence),
            observed_at   = EXCLUDED.observed_at
"#;

/// Idempotent insert: an existing (entity, sequence key) row is left alone
pub const INSERT_EVENT: &str = r#"
    INSERT INTO change_events (entity_id, sequence_key, entity_type, category, deltas, observed_at)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (entity_id, sequence_key) DO NOTHING
"#;

pub const GET_EVENT_CONTENT: &str = r#"
    SELECT category, deltas
    FROM change_events
    WHERE entity_id = $1 AND sequence_key = $2
"#;

pub const GET_HISTORY: &str = r#"
    SELECT entity_type, entity_id, sequence_key, category, deltas, observed_at
    FROM change_events
    WHERE entity_id = $1
    ORDER BY sequence_key DESC
    LIMIT $2
"#;

pub const GET_RECENT: &str = r#"
    SELECT entity_type, entity_id, sequence_key, category, deltas, observed_at
    FROM change_events
    WHERE entity_type = $1 AND observed_at >= $2
    ORDER BY observed_at, entity_id, sequence_key
"#;
