//! SQL schema for the health-check SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Events are append-only. Sync state lives in event_syncs.
CREATE TABLE IF NOT EXISTS events (
    event_id          TEXT PRIMARY KEY,
    kind              TEXT NOT NULL,   -- discriminant of EventValue variant
    deduplication_key TEXT NOT NULL,
    contact_key       TEXT NOT NULL,   -- E.164
    source            TEXT NOT NULL,
    value_json        TEXT NOT NULL,   -- JSON payload (inner data only)
    extension_json    TEXT NOT NULL DEFAULT '{}',
    timestamp         TEXT NOT NULL,   -- RFC 3339 UTC, fixed micros width
    created_at        TEXT NOT NULL,   -- strictly increasing in insert order
    created_by        TEXT,
    UNIQUE (kind, deduplication_key)
);

-- Absence of a row means the event is unsynced for that destination.
CREATE TABLE IF NOT EXISTS event_syncs (
    event_id    TEXT NOT NULL REFERENCES events(event_id),
    destination TEXT NOT NULL,
    synced_at   TEXT NOT NULL,
    PRIMARY KEY (event_id, destination)
);

CREATE TABLE IF NOT EXISTS profiles (
    contact_key      TEXT PRIMARY KEY,
    fields_json      TEXT NOT NULL,   -- first-class fields
    extension_json   TEXT NOT NULL DEFAULT '{}',
    -- promoted copies of fields_json entries, for arm counting
    research_consent INTEGER,
    activation       TEXT,
    group_arm        TEXT,
    version          INTEGER NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_locks (
    name       TEXT PRIMARY KEY,
    holder     TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_marks (
    mark_key   TEXT PRIMARY KEY,
    high_water TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS events_contact_idx   ON events(contact_key, timestamp);
CREATE INDEX IF NOT EXISTS events_pending_idx   ON events(kind, created_at, event_id);
CREATE INDEX IF NOT EXISTS events_created_idx   ON events(created_at);
CREATE INDEX IF NOT EXISTS profiles_arm_idx     ON profiles(group_arm, activation);
CREATE INDEX IF NOT EXISTS profiles_updated_idx ON profiles(updated_at, contact_key);

PRAGMA user_version = 1;
";
