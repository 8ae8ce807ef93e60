//! SQLite DDL for the alarm store.
//!
//! All `CREATE TABLE` / `CREATE INDEX` statements live here so they are
//! reviewable and testable in isolation.

use rusqlite::Connection;

/// Current on-disk schema version.
pub(crate) const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Complete DDL for the alarm database.
///
/// Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent.
pub(crate) const SCHEMA_SQL: &str = r#"
-- WAL keeps readers off the writer's back; FULL makes each commit durable.
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;

CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- One row per slot; mirrors AlarmRecord fields.
CREATE TABLE IF NOT EXISTS alarms (
    slot_id            TEXT PRIMARY KEY,
    title              TEXT NOT NULL,
    fire_at            INTEGER NOT NULL,
    state              TEXT NOT NULL,     -- snake_case AlarmState variant
    armed_timer_token  TEXT,              -- NULL unless state = 'scheduled'
    created_at         INTEGER NOT NULL,
    last_transition_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_alarms_state   ON alarms(state);
CREATE INDEX IF NOT EXISTS idx_alarms_fire_at ON alarms(fire_at);

-- Transition trail; outlives removed alarm rows.
CREATE TABLE IF NOT EXISTS alarm_audit (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    slot_id    TEXT NOT NULL,
    from_state TEXT,                      -- NULL for the initial write
    to_state   TEXT NOT NULL,
    at         INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_slot ON alarm_audit(slot_id);
"#;

/// Apply the full schema to an open connection.
///
/// Safe to call multiple times. Seeds the schema version on a fresh
/// database without overwriting an existing one.
pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        rusqlite::params![CURRENT_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Read the schema version, `None` when unseeded.
pub(crate) fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<u32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_meta WHERE key = 'schema_version'")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().ok())
        }
        None => Ok(None),
    }
}
