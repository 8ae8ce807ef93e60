//! Durable alarm store.
//!
//! [`AlarmStore`] is the persistence seam used by every other component.
//! [`SqliteAlarmStore`] backs it with a single SQLite database file at
//! `{data_dir}/alarms.db`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use super::record::{AlarmRecord, AlarmState, TimerToken};
use super::schema::{apply_schema, read_schema_version};
use crate::error::{AlarmError, Result};

/// Database filename within the data directory.
pub const DB_FILENAME: &str = "alarms.db";

/// One row of the transition trail.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AlarmAuditEntry {
    pub slot_id: String,
    /// `None` for the write that created or overwrote the record.
    pub from: Option<AlarmState>,
    pub to: AlarmState,
    pub at: i64,
}

/// Crash-safe key-value record of alarms, keyed by slot id.
///
/// Every write is durable before the call returns, and a reader never
/// observes a partially written record. I/O faults surface as
/// [`AlarmError::StorageUnavailable`], never as `NotFound`.
pub trait AlarmStore: Send + Sync {
    /// Full-overwrite upsert.
    fn put(&self, record: &AlarmRecord) -> Result<()>;

    fn get(&self, slot_id: &str) -> Result<AlarmRecord>;

    fn remove(&self, slot_id: &str) -> Result<()>;

    /// Snapshot of every record.
    fn list_all(&self) -> Result<Vec<AlarmRecord>>;

    /// Compare-and-swap state change: succeeds only when the stored state is
    /// exactly `expected`. Returns the updated record.
    fn transition(
        &self,
        slot_id: &str,
        expected: AlarmState,
        next: AlarmState,
        at: i64,
    ) -> Result<AlarmRecord>;

    /// Record the armed timer for a `Scheduled` record.
    fn set_timer_token(&self, slot_id: &str, token: &TimerToken) -> Result<()>;

    /// Transition trail for one slot, oldest first.
    fn history(&self, slot_id: &str) -> Result<Vec<AlarmAuditEntry>>;
}

/// SQLite-backed alarm store.
///
/// Thread-safe via an internal `Mutex<Connection>`. State changes run in
/// `IMMEDIATE` transactions so a second process sharing the file cannot
/// interleave between the state check and the update.
pub struct SqliteAlarmStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl SqliteAlarmStore {
    /// Open (or create) `{data_dir}/alarms.db`.
    ///
    /// `busy_timeout` bounds how long any statement waits on a locked
    /// database before failing with `StorageUnavailable`.
    pub fn open(data_dir: &Path, busy_timeout: Duration) -> Result<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| {
            AlarmError::StorageUnavailable(format!(
                "cannot create data dir {}: {e}",
                data_dir.display()
            ))
        })?;
        let db_path = data_dir.join(DB_FILENAME);
        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(busy_timeout)?;
        apply_schema(&conn)?;
        tracing::debug!(path = %db_path.display(), "opened alarm store");
        Ok(Self {
            path: Some(db_path),
            conn: Mutex::new(conn),
        })
    }

    /// Non-durable store, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            path: None,
            conn: Mutex::new(conn),
        })
    }

    /// Database file path, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn schema_version(&self) -> Result<Option<u32>> {
        let conn = self.lock()?;
        Ok(read_schema_version(&conn)?)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| AlarmError::StorageUnavailable(format!("lock poisoned: {e}")))
    }
}

const SELECT_COLUMNS: &str = "SELECT slot_id, title, fire_at, state, armed_timer_token, \
     created_at, last_transition_at FROM alarms";

impl AlarmStore for SqliteAlarmStore {
    fn put(&self, record: &AlarmRecord) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO alarms \
             (slot_id, title, fire_at, state, armed_timer_token, created_at, last_transition_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(slot_id) DO UPDATE SET \
             title = excluded.title, fire_at = excluded.fire_at, state = excluded.state, \
             armed_timer_token = excluded.armed_timer_token, created_at = excluded.created_at, \
             last_transition_at = excluded.last_transition_at",
            params![
                record.slot_id,
                record.title,
                record.fire_at,
                record.state.as_str(),
                record.armed_timer_token.as_ref().map(TimerToken::as_str),
                record.created_at,
                record.last_transition_at,
            ],
        )?;
        append_audit(&tx, &record.slot_id, None, record.state, record.last_transition_at)?;

        tx.commit()?;
        Ok(())
    }

    fn get(&self, slot_id: &str) -> Result<AlarmRecord> {
        let conn = self.lock()?;
        select_one(&conn, slot_id)?.ok_or_else(|| AlarmError::NotFound(slot_id.to_owned()))
    }

    fn remove(&self, slot_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM alarms WHERE slot_id = ?1", params![slot_id])?;
        if rows == 0 {
            return Err(AlarmError::NotFound(slot_id.to_owned()));
        }
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<AlarmRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY fire_at, slot_id"))?;
        let rows = stmt.query_map([], row_to_record)?;

        let mut records = Vec::new();
        for r in rows {
            records.push(r?);
        }
        Ok(records)
    }

    fn transition(
        &self,
        slot_id: &str,
        expected: AlarmState,
        next: AlarmState,
        at: i64,
    ) -> Result<AlarmRecord> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut record =
            select_one(&tx, slot_id)?.ok_or_else(|| AlarmError::NotFound(slot_id.to_owned()))?;
        if record.state != expected {
            return Err(AlarmError::InvalidStateTransition {
                slot_id: slot_id.to_owned(),
                from: record.state,
                to: next,
            });
        }
        let from = record.state;
        record.transition(next, at)?;

        tx.execute(
            "UPDATE alarms SET state = ?1, armed_timer_token = ?2, last_transition_at = ?3 \
             WHERE slot_id = ?4 AND state = ?5",
            params![
                record.state.as_str(),
                record.armed_timer_token.as_ref().map(TimerToken::as_str),
                record.last_transition_at,
                slot_id,
                from.as_str(),
            ],
        )?;
        append_audit(&tx, slot_id, Some(from), next, at)?;

        tx.commit()?;
        Ok(record)
    }

    fn set_timer_token(&self, slot_id: &str, token: &TimerToken) -> Result<()> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE alarms SET armed_timer_token = ?1 WHERE slot_id = ?2 AND state = 'scheduled'",
            params![token.as_str(), slot_id],
        )?;
        if rows == 1 {
            return Ok(());
        }
        match select_one(&conn, slot_id)? {
            None => Err(AlarmError::NotFound(slot_id.to_owned())),
            Some(record) => Err(AlarmError::InvalidStateTransition {
                slot_id: slot_id.to_owned(),
                from: record.state,
                to: AlarmState::Scheduled,
            }),
        }
    }

    fn history(&self, slot_id: &str) -> Result<Vec<AlarmAuditEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT slot_id, from_state, to_state, at FROM alarm_audit \
             WHERE slot_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![slot_id], row_to_audit)?;

        let mut entries = Vec::new();
        for r in rows {
            entries.push(r?);
        }
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn select_one(conn: &Connection, slot_id: &str) -> rusqlite::Result<Option<AlarmRecord>> {
    conn.query_row(
        &format!("{SELECT_COLUMNS} WHERE slot_id = ?1"),
        params![slot_id],
        row_to_record,
    )
    .optional()
}

fn append_audit(
    conn: &Connection,
    slot_id: &str,
    from: Option<AlarmState>,
    to: AlarmState,
    at: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO alarm_audit (slot_id, from_state, to_state, at) VALUES (?1, ?2, ?3, ?4)",
        params![slot_id, from.map(AlarmState::as_str), to.as_str(), at],
    )?;
    Ok(())
}

fn parse_state(idx: usize, raw: &str) -> rusqlite::Result<AlarmState> {
    AlarmState::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown alarm state '{raw}'").into(),
        )
    })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlarmRecord> {
    let state_str: String = row.get(3)?;
    let token: Option<String> = row.get(4)?;
    Ok(AlarmRecord {
        slot_id: row.get(0)?,
        title: row.get(1)?,
        fire_at: row.get(2)?,
        state: parse_state(3, &state_str)?,
        armed_timer_token: token.map(TimerToken::new),
        created_at: row.get(5)?,
        last_transition_at: row.get(6)?,
    })
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlarmAuditEntry> {
    let from: Option<String> = row.get(1)?;
    let to: String = row.get(2)?;
    Ok(AlarmAuditEntry {
        slot_id: row.get(0)?,
        from: from.as_deref().map(|s| parse_state(1, s)).transpose()?,
        to: parse_state(2, &to)?,
        at: row.get(3)?,
    })
}
