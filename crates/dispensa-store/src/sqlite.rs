//! SQLite-based store implementation

use chrono::{DateTime, Local};
use dispensa_util::{OwnerId, SessionId};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::{AuditEvent, SessionRecord, Store, StoreError, StoreResult};

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection lock poisoned".into()))
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- Audit log (append-only)
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_json TEXT NOT NULL
            );

            -- Session records, full record as JSON plus queryable columns
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                record_json TEXT NOT NULL
            );

            -- Recovery ledger
            CREATE TABLE IF NOT EXISTS recovery_ledger (
                owner_id TEXT PRIMARY KEY,
                tokens_consumed INTEGER NOT NULL DEFAULT 0
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            CREATE INDEX IF NOT EXISTS idx_sessions_owner ON sessions(owner_id);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }
}

impl Store for SqliteStore {
    fn append_audit(&self, mut event: AuditEvent) -> StoreResult<()> {
        let conn = self.conn()?;
        let event_json = serde_json::to_string(&event.event)?;

        conn.execute(
            "INSERT INTO audit_log (timestamp, event_json) VALUES (?, ?)",
            params![event.timestamp.to_rfc3339(), event_json],
        )?;

        event.id = conn.last_insert_rowid();
        debug!(event_id = event.id, "Audit event appended");

        Ok(())
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_json FROM audit_log ORDER BY id DESC LIMIT ?",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let timestamp_str: String = row.get(1)?;
            let event_json: String = row.get(2)?;
            Ok((id, timestamp_str, event_json))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, timestamp_str, event_json) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
                .map(|dt| dt.with_timezone(&Local))
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let event: crate::AuditEventType = serde_json::from_str(&event_json)?;

            events.push(AuditEvent {
                id,
                timestamp,
                event,
            });
        }

        Ok(events)
    }

    fn save_session(&self, record: &SessionRecord) -> StoreResult<bool> {
        let conn = self.conn()?;
        let record_json = serde_json::to_string(record)?;

        let changed = conn.execute(
            r#"
            INSERT INTO sessions (session_id, owner_id, status, version, record_json)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(session_id)
            DO UPDATE SET
                owner_id = excluded.owner_id,
                status = excluded.status,
                version = excluded.version,
                record_json = excluded.record_json
            WHERE excluded.version > sessions.version
            "#,
            params![
                record.session_id.to_string(),
                record.owner_id.as_str(),
                record.status.as_str(),
                record.version as i64,
                record_json,
            ],
        )?;

        if changed == 0 {
            debug!(
                session_id = %record.session_id,
                version = record.version,
                "Stale session record ignored"
            );
        }

        Ok(changed > 0)
    }

    fn load_session(&self, session_id: &SessionId) -> StoreResult<Option<SessionRecord>> {
        let conn = self.conn()?;

        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM sessions WHERE session_id = ?",
                [session_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    fn load_sessions(&self) -> StoreResult<Vec<SessionRecord>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare("SELECT record_json FROM sessions ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            let json = row?;
            match serde_json::from_str::<SessionRecord>(&json) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "Skipping unreadable session record"),
            }
        }

        Ok(records)
    }

    fn get_tokens_consumed(&self, owner_id: &OwnerId) -> StoreResult<u32> {
        let conn = self.conn()?;

        let consumed: Option<i64> = conn
            .query_row(
                "SELECT tokens_consumed FROM recovery_ledger WHERE owner_id = ?",
                [owner_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(consumed.unwrap_or(0) as u32)
    }

    fn set_tokens_consumed(&self, owner_id: &OwnerId, consumed: u32) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO recovery_ledger (owner_id, tokens_consumed)
            VALUES (?, ?)
            ON CONFLICT(owner_id)
            DO UPDATE SET tokens_consumed = MAX(tokens_consumed, excluded.tokens_consumed)
            "#,
            params![owner_id.as_str(), consumed as i64],
        )?;

        debug!(owner_id = %owner_id, consumed, "Ledger updated");
        Ok(())
    }

    fn load_ledger(&self) -> StoreResult<Vec<(OwnerId, u32)>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare("SELECT owner_id, tokens_consumed FROM recovery_ledger")?;
        let rows = stmt.query_map([], |row| {
            let owner: String = row.get(0)?;
            let consumed: i64 = row.get(1)?;
            Ok((OwnerId::new(owner), consumed as u32))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}
