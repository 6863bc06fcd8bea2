//! Incident store: SQLite schema and queries for incidents and their collections.

use breakbot_core::error::{BreakbotError, Result};
use breakbot_core::types::{Blocker, Incident, LogEntry, LogType, UserCacheEntry};
use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Result of adding a value to a deduplicated collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Duplicate,
}

/// Result of removing a value from a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
}

/// The two value-deduplicated collections share one code path.
#[derive(Debug, Clone, Copy)]
enum ValueSet {
    Affected,
    Components,
}

impl ValueSet {
    fn table(self) -> &'static str {
        match self {
            ValueSet::Affected => "affected",
            ValueSet::Components => "components",
        }
    }
}

/// Durable storage for incidents.
pub struct IncidentStore {
    conn: Mutex<Connection>,
}

/// Shared SELECT column list for incident queries.
const INCIDENT_SELECT: &str = "SELECT id, chat_room, tracker_key, priority, title, summary, \
    point, comms, triage, eng_lead, assigned, \
    genesis_at, detected_at, acknowledged_at, mitigated_at, resolved_at, ready_for_review_at, \
    completed_at, archived_at, canceled_at, created_by, created_at, updated_at FROM incidents";

const LOG_SELECT: &str =
    "SELECT l.id, l.incident_id, l.kind, l.text, l.context_url, l.created_by, l.created_at FROM logs l";

/// Timestamps are stored as fixed-width RFC 3339 so string order is time order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc))
}

fn ts_col(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn opt_ts_col(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| {
        parse_ts(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

fn row_to_incident(row: &Row) -> rusqlite::Result<Incident> {
    Ok(Incident {
        id: row.get(0)?,
        chat_room: row.get(1)?,
        tracker_key: row.get(2)?,
        priority: row.get(3)?,
        title: row.get(4)?,
        summary: row.get(5)?,
        point: row.get(6)?,
        comms: row.get(7)?,
        triage: row.get(8)?,
        eng_lead: row.get(9)?,
        assigned: row.get(10)?,
        genesis_at: opt_ts_col(row, 11)?,
        detected_at: opt_ts_col(row, 12)?,
        acknowledged_at: opt_ts_col(row, 13)?,
        mitigated_at: opt_ts_col(row, 14)?,
        resolved_at: opt_ts_col(row, 15)?,
        ready_for_review_at: opt_ts_col(row, 16)?,
        completed_at: opt_ts_col(row, 17)?,
        archived_at: opt_ts_col(row, 18)?,
        canceled_at: opt_ts_col(row, 19)?,
        created_by: row.get(20)?,
        created_at: ts_col(row, 21)?,
        updated_at: ts_col(row, 22)?,
        affected: Vec::new(),
        components: Vec::new(),
        blockers: Vec::new(),
        logs: Vec::new(),
    })
}

fn row_to_log(row: &Row) -> rusqlite::Result<LogEntry> {
    let kind: String = row.get(2)?;
    let kind = kind.parse::<LogType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(LogEntry {
        id: row.get(0)?,
        incident_id: row.get(1)?,
        kind,
        text: row.get(3)?,
        context_url: row.get(4)?,
        created_by: row.get(5)?,
        created_at: ts_col(row, 6)?,
    })
}

fn row_to_blocker(row: &Row) -> rusqlite::Result<Blocker> {
    Ok(Blocker {
        id: row.get(0)?,
        incident_id: row.get(1)?,
        whomst: row.get(2)?,
        reason: row.get(3)?,
        created_at: ts_col(row, 4)?,
        unblocked_at: opt_ts_col(row, 5)?,
    })
}

fn storage(ctx: &'static str) -> impl Fn(rusqlite::Error) -> BreakbotError {
    move |e| BreakbotError::Storage(format!("{ctx}: {e}"))
}

impl IncidentStore {
    /// Open or create the incident database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(storage("DB open"))?;
        // WAL lets the chat handlers and engines read while a write is in flight.
        conn.execute_batch("PRAGMA journal_mode = WAL;").ok();
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage("DB open"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(storage("Pragma"))?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| BreakbotError::Storage(format!("Lock: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS incidents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_room TEXT NOT NULL,
                tracker_key TEXT UNIQUE,
                priority INTEGER NOT NULL,
                title TEXT NOT NULL,
                summary TEXT,
                point TEXT,
                comms TEXT,
                triage TEXT,
                eng_lead TEXT,
                assigned TEXT,
                genesis_at TEXT,
                detected_at TEXT,
                acknowledged_at TEXT,
                mitigated_at TEXT,
                resolved_at TEXT,
                ready_for_review_at TEXT,
                completed_at TEXT,
                archived_at TEXT,
                canceled_at TEXT,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- One live incident per room
            CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_live_room
                ON incidents(chat_room) WHERE archived_at IS NULL AND canceled_at IS NULL;

            CREATE TABLE IF NOT EXISTS blockers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                incident_id INTEGER NOT NULL REFERENCES incidents(id),
                whomst TEXT NOT NULL,
                reason TEXT,
                created_at TEXT NOT NULL,
                unblocked_at TEXT
            );

            CREATE TABLE IF NOT EXISTS affected (
                incident_id INTEGER NOT NULL REFERENCES incidents(id),
                value TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (incident_id, value)
            );

            CREATE TABLE IF NOT EXISTS components (
                incident_id INTEGER NOT NULL REFERENCES incidents(id),
                value TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (incident_id, value)
            );

            -- Append-only activity log; created_at is assigned here and never goes backwards
            CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                incident_id INTEGER NOT NULL REFERENCES incidents(id),
                kind TEXT NOT NULL,
                text TEXT NOT NULL,
                context_url TEXT,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_logs_created_at ON logs(created_at);

            CREATE TABLE IF NOT EXISTS user_cache (
                chat_user_id TEXT PRIMARY KEY,
                tracker_user_id TEXT,
                report_user_id TEXT,
                name TEXT,
                updated_at TEXT NOT NULL
            );
         ",
            )
            .map_err(storage("Migration"))?;
        Ok(())
    }

    // ─── Incidents ──────────────────────────────────────────

    /// Insert a new incident. Returns the assigned id.
    pub fn create_incident(&self, incident: &Incident) -> Result<i64> {
        let id = Self::insert_incident(&*self.conn()?, incident)?;
        tracing::info!("💾 Incident #{} stored for room {}", id, incident.chat_room);
        Ok(id)
    }

    /// Insert a new incident together with its first log entry. Neither is
    /// stored unless both are.
    pub fn create_with_log(
        &self,
        incident: &Incident,
        kind: LogType,
        text: &str,
        created_by: &str,
    ) -> Result<(i64, LogEntry)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage("Begin"))?;
        let id = Self::insert_incident(&tx, incident)?;
        let entry = Self::insert_log(&tx, id, kind, text, None, created_by)?;
        tx.commit().map_err(storage("Commit"))?;
        tracing::info!("💾 Incident #{} stored for room {}", id, incident.chat_room);
        Ok((id, entry))
    }

    fn insert_incident(conn: &Connection, incident: &Incident) -> Result<i64> {
        conn.execute(
            "INSERT INTO incidents
             (chat_room, tracker_key, priority, title, summary, point, comms, triage, eng_lead,
              assigned, genesis_at, detected_at, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                incident.chat_room,
                incident.tracker_key,
                incident.priority,
                incident.title,
                incident.summary,
                incident.point,
                incident.comms,
                incident.triage,
                incident.eng_lead,
                incident.assigned,
                incident.genesis_at.map(fmt_ts),
                incident.detected_at.map(fmt_ts),
                incident.created_by,
                fmt_ts(incident.created_at),
                fmt_ts(incident.updated_at),
            ],
        )
        .map_err(storage("Create incident"))?;
        Ok(conn.last_insert_rowid())
    }

    /// Write every scalar column of an incident. A stored tracker key is kept.
    pub fn update_incident(&self, incident: &Incident) -> Result<()> {
        Self::write_incident(&*self.conn()?, incident)
    }

    /// Write every scalar column and append a log entry in one transaction.
    pub fn update_with_log(
        &self,
        incident: &Incident,
        kind: LogType,
        text: &str,
        created_by: &str,
    ) -> Result<LogEntry> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage("Begin"))?;
        Self::write_incident(&tx, incident)?;
        let entry = Self::insert_log(&tx, incident.id, kind, text, None, created_by)?;
        tx.commit().map_err(storage("Commit"))?;
        Ok(entry)
    }

    /// Record the tracker issue key. A key already stored is never replaced;
    /// returns whether this call wrote it.
    pub fn set_tracker_key(&self, id: i64, key: &str) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE incidents SET tracker_key = ?2 WHERE id = ?1 AND tracker_key IS NULL",
                params![id, key],
            )
            .map_err(storage("Set tracker key"))?;
        Ok(changed > 0)
    }

    fn write_incident(conn: &Connection, incident: &Incident) -> Result<()> {
        let changed = conn
            .execute(
                "UPDATE incidents SET
                    tracker_key = COALESCE(tracker_key, ?2), priority = ?3, title = ?4,
                    summary = ?5, point = ?6,
                    comms = ?7, triage = ?8, eng_lead = ?9, assigned = ?10, genesis_at = ?11,
                    detected_at = ?12, acknowledged_at = ?13, mitigated_at = ?14,
                    resolved_at = ?15, ready_for_review_at = ?16, completed_at = ?17,
                    archived_at = ?18, canceled_at = ?19, updated_at = ?20
                 WHERE id = ?1",
                params![
                    incident.id,
                    incident.tracker_key,
                    incident.priority,
                    incident.title,
                    incident.summary,
                    incident.point,
                    incident.comms,
                    incident.triage,
                    incident.eng_lead,
                    incident.assigned,
                    incident.genesis_at.map(fmt_ts),
                    incident.detected_at.map(fmt_ts),
                    incident.acknowledged_at.map(fmt_ts),
                    incident.mitigated_at.map(fmt_ts),
                    incident.resolved_at.map(fmt_ts),
                    incident.ready_for_review_at.map(fmt_ts),
                    incident.completed_at.map(fmt_ts),
                    incident.archived_at.map(fmt_ts),
                    incident.canceled_at.map(fmt_ts),
                    fmt_ts(incident.updated_at),
                ],
            )
            .map_err(storage("Update incident"))?;
        if changed == 0 {
            return Err(BreakbotError::NotFound(format!("incident #{}", incident.id)));
        }
        Ok(())
    }

    /// Load one incident with its collections.
    pub fn load_incident(&self, id: i64) -> Result<Option<Incident>> {
        let conn = self.conn()?;
        let incident = conn
            .query_row(&format!("{INCIDENT_SELECT} WHERE id = ?1"), [id], row_to_incident)
            .optional()
            .map_err(storage("Load incident"))?;
        match incident {
            Some(mut incident) => {
                Self::fill_collections(&conn, &mut incident)?;
                Ok(Some(incident))
            }
            None => Ok(None),
        }
    }

    /// Incidents that are neither archived nor canceled, with collections loaded.
    pub fn load_in_progress(&self) -> Result<Vec<Incident>> {
        let conn = self.conn()?;
        let mut incidents = {
            let mut stmt = conn
                .prepare(&format!(
                    "{INCIDENT_SELECT} WHERE archived_at IS NULL AND canceled_at IS NULL ORDER BY id"
                ))
                .map_err(storage("Load in-progress"))?;
            let rows = stmt
                .query_map([], row_to_incident)
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .map_err(storage("Load in-progress"))?;
            rows
        };
        for incident in incidents.iter_mut() {
            Self::fill_collections(&conn, incident)?;
        }
        tracing::debug!("📂 Loaded {} in-progress incidents", incidents.len());
        Ok(incidents)
    }

    fn fill_collections(conn: &Connection, incident: &mut Incident) -> Result<()> {
        incident.affected = Self::values(conn, ValueSet::Affected, incident.id)?;
        incident.components = Self::values(conn, ValueSet::Components, incident.id)?;
        incident.blockers = Self::blockers(conn, incident.id)?;
        incident.logs = Self::logs(conn, incident.id)?;
        Ok(())
    }

    /// Mark an incident archived. Only the first call writes; returns whether it did.
    pub fn archive_incident(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE incidents SET archived_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND archived_at IS NULL AND canceled_at IS NULL",
                params![id, fmt_ts(at)],
            )
            .map_err(storage("Archive incident"))?;
        Ok(changed > 0)
    }

    // ─── Affected / components ──────────────────────────────

    pub fn add_affected(&self, incident_id: i64, value: &str) -> Result<AddOutcome> {
        self.add_value(ValueSet::Affected, incident_id, value)
    }

    pub fn remove_affected(&self, incident_id: i64, value: &str) -> Result<RemoveOutcome> {
        self.remove_value(ValueSet::Affected, incident_id, value)
    }

    pub fn affected(&self, incident_id: i64) -> Result<Vec<String>> {
        Self::values(&*self.conn()?, ValueSet::Affected, incident_id)
    }

    pub fn add_component(&self, incident_id: i64, value: &str) -> Result<AddOutcome> {
        self.add_value(ValueSet::Components, incident_id, value)
    }

    pub fn remove_component(&self, incident_id: i64, value: &str) -> Result<RemoveOutcome> {
        self.remove_value(ValueSet::Components, incident_id, value)
    }

    pub fn components(&self, incident_id: i64) -> Result<Vec<String>> {
        Self::values(&*self.conn()?, ValueSet::Components, incident_id)
    }

    fn add_value(&self, set: ValueSet, incident_id: i64, value: &str) -> Result<AddOutcome> {
        let changed = self
            .conn()?
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO {} (incident_id, value, created_at) VALUES (?1, ?2, ?3)",
                    set.table()
                ),
                params![incident_id, value, fmt_ts(Utc::now())],
            )
            .map_err(storage("Add value"))?;
        Ok(if changed > 0 { AddOutcome::Added } else { AddOutcome::Duplicate })
    }

    fn remove_value(&self, set: ValueSet, incident_id: i64, value: &str) -> Result<RemoveOutcome> {
        let changed = self
            .conn()?
            .execute(
                &format!("DELETE FROM {} WHERE incident_id = ?1 AND value = ?2", set.table()),
                params![incident_id, value],
            )
            .map_err(storage("Remove value"))?;
        Ok(if changed > 0 { RemoveOutcome::Removed } else { RemoveOutcome::NotFound })
    }

    fn values(conn: &Connection, set: ValueSet, incident_id: i64) -> Result<Vec<String>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT value FROM {} WHERE incident_id = ?1 ORDER BY created_at, value",
                set.table()
            ))
            .map_err(storage("List values"))?;
        let values = stmt
            .query_map([incident_id], |row| row.get(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<String>>>())
            .map_err(storage("List values"))?;
        Ok(values)
    }

    // ─── Blockers ───────────────────────────────────────────

    pub fn add_blocker(&self, incident_id: i64, whomst: &str, reason: Option<&str>) -> Result<Blocker> {
        let created_at = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO blockers (incident_id, whomst, reason, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![incident_id, whomst, reason, fmt_ts(created_at)],
        )
        .map_err(storage("Add blocker"))?;
        Ok(Blocker {
            id: conn.last_insert_rowid(),
            incident_id,
            whomst: whomst.to_string(),
            reason: reason.map(str::to_string),
            created_at,
            unblocked_at: None,
        })
    }

    /// Clear active blockers matching `whomst` (case-insensitive), or all of them.
    pub fn unblock(&self, incident_id: i64, whomst: Option<&str>, at: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let changed = match whomst {
            Some(w) => conn.execute(
                "UPDATE blockers SET unblocked_at = ?3
                 WHERE incident_id = ?1 AND unblocked_at IS NULL AND whomst = ?2 COLLATE NOCASE",
                params![incident_id, w, fmt_ts(at)],
            ),
            None => conn.execute(
                "UPDATE blockers SET unblocked_at = ?2 WHERE incident_id = ?1 AND unblocked_at IS NULL",
                params![incident_id, fmt_ts(at)],
            ),
        }
        .map_err(storage("Unblock"))?;
        Ok(changed)
    }

    fn blockers(conn: &Connection, incident_id: i64) -> Result<Vec<Blocker>> {
        let mut stmt = conn
            .prepare(
                "SELECT id, incident_id, whomst, reason, created_at, unblocked_at
                 FROM blockers WHERE incident_id = ?1 ORDER BY id",
            )
            .map_err(storage("List blockers"))?;
        let blockers = stmt
            .query_map([incident_id], row_to_blocker)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(storage("List blockers"))?;
        Ok(blockers)
    }

    // ─── Logs ───────────────────────────────────────────────

    /// Append a log entry. Creation time is assigned here and is strictly
    /// after every previously stored entry.
    pub fn add_log(
        &self,
        incident_id: i64,
        kind: LogType,
        text: &str,
        context_url: Option<&str>,
        created_by: &str,
    ) -> Result<LogEntry> {
        Self::insert_log(&*self.conn()?, incident_id, kind, text, context_url, created_by)
    }

    fn insert_log(
        conn: &Connection,
        incident_id: i64,
        kind: LogType,
        text: &str,
        context_url: Option<&str>,
        created_by: &str,
    ) -> Result<LogEntry> {
        let last: Option<String> = conn
            .query_row("SELECT MAX(created_at) FROM logs", [], |row| row.get(0))
            .map_err(storage("Add log"))?;
        let mut created_at = Utc::now().trunc_subsecs(6);
        if let Some(last) = last.as_deref().and_then(|s| parse_ts(s).ok()) {
            if created_at <= last {
                created_at = last + Duration::microseconds(1);
            }
        }
        conn.execute(
            "INSERT INTO logs (incident_id, kind, text, context_url, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![incident_id, kind.as_str(), text, context_url, created_by, fmt_ts(created_at)],
        )
        .map_err(storage("Add log"))?;
        Ok(LogEntry {
            id: conn.last_insert_rowid(),
            incident_id,
            kind,
            text: text.to_string(),
            context_url: context_url.map(str::to_string),
            created_by: created_by.to_string(),
            created_at,
        })
    }

    pub fn logs_for(&self, incident_id: i64) -> Result<Vec<LogEntry>> {
        Self::logs(&*self.conn()?, incident_id)
    }

    fn logs(conn: &Connection, incident_id: i64) -> Result<Vec<LogEntry>> {
        let mut stmt = conn
            .prepare(&format!("{LOG_SELECT} WHERE l.incident_id = ?1 ORDER BY l.created_at"))
            .map_err(storage("List logs"))?;
        let logs = stmt
            .query_map([incident_id], row_to_log)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(storage("List logs"))?;
        Ok(logs)
    }

    /// Log entries created strictly after `after`, grouped by owning incident.
    pub fn logs_since(&self, after: DateTime<Utc>) -> Result<BTreeMap<i64, Vec<LogEntry>>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{LOG_SELECT} WHERE l.created_at > ?1 ORDER BY l.created_at"))
            .map_err(storage("Logs since"))?;
        let rows = stmt
            .query_map([fmt_ts(after)], row_to_log)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(storage("Logs since"))?;

        let mut grouped: BTreeMap<i64, Vec<LogEntry>> = BTreeMap::new();
        for entry in rows {
            grouped.entry(entry.incident_id).or_default().push(entry);
        }
        Ok(grouped)
    }

    // ─── User cache ─────────────────────────────────────────

    /// Merge-on-write: fields absent from `entry` keep their stored values.
    pub fn upsert_user(&self, entry: &UserCacheEntry) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO user_cache (chat_user_id, tracker_user_id, report_user_id, name, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(chat_user_id) DO UPDATE SET
                    tracker_user_id = COALESCE(excluded.tracker_user_id, user_cache.tracker_user_id),
                    report_user_id = COALESCE(excluded.report_user_id, user_cache.report_user_id),
                    name = COALESCE(excluded.name, user_cache.name),
                    updated_at = excluded.updated_at",
                params![
                    entry.chat_user_id,
                    entry.tracker_user_id,
                    entry.report_user_id,
                    entry.name,
                    fmt_ts(entry.updated_at.unwrap_or_else(Utc::now)),
                ],
            )
            .map_err(storage("Upsert user"))?;
        Ok(())
    }

    pub fn get_user(&self, chat_user_id: &str) -> Result<Option<UserCacheEntry>> {
        self.conn()?
            .query_row(
                "SELECT chat_user_id, tracker_user_id, report_user_id, name, updated_at
                 FROM user_cache WHERE chat_user_id = ?1",
                [chat_user_id],
                |row| {
                    Ok(UserCacheEntry {
                        chat_user_id: row.get(0)?,
                        tracker_user_id: row.get(1)?,
                        report_user_id: row.get(2)?,
                        name: row.get(3)?,
                        updated_at: opt_ts_col(row, 4)?,
                    })
                },
            )
            .optional()
            .map_err(storage("Get user"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_incident(room: &str) -> (IncidentStore, Incident) {
        let store = IncidentStore::open_in_memory().unwrap();
        let mut incident = Incident::new(room, "checkout failing", 1, "alice");
        incident.id = store.create_incident(&incident).unwrap();
        (store, incident)
    }

    #[test]
    fn test_open_and_migrate() {
        let store = IncidentStore::open_in_memory().unwrap();
        assert!(store.load_in_progress().unwrap().is_empty());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = std::env::temp_dir().join("breakbot-store-test-open");
        std::fs::remove_dir_all(&dir).ok();
        let store = IncidentStore::open(&dir.join("nested").join("test.db")).unwrap();
        assert!(store.load_in_progress().unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_create_update_load() {
        let (store, mut incident) = store_with_incident("C1");
        incident.point = Some("bob".into());
        incident.acknowledged_at = Some(Utc::now());
        store.update_incident(&incident).unwrap();

        let loaded = store.load_incident(incident.id).unwrap().unwrap();
        assert_eq!(loaded.point.as_deref(), Some("bob"));
        assert!(loaded.acknowledged_at.is_some());
        assert!(store.load_incident(999).unwrap().is_none());

        incident.id = 999;
        assert!(matches!(
            store.update_incident(&incident),
            Err(BreakbotError::NotFound(_))
        ));
    }

    #[test]
    fn test_live_room_is_unique() {
        let (store, _) = store_with_incident("C1");
        let dup = Incident::new("C1", "other", 2, "bob");
        assert!(store.create_incident(&dup).is_err());
    }

    #[test]
    fn test_duplicate_affected_is_reported_not_stored() {
        let (store, incident) = store_with_incident("C1");
        assert_eq!(store.add_affected(incident.id, "checkout").unwrap(), AddOutcome::Added);
        assert_eq!(store.add_affected(incident.id, "checkout").unwrap(), AddOutcome::Duplicate);
        assert_eq!(store.affected(incident.id).unwrap(), vec!["checkout".to_string()]);
    }

    #[test]
    fn test_remove_missing_component_is_not_found() {
        let (store, incident) = store_with_incident("C1");
        store.add_component(incident.id, "api").unwrap();
        assert_eq!(
            store.remove_component(incident.id, "db").unwrap(),
            RemoveOutcome::NotFound
        );
        assert_eq!(store.components(incident.id).unwrap(), vec!["api".to_string()]);
        assert_eq!(
            store.remove_component(incident.id, "api").unwrap(),
            RemoveOutcome::Removed
        );
        assert!(store.components(incident.id).unwrap().is_empty());
    }

    #[test]
    fn test_blockers() {
        let (store, incident) = store_with_incident("C1");
        store.add_blocker(incident.id, "Vendor", Some("waiting on RMA")).unwrap();
        store.add_blocker(incident.id, "dba", None).unwrap();
        assert_eq!(store.unblock(incident.id, Some("vendor"), Utc::now()).unwrap(), 1);
        assert_eq!(store.unblock(incident.id, Some("vendor"), Utc::now()).unwrap(), 0);

        let loaded = store.load_incident(incident.id).unwrap().unwrap();
        assert_eq!(loaded.blockers.len(), 2);
        assert!(loaded.is_blocked());
        assert_eq!(store.unblock(incident.id, None, Utc::now()).unwrap(), 1);
        assert!(!store.load_incident(incident.id).unwrap().unwrap().is_blocked());
    }

    #[test]
    fn test_log_timestamps_strictly_increase() {
        let (store, incident) = store_with_incident("C1");
        let mut prev: Option<DateTime<Utc>> = None;
        for i in 0..20 {
            let entry = store
                .add_log(incident.id, LogType::Note, &format!("n{i}"), None, "alice")
                .unwrap();
            if let Some(p) = prev {
                assert!(entry.created_at > p);
            }
            prev = Some(entry.created_at);
        }
        assert_eq!(store.logs_for(incident.id).unwrap().len(), 20);
    }

    #[test]
    fn test_logs_since_groups_by_incident() {
        let (store, a) = store_with_incident("C1");
        let mut b = Incident::new("C2", "search slow", 3, "bob");
        b.id = store.create_incident(&b).unwrap();

        let first = store.add_log(a.id, LogType::Note, "old", None, "alice").unwrap();
        store.add_log(a.id, LogType::CommUpdate, "update", None, "alice").unwrap();
        store.add_log(b.id, LogType::Event, "restarted", Some("https://x"), "bob").unwrap();

        let grouped = store.logs_since(first.created_at).unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&a.id].len(), 1);
        assert_eq!(grouped[&a.id][0].kind, LogType::CommUpdate);
        assert_eq!(grouped[&b.id][0].context_url.as_deref(), Some("https://x"));
    }

    #[test]
    fn test_logs_since_separates_incidents_sharing_a_room() {
        let (store, mut first) = store_with_incident("C1");
        first.canceled_at = Some(Utc::now());
        store.update_incident(&first).unwrap();
        store.add_log(first.id, LogType::Event, "Incident Canceled", None, "alice").unwrap();

        let mut second = Incident::new("C1", "checkout failing again", 1, "bob");
        second.id = store.create_incident(&second).unwrap();
        store.add_log(second.id, LogType::Event, "declared", None, "bob").unwrap();

        let grouped = store.logs_since(first.created_at - Duration::seconds(1)).unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&first.id][0].text, "Incident Canceled");
        assert_eq!(grouped[&second.id][0].text, "declared");
    }

    #[test]
    fn test_create_with_log_is_atomic() {
        let store = IncidentStore::open_in_memory().unwrap();
        let incident = Incident::new("C1", "queue backlog", 2, "alice");
        let (id, entry) = store
            .create_with_log(&incident, LogType::Event, "declared", "alice")
            .unwrap();
        assert_eq!(entry.incident_id, id);

        let other = IncidentStore::open_in_memory().unwrap();
        other.conn().unwrap().execute_batch("DROP TABLE logs").unwrap();
        assert!(other.create_with_log(&incident, LogType::Event, "declared", "alice").is_err());
        let rows: i64 = other
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM incidents", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_update_with_log_is_atomic() {
        let (store, mut incident) = store_with_incident("C1");
        incident.acknowledged_at = Some(Utc::now());
        store.update_with_log(&incident, LogType::Event, "Incident Acknowledged", "bob").unwrap();
        assert_eq!(store.logs_for(incident.id).unwrap().len(), 1);

        incident.mitigated_at = Some(Utc::now());
        store.conn().unwrap().execute_batch("DROP TABLE logs").unwrap();
        assert!(store.update_with_log(&incident, LogType::Event, "Incident Mitigated", "bob").is_err());
        let mitigated: Option<String> = store
            .conn()
            .unwrap()
            .query_row("SELECT mitigated_at FROM incidents WHERE id = ?1", [incident.id], |row| {
                row.get(0)
            })
            .unwrap();
        assert!(mitigated.is_none());
    }

    #[test]
    fn test_tracker_key_is_written_once() {
        let (store, incident) = store_with_incident("C1");
        assert!(store.set_tracker_key(incident.id, "OPS-1").unwrap());
        assert!(!store.set_tracker_key(incident.id, "OPS-2").unwrap());
        // A stale copy without the key does not clear it.
        store.update_incident(&incident).unwrap();
        let loaded = store.load_incident(incident.id).unwrap().unwrap();
        assert_eq!(loaded.tracker_key.as_deref(), Some("OPS-1"));
    }

    #[test]
    fn test_archive_is_idempotent() {
        let (store, incident) = store_with_incident("C1");
        let at = Utc::now();
        assert!(store.archive_incident(incident.id, at).unwrap());
        assert!(!store.archive_incident(incident.id, Utc::now()).unwrap());
        let loaded = store.load_incident(incident.id).unwrap().unwrap();
        assert_eq!(
            loaded.archived_at.map(fmt_ts),
            Some(fmt_ts(at))
        );
        assert!(store.load_in_progress().unwrap().is_empty());
    }

    #[test]
    fn test_user_cache_merges() {
        let store = IncidentStore::open_in_memory().unwrap();
        store
            .upsert_user(&UserCacheEntry {
                chat_user_id: "U1".into(),
                tracker_user_id: Some("jira-1".into()),
                name: Some("Alice".into()),
                ..Default::default()
            })
            .unwrap();
        store
            .upsert_user(&UserCacheEntry {
                chat_user_id: "U1".into(),
                report_user_id: Some("rep-1".into()),
                ..Default::default()
            })
            .unwrap();

        let user = store.get_user("U1").unwrap().unwrap();
        assert_eq!(user.tracker_user_id.as_deref(), Some("jira-1"));
        assert_eq!(user.report_user_id.as_deref(), Some("rep-1"));
        assert_eq!(user.name.as_deref(), Some("Alice"));
        assert!(store.get_user("U2").unwrap().is_none());
    }
}
