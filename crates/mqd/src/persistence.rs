use chrono::Utc;
use mq_core::{
    AccountInfo, ChangeId, ChangeInfo, Event, HistoryPage, MergeRecord, MergeStatus, Page,
    PageRequest, RecordId, ScopeFilter,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("sqlite error: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
    #[error("json serialization error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

fn collect_payloads<T: serde::de::DeserializeOwned>(
    rows: impl Iterator<Item = rusqlite::Result<String>>,
) -> Result<Vec<T>, PersistenceError> {
    let mut items = Vec::new();
    for row in rows {
        let payload = row?;
        items.push(serde_json::from_str::<T>(&payload)?);
    }
    Ok(items)
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<(), PersistenceError> {
        self.conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS changes (
    change_id TEXT PRIMARY KEY,
    project TEXT NOT NULL,
    branch TEXT NOT NULL,
    priority INTEGER NOT NULL,
    request_time TEXT,
    poll_id INTEGER NOT NULL,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_changes_project ON changes(project, branch);

CREATE TABLE IF NOT EXISTS accounts (
    account_id INTEGER PRIMARY KEY,
    display_name TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    payload_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS merge_records (
    rid INTEGER PRIMARY KEY,
    project TEXT NOT NULL,
    queue_name TEXT NOT NULL,
    branch TEXT NOT NULL,
    status INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    ended_at TEXT,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_merge_records_queue ON merge_records(project, queue_name, rid);
CREATE INDEX IF NOT EXISTS idx_merge_records_status ON merge_records(status);

CREATE TABLE IF NOT EXISTS merge_changes (
    rid INTEGER NOT NULL,
    change_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (rid, change_id)
);

CREATE INDEX IF NOT EXISTS idx_merge_changes_change ON merge_changes(change_id);

CREATE TABLE IF NOT EXISTS events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    rid INTEGER,
    scope TEXT,
    at TEXT NOT NULL,
    kind_tag TEXT NOT NULL,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_rid ON events(rid, event_id);
"#,
        )?;
        Ok(())
    }

    pub fn next_poll_id(&self) -> Result<i64, PersistenceError> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(poll_id) FROM changes", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0) + 1)
    }

    /// Replaces the stored snapshot of one project in a single transaction.
    pub fn replace_project_changes(
        &self,
        project: &str,
        changes: &[ChangeInfo],
        poll_id: i64,
    ) -> Result<(), PersistenceError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM changes WHERE project = ?1", params![project])?;
        {
            let mut insert = tx.prepare(
                r#"
INSERT OR REPLACE INTO changes (change_id, project, branch, priority, request_time, poll_id, payload_json)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
"#,
            )?;
            for change in changes {
                insert.execute(params![
                    change.change_id.as_str(),
                    change.project,
                    change.branch,
                    change.priority(),
                    change.request_time.map(|at| at.to_rfc3339()),
                    poll_id,
                    serde_json::to_string(change)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_changes(&self, project: Option<&str>) -> Result<Vec<ChangeInfo>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            "SELECT payload_json FROM changes WHERE ?1 IS NULL OR project = ?1 ORDER BY project ASC, change_id ASC",
        )?;
        let rows = stmt.query_map(params![project], |row| row.get::<_, String>(0))?;
        collect_payloads(rows)
    }

    pub fn upsert_account(&self, account: &AccountInfo) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(account)?;
        self.conn.execute(
            r#"
INSERT INTO accounts (account_id, display_name, updated_at, payload_json)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(account_id) DO UPDATE SET
  display_name = excluded.display_name,
  updated_at = excluded.updated_at,
  payload_json = excluded.payload_json
"#,
            params![
                account.account_id,
                account.display_name(),
                Utc::now().to_rfc3339(),
                payload
            ],
        )?;
        Ok(())
    }

    pub fn load_account(&self, account_id: i64) -> Result<Option<AccountInfo>, PersistenceError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_json FROM accounts WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|value| serde_json::from_str::<AccountInfo>(&value))
            .transpose()
            .map_err(PersistenceError::from)
    }

    pub fn list_account_ids(&self) -> Result<Vec<i64>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT account_id FROM accounts ORDER BY account_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Writes the record and its ordered change membership.
    pub fn upsert_record(&self, record: &MergeRecord) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(record)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            r#"
INSERT INTO merge_records (rid, project, queue_name, branch, status, created_at, ended_at, payload_json)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT(rid) DO UPDATE SET
  status = excluded.status,
  ended_at = excluded.ended_at,
  payload_json = excluded.payload_json
"#,
            params![
                record.rid.0,
                record.project,
                record.queue_name,
                record.branch,
                record.status.code(),
                record.created_at.to_rfc3339(),
                record.ended_at.map(|at| at.to_rfc3339()),
                payload
            ],
        )?;
        tx.execute("DELETE FROM merge_changes WHERE rid = ?1", params![record.rid.0])?;
        for (position, change_id) in record.change_ids().enumerate() {
            tx.execute(
                "INSERT INTO merge_changes (rid, change_id, position) VALUES (?1, ?2, ?3)",
                params![record.rid.0, change_id.as_str(), position as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_record(&self, rid: RecordId) -> Result<Option<MergeRecord>, PersistenceError> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_json FROM merge_records WHERE rid = ?1",
                params![rid.0],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|value| serde_json::from_str::<MergeRecord>(&value))
            .transpose()
            .map_err(PersistenceError::from)
    }

    /// All records, oldest first.
    pub fn list_records(&self) -> Result<Vec<MergeRecord>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload_json FROM merge_records ORDER BY rid ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        collect_payloads(rows)
    }

    pub fn list_records_with_status(
        &self,
        status: MergeStatus,
    ) -> Result<Vec<MergeRecord>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            "SELECT payload_json FROM merge_records WHERE status = ?1 ORDER BY rid ASC",
        )?;
        let rows = stmt.query_map(params![status.code()], |row| row.get::<_, String>(0))?;
        collect_payloads(rows)
    }

    pub fn max_record_id(&self) -> Result<Option<RecordId>, PersistenceError> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(rid) FROM merge_records", [], |row| row.get(0))?;
        Ok(max.map(|rid| RecordId(rid as u64)))
    }

    pub fn records_for_change(&self, change_id: &ChangeId) -> Result<Vec<RecordId>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT rid FROM merge_changes WHERE change_id = ?1 ORDER BY rid ASC")?;
        let rows = stmt.query_map(params![change_id.as_str()], |row| row.get::<_, i64>(0))?;
        let mut rids = Vec::new();
        for row in rows {
            rids.push(RecordId(row? as u64));
        }
        Ok(rids)
    }

    /// Newest first, with exact project/branch filters.
    pub fn history(
        &self,
        filter: &ScopeFilter,
        page: PageRequest,
    ) -> Result<HistoryPage, PersistenceError> {
        let count: i64 = self.conn.query_row(
            r#"
SELECT COUNT(*) FROM merge_records
WHERE (?1 IS NULL OR project = ?1) AND (?2 IS NULL OR branch = ?2)
"#,
            params![filter.project, filter.branch],
            |row| row.get(0),
        )?;
        let mut stmt = self.conn.prepare(
            r#"
SELECT payload_json FROM merge_records
WHERE (?1 IS NULL OR project = ?1) AND (?2 IS NULL OR branch = ?2)
ORDER BY rid DESC
LIMIT ?3 OFFSET ?4
"#,
        )?;
        let rows = stmt.query_map(
            params![
                filter.project,
                filter.branch,
                page.limit as i64,
                page.offset as i64
            ],
            |row| row.get::<_, String>(0),
        )?;
        Ok(Page {
            count: count as usize,
            offset: page.offset,
            limit: page.limit,
            items: collect_payloads(rows)?,
        })
    }

    pub fn append_event(&self, event: &Event) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(event)?;
        self.conn.execute(
            r#"
INSERT INTO events (rid, scope, at, kind_tag, payload_json)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
            params![
                event.rid.map(|rid| rid.0 as i64),
                event.scope,
                event.at.to_rfc3339(),
                event.kind_tag(),
                payload,
            ],
        )?;
        Ok(())
    }

    pub fn list_events_for_record(&self, rid: RecordId) -> Result<Vec<Event>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload_json FROM events WHERE rid = ?1 ORDER BY event_id ASC")?;
        let rows = stmt.query_map(params![rid.0 as i64], |row| row.get::<_, String>(0))?;
        collect_payloads(rows)
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<Event>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload_json FROM events ORDER BY event_id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        let mut events: Vec<Event> = collect_payloads(rows)?;
        events.reverse();
        Ok(events)
    }
}
