use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDate;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::IngestError;

pub const TBD: &str = "TBD";
pub const UNKNOWN: &str = "Unknown";
pub const NO_DESC: &str = "No desc.";

/// Target table for a source's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Releases,
    News,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Releases, RecordKind::News];

    pub fn table(self) -> &'static str {
        match self {
            RecordKind::Releases => "releases",
            RecordKind::News => "news",
        }
    }
}

/// Which fields make two rows the same row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKey {
    /// `(name, attribution)`: one row per item, first sighting wins.
    Latest,
    /// `(name, attribution, fetched_on)`: one row per item per day.
    Daily,
}

impl IdentityKey {
    fn as_str(self) -> &'static str {
        match self {
            IdentityKey::Latest => "latest",
            IdentityKey::Daily => "daily",
        }
    }

    fn other(self) -> IdentityKey {
        match self {
            IdentityKey::Latest => IdentityKey::Daily,
            IdentityKey::Daily => IdentityKey::Latest,
        }
    }

    fn columns(self) -> &'static str {
        match self {
            IdentityKey::Latest => "name, attribution",
            IdentityKey::Daily => "name, attribution, fetched_on",
        }
    }
}

/// Canonical output of the extraction pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub name: String,
    pub release: String,
    pub category: String,
    pub summary: String,
    pub attribution: String,
    pub fetched_on: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreRow {
    pub id: i64,
    #[serde(flatten)]
    pub record: Record,
}

/// Append-only record store. Open once per process and share behind an `Arc`;
/// the mutex makes it the single writer.
pub struct Store {
    conn: Mutex<Connection>,
    identity: IdentityKey,
}

impl Store {
    pub fn open(path: &Path, identity: IdentityKey) -> Result<Self, IngestError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| IngestError::Config(format!("cannot create {:?}: {}", parent, e)))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn, identity)
    }

    #[cfg(test)]
    pub fn open_in_memory(identity: IdentityKey) -> Result<Self, IngestError> {
        Self::with_connection(Connection::open_in_memory()?, identity)
    }

    fn with_connection(mut conn: Connection, identity: IdentityKey) -> Result<Self, IngestError> {
        init_schema(&mut conn, identity)?;
        Ok(Self {
            conn: Mutex::new(conn),
            identity,
        })
    }

    pub fn identity(&self) -> IdentityKey {
        self.identity
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), IngestError> {
        self.conn().execute_batch(sql)?;
        Ok(())
    }

    /// Insert unless a row with the same identity exists. Returns whether a
    /// row was written.
    pub fn upsert_if_absent(&self, kind: RecordKind, r: &Record) -> Result<bool, IngestError> {
        let conn = self.conn();
        let sql = format!(
            "INSERT OR IGNORE INTO {} (name, release_date, category, summary, attribution, fetched_on)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            kind.table()
        );
        let changed = conn.prepare_cached(&sql)?.execute(params![
            r.name,
            r.release,
            r.category,
            r.summary,
            r.attribution,
            r.fetched_on.to_string(),
        ])?;
        Ok(changed > 0)
    }

    /// Most recent fetch date first, newest insert first within a day.
    pub fn list_recent(&self, kind: RecordKind, limit: usize) -> Result<Vec<StoreRow>, IngestError> {
        self.query_rows(kind, Some(limit))
    }

    pub fn export_all(&self, kind: RecordKind) -> Result<Vec<StoreRow>, IngestError> {
        self.query_rows(kind, None)
    }

    fn query_rows(&self, kind: RecordKind, limit: Option<usize>) -> Result<Vec<StoreRow>, IngestError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT id, name, release_date, category, summary, attribution, fetched_on
             FROM {}
             ORDER BY fetched_on DESC, id DESC{}",
            kind.table(),
            match limit {
                Some(n) => format!(" LIMIT {}", n),
                None => String::new(),
            }
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                let fetched_on: String = row.get(6)?;
                let fetched_on = NaiveDate::parse_from_str(&fetched_on, "%Y-%m-%d").map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
                })?;
                Ok(StoreRow {
                    id: row.get(0)?,
                    record: Record {
                        name: row.get(1)?,
                        release: row.get(2)?,
                        category: row.get(3)?,
                        summary: row.get(4)?,
                        attribution: row.get(5)?,
                        fetched_on,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(&self, kind: RecordKind) -> Result<usize, IngestError> {
        let conn = self.conn();
        let n: usize = conn.query_row(&format!("SELECT COUNT(*) FROM {}", kind.table()), [], |r| {
            r.get(0)
        })?;
        Ok(n)
    }

    pub fn stats(&self) -> Result<Vec<TableStats>, IngestError> {
        let mut out = Vec::new();
        for kind in RecordKind::ALL {
            let rows = self.count(kind)?;
            let latest: Option<String> = self
                .conn()
                .query_row(
                    &format!("SELECT MAX(fetched_on) FROM {}", kind.table()),
                    [],
                    |r| r.get(0),
                )
                .optional()?
                .flatten();
            out.push(TableStats { kind, rows, latest });
        }
        Ok(out)
    }
}

pub struct TableStats {
    pub kind: RecordKind,
    pub rows: usize,
    pub latest: Option<String>,
}

/// Create tables and the unique index for `identity`. A store opened
/// earlier with the other identity is switched over: its index is dropped
/// and the new one built in the same transaction. Switching to `latest`
/// fails with a config error while per-day history holds duplicates.
fn init_schema(conn: &mut Connection, identity: IdentityKey) -> Result<(), IngestError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;

    let tx = conn.transaction()?;
    let previous: Option<String> = tx
        .query_row("SELECT value FROM meta WHERE key = 'identity'", [], |r| r.get(0))
        .optional()?;

    for kind in RecordKind::ALL {
        let table = kind.table();
        tx.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {table} (
                id           INTEGER PRIMARY KEY,
                name         TEXT NOT NULL CHECK(length(name) > 0),
                release_date TEXT NOT NULL,
                category     TEXT NOT NULL,
                summary      TEXT NOT NULL,
                attribution  TEXT NOT NULL,
                fetched_on   TEXT NOT NULL,
                created_at   TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_fetched_on ON {table}(fetched_on);
            DROP INDEX IF EXISTS idx_{table}_identity_{other};
            ",
            table = table,
            other = identity.other().as_str(),
        ))?;

        let unique = format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_{table}_identity_{mode} ON {table}({cols});",
            table = table,
            mode = identity.as_str(),
            cols = identity.columns(),
        );
        match tx.execute_batch(&unique) {
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(IngestError::Config(format!(
                    "cannot switch identity to '{}': {} holds several rows per item",
                    identity.as_str(),
                    table
                )));
            }
            other => other?,
        }
    }

    tx.execute(
        "INSERT INTO meta (key, value) VALUES ('identity', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [identity.as_str()],
    )?;
    tx.commit()?;

    if let Some(previous) = previous.filter(|p| p != identity.as_str()) {
        info!(from = %previous, to = identity.as_str(), "store identity switched");
    }
    Ok(())
}

// ── Tests ──
