use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use rusqlite::{params, Connection, OptionalExtension};

use super::{table_name_for, Backend, MetricTable, ResolvedSeries};
use crate::error::BackendError;
use crate::labels::Labels;
use crate::types::{InsertRows, SeriesId, Timestamp};

const CATALOG_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS _tsingest_metric (
        metric_name        TEXT NOT NULL PRIMARY KEY,
        table_name         TEXT NOT NULL UNIQUE,
        creation_completed INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS _tsingest_series (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        metric_name TEXT NOT NULL,
        labels      TEXT NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS _tsingest_label (
        series_id INTEGER NOT NULL,
        name      TEXT NOT NULL,
        value     TEXT NOT NULL,
        PRIMARY KEY (series_id, name)
    );";

/// [`Backend`] on a single SQLite database.
///
/// Each metric gets a `data_<table>` table keyed by `(series_id, time)`; the catalog lives in
/// `_tsingest_*` tables. SQLite has no compressed regions, so the recovery operations are
/// accepted and do nothing.
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let conn = Connection::open(path.as_ref()).map_err(|e| {
            BackendError::Connection(format!("cannot open {}: {}", path.as_ref().display(), e))
        })?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::with_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, BackendError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| BackendError::Connection(e.to_string()))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, BackendError> {
        conn.execute_batch(CATALOG_SCHEMA)?;
        Ok(SqliteBackend {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, BackendError> {
        self.conn
            .lock()
            .map_err(|e| BackendError::Connection(format!("sqlite connection poisoned: {}", e)))
    }

    /// Counts rows of the data table backing `table`.
    pub fn count_rows(&self, table: &str) -> Result<u64, BackendError> {
        let conn = self.lock()?;
        let sql = format!("SELECT COUNT(*) FROM {}", data_table(table));
        let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// True once table creation for `metric` has been finalized.
    pub fn is_finalized(&self, metric: &str) -> Result<bool, BackendError> {
        let conn = self.lock()?;
        let done: Option<i64> = conn
            .query_row(
                "SELECT creation_completed FROM _tsingest_metric WHERE metric_name = ?1",
                params![metric],
                |row| row.get(0),
            )
            .optional()?;
        Ok(done.unwrap_or(0) != 0)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn data_table(table: &str) -> String {
    quote_ident(&format!("data_{}", table))
}

/// Looks up the table of `metric`, registering and creating it when missing.
fn ensure_metric_table(conn: &Connection, metric: &str) -> Result<MetricTable, BackendError> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT table_name FROM _tsingest_metric WHERE metric_name = ?1",
            params![metric],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(table_name) = existing {
        return Ok(MetricTable {
            table_name,
            possibly_new: false,
        });
    }

    let taken = {
        let mut stmt = conn.prepare("SELECT table_name FROM _tsingest_metric")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<String>, _>>()?;
        names
    };
    let table_name = table_name_for(metric, &taken);
    conn.execute(
        "INSERT INTO _tsingest_metric (metric_name, table_name) VALUES (?1, ?2)",
        params![metric, table_name],
    )?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
             time      INTEGER NOT NULL,
             value     REAL NOT NULL,
             series_id INTEGER NOT NULL,
             PRIMARY KEY (series_id, time)
         ) WITHOUT ROWID;",
        data_table(&table_name)
    ))?;
    Ok(MetricTable {
        table_name,
        possibly_new: true,
    })
}

impl Backend for SqliteBackend {
    fn resolve_or_create_table(&self, metric: &str) -> Result<MetricTable, BackendError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let table = ensure_metric_table(&tx, metric)?;
        tx.commit()?;
        Ok(table)
    }

    fn finalize_pending_table_creation(&self) -> Result<(), BackendError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let pending = {
            let mut stmt =
                tx.prepare("SELECT table_name FROM _tsingest_metric WHERE creation_completed = 0")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<String>, _>>()?;
            names
        };
        for table in &pending {
            tx.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (time);",
                quote_ident(&format!("data_{}_time_idx", table)),
                data_table(table)
            ))?;
            tx.execute(
                "UPDATE _tsingest_metric SET creation_completed = 1 WHERE table_name = ?1",
                params![table],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn resolve_series_batch(
        &self,
        metric: &str,
        series: &[&Labels],
    ) -> Result<Vec<ResolvedSeries>, BackendError> {
        let mut conn = self.lock()?;
        let mut out = Vec::with_capacity(series.len());
        for labels in series {
            // One transaction per label set.
            let tx = conn.transaction()?;
            let table_name = ensure_metric_table(&tx, metric)?.table_name;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO _tsingest_series (metric_name, labels) VALUES (?1, ?2)",
                params![metric, labels.canonical()],
            )?;
            let id: i64 = tx.query_row(
                "SELECT id FROM _tsingest_series WHERE labels = ?1",
                params![labels.canonical()],
                |row| row.get(0),
            )?;
            if inserted > 0 {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO _tsingest_label (series_id, name, value) VALUES (?1, ?2, ?3)",
                )?;
                for (name, value) in labels.iter() {
                    stmt.execute(params![id, name, value])?;
                }
            }
            tx.commit()?;
            out.push(ResolvedSeries {
                table_name,
                series_id: SeriesId(id),
            });
        }
        Ok(out)
    }

    fn bulk_insert(&self, table: &str, rows: &InsertRows) -> Result<u64, BackendError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut affected = 0u64;
        {
            let sql = format!(
                "INSERT OR IGNORE INTO {} (time, value, series_id) VALUES (?1, ?2, ?3)",
                data_table(table)
            );
            let mut stmt = tx.prepare_cached(&sql)?;
            for row in rows {
                affected += stmt.execute(params![row.timestamp, row.value, row.series_id.0])? as u64;
            }
        }
        tx.commit()?;
        Ok(affected)
    }

    fn reschedule_background_compaction(
        &self,
        _table: &str,
        _not_before: SystemTime,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    fn decompress_region(&self, _table: &str, _min_time: Timestamp) -> Result<(), BackendError> {
        Ok(())
    }
}
