//! SQLite-backed results table.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value;
use tracing::debug;

use super::{BatchRange, RecordFilter, RecordPatch, RecordStore, ResultRecord};
use crate::consolidate::MergePlan;
use crate::error::TallyError;
use crate::util::now_ms;

/// Set busy_timeout on every connection handed out by the pool.
/// Prevents SQLITE_BUSY when the writer and a merge transaction overlap.
#[derive(Debug)]
struct BusyTimeoutCustomizer;
impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for BusyTimeoutCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(())
    }
}

type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS results (
    id TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    prompt TEXT NOT NULL,
    uses TEXT NOT NULL DEFAULT '0',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_results_key ON results(provider, prompt);
CREATE INDEX IF NOT EXISTS idx_results_created ON results(created_at);

CREATE TABLE IF NOT EXISTS job_leases (
    name TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

const COLUMNS: &str = "id, provider, prompt, uses, created_at";

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (or create) a database. `":memory:"` gives a private database
    /// behind a single pooled connection. Shared-cache mode reports contention
    /// as SQLITE_LOCKED, which busy_timeout does not retry, so callers queue on
    /// the pool instead. The connection is never recycled, since closing it
    /// would drop the data.
    pub fn open(path: &str) -> Result<Self, TallyError> {
        let in_memory = path == ":memory:";
        let pool_size = if in_memory { 1 } else { 8 };
        let manager = if in_memory {
            let name = uuid::Uuid::new_v4().to_string();
            SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            SqliteConnectionManager::file(path)
        };
        let mut builder = Pool::builder().max_size(pool_size);
        if in_memory {
            builder = builder.idle_timeout(None).max_lifetime(None);
        }
        let pool = builder
            .connection_customizer(Box::new(BusyTimeoutCustomizer))
            .build(manager)
            .map_err(|e| TallyError::Internal(format!("pool: {e}")))?;

        let conn = pool.get().map_err(|e| TallyError::Internal(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConn, TallyError> {
        self.pool.get().map_err(|e| TallyError::Internal(format!("pool: {e}")))
    }

    pub fn select_sync(
        &self,
        filter: &RecordFilter,
        range: Option<BatchRange>,
    ) -> Result<Vec<ResultRecord>, TallyError> {
        let mut sql = format!("SELECT {COLUMNS} FROM results");
        let mut params: Vec<Value> = Vec::new();
        let pairs = filter.pairs();
        if !pairs.is_empty() {
            let clauses: Vec<String> = pairs
                .iter()
                .enumerate()
                .map(|(i, (col, _))| format!("{col} = ?{}", i + 1))
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
            params.extend(pairs.iter().map(|(_, v)| Value::Text((*v).to_string())));
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");
        if let Some(r) = range {
            let n = params.len();
            sql.push_str(&format!(" LIMIT ?{} OFFSET ?{}", n + 1, n + 2));
            params.push(Value::Integer(to_i64(r.limit)));
            params.push(Value::Integer(to_i64(r.offset)));
        }

        let c = self.conn()?;
        let mut stmt = c.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Returns whether a row was removed.
    pub fn delete_sync(&self, id: &str) -> Result<bool, TallyError> {
        let c = self.conn()?;
        let n = c.execute("DELETE FROM results WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    pub fn update_sync(&self, id: &str, patch: &RecordPatch) -> Result<(), TallyError> {
        let Some(uses) = patch.uses else {
            return Ok(());
        };
        let c = self.conn()?;
        let n = c.execute(
            "UPDATE results SET uses = ?1 WHERE id = ?2",
            rusqlite::params![uses.to_string(), id],
        )?;
        if n == 0 {
            return Err(TallyError::NotFound);
        }
        Ok(())
    }

    /// Delete losers and set the winner's total in one transaction. Rolls back
    /// if any row named by the plan is gone, since the total would no longer
    /// match what is stored.
    pub fn merge_sync(&self, plan: &MergePlan) -> Result<(), TallyError> {
        let mut c = self.conn()?;
        let tx = c.transaction()?;
        let mut deleted = 0usize;
        {
            let mut del = tx.prepare("DELETE FROM results WHERE id = ?1")?;
            for loser in &plan.losers {
                deleted += del.execute([loser.id.as_str()])?;
            }
        }
        if deleted != plan.losers.len() {
            return Err(TallyError::StaleGroup(format!(
                "{} of {} losers already gone",
                plan.losers.len() - deleted,
                plan.losers.len()
            )));
        }
        let updated = tx.execute(
            "UPDATE results SET uses = ?1 WHERE id = ?2",
            rusqlite::params![plan.total_uses.to_string(), plan.winner_id],
        )?;
        if updated == 0 {
            return Err(TallyError::StaleGroup(format!("winner {} is gone", plan.winner_id)));
        }
        tx.commit()?;
        Ok(())
    }

    /// Insert a fresh record the way an upstream writer would.
    pub fn insert(&self, provider: &str, prompt: &str, uses: i64) -> Result<ResultRecord, TallyError> {
        let rec = ResultRecord::new(uuid::Uuid::new_v4().to_string(), provider, prompt, uses, Utc::now());
        self.import(std::slice::from_ref(&rec))?;
        Ok(rec)
    }

    /// Insert records verbatim (ids, raw `uses` text and timestamps preserved).
    pub fn import(&self, records: &[ResultRecord]) -> Result<usize, TallyError> {
        let mut c = self.conn()?;
        let tx = c.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO results (id, provider, prompt, uses, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for r in records {
                stmt.execute(rusqlite::params![r.id, r.provider, r.prompt, r.uses, r.created_at])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    pub fn get(&self, id: &str) -> Result<Option<ResultRecord>, TallyError> {
        let c = self.conn()?;
        let mut stmt = c.prepare(&format!("SELECT {COLUMNS} FROM results WHERE id = ?1"))?;
        let mut rows = stmt.query_map([id], row_to_record)?;
        let found = rows.next().transpose()?;
        Ok(found)
    }

    pub fn count(&self, filter: &RecordFilter) -> Result<usize, TallyError> {
        Ok(self.select_sync(filter, None)?.len())
    }

    pub fn acquire_lease_sync(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool, TallyError> {
        let now = now_ms();
        let expires = now.saturating_add(ttl.as_millis() as i64);
        let c = self.conn()?;
        let n = c.execute(
            "INSERT INTO job_leases (name, holder, expires_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at \
             WHERE job_leases.expires_at <= ?4 OR job_leases.holder = excluded.holder",
            rusqlite::params![name, holder, expires, now],
        )?;
        Ok(n > 0)
    }

    pub fn release_lease_sync(&self, name: &str, holder: &str) -> Result<(), TallyError> {
        let c = self.conn()?;
        c.execute(
            "DELETE FROM job_leases WHERE name = ?1 AND holder = ?2",
            rusqlite::params![name, holder],
        )?;
        Ok(())
    }
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// `uses` keeps whatever the writer stored; integers and reals are rendered,
/// NULL becomes empty so the planner reports it as unparsable.
fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<ResultRecord> {
    let uses = match row.get::<_, Value>("uses")? {
        Value::Text(s) => s,
        Value::Integer(n) => n.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Null | Value::Blob(_) => String::new(),
    };
    Ok(ResultRecord {
        id: row.get("id")?,
        provider: row.get("provider")?,
        prompt: row.get("prompt")?,
        uses,
        created_at: row.get::<_, DateTime<Utc>>("created_at")?,
    })
}

/// Run a blocking store call on tokio's blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, TallyError>
where
    F: FnOnce() -> Result<T, TallyError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TallyError::Internal(e.to_string()))?
}

#[async_trait]
impl RecordStore for SqliteStore {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn select(
        &self,
        filter: &RecordFilter,
        range: Option<BatchRange>,
    ) -> Result<Vec<ResultRecord>, TallyError> {
        let store = self.clone();
        let filter = filter.clone();
        blocking(move || store.select_sync(&filter, range)).await
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), TallyError> {
        let store = self.clone();
        let owned = id.to_string();
        let removed = blocking(move || store.delete_sync(&owned)).await?;
        if !removed {
            debug!(id = %id, "delete: row already absent");
        }
        Ok(())
    }

    async fn update_by_id(&self, id: &str, patch: &RecordPatch) -> Result<(), TallyError> {
        let store = self.clone();
        let id = id.to_string();
        let patch = patch.clone();
        blocking(move || store.update_sync(&id, &patch)).await
    }

    fn is_transactional(&self) -> bool {
        true
    }

    async fn merge_atomic(&self, plan: &MergePlan) -> Result<(), TallyError> {
        let store = self.clone();
        let plan = plan.clone();
        blocking(move || store.merge_sync(&plan)).await
    }

    async fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool, TallyError> {
        let store = self.clone();
        let (name, holder) = (name.to_string(), holder.to_string());
        blocking(move || store.acquire_lease_sync(&name, &holder, ttl)).await
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), TallyError> {
        let store = self.clone();
        let (name, holder) = (name.to_string(), holder.to_string());
        blocking(move || store.release_lease_sync(&name, &holder)).await
    }
}

#[cfg(test)]
#[path = "sqlite_tests.rs"]
mod sqlite_tests;
