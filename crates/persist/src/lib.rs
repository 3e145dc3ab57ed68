//! Keel persistence: SQLite store of free-tier workload records.
//! One row per project; the sweeper and the phase watcher read and update it.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use keel_core::{ProjectType, StatusKind, WorkloadRecord};
use metrics::{counter, histogram};
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

pub trait WorkloadStore: Send + Sync {
    /// Insert or overwrite the record for `rec.project_id`.
    fn upsert(&self, rec: &WorkloadRecord) -> Result<()>;
    fn get(&self, project_id: &str) -> Result<Option<WorkloadRecord>>;
    /// Move the project's record from `from` to `to`. Returns false when no record matched.
    fn transition(&self, project_id: &str, from: StatusKind, to: StatusKind) -> Result<bool>;
    /// Records in `status` of `project_type` whose last ingress is older than `cutoff` (unix seconds).
    fn find_stale(&self, status: StatusKind, project_type: ProjectType, cutoff: i64) -> Result<Vec<WorkloadRecord>>;
    fn delete_by_deployment(&self, deployment_id: &str) -> Result<usize>;
    fn touch_ingress(&self, project_id: &str, ts: i64) -> Result<bool>;
}

/// SQLite-backed store. Synchronous; every call is a single short statement.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KEEL_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    /// Open (or create) the database at `path`. `:memory:` gives a private in-memory db.
    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS workloads (
                project_id        TEXT PRIMARY KEY,
                deployment_id     TEXT NOT NULL,
                project_type      TEXT NOT NULL,
                status            TEXT NOT NULL,
                namespace         TEXT NOT NULL,
                last_ingressed_at INTEGER NOT NULL
            )",
            [],
        )
        .context("creating workloads table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_workloads_deployment ON workloads(deployment_id)", []).ok();
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_workloads_sweep ON workloads(status, project_type, last_ingressed_at)",
            [],
        )
        .ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path = %path, "workload store opened");
        Ok(Self { db: std::sync::Mutex::new(db) })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("workload store lock poisoned"))
    }
}

const COLUMNS: &str = "project_id, deployment_id, project_type, status, namespace, last_ingressed_at";

fn record_from(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn decode(raw: (String, String, String, String, String, i64)) -> Result<WorkloadRecord> {
    let (project_id, deployment_id, pt, status, namespace, last_ingressed_at) = raw;
    Ok(WorkloadRecord {
        project_type: pt.parse().with_context(|| format!("workload {} has bad project_type", project_id))?,
        status: status.parse().with_context(|| format!("workload {} has bad status", project_id))?,
        project_id,
        deployment_id,
        namespace,
        last_ingressed_at,
    })
}

impl WorkloadStore for SqliteStore {
    fn upsert(&self, rec: &WorkloadRecord) -> Result<()> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        db.execute(
            "INSERT INTO workloads(project_id, deployment_id, project_type, status, namespace, last_ingressed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(project_id) DO UPDATE SET
                deployment_id = excluded.deployment_id,
                project_type = excluded.project_type,
                status = excluded.status,
                namespace = excluded.namespace,
                last_ingressed_at = excluded.last_ingressed_at",
            params![
                rec.project_id,
                rec.deployment_id,
                rec.project_type.as_str(),
                rec.status.as_str(),
                rec.namespace,
                rec.last_ingressed_at
            ],
        )
        .with_context(|| format!("upserting workload {}", rec.project_id))?;
        histogram!("persist_upsert_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_upsert_total", 1u64);
        Ok(())
    }

    fn get(&self, project_id: &str) -> Result<Option<WorkloadRecord>> {
        let db = self.conn()?;
        let raw = db
            .query_row(&format!("SELECT {} FROM workloads WHERE project_id = ?1", COLUMNS), [project_id], record_from)
            .optional()?;
        raw.map(decode).transpose()
    }

    fn transition(&self, project_id: &str, from: StatusKind, to: StatusKind) -> Result<bool> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE workloads SET status = ?3 WHERE project_id = ?1 AND status = ?2",
            params![project_id, from.as_str(), to.as_str()],
        )?;
        Ok(n > 0)
    }

    fn find_stale(&self, status: StatusKind, project_type: ProjectType, cutoff: i64) -> Result<Vec<WorkloadRecord>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM workloads WHERE status = ?1 AND project_type = ?2 AND last_ingressed_at < ?3 ORDER BY last_ingressed_at",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![status.as_str(), project_type.as_str(), cutoff], record_from)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(decode(r?)?);
        }
        histogram!("persist_find_stale_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn delete_by_deployment(&self, deployment_id: &str) -> Result<usize> {
        let db = self.conn()?;
        let n = db.execute("DELETE FROM workloads WHERE deployment_id = ?1", [deployment_id])?;
        counter!("persist_delete_total", n as u64);
        Ok(n)
    }

    fn touch_ingress(&self, project_id: &str, ts: i64) -> Result<bool> {
        let db = self.conn()?;
        let n = db.execute("UPDATE workloads SET last_ingressed_at = ?2 WHERE project_id = ?1", params![project_id, ts])?;
        Ok(n > 0)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".keel");
        let _ = std::fs::create_dir_all(&p);
        p.push("keel.db");
        return p.to_string_lossy().to_string();
    }
    "keel.db".to_string()
}

pub fn now_ts() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}
