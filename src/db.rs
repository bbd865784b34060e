use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::pipeline::RunReport;
use crate::store::{CredentialSource, Credentials, StoreError};

pub const ACCESS_KEY_ID: &str = "aws_access_key_id";
pub const SECRET_ACCESS_KEY: &str = "aws_secret_access_key";

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS settings (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS runs (
            id                INTEGER PRIMARY KEY,
            location          TEXT NOT NULL,
            source            TEXT NOT NULL,
            found             INTEGER NOT NULL,
            written           INTEGER NOT NULL,
            batches_ok        INTEGER NOT NULL,
            batches_failed    INTEGER NOT NULL,
            error             TEXT,
            created_at        TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);
        ",
    )?;
    Ok(())
}

// ── Settings ──

pub fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |r| r.get(0))
        .optional()?;
    Ok(value)
}

pub fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn save_credentials(conn: &Connection, access_key_id: &str, secret_access_key: &str) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    set_setting(&tx, ACCESS_KEY_ID, access_key_id)?;
    set_setting(&tx, SECRET_ACCESS_KEY, secret_access_key)?;
    tx.commit()?;
    Ok(())
}

/// Reads the key pair from the settings table on every load, so a
/// `configure` from another process is picked up without a restart.
#[derive(Debug, Clone)]
pub struct SqliteCredentials {
    path: PathBuf,
}

impl SqliteCredentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SqliteCredentials { path: path.into() }
    }

    fn read(&self) -> Result<(Option<String>, Option<String>)> {
        let conn = connect(&self.path)?;
        init_schema(&conn)?;
        Ok((get_setting(&conn, ACCESS_KEY_ID)?, get_setting(&conn, SECRET_ACCESS_KEY)?))
    }
}

impl CredentialSource for SqliteCredentials {
    fn load(&self) -> Result<Credentials, StoreError> {
        match self.read().map_err(StoreError::Database)? {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Ok(Credentials {
                access_key_id: id,
                secret_access_key: secret,
            }),
            _ => Err(StoreError::CredentialsMissing),
        }
    }
}

// ── Runs ──

pub fn insert_run(conn: &Connection, report: &RunReport) -> Result<i64> {
    conn.execute(
        "INSERT INTO runs (location, source, found, written, batches_ok, batches_failed, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            report.location,
            report.source.as_str(),
            report.found as i64,
            report.written as i64,
            report.succeeded_batches as i64,
            report.failed_batches as i64,
            report.error,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub struct Stats {
    pub runs: usize,
    pub failed_runs: usize,
    pub found: usize,
    pub written: usize,
    pub batches_ok: usize,
    pub batches_failed: usize,
    pub last_run: Option<String>,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let (runs, found, written, batches_ok, batches_failed): (usize, usize, usize, usize, usize) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(found), 0), COALESCE(SUM(written), 0),
                    COALESCE(SUM(batches_ok), 0), COALESCE(SUM(batches_failed), 0)
             FROM runs",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )?;
    let failed_runs: usize = conn.query_row(
        "SELECT COUNT(*) FROM runs WHERE error IS NOT NULL OR batches_failed > 0",
        [],
        |r| r.get(0),
    )?;
    let last_run: Option<String> =
        conn.query_row("SELECT MAX(created_at) FROM runs", [], |r| r.get(0))?;
    Ok(Stats { runs, failed_runs, found, written, batches_ok, batches_failed, last_run })
}
