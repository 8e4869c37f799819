use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use tracing::debug;

use crate::data::ViewHistory;

const DEFAULT_INSTANCE_KEY: &str = "default_instance";

/// Schema steps, applied in order. `PRAGMA user_version` records how many ran.
const MIGRATIONS: &[&str] = &[r#"
CREATE TABLE IF NOT EXISTS post_views (
  instance TEXT NOT NULL,
  post_id TEXT NOT NULL,
  viewed_at INTEGER NOT NULL,
  PRIMARY KEY (instance, post_id)
);

CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
"#];

/// Per-instance view history plus a few reader settings, in one SQLite file.
/// The connection closes when the store is dropped.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let mut conn = Connection::open(&path)
            .with_context(|| format!("storage: open view history at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: enable WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("storage: set busy timeout")?;
        let applied = upgrade_schema(&mut conn)?;
        if applied > 0 {
            debug!(path = %path.display(), applied, "view history schema upgraded");
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of schema steps recorded in the database file.
    pub fn schema_version(&self) -> Result<usize> {
        let conn = self.conn.lock();
        schema_version(&conn)
    }

    pub fn last_viewed(&self, instance: &str, post_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let millis: Option<i64> = conn
            .query_row(
                r#"
SELECT viewed_at
FROM post_views
WHERE instance = ?1 AND post_id = ?2
"#,
                params![instance, post_id],
                |row| row.get(0),
            )
            .optional()
            .context("storage: query post view")?;
        Ok(millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
    }

    pub fn record_views(&self, instance: &str, views: &HashMap<String, DateTime<Utc>>) -> Result<()> {
        if instance.is_empty() {
            bail!("storage: instance required for post views");
        }
        if views.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("storage: begin post views")?;
        {
            let mut stmt = tx.prepare(
                r#"
INSERT INTO post_views (instance, post_id, viewed_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(instance, post_id) DO UPDATE SET
  viewed_at = excluded.viewed_at
"#,
            )?;
            for (post_id, at) in views {
                stmt.execute(params![instance, post_id, at.timestamp_millis()])?;
            }
        }
        tx.commit().context("storage: commit post views")
    }

    pub fn view_count(&self, instance: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM post_views WHERE instance = ?1",
            params![instance],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// The instance the reader used last, picked when none is given.
    pub fn default_instance(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![DEFAULT_INSTANCE_KEY],
            |row| row.get(0),
        )
        .optional()
        .context("storage: query default instance")
    }

    pub fn set_default_instance(&self, host: &str) -> Result<()> {
        if host.trim().is_empty() {
            bail!("storage: instance host required");
        }
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO settings (key, value)
VALUES (?1, ?2)
ON CONFLICT(key) DO UPDATE SET
  value = excluded.value
"#,
            params![DEFAULT_INSTANCE_KEY, host.trim()],
        )?;
        Ok(())
    }
}

impl ViewHistory for Store {
    fn get(&self, instance: &str, post_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.last_viewed(instance, post_id)
    }

    fn put_batch(&self, instance: &str, views: &HashMap<String, DateTime<Utc>>) -> Result<()> {
        self.record_views(instance, views)
    }
}

fn schema_version(conn: &Connection) -> Result<usize> {
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .context("storage: read schema version")?;
    Ok(version.max(0) as usize)
}

/// Runs the steps past the recorded version inside one transaction and
/// returns how many were applied.
fn upgrade_schema(conn: &mut Connection) -> Result<usize> {
    let current = schema_version(conn)?;
    if current > MIGRATIONS.len() {
        bail!(
            "storage: view history schema {current} is newer than this build ({})",
            MIGRATIONS.len()
        );
    }
    let pending = &MIGRATIONS[current..];
    if pending.is_empty() {
        return Ok(0);
    }

    let tx = conn.transaction().context("storage: begin schema upgrade")?;
    for step in pending {
        tx.execute_batch(step).context("storage: apply schema step")?;
    }
    tx.pragma_update(None, "user_version", MIGRATIONS.len() as i64)?;
    tx.commit().context("storage: commit schema upgrade")?;
    Ok(pending.len())
}

pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("treeder").join("views.db"))
}
