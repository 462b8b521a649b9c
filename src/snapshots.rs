// =============================================================================
// Snapshot Store — durable namespaced key-value state with TTL
// =============================================================================
//
// Backs engine restart recovery (`chase:<id>`, `momentum:<id>`) and the
// external price cache (`price:<SYMBOL>`). Values are JSON strings; expiry is
// enforced on read and by a periodic purge. Failures here are non-fatal for
// callers: engines log and keep running without persistence.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Durable KV store with per-key TTLs, shared behind `Arc`.
#[derive(Clone)]
pub struct SnapshotStore {
    conn: Arc<Mutex<Connection>>,
}

impl SnapshotStore {
    /// Open (or create) the store at `db_path`.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open snapshot store")?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory snapshot store")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS snapshots (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_snapshots_expiry ON snapshots(expires_at)",
            [],
        )?;

        info!("snapshot store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Upsert `key` with a TTL in seconds.
    pub async fn set(&self, key: &str, value: &str, ttl_secs: i64) -> Result<()> {
        let expires_at = crate::types::now_ms() + ttl_secs * 1000;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO snapshots (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3",
            params![key, value, expires_at],
        )
        .with_context(|| format!("snapshot set {key}"))?;
        Ok(())
    }

    /// Fetch `key` if present and unexpired.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = crate::types::now_ms();
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT value, expires_at FROM snapshots WHERE key = ?1")
            .context("snapshot get prepare")?;
        let row: Option<(String, i64)> = stmt
            .query_row(params![key], |r| Ok((r.get(0)?, r.get(1)?)))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .with_context(|| format!("snapshot get {key}"))?;

        match row {
            Some((value, expires_at)) if expires_at > now => Ok(Some(value)),
            Some(_) => {
                conn.execute("DELETE FROM snapshots WHERE key = ?1", params![key])
                    .ok();
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM snapshots WHERE key = ?1", params![key])
            .with_context(|| format!("snapshot delete {key}"))?;
        Ok(())
    }

    /// All unexpired keys starting with `prefix`, with their values.
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let now = crate::types::now_ms();
        let pattern = format!("{prefix}%");
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT key, value FROM snapshots
                 WHERE key LIKE ?1 AND expires_at > ?2
                 ORDER BY key",
            )
            .context("snapshot list prepare")?;
        let rows = stmt
            .query_map(params![pattern, now], |r| Ok((r.get(0)?, r.get(1)?)))
            .context("snapshot list")?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Drop expired rows. Returns the number purged.
    pub async fn purge_expired(&self) -> Result<usize> {
        let now = crate::types::now_ms();
        let conn = self.conn.lock().await;
        let purged = conn
            .execute("DELETE FROM snapshots WHERE expires_at <= ?1", params![now])
            .context("snapshot purge")?;
        if purged > 0 {
            debug!(purged, "expired snapshots purged");
        }
        Ok(purged)
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let store = SnapshotStore::open_in_memory().unwrap();
        store.set("chase:abc", r#"{"id":"abc"}"#, 60).await.unwrap();
        assert_eq!(
            store.get("chase:abc").await.unwrap(),
            Some(r#"{"id":"abc"}"#.to_string())
        );
        store.delete("chase:abc").await.unwrap();
        assert_eq!(store.get("chase:abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_keys_are_invisible_and_purgeable() {
        let store = SnapshotStore::open_in_memory().unwrap();
        store.set("momentum:x", "{}", -1).await.unwrap(); // already expired
        assert_eq!(store.get("momentum:x").await.unwrap(), None);
        store.set("momentum:y", "{}", 60).await.unwrap();
        store.set("momentum:z", "{}", -1).await.unwrap();
        let purged = store.purge_expired().await.unwrap();
        assert_eq!(purged, 1); // x was purged on read, z by the sweep
        let keys = store.list_prefix("momentum:").await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].0, "momentum:y");
    }

    #[tokio::test]
    async fn list_prefix_is_namespaced() {
        let store = SnapshotStore::open_in_memory().unwrap();
        store.set("chase:1", "a", 60).await.unwrap();
        store.set("chase:2", "b", 60).await.unwrap();
        store.set("price:BTC", "c", 60).await.unwrap();
        let chases = store.list_prefix("chase:").await.unwrap();
        assert_eq!(chases.len(), 2);
        let prices = store.list_prefix("price:").await.unwrap();
        assert_eq!(prices.len(), 1);
    }

    #[tokio::test]
    async fn upsert_overwrites_value_and_ttl() {
        let store = SnapshotStore::open_in_memory().unwrap();
        store.set("k", "v1", 60).await.unwrap();
        store.set("k", "v2", 60).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v2".to_string()));
    }
}
