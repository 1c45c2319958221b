use std::{
    path::Path,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::{sync::Mutex, task};
use tracing::info;

/// Durable key/value store with per-entry expiry, backed by SQLite.
///
/// Every write is a single upsert, so readers observe either the previous or
/// the new payload for a key. Expired rows are treated as absent on read and
/// removed lazily.
pub struct SqliteStore {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create cache directory {}", parent.display())
                })?;
            }
        }

        let connection = Connection::open(path)
            .with_context(|| format!("Failed to open resolver cache at {}", path.display()))?;
        connection.execute(
            "CREATE TABLE IF NOT EXISTS resolver_cache (
                cache_key TEXT PRIMARY KEY,
                expires_at INTEGER NOT NULL,
                payload BLOB NOT NULL
            )",
            [],
        )?;
        connection.execute(
            "CREATE INDEX IF NOT EXISTS idx_resolver_cache_expiry ON resolver_cache(expires_at)",
            [],
        )?;
        let purged = connection.execute(
            "DELETE FROM resolver_cache WHERE expires_at <= ?1",
            params![current_epoch()],
        )?;

        info!(path = %path.display(), purged, "Opened resolver cache");
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(connection))),
        })
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        let conn = self.conn.clone();
        task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
            let guard = conn.blocking_lock();
            let conn = guard.as_ref().ok_or_else(|| anyhow!("resolver cache is closed"))?;
            let row: Option<(Vec<u8>, i64)> = conn
                .query_row(
                    "SELECT payload, expires_at FROM resolver_cache WHERE cache_key = ?1",
                    params![key.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                Some((payload, expires_at)) if expires_at > current_epoch() => Ok(Some(payload)),
                Some(_) => {
                    conn.execute(
                        "DELETE FROM resolver_cache WHERE cache_key = ?1",
                        params![key.as_str()],
                    )?;
                    Ok(None)
                }
                None => Ok(None),
            }
        })
        .await
        .context("Resolver cache lookup task failed")?
    }

    pub async fn put(&self, key: &str, payload: Vec<u8>, ttl: Duration) -> Result<()> {
        let expires_at = current_epoch() + ttl.as_secs() as i64;
        let key = key.to_string();
        let conn = self.conn.clone();
        task::spawn_blocking(move || -> Result<()> {
            let guard = conn.blocking_lock();
            let conn = guard.as_ref().ok_or_else(|| anyhow!("resolver cache is closed"))?;
            conn.execute(
                "INSERT INTO resolver_cache (cache_key, expires_at, payload)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(cache_key) DO UPDATE SET
                    expires_at = excluded.expires_at,
                    payload = excluded.payload",
                params![key, expires_at, payload],
            )?;
            Ok(())
        })
        .await
        .context("Resolver cache store task failed")?
    }

    /// Release the underlying database. Later calls to `get`/`put` fail;
    /// closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let conn = self.conn.lock().await.take();
        match conn {
            Some(conn) => conn
                .close()
                .map_err(|(_, err)| err)
                .context("Failed to close resolver cache"),
            None => Ok(()),
        }
    }
}

fn current_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;
    use tokio::time::sleep;

    #[tokio::test]
    async fn stores_and_retrieves_entry() -> Result<()> {
        let dir = tempdir()?;
        let store = SqliteStore::open(&dir.path().join("cache.sqlite"))?;

        store
            .put("node:42", b"{\"x\":1}".to_vec(), Duration::from_secs(60))
            .await?;
        assert_eq!(store.get("node:42").await?, Some(b"{\"x\":1}".to_vec()));
        assert_eq!(store.get("node:43").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn put_replaces_existing_entry() -> Result<()> {
        let dir = tempdir()?;
        let store = SqliteStore::open(&dir.path().join("cache.sqlite"))?;

        store.put("idcode:7", vec![1], Duration::from_secs(60)).await?;
        store.put("idcode:7", vec![2], Duration::from_secs(60)).await?;
        assert_eq!(store.get("idcode:7").await?, Some(vec![2]));
        Ok(())
    }

    #[tokio::test]
    async fn honours_entry_ttl() -> Result<()> {
        let dir = tempdir()?;
        let store = SqliteStore::open(&dir.path().join("cache.sqlite"))?;

        store.put("node:1", vec![42], Duration::from_secs(1)).await?;
        assert!(store.get("node:1").await?.is_some());

        sleep(Duration::from_secs(2)).await;
        assert!(store.get("node:1").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn entries_survive_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("cache.sqlite");
        let store = SqliteStore::open(&path)?;
        store.put("node:9", vec![9], Duration::from_secs(60)).await?;
        store.close().await?;

        let reopened = SqliteStore::open(&path)?;
        assert_eq!(reopened.get("node:9").await?, Some(vec![9]));
        Ok(())
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_later_access() -> Result<()> {
        let dir = tempdir()?;
        let store = SqliteStore::open(&dir.path().join("cache.sqlite"))?;
        store.close().await?;
        store.close().await?;
        assert!(store.get("node:1").await.is_err());
        assert!(store.put("node:1", vec![1], Duration::from_secs(1)).await.is_err());
        Ok(())
    }
}
