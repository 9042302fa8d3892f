//! UsageIndex - a durable, dual-keyed map of registry tags to access times.
//!
//! Backed by a redb database with two tables kept in lockstep inside single
//! write transactions:
//!
//! - `images`: `repo:tag` -> access-time key
//! - `access`: access-time key -> `repo:tag`
//!
//! The inverse table gives the cleaner ordered iteration by access time;
//! the forward table locates the stale inverse row on update. redb commits
//! are durable, so a crash can never leave one table updated without the
//! other.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tagkeep_core::{TagEntry, decode_access_time, encode_access_time};
use tracing::warn;

const BY_NAME: TableDefinition<&str, &str> = TableDefinition::new("images");
const BY_TIME: TableDefinition<&str, &str> = TableDefinition::new("access");

const DB_FILE: &str = "usage.db";

/// Durable usage index. Cheap to clone; clones share one database.
#[derive(Clone)]
pub struct UsageIndex {
    db: Arc<Database>,
}

impl UsageIndex {
    /// Opens (or creates) `usage.db` under `dir` and ensures both tables
    /// exist. Safe to call on an existing database; no data is touched.
    pub fn open<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(DB_FILE);
        let db = Database::create(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        // Create both tables up front so a fresh database serves its first
        // read without erroring.
        {
            let write_txn = db.begin_write()?;
            {
                let _ = write_txn.open_table(BY_NAME)?;
                let _ = write_txn.open_table(BY_TIME)?;
            }
            write_txn.commit()?;
        }

        Ok(Self { db: Arc::new(db) })
    }

    /// Records an access. A repeated observation with an unchanged access
    /// time performs no writes; a newer time atomically retires the stale
    /// inverse row and inserts the new one.
    pub async fn observe(&self, entry: &TagEntry) -> anyhow::Result<()> {
        let db = self.db.clone();
        let name = entry.name();
        let time_key = encode_access_time(&entry.access_time);

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let write_txn = db.begin_write()?;
            let mut dirty = false;
            {
                let mut by_name = write_txn.open_table(BY_NAME)?;
                let previous = by_name.get(name.as_str())?.map(|g| g.value().to_string());
                if previous.as_deref() != Some(time_key.as_str()) {
                    by_name.insert(name.as_str(), time_key.as_str())?;
                    let mut by_time = write_txn.open_table(BY_TIME)?;
                    if let Some(old) = &previous {
                        by_time.remove(old.as_str())?;
                    }
                    by_time.insert(time_key.as_str(), name.as_str())?;
                    dirty = true;
                }
            }
            if dirty {
                write_txn.commit()?;
            } else {
                write_txn.abort()?;
            }
            Ok(())
        })
        .await
        .map_err(|e| anyhow::anyhow!("index write task failed: {}", e))?
    }

    /// Deletes both sides of an entry. Idempotent: either side may already
    /// be gone.
    pub async fn remove(&self, entry: &TagEntry) -> anyhow::Result<()> {
        let db = self.db.clone();
        let name = entry.name();
        let time_key = encode_access_time(&entry.access_time);

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let write_txn = db.begin_write()?;
            {
                let mut by_time = write_txn.open_table(BY_TIME)?;
                by_time.remove(time_key.as_str())?;
                let mut by_name = write_txn.open_table(BY_NAME)?;
                by_name.remove(name.as_str())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow::anyhow!("index write task failed: {}", e))?
    }

    /// All entries in ascending access-time order (least recently used
    /// first). Rows that fail to decode are skipped with a warning.
    pub async fn lru_list(&self) -> anyhow::Result<Vec<TagEntry>> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<TagEntry>> {
            let read_txn = db.begin_read()?;
            let by_time = read_txn.open_table(BY_TIME)?;

            let mut entries = Vec::new();
            for row in by_time.range::<&str>(..)? {
                let (time_key, name) = row?;
                let access_time = match decode_access_time(time_key.value()) {
                    Ok(t) => t,
                    Err(err) => {
                        warn!(key = time_key.value(), %err, "skipping undecodable access key");
                        continue;
                    }
                };
                match TagEntry::from_name(name.value(), access_time) {
                    Some(entry) => entries.push(entry),
                    None => warn!(name = name.value(), "skipping malformed index entry"),
                }
            }
            Ok(entries)
        })
        .await
        .map_err(|e| anyhow::anyhow!("index read task failed: {}", e))?
    }

    #[cfg(test)]
    fn dump(&self) -> anyhow::Result<(Vec<(String, String)>, Vec<(String, String)>)> {
        let read_txn = self.db.begin_read()?;
        let mut names = Vec::new();
        let by_name = read_txn.open_table(BY_NAME)?;
        for row in by_name.range::<&str>(..)? {
            let (k, v) = row?;
            names.push((k.value().to_string(), v.value().to_string()));
        }
        let mut times = Vec::new();
        let by_time = read_txn.open_table(BY_TIME)?;
        for row in by_time.range::<&str>(..)? {
            let (k, v) = row?;
            times.push((k.value().to_string(), v.value().to_string()));
        }
        Ok((names, times))
    }
}

impl std::fmt::Debug for UsageIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageIndex").finish()
    }
}
