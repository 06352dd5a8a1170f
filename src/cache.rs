//! Small on-disk cache for lookups the dashboard repeats, such as the last scanner
//! selection used on a node.
//!
//! Each entry is `<key>.json` next to a `<key>.ts` sidecar holding the unix time it was
//! written. Entries older than the TTL, or without a readable sidecar, count as misses and
//! are deleted on sight.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct LookupCache {
    dir: PathBuf,
    ttl: Duration,
}

impl LookupCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let stem = sanitize(key);
        (
            self.dir.join(format!("{stem}.json")),
            self.dir.join(format!("{stem}.ts")),
        )
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create cache dir {}", self.dir.display()))?;
        let (data, stamp) = self.paths(key);
        let json = serde_json::to_vec(value).context("failed to serialize cache entry")?;
        fs::write(&data, json)
            .await
            .with_context(|| format!("failed to write {}", data.display()))?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        fs::write(&stamp, now.to_string())
            .await
            .with_context(|| format!("failed to write {}", stamp.display()))?;
        debug!(key, "cache put");
        Ok(())
    }

    /// `Ok(None)` on a miss, including expired and unreadable entries.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let (data, stamp) = self.paths(key);
        let written = match fs::read_to_string(&stamp).await {
            Ok(raw) => raw.trim().parse::<i64>().ok(),
            Err(_) => None,
        };
        let fresh = written.is_some_and(|at| {
            let age = OffsetDateTime::now_utc().unix_timestamp().saturating_sub(at);
            age >= 0 && (age as u64) < self.ttl.as_secs().max(1)
        });
        if !fresh {
            debug!(key, "cache miss");
            self.invalidate(key).await?;
            return Ok(None);
        }

        let raw = match fs::read(&data).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.invalidate(key).await?;
                return Ok(None);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", data.display()))
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(value) => {
                debug!(key, "cache hit");
                Ok(Some(value))
            }
            Err(err) => {
                warn!(key, error = %err, "dropping undecodable cache entry");
                self.invalidate(key).await?;
                Ok(None)
            }
        }
    }

    pub async fn invalidate(&self, key: &str) -> Result<()> {
        let (data, stamp) = self.paths(key);
        for path in [data, stamp] {
            remove_if_present(&path).await?;
        }
        Ok(())
    }

    /// Remove every entry. A missing directory is already clear.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to clear {}", self.dir.display()))
            }
        }
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

/// Map a key onto a safe file stem.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}
