//! Token info cache
//!
//! Owns the (chain, address) -> TokenInfo map. Serves reads straight
//! from memory, refreshes all known entries on a fixed interval in a
//! background task and persists the map to a versioned JSON snapshot
//! on disk. Callers only ever see copies of entries.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::extract::ContractAddress;
use crate::price::{PriceSource, TokenInfo};

/// Bump when the snapshot layout changes; older files start empty
const CACHE_FILE_VERSION: u32 = 1;

/// Keys refreshed per upstream request during a tick
const REFRESH_CHUNK: usize = 30;

/// Cache behavior knobs
#[derive(Debug, Clone)]
pub struct TokenCacheConfig {
    /// Snapshot file location
    pub cache_file: PathBuf,
    /// Background refresh interval in seconds
    pub update_interval_secs: u64,
}

/// On-disk snapshot envelope.
///
/// Entries are kept as raw JSON values so a single corrupt record is
/// dropped on load instead of invalidating the whole file.
#[derive(Debug, Serialize, Deserialize)]
struct CacheSnapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    entries: Vec<serde_json::Value>,
}

/// One persisted map entry. The key is stored alongside the info
/// because the resolved network inside the info may differ from the
/// chain the address was extracted under.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    key: ContractAddress,
    info: TokenInfo,
}

struct CacheInner {
    entries: DashMap<ContractAddress, TokenInfo>,
    source: Arc<dyn PriceSource>,
    config: TokenCacheConfig,
}

impl CacheInner {
    /// Insert keeping `last_updated` monotonically non-decreasing
    fn store(&self, key: ContractAddress, mut info: TokenInfo) {
        if let Some(prev) = self.entries.get(&key) {
            if prev.last_updated > info.last_updated {
                info.last_updated = prev.last_updated;
            }
        }
        self.entries.insert(key, info);
    }

    /// Recompute the age-derived stale flag on an outgoing snapshot
    fn finalize(&self, mut info: TokenInfo) -> TokenInfo {
        let threshold = chrono::Duration::seconds((self.config.update_interval_secs * 2) as i64);
        info.stale = Utc::now().signed_duration_since(info.last_updated) > threshold;
        info
    }
}

/// Background-refreshed, disk-persisted token info store
pub struct TokenInfoCache {
    inner: Arc<CacheInner>,
    cancel: CancellationToken,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl TokenInfoCache {
    pub fn new(config: TokenCacheConfig, source: Arc<dyn PriceSource>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                source,
                config,
            }),
            cancel: CancellationToken::new(),
            refresh_task: Mutex::new(None),
        }
    }

    /// Load the persisted snapshot (if any) and launch the refresh loop.
    ///
    /// Returns once the initial load completes; the loop keeps running
    /// until [`stop`](Self::stop). A missing or malformed snapshot file
    /// is never fatal.
    pub async fn start(&self) -> Result<()> {
        let mut task = self.refresh_task.lock().await;
        if task.is_some() {
            return Err(Error::Lifecycle("token cache already started".to_string()));
        }

        self.load_from_disk().await;

        let inner = self.inner.clone();
        let cancel = self.cancel.clone();
        *task = Some(tokio::spawn(async move {
            refresh_loop(inner, cancel).await;
        }));

        info!(
            entries = self.inner.entries.len(),
            interval_secs = self.inner.config.update_interval_secs,
            "Token cache started"
        );
        Ok(())
    }

    /// Cancel the refresh loop, wait for it to wind down and flush the
    /// in-memory map to disk. Safe to call twice.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();

        let handle = self.refresh_task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Refresh task did not shut down cleanly: {}", e);
            }
        }

        self.save_to_disk().await?;
        info!("Token cache stopped");
        Ok(())
    }

    /// Memory-only read; never touches the network
    pub fn get(&self, key: &ContractAddress) -> Option<TokenInfo> {
        self.inner
            .entries
            .get(key)
            .map(|e| self.inner.finalize(e.clone()))
    }

    /// On-demand fetch for one key, updating the map on success.
    ///
    /// Upstream failures come back as typed errors; the map is left
    /// untouched in that case.
    pub async fn refresh_one(&self, key: &ContractAddress) -> Result<TokenInfo> {
        let info = self.inner.source.lookup(key).await?;
        self.inner.store(key.clone(), info.clone());
        Ok(self.inner.finalize(info))
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    async fn load_from_disk(&self) {
        let path = &self.inner.config.cache_file;
        if !path.exists() {
            info!("No cache snapshot at {}, starting empty", path.display());
            return;
        }

        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to read cache snapshot: {}, starting empty", e);
                return;
            }
        };

        let snapshot: CacheSnapshot = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Malformed cache snapshot: {}, starting empty", e);
                return;
            }
        };

        if snapshot.version != CACHE_FILE_VERSION {
            warn!(
                version = snapshot.version,
                expected = CACHE_FILE_VERSION,
                "Cache snapshot version mismatch, starting empty"
            );
            return;
        }

        let total = snapshot.entries.len();
        let mut dropped = 0usize;
        for value in snapshot.entries {
            match serde_json::from_value::<PersistedEntry>(value) {
                Ok(entry) => {
                    self.inner.entries.insert(entry.key, entry.info);
                }
                Err(e) => {
                    dropped += 1;
                    debug!("Dropping unparseable cache entry: {}", e);
                }
            }
        }

        if dropped > 0 {
            warn!(dropped, total, "Some cache entries failed to parse");
        }
        info!(
            loaded = self.inner.entries.len(),
            saved_at = %snapshot.saved_at,
            "Loaded cache snapshot"
        );
    }

    /// Write the snapshot atomically (temp file + rename) so a kill
    /// mid-write can't leave a half-written cache file behind
    async fn save_to_disk(&self) -> Result<()> {
        let path = &self.inner.config.cache_file;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::CachePersistence(e.to_string()))?;
            }
        }

        let entries: Vec<serde_json::Value> = self
            .inner
            .entries
            .iter()
            .filter_map(|e| {
                serde_json::to_value(PersistedEntry {
                    key: e.key().clone(),
                    info: e.value().clone(),
                })
                .ok()
            })
            .collect();

        let snapshot = CacheSnapshot {
            version: CACHE_FILE_VERSION,
            saved_at: Utc::now(),
            entries,
        };

        let data = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| Error::CachePersistence(e.to_string()))?;

        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| Error::CachePersistence(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::CachePersistence(e.to_string()))?;

        debug!(
            entries = self.inner.entries.len(),
            "Saved cache snapshot to {}",
            path.display()
        );
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

async fn refresh_loop(inner: Arc<CacheInner>, cancel: CancellationToken) {
    let period = Duration::from_secs(inner.config.update_interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; the initial load just happened,
    // so consume it and wait a full period.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => refresh_all(&inner, &cancel).await,
        }
    }
    debug!("Refresh loop exited");
}

/// One refresh tick: batch-fetch every known key in chunks.
///
/// A failed chunk never aborts the rest of the tick; its entries keep
/// their previous data and age into staleness. Cancellation is honored
/// between chunks and interrupts an in-flight fetch.
async fn refresh_all(inner: &Arc<CacheInner>, cancel: &CancellationToken) {
    let keys: Vec<ContractAddress> = inner.entries.iter().map(|e| e.key().clone()).collect();
    if keys.is_empty() {
        return;
    }

    debug!(keys = keys.len(), "Refresh tick starting");
    let mut updated = 0usize;
    let mut failed = 0usize;

    for chunk in keys.chunks(REFRESH_CHUNK) {
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Refresh tick interrupted");
                break;
            }
            res = inner.source.lookup_batch(chunk) => res,
        };

        match result {
            Ok(infos) => {
                let by_address: HashMap<&str, &ContractAddress> =
                    chunk.iter().map(|k| (k.address.as_str(), k)).collect();
                for info in infos {
                    let key = by_address.get(info.address.as_str()).map(|k| (*k).clone());
                    if let Some(key) = key {
                        inner.store(key, info);
                        updated += 1;
                    }
                }
            }
            Err(e) => {
                failed += chunk.len();
                warn!("Chunk refresh failed: {}", e);
            }
        }
    }

    info!(updated, failed, total = keys.len(), "Refresh tick complete");
}
