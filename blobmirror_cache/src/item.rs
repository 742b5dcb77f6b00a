//! Per-key cache entries and their lifecycle.
//!
//! An [`Item`] is created on the first lookup of its key and then mutated by
//! exactly three activities: a single-flight existence probe, a
//! single-flight download, and expiration. Probe and download results are
//! fanned out through `watch` channels so that any number of callers share
//! one underlying operation; while a download is running, its progress is
//! published the same way for tailing readers.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use blobmirror_core::{BlobStore, CacheError};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::cache::CacheShared;
use crate::reader::{ItemReader, TailHandles};

/// Lifecycle states of a cached item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Known key, nothing probed yet.
    Created,
    /// Existence probe in flight.
    Querying,
    /// The remote answered NotFound; cached as such.
    NotFound,
    /// The remote object exists and its metadata is recorded.
    Found,
    /// A download is writing the local cache file.
    Active,
    /// The local cache file holds the complete object.
    Downloaded,
    /// Terminal; the item has been removed from the cache.
    Expired,
}

impl ItemState {
    pub(crate) fn name(self) -> &'static str {
        match self {
            ItemState::Created => "Created",
            ItemState::Querying => "Querying",
            ItemState::NotFound => "NotFound",
            ItemState::Found => "Found",
            ItemState::Active => "Active",
            ItemState::Downloaded => "Downloaded",
            ItemState::Expired => "Expired",
        }
    }
}

/// Point-in-time view of an item, taken by the expirer while it holds the
/// cache lock.
pub(crate) struct ItemSnapshot {
    pub key: String,
    pub state: ItemState,
    pub last_accessed: Instant,
    pub expires_at: Instant,
    pub available: u64,
    pub never_expires: bool,
}

struct ItemInner {
    state: ItemState,
    last_accessed: Instant,
    expires_at: Instant,
    full_length: u64,
    last_modified: DateTime<Utc>,
    available: u64,
    local_path: Option<PathBuf>,
    exists_rx: Option<watch::Receiver<Option<bool>>>,
    download_rx: Option<watch::Receiver<Option<bool>>>,
    progress_rx: Option<watch::Receiver<u64>>,
}

impl ItemInner {
    fn exists_resolved_true(&self) -> bool {
        self.exists_rx
            .as_ref()
            .is_some_and(|rx| *rx.borrow() == Some(true))
    }
}

struct ItemShared {
    key: String,
    never_expires: bool,
    store: Arc<dyn BlobStore>,
    cache: Weak<CacheShared>,
    inner: Mutex<ItemInner>,
}

/// One cached remote object: state machine, remote metadata, the local file
/// and the fan-out primitives shared by concurrent callers.
///
/// `Item` is a cheap handle; clones refer to the same entry. The owning
/// [`crate::Cache`] is referenced through a non-owning handle, so an item
/// outliving its cache simply stops reporting.
#[derive(Clone)]
pub struct Item {
    shared: Arc<ItemShared>,
}

impl Item {
    pub(crate) fn new(
        key: String,
        never_expires: bool,
        store: Arc<dyn BlobStore>,
        cache: Weak<CacheShared>,
        validity_period: Duration,
    ) -> Self {
        let now = Instant::now();
        Item {
            shared: Arc::new(ItemShared {
                key,
                never_expires,
                store,
                cache,
                inner: Mutex::new(ItemInner {
                    state: ItemState::Created,
                    last_accessed: now,
                    expires_at: now + validity_period,
                    full_length: 0,
                    last_modified: DateTime::UNIX_EPOCH,
                    available: 0,
                    local_path: None,
                    exists_rx: None,
                    download_rx: None,
                    progress_rx: None,
                }),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// True when both handles refer to the same cache entry.
    pub fn ptr_eq(&self, other: &Item) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn state(&self) -> ItemState {
        self.shared.inner.lock().state
    }

    /// Remote-reported size; valid once the item has been found.
    pub fn full_length(&self) -> u64 {
        self.shared.inner.lock().full_length
    }

    /// Remote-reported modification time; the epoch when the remote did not
    /// supply one.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.shared.inner.lock().last_modified
    }

    /// Bytes currently flushed to the local cache file.
    pub fn available(&self) -> u64 {
        self.shared.inner.lock().available
    }

    pub fn local_path(&self) -> Option<PathBuf> {
        self.shared.inner.lock().local_path.clone()
    }

    pub fn never_expires(&self) -> bool {
        self.shared.never_expires
    }

    pub(crate) fn touch(&self, now: Instant) {
        self.shared.inner.lock().last_accessed = now;
    }

    pub(crate) fn is_stale(&self, now: Instant) -> bool {
        !self.shared.never_expires && self.shared.inner.lock().expires_at < now
    }

    pub(crate) fn snapshot(&self) -> ItemSnapshot {
        let inner = self.shared.inner.lock();
        ItemSnapshot {
            key: self.shared.key.clone(),
            state: inner.state,
            last_accessed: inner.last_accessed,
            expires_at: inner.expires_at,
            available: inner.available,
            never_expires: self.shared.never_expires,
        }
    }

    /// Resolves whether the remote object exists, probing it at most once.
    /// The answer is shared by every caller and stays resolved until the
    /// item expires.
    pub async fn exists(&self) -> Result<bool, CacheError> {
        let mut rx = self.ensure_probe();
        let resolved = *rx
            .wait_for(|v| v.is_some())
            .await
            .map_err(|_| CacheError::Remote {
                key: self.shared.key.clone(),
                message: "existence probe aborted".to_string(),
            })?;
        Ok(resolved.unwrap_or(false))
    }

    fn ensure_probe(&self) -> watch::Receiver<Option<bool>> {
        let mut inner = self.shared.inner.lock();
        if let Some(rx) = &inner.exists_rx {
            return rx.clone();
        }
        let (tx, rx) = watch::channel(None);
        inner.exists_rx = Some(rx.clone());
        if inner.state == ItemState::Created {
            inner.state = ItemState::Querying;
        }
        drop(inner);

        let item = self.clone();
        tokio::spawn(async move { item.probe(tx).await });
        rx
    }

    async fn probe(&self, tx: watch::Sender<Option<bool>>) {
        let key = self.shared.key.as_str();
        let found = match self.shared.store.stat(key).await {
            Ok(stat) => match stat.length {
                Some(length) => Some((length, stat.last_modified)),
                None => {
                    log::warn!(key = key; "remote reports no length, treating as not found");
                    None
                }
            },
            Err(err) if err.is_not_found() => {
                log::debug!(key = key; "remote object not found");
                None
            }
            Err(err) => {
                log::warn!(key = key, error = err.to_string().as_str(); "existence probe failed");
                None
            }
        };

        let report_not_found = {
            let mut inner = self.shared.inner.lock();
            if inner.state == ItemState::Querying {
                match found {
                    Some((length, modified)) => {
                        inner.full_length = length;
                        inner.last_modified = modified;
                        inner.state = ItemState::Found;
                        false
                    }
                    None => {
                        inner.state = ItemState::NotFound;
                        true
                    }
                }
            } else {
                false
            }
        };
        if report_not_found {
            if let Some(cache) = self.shared.cache.upgrade() {
                cache.report_not_found();
            }
        }
        tx.send_replace(Some(found.is_some()));
    }

    /// Ensures the object is fully downloaded, sharing one transfer across
    /// all callers. Probes existence first when that has not happened yet.
    /// Resolves `true` on completion and `false` when the attempt failed.
    pub async fn download(&self) -> Result<bool, CacheError> {
        if !self.exists().await? {
            return Err(CacheError::NotFound {
                key: self.shared.key.clone(),
            });
        }
        let mut rx = self.ensure_download()?;
        let resolved = *rx
            .wait_for(|v| v.is_some())
            .await
            .map_err(|_| CacheError::Remote {
                key: self.shared.key.clone(),
                message: "download task aborted".to_string(),
            })?;
        Ok(resolved.unwrap_or(false))
    }

    /// Ensures a download attempt is running or already finished, without
    /// waiting for the outcome.
    pub fn start_download(&self) -> Result<(), CacheError> {
        self.ensure_download().map(|_| ())
    }

    fn download_ready(&self, inner: &ItemInner) -> Result<(), CacheError> {
        match inner.state {
            ItemState::Found => Ok(()),
            // A failed attempt reverts to Created but keeps the resolved
            // existence answer and metadata; a retry re-enters from here.
            ItemState::Created if inner.exists_resolved_true() => Ok(()),
            ItemState::NotFound => Err(CacheError::NotFound {
                key: self.shared.key.clone(),
            }),
            other => Err(CacheError::InvalidState {
                op: "download",
                state: other.name(),
            }),
        }
    }

    fn ensure_download(&self) -> Result<watch::Receiver<Option<bool>>, CacheError> {
        {
            let inner = self.shared.inner.lock();
            if let Some(rx) = &inner.download_rx {
                return Ok(rx.clone());
            }
            self.download_ready(&inner)?;
        }

        let cache = self.shared.cache.upgrade().ok_or(CacheError::Disposed)?;
        let path = cache.alloc_temp_path();
        let file = std::fs::OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut inner = self.shared.inner.lock();
        if let Some(rx) = &inner.download_rx {
            // Lost the race against another caller; discard our candidate.
            let rx = rx.clone();
            drop(inner);
            let _ = std::fs::remove_file(&path);
            return Ok(rx);
        }
        if let Err(err) = self.download_ready(&inner) {
            drop(inner);
            let _ = std::fs::remove_file(&path);
            return Err(err);
        }

        inner.state = ItemState::Active;
        inner.available = 0;
        inner.local_path = Some(path);
        let (done_tx, done_rx) = watch::channel(None);
        let (progress_tx, progress_rx) = watch::channel(0u64);
        inner.download_rx = Some(done_rx.clone());
        inner.progress_rx = Some(progress_rx);
        drop(inner);

        let item = self.clone();
        tokio::spawn(async move { item.run_transfer(file, done_tx, progress_tx).await });
        Ok(done_rx)
    }

    async fn run_transfer(
        &self,
        file: std::fs::File,
        done_tx: watch::Sender<Option<bool>>,
        progress_tx: watch::Sender<u64>,
    ) {
        let key = self.shared.key.as_str();
        match self.transfer(file, &progress_tx).await {
            Ok(written) => {
                let completed = {
                    let mut inner = self.shared.inner.lock();
                    if inner.state == ItemState::Active {
                        inner.state = ItemState::Downloaded;
                        true
                    } else {
                        // Expired mid-transfer; nothing left to account for.
                        false
                    }
                };
                if completed {
                    if let Some(cache) = self.shared.cache.upgrade() {
                        cache.report_completed(written);
                    }
                    log::info!(key = key, length = written; "download completed");
                }
                done_tx.send_replace(Some(true));
            }
            Err(err) => {
                log::warn!(key = key, error = err.to_string().as_str(); "download failed");
                let path = {
                    let mut inner = self.shared.inner.lock();
                    let path = inner.local_path.take();
                    inner.available = 0;
                    inner.download_rx = None;
                    inner.progress_rx = None;
                    if inner.state == ItemState::Active {
                        inner.state = ItemState::Created;
                    }
                    path
                };
                if let Some(path) = path {
                    let _ = std::fs::remove_file(&path);
                }
                done_tx.send_replace(Some(false));
            }
        }
        // progress_tx drops here, waking any reader still waiting on it
    }

    async fn transfer(
        &self,
        file: std::fs::File,
        progress_tx: &watch::Sender<u64>,
    ) -> Result<u64, CacheError> {
        let full_length = self.shared.inner.lock().full_length;
        let mut stream = self.shared.store.open_read(&self.shared.key).await?;
        let mut file = tokio::fs::File::from_std(file);
        let mut written = 0u64;
        while let Some(chunk) = stream.try_next().await? {
            file.write_all(&chunk).await?;
            file.flush().await?;
            written += chunk.len() as u64;
            if written > full_length {
                return Err(CacheError::Remote {
                    key: self.shared.key.clone(),
                    message: format!("remote stream exceeded the reported length of {full_length}"),
                });
            }
            self.shared.inner.lock().available = written;
            progress_tx.send_replace(written);
        }
        if written != full_length {
            return Err(CacheError::Remote {
                key: self.shared.key.clone(),
                message: format!("remote stream ended at {written} of {full_length} bytes"),
            });
        }
        Ok(written)
    }

    /// Opens a reader over the local cache file.
    ///
    /// Legal in Active (tailing semantics) and Downloaded (plain file
    /// reader); any other state is a programming error.
    pub async fn local_reader(&self) -> Result<ItemReader, CacheError> {
        let (path, full_length, tail) = {
            let inner = self.shared.inner.lock();
            let internals = (
                inner.local_path.clone(),
                inner.download_rx.clone(),
                inner.progress_rx.clone(),
            );
            match (inner.state, internals) {
                (ItemState::Active, (Some(path), Some(download), Some(progress))) => (
                    path,
                    inner.full_length,
                    Some(TailHandles { download, progress }),
                ),
                (ItemState::Downloaded, (Some(path), _, _)) => (path, inner.full_length, None),
                (state, _) => {
                    return Err(CacheError::InvalidState {
                        op: "local_reader",
                        state: state.name(),
                    });
                }
            }
        };
        let file = tokio::fs::File::open(&path).await?;
        Ok(ItemReader::new(
            self.shared.key.clone(),
            file,
            full_length,
            tail,
        ))
    }

    /// Moves the item to its terminal state, reports the counter delta for
    /// its previous state and deletes the local file best-effort. Idempotent.
    ///
    /// Open readers keep working: the file is unlinked, not truncated, and
    /// their handles stay valid until closed.
    pub(crate) fn expire(&self) {
        let (prev, available, path) = {
            let mut inner = self.shared.inner.lock();
            if inner.state == ItemState::Expired {
                return;
            }
            let prev = inner.state;
            inner.state = ItemState::Expired;
            (prev, inner.available, inner.local_path.take())
        };
        if let Some(cache) = self.shared.cache.upgrade() {
            cache.report_expired(prev, available);
        }
        if let Some(path) = path {
            if let Err(err) = std::fs::remove_file(&path) {
                log::warn!(key = self.shared.key.as_str(), error = err.to_string().as_str(); "failed to remove cache file");
            }
        }
        log::debug!(key = self.shared.key.as_str(), prev = prev.name(); "expired");
    }
}
