//! The cache directory: key lookup, resource accounting and eviction.
//!
//! A [`Cache`] owns the key-to-item map behind one mutex together with the
//! two counters it enforces limits on: the byte sum of fully downloaded
//! items and the number of cached not-found answers. Items report state
//! changes back through a non-owning handle; whenever a report pushes a
//! counter over its limit, a debounced trigger wakes the background expirer
//! for a sweep.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use blobmirror_core::{BlobStore, CacheError};
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::item::{Item, ItemSnapshot, ItemState};

const MIN_MAX_NOT_FOUND: u64 = 10;
const MIN_MAX_SIZE: u64 = 5 * 1024 * 1024;
const MIN_VALIDITY_PERIOD: Duration = Duration::from_secs(60 * 60);
const DEFAULT_TRIGGER_DEBOUNCE: Duration = Duration::from_secs(1);

/// Builder for a [`Cache`].
pub struct CacheBuilder {
    cache_path: PathBuf,
    max_size: u64,
    max_not_found: u64,
    validity_period: Duration,
    keep_forever: Option<Regex>,
    trigger_debounce: Duration,
}

impl CacheBuilder {
    pub fn new(cache_path: impl Into<PathBuf>) -> Self {
        CacheBuilder {
            cache_path: cache_path.into(),
            max_size: 10 * 1024 * 1024,
            max_not_found: 10 * 1024,
            validity_period: Duration::from_secs(24 * 60 * 60),
            keep_forever: None,
            trigger_debounce: DEFAULT_TRIGGER_DEBOUNCE,
        }
    }

    /// Cap on the byte sum of fully downloaded items. Clamped to at least
    /// 5 MiB.
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Cap on the number of cached not-found answers. Clamped to at least
    /// 10.
    pub fn with_max_not_found(mut self, max_not_found: u64) -> Self {
        self.max_not_found = max_not_found;
        self
    }

    /// How long an item stays valid after creation. Clamped to at least one
    /// hour.
    pub fn with_validity_period(mut self, validity_period: Duration) -> Self {
        self.validity_period = validity_period;
        self
    }

    /// Keys matching this pattern are exempt from time-based expiry. The
    /// size and not-found caps still apply to them.
    pub fn with_keep_forever(mut self, keep_forever: Regex) -> Self {
        self.keep_forever = Some(keep_forever);
        self
    }

    /// Debounce interval of the sweep trigger. Tunable so tests do not sit
    /// out the production jitter.
    pub fn with_trigger_debounce(mut self, trigger_debounce: Duration) -> Self {
        self.trigger_debounce = trigger_debounce;
        self
    }

    /// Creates the cache directory if missing, clamps the limits and spawns
    /// the background expirer. Must run inside a tokio runtime.
    pub fn build(self, store: Arc<dyn BlobStore>) -> Result<Cache, CacheError> {
        std::fs::create_dir_all(&self.cache_path)?;
        let shared = Arc::new(CacheShared {
            store,
            cache_path: self.cache_path,
            max_size: self.max_size.max(MIN_MAX_SIZE),
            max_not_found: self.max_not_found.max(MIN_MAX_NOT_FOUND),
            validity_period: self.validity_period.max(MIN_VALIDITY_PERIOD),
            keep_forever: self.keep_forever,
            state: Mutex::new(CacheState {
                items: HashMap::new(),
                current_size: 0,
                not_found_count: 0,
                disposed: false,
            }),
            trigger: Arc::new(ExpireTrigger {
                generation: AtomicU64::new(0),
                notify: Notify::new(),
                debounce: self.trigger_debounce,
            }),
            cancel: CancellationToken::new(),
        });
        let expirer = tokio::spawn(run_expirer(Arc::clone(&shared)));
        Ok(Cache {
            shared,
            expirer: Mutex::new(Some(expirer)),
        })
    }
}

struct CacheState {
    items: HashMap<String, Item>,
    current_size: u64,
    not_found_count: u64,
    disposed: bool,
}

/// Coalesces bursts of over-limit reports into single sweeps. A request
/// captures the current generation, sleeps the debounce interval and fires
/// only if the expirer has not rotated the generation in the meantime; a
/// rotation means a sweep is about to run and will observe the state that
/// prompted the request anyway.
struct ExpireTrigger {
    generation: AtomicU64,
    notify: Notify,
    debounce: Duration,
}

pub(crate) struct CacheShared {
    store: Arc<dyn BlobStore>,
    cache_path: PathBuf,
    max_size: u64,
    max_not_found: u64,
    validity_period: Duration,
    keep_forever: Option<Regex>,
    state: Mutex<CacheState>,
    trigger: Arc<ExpireTrigger>,
    cancel: CancellationToken,
}

impl CacheShared {
    pub(crate) fn alloc_temp_path(&self) -> PathBuf {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        self.cache_path
            .join(format!("dl-{millis}-{:08x}.part", rand::random::<u32>()))
    }

    pub(crate) fn report_completed(&self, length: u64) {
        let over_limit = {
            let mut state = self.state.lock();
            state.current_size += length;
            state.current_size > self.max_size
        };
        if over_limit {
            self.trigger_sweep();
        }
    }

    pub(crate) fn report_not_found(&self) {
        let over_limit = {
            let mut state = self.state.lock();
            state.not_found_count += 1;
            state.not_found_count > self.max_not_found
        };
        if over_limit {
            self.trigger_sweep();
        }
    }

    pub(crate) fn report_expired(&self, prev: ItemState, available: u64) {
        let mut state = self.state.lock();
        match prev {
            ItemState::NotFound => {
                state.not_found_count = state.not_found_count.saturating_sub(1);
            }
            ItemState::Downloaded => {
                state.current_size = state.current_size.saturating_sub(available);
            }
            _ => {}
        }
    }

    fn trigger_sweep(&self) {
        let trigger = Arc::clone(&self.trigger);
        let generation = trigger.generation.load(Ordering::Acquire);
        tokio::spawn(async move {
            tokio::time::sleep(trigger.debounce).await;
            if trigger.generation.load(Ordering::Acquire) == generation {
                trigger.notify.notify_one();
            }
        });
    }

    fn enforce_limits(&self) {
        let now = Instant::now();
        let evicted: Vec<Item> = {
            let mut state = self.state.lock();
            if state.disposed {
                state.items.drain().map(|(_, item)| item).collect()
            } else {
                let mut snapshots: Vec<ItemSnapshot> =
                    state.items.values().map(|item| item.snapshot()).collect();
                // Most recently accessed first; ties broken arbitrarily.
                snapshots.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
                compute_eviction(&snapshots, self.max_size, self.max_not_found, now)
                    .iter()
                    .filter_map(|key| state.items.remove(key))
                    .collect()
            }
        };
        if !evicted.is_empty() {
            log::info!(evicted = evicted.len(); "cache sweep");
        }
        for item in evicted {
            item.expire();
        }
    }
}

/// Computes the eviction set over a most-recent-first snapshot of the item
/// directory. Returns the keys to evict, as the union of three clauses:
///
/// 1. Not-found answers beyond the hysteresis floor of the not-found cap.
/// 2. Downloaded items once the running byte sum passes the hysteresis
///    floor of the size cap. Active items neither count nor get evicted
///    here; their bytes are not kept yet.
/// 3. Items past their validity, or already expired and resurfacing.
///    Keep-forever items are exempt from this clause but not from the caps.
fn compute_eviction(
    snapshots: &[ItemSnapshot],
    max_size: u64,
    max_not_found: u64,
    now: Instant,
) -> Vec<String> {
    let mut marked = vec![false; snapshots.len()];

    let not_found_floor = max_not_found.saturating_sub((max_not_found / 10).max(10));
    let mut not_found_rank = 0u64;
    for (idx, snap) in snapshots.iter().enumerate() {
        if snap.state == ItemState::NotFound {
            not_found_rank += 1;
            if not_found_rank > not_found_floor {
                marked[idx] = true;
            }
        }
    }

    let size_floor = max_size.saturating_sub(max_size / 10);
    let mut kept = 0u64;
    for (idx, snap) in snapshots.iter().enumerate() {
        if snap.state == ItemState::Downloaded {
            kept += snap.available;
            if kept > size_floor {
                marked[idx] = true;
            }
        }
    }

    for (idx, snap) in snapshots.iter().enumerate() {
        if snap.state == ItemState::Expired || (snap.expires_at < now && !snap.never_expires) {
            marked[idx] = true;
        }
    }

    snapshots
        .iter()
        .zip(marked)
        .filter(|(_, marked)| *marked)
        .map(|(snap, _)| snap.key.clone())
        .collect()
}

async fn run_expirer(shared: Arc<CacheShared>) {
    loop {
        let period = shared.validity_period / 2 + Duration::from_secs(1);
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shared.trigger.notify.notified() => {
                // Rotate the generation so debounce tasks from the burst
                // that woke us become benign no-ops.
                shared.trigger.generation.fetch_add(1, Ordering::AcqRel);
            }
            _ = shared.cancel.cancelled() => {}
        }
        shared.enforce_limits();
        if shared.state.lock().disposed {
            return;
        }
    }
}

/// Read-through cache over a remote blob store.
///
/// `get` hands out shared [`Item`]s; everything else is bookkeeping around
/// them. Dropping the cache (or calling [`Cache::close`]) expires every
/// item and removes its local file.
pub struct Cache {
    shared: Arc<CacheShared>,
    expirer: Mutex<Option<JoinHandle<()>>>,
}

impl Cache {
    /// Looks up or creates the item for `key`, refreshing its access time.
    ///
    /// A stale item is still returned so the current request can be served;
    /// the expirer is signalled and removes it in the background.
    pub fn get(&self, key: &str) -> Result<Item, CacheError> {
        let key = key.trim_start_matches('/');
        if key.is_empty() {
            return Err(CacheError::NotFound {
                key: key.to_string(),
            });
        }
        let now = Instant::now();
        let item = {
            let mut state = self.shared.state.lock();
            if state.disposed {
                return Err(CacheError::Disposed);
            }
            match state.items.get(key) {
                Some(item) => item.clone(),
                None => {
                    let never_expires = self
                        .shared
                        .keep_forever
                        .as_ref()
                        .is_some_and(|re| re.is_match(key));
                    let item = Item::new(
                        key.to_string(),
                        never_expires,
                        Arc::clone(&self.shared.store),
                        Arc::downgrade(&self.shared),
                        self.shared.validity_period,
                    );
                    state.items.insert(key.to_string(), item.clone());
                    item
                }
            }
        };
        item.touch(now);
        if item.is_stale(now) {
            self.shared.trigger_sweep();
        }
        Ok(item)
    }

    /// Removes the named items from the directory and expires them.
    /// Unknown keys are ignored, which also makes the call idempotent.
    pub fn force_expire<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let collected: Vec<Item> = {
            let mut state = self.shared.state.lock();
            keys.into_iter()
                .filter_map(|key| state.items.remove(key.as_ref().trim_start_matches('/')))
                .collect()
        };
        for item in collected {
            item.expire();
        }
    }

    /// Byte sum of fully downloaded items.
    pub fn current_size(&self) -> u64 {
        self.shared.state.lock().current_size
    }

    /// Number of cached not-found answers.
    pub fn not_found_count(&self) -> u64 {
        self.shared.state.lock().not_found_count
    }

    /// Number of known items, in any state.
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The cache accepts lookups until closed.
    pub fn is_open(&self) -> bool {
        !self.shared.state.lock().disposed
    }

    /// Validity period after clamping; also the basis for client cache
    /// headers.
    pub fn validity_period(&self) -> Duration {
        self.shared.validity_period
    }

    /// Closes the cache. Subsequent lookups fail with
    /// [`CacheError::Disposed`]; every item is expired and its local file
    /// removed before this returns.
    pub async fn close(&self) {
        self.shared.state.lock().disposed = true;
        self.shared.cancel.cancel();
        let handle = self.expirer.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                log::warn!(error = err.to_string().as_str(); "expirer task failed");
            }
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.shared.state.lock().disposed = true;
        self.shared.cancel.cancel();
    }
}
