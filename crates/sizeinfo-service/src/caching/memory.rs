use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};
use serde::Serialize;

use crate::config::Config;
use crate::download::{HttpFetcher, SizeInfoFetcher};
use crate::normalize::{NormalizedRecord, process_api_data};
use crate::utils::futures::CallOnDrop;

use super::{CacheKey, FetchError, RequestStats, StatsSummary};

type FetchResult = Result<Arc<NormalizedRecord>, FetchError>;

/// The outcome of a pending request, shared by every caller waiting for it.
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// A request that has been started and not settled yet.
struct InFlightOperation {
    /// Distinguishes this request from earlier and later ones for the same key.
    id: u64,
    future: SharedFetch,
}

#[derive(Default)]
struct State {
    entries: HashMap<CacheKey, Arc<NormalizedRecord>>,
    in_flight: HashMap<CacheKey, InFlightOperation>,
    stats: HashMap<CacheKey, RequestStats>,
    next_id: u64,
}

impl State {
    /// Removes the in-flight registration of `key`, if it still belongs to the request `id`.
    fn deregister(&mut self, key: &CacheKey, id: u64) -> bool {
        if self.in_flight.get(key).is_some_and(|op| op.id == id) {
            self.in_flight.remove(key);
            true
        } else {
            false
        }
    }
}

struct Inner<F> {
    fetcher: F,
    state: Mutex<State>,
}

impl<F> Inner<F> {
    fn lock(&self) -> MutexGuard<'_, State> {
        // the state stays consistent, no lock holder can panic halfway through an update
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores the outcome of request `id` and deregisters it, in one critical section.
    fn settle(&self, key: &CacheKey, id: u64, result: &FetchResult) {
        let mut guard = self.lock();
        let state = &mut *guard;

        if let Ok(record) = result {
            state.entries.insert(key.clone(), Arc::clone(record));
        }
        // the record is gone if all stats were cleared while the request was pending
        if let Some(stats) = state.stats.get_mut(key) {
            match result {
                Ok(_) => stats.record_success(),
                Err(err) => stats.record_failure(err),
            }
        }
        state.deregister(key, id);
    }

    /// Cleans up after request `id` if its task ended without settling.
    fn abandon(&self, key: &CacheKey, id: u64) {
        let mut state = self.lock();
        if !state.deregister(key, id) {
            return;
        }

        tracing::error!(%key, "Size info request ended without a result");
        if let Some(stats) = state.stats.get_mut(key) {
            stats.record_failure(&FetchError::Internal);
        }
    }
}

/// A snapshot of the state of a [`SizeInfoManager`].
#[derive(Clone, Debug, Serialize)]
pub struct CacheStatus {
    /// The number of cached records.
    pub cache_size: usize,
    /// The number of pending requests.
    pub in_flight: usize,
    pub cached_keys: Vec<String>,
    pub in_flight_keys: Vec<String>,
    pub request_stats: BTreeMap<String, StatsSummary>,
}

/// Fetches, caches and deduplicates size info of garments.
///
/// Cloning the manager creates another handle to the same cache.
pub struct SizeInfoManager<F = HttpFetcher> {
    inner: Arc<Inner<F>>,
}

impl<F> Clone for SizeInfoManager<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F> fmt::Debug for SizeInfoManager<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (entries, in_flight) = self
            .inner
            .state
            .try_lock()
            .map(|state| (state.entries.len(), state.in_flight.len()))
            .unwrap_or_default();
        f.debug_struct("SizeInfoManager")
            .field("cached records", &entries)
            .field("requests in flight", &in_flight)
            .finish()
    }
}

impl SizeInfoManager {
    /// Creates a manager that queries the configured endpoint over HTTP.
    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        Ok(Self::new(HttpFetcher::from_config(config)?))
    }
}

impl<F: SizeInfoFetcher> SizeInfoManager<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Returns the size info of a garment.
    ///
    /// Cached records are returned right away. Otherwise this waits for a pending request
    /// of the same garment, or starts a new one if there is none. All callers waiting for
    /// the same request receive the same outcome.
    ///
    /// Every call counts as an attempt in the [`RequestStats`] of the garment.
    pub async fn lookup(&self, garment_id: &str, brand: &str) -> FetchResult {
        let key = CacheKey::new(garment_id, brand);
        metric!(counter("sizeinfo.access") += 1);

        // a failed spawn must not unwind while the state is locked
        let runtime = tokio::runtime::Handle::try_current();

        let pending = {
            let mut state = self.inner.lock();
            state
                .stats
                .entry(key.clone())
                .or_insert_with(RequestStats::new)
                .record_attempt();

            if let Some(record) = state.entries.get(&key) {
                metric!(counter("sizeinfo.memory.hit") += 1);
                tracing::trace!(%key, "Serving size info from memory");
                return Ok(Arc::clone(record));
            }

            let joined = state.in_flight.get(&key).map(|op| op.future.clone());
            match joined {
                Some(pending) => {
                    metric!(counter("sizeinfo.inflight.join") += 1);
                    tracing::trace!(%key, "Joining pending size info request");
                    pending
                }
                None => match &runtime {
                    Ok(runtime) => self.start_fetch(runtime, &mut state, key, garment_id, brand),
                    Err(_) => {
                        tracing::error!(%key, "Cannot fetch size info outside of a tokio runtime");
                        if let Some(stats) = state.stats.get_mut(&key) {
                            stats.record_failure(&FetchError::Internal);
                        }
                        return Err(FetchError::Internal);
                    }
                },
            }
        };

        pending.await
    }

    /// Spawns the request for `key` and registers it as in flight.
    ///
    /// Must be called with the state locked, after checking that nothing is in flight for `key`.
    fn start_fetch(
        &self,
        runtime: &tokio::runtime::Handle,
        state: &mut State,
        key: CacheKey,
        garment_id: &str,
        brand: &str,
    ) -> SharedFetch {
        let id = state.next_id;
        state.next_id += 1;

        let done_token = {
            let inner = Arc::clone(&self.inner);
            let key = key.clone();
            CallOnDrop::new(move || inner.abandon(&key, id))
        };

        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let garment_id = garment_id.to_owned();
        let brand = brand.to_owned();

        let task = async move {
            let _done_token = done_token; // move into the future

            tracing::debug!(key = %task_key, "Fetching size info");
            let start = Instant::now();
            let result = match inner.fetcher.fetch(&garment_id, &brand).await {
                Ok(raw) => process_api_data(&raw, &garment_id, &brand).map(Arc::new),
                Err(err) => Err(err),
            };

            metric!(timer("sizeinfo.fetch.duration") = start.elapsed());
            metric!(
                counter("sizeinfo.fetch") += 1,
                "status" => match &result {
                    Ok(_) => "ok",
                    Err(FetchError::Network(_)) => "network",
                    Err(FetchError::Status(_)) => "status",
                    Err(FetchError::Parse(_)) => "parse",
                    Err(FetchError::Internal) => "internal",
                },
            );
            if let Err(err) = &result {
                tracing::debug!(key = %task_key, error = %err, "Failed to fetch size info");
            }

            inner.settle(&task_key, id, &result);
            result
        };

        let handle = runtime.spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
        let pending = async move {
            handle.await.unwrap_or_else(|err| {
                tracing::error!(error = &err as &dyn std::error::Error, "Size info task failed");
                Err(FetchError::Internal)
            })
        }
        .boxed()
        .shared();

        state.in_flight.insert(
            key,
            InFlightOperation {
                id,
                future: pending.clone(),
            },
        );
        metric!(gauge("sizeinfo.inflight") = state.in_flight.len() as u64);

        pending
    }

    /// Drops the cached record of a garment.
    ///
    /// A pending request is not affected and stores its record once it succeeds.
    pub fn invalidate(&self, garment_id: &str, brand: &str) {
        let key = CacheKey::new(garment_id, brand);
        if self.inner.lock().entries.remove(&key).is_some() {
            tracing::debug!(%key, "Invalidated size info");
        }
    }

    /// Drops all cached records and all request stats.
    pub fn invalidate_all(&self) {
        let mut state = self.inner.lock();
        state.entries.clear();
        state.stats.clear();
        tracing::debug!("Invalidated all size info");
    }

    /// Fetches the size info of a garment again, bypassing the cache.
    ///
    /// A request that is already pending for the garment is waited for first, and its failure
    /// is ignored. The returned record always comes from a request started by this call or
    /// after it.
    pub async fn force_refresh(&self, garment_id: &str, brand: &str) -> FetchResult {
        let key = CacheKey::new(garment_id, brand);

        let pending = {
            let mut state = self.inner.lock();
            state.entries.remove(&key);
            state.in_flight.get(&key).map(|op| op.future.clone())
        };

        if let Some(pending) = pending {
            tracing::debug!(%key, "Waiting for pending request before refreshing");
            if let Err(err) = pending.await {
                tracing::debug!(%key, error = %err, "Pending request failed before refresh");
            }
            // the pending request stored its record when it settled
            self.inner.lock().entries.remove(&key);
        }

        self.lookup(garment_id, brand).await
    }

    /// Whether a record of the garment is cached.
    pub fn has_data(&self, garment_id: &str, brand: &str) -> bool {
        let key = CacheKey::new(garment_id, brand);
        self.inner.lock().entries.contains_key(&key)
    }

    /// Looks up all given garments concurrently.
    ///
    /// Failed lookups become `None`. The results are in the order of the input.
    pub async fn preload<I, G, B>(&self, garments: I) -> Vec<Option<Arc<NormalizedRecord>>>
    where
        I: IntoIterator<Item = (G, B)>,
        G: AsRef<str>,
        B: AsRef<str>,
    {
        let lookups = garments.into_iter().map(|(garment_id, brand)| async move {
            let (garment_id, brand) = (garment_id.as_ref(), brand.as_ref());
            match self.lookup(garment_id, brand).await {
                Ok(record) => Some(record),
                Err(err) => {
                    tracing::warn!(garment_id, brand, error = %err, "Failed to preload size info");
                    None
                }
            }
        });

        let records = future::join_all(lookups).await;
        let loaded = records.iter().filter(|record| record.is_some()).count();
        tracing::info!("Preloaded size info of {}/{} garments", loaded, records.len());

        records
    }

    /// Returns a snapshot of the cache, the pending requests and the request stats.
    pub fn status(&self) -> CacheStatus {
        let state = self.inner.lock();

        let mut cached_keys: Vec<_> = state.entries.keys().map(|k| k.to_string()).collect();
        cached_keys.sort();
        let mut in_flight_keys: Vec<_> = state.in_flight.keys().map(|k| k.to_string()).collect();
        in_flight_keys.sort();

        let request_stats = state
            .stats
            .iter()
            .map(|(key, stats)| (key.to_string(), stats.summary()))
            .collect();

        CacheStatus {
            cache_size: state.entries.len(),
            in_flight: state.in_flight.len(),
            cached_keys,
            in_flight_keys,
            request_stats,
        }
    }

    /// Returns the full request stats of a garment, if it was looked up since the last
    /// [`invalidate_all`](Self::invalidate_all).
    pub fn request_stats(&self, garment_id: &str, brand: &str) -> Option<RequestStats> {
        let key = CacheKey::new(garment_id, brand);
        self.inner.lock().stats.get(&key).cloned()
    }
}
