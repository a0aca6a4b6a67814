//! # Size info caching
//!
//! Every garment widget on a page asks for the size metadata of its garment, and many widgets
//! can ask for the same garment at the same time. This module makes sure that the endpoint sees
//! at most one request per garment at any time, and none at all once a garment is cached.
//!
//! ## Lookups
//!
//! A [`SizeInfoManager::lookup`] goes through the following steps:
//! - If a record for the [`CacheKey`] is cached, it is returned right away.
//! - If a request for the key is already in flight, the caller waits for that request and
//!   observes its outcome, be it success or failure.
//! - Otherwise a new request is started in its own task and registered as in flight.
//!
//! The check and the registration happen under a single lock, so two concurrent misses can
//! never both start a request. Once the request settles, its record is stored (on success), the
//! outcome is recorded in the [`RequestStats`] and the key is deregistered, again under a
//! single lock. Failures are never cached, the next lookup after a failure starts a new request.
//!
//! Requests run to completion even if every caller stops waiting for them. They are not
//! retried and there is no timeout other than the ones of the HTTP client.
//!
//! ## Invalidation
//!
//! [`SizeInfoManager::invalidate`] drops a single record, [`SizeInfoManager::invalidate_all`]
//! drops every record and all request stats. Neither touches requests in flight: a request that
//! settles after an invalidation stores its record as usual.
//!
//! [`SizeInfoManager::force_refresh`] waits for a pending request of the key (ignoring its
//! failure) and then always starts a new one.
//!
//! ### Metrics
//!
//! - `sizeinfo.access`: All lookups.
//! - `sizeinfo.memory.hit`: Lookups served from the cache.
//! - `sizeinfo.inflight.join`: Lookups that joined a pending request.
//! - `sizeinfo.fetch`: Requests to the endpoint, tagged with their `status`.
//! - `sizeinfo.fetch.duration`: The time a request took, including normalization.
//! - `sizeinfo.inflight`: The number of pending requests, whenever a request starts.
//!
//! ## [`FetchError`]
//!
//! All failures of a request are a [`FetchError`]. It is cheap to clone, since all callers that
//! joined a request receive a copy of the same outcome.

mod cache_key;
mod fetch_error;
mod memory;
mod stats;

#[cfg(test)]
mod tests;

pub use cache_key::CacheKey;
pub use fetch_error::FetchError;
pub use memory::{CacheStatus, SizeInfoManager};
pub use stats::{ErrorRecord, MAX_RECENT_ERRORS, RequestStats, StatsSummary};
