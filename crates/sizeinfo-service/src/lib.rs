//! Data-access layer for garment size and fit metadata.
//!
//! The central type is [`SizeInfoManager`](caching::SizeInfoManager), which fetches
//! per-(garment, brand) records from the size-metadata endpoint, coalesces concurrent
//! requests for the same key into a single network call and keeps successful results
//! in memory until they are invalidated.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod download;
pub mod logging;
pub mod normalize;
pub mod utils;
