//! Retrieval of raw size metadata.
//!
//! The [`SizeInfoManager`](crate::caching::SizeInfoManager) does not talk to the network
//! itself. It asks a [`SizeInfoFetcher`] for the raw payload of a garment, which makes the
//! transport replaceable. [`HttpFetcher`] is the implementation used in production.

use futures::future::BoxFuture;

use crate::caching::FetchError;
use crate::normalize::RawPayload;

mod http;

pub use self::http::HttpFetcher;

/// The user agent sent with every request.
pub const USER_AGENT: &str = concat!("sizeinfo/", env!("CARGO_PKG_VERSION"));

/// A source of raw size metadata.
pub trait SizeInfoFetcher: 'static + Send + Sync {
    /// Fetches the raw payload for the given garment.
    ///
    /// Every call is exactly one attempt. Retrying is up to the caller.
    fn fetch<'a>(
        &'a self,
        garment_id: &'a str,
        brand: &'a str,
    ) -> BoxFuture<'a, Result<RawPayload, FetchError>>;
}
