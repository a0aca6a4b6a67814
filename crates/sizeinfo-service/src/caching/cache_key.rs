use std::fmt;
use std::sync::Arc;

/// Identifies the size info of one garment of one brand.
///
/// The canonical form is `{brand}_{garment_id}`. It is used for the cache, the in-flight
/// registry and the request statistics alike, so equal `(garment_id, brand)` pairs always
/// share the same slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn new(garment_id: &str, brand: &str) -> Self {
        Self(format!("{brand}_{garment_id}").into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
