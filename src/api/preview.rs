use crate::error::AppResult;
use futures_util::future::BoxFuture;
use std::sync::Arc;

/// Raw encoded audio as served by the relay.
pub type EncodedBytes = Arc<[u8]>;

/// Single-shot lookup of a preview clip URL. Retry belongs to the caller.
///
/// Implementations never fail: misses and transport errors both come back as
/// `None`, since a preview is optional.
pub trait PreviewResolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        title: &'a str,
        artist: &'a str,
        bust_cache: bool,
    ) -> BoxFuture<'a, Option<String>>;
}

/// Fetches the bytes behind a preview URL from our own origin.
pub trait ByteFetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, AppResult<EncodedBytes>>;
}

/// Whether a title/artist pair can be looked up at all.
pub fn is_resolvable(title: &str, artist: &str) -> bool {
    !title.trim().is_empty() && !artist.trim().is_empty()
}

/// A fresh token that defeats intermediate caches.
pub fn cache_bust_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
