use crate::api::preview::{ByteFetcher, EncodedBytes};
use crate::error::AppResult;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

#[derive(Default)]
struct Slot {
    url: Option<String>,
    bytes: Option<EncodedBytes>,
    warming: Option<JoinHandle<Option<EncodedBytes>>>,
    /// Bumped on every invalidation; completions from older generations are
    /// dropped instead of stored.
    generation: u64,
}

/// Per-session cache of the encoded bytes behind the current preview URL,
/// fetched ahead of the tap that will play them.
#[derive(Clone)]
pub struct PrefetchBuffer {
    fetcher: Arc<dyn ByteFetcher>,
    slot: Arc<Mutex<Slot>>,
}

enum Taken {
    Ready(EncodedBytes),
    InFlight(JoinHandle<Option<EncodedBytes>>),
    Miss,
}

impl PrefetchBuffer {
    pub fn new(fetcher: Arc<dyn ByteFetcher>) -> Self {
        Self {
            fetcher,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start fetching `url` in the background. Replaces anything held for a
    /// different URL.
    pub fn warm(&self, url: &str) {
        let mut slot = self.lock();
        if slot.url.as_deref() == Some(url) && (slot.bytes.is_some() || slot.warming.is_some()) {
            return;
        }
        Self::clear(&mut slot);
        slot.url = Some(url.to_string());
        let generation = slot.generation;

        let fetcher = Arc::clone(&self.fetcher);
        let shared = Arc::clone(&self.slot);
        let url = url.to_string();
        slot.warming = Some(tokio::spawn(async move {
            let bytes = match fetcher.fetch(&url).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    log::debug!("Prefetch of {} failed: {}", url, e);
                    None
                }
            };

            let mut slot = shared.lock().unwrap_or_else(|p| p.into_inner());
            if slot.generation == generation {
                slot.bytes = bytes.clone();
                slot.warming = None;
            } else {
                log::debug!("Discarding stale prefetch of {}", url);
            }
            bytes
        }));
    }

    /// Hand over the bytes for `url`, consuming the warm copy. Joins an
    /// in-flight warm for the same URL rather than fetching twice.
    pub async fn take_or_fetch(&self, url: &str) -> AppResult<EncodedBytes> {
        let taken = {
            let mut slot = self.lock();
            if slot.url.as_deref() != Some(url) {
                Taken::Miss
            } else if let Some(bytes) = slot.bytes.take() {
                Self::clear(&mut slot);
                Taken::Ready(bytes)
            } else if let Some(warming) = slot.warming.take() {
                // The task's own store is now stale; we keep its result.
                Self::clear(&mut slot);
                Taken::InFlight(warming)
            } else {
                Taken::Miss
            }
        };

        match taken {
            Taken::Ready(bytes) => return Ok(bytes),
            Taken::InFlight(warming) => {
                if let Ok(Some(bytes)) = warming.await {
                    return Ok(bytes);
                }
                log::debug!("Warm fetch for {} came back empty, fetching inline", url);
            }
            Taken::Miss => {}
        }

        self.fetcher.fetch(url).await
    }

    /// Drop held bytes and cancel any in-flight warm.
    pub fn invalidate(&self) {
        Self::clear(&mut self.lock());
    }

    pub fn is_warm(&self, url: &str) -> bool {
        let slot = self.lock();
        slot.url.as_deref() == Some(url) && slot.bytes.is_some()
    }

    fn clear(slot: &mut Slot) {
        slot.generation += 1;
        slot.url = None;
        slot.bytes = None;
        if let Some(warming) = slot.warming.take() {
            warming.abort();
        }
    }
}
