use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::protocol::messages::MetadataResponse;

/// Cache of the last metadata response covering all topics.
///
/// Entries older than `max_age` are never returned, which forces a periodic refresh.
#[derive(Debug)]
pub(crate) struct MetadataCache {
    cache: Mutex<Option<(MetadataResponse, Instant)>>,
    max_age: Duration,
}

impl MetadataCache {
    pub(crate) fn new(max_age: Duration) -> Self {
        Self {
            cache: Default::default(),
            max_age,
        }
    }

    /// Get the cached metadata, narrowed to `topics` if given.
    ///
    /// Misses if a requested topic is not part of the cached response.
    pub(crate) fn get(&self, topics: Option<&[String]>) -> Option<MetadataResponse> {
        let guard = self.cache.lock();
        let (metadata, fetched_at) = guard.as_ref()?;

        if fetched_at.elapsed() >= self.max_age {
            debug!(max_age=?self.max_age, "cached metadata expired");
            return None;
        }

        let mut metadata = metadata.clone();
        if let Some(topics) = topics {
            metadata.topics.retain(|t| topics.contains(&t.name));
            if metadata.topics.len() != topics.len() {
                debug!(?topics, "cached metadata misses requested topics");
                return None;
            }
        }

        Some(metadata)
    }

    pub(crate) fn invalidate(&self, reason: &'static str) {
        if self.cache.lock().take().is_some() {
            info!(reason, "invalidated metadata cache");
        }
    }

    pub(crate) fn update(&self, metadata: MetadataResponse) {
        *self.cache.lock() = Some((metadata, Instant::now()));
        debug!("updated metadata cache");
    }
}
