use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{BackendError, IdentityCache, IdentityRecord};

struct Entry {
    record: IdentityRecord,
    stored_at: Instant,
}

/// In-process identity cache.
///
/// Entries never expire unless a TTL is given. Without one, an IP that moves
/// to another workload keeps its old attribution until the process restarts.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Option<Duration>,
}

impl MemoryCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn expired(&self, entry: &Entry, now: Instant) -> bool {
        self.ttl
            .map(|ttl| now.saturating_duration_since(entry.stored_at) >= ttl)
            .unwrap_or(false)
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl IdentityCache for MemoryCache {
    async fn get(&self, ip: &str) -> Result<Option<IdentityRecord>, BackendError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(ip) {
            Some(entry) if !self.expired(entry, now) => return Ok(Some(entry.record.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        entries.remove(ip);
        Ok(None)
    }

    async fn set(&self, ip: &str, record: &IdentityRecord) -> Result<(), BackendError> {
        self.entries.lock().insert(
            ip.to_string(),
            Entry {
                record: record.clone(),
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }
}
