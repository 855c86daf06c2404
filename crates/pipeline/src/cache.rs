//! Shared timestamp markers (cooldown, first run)

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::error::{Result, SyncError};

/// Time of the last committed run
pub const LAST_SYNC_KEY: &str = "last_ndvi_sync";
/// Set once the startup run has been dispatched
pub const FIRST_RUN_KEY: &str = "first_run";

/// Process-wide key/timestamp store. Values never expire.
pub trait MarkerCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>>;
    fn set(&self, key: &str, value: DateTime<Utc>) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryMarkerCache {
    values: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl MemoryMarkerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys written so far
    pub fn keys(&self) -> Vec<String> {
        self.values
            .lock()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn poisoned() -> SyncError {
    SyncError::Persistence("marker cache lock poisoned".to_string())
}

impl MarkerCache for MemoryMarkerCache {
    fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.values.lock().map_err(|_| poisoned())?.get(key).copied())
    }

    fn set(&self, key: &str, value: DateTime<Utc>) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| poisoned())?
            .insert(key.to_string(), value);
        Ok(())
    }
}

impl<C: MarkerCache + ?Sized> MarkerCache for Arc<C> {
    fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: DateTime<Utc>) -> Result<()> {
        (**self).set(key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_set_overwrites() {
        let cache = MemoryMarkerCache::new();
        assert_eq!(cache.get(LAST_SYNC_KEY).unwrap(), None);

        let t1 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 6, 8, 0, 0, 0).unwrap();
        cache.set(LAST_SYNC_KEY, t1).unwrap();
        cache.set(LAST_SYNC_KEY, t2).unwrap();

        assert_eq!(cache.get(LAST_SYNC_KEY).unwrap(), Some(t2));
        assert_eq!(cache.keys(), vec![LAST_SYNC_KEY.to_string()]);
    }
}
