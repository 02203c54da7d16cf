//! In-process key-value cache with lazy staleness checks.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// A cached value and the instant it was written.
#[derive(Clone)]
struct CacheEntry {
  data: Arc<dyn Any + Send + Sync>,
  timestamp: Instant,
}

/// Shared, non-persistent cache.
///
/// Cloning the handle shares the underlying store. Values are type-erased so
/// unrelated resources can live side by side; reading a key back as a
/// different type reports it as absent. Nothing expires on its own: callers
/// ask [`MemoryCache::is_valid`] with the max age they care about.
#[derive(Clone, Default)]
pub struct MemoryCache {
  entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Lock the map. A poisoned lock still holds a consistent map (every write is
  /// a single insert or remove), so recover it instead of failing.
  fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
    self
      .entries
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Store `data` under `key`, replacing any previous entry.
  pub fn set<T>(&self, key: &str, data: T)
  where
    T: Clone + Send + Sync + 'static,
  {
    let entry = CacheEntry {
      data: Arc::new(data),
      timestamp: Instant::now(),
    };
    self.lock().insert(key.to_string(), entry);
  }

  /// Get the stored value regardless of its age.
  pub fn get<T>(&self, key: &str) -> Option<T>
  where
    T: Clone + Send + Sync + 'static,
  {
    let data = self.lock().get(key).map(|entry| Arc::clone(&entry.data))?;
    data.downcast_ref::<T>().cloned()
  }

  /// Get the stored value together with how long ago it was written.
  pub fn get_with_age<T>(&self, key: &str) -> Option<(T, Duration)>
  where
    T: Clone + Send + Sync + 'static,
  {
    let entry = self.lock().get(key).cloned()?;
    let data = entry.data.downcast_ref::<T>().cloned()?;
    Some((data, entry.timestamp.elapsed()))
  }

  /// True iff an entry exists and was written less than `max_age` ago.
  pub fn is_valid(&self, key: &str, max_age: Duration) -> bool {
    self
      .lock()
      .get(key)
      .is_some_and(|entry| entry.timestamp.elapsed() < max_age)
  }

  /// Time since `key` was last written.
  pub fn age(&self, key: &str) -> Option<Duration> {
    self.lock().get(key).map(|entry| entry.timestamp.elapsed())
  }

  pub fn invalidate(&self, key: &str) {
    self.lock().remove(key);
  }

  /// Remove every entry whose key starts with `prefix`.
  pub fn invalidate_by_prefix(&self, prefix: &str) {
    self.lock().retain(|key, _| !key.starts_with(prefix));
  }

  pub fn clear_all(&self) {
    self.lock().clear();
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }
}

impl std::fmt::Debug for MemoryCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MemoryCache")
      .field("entries", &self.len())
      .finish()
  }
}
