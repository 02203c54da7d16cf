//! Caching implementations for Supabase row types.

use crate::cache::Cacheable;

use super::types::Task;

impl Cacheable for Task {
  fn cache_key(&self) -> &str {
    &self.id
  }

  fn entity_type() -> &'static str {
    "task"
  }
}
