//! Core traits for cached entities and list patching.

/// Trait for entities that can be cached.
///
/// Implementors provide a unique key used to patch cached lists after
/// mutations, and a type name used to namespace list keys.
pub trait Cacheable: Clone + Send + Sync + 'static {
  /// Unique identifier for this entity (e.g., task id)
  fn cache_key(&self) -> &str;

  /// Entity type name for key organization (e.g., "task")
  fn entity_type() -> &'static str;

  /// Cache key for the list of this entity type owned by `subject`.
  fn list_key(subject: &str) -> String {
    format!("{}s:{}", Self::entity_type(), subject)
  }
}

/// Upsert `entity` into `list` by cache key.
///
/// Existing entities are replaced in place; new ones go to the front (most recent).
pub fn upsert<T: Cacheable>(list: &mut Vec<T>, entity: T) {
  match list
    .iter_mut()
    .find(|existing| existing.cache_key() == entity.cache_key())
  {
    Some(existing) => *existing = entity,
    None => list.insert(0, entity),
  }
}

/// Remove the entity with `key` from `list`. Returns whether anything was removed.
pub fn remove<T: Cacheable>(list: &mut Vec<T>, key: &str) -> bool {
  let before = list.len();
  list.retain(|existing| existing.cache_key() != key);
  list.len() != before
}
