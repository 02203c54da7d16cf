//! The remote data source the sync engine talks to.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::supabase::types::{ChangeEvent, NewTask, Task, TaskPatch};

use super::error::SyncError;

pub type SourceResult<T> = std::result::Result<T, SyncError>;

/// CRUD and change-feed operations over a user's tasks.
///
/// Implementations report transport failures as [`SyncError::Network`] and
/// application-level errors as [`SyncError::Rejected`]. Deadlines are enforced
/// by the caller.
#[async_trait]
pub trait TaskSource: Send + Sync + 'static {
  /// All tasks owned by `user_id`, newest first.
  async fn fetch_tasks(&self, user_id: &str) -> SourceResult<Vec<Task>>;

  async fn create_task(&self, user_id: &str, task: &NewTask) -> SourceResult<Task>;

  async fn update_task(&self, id: &str, patch: &TaskPatch) -> SourceResult<Task>;

  /// Apply the same patch to several tasks in one request.
  async fn update_many(&self, ids: &[String], patch: &TaskPatch) -> SourceResult<Vec<Task>>;

  async fn delete_task(&self, id: &str) -> SourceResult<()>;

  /// Start receiving change events for rows owned by `user_id`.
  async fn subscribe(&self, user_id: &str) -> SourceResult<Subscription>;
}

/// A live change feed. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
  events: mpsc::Receiver<ChangeEvent>,
  stop: CancellationToken,
}

impl Subscription {
  pub fn new(events: mpsc::Receiver<ChangeEvent>, stop: CancellationToken) -> Self {
    Self { events, stop }
  }

  /// Next change, or `None` once the feed has closed.
  pub async fn next(&mut self) -> Option<ChangeEvent> {
    self.events.recv().await
  }

  /// Discard changes already queued, returning how many there were.
  pub fn drain(&mut self) -> usize {
    let mut count = 0;
    while self.events.try_recv().is_ok() {
      count += 1;
    }
    count
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.stop.cancel();
  }
}
