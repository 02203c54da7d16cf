//! Scripted in-memory task source for tests.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::supabase::types::{ChangeEvent, ChangeKind, NewTask, Task, TaskPatch, TaskStatus};

use super::error::SyncError;
use super::source::{SourceResult, Subscription, TaskSource};

pub fn task(id: &str, user: &str) -> Task {
  Task {
    id: id.to_string(),
    user_id: user.to_string(),
    name: format!("Task {}", id),
    description: String::new(),
    category: "assignment".to_string(),
    due_date: None,
    status: TaskStatus::MyTasks,
    is_admin_task: false,
    created_at: Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).unwrap(),
    updated_at: None,
  }
}

/// How a fetch behaves.
#[derive(Debug, Clone)]
pub enum Fetch {
  Ok,
  Fail(SyncError),
  /// Never completes
  Hang,
}

#[derive(Default)]
pub struct MockSource {
  tasks: Mutex<Vec<Task>>,
  /// Behaviors for upcoming fetches; falls back to `default_fetch` when empty
  script: Mutex<VecDeque<Fetch>>,
  default_fetch: Mutex<Option<Fetch>>,
  fetch_delay: Mutex<Duration>,
  fail_mutations: Mutex<Option<SyncError>>,
  fetch_times: Mutex<Vec<Instant>>,
  events: Mutex<Option<mpsc::Sender<ChangeEvent>>>,
  fetch_calls: AtomicUsize,
  mutation_calls: AtomicUsize,
  next_id: AtomicUsize,
}

impl MockSource {
  pub fn with_tasks(tasks: Vec<Task>) -> Self {
    let source = Self::default();
    *source.tasks.lock().unwrap() = tasks;
    source
  }

  pub fn set_tasks(&self, tasks: Vec<Task>) {
    *self.tasks.lock().unwrap() = tasks;
  }

  pub fn push_fetch(&self, fetch: Fetch) {
    self.script.lock().unwrap().push_back(fetch);
  }

  pub fn always(&self, fetch: Fetch) {
    *self.default_fetch.lock().unwrap() = Some(fetch);
  }

  pub fn set_fetch_delay(&self, delay: Duration) {
    *self.fetch_delay.lock().unwrap() = delay;
  }

  pub fn fail_mutations(&self, err: SyncError) {
    *self.fail_mutations.lock().unwrap() = Some(err);
  }

  pub fn fetch_calls(&self) -> usize {
    self.fetch_calls.load(Ordering::SeqCst)
  }

  pub fn mutation_calls(&self) -> usize {
    self.mutation_calls.load(Ordering::SeqCst)
  }

  pub fn fetch_times(&self) -> Vec<Instant> {
    self.fetch_times.lock().unwrap().clone()
  }

  /// Push a change event to the current subscriber, if any.
  pub async fn emit(&self, kind: ChangeKind, record_id: &str) {
    let tx = self.events.lock().unwrap().clone();
    if let Some(tx) = tx {
      let _ = tx
        .send(ChangeEvent {
          kind,
          record_id: record_id.to_string(),
        })
        .await;
    }
  }

  fn begin_mutation(&self) -> SourceResult<()> {
    self.mutation_calls.fetch_add(1, Ordering::SeqCst);
    match self.fail_mutations.lock().unwrap().clone() {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }
}

#[async_trait]
impl TaskSource for MockSource {
  async fn fetch_tasks(&self, user_id: &str) -> SourceResult<Vec<Task>> {
    self.fetch_calls.fetch_add(1, Ordering::SeqCst);
    self.fetch_times.lock().unwrap().push(Instant::now());

    let behavior = self
      .script
      .lock()
      .unwrap()
      .pop_front()
      .or_else(|| self.default_fetch.lock().unwrap().clone())
      .unwrap_or(Fetch::Ok);

    let delay = *self.fetch_delay.lock().unwrap();
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }

    match behavior {
      Fetch::Ok => Ok(
        self
          .tasks
          .lock()
          .unwrap()
          .iter()
          .filter(|t| t.user_id == user_id)
          .cloned()
          .collect(),
      ),
      Fetch::Fail(err) => Err(err),
      Fetch::Hang => std::future::pending().await,
    }
  }

  async fn create_task(&self, user_id: &str, new: &NewTask) -> SourceResult<Task> {
    self.begin_mutation()?;
    let id = format!("new{}", self.next_id.fetch_add(1, Ordering::SeqCst));
    let mut created = task(&id, user_id);
    created.name = new.name.clone();
    created.status = new.status;
    self.tasks.lock().unwrap().insert(0, created.clone());
    Ok(created)
  }

  async fn update_task(&self, id: &str, patch: &TaskPatch) -> SourceResult<Task> {
    self.begin_mutation()?;
    let mut tasks = self.tasks.lock().unwrap();
    let task = tasks
      .iter_mut()
      .find(|t| t.id == id)
      .ok_or_else(|| SyncError::Rejected {
        status: 404,
        message: format!("task {} not found", id),
      })?;
    patch.apply_to(task);
    Ok(task.clone())
  }

  async fn update_many(&self, ids: &[String], patch: &TaskPatch) -> SourceResult<Vec<Task>> {
    self.begin_mutation()?;
    let mut tasks = self.tasks.lock().unwrap();
    let mut updated = Vec::new();
    for task in tasks.iter_mut().filter(|t| ids.contains(&t.id)) {
      patch.apply_to(task);
      updated.push(task.clone());
    }
    Ok(updated)
  }

  async fn delete_task(&self, id: &str) -> SourceResult<()> {
    self.begin_mutation()?;
    self.tasks.lock().unwrap().retain(|t| t.id != id);
    Ok(())
  }

  async fn subscribe(&self, _user_id: &str) -> SourceResult<Subscription> {
    let (tx, rx) = mpsc::channel(16);
    *self.events.lock().unwrap() = Some(tx);
    Ok(Subscription::new(rx, CancellationToken::new()))
  }
}
