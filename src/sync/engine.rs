//! Per-subject task synchronization.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{self, Cacheable, MemoryCache};
use crate::config::SyncConfig;
use crate::supabase::types::{NewTask, Task, TaskPatch, TaskStatus};

use super::connectivity::Connectivity;
use super::error::SyncError;
use super::source::TaskSource;
use super::state::{Control, InFlight, LoadOutcome, SkipReason, SyncState};

/// What asked for a load; decides which shortcuts apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
  /// Plain request: de-duplicated, throttled, served from fresh cache
  Normal,
  /// Bypasses de-duplication, throttling and freshness; supersedes in-flight
  Forced,
  /// Like `Normal` with the shorter recovery throttle
  Recovery,
  /// The source reported a change: fresh cache is no longer trusted
  Change,
}

impl Trigger {
  fn forced(self) -> bool {
    self == Self::Forced
  }

  fn trusts_fresh_cache(self) -> bool {
    matches!(self, Self::Normal | Self::Recovery)
  }
}

/// Keeps one subject's task list in step with a [`TaskSource`].
///
/// Reads are cache-first with background refresh, de-duplicated, throttled,
/// bounded by a timeout and retried with backoff when nothing is cached.
/// Mutations are applied locally only after the source confirms them.
///
/// Cloning shares the same engine. Call [`TaskSync::shutdown`] to stop the
/// background tasks started by [`TaskSync::start`].
pub struct TaskSync<S: TaskSource> {
  inner: Arc<Inner<S>>,
}

struct Inner<S> {
  subject: String,
  cache_key: String,
  source: Arc<S>,
  cache: MemoryCache,
  connectivity: Connectivity,
  config: SyncConfig,
  state: watch::Sender<SyncState>,
  control: Mutex<Control>,
  shutdown: CancellationToken,
}

impl<S: TaskSource> Clone for TaskSync<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: TaskSource> TaskSync<S> {
  pub fn new(
    subject: impl Into<String>,
    source: Arc<S>,
    cache: MemoryCache,
    connectivity: Connectivity,
    config: SyncConfig,
  ) -> Self {
    let subject = subject.into();
    let (state, _rx) = watch::channel(SyncState::default());
    Self {
      inner: Arc::new(Inner {
        cache_key: Task::list_key(&subject),
        subject,
        source,
        cache,
        connectivity,
        config,
        state,
        control: Mutex::new(Control::default()),
        shutdown: CancellationToken::new(),
      }),
    }
  }

  pub fn subject(&self) -> &str {
    &self.inner.subject
  }

  pub fn cache_key(&self) -> &str {
    &self.inner.cache_key
  }

  /// How long ago the cached list was written, if there is one.
  pub fn cache_age(&self) -> Option<Duration> {
    self.inner.cache.age(&self.inner.cache_key)
  }

  /// Snapshot of the current state.
  pub fn state(&self) -> SyncState {
    self.inner.state.borrow().clone()
  }

  /// Receiver notified on every state change.
  pub fn watch(&self) -> watch::Receiver<SyncState> {
    self.inner.state.subscribe()
  }

  fn lock_control(&self) -> MutexGuard<'_, Control> {
    self
      .inner
      .control
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn publish(&self, f: impl FnOnce(&mut SyncState)) {
    self.inner.state.send_modify(f);
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Start background work (change feed, watchdog, reconnect handling) and
  /// run the initial load.
  pub async fn start(&self) -> LoadOutcome {
    self.spawn_change_listener();
    self.spawn_watchdog();
    self.spawn_connectivity_listener();
    self.load(false).await
  }

  /// Stop all background work. Pending and late results no longer touch state.
  pub fn shutdown(&self) {
    self.inner.shutdown.cancel();
    let mut control = self.lock_control();
    control.clear_in_flight();
    control.cancel_retry();
  }

  /// Shut down and empty the cache. The session's data goes with it.
  pub fn logout(&self) {
    self.shutdown();
    self.inner.cache.clear_all();
    self.publish(|state| *state = SyncState::default());
    info!(subject = %self.inner.subject, "Logged out; cache cleared");
  }

  pub fn is_shut_down(&self) -> bool {
    self.inner.shutdown.is_cancelled()
  }

  fn spawn_change_listener(&self) {
    let sync = self.clone();
    tokio::spawn(async move {
      let inner = &sync.inner;
      let mut subscription = match inner.source.subscribe(&inner.subject).await {
        Ok(subscription) => subscription,
        Err(e) => {
          warn!(subject = %inner.subject, error = %e, "Change feed unavailable");
          return;
        }
      };

      // A change that lands inside the throttle window gets one trailing load
      let throttle = inner.config.throttle(false);
      let mut trailing = false;
      loop {
        tokio::select! {
          _ = inner.shutdown.cancelled() => break,
          event = subscription.next() => match event {
            Some(event) => {
              debug!(subject = %inner.subject, ?event, "Change notification");
            }
            None => break,
          },
          _ = tokio::time::sleep(throttle), if trailing => {}
        }

        let outcome = tokio::select! {
          _ = inner.shutdown.cancelled() => break,
          outcome = sync.run_load(Trigger::Change) => outcome,
        };
        // Changes that queued up during the load collapse into one trailing load
        let queued = subscription.drain();
        if queued > 0 {
          debug!(subject = %inner.subject, queued, "Coalesced change notifications");
        }
        trailing = queued > 0 || matches!(outcome, LoadOutcome::Skipped(_));
      }
    });
  }

  fn spawn_watchdog(&self) {
    let sync = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(sync.inner.config.watchdog_interval());
      ticker.tick().await;
      loop {
        tokio::select! {
          _ = sync.inner.shutdown.cancelled() => break,
          _ = ticker.tick() => {
            sync.clear_if_stuck();
          }
        }
      }
    });
  }

  fn spawn_connectivity_listener(&self) {
    let sync = self.clone();
    let mut online = self.inner.connectivity.subscribe();
    tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = sync.inner.shutdown.cancelled() => break,
          changed = online.changed() => {
            if changed.is_err() {
              break;
            }
            if *online.borrow_and_update() {
              sync.on_foreground().await;
            }
          }
        }
      }
    });
  }

  // ==========================================================================
  // Loading
  // ==========================================================================

  /// Load tasks. `force` bypasses throttling, in-flight de-duplication and
  /// the freshness window, and supersedes any request already running.
  pub async fn load(&self, force: bool) -> LoadOutcome {
    let trigger = if force { Trigger::Forced } else { Trigger::Normal };
    self.run_load(trigger).await
  }

  /// Recovery trigger for the app returning to the foreground (or the
  /// connection coming back).
  ///
  /// A stuck request is discarded and a fresh load forced; a pending forced
  /// refresh after exhausted retries also forces. Otherwise this is a normal
  /// load with the shorter recovery throttle.
  pub async fn on_foreground(&self) -> LoadOutcome {
    let stuck = self.clear_if_stuck();
    let pending = {
      let mut control = self.lock_control();
      std::mem::take(&mut control.needs_force_refresh)
    };
    if pending {
      self.publish(|state| state.retry_count = 0);
    }
    let trigger = if stuck || pending {
      Trigger::Forced
    } else {
      Trigger::Recovery
    };
    self.run_load(trigger).await
  }

  /// Drop an in-flight marker older than the fetch timeout plus grace.
  /// Returns whether one was cleared.
  pub fn clear_if_stuck(&self) -> bool {
    let stuck_after = self.inner.config.stuck_after();
    let mut control = self.lock_control();
    let Some(age) = control.stuck_for(stuck_after) else {
      return false;
    };
    warn!(
      subject = %self.inner.subject,
      age_secs = age.as_secs(),
      "Clearing stuck in-flight request"
    );
    control.clear_in_flight();
    drop(control);
    self.publish(|state| state.loading = false);
    true
  }

  async fn run_load(&self, trigger: Trigger) -> LoadOutcome {
    let inner = &self.inner;
    let force = trigger.forced();
    if inner.shutdown.is_cancelled() {
      return LoadOutcome::Skipped(SkipReason::ShutDown);
    }

    let (generation, token) = {
      let mut control = self.lock_control();

      if control.in_flight.is_some() && !force {
        debug!(subject = %inner.subject, "Load skipped: request in flight");
        return LoadOutcome::Skipped(SkipReason::InFlight);
      }

      if !force {
        let throttle = inner.config.throttle(trigger == Trigger::Recovery);
        if control
          .last_success
          .is_some_and(|last| last.elapsed() < throttle)
        {
          debug!(subject = %inner.subject, "Load skipped: throttled");
          return LoadOutcome::Skipped(SkipReason::Throttled);
        }
      }

      let cached = inner.cache.get_with_age::<Vec<Task>>(&inner.cache_key);
      if let Some((items, age)) = &cached {
        let fresh = *age < inner.config.fresh_for();
        let items = items.clone();
        self.publish(|state| state.items = items);
        if fresh && trigger.trusts_fresh_cache() {
          debug!(subject = %inner.subject, age_ms = age.as_millis() as u64, "Served fresh cache");
          let error = (!inner.connectivity.is_online())
            .then(|| "You are offline. Showing cached data.".to_string());
          self.publish(|state| {
            state.loading = false;
            state.error = error;
          });
          return LoadOutcome::FromCache;
        }
      }

      if !inner.connectivity.is_online() {
        let message = if cached.is_some() {
          "You are offline. Showing cached data."
        } else {
          "You are offline. Tasks will load when the connection returns."
        };
        self.publish(|state| {
          state.loading = false;
          state.error = Some(message.to_string());
        });
        return LoadOutcome::Offline;
      }

      control.clear_in_flight();
      control.generation += 1;
      let generation = control.generation;
      let token = inner.shutdown.child_token();
      control.in_flight = Some(InFlight {
        generation,
        started_at: Instant::now(),
        token: token.clone(),
      });
      (generation, token)
    };

    self.publish(|state| state.loading = true);
    debug!(subject = %inner.subject, generation, ?trigger, "Fetching tasks");

    let timeout = inner.config.fetch_timeout();
    let started = Instant::now();
    let result = tokio::select! {
      _ = token.cancelled() => None,
      res = tokio::time::timeout(timeout, inner.source.fetch_tasks(&inner.subject)) => {
        Some(res.unwrap_or(Err(SyncError::Timeout { after: timeout })))
      }
    };

    let outcome = match result {
      Some(result) => self.settle(generation, result, started.elapsed()),
      None => {
        debug!(subject = %inner.subject, generation, "Request superseded");
        LoadOutcome::Superseded
      }
    };
    self.release_after_grace(generation);
    outcome
  }

  /// Apply a finished fetch, provided it is still the current request.
  fn settle(
    &self,
    generation: u64,
    result: Result<Vec<Task>, SyncError>,
    elapsed: Duration,
  ) -> LoadOutcome {
    let inner = &self.inner;
    let mut control = self.lock_control();
    if !control.is_current(generation) {
      debug!(subject = %inner.subject, generation, "Discarding superseded result");
      return LoadOutcome::Superseded;
    }

    let err = match result {
      Ok(items) => {
        info!(
          subject = %inner.subject,
          count = items.len(),
          elapsed_ms = elapsed.as_millis() as u64,
          "Fetched tasks"
        );
        inner.cache.set(&inner.cache_key, items.clone());
        control.last_success = Some(Instant::now());
        control.needs_force_refresh = false;
        control.cancel_retry();
        self.publish(|state| {
          state.items = items;
          state.loading = false;
          state.error = None;
          state.retry_count = 0;
        });
        return LoadOutcome::Fetched;
      }
      Err(err) => err,
    };

    warn!(
      subject = %inner.subject,
      error = %err,
      timeout = err.is_timeout(),
      "Task fetch failed"
    );

    // Re-read: mutations confirmed during the fetch have patched the cache
    if let Some(items) = inner.cache.get::<Vec<Task>>(&inner.cache_key) {
      let message = format!("{}. Showing cached data.", describe(&err));
      self.publish(|state| {
        state.items = items;
        state.loading = false;
        state.error = Some(message);
      });
      return LoadOutcome::Stale;
    }

    let attempt = inner.state.borrow().retry_count;
    let delay = if inner.connectivity.is_online() {
      inner.config.retry.next_delay(attempt, err.kind())
    } else {
      None
    };

    match delay {
      Some(delay) => {
        info!(
          subject = %inner.subject,
          attempt = attempt + 1,
          delay_ms = delay.as_millis() as u64,
          "Scheduling retry"
        );
        let message = format!("{}. Retrying...", describe(&err));
        self.publish(|state| {
          state.loading = false;
          state.error = Some(message);
          state.retry_count = attempt + 1;
        });
        self.schedule_retry(&mut control, delay);
        LoadOutcome::Failed {
          retry_in: Some(delay),
        }
      }
      None => {
        warn!(subject = %inner.subject, attempts = attempt, "Giving up until next recovery trigger");
        control.needs_force_refresh = true;
        let message = format!(
          "{}. Will try again when the app is resumed.",
          describe(&err)
        );
        self.publish(|state| {
          state.loading = false;
          state.error = Some(message);
        });
        LoadOutcome::Failed { retry_in: None }
      }
    }
  }

  fn schedule_retry(&self, control: &mut Control, delay: Duration) {
    control.cancel_retry();
    control.retry_seq += 1;
    let seq = control.retry_seq;
    let sync = self.clone();
    control.retry_timer = Some(tokio::spawn(async move {
      tokio::select! {
        _ = sync.inner.shutdown.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
      }
      {
        // Detach our own handle so a success does not abort the running retry
        let mut control = sync.lock_control();
        if control.retry_seq != seq {
          return;
        }
        control.retry_timer = None;
      }
      sync.run_load(Trigger::Forced).await;
    }));
  }

  /// Release the in-flight marker after a short delay so near-simultaneous
  /// triggers are still de-duplicated.
  fn release_after_grace(&self, generation: u64) {
    let sync = self.clone();
    let grace = self.inner.config.in_flight_grace();
    tokio::spawn(async move {
      tokio::time::sleep(grace).await;
      let mut control = sync.lock_control();
      if control
        .in_flight
        .as_ref()
        .is_some_and(|req| req.generation == generation)
      {
        control.in_flight = None;
      }
    });
  }

  // ==========================================================================
  // Mutations
  // ==========================================================================

  fn ensure_online(&self) -> Result<(), SyncError> {
    if self.inner.connectivity.is_online() {
      Ok(())
    } else {
      Err(SyncError::Offline)
    }
  }

  /// Apply a confirmed change to the cached list, when present, and to the
  /// visible list unless the engine has been shut down.
  fn apply_confirmed(&self, patch: impl Fn(&mut Vec<Task>)) {
    let inner = &self.inner;
    // Serialize the cache read-modify-write with loads
    let _control = self.lock_control();
    if let Some(mut cached) = inner.cache.get::<Vec<Task>>(&inner.cache_key) {
      patch(&mut cached);
      inner.cache.set(&inner.cache_key, cached);
    }
    if inner.shutdown.is_cancelled() {
      debug!(subject = %inner.subject, "Engine shut down; visible list left as is");
      return;
    }
    self.publish(|state| patch(&mut state.items));
  }

  pub async fn create_task(&self, task: NewTask) -> Result<Task, SyncError> {
    self.ensure_online()?;
    let created = self
      .inner
      .source
      .create_task(&self.inner.subject, &task)
      .await?;
    info!(subject = %self.inner.subject, id = %created.id, "Created task");
    self.apply_confirmed(|items| cache::upsert(items, created.clone()));
    Ok(created)
  }

  pub async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task, SyncError> {
    self.ensure_online()?;
    let updated = self.inner.source.update_task(id, &patch).await?;
    info!(subject = %self.inner.subject, id = %updated.id, "Updated task");
    self.apply_confirmed(|items| cache::upsert(items, updated.clone()));
    Ok(updated)
  }

  /// Move several tasks to `status` in one request.
  pub async fn set_status_many(
    &self,
    ids: &[String],
    status: TaskStatus,
  ) -> Result<Vec<Task>, SyncError> {
    self.ensure_online()?;
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    let updated = self
      .inner
      .source
      .update_many(ids, &TaskPatch::status(status))
      .await?;
    info!(subject = %self.inner.subject, count = updated.len(), %status, "Updated task statuses");
    self.apply_confirmed(|items| {
      for task in &updated {
        cache::upsert(items, task.clone());
      }
    });
    Ok(updated)
  }

  pub async fn delete_task(&self, id: &str) -> Result<(), SyncError> {
    self.ensure_online()?;
    self.inner.source.delete_task(id).await?;
    info!(subject = %self.inner.subject, %id, "Deleted task");
    self.apply_confirmed(|items| {
      cache::remove(items, id);
    });
    Ok(())
  }
}

/// User-facing description of a fetch failure.
fn describe(err: &SyncError) -> String {
  match err {
    SyncError::Timeout { after } => format!("Request timeout after {}s", after.as_secs()),
    other => format!("Could not load tasks: {}", other),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::supabase::types::ChangeKind;
  use crate::sync::mock::{task, Fetch, MockSource};

  const USER: &str = "u1";

  struct Harness {
    sync: TaskSync<MockSource>,
    source: Arc<MockSource>,
    cache: MemoryCache,
    connectivity: Connectivity,
  }

  fn harness(tasks: Vec<Task>) -> Harness {
    let source = Arc::new(MockSource::with_tasks(tasks));
    let cache = MemoryCache::new();
    let connectivity = Connectivity::new(true);
    let sync = TaskSync::new(
      USER,
      Arc::clone(&source),
      cache.clone(),
      connectivity.clone(),
      SyncConfig::default(),
    );
    Harness {
      sync,
      source,
      cache,
      connectivity,
    }
  }

  fn ids(items: &[Task]) -> Vec<&str> {
    items.iter().map(|t| t.id.as_str()).collect()
  }

  fn network_error() -> SyncError {
    SyncError::Network("connection reset".to_string())
  }

  #[tokio::test(start_paused = true)]
  async fn test_cold_load_populates_state_and_cache() {
    let h = harness(vec![task("t1", USER)]);

    assert_eq!(h.sync.load(false).await, LoadOutcome::Fetched);

    let state = h.sync.state();
    assert_eq!(ids(&state.items), vec!["t1"]);
    assert!(!state.loading);
    assert_eq!(state.error, None);
    assert_eq!(state.retry_count, 0);

    let cached: Vec<Task> = h.cache.get("tasks:u1").unwrap();
    assert_eq!(cached, state.items);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(h.sync.cache_age(), Some(Duration::from_secs(30)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_loads_issue_one_fetch() {
    let h = harness(vec![task("t1", USER)]);
    h.source.set_fetch_delay(Duration::from_millis(100));

    let outcomes = futures::future::join_all((0..10).map(|_| h.sync.load(false))).await;

    assert_eq!(h.source.fetch_calls(), 1);
    let fetched = outcomes
      .iter()
      .filter(|o| **o == LoadOutcome::Fetched)
      .count();
    assert_eq!(fetched, 1);
    assert!(outcomes
      .iter()
      .all(|o| matches!(o, LoadOutcome::Fetched | LoadOutcome::Skipped(SkipReason::InFlight))));

    // Still inside the throttle window
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
      h.sync.load(false).await,
      LoadOutcome::Skipped(SkipReason::Throttled)
    );
    assert_eq!(h.source.fetch_calls(), 1);

    // Forced loads bypass both
    assert_eq!(h.sync.load(true).await, LoadOutcome::Fetched);
    assert_eq!(h.source.fetch_calls(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_cache_skips_network() {
    let h = harness(vec![]);
    h.cache.set("tasks:u1", vec![task("t1", USER)]);

    assert_eq!(h.sync.load(false).await, LoadOutcome::FromCache);
    assert_eq!(h.source.fetch_calls(), 0);
    assert_eq!(ids(&h.sync.state().items), vec!["t1"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_cache_shown_then_refreshed() {
    let h = harness(vec![task("t1", USER), task("t2", USER)]);
    h.cache.set("tasks:u1", vec![task("t1", USER)]);
    tokio::time::advance(Duration::from_secs(6 * 60)).await;
    h.source.set_fetch_delay(Duration::from_millis(100));

    let sync = h.sync.clone();
    let pending = tokio::spawn(async move { sync.load(false).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Stale value visible while the background fetch runs
    let state = h.sync.state();
    assert_eq!(ids(&state.items), vec!["t1"]);
    assert!(state.loading);

    assert_eq!(pending.await.unwrap(), LoadOutcome::Fetched);
    assert_eq!(ids(&h.sync.state().items), vec!["t1", "t2"]);
    let cached: Vec<Task> = h.cache.get("tasks:u1").unwrap();
    assert_eq!(ids(&cached), vec!["t1", "t2"]);
    assert!(h.cache.is_valid("tasks:u1", Duration::from_secs(300)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_falls_back_to_cache() {
    let h = harness(vec![]);
    h.cache.set("tasks:u1", vec![task("t1", USER)]);
    h.source.push_fetch(Fetch::Fail(network_error()));

    assert_eq!(h.sync.load(true).await, LoadOutcome::Stale);

    let state = h.sync.state();
    assert_eq!(ids(&state.items), vec!["t1"]);
    let error = state.error.unwrap();
    assert!(error.contains("Showing cached data"), "{error}");
    assert!(error.contains("connection reset"), "{error}");
    // No retry storm when cache is available
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.source.fetch_calls(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutation_confirmed_during_failed_load_stays_visible() {
    let h = harness(vec![]);
    h.cache.set("tasks:u1", vec![task("t1", USER)]);
    tokio::time::advance(Duration::from_secs(6 * 60)).await;
    h.source.set_fetch_delay(Duration::from_millis(500));
    h.source.push_fetch(Fetch::Fail(network_error()));

    let sync = h.sync.clone();
    let pending = tokio::spawn(async move { sync.load(true).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let created = h.sync.create_task(NewTask::named("Essay")).await.unwrap();
    assert_eq!(created.id, "new0");
    assert_eq!(ids(&h.sync.state().items), vec!["new0", "t1"]);

    assert_eq!(pending.await.unwrap(), LoadOutcome::Stale);
    let state = h.sync.state();
    assert_eq!(ids(&state.items), vec!["new0", "t1"]);
    let cached: Vec<Task> = h.cache.get("tasks:u1").unwrap();
    assert_eq!(cached, state.items);
  }

  #[tokio::test(start_paused = true)]
  async fn test_fresh_cache_clears_previous_error() {
    let h = harness(vec![]);
    h.cache.set("tasks:u1", vec![task("t1", USER)]);
    h.source.push_fetch(Fetch::Fail(network_error()));
    assert_eq!(h.sync.load(true).await, LoadOutcome::Stale);
    assert!(h.sync.state().error.is_some());

    // A confirmed write restamps the cached list
    h.sync.create_task(NewTask::named("Essay")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.sync.load(false).await, LoadOutcome::FromCache);
    let state = h.sync.state();
    assert_eq!(state.error, None);
    assert!(!state.loading);
    assert_eq!(ids(&state.items), vec!["new0", "t1"]);

    // Offline, the same fresh cache is served with a notice
    h.connectivity.set_online(false);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.sync.load(false).await, LoadOutcome::FromCache);
    let error = h.sync.state().error.unwrap();
    assert!(error.contains("offline"), "{error}");
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_falls_back_to_cache_with_threshold() {
    let h = harness(vec![]);
    h.cache.set("tasks:u1", vec![task("t1", USER)]);
    h.source.push_fetch(Fetch::Hang);

    let started = Instant::now();
    assert_eq!(h.sync.load(true).await, LoadOutcome::Stale);
    assert!(started.elapsed() >= Duration::from_secs(45));
    assert!(started.elapsed() < Duration::from_secs(46));

    let error = h.sync.state().error.unwrap();
    assert!(error.contains("timeout after 45s"), "{error}");
    assert!(error.contains("Showing cached data"), "{error}");
  }

  #[tokio::test(start_paused = true)]
  async fn test_cold_timeout_schedules_first_retry() {
    let h = harness(vec![]);
    h.source.push_fetch(Fetch::Hang);

    let outcome = h.sync.load(false).await;
    let LoadOutcome::Failed {
      retry_in: Some(delay),
    } = outcome
    else {
      panic!("expected a scheduled retry, got {outcome:?}");
    };
    assert!(delay >= Duration::from_millis(1_000));
    assert!(delay < Duration::from_millis(2_000));

    let state = h.sync.state();
    assert_eq!(state.retry_count, 1);
    assert!(state.error.unwrap().contains("timeout"));
    assert!(state.items.is_empty());

    h.sync.shutdown();
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_recovers() {
    let h = harness(vec![task("t1", USER)]);
    h.source.push_fetch(Fetch::Fail(network_error()));

    assert!(matches!(
      h.sync.load(false).await,
      LoadOutcome::Failed { retry_in: Some(_) }
    ));
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(h.source.fetch_calls(), 2);
    let state = h.sync.state();
    assert_eq!(ids(&state.items), vec!["t1"]);
    assert_eq!(state.retry_count, 0);
    assert_eq!(state.error, None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_generic_failures_exhaust_budget_with_bounded_backoff() {
    let h = harness(vec![task("t1", USER)]);
    h.source.always(Fetch::Fail(network_error()));

    h.sync.load(false).await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    // One initial attempt plus three retries
    assert_eq!(h.source.fetch_calls(), 4);
    let state = h.sync.state();
    assert_eq!(state.retry_count, 3);
    assert!(state.error.unwrap().contains("resumed"));

    let times = h.source.fetch_times();
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    for (attempt, gap) in gaps.iter().enumerate() {
      let floor = Duration::from_millis(1_000 << attempt);
      assert!(*gap >= floor, "retry {attempt}: {gap:?}");
      assert!(*gap <= floor + Duration::from_millis(1_000), "retry {attempt}: {gap:?}");
    }
    assert!(gaps.windows(2).all(|w| w[1] >= w[0]));

    // Recovery trigger forces a fresh attempt with a new budget
    assert!(matches!(
      h.sync.on_foreground().await,
      LoadOutcome::Failed { retry_in: Some(_) }
    ));
    assert_eq!(h.source.fetch_calls(), 5);
    assert_eq!(h.sync.state().retry_count, 1);
    h.sync.shutdown();
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeouts_get_larger_budget() {
    let h = harness(vec![]);
    h.source.always(Fetch::Hang);

    h.sync.load(false).await;
    tokio::time::sleep(Duration::from_secs(600)).await;

    assert_eq!(h.source.fetch_calls(), 6);
    assert_eq!(h.sync.state().retry_count, 5);

    let times = h.source.fetch_times();
    for w in times.windows(2) {
      // 45s timeout plus a backoff never above the cap
      assert!(w[1] - w[0] <= Duration::from_secs(45 + 15));
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_forced_load_supersedes_in_flight() {
    let h = harness(vec![task("t1", USER)]);
    h.source.push_fetch(Fetch::Hang);

    let sync = h.sync.clone();
    let first = tokio::spawn(async move { sync.load(false).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
      h.sync.load(false).await,
      LoadOutcome::Skipped(SkipReason::InFlight)
    );
    assert_eq!(h.sync.load(true).await, LoadOutcome::Fetched);
    assert_eq!(first.await.unwrap(), LoadOutcome::Superseded);
    assert_eq!(ids(&h.sync.state().items), vec!["t1"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_foreground_clears_stuck_request() {
    let h = harness(vec![task("t1", USER)]);
    h.source.push_fetch(Fetch::Hang);

    // Caller abandons the load: the marker is left behind
    let sync = h.sync.clone();
    let abandoned = tokio::spawn(async move { sync.load(false).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    abandoned.abort();
    let _ = abandoned.await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
      h.sync.on_foreground().await,
      LoadOutcome::Skipped(SkipReason::InFlight)
    );

    tokio::time::sleep(Duration::from_secs(41)).await;
    assert_eq!(h.sync.on_foreground().await, LoadOutcome::Fetched);
    assert_eq!(ids(&h.sync.state().items), vec!["t1"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_watchdog_clears_stuck_request() {
    let h = harness(vec![task("t1", USER)]);
    assert_eq!(h.sync.start().await, LoadOutcome::Fetched);

    h.source.push_fetch(Fetch::Hang);
    let sync = h.sync.clone();
    let abandoned = tokio::spawn(async move { sync.load(true).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    abandoned.abort();
    let _ = abandoned.await;
    assert!(h.sync.state().loading);

    tokio::time::sleep(Duration::from_secs(56)).await;
    assert!(!h.sync.state().loading);
    // No longer blocked by the abandoned request
    assert_eq!(h.sync.load(false).await, LoadOutcome::FromCache);
    h.sync.shutdown();
  }

  #[tokio::test(start_paused = true)]
  async fn test_change_event_triggers_reload() {
    let h = harness(vec![task("t1", USER)]);
    assert_eq!(h.sync.start().await, LoadOutcome::Fetched);

    tokio::time::sleep(Duration::from_secs(4)).await;
    h.source
      .set_tasks(vec![task("t2", USER), task("t1", USER)]);
    h.source.emit(ChangeKind::Insert, "t2").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.source.fetch_calls(), 2);
    assert_eq!(ids(&h.sync.state().items), vec!["t2", "t1"]);

    // A burst inside the throttle window collapses into one trailing load
    h.source.emit(ChangeKind::Update, "t1").await;
    h.source.emit(ChangeKind::Update, "t2").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.source.fetch_calls(), 2);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(h.source.fetch_calls(), 3);
    h.sync.shutdown();
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_change_reload_keeps_cache() {
    let h = harness(vec![task("t1", USER)]);
    assert_eq!(h.sync.start().await, LoadOutcome::Fetched);

    tokio::time::sleep(Duration::from_secs(4)).await;
    h.source.push_fetch(Fetch::Fail(network_error()));
    h.source.emit(ChangeKind::Update, "t1").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.source.fetch_calls(), 2);
    assert!(h.cache.get::<Vec<Task>>("tasks:u1").is_some());
    let state = h.sync.state();
    assert_eq!(ids(&state.items), vec!["t1"]);
    assert_eq!(state.retry_count, 0);
    let error = state.error.unwrap();
    assert!(error.contains("Showing cached data"), "{error}");

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.source.fetch_calls(), 2);
    h.sync.shutdown();
  }

  #[tokio::test(start_paused = true)]
  async fn test_changes_during_reload_coalesce_into_one_trailing_load() {
    let h = harness(vec![task("t1", USER)]);
    assert_eq!(h.sync.start().await, LoadOutcome::Fetched);

    tokio::time::sleep(Duration::from_secs(4)).await;
    h.source.set_fetch_delay(Duration::from_secs(1));
    h.source.emit(ChangeKind::Update, "t1").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.source.fetch_calls(), 2);
    assert!(h.sync.state().loading);

    for _ in 0..4 {
      h.source.emit(ChangeKind::Update, "t1").await;
    }
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.source.fetch_calls(), 3);
    tokio::time::sleep(Duration::from_secs(4)).await;

    // Once shut down, a hung reload and later changes fetch nothing more
    h.source.push_fetch(Fetch::Hang);
    h.source.emit(ChangeKind::Update, "t1").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.source.fetch_calls(), 4);
    h.sync.shutdown();
    h.source.emit(ChangeKind::Update, "t1").await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.source.fetch_calls(), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_recovery_uses_shorter_throttle() {
    let h = harness(vec![task("t1", USER)]);
    h.sync.load(false).await;

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(
      h.sync.load(false).await,
      LoadOutcome::Skipped(SkipReason::Throttled)
    );
    assert_eq!(h.sync.on_foreground().await, LoadOutcome::FromCache);
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_read_serves_cache_without_fetching() {
    let h = harness(vec![task("t1", USER)]);
    h.cache.set("tasks:u1", vec![task("t0", USER)]);
    tokio::time::advance(Duration::from_secs(600)).await;
    h.connectivity.set_online(false);

    assert_eq!(h.sync.load(false).await, LoadOutcome::Offline);
    assert_eq!(h.source.fetch_calls(), 0);
    let state = h.sync.state();
    assert_eq!(ids(&state.items), vec!["t0"]);
    assert!(state.error.unwrap().contains("offline"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_triggers_load() {
    let h = harness(vec![task("t1", USER)]);
    h.connectivity.set_online(false);
    assert_eq!(h.sync.start().await, LoadOutcome::Offline);

    h.connectivity.set_online(true);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(h.source.fetch_calls(), 1);
    assert_eq!(ids(&h.sync.state().items), vec!["t1"]);
    h.sync.shutdown();
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_blocks_mutations() {
    let h = harness(vec![task("t1", USER)]);
    h.connectivity.set_online(false);

    assert_eq!(
      h.sync.create_task(NewTask::named("Essay")).await,
      Err(SyncError::Offline)
    );
    assert_eq!(
      h.sync
        .update_task("t1", TaskPatch::status(TaskStatus::Completed))
        .await,
      Err(SyncError::Offline)
    );
    assert_eq!(
      h.sync
        .set_status_many(&["t1".to_string()], TaskStatus::InProgress)
        .await,
      Err(SyncError::Offline)
    );
    assert_eq!(h.sync.delete_task("t1").await, Err(SyncError::Offline));
    assert_eq!(h.source.mutation_calls(), 0);
    assert_eq!(h.source.fetch_calls(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_confirmed_mutations_patch_state_and_cache() {
    let h = harness(vec![task("t1", USER), task("t2", USER)]);
    h.sync.load(false).await;

    let created = h.sync.create_task(NewTask::named("Lab report")).await.unwrap();
    assert_eq!(ids(&h.sync.state().items), vec![created.id.as_str(), "t1", "t2"]);

    let updated = h
      .sync
      .update_task("t1", TaskPatch::status(TaskStatus::Completed))
      .await
      .unwrap();
    assert_eq!(updated.status, TaskStatus::Completed);

    let moved = h
      .sync
      .set_status_many(&["t1".to_string(), "t2".to_string()], TaskStatus::InProgress)
      .await
      .unwrap();
    assert_eq!(moved.len(), 2);

    h.sync.delete_task(&created.id).await.unwrap();

    let state = h.sync.state();
    assert_eq!(ids(&state.items), vec!["t1", "t2"]);
    assert!(state
      .items
      .iter()
      .all(|t| t.status == TaskStatus::InProgress));
    let cached: Vec<Task> = h.cache.get("tasks:u1").unwrap();
    assert_eq!(cached, state.items);
  }

  #[tokio::test(start_paused = true)]
  async fn test_rejected_mutation_leaves_state_untouched() {
    let h = harness(vec![task("t1", USER)]);
    h.sync.load(false).await;
    let before = h.sync.state();

    let rejected = SyncError::Rejected {
      status: 403,
      message: "permission denied".to_string(),
    };
    h.source.fail_mutations(rejected.clone());

    assert_eq!(
      h.sync.create_task(NewTask::named("Essay")).await,
      Err(rejected.clone())
    );
    assert_eq!(h.sync.delete_task("t1").await, Err(rejected));
    assert_eq!(h.sync.state(), before);
    let cached: Vec<Task> = h.cache.get("tasks:u1").unwrap();
    assert_eq!(ids(&cached), vec!["t1"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutation_without_cache_does_not_seed_it() {
    let h = harness(vec![]);
    h.sync.create_task(NewTask::named("Essay")).await.unwrap();
    assert_eq!(h.cache.get::<Vec<Task>>("tasks:u1"), None);
    assert_eq!(h.sync.state().items.len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_shutdown_cancels_retries() {
    let h = harness(vec![]);
    h.source.always(Fetch::Fail(network_error()));

    assert!(matches!(
      h.sync.load(false).await,
      LoadOutcome::Failed { retry_in: Some(_) }
    ));
    h.sync.shutdown();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(h.source.fetch_calls(), 1);
    assert_eq!(
      h.sync.load(true).await,
      LoadOutcome::Skipped(SkipReason::ShutDown)
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutation_after_shutdown_leaves_visible_list() {
    let h = harness(vec![task("t1", USER)]);
    h.sync.load(false).await;
    h.sync.shutdown();
    let before = h.sync.state();

    h.sync.create_task(NewTask::named("Essay")).await.unwrap();

    assert_eq!(h.sync.state(), before);
    let cached: Vec<Task> = h.cache.get("tasks:u1").unwrap();
    assert_eq!(ids(&cached), vec!["new0", "t1"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_logout_clears_cache() {
    let h = harness(vec![task("t1", USER)]);
    h.sync.load(false).await;
    h.cache.set("tasks:u2", vec![task("x", "u2")]);
    h.cache.set("profile:u1", 1u32);

    h.sync.logout();

    assert_eq!(h.cache.get::<Vec<Task>>("tasks:u1"), None);
    assert_eq!(h.cache.get::<Vec<Task>>("tasks:u2"), None);
    assert!(h.cache.is_empty());
    assert_eq!(h.sync.state(), SyncState::default());
    assert!(h.sync.is_shut_down());
  }
}
