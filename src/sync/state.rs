//! Published sync state and load bookkeeping.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::supabase::types::Task;

/// What callers observe: the visible task list and its status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
  pub items: Vec<Task>,
  pub loading: bool,
  pub error: Option<String>,
  pub retry_count: u32,
}

/// Why a load request did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  /// Another request for this subject is still current
  InFlight,
  /// The last successful load is too recent
  Throttled,
  /// The engine has been shut down
  ShutDown,
}

/// Result of a single load request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
  Skipped(SkipReason),
  /// Served from cache within its freshness window; no network call
  FromCache,
  /// Fresh data from the source
  Fetched,
  /// Fetch failed; cached data shown with a warning
  Stale,
  /// Connectivity reports offline; cache (if any) shown, nothing fetched
  Offline,
  /// Fetch failed with nothing cached. `retry_in` is set when a retry was scheduled.
  Failed { retry_in: Option<Duration> },
  /// A newer request or shutdown took over before this one settled
  Superseded,
}

/// The request currently allowed to mutate state.
#[derive(Debug)]
pub(crate) struct InFlight {
  pub generation: u64,
  pub started_at: Instant,
  pub token: CancellationToken,
}

/// Bookkeeping guarded by the engine's control lock.
#[derive(Debug, Default)]
pub(crate) struct Control {
  pub in_flight: Option<InFlight>,
  /// Identity of the most recently started request
  pub generation: u64,
  pub last_success: Option<Instant>,
  /// Set when retries are exhausted; the next recovery trigger forces a load
  pub needs_force_refresh: bool,
  pub retry_timer: Option<tokio::task::JoinHandle<()>>,
  /// Identity of the most recently scheduled retry
  pub retry_seq: u64,
}

impl Control {
  pub fn is_current(&self, generation: u64) -> bool {
    self
      .in_flight
      .as_ref()
      .is_some_and(|req| req.generation == generation && !req.token.is_cancelled())
  }

  /// In-flight marker older than `stuck_after`, if any.
  pub fn stuck_for(&self, stuck_after: Duration) -> Option<Duration> {
    let age = self.in_flight.as_ref()?.started_at.elapsed();
    (age >= stuck_after).then_some(age)
  }

  /// Cancel and drop the in-flight marker.
  pub fn clear_in_flight(&mut self) {
    if let Some(req) = self.in_flight.take() {
      req.token.cancel();
    }
  }

  pub fn cancel_retry(&mut self) {
    if let Some(timer) = self.retry_timer.take() {
      timer.abort();
    }
  }
}
