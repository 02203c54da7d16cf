//! Online/offline signal shared by the sync engine and its callers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Boolean "is online" signal with change notification.
#[derive(Debug, Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Update the signal. Subscribers are only woken on an actual transition.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      info!(online, "Connectivity changed");
    }
  }

  /// Receiver that observes online/offline transitions.
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Periodically run `probe` and feed its answer into the signal until `stop` fires.
  pub fn spawn_probe<F, Fut>(
    &self,
    interval: Duration,
    probe: F,
    stop: CancellationToken,
  ) -> JoinHandle<()>
  where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send,
  {
    let signal = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        tokio::select! {
          _ = stop.cancelled() => break,
          _ = ticker.tick() => {
            let online = probe().await;
            debug!(online, "Connectivity probe");
            signal.set_online(online);
          }
        }
      }
    })
  }
}
