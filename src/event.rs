use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

use crate::sync::SyncState;

/// Application events
#[derive(Debug)]
pub enum Event {
  /// A line typed on stdin
  Line(String),
  /// Stdin was closed
  Eof,
  /// The sync engine published a new state
  StateChanged,
  /// Result of a background command, printed as-is
  Message(String),
}

/// Event handler that merges stdin lines and sync state changes
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler reading commands from stdin
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn stdin reader
    let line_tx = tx.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            if line_tx.send(Event::Line(line)).is_err() {
              break;
            }
          }
          Ok(None) | Err(_) => {
            let _ = line_tx.send(Event::Eof);
            break;
          }
        }
      }
    });

    Self { tx, rx }
  }

  /// Get a sender for async tasks to report back through
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Forward every change on `state` as [`Event::StateChanged`]
  pub fn forward_state(&self, mut state: watch::Receiver<SyncState>) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      while state.changed().await.is_ok() {
        if tx.send(Event::StateChanged).is_err() {
          break;
        }
      }
    });
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
