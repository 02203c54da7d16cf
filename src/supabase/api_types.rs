//! Serde types matching PostgREST request and response bodies.
//!
//! These are kept apart from the domain types so wire quirks (error bodies,
//! projection rows, insert payloads) do not leak into the sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::sync::SyncError;

use super::types::{ChangeEvent, ChangeKind, NewTask};

// ============================================================================
// Errors
// ============================================================================

/// PostgREST error body
#[derive(Debug, Deserialize)]
pub struct ApiError {
  pub message: String,
  pub code: Option<String>,
  pub details: Option<String>,
  pub hint: Option<String>,
}

/// Map a non-success response to a rejection, keeping the server's message
/// when the body is a PostgREST error.
pub fn rejection(status: u16, body: &str) -> SyncError {
  let message = match serde_json::from_str::<ApiError>(body) {
    Ok(err) => {
      let mut message = err.message;
      if let Some(code) = err.code {
        message = format!("{} [{}]", message, code);
      }
      if let Some(details) = err.details.filter(|d| !d.is_empty()) {
        message = format!("{}: {}", message, details);
      }
      if let Some(hint) = err.hint.filter(|h| !h.is_empty()) {
        message = format!("{} (hint: {})", message, hint);
      }
      message
    }
    Err(_) if body.trim().is_empty() => "empty response".to_string(),
    Err(_) => body.trim().to_string(),
  };
  SyncError::Rejected { status, message }
}

// ============================================================================
// Requests
// ============================================================================

/// Insert payload: the new task plus its owner
#[derive(Debug, Serialize)]
pub struct ApiNewTask<'a> {
  pub user_id: &'a str,
  #[serde(flatten)]
  pub task: &'a NewTask,
}

// ============================================================================
// Change polling
// ============================================================================

/// Projection used by the change poller (`select=id,updated_at`)
#[derive(Debug, Clone, Deserialize)]
pub struct ApiRowStamp {
  pub id: String,
  pub updated_at: Option<DateTime<Utc>>,
}

pub type Snapshot = HashMap<String, Option<DateTime<Utc>>>;

pub fn snapshot(rows: Vec<ApiRowStamp>) -> Snapshot {
  rows.into_iter().map(|row| (row.id, row.updated_at)).collect()
}

/// Changes between two polls of the same rows, inserts and updates first.
pub fn diff_snapshots(previous: &Snapshot, current: &Snapshot) -> Vec<ChangeEvent> {
  let mut events: Vec<ChangeEvent> = current
    .iter()
    .filter_map(|(id, stamp)| {
      let kind = match previous.get(id) {
        None => ChangeKind::Insert,
        Some(old) if old != stamp => ChangeKind::Update,
        Some(_) => return None,
      };
      Some(ChangeEvent {
        kind,
        record_id: id.clone(),
      })
    })
    .collect();

  events.extend(
    previous
      .keys()
      .filter(|id| !current.contains_key(*id))
      .map(|id| ChangeEvent {
        kind: ChangeKind::Delete,
        record_id: id.clone(),
      }),
  );

  events
}
