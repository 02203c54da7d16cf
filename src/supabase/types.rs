use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Workflow column a task sits in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
  #[default]
  MyTasks,
  InProgress,
  Completed,
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      Self::MyTasks => "my-tasks",
      Self::InProgress => "in-progress",
      Self::Completed => "completed",
    };
    f.write_str(label)
  }
}

/// A task row as stored in the `tasks` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  pub id: String,
  pub user_id: String,
  pub name: String,
  #[serde(default, deserialize_with = "null_as_default")]
  pub description: String,
  #[serde(default, deserialize_with = "null_as_default")]
  pub category: String,
  pub due_date: Option<NaiveDate>,
  #[serde(default)]
  pub status: TaskStatus,
  #[serde(default)]
  pub is_admin_task: bool,
  pub created_at: DateTime<Utc>,
  pub updated_at: Option<DateTime<Utc>>,
}

/// Nullable text columns come back as `null`; treat them as empty.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
  D: serde::Deserializer<'de>,
  T: Default + Deserialize<'de>,
{
  Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Payload for creating a task
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NewTask {
  pub name: String,
  pub description: String,
  pub category: String,
  pub due_date: Option<NaiveDate>,
  pub status: TaskStatus,
}

impl NewTask {
  pub fn named(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      ..Self::default()
    }
  }
}

/// Partial update; only set fields are sent
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskPatch {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub due_date: Option<NaiveDate>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<TaskStatus>,
}

impl TaskPatch {
  pub fn status(status: TaskStatus) -> Self {
    Self {
      status: Some(status),
      ..Self::default()
    }
  }

  /// Apply the set fields to `task` (used by in-memory sources)
  #[cfg(test)]
  pub fn apply_to(&self, task: &mut Task) {
    if let Some(name) = &self.name {
      task.name = name.clone();
    }
    if let Some(description) = &self.description {
      task.description = description.clone();
    }
    if let Some(category) = &self.category {
      task.category = category.clone();
    }
    if let Some(due_date) = self.due_date {
      task.due_date = Some(due_date);
    }
    if let Some(status) = self.status {
      task.status = status;
    }
  }
}

/// Kind of row change reported by a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
  Insert,
  Update,
  Delete,
}

/// A change to one of the subscribed rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
  pub kind: ChangeKind,
  pub record_id: String,
}
