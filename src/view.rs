//! Plain-text rendering of the task list and sync status for the CLI.

use crate::supabase::types::{Task, TaskStatus};
use crate::sync::SyncState;

/// Width of the id column; ids are matched by prefix so this is enough to type
pub const ID_WIDTH: usize = 8;

/// Truncate a string to a maximum length in characters, adding "..." if truncated
pub fn truncate(s: &str, max_len: usize) -> String {
  if s.chars().count() <= max_len {
    s.to_string()
  } else {
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", kept)
  }
}

fn status_label(status: TaskStatus) -> &'static str {
  match status {
    TaskStatus::MyTasks => "todo",
    TaskStatus::InProgress => "doing",
    TaskStatus::Completed => "done",
  }
}

/// One line per task under a header row
pub fn task_table(tasks: &[Task]) -> String {
  if tasks.is_empty() {
    return "No tasks.".to_string();
  }

  let mut lines = vec![format!(
    "{:<8} {:<6} {:<40} {:<14} {}",
    "ID", "STATUS", "NAME", "CATEGORY", "DUE"
  )];
  lines.extend(tasks.iter().map(|task| {
    let id: String = task.id.chars().take(ID_WIDTH).collect();
    let due = task
      .due_date
      .map(|d| d.format("%Y-%m-%d").to_string())
      .unwrap_or_default();
    format!(
      "{:<8} {:<6} {:<40} {:<14} {}",
      id,
      status_label(task.status),
      truncate(&task.name, 40),
      truncate(&task.category, 14),
      due
    )
    .trim_end()
    .to_string()
  }));
  lines.join("\n")
}

/// Summary of the sync state: count, loading flag, retries and any warning
pub fn status_line(state: &SyncState) -> String {
  let mut parts = vec![match state.items.len() {
    1 => "1 task".to_string(),
    n => format!("{} tasks", n),
  }];
  if state.loading {
    parts.push("loading...".to_string());
  }
  if state.retry_count > 0 {
    parts.push(format!("retry {}", state.retry_count));
  }
  if let Some(error) = &state.error {
    parts.push(error.clone());
  }
  parts.join(" | ")
}

/// Resolve a typed id or unique id prefix against the visible tasks
pub fn resolve_id(tasks: &[Task], input: &str) -> Result<String, String> {
  if let Some(task) = tasks.iter().find(|t| t.id == input) {
    return Ok(task.id.clone());
  }
  let matches: Vec<&Task> = tasks.iter().filter(|t| t.id.starts_with(input)).collect();
  match matches.as_slice() {
    [task] => Ok(task.id.clone()),
    [] => Err(format!("No task matches '{}'", input)),
    _ => Err(format!("'{}' matches {} tasks", input, matches.len())),
  }
}
