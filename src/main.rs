mod app;
mod cache;
mod commands;
mod config;
mod event;
mod logging;
mod supabase;
mod sync;
mod view;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::MemoryCache;
use crate::supabase::types::{NewTask, TaskStatus};
use crate::supabase::SupabaseClient;
use crate::sync::{Connectivity, LoadOutcome, TaskSync};

#[derive(Parser, Debug)]
#[command(name = "taskdeck")]
#[command(about = "Keep a Supabase task list in sync from the terminal")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./taskdeck.yaml, then $XDG_CONFIG_HOME/taskdeck/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// User whose tasks to sync (overrides default_user)
  #[arg(short, long)]
  user: Option<String>,

  #[command(subcommand)]
  command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Print the task list
  List,
  /// Create a task
  Add {
    name: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    category: Option<String>,
    /// Due date (YYYY-MM-DD)
    #[arg(long)]
    due: Option<NaiveDate>,
  },
  /// Move tasks to in-progress
  Start { ids: Vec<String> },
  /// Mark tasks completed
  Done { ids: Vec<String> },
  /// Delete a task
  Rm { id: String },
  /// Watch the list and read commands from stdin (default)
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init()?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override user if specified on command line
  let user = args
    .user
    .or_else(|| config.default_user.clone())
    .ok_or_else(|| eyre!("No user given. Pass --user or set default_user in the config."))?;

  let client = Arc::new(SupabaseClient::new(&config)?);
  let connectivity = Connectivity::new(client.health().await);
  let sync = TaskSync::new(
    user,
    Arc::clone(&client),
    MemoryCache::new(),
    connectivity.clone(),
    config.sync.clone(),
  );

  let result = match args.command.unwrap_or(Cmd::Watch) {
    Cmd::Watch => {
      let mut app = app::App::new(config, sync.clone(), client, connectivity);
      app.run().await
    }
    Cmd::List => list(&sync).await,
    Cmd::Add {
      name,
      description,
      category,
      due,
    } => {
      let mut task = NewTask::named(name);
      task.description = description.unwrap_or_default();
      if let Some(category) = category {
        task.category = category;
      }
      task.due_date = due;
      let task = sync.create_task(task).await?;
      println!("Created {}: {}", task.id, task.name);
      Ok(())
    }
    Cmd::Start { ids } => move_tasks(&sync, ids, TaskStatus::InProgress).await,
    Cmd::Done { ids } => move_tasks(&sync, ids, TaskStatus::Completed).await,
    Cmd::Rm { id } => {
      let id = resolve(&sync, &[id]).await?.remove(0);
      sync.delete_task(&id).await?;
      println!("Deleted {}", id);
      Ok(())
    }
  };

  sync.shutdown();
  result
}

async fn list(sync: &TaskSync<SupabaseClient>) -> Result<()> {
  let outcome = sync.load(true).await;
  let state = sync.state();
  match outcome {
    LoadOutcome::Fetched | LoadOutcome::FromCache => {}
    _ if state.items.is_empty() => {
      return Err(eyre!(
        "{}",
        state
          .error
          .unwrap_or_else(|| app::describe_outcome(&outcome))
      ));
    }
    _ => {
      if let Some(error) = &state.error {
        eprintln!("{}", error);
      }
    }
  }
  println!("{}", view::task_table(&state.items));
  Ok(())
}

/// Load the list and resolve id prefixes against it
async fn resolve(sync: &TaskSync<SupabaseClient>, inputs: &[String]) -> Result<Vec<String>> {
  if inputs.is_empty() {
    return Err(eyre!("No task ids given"));
  }
  sync.load(false).await;
  let items = sync.state().items;
  inputs
    .iter()
    .map(|input| view::resolve_id(&items, input).map_err(|msg| eyre!(msg)))
    .collect()
}

async fn move_tasks(
  sync: &TaskSync<SupabaseClient>,
  inputs: Vec<String>,
  status: TaskStatus,
) -> Result<()> {
  let ids = resolve(sync, &inputs).await?;
  let tasks = sync.set_status_many(&ids, status).await?;
  for task in &tasks {
    println!("{} -> {}", task.id, task.status);
  }
  Ok(())
}
