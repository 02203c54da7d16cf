use crate::commands::{self, Action};
use crate::config::Config;
use crate::event::{Event, EventHandler};
use crate::supabase::types::{NewTask, Task, TaskStatus};
use crate::supabase::SupabaseClient;
use crate::sync::{Connectivity, LoadOutcome, SkipReason, SyncState, TaskSync};
use crate::view;
use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Interactive watch mode: prints the task list as it changes and runs
/// commands typed on stdin.
pub struct App {
  sync: TaskSync<SupabaseClient>,

  client: Arc<SupabaseClient>,

  connectivity: Connectivity,

  config: Config,

  /// Stops the connectivity probe; `None` while forced offline
  probe: Option<CancellationToken>,

  /// Last rendered list and status, to print only what changed
  last_items: Option<Vec<Task>>,
  last_status: String,

  /// Event sender for async tasks
  event_tx: Option<mpsc::UnboundedSender<Event>>,

  /// Whether to quit
  should_quit: bool,
}

impl App {
  pub fn new(
    config: Config,
    sync: TaskSync<SupabaseClient>,
    client: Arc<SupabaseClient>,
    connectivity: Connectivity,
  ) -> Self {
    Self {
      sync,
      client,
      connectivity,
      config,
      probe: None,
      last_items: None,
      last_status: String::new(),
      event_tx: None,
      should_quit: false,
    }
  }

  pub async fn run(&mut self) -> Result<()> {
    let mut events = EventHandler::new();
    events.forward_state(self.sync.watch());
    self.event_tx = Some(events.sender());

    self.start_probe();
    println!(
      "Watching tasks for {} (type 'help' for commands)",
      self.sync.subject()
    );

    let sync = self.sync.clone();
    tokio::spawn(async move {
      let outcome = sync.start().await;
      debug!(?outcome, "Initial load");
    });

    while !self.should_quit {
      match events.next().await {
        Some(event) => self.handle_event(event),
        None => break,
      }
    }

    self.stop_probe();
    self.sync.shutdown();
    info!(subject = %self.sync.subject(), "Watch mode exited");
    Ok(())
  }

  fn handle_event(&mut self, event: Event) {
    match event {
      Event::Line(line) => {
        if line.trim().is_empty() {
          return;
        }
        match commands::parse(&line) {
          Ok(action) => self.execute(action),
          Err(msg) => println!("{}", msg),
        }
      }
      Event::Eof => self.should_quit = true,
      Event::StateChanged => {
        let state = self.sync.state();
        self.render(&state);
      }
      Event::Message(msg) => println!("{}", msg),
    }
  }

  /// Print the list when its contents changed and the status line when it
  /// changed.
  fn render(&mut self, state: &SyncState) {
    if self.last_items.as_ref() != Some(&state.items) && !state.loading {
      println!("{}", view::task_table(&state.items));
      self.last_items = Some(state.items.clone());
    }
    let status = view::status_line(state);
    if status != self.last_status {
      println!("-- {}", status);
      self.last_status = status;
    }
  }

  fn execute(&mut self, action: Action) {
    match action {
      Action::Add(name) => {
        let sync = self.sync.clone();
        self.spawn_reporting(async move {
          match sync.create_task(NewTask::named(name)).await {
            Ok(task) => format!("Created {}: {}", short_id(&task.id), task.name),
            Err(e) => format!("Could not create task: {}", e),
          }
        });
      }
      Action::Start(ids) => self.set_status(ids, TaskStatus::InProgress),
      Action::Done(ids) => self.set_status(ids, TaskStatus::Completed),
      Action::Remove(input) => {
        let id = match view::resolve_id(&self.sync.state().items, &input) {
          Ok(id) => id,
          Err(msg) => {
            println!("{}", msg);
            return;
          }
        };
        let sync = self.sync.clone();
        self.spawn_reporting(async move {
          match sync.delete_task(&id).await {
            Ok(()) => format!("Deleted {}", short_id(&id)),
            Err(e) => format!("Could not delete task: {}", e),
          }
        });
      }
      Action::Refresh => {
        let sync = self.sync.clone();
        self.spawn_reporting(async move { describe_outcome(&sync.load(true).await) });
      }
      Action::Resume => {
        let sync = self.sync.clone();
        self.spawn_reporting(async move { describe_outcome(&sync.on_foreground().await) });
      }
      Action::Offline => {
        self.stop_probe();
        self.connectivity.set_online(false);
        println!("Offline. Connectivity probing paused until 'online'.");
      }
      Action::Online => {
        if self.probe.is_none() {
          self.start_probe();
          println!("Connectivity probing resumed.");
        } else {
          println!("Already probing connectivity.");
        }
      }
      Action::Status => {
        let state = self.sync.state();
        let link = if self.connectivity.is_online() {
          "online"
        } else {
          "offline"
        };
        let cached = match self.sync.cache_age() {
          Some(age) => format!("{} cached {}s ago", self.sync.cache_key(), age.as_secs()),
          None => format!("{} not cached", self.sync.cache_key()),
        };
        println!(
          "{} [{}] {} ({})",
          self.sync.subject(),
          link,
          view::status_line(&state),
          cached
        );
      }
      Action::Help => println!("{}", commands::help()),
      Action::Logout => {
        self.sync.logout();
        println!("Logged out; cached tasks cleared.");
        self.should_quit = true;
      }
      Action::Quit => self.should_quit = true,
    }
  }

  fn set_status(&self, inputs: Vec<String>, status: TaskStatus) {
    let items = self.sync.state().items;
    let ids = match inputs
      .iter()
      .map(|input| view::resolve_id(&items, input))
      .collect::<Result<Vec<_>, _>>()
    {
      Ok(ids) => ids,
      Err(msg) => {
        println!("{}", msg);
        return;
      }
    };

    let sync = self.sync.clone();
    self.spawn_reporting(async move {
      match sync.set_status_many(&ids, status).await {
        Ok(tasks) => format!("Moved {} task(s) to {}", tasks.len(), status),
        Err(e) => format!("Could not update tasks: {}", e),
      }
    });
  }

  /// Run `fut` in the background and print the message it resolves to
  fn spawn_reporting<F>(&self, fut: F)
  where
    F: std::future::Future<Output = String> + Send + 'static,
  {
    let Some(tx) = self.event_tx.clone() else {
      return;
    };
    tokio::spawn(async move {
      let msg = fut.await;
      let _ = tx.send(Event::Message(msg));
    });
  }

  fn start_probe(&mut self) {
    let stop = CancellationToken::new();
    let client = Arc::clone(&self.client);
    self.connectivity.spawn_probe(
      self.config.sync.health_interval(),
      move || {
        let client = Arc::clone(&client);
        async move { client.health().await }
      },
      stop.clone(),
    );
    self.probe = Some(stop);
  }

  fn stop_probe(&mut self) {
    if let Some(stop) = self.probe.take() {
      stop.cancel();
    }
  }
}

fn short_id(id: &str) -> String {
  id.chars().take(view::ID_WIDTH).collect()
}

/// One-line summary of a load request for the user
pub fn describe_outcome(outcome: &LoadOutcome) -> String {
  match outcome {
    LoadOutcome::Skipped(SkipReason::InFlight) => "A load is already running.".to_string(),
    LoadOutcome::Skipped(SkipReason::Throttled) => "Loaded moments ago; skipped.".to_string(),
    LoadOutcome::Skipped(SkipReason::ShutDown) => "Sync is shut down.".to_string(),
    LoadOutcome::FromCache => "Cached tasks are fresh.".to_string(),
    LoadOutcome::Fetched => "Tasks loaded.".to_string(),
    LoadOutcome::Stale => "Load failed; showing cached tasks.".to_string(),
    LoadOutcome::Offline => "Offline; showing cached tasks.".to_string(),
    LoadOutcome::Failed {
      retry_in: Some(delay),
    } => format!("Load failed; retrying in {:.1}s.", delay.as_secs_f64()),
    LoadOutcome::Failed { retry_in: None } => {
      "Load failed; will retry on 'resume'.".to_string()
    }
    LoadOutcome::Superseded => "Load replaced by a newer request.".to_string(),
  }
}
