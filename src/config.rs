use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub supabase: SupabaseConfig,
  /// User whose tasks are synchronized when --user is not given
  pub default_user: Option<String>,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupabaseConfig {
  /// Project URL, e.g. https://abcd.supabase.co
  pub url: String,
  /// Table holding task rows
  #[serde(default = "default_table")]
  pub table: String,
}

fn default_table() -> String {
  "tasks".to_string()
}

/// Timing knobs for the sync engine. Every field has a default.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
  /// Hard deadline for a single fetch
  pub fetch_timeout_secs: u64,
  /// How long cached tasks are served without touching the network
  pub fresh_for_secs: u64,
  /// Minimum gap after a successful load before a non-forced load runs again
  pub throttle_ms: u64,
  /// Throttle used by recovery triggers (foreground, reconnect)
  pub recovery_throttle_ms: u64,
  /// Delay before the in-flight marker is released after a load settles
  pub in_flight_grace_ms: u64,
  /// Extra time past the fetch timeout before an in-flight marker counts as stuck
  pub stuck_grace_secs: u64,
  pub watchdog_interval_secs: u64,
  /// Change feed polling interval
  pub poll_interval_secs: u64,
  /// Connectivity probe interval
  pub health_interval_secs: u64,
  pub retry: RetryPolicy,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      fetch_timeout_secs: 45,
      fresh_for_secs: 300,
      throttle_ms: 3_000,
      recovery_throttle_ms: 1_000,
      in_flight_grace_ms: 250,
      stuck_grace_secs: 5,
      watchdog_interval_secs: 5,
      poll_interval_secs: 10,
      health_interval_secs: 15,
      retry: RetryPolicy::default(),
    }
  }
}

impl SyncConfig {
  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.fetch_timeout_secs)
  }

  pub fn fresh_for(&self) -> Duration {
    Duration::from_secs(self.fresh_for_secs)
  }

  pub fn throttle(&self, recovering: bool) -> Duration {
    if recovering {
      Duration::from_millis(self.recovery_throttle_ms)
    } else {
      Duration::from_millis(self.throttle_ms)
    }
  }

  pub fn in_flight_grace(&self) -> Duration {
    Duration::from_millis(self.in_flight_grace_ms)
  }

  /// Age past which an in-flight marker is considered abandoned.
  pub fn stuck_after(&self) -> Duration {
    self.fetch_timeout() + Duration::from_secs(self.stuck_grace_secs)
  }

  pub fn watchdog_interval(&self) -> Duration {
    Duration::from_secs(self.watchdog_interval_secs)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs)
  }

  pub fn health_interval(&self) -> Duration {
    Duration::from_secs(self.health_interval_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./taskdeck.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/taskdeck/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/taskdeck/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("taskdeck.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("taskdeck").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Get the Supabase API key from environment variables.
  ///
  /// Checks TASKDECK_SUPABASE_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("TASKDECK_SUPABASE_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!(
          "Supabase API key not found. Set TASKDECK_SUPABASE_KEY or SUPABASE_ANON_KEY environment variable."
        )
      })
  }

  /// Get the signed-in user's access token, if one is provided.
  ///
  /// Checks TASKDECK_ACCESS_TOKEN.
  pub fn get_access_token() -> Option<String> {
    std::env::var("TASKDECK_ACCESS_TOKEN").ok()
  }
}
