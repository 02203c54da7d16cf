use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::supabase::api_types::{
  diff_snapshots, rejection, snapshot, ApiNewTask, ApiRowStamp, Snapshot,
};
use crate::supabase::types::{NewTask, Task, TaskPatch};
use crate::sync::{SourceResult, Subscription, SyncError, TaskSource};

/// Supabase REST (PostgREST) client for the tasks table
#[derive(Clone)]
pub struct SupabaseClient {
  http: reqwest::Client,
  /// `{project}/rest/v1/`
  rest_url: Url,
  /// `{project}/rest/v1/{table}`
  table_url: Url,
  api_key: String,
  bearer: String,
  poll_interval: Duration,
}

impl SupabaseClient {
  pub fn new(config: &Config) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    let bearer = Config::get_access_token().unwrap_or_else(|| api_key.clone());

    let http = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(10))
      .timeout(Duration::from_secs(60))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Self::with_http(
      http,
      &config.supabase.url,
      &config.supabase.table,
      api_key,
      bearer,
      config.sync.poll_interval(),
    )
  }

  fn with_http(
    http: reqwest::Client,
    project_url: &str,
    table: &str,
    api_key: String,
    bearer: String,
    poll_interval: Duration,
  ) -> Result<Self> {
    let base = Url::parse(project_url)
      .map_err(|e| eyre!("Invalid Supabase URL {}: {}", project_url, e))?;
    let rest_url = base
      .join("/rest/v1/")
      .map_err(|e| eyre!("Invalid Supabase URL {}: {}", project_url, e))?;
    let table_url = rest_url
      .join(table)
      .map_err(|e| eyre!("Invalid table name {}: {}", table, e))?;

    Ok(Self {
      http,
      rest_url,
      table_url,
      api_key,
      bearer,
      poll_interval,
    })
  }

  /// URL of the table endpoint with the given query pairs
  fn endpoint(&self, query: &[(&str, &str)]) -> Url {
    let mut url = self.table_url.clone();
    if !query.is_empty() {
      url.query_pairs_mut().extend_pairs(query);
    }
    url
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    self
      .http
      .request(method, url)
      .header("apikey", &self.api_key)
      .bearer_auth(&self.bearer)
  }

  /// Whether the REST endpoint answers at all. Any HTTP response counts as
  /// reachable; only transport failures and 5xx report offline.
  pub async fn health(&self) -> bool {
    match self
      .request(Method::GET, self.rest_url.clone())
      .send()
      .await
    {
      Ok(resp) => !resp.status().is_server_error(),
      Err(e) => {
        debug!(error = %e, "Health probe failed");
        false
      }
    }
  }

  /// `id`/`updated_at` of every row owned by `user_id`
  async fn fetch_stamps(&self, user_id: &str) -> SourceResult<Vec<ApiRowStamp>> {
    let user_filter = eq(user_id);
    let url = self.endpoint(&[("select", "id,updated_at"), ("user_id", user_filter.as_str())]);
    send_json(self.request(Method::GET, url)).await
  }
}

/// PostgREST `eq.` filter value
fn eq(value: &str) -> String {
  format!("eq.{}", value)
}

/// PostgREST `in.` filter value with each id quoted
fn in_list(ids: &[String]) -> String {
  let quoted: Vec<String> = ids
    .iter()
    .map(|id| format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\"")))
    .collect();
  format!("in.({})", quoted.join(","))
}

/// Send a request and decode a JSON body, mapping failures onto [`SyncError`].
async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> SourceResult<T> {
  let resp = send(request).await?;
  let status = resp.status().as_u16();
  resp.json::<T>().await.map_err(|e| SyncError::Rejected {
    status,
    message: format!("Unexpected response body: {}", e),
  })
}

async fn send(request: RequestBuilder) -> SourceResult<reqwest::Response> {
  let resp = request
    .send()
    .await
    .map_err(|e| SyncError::Network(e.to_string()))?;

  let status = resp.status();
  if status.is_success() {
    return Ok(resp);
  }
  let body = resp.text().await.unwrap_or_default();
  Err(rejection(status.as_u16(), &body))
}

/// First row of a `return=representation` response
fn single(rows: Vec<Task>, what: &str) -> SourceResult<Task> {
  rows.into_iter().next().ok_or_else(|| SyncError::Rejected {
    status: 404,
    message: format!("{} not found", what),
  })
}

#[async_trait]
impl TaskSource for SupabaseClient {
  async fn fetch_tasks(&self, user_id: &str) -> SourceResult<Vec<Task>> {
    let user_filter = eq(user_id);
    let url = self.endpoint(&[
      ("select", "*"),
      ("user_id", user_filter.as_str()),
      ("order", "created_at.desc"),
    ]);
    send_json(self.request(Method::GET, url)).await
  }

  async fn create_task(&self, user_id: &str, task: &NewTask) -> SourceResult<Task> {
    let url = self.endpoint(&[]);
    let body = ApiNewTask { user_id, task };
    let rows: Vec<Task> = send_json(
      self
        .request(Method::POST, url)
        .header("Prefer", "return=representation")
        .json(&body),
    )
    .await?;
    single(rows, "created task")
  }

  async fn update_task(&self, id: &str, patch: &TaskPatch) -> SourceResult<Task> {
    let id_filter = eq(id);
    let url = self.endpoint(&[("id", id_filter.as_str())]);
    let rows: Vec<Task> = send_json(
      self
        .request(Method::PATCH, url)
        .header("Prefer", "return=representation")
        .json(patch),
    )
    .await?;
    single(rows, &format!("task {}", id))
  }

  async fn update_many(&self, ids: &[String], patch: &TaskPatch) -> SourceResult<Vec<Task>> {
    let id_filter = in_list(ids);
    let url = self.endpoint(&[("id", id_filter.as_str())]);
    send_json(
      self
        .request(Method::PATCH, url)
        .header("Prefer", "return=representation")
        .json(patch),
    )
    .await
  }

  async fn delete_task(&self, id: &str) -> SourceResult<()> {
    let id_filter = eq(id);
    let url = self.endpoint(&[("id", id_filter.as_str())]);
    send(
      self
        .request(Method::DELETE, url)
        .header("Prefer", "return=minimal"),
    )
    .await?;
    Ok(())
  }

  /// Polls row stamps and reports differences between consecutive polls.
  async fn subscribe(&self, user_id: &str) -> SourceResult<Subscription> {
    let (tx, rx) = mpsc::channel(64);
    let stop = CancellationToken::new();

    let client = self.clone();
    let user_id = user_id.to_string();
    let poll_stop = stop.clone();
    tokio::spawn(async move {
      let mut previous: Option<Snapshot> = None;
      let mut ticker = tokio::time::interval(client.poll_interval);
      loop {
        tokio::select! {
          _ = poll_stop.cancelled() => break,
          _ = ticker.tick() => {}
        }

        let current = match client.fetch_stamps(&user_id).await {
          Ok(rows) => snapshot(rows),
          Err(e) => {
            debug!(user_id = %user_id, error = %e, "Change poll failed");
            continue;
          }
        };

        if let Some(previous) = &previous {
          for event in diff_snapshots(previous, &current) {
            if tx.send(event).await.is_err() {
              return;
            }
          }
        }
        previous = Some(current);
      }
    });

    Ok(Subscription::new(rx, stop))
  }
}
