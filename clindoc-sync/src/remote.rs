//! Remote record API
//!
//! A thin CRUD client per collection. It never retries and never falls back;
//! errors are surfaced as [`RemoteError`] and the controller decides what to
//! do with them.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::ids::EntityKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Record not found on server")]
    NotFound,

    #[error("Undecodable response: {0}")]
    Decode(String),

    #[error("Remote API unavailable")]
    Unavailable,
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// `GET /{collection}`
    async fn list(&self, kind: EntityKind) -> Result<Value, RemoteError>;

    /// `GET /{collection}/{id}`
    async fn fetch(&self, kind: EntityKind, id: &str) -> Result<Value, RemoteError>;

    /// `POST /{collection}`
    async fn create(&self, kind: EntityKind, body: Value) -> Result<Value, RemoteError>;

    /// `PUT /{collection}/{id}`
    async fn replace(&self, kind: EntityKind, id: &str, body: Value) -> Result<Value, RemoteError>;

    /// `DELETE /{collection}/{id}`
    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError>;

    /// `PATCH /encounters/{id}/soap`
    async fn patch_soap(&self, id: &str, body: Value) -> Result<Value, RemoteError>;

    /// `POST /encounters/{id}/sign`
    async fn sign(&self, id: &str, body: Value) -> Result<Value, RemoteError>;
}

// ============================================================================
// HTTP
// ============================================================================

pub struct HttpRemoteApi {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpRemoteApi {
    /// # Errors
    ///
    /// `Config` when the HTTP client cannot be built.
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn url(&self, kind: EntityKind, id: Option<&str>, action: Option<&str>) -> String {
        let mut url = format!("{}/{}", self.base_url, kind.collection());
        if let Some(id) = id {
            url.push('/');
            url.push_str(id);
        }
        if let Some(action) = action {
            url.push('/');
            url.push_str(action);
        }
        url
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let mut request = request;
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn send_json(&self, request: reqwest::RequestBuilder) -> Result<Value, RemoteError> {
        self.send(request)
            .await?
            .json::<Value>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn list(&self, kind: EntityKind) -> Result<Value, RemoteError> {
        self.send_json(self.client.get(self.url(kind, None, None))).await
    }

    async fn fetch(&self, kind: EntityKind, id: &str) -> Result<Value, RemoteError> {
        self.send_json(self.client.get(self.url(kind, Some(id), None))).await
    }

    async fn create(&self, kind: EntityKind, body: Value) -> Result<Value, RemoteError> {
        self.send_json(self.client.post(self.url(kind, None, None)).json(&body))
            .await
    }

    async fn replace(&self, kind: EntityKind, id: &str, body: Value) -> Result<Value, RemoteError> {
        self.send_json(self.client.put(self.url(kind, Some(id), None)).json(&body))
            .await
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError> {
        self.send(self.client.delete(self.url(kind, Some(id), None)))
            .await
            .map(|_| ())
    }

    async fn patch_soap(&self, id: &str, body: Value) -> Result<Value, RemoteError> {
        let url = self.url(EntityKind::Encounter, Some(id), Some("soap"));
        self.send_json(self.client.patch(url).json(&body)).await
    }

    async fn sign(&self, id: &str, body: Value) -> Result<Value, RemoteError> {
        let url = self.url(EntityKind::Encounter, Some(id), Some("sign"));
        self.send_json(self.client.post(url).json(&body)).await
    }
}

// ============================================================================
// In-process server
// ============================================================================

/// Request kinds counted by [`InMemoryRemoteApi`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    List,
    Fetch,
    Create,
    Replace,
    Delete,
    PatchSoap,
    Sign,
}

/// In-process stand-in for the record server, used by the CLI's offline mode
/// and by tests. Records are stored in wire shape and stamped with the same
/// bookkeeping columns a real server adds.
pub struct InMemoryRemoteApi {
    records: DashMap<EntityKind, Vec<Value>>,
    next_id: AtomicU64,
    available: AtomicBool,
    requests: DashMap<RemoteOp, usize>,
    latency: DashMap<RemoteOp, Duration>,
}

impl Default for InMemoryRemoteApi {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemoteApi {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            next_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
            requests: DashMap::new(),
            latency: DashMap::new(),
        }
    }

    /// Simulate the server going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every request of kind `op` before it is served.
    pub fn set_latency(&self, op: RemoteOp, latency: Duration) {
        self.latency.insert(op, latency);
    }

    pub fn request_count(&self, op: RemoteOp) -> usize {
        self.requests.get(&op).map_or(0, |count| *count)
    }

    /// Stored wire records of one collection, in creation order
    pub fn records(&self, kind: EntityKind) -> Vec<Value> {
        self.records
            .get(&kind)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    /// Insert a record as if another client had created it. Returns its id.
    pub fn seed(&self, kind: EntityKind, body: Value) -> String {
        let (id, stored) = self.stamp_new(kind, body);
        self.records.entry(kind).or_default().push(stored);
        id
    }

    async fn enter(&self, op: RemoteOp) -> Result<(), RemoteError> {
        *self.requests.entry(op).or_insert(0) += 1;
        let latency = self.latency.get(&op).map(|d| *d);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Unavailable)
        }
    }

    fn stamp_new(&self, kind: EntityKind, body: Value) -> (String, Value) {
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let prefix = match kind {
            EntityKind::Patient => "pat",
            EntityKind::Episode => "epi",
            EntityKind::Encounter => "enc",
        };
        let id = format!("{prefix}-{seq}");

        let mut fields = into_object(body);
        fields.insert("id".into(), Value::from(id.clone()));
        fields.insert("organization_id".into(), json!("org-local"));
        fields.insert("created_by".into(), json!("clindoc"));
        fields.insert("updated_by".into(), json!("clindoc"));
        fields.insert("row_version".into(), json!(1));
        (id, Value::Object(fields))
    }

    /// Apply `change` to the stored record `id` and return the result.
    fn modify<F>(&self, kind: EntityKind, id: &str, change: F) -> Result<Value, RemoteError>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let mut records = self.records.entry(kind).or_default();
        let stored = records
            .iter_mut()
            .find(|record| record.get("id").and_then(Value::as_str) == Some(id))
            .ok_or(RemoteError::NotFound)?;

        let Value::Object(fields) = &mut *stored else {
            return Err(RemoteError::Decode(format!("stored {kind} {id} is not an object")));
        };
        change(fields);
        let version = fields.get("row_version").and_then(Value::as_i64).unwrap_or(0);
        fields.insert("row_version".into(), json!(version + 1));
        Ok(stored.clone())
    }
}

fn into_object(body: Value) -> Map<String, Value> {
    match body {
        Value::Object(fields) => fields,
        _ => Map::new(),
    }
}

#[async_trait]
impl RemoteApi for InMemoryRemoteApi {
    async fn list(&self, kind: EntityKind) -> Result<Value, RemoteError> {
        self.enter(RemoteOp::List).await?;
        Ok(Value::Array(self.records(kind)))
    }

    async fn fetch(&self, kind: EntityKind, id: &str) -> Result<Value, RemoteError> {
        self.enter(RemoteOp::Fetch).await?;
        self.records(kind)
            .into_iter()
            .find(|record| record.get("id").and_then(Value::as_str) == Some(id))
            .ok_or(RemoteError::NotFound)
    }

    async fn create(&self, kind: EntityKind, body: Value) -> Result<Value, RemoteError> {
        self.enter(RemoteOp::Create).await?;
        let (_, stored) = self.stamp_new(kind, body);
        self.records.entry(kind).or_default().push(stored.clone());
        Ok(stored)
    }

    async fn replace(&self, kind: EntityKind, id: &str, body: Value) -> Result<Value, RemoteError> {
        self.enter(RemoteOp::Replace).await?;
        self.modify(kind, id, |fields| {
            for (column, value) in into_object(body) {
                if column != "id" && column != "organization_id" && column != "created_by" {
                    fields.insert(column, value);
                }
            }
        })
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError> {
        self.enter(RemoteOp::Delete).await?;
        let mut records = self.records.entry(kind).or_default();
        let before = records.len();
        records.retain(|record| record.get("id").and_then(Value::as_str) != Some(id));
        if records.len() == before {
            Err(RemoteError::NotFound)
        } else {
            Ok(())
        }
    }

    async fn patch_soap(&self, id: &str, body: Value) -> Result<Value, RemoteError> {
        self.enter(RemoteOp::PatchSoap).await?;
        let mut columns = into_object(body);
        let section = columns
            .remove("section")
            .and_then(|s| s.as_str().map(str::to_string))
            .ok_or_else(|| RemoteError::Status {
                status: 422,
                body: "missing section".into(),
            })?;
        let prefix = format!("{section}_");

        self.modify(EntityKind::Encounter, id, |fields| {
            for (column, value) in columns {
                if column.starts_with(&prefix) {
                    fields.insert(column, value);
                }
            }
        })
    }

    async fn sign(&self, id: &str, body: Value) -> Result<Value, RemoteError> {
        self.enter(RemoteOp::Sign).await?;
        let signed_by = body.get("signed_by").cloned().unwrap_or(Value::Null);
        let signed_at = body
            .get("signed_at")
            .cloned()
            .unwrap_or_else(|| json!(chrono::Utc::now()));

        self.modify(EntityKind::Encounter, id, |fields| {
            fields.insert("status".into(), json!("signed"));
            fields.insert("signed_by".into(), signed_by);
            fields.insert("signed_at".into(), signed_at);
        })
    }
}
