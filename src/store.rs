//! Storage substrate
//!
//! The broker treats persistence as an abstract key-value capability so the
//! backend can be swapped without the protocol or identity logic noticing.
//! Two implementations ship in-tree: a process-local [`MemoryStore`] and a
//! [`DaemonStore`] speaking HTTP to the local helper daemon.
//!
//! `create` is deliberately part of the trait: identity and key creation
//! require compare-and-create (fail if the key exists) so two concurrent
//! flows can never both register for the same origin. Plain field edits are
//! last-write-wins and go through `set`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{BrokerError, Result};

/// Reserved key for the persisted daemon base URL.
pub const DAEMON_URL_KEY: &str = "settings/daemon_url";
/// Reserved key for the persisted daemon session token.
pub const SESSION_TOKEN_KEY: &str = "settings/session_token";

/// Abstract durable mapping store.
///
/// Lookup misses resolve to `Ok(None)`, never errors, so callers can apply
/// default-creation logic uniformly. The store is the sole serialization
/// point between concurrent engine instances.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Upsert, last-write-wins.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Insert only where the key is absent; fails `AlreadyExists` otherwise.
    async fn create(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// List keys under a prefix, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-process store backed by a `tokio` RwLock map.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn create(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(key) {
            return Err(BrokerError::AlreadyExists(key.to_string()));
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Helper daemon connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Daemon base URL
    pub base_url: String,
    /// Session token authenticating the local user to the daemon
    pub session_token: String,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            session_token: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Load persisted daemon credentials from another store.
///
/// Missing keys mean "not configured", not an error.
pub async fn load_daemon_config(store: &dyn KeyValueStore) -> Result<Option<DaemonConfig>> {
    let base_url = store.get(DAEMON_URL_KEY).await?;
    let session_token = store.get(SESSION_TOKEN_KEY).await?;

    Ok(match (base_url, session_token) {
        (Some(base_url), Some(session_token)) => Some(DaemonConfig {
            base_url,
            session_token,
            ..Default::default()
        }),
        _ => None,
    })
}

/// Persist daemon credentials into another store.
pub async fn save_daemon_config(store: &dyn KeyValueStore, config: &DaemonConfig) -> Result<()> {
    store.set(DAEMON_URL_KEY, &config.base_url).await?;
    store.set(SESSION_TOKEN_KEY, &config.session_token).await
}

/// Response envelope used by the daemon. A present `status` must equal
/// `"success"`; anything else is a protocol-level failure.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: Option<String>,
    data: Option<T>,
    error: Option<String>,
}

/// Store backed by the local helper daemon over HTTP.
///
/// Every call carries the session token as a bearer credential. A 403 from
/// the daemon surfaces as [`BrokerError::NotAuthorized`], distinct from a
/// transport failure, because the fix (re-enter the token) is different.
pub struct DaemonStore {
    config: DaemonConfig,
    client: Client,
}

impl DaemonStore {
    pub fn new(config: DaemonConfig) -> Self {
        let mut headers = header::HeaderMap::new();
        if let Ok(value) =
            header::HeaderValue::from_str(&format!("Bearer {}", config.session_token))
        {
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to build HTTP client");

        Self { config, client }
    }

    fn entry_url(&self, key: &str) -> String {
        format!("{}/store/{}", self.config.base_url, urlencoding::encode(key))
    }

    async fn check<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<Option<T>> {
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if response.status() == StatusCode::FORBIDDEN {
            return Err(BrokerError::NotAuthorized(
                "daemon rejected the session token".to_string(),
            ));
        }
        if response.status() == StatusCode::CONFLICT {
            return Err(BrokerError::AlreadyExists(
                "daemon reported an existing key".to_string(),
            ));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Daemon(format!("returned {status}: {body}")));
        }

        let envelope: Envelope<T> = response.json().await?;
        if let Some(status) = &envelope.status {
            if status != "success" {
                return Err(BrokerError::Daemon(format!(
                    "status {status:?}: {}",
                    envelope.error.unwrap_or_default()
                )));
            }
        }

        Ok(envelope.data)
    }
}

#[derive(Serialize)]
struct PutBody<'a> {
    value: &'a str,
}

#[async_trait]
impl KeyValueStore for DaemonStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let response = self.client.get(self.entry_url(key)).send().await?;
        self.check(response).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let response = self
            .client
            .put(self.entry_url(key))
            .json(&PutBody { value })
            .send()
            .await?;
        self.check::<serde_json::Value>(response).await?;
        Ok(())
    }

    async fn create(&self, key: &str, value: &str) -> Result<()> {
        let response = self
            .client
            .post(self.entry_url(key))
            .json(&PutBody { value })
            .send()
            .await?;
        self.check::<serde_json::Value>(response).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let response = self.client.delete(self.entry_url(key)).send().await?;
        self.check::<serde_json::Value>(response).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/store?prefix={}",
            self.config.base_url,
            urlencoding::encode(prefix)
        );
        let response = self.client.get(&url).send().await?;
        Ok(self.check(response).await?.unwrap_or_default())
    }
}
