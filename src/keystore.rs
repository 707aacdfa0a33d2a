//! Per-origin keypair and registration state
//!
//! One record per origin under `keys/{scheme:host:port}`. Creation is
//! compare-and-create through the store so two tabs can never both mint a
//! keypair for the same origin. Partial updates are read-modify-write and
//! preserve unrelated fields.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::Keypair;
use crate::error::{BrokerError, Result};
use crate::origin::Origin;
use crate::store::KeyValueStore;

/// Persisted keypair and registration state for one origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    /// URL form of the owning origin
    pub origin: String,
    /// Base64 public key, disclosed at registration
    pub public_key: String,
    /// Base64 secret key; never leaves the store
    pub private_key: String,
    /// Server-assigned uid; `None` while registration is pending
    #[serde(default)]
    pub uid: Option<String>,
}

impl KeyRecord {
    /// Rebuild the keypair from the persisted secret.
    pub fn keypair(&self) -> Result<Keypair> {
        Keypair::from_secret_b64(&self.private_key)
    }
}

/// Durable mapping from origin to keypair and registration state.
#[derive(Clone)]
pub struct KeyStore {
    store: Arc<dyn KeyValueStore>,
}

impl KeyStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn record_key(origin: &Origin) -> String {
        format!("keys/{}", origin.storage_key())
    }

    pub async fn get(&self, origin: &Origin) -> Result<Option<KeyRecord>> {
        match self.store.get(&Self::record_key(origin)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Create a record with a freshly generated keypair.
    ///
    /// Fails `AlreadyExists` when the origin already holds one.
    pub async fn create(&self, origin: &Origin) -> Result<KeyRecord> {
        self.create_with(origin, &Keypair::generate()).await
    }

    /// Create a record from a caller-supplied keypair, e.g. one already
    /// shown to the user at the consent prompt.
    pub async fn create_with(&self, origin: &Origin, keypair: &Keypair) -> Result<KeyRecord> {
        let record = KeyRecord {
            origin: origin.url(),
            public_key: keypair.public_b64(),
            private_key: keypair.secret_b64(),
            uid: None,
        };

        self.store
            .create(&Self::record_key(origin), &serde_json::to_string(&record)?)
            .await?;

        Ok(record)
    }

    /// Replace the private key, preserving all other fields.
    pub async fn set_private_key(&self, origin: &Origin, private_b64: &str) -> Result<()> {
        let keypair = Keypair::from_secret_b64(private_b64)?;
        self.update(origin, |record| {
            record.private_key = keypair.secret_b64();
            record.public_key = keypair.public_b64();
        })
        .await
    }

    /// Record the server-assigned uid, preserving all other fields.
    pub async fn set_remote_id(&self, origin: &Origin, uid: &str) -> Result<()> {
        let uid = uid.to_string();
        self.update(origin, move |record| record.uid = Some(uid)).await
    }

    /// Drop the record, e.g. after a rejected registration.
    pub async fn delete(&self, origin: &Origin) -> Result<()> {
        self.store.remove(&Self::record_key(origin)).await
    }

    async fn update<F>(&self, origin: &Origin, apply: F) -> Result<()>
    where
        F: FnOnce(&mut KeyRecord),
    {
        let key = Self::record_key(origin);
        let raw = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("no key record for {origin}")))?;

        let mut record: KeyRecord = serde_json::from_str(&raw)?;
        apply(&mut record);

        self.store.set(&key, &serde_json::to_string(&record)?).await
    }
}
