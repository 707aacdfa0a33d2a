//! Identity registry
//!
//! One service record per origin plus one identity record per (origin, uid),
//! mirroring the store layout:
//!
//! ```text
//! origins                                      index of known origin keys
//! services/{scheme:host:port}                  service record, uid index
//! services/{scheme:host:port}/identities/{uid} identity record
//! ```
//!
//! Field values are `Option<String>`: `None` is the declared-but-empty
//! sentinel, distinguishable from an undeclared field so the UI can prompt
//! the user to fill it in.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BrokerError, Result};
use crate::origin::Origin;
use crate::store::KeyValueStore;

const ORIGINS_KEY: &str = "origins";

/// One profile attribute on an identity: its value and the usernames
/// currently granted visibility of it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldRecord {
    /// `None` until the user fills the field in
    #[serde(default)]
    pub value: Option<String>,
    /// Usernames permitted to view this field
    #[serde(default)]
    pub shared_with: BTreeSet<String>,
}

/// One registered account at one origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// URL form of the owning origin
    pub origin: String,
    /// Server-assigned unique identifier
    pub uid: String,
    /// Base64 secret key answering this identity's challenges
    pub private_key: String,
    /// Profile attributes declared by the relying party
    #[serde(default)]
    pub fields: BTreeMap<String, FieldRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ServiceRecord {
    origin: String,
    #[serde(default)]
    uids: Vec<String>,
}

/// Durable mapping from (origin, uid) to identity records.
#[derive(Clone)]
pub struct IdentityRegistry {
    store: Arc<dyn KeyValueStore>,
}

impl IdentityRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn service_key(origin: &Origin) -> String {
        format!("services/{}", origin.storage_key())
    }

    fn identity_key(origin: &Origin, uid: &str) -> String {
        format!("services/{}/identities/{}", origin.storage_key(), uid)
    }

    /// All origins with at least one known service record.
    pub async fn list_origins(&self) -> Result<Vec<Origin>> {
        let raw = match self.store.get(ORIGINS_KEY).await? {
            Some(raw) => raw,
            None => return Ok(Vec::new()),
        };

        let keys: Vec<String> = serde_json::from_str(&raw)?;
        keys.iter().map(|k| Origin::from_key(k)).collect()
    }

    /// All identities at an origin, ordered by uid. Unknown origins yield an
    /// empty list, never an error.
    pub async fn list_identities(&self, origin: &Origin) -> Result<Vec<Identity>> {
        let service = match self.service(origin).await? {
            Some(service) => service,
            None => return Ok(Vec::new()),
        };

        let mut uids = service.uids;
        uids.sort();

        let mut identities = Vec::with_capacity(uids.len());
        for uid in &uids {
            if let Some(identity) = self.get_identity(origin, uid).await? {
                identities.push(identity);
            }
        }
        Ok(identities)
    }

    pub async fn get_identity(&self, origin: &Origin, uid: &str) -> Result<Option<Identity>> {
        match self.store.get(&Self::identity_key(origin, uid)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Create an identity for (origin, uid).
    ///
    /// Fails `AlreadyExists` when the pair is already present and
    /// `InvalidArgument` when the uid is empty. Declared fields are seeded
    /// with the empty sentinel.
    pub async fn create_identity(
        &self,
        origin: &Origin,
        uid: &str,
        private_key: &str,
        declared_fields: &[String],
    ) -> Result<Identity> {
        if uid.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "identity uid must not be empty".to_string(),
            ));
        }

        let identity = Identity {
            origin: origin.url(),
            uid: uid.to_string(),
            private_key: private_key.to_string(),
            fields: declared_fields
                .iter()
                .map(|name| (name.clone(), FieldRecord::default()))
                .collect(),
        };

        self.store
            .create(
                &Self::identity_key(origin, uid),
                &serde_json::to_string(&identity)?,
            )
            .await?;

        self.index_identity(origin, uid).await?;
        debug!(origin = %origin, uid, "created identity");

        Ok(identity)
    }

    /// Delete an identity record and drop it from the service index.
    ///
    /// Deleting an absent identity is not an error.
    pub async fn delete_identity(&self, origin: &Origin, uid: &str) -> Result<()> {
        self.store.remove(&Self::identity_key(origin, uid)).await?;

        if let Some(mut service) = self.service(origin).await? {
            service.uids.retain(|u| u != uid);
            self.store
                .set(&Self::service_key(origin), &serde_json::to_string(&service)?)
                .await?;
        }
        Ok(())
    }

    /// Upsert one field value. Creates the identity record with empty state
    /// first when absent; the write is never silently dropped.
    pub async fn set_field_value(
        &self,
        origin: &Origin,
        uid: &str,
        field: &str,
        value: &str,
    ) -> Result<()> {
        let mut identity = match self.get_identity(origin, uid).await? {
            Some(identity) => identity,
            None => self.create_identity(origin, uid, "", &[]).await?,
        };

        identity
            .fields
            .entry(field.to_string())
            .or_default()
            .value = Some(value.to_string());

        self.put_identity(origin, &identity).await
    }

    /// Seed every declared field absent from the map with the empty
    /// sentinel. Pre-existing values are never overwritten; applying the
    /// same declared set twice is a no-op the second time.
    pub async fn reconcile_declared_fields(
        &self,
        origin: &Origin,
        uid: &str,
        declared_fields: &[String],
    ) -> Result<()> {
        let mut identity = self
            .get_identity(origin, uid)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("no identity for {origin}:{uid}")))?;

        let mut changed = false;
        for name in declared_fields {
            if !identity.fields.contains_key(name) {
                identity.fields.insert(name.clone(), FieldRecord::default());
                changed = true;
            }
        }

        if changed {
            self.put_identity(origin, &identity).await?;
        }
        Ok(())
    }

    pub(crate) async fn put_identity(&self, origin: &Origin, identity: &Identity) -> Result<()> {
        self.store
            .set(
                &Self::identity_key(origin, &identity.uid),
                &serde_json::to_string(identity)?,
            )
            .await
    }

    async fn service(&self, origin: &Origin) -> Result<Option<ServiceRecord>> {
        match self.store.get(&Self::service_key(origin)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Record the uid on the service record and the origin on the global
    /// index, creating either as needed.
    async fn index_identity(&self, origin: &Origin, uid: &str) -> Result<()> {
        let mut service = self.service(origin).await?.unwrap_or(ServiceRecord {
            origin: origin.url(),
            uids: Vec::new(),
        });

        if !service.uids.iter().any(|u| u == uid) {
            service.uids.push(uid.to_string());
            self.store
                .set(&Self::service_key(origin), &serde_json::to_string(&service)?)
                .await?;
        }

        let mut origins: Vec<String> = match self.store.get(ORIGINS_KEY).await? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };
        let key = origin.storage_key();
        if !origins.contains(&key) {
            origins.push(key);
            self.store
                .set(ORIGINS_KEY, &serde_json::to_string(&origins)?)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry() -> IdentityRegistry {
        IdentityRegistry::new(Arc::new(MemoryStore::new()))
    }

    fn origin() -> Origin {
        Origin::parse("https://example.com").unwrap()
    }

    #[tokio::test]
    async fn duplicate_identity_fails_leaving_first_intact() {
        let registry = registry();
        registry
            .create_identity(&origin(), "42", "key-a", &["name".to_string()])
            .await
            .unwrap();

        let err = registry
            .create_identity(&origin(), "42", "key-b", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyExists(_)));

        let stored = registry.get_identity(&origin(), "42").await.unwrap().unwrap();
        assert_eq!(stored.private_key, "key-a");
        assert!(stored.fields.contains_key("name"));
    }

    #[tokio::test]
    async fn empty_uid_is_invalid() {
        let err = registry()
            .create_identity(&origin(), "", "key", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn unknown_origin_lists_empty() {
        assert!(registry().list_identities(&origin()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn identities_are_ordered_and_indexed() {
        let registry = registry();
        registry
            .create_identity(&origin(), "7", "k7", &[])
            .await
            .unwrap();
        registry
            .create_identity(&origin(), "3", "k3", &[])
            .await
            .unwrap();

        let identities = registry.list_identities(&origin()).await.unwrap();
        let uids: Vec<&str> = identities.iter().map(|i| i.uid.as_str()).collect();
        assert_eq!(uids, vec!["3", "7"]);

        let origins = registry.list_origins().await.unwrap();
        assert_eq!(origins, vec![origin()]);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_and_preserves_values() {
        let registry = registry();
        registry
            .create_identity(&origin(), "1", "key", &[])
            .await
            .unwrap();
        registry
            .set_field_value(&origin(), "1", "first_name", "Ada")
            .await
            .unwrap();

        let declared = vec!["first_name".to_string(), "email".to_string()];
        registry
            .reconcile_declared_fields(&origin(), "1", &declared)
            .await
            .unwrap();
        let once = registry.get_identity(&origin(), "1").await.unwrap().unwrap();

        registry
            .reconcile_declared_fields(&origin(), "1", &declared)
            .await
            .unwrap();
        let twice = registry.get_identity(&origin(), "1").await.unwrap().unwrap();

        assert_eq!(once.fields, twice.fields);
        assert_eq!(once.fields["first_name"].value.as_deref(), Some("Ada"));
        assert_eq!(once.fields["email"].value, None);
    }

    #[tokio::test]
    async fn set_field_value_creates_missing_identity() {
        let registry = registry();
        registry
            .set_field_value(&origin(), "9", "nick", "val")
            .await
            .unwrap();

        let identity = registry.get_identity(&origin(), "9").await.unwrap().unwrap();
        assert_eq!(identity.fields["nick"].value.as_deref(), Some("val"));
    }

    #[tokio::test]
    async fn delete_identity_updates_index() {
        let registry = registry();
        registry
            .create_identity(&origin(), "1", "key", &[])
            .await
            .unwrap();
        registry.delete_identity(&origin(), "1").await.unwrap();

        assert!(registry.get_identity(&origin(), "1").await.unwrap().is_none());
        assert!(registry.list_identities(&origin()).await.unwrap().is_empty());

        // Deleting again is a no-op.
        registry.delete_identity(&origin(), "1").await.unwrap();
    }
}
