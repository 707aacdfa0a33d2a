//! Field sharing
//!
//! A grant makes one field of one identity visible to a named user at the
//! same origin. Grants live on the owning identity's field records, so they
//! can never drift from the fields they reference; the viewer-facing map is
//! derived on demand by [`SharingManager::resolve_visible`].

use std::collections::BTreeMap;

use tracing::debug;

use crate::consent::{ConsentGate, ConsentPrompt, Decision};
use crate::error::{BrokerError, Result};
use crate::origin::Origin;
use crate::registry::IdentityRegistry;

/// Protocol-handler scheme routed to this broker.
pub const PROTOCOL_SCHEME: &str = "web+latchkey";

/// Grants and revokes per-field visibility between identities.
#[derive(Clone)]
pub struct SharingManager {
    registry: IdentityRegistry,
}

impl SharingManager {
    pub fn new(registry: IdentityRegistry) -> Self {
        Self { registry }
    }

    /// Add `username` to the visibility set of one field.
    ///
    /// Idempotent: granting an already-granted username is a no-op. Fails
    /// `UnknownField` when the owner's identity does not declare the field.
    pub async fn grant(
        &self,
        origin: &Origin,
        owner_uid: &str,
        field: &str,
        username: &str,
    ) -> Result<()> {
        let mut identity = self
            .registry
            .get_identity(origin, owner_uid)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("no identity for {origin}:{owner_uid}")))?;

        let record = identity
            .fields
            .get_mut(field)
            .ok_or_else(|| BrokerError::UnknownField(format!("{field} on {origin}:{owner_uid}")))?;

        if record.shared_with.insert(username.to_string()) {
            debug!(origin = %origin, owner_uid, field, username, "granted field visibility");
            self.registry.put_identity(origin, &identity).await?;
        }
        Ok(())
    }

    /// Remove `username` from the visibility set of one field.
    ///
    /// Idempotent: revoking an absent grant, field or identity is a no-op.
    /// The underlying value is never touched.
    pub async fn revoke(
        &self,
        origin: &Origin,
        owner_uid: &str,
        field: &str,
        username: &str,
    ) -> Result<()> {
        let mut identity = match self.registry.get_identity(origin, owner_uid).await? {
            Some(identity) => identity,
            None => return Ok(()),
        };

        let changed = identity
            .fields
            .get_mut(field)
            .map(|record| record.shared_with.remove(username))
            .unwrap_or(false);

        if changed {
            debug!(origin = %origin, owner_uid, field, username, "revoked field visibility");
            self.registry.put_identity(origin, &identity).await?;
        }
        Ok(())
    }

    /// Fields a viewer may currently see across all identities at an origin,
    /// as uid → field → value. Only fields whose grant set contains the
    /// viewer and whose value is set appear; dangling grants resolve to
    /// nothing.
    pub async fn resolve_visible(
        &self,
        origin: &Origin,
        viewer: &str,
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
        let mut resolved = BTreeMap::new();

        for identity in self.registry.list_identities(origin).await? {
            let mut visible = BTreeMap::new();
            for (name, record) in &identity.fields {
                if !record.shared_with.contains(viewer) {
                    continue;
                }
                if let Some(value) = &record.value {
                    visible.insert(name.clone(), value.clone());
                }
            }
            if !visible.is_empty() {
                resolved.insert(identity.uid.clone(), visible);
            }
        }

        Ok(resolved)
    }

    /// Run an incoming share request through the consent gate, granting on
    /// approval. Returns whether the grant was applied.
    pub async fn handle_request(
        &self,
        request: &ShareRequest,
        gate: &dyn ConsentGate,
    ) -> Result<bool> {
        let decision = gate
            .decide(ConsentPrompt::Share {
                origin: request.origin.clone(),
                uid: request.uid.clone(),
                field: request.field.clone(),
                username: request.username.clone(),
            })
            .await;

        if decision == Decision::Denied {
            debug!(origin = %request.origin, "share request denied");
            return Ok(false);
        }

        self.grant(
            &request.origin,
            &request.uid,
            &request.field,
            &request.username,
        )
        .await?;
        Ok(true)
    }
}

/// A share request as carried by a `web+latchkey://share_request?...` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareRequest {
    pub origin: Origin,
    pub uid: String,
    pub field: String,
    pub username: String,
}

impl ShareRequest {
    /// Parse a protocol-handler URL of the form
    /// `web+latchkey://share_request?origin=...&uid=...&field_name=...&username=...`.
    pub fn parse(url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| BrokerError::InvalidArgument(format!("invalid share URL: {e}")))?;

        if parsed.scheme() != PROTOCOL_SCHEME {
            return Err(BrokerError::InvalidArgument(format!(
                "unexpected scheme {:?}",
                parsed.scheme()
            )));
        }

        let route = parsed.host_str().unwrap_or_default();
        if route != "share_request" {
            return Err(BrokerError::InvalidArgument(format!(
                "unexpected route {route:?}"
            )));
        }

        let mut origin = None;
        let mut uid = None;
        let mut field = None;
        let mut username = None;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "origin" => origin = Some(Origin::parse(&value)?),
                "uid" => uid = Some(value.into_owned()),
                "field_name" => field = Some(value.into_owned()),
                "username" => username = Some(value.into_owned()),
                _ => {}
            }
        }

        let missing = |name: &str| BrokerError::InvalidArgument(format!("missing {name}"));
        Ok(Self {
            origin: origin.ok_or_else(|| missing("origin"))?,
            uid: uid.ok_or_else(|| missing("uid"))?,
            field: field.ok_or_else(|| missing("field_name"))?,
            username: username.ok_or_else(|| missing("username"))?,
        })
    }
}
