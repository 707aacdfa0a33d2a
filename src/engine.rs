//! Authentication protocol engine
//!
//! Drives one registration/login flow end to end. All flow state lives in a
//! per-attempt [`AuthAttempt`] context so concurrent attempts in separate
//! tabs can never contaminate each other; the shared store is the only
//! serialization point between them.
//!
//! ```text
//! Idle -> ResolvingIdentity -> [Registering ->] AwaitingChallenge
//!      -> AnsweringChallenge -> Completed | Failed
//! ```
//!
//! Consent is a suspension point before any backend call: a deny aborts with
//! no side effects. A registration that succeeded is never rolled back by a
//! later failure; a registration the relying party rejected is fully cleaned
//! up so a subsequent attempt registers again instead of seeing a stale
//! pending record.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::consent::{ConsentGate, ConsentPrompt, Decision};
use crate::crypto::{ChallengeDigest, Keypair};
use crate::error::{BrokerError, Result};
use crate::keystore::KeyStore;
use crate::registry::IdentityRegistry;
use crate::remote::{AuthRequest, ForegroundSubmission, RelyingPartyClient};
use crate::store::KeyValueStore;

/// States of one authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    ResolvingIdentity,
    Registering,
    AwaitingChallenge,
    AnsweringChallenge,
    Completed,
    Failed,
}

/// Per-flow context. Created once per attempt and threaded through every
/// transition; the engine keeps no ambient state.
struct AuthAttempt {
    request: AuthRequest,
    state: AuthState,
}

impl AuthAttempt {
    fn new(request: AuthRequest) -> Self {
        Self {
            request,
            state: AuthState::Idle,
        }
    }

    fn transition(&mut self, next: AuthState) {
        debug!(origin = %self.request.origin, from = ?self.state, to = ?next, "auth transition");
        self.state = next;
    }
}

/// How an attempt ended, short of an error.
#[derive(Debug)]
pub enum AuthOutcome {
    /// Challenge answered; the UI must now submit the foreground form to
    /// establish the relying party's session cookie.
    Completed {
        uid: String,
        submission: ForegroundSubmission,
    },
    /// The user rejected the consent prompt. No backend side effects.
    Denied,
}

/// Registration and login state machine over a shared store.
pub struct AuthEngine {
    keystore: KeyStore,
    registry: IdentityRegistry,
    digest: ChallengeDigest,
}

impl AuthEngine {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            keystore: KeyStore::new(store.clone()),
            registry: IdentityRegistry::new(store),
            digest: ChallengeDigest::default(),
        }
    }

    /// Override the challenge digest version.
    pub fn with_digest(mut self, digest: ChallengeDigest) -> Self {
        self.digest = digest;
        self
    }

    pub fn keystore(&self) -> &KeyStore {
        &self.keystore
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    /// Run one authentication flow: consent, registration if needed, then
    /// the login challenge-response.
    ///
    /// Failures are terminal for the attempt and carry the reason verbatim
    /// for the consent layer; nothing here retries.
    pub async fn authenticate(
        &self,
        request: AuthRequest,
        gate: &dyn ConsentGate,
    ) -> Result<AuthOutcome> {
        let mut attempt = AuthAttempt::new(request);
        match self.drive(&mut attempt, gate).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                attempt.transition(AuthState::Failed);
                warn!(origin = %attempt.request.origin, error = %err, "authentication failed");
                Err(err)
            }
        }
    }

    async fn drive(&self, attempt: &mut AuthAttempt, gate: &dyn ConsentGate) -> Result<AuthOutcome> {
        let origin = attempt.request.origin.clone();

        attempt.transition(AuthState::ResolvingIdentity);
        let record = self.keystore.get(&origin).await?;

        // A record without a uid is a stale pending registration; treat it
        // like a fresh one but keep its keypair.
        let existing_uid = record.as_ref().and_then(|r| r.uid.clone());
        let registering = existing_uid.is_none();
        let keypair = match &record {
            Some(record) => record.keypair()?,
            None => Keypair::generate(),
        };

        let decision = gate
            .decide(ConsentPrompt::Authenticate {
                origin: origin.clone(),
                app_name: attempt.request.app_name.clone(),
                registering,
                public_key: keypair.public_b64(),
                uid: existing_uid.clone(),
            })
            .await;
        if decision == Decision::Denied {
            info!(origin = %origin, "user denied authentication");
            return Ok(AuthOutcome::Denied);
        }

        let remote = RelyingPartyClient::new(attempt.request.clone());

        let uid = match existing_uid {
            Some(uid) => {
                // Heal a missing identity record for an already-registered
                // key.
                if self.registry.get_identity(&origin, &uid).await?.is_none() {
                    self.registry
                        .create_identity(&origin, &uid, &keypair.secret_b64(), &[])
                        .await?;
                }
                uid
            }
            None => {
                attempt.transition(AuthState::Registering);
                if record.is_none() {
                    // Compare-and-create: a concurrent tab registering for
                    // the same origin fails here instead of
                    // double-registering.
                    self.keystore.create_with(&origin, &keypair).await?;
                }

                match remote.register(&keypair.public_b64()).await {
                    Ok(uid) => {
                        // uid persisted strictly before any login traffic.
                        self.keystore.set_remote_id(&origin, &uid).await?;
                        self.registry
                            .create_identity(&origin, &uid, &keypair.secret_b64(), &[])
                            .await?;
                        info!(origin = %origin, %uid, "registered new identity");
                        uid
                    }
                    Err(err) => {
                        // No orphan pending records survive a failed
                        // registration; the next attempt registers from
                        // scratch.
                        self.keystore.delete(&origin).await?;
                        return Err(err);
                    }
                }
            }
        };

        attempt.transition(AuthState::AwaitingChallenge);
        let declared = remote.list_declared_fields().await?;
        self.registry
            .reconcile_declared_fields(&origin, &uid, &declared)
            .await?;
        let challenge = remote.begin_login(&uid).await?;

        attempt.transition(AuthState::AnsweringChallenge);
        let answer_bytes = keypair.open(&challenge.nonce)?;
        let answer = String::from_utf8(answer_bytes)
            .map_err(|_| BrokerError::Crypto("challenge answer is not valid UTF-8".to_string()))?;
        let signature = self.digest.compute(&challenge.challenge_id, &answer);
        let submission =
            remote.complete_login(&uid, &challenge.challenge_id, &signature, self.digest);

        attempt.transition(AuthState::Completed);
        info!(origin = %origin, %uid, "challenge answered");

        Ok(AuthOutcome::Completed { uid, submission })
    }
}
