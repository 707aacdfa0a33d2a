//! Consent gate
//!
//! Every registration, login and share grant passes through an explicit
//! human approve/deny decision before the engine proceeds. The engine
//! suspends at [`ConsentGate::decide`]; the UI collaborator supplies the
//! decision. Nothing here renders anything.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::origin::Origin;

/// What the user is being asked to approve.
#[derive(Debug, Clone)]
pub enum ConsentPrompt {
    /// Register with or log into a relying party
    Authenticate {
        origin: Origin,
        /// Display name the relying party announced
        app_name: String,
        /// True when no identity exists yet and approval will register one
        registering: bool,
        /// Base64 public key that will be (or was) disclosed
        public_key: String,
        /// Existing uid when logging into a known identity
        uid: Option<String>,
    },
    /// Let `username` view one field of the identity's data
    Share {
        origin: Origin,
        uid: String,
        field: String,
        username: String,
    },
}

/// The user's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Denied,
}

/// The human-in-the-loop boundary.
#[async_trait]
pub trait ConsentGate: Send + Sync {
    async fn decide(&self, prompt: ConsentPrompt) -> Decision;
}

/// Gate returning a preset decision.
///
/// For tests and headless callers that resolve consent out of band.
pub struct StaticGate {
    decision: Decision,
    prompts_seen: AtomicU32,
}

impl StaticGate {
    pub fn approve_all() -> Self {
        Self::new(Decision::Approved)
    }

    pub fn deny_all() -> Self {
        Self::new(Decision::Denied)
    }

    pub fn new(decision: Decision) -> Self {
        Self {
            decision,
            prompts_seen: AtomicU32::new(0),
        }
    }

    /// Number of prompts this gate has answered.
    pub fn prompts_seen(&self) -> u32 {
        self.prompts_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsentGate for StaticGate {
    async fn decide(&self, _prompt: ConsentPrompt) -> Decision {
        self.prompts_seen.fetch_add(1, Ordering::SeqCst);
        self.decision
    }
}
