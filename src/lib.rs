//! Passwordless authentication broker
//!
//! An identity holder keeps one asymmetric keypair per relying party
//! ("origin"), registers the public key once, and thereafter logs in by
//! opening a server-sealed challenge nonce with the private key. No password
//! ever crosses the wire. Identities additionally carry a profile field map
//! whose entries can be selectively shared with other identities at the
//! same origin.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use latchkey::{AuthEngine, AuthRequest, MemoryStore, StaticGate};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = AuthEngine::new(Arc::new(MemoryStore::new()));
//!
//! // Parsed from the `web+latchkey://authenticate?...` protocol URL.
//! let request = AuthRequest::parse(
//!     "web+latchkey://authenticate?origin=https%3A%2F%2Fexample.com\
//!      &register_callback=%2Fauth%2Fregister&login_callback=%2Fauth%2Flogin\
//!      &map_path=%2Fauth%2Fmap&state=token",
//! )?;
//!
//! // The gate is where the UI collects the user's approve/deny decision.
//! let gate = StaticGate::approve_all();
//! let outcome = engine.authenticate(request, &gate).await?;
//! # Ok(())
//! # }
//! ```

pub mod consent;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod keystore;
pub mod origin;
pub mod registry;
pub mod remote;
pub mod sharing;
pub mod store;

// Re-export main types
pub use consent::{ConsentGate, ConsentPrompt, Decision, StaticGate};
pub use crypto::{seal, ChallengeDigest, Keypair};
pub use engine::{AuthEngine, AuthOutcome, AuthState};
pub use error::{BrokerError, Result};
pub use keystore::{KeyRecord, KeyStore};
pub use origin::Origin;
pub use registry::{FieldRecord, Identity, IdentityRegistry};
pub use remote::{AuthRequest, Challenge, ForegroundSubmission, RelyingPartyClient};
pub use sharing::{ShareRequest, SharingManager};
pub use store::{
    load_daemon_config, save_daemon_config, DaemonConfig, DaemonStore, KeyValueStore, MemoryStore,
};
