//! Error types for the latchkey broker

use thiserror::Error;

/// Broker error
///
/// The Display texts keep "not reachable", "not authorized" and "rejected by
/// the relying party" distinct: the remediation for each is different and the
/// consent layer shows these messages verbatim.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A record already exists where creation requires absence
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A required record is missing
    ///
    /// Plain lookups never raise this; they resolve to `Ok(None)` so callers
    /// can apply default-creation logic. This variant is reserved for
    /// partial updates against a record that must be present.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed origin, empty uid, or other bad input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The relying party refused the registration
    #[error("Registration rejected by relying party: {0}")]
    RegistrationRejected(String),

    /// The relying party refused the login
    #[error("Login rejected by relying party: {0}")]
    LoginRejected(String),

    /// The helper daemon refused the session token
    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    /// The helper daemon answered outside its protocol
    #[error("Daemon error: {0}")]
    Daemon(String),

    /// Network-level failure, the remote side was not reachable
    #[error("Service not reachable: {0}")]
    Transport(#[from] reqwest::Error),

    /// Share grant against a field the identity does not declare
    #[error("Unknown field: {0}")]
    UnknownField(String),

    /// A stored record or wire body failed to (de)serialize
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Key decoding or challenge decryption failed
    #[error("Crypto error: {0}")]
    Crypto(String),
}

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;
