//! Canonical origin handling
//!
//! A relying party is identified by `scheme:host:port`. Two textual forms
//! exist and convert bijectively:
//!
//! - URL form `scheme://host:port`, what the browser hands us
//! - storage-key form `scheme:host:port`, what records are keyed by
//!
//! A third, filename-safe form replaces `:` with `@` for substrates that
//! cannot carry colons in keys (`@` is not valid in any origin).

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{BrokerError, Result};

/// Canonical identity of a relying party: scheme, host and port.
///
/// Construction always normalizes: the port is made explicit, defaulting
/// only for schemes with a well-known default (http 80, https 443). Any
/// other scheme must carry an explicit port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Origin {
    scheme: String,
    host: String,
    port: u16,
}

impl Origin {
    /// Parse the URL form, `scheme://host[:port]`. Any path, query or
    /// fragment after the authority is ignored.
    pub fn parse(input: &str) -> Result<Self> {
        let (scheme, rest) = input.split_once("://").ok_or_else(|| {
            BrokerError::InvalidArgument(format!("invalid origin {input:?}, expected scheme://host"))
        })?;

        let scheme = scheme.to_ascii_lowercase();
        let valid_scheme = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !valid_scheme {
            return Err(BrokerError::InvalidArgument(format!(
                "invalid scheme in origin {input:?}"
            )));
        }

        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    BrokerError::InvalidArgument(format!("invalid port in origin {input:?}"))
                })?;
                (host, port)
            }
            None => {
                let port = default_port(&scheme).ok_or_else(|| {
                    BrokerError::InvalidArgument(format!(
                        "origin {input:?} has no port and scheme {scheme:?} has no default"
                    ))
                })?;
                (authority, port)
            }
        };

        if host.is_empty() {
            return Err(BrokerError::InvalidArgument(format!(
                "origin {input:?} has no host"
            )));
        }

        Ok(Self {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    /// Parse the storage-key form, `scheme:host:port`.
    pub fn from_key(key: &str) -> Result<Self> {
        let mut parts = key.split(':');
        let (scheme, host, port) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(s), Some(h), Some(p), None) if !s.is_empty() && !h.is_empty() => (s, h, p),
            _ => {
                return Err(BrokerError::InvalidArgument(format!(
                    "invalid origin key {key:?}, expected scheme:host:port"
                )))
            }
        };

        let port: u16 = port.parse().map_err(|_| {
            BrokerError::InvalidArgument(format!("invalid port in origin key {key:?}"))
        })?;

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_string(),
            port,
        })
    }

    /// Parse the filename-safe form, `scheme@host@port`.
    pub fn from_file_key(key: &str) -> Result<Self> {
        Self::from_key(&key.replace('@', ":"))
    }

    /// Storage-key form, `scheme:host:port`.
    pub fn storage_key(&self) -> String {
        format!("{}:{}:{}", self.scheme, self.host, self.port)
    }

    /// Filename-safe form, `scheme@host@port`. Windows filesystems reject
    /// colons, and `@` never appears in a valid origin.
    pub fn file_key(&self) -> String {
        self.storage_key().replace(':', "@")
    }

    /// URL form, `scheme://host:port`, with the port always explicit.
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

impl FromStr for Origin {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Origin {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.url())
    }
}

impl<'de> Deserialize<'de> for Origin {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Origin::parse(&s).map_err(D::Error::custom)
    }
}
