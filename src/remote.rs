//! Relying-party protocol client
//!
//! Four operations against the relying party's callback endpoints, all
//! carrying the anti-forgery state token from the initiating page. Three are
//! silent background calls; login completion is deliberately not sent here —
//! it is returned as a form for the UI to navigate with, because only a
//! foreground, cookie-bearing navigation can establish the relying party's
//! own session cookie.
//!
//! Background calls require HTTP 200 and, where the body carries a `status`
//! field, the value `"success"`. Anything else is a protocol-level rejection
//! distinct from a transport failure.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::crypto::ChallengeDigest;
use crate::error::{BrokerError, Result};
use crate::origin::Origin;
use crate::sharing::PROTOCOL_SCHEME;

const CSRF_HEADER: &str = "X-CSRF-Token";

/// An authentication request as announced by the relying party, carried by a
/// `web+latchkey://authenticate?...` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub origin: Origin,
    /// Display name shown at the consent prompt
    pub app_name: String,
    /// Path of the registration callback, relative to the origin
    pub register_callback: String,
    /// Path of the login callback, relative to the origin
    pub login_callback: String,
    /// Path of the declared-field discovery endpoint
    pub map_path: String,
    /// Anti-forgery token round-tripped into every backend call
    pub state: String,
}

impl AuthRequest {
    /// Parse a protocol-handler URL of the form
    /// `web+latchkey://authenticate?origin=...&app_name=...&register_callback=...&login_callback=...&map_path=...&state=...`.
    pub fn parse(url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| BrokerError::InvalidArgument(format!("invalid auth URL: {e}")))?;

        if parsed.scheme() != PROTOCOL_SCHEME {
            return Err(BrokerError::InvalidArgument(format!(
                "unexpected scheme {:?}",
                parsed.scheme()
            )));
        }
        if parsed.host_str() != Some("authenticate") {
            return Err(BrokerError::InvalidArgument(format!(
                "unexpected route {:?}",
                parsed.host_str().unwrap_or_default()
            )));
        }

        let mut origin = None;
        let mut app_name = None;
        let mut register_callback = None;
        let mut login_callback = None;
        let mut map_path = None;
        let mut state = None;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "origin" => origin = Some(Origin::parse(&value)?),
                "app_name" => app_name = Some(value.into_owned()),
                "register_callback" => register_callback = Some(value.into_owned()),
                "login_callback" => login_callback = Some(value.into_owned()),
                "map_path" => map_path = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                _ => {}
            }
        }

        let missing = |name: &str| BrokerError::InvalidArgument(format!("missing {name}"));
        Ok(Self {
            origin: origin.ok_or_else(|| missing("origin"))?,
            app_name: app_name.unwrap_or_default(),
            register_callback: register_callback.ok_or_else(|| missing("register_callback"))?,
            login_callback: login_callback.ok_or_else(|| missing("login_callback"))?,
            map_path: map_path.ok_or_else(|| missing("map_path"))?,
            state: state.ok_or_else(|| missing("state"))?,
        })
    }
}

/// A server-issued login challenge.
#[derive(Debug, Clone, Deserialize)]
pub struct Challenge {
    /// Nonce sealed to the identity's public key
    pub nonce: String,
    pub challenge_id: String,
}

/// A login-completion form for the UI to submit as a foreground,
/// cookie-bearing navigation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForegroundSubmission {
    /// Form action URL
    pub action: String,
    /// Hidden form fields, in submission order
    pub fields: Vec<(String, String)>,
}

enum CallResult {
    Success(Value),
    Rejected(String),
}

/// HTTP client for one relying party's callback endpoints.
pub struct RelyingPartyClient {
    request: AuthRequest,
    client: Client,
}

impl RelyingPartyClient {
    pub fn new(request: AuthRequest) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("Failed to build HTTP client");

        Self { request, client }
    }

    pub fn request(&self) -> &AuthRequest {
        &self.request
    }

    fn callback_url(&self, path: &str) -> String {
        format!("{}{}", self.request.origin.url(), path)
    }

    /// Register the public key, returning the server-assigned uid.
    pub async fn register(&self, public_key: &str) -> Result<String> {
        let url = self.callback_url(&self.request.register_callback);
        debug!(%url, "registering with relying party");

        let body = self
            .post_background(&url, &[("pub_key", public_key.to_string())])
            .await?;
        let body = match body {
            CallResult::Success(body) => body,
            CallResult::Rejected(reason) => {
                return Err(BrokerError::RegistrationRejected(reason))
            }
        };

        field_as_string(&body, "uid")
            .ok_or_else(|| BrokerError::RegistrationRejected("response carried no uid".into()))
    }

    /// Request a login challenge for a registered identity.
    pub async fn begin_login(&self, uid: &str) -> Result<Challenge> {
        let url = self.callback_url(&self.request.login_callback);
        debug!(%url, uid, "requesting login challenge");

        let body = self
            .post_background(
                &url,
                &[
                    ("uid", uid.to_string()),
                    ("state", self.request.state.clone()),
                ],
            )
            .await?;
        let body = match body {
            CallResult::Success(body) => body,
            CallResult::Rejected(reason) => return Err(BrokerError::LoginRejected(reason)),
        };

        let nonce = field_as_string(&body, "nonce");
        let challenge_id = field_as_string(&body, "challenge_id");
        match (nonce, challenge_id) {
            (Some(nonce), Some(challenge_id)) => Ok(Challenge {
                nonce,
                challenge_id,
            }),
            _ => Err(BrokerError::LoginRejected(
                "challenge response was incomplete".to_string(),
            )),
        }
    }

    /// Build the foreground login-completion submission. Not sent here.
    pub fn complete_login(
        &self,
        uid: &str,
        challenge_id: &str,
        signature: &str,
        digest: ChallengeDigest,
    ) -> ForegroundSubmission {
        ForegroundSubmission {
            action: self.callback_url(&self.request.login_callback),
            fields: vec![
                ("uid".to_string(), uid.to_string()),
                ("challenge_id".to_string(), challenge_id.to_string()),
                ("signature".to_string(), signature.to_string()),
                ("digest".to_string(), digest.wire_name().to_string()),
                (
                    "csrfmiddlewaretoken".to_string(),
                    self.request.state.clone(),
                ),
            ],
        }
    }

    /// Field names the relying party wants populated.
    pub async fn list_declared_fields(&self) -> Result<Vec<String>> {
        let url = self.callback_url(&self.request.map_path);

        let body = self.post_background(&url, &[]).await?;
        let body = match body {
            CallResult::Success(body) => body,
            CallResult::Rejected(reason) => return Err(BrokerError::LoginRejected(reason)),
        };

        let placeholders = body
            .get("placeholders")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(placeholders)
    }

    async fn post_background(&self, url: &str, form: &[(&str, String)]) -> Result<CallResult> {
        let response = self
            .client
            .post(url)
            .header(CSRF_HEADER, &self.request.state)
            .form(form)
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Ok(CallResult::Rejected(format!("{status}: {body}")));
        }

        let body: Value = response.json().await?;
        if let Some(status) = body.get("status").and_then(Value::as_str) {
            if status != "success" {
                return Ok(CallResult::Rejected(format!("status {status:?}")));
            }
        }

        Ok(CallResult::Success(body))
    }
}

/// Read a response field that servers send as either a string or a number.
fn field_as_string(body: &Value, key: &str) -> Option<String> {
    match body.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
