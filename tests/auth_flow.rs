//! End-to-end authentication flows against a mocked relying party
//!
//! The mock server plays the relying party: it captures the public key at
//! registration and seals login nonces to it, so the full
//! register → discover fields → challenge → answer sequence runs unmodified.

use std::sync::{Arc, Mutex};

use latchkey::{
    AuthEngine, AuthOutcome, AuthRequest, BrokerError, DaemonConfig, DaemonStore, KeyValueStore,
    Keypair, MemoryStore, Origin, StaticGate,
};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const STATE: &str = "csrf-state";
const ANSWER: &str = "123";
const CHALLENGE_ID: &str = "c1";
// sha256("c1:123")
const EXPECTED_SIGNATURE: &str = "ae4d44aefb752b0b04894428c4e6d8cebd1b2041aa954e2c1412c2079021cbf5";

fn auth_request(server: &MockServer) -> AuthRequest {
    AuthRequest {
        origin: Origin::parse(&server.uri()).unwrap(),
        app_name: "Example App".to_string(),
        register_callback: "/auth/register".to_string(),
        login_callback: "/auth/login".to_string(),
        map_path: "/auth/map".to_string(),
        state: STATE.to_string(),
    }
}

/// Captures the registered public key and hands out a fixed uid.
struct RegisterResponder {
    pub_key: Arc<Mutex<Option<String>>>,
    uid: &'static str,
}

impl Respond for RegisterResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let pub_key = url::form_urlencoded::parse(&request.body)
            .find(|(k, _)| k == "pub_key")
            .map(|(_, v)| v.into_owned());
        *self.pub_key.lock().unwrap() = pub_key;

        ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "uid": self.uid,
        }))
    }
}

/// Seals the challenge answer to whatever public key was registered.
struct ChallengeResponder {
    pub_key: Arc<Mutex<Option<String>>>,
}

impl Respond for ChallengeResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let pub_key = self
            .pub_key
            .lock()
            .unwrap()
            .clone()
            .expect("no public key registered");
        let nonce = latchkey::seal(&pub_key, ANSWER.as_bytes()).unwrap();

        ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "nonce": nonce,
            "challenge_id": CHALLENGE_ID,
        }))
    }
}

async fn mount_relying_party(server: &MockServer, pub_key: Arc<Mutex<Option<String>>>) {
    Mock::given(method("POST"))
        .and(path("/auth/register"))
        .and(header("X-CSRF-Token", STATE))
        .respond_with(RegisterResponder {
            pub_key: pub_key.clone(),
            uid: "42",
        })
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/auth/map"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "placeholders": ["display_name"],
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ChallengeResponder { pub_key })
        .mount(server)
        .await;
}

/// Scenario: no stored identity. The engine registers, persists uid 42,
/// seeds the declared field with the empty sentinel, then answers the
/// challenge with the fixed-vector digest.
#[tokio::test]
async fn fresh_origin_registers_then_logs_in() {
    let server = MockServer::start().await;
    let pub_key = Arc::new(Mutex::new(None));
    mount_relying_party(&server, pub_key.clone()).await;

    let engine = AuthEngine::new(Arc::new(MemoryStore::new()));
    let gate = StaticGate::approve_all();

    let outcome = engine
        .authenticate(auth_request(&server), &gate)
        .await
        .unwrap();
    assert_eq!(gate.prompts_seen(), 1);

    let AuthOutcome::Completed { uid, submission } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(uid, "42");
    assert_eq!(
        submission.action,
        format!("{}/auth/login", Origin::parse(&server.uri()).unwrap().url())
    );
    assert!(submission
        .fields
        .contains(&("signature".to_string(), EXPECTED_SIGNATURE.to_string())));
    assert!(submission
        .fields
        .contains(&("csrfmiddlewaretoken".to_string(), STATE.to_string())));

    // Registration state persisted with uid 42.
    let origin = Origin::parse(&server.uri()).unwrap();
    let record = engine.keystore().get(&origin).await.unwrap().unwrap();
    assert_eq!(record.uid.as_deref(), Some("42"));
    assert_eq!(Some(record.public_key), *pub_key.lock().unwrap());

    // Declared field seeded with the empty sentinel, value still unset.
    let identity = engine
        .registry()
        .get_identity(&origin, "42")
        .await
        .unwrap()
        .unwrap();
    assert!(identity.fields.contains_key("display_name"));
    assert_eq!(identity.fields["display_name"].value, None);
}

/// Scenario: identity already registered. The engine skips registration and
/// goes straight to the challenge.
#[tokio::test]
async fn known_identity_skips_registration() {
    let server = MockServer::start().await;
    let pub_key = Arc::new(Mutex::new(None));
    mount_relying_party(&server, pub_key.clone()).await;

    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let engine = AuthEngine::new(store);
    let origin = Origin::parse(&server.uri()).unwrap();

    // Pre-provision a registered identity.
    let keypair = Keypair::generate();
    engine.keystore().create_with(&origin, &keypair).await.unwrap();
    engine.keystore().set_remote_id(&origin, "42").await.unwrap();
    engine
        .registry()
        .create_identity(&origin, "42", &keypair.secret_b64(), &[])
        .await
        .unwrap();
    *pub_key.lock().unwrap() = Some(keypair.public_b64());

    let gate = StaticGate::approve_all();
    let outcome = engine
        .authenticate(auth_request(&server), &gate)
        .await
        .unwrap();

    let AuthOutcome::Completed { uid, submission } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(uid, "42");
    assert!(submission
        .fields
        .contains(&("signature".to_string(), EXPECTED_SIGNATURE.to_string())));

    // No registration call was made.
    let requests = server.received_requests().await.unwrap();
    assert!(requests.iter().all(|r| r.url.path() != "/auth/register"));
}

/// Scenario: the relying party rejects registration. The pending record is
/// cleaned up and a later attempt registers from scratch.
#[tokio::test]
async fn rejected_registration_leaves_no_orphans() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/register"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "status": "error",
            "error": "username taken",
        })))
        .mount(&server)
        .await;

    let engine = AuthEngine::new(Arc::new(MemoryStore::new()));
    let gate = StaticGate::approve_all();
    let origin = Origin::parse(&server.uri()).unwrap();

    let err = engine
        .authenticate(auth_request(&server), &gate)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::RegistrationRejected(_)));

    // The partially created records are gone.
    assert!(engine.keystore().get(&origin).await.unwrap().is_none());
    assert!(engine
        .registry()
        .get_identity(&origin, "42")
        .await
        .unwrap()
        .is_none());

    // A subsequent attempt resolves to "no identity" and registers again.
    server.reset().await;
    let pub_key = Arc::new(Mutex::new(None));
    mount_relying_party(&server, pub_key).await;

    let outcome = engine
        .authenticate(auth_request(&server), &gate)
        .await
        .unwrap();
    assert!(matches!(outcome, AuthOutcome::Completed { uid, .. } if uid == "42"));
}

/// Scenario: the user denies at the consent gate. Nothing reaches the
/// relying party and nothing is persisted.
#[tokio::test]
async fn deny_aborts_without_side_effects() {
    let server = MockServer::start().await;
    let pub_key = Arc::new(Mutex::new(None));
    mount_relying_party(&server, pub_key).await;

    let store = Arc::new(MemoryStore::new());
    let engine = AuthEngine::new(store.clone());
    let gate = StaticGate::deny_all();

    let outcome = engine
        .authenticate(auth_request(&server), &gate)
        .await
        .unwrap();
    assert!(matches!(outcome, AuthOutcome::Denied));

    assert!(server.received_requests().await.unwrap().is_empty());
    assert!(store.list("").await.unwrap().is_empty());
}

#[tokio::test]
async fn daemon_store_distinguishes_absent_from_unauthorized() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/store/missing"))
        .and(header("Authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/store/guarded"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/store/present"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "data": "value",
        })))
        .mount(&server)
        .await;

    let store = DaemonStore::new(DaemonConfig {
        base_url: server.uri(),
        session_token: "tok".to_string(),
        ..Default::default()
    });

    // Missing keys are absent values, not errors.
    assert_eq!(store.get("missing").await.unwrap(), None);

    // A refused token is its own failure mode, distinct from transport.
    let err = store.get("guarded").await.unwrap_err();
    assert!(matches!(err, BrokerError::NotAuthorized(_)));

    assert_eq!(store.get("present").await.unwrap().as_deref(), Some("value"));
}

#[tokio::test]
async fn daemon_store_create_conflict_maps_to_already_exists() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/store/taken"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let store = DaemonStore::new(DaemonConfig {
        base_url: server.uri(),
        session_token: "tok".to_string(),
        ..Default::default()
    });

    let err = store.create("taken", "v").await.unwrap_err();
    assert!(matches!(err, BrokerError::AlreadyExists(_)));
}
