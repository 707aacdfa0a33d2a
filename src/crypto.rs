//! Keypair and challenge crypto
//!
//! The relying party proves key possession by sealing a nonce to the
//! identity's public key; the broker opens it locally and answers with a
//! digest. Sealing is an x25519 sealed box:
//!
//! ```text
//! wire = base64( ephemeral_pub(32) || nonce(12) || ciphertext )
//! key  = SHA-256( dh(ephemeral, recipient) || ephemeral_pub || recipient_pub )
//! ```
//!
//! The broker itself only ever opens; `seal` exists for relying-party
//! implementations and tests.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::error::{BrokerError, Result};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// An x25519 keypair bound to one origin.
///
/// The secret never leaves the local store; the public half is disclosed to
/// the relying party at registration. `StaticSecret` zeroizes on drop.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a keypair from its base64 secret, as persisted in the store.
    pub fn from_secret_b64(encoded: &str) -> Result<Self> {
        let bytes = decode_key(encoded)?;
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Base64 public key, the form disclosed at registration.
    pub fn public_b64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// Base64 secret key, the form persisted in the store.
    pub fn secret_b64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }

    /// Open a sealed challenge nonce.
    pub fn open(&self, sealed_b64: &str) -> Result<Vec<u8>> {
        let sealed = BASE64
            .decode(sealed_b64)
            .map_err(|e| BrokerError::Crypto(format!("invalid sealed nonce: {e}")))?;

        if sealed.len() < KEY_LEN + NONCE_LEN {
            return Err(BrokerError::Crypto(format!(
                "sealed nonce too short: {} bytes",
                sealed.len()
            )));
        }

        let mut eph_bytes = [0u8; KEY_LEN];
        eph_bytes.copy_from_slice(&sealed[..KEY_LEN]);
        let ephemeral = PublicKey::from(eph_bytes);

        let shared = self.secret.diffie_hellman(&ephemeral);
        let key = derive_key(shared.as_bytes(), &ephemeral, &self.public);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let nonce = Nonce::from_slice(&sealed[KEY_LEN..KEY_LEN + NONCE_LEN]);

        cipher
            .decrypt(nonce, &sealed[KEY_LEN + NONCE_LEN..])
            .map_err(|_| BrokerError::Crypto("failed to open sealed nonce".to_string()))
    }
}

/// Seal a plaintext to a base64 recipient public key.
pub fn seal(recipient_b64: &str, plaintext: &[u8]) -> Result<String> {
    let recipient = PublicKey::from(decode_key(recipient_b64)?);

    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral = PublicKey::from(&ephemeral_secret);
    let shared = ephemeral_secret.diffie_hellman(&recipient);
    let key = derive_key(shared.as_bytes(), &ephemeral, &recipient);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| BrokerError::Crypto("failed to seal nonce".to_string()))?;

    let mut wire = Vec::with_capacity(KEY_LEN + NONCE_LEN + ciphertext.len());
    wire.extend_from_slice(ephemeral.as_bytes());
    wire.extend_from_slice(&nonce_bytes);
    wire.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(wire))
}

fn derive_key(shared: &[u8], ephemeral: &PublicKey, recipient: &PublicKey) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(shared);
    hasher.update(ephemeral.as_bytes());
    hasher.update(recipient.as_bytes());
    hasher.finalize().into()
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| BrokerError::Crypto(format!("invalid key encoding: {e}")))?;

    bytes.try_into().map_err(|v: Vec<u8>| {
        BrokerError::Crypto(format!("invalid key length: expected 32, got {}", v.len()))
    })
}

/// Versioned digest of the challenge answer.
///
/// The digest is a protocol parameter of the engine rather than a constant:
/// the wire name doubles as a protocol version so an incompatible choice can
/// never be confused for this one. SHA-256 is the only supported version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChallengeDigest {
    #[default]
    Sha256,
}

impl ChallengeDigest {
    /// Protocol version name carried on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ChallengeDigest::Sha256 => "sha256-v1",
        }
    }

    /// Hex digest over `challenge_id:answer`.
    pub fn compute(&self, challenge_id: &str, answer: &str) -> String {
        match self {
            ChallengeDigest::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(challenge_id.as_bytes());
                hasher.update(b":");
                hasher.update(answer.as_bytes());
                hex::encode(hasher.finalize())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let keypair = Keypair::generate();
        let sealed = seal(&keypair.public_b64(), b"123").unwrap();
        assert_eq!(keypair.open(&sealed).unwrap(), b"123");
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let sealed = seal(&keypair.public_b64(), b"secret").unwrap();

        let err = other.open(&sealed).unwrap_err();
        assert!(matches!(err, BrokerError::Crypto(_)));
    }

    #[test]
    fn open_rejects_truncated_input() {
        let keypair = Keypair::generate();
        let err = keypair.open(&BASE64.encode([0u8; 16])).unwrap_err();
        assert!(matches!(err, BrokerError::Crypto(_)));
    }

    #[test]
    fn secret_round_trips_through_base64() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_b64(&keypair.secret_b64()).unwrap();
        assert_eq!(restored.public_b64(), keypair.public_b64());

        let sealed = seal(&keypair.public_b64(), b"after restore").unwrap();
        assert_eq!(restored.open(&sealed).unwrap(), b"after restore");
    }

    #[test]
    fn digest_matches_fixed_vector() {
        let digest = ChallengeDigest::Sha256;
        assert_eq!(digest.wire_name(), "sha256-v1");
        assert_eq!(
            digest.compute("c1", "123"),
            "ae4d44aefb752b0b04894428c4e6d8cebd1b2041aa954e2c1412c2079021cbf5"
        );
    }
}
