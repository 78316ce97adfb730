//! Deterministic cryptographic fixtures for testing
//!
//! Provides reproducible Ed25519 keypairs and signed user tokens.
//! All fixtures are deterministic based on seed values.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use common::jwt::UserClaims;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use ring::signature::{Ed25519KeyPair, KeyPair};
use std::time::Duration;
use thiserror::Error;

/// Default lifetime of tokens minted by [`TestKeypair::token_for`].
pub const TEST_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Test fixture error type
#[derive(Error, Debug)]
pub enum FixtureError {
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),
}

/// Ed25519 keypair standing in for the auth subsystem's signing key.
#[derive(Clone)]
pub struct TestKeypair {
    public_key_b64: String,
    pkcs8: Vec<u8>,
}

impl TestKeypair {
    /// Generate a deterministic keypair. The same seed always produces the
    /// same key.
    pub fn from_seed(seed: u8) -> Result<Self, FixtureError> {
        let mut seed_bytes = [0u8; 32];
        seed_bytes[0] = seed;
        for (i, byte) in seed_bytes.iter_mut().enumerate().skip(1) {
            *byte = seed.wrapping_mul(i as u8).wrapping_add(i as u8);
        }

        let key_pair = Ed25519KeyPair::from_seed_unchecked(&seed_bytes)
            .map_err(|e| FixtureError::Crypto(format!("Failed to generate test keypair: {e:?}")))?;

        Ok(Self {
            public_key_b64: URL_SAFE_NO_PAD.encode(key_pair.public_key().as_ref()),
            pkcs8: build_pkcs8_from_seed(&seed_bytes),
        })
    }

    /// Public key in the base64url form accepted by `CS_AUTH_PUBLIC_KEY`.
    pub fn public_key(&self) -> &str {
        &self.public_key_b64
    }

    /// Sign arbitrary claims.
    pub fn sign(&self, claims: &UserClaims) -> String {
        let key = EncodingKey::from_ed_der(&self.pkcs8);
        encode(&Header::new(Algorithm::EdDSA), claims, &key).expect("test token signing")
    }

    /// Valid token for `user_id`, issued now.
    pub fn token_for(&self, user_id: &str, name: Option<&str>) -> String {
        let now = chrono::Utc::now().timestamp();
        self.sign(&UserClaims::new(
            user_id,
            name.map(ToString::to_string),
            now,
            TEST_TOKEN_TTL,
        ))
    }

    /// Token for `user_id` that expired a minute ago.
    pub fn expired_token_for(&self, user_id: &str) -> String {
        let now = chrono::Utc::now().timestamp();
        let mut claims = UserClaims::new(user_id, None, now - 7200, TEST_TOKEN_TTL);
        claims.exp = now - 60;
        self.sign(&claims)
    }
}

/// Build PKCS#8 v1 document from Ed25519 seed
///
/// This is a test-only utility. Production code never handles private keys.
fn build_pkcs8_from_seed(seed: &[u8; 32]) -> Vec<u8> {
    // SEQUENCE { INTEGER 0, SEQUENCE { OID 1.3.101.112 }, OCTET STRING { OCTET STRING seed } }
    let mut pkcs8 = vec![
        0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04,
        0x20,
    ];
    pkcs8.extend_from_slice(seed);
    pkcs8
}
