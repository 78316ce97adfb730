//! Channel authentication.
//!
//! A client presents a user token issued by the auth subsystem before the
//! upgrade, either as `Authorization: Bearer <token>` or as the
//! `access_token` query parameter (browsers cannot set headers on a
//! WebSocket handshake). The verified subject becomes the channel identity
//! for every later operation.

use crate::errors::SignalingError;

use async_trait::async_trait;
use axum::http::HeaderMap;
use common::jwt::{check_token_size, decode_ed25519_public_key, validate_iat, UserClaims};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use std::time::Duration;
use tracing::{debug, instrument};

/// Query parameter carrying the token when no header is sent.
pub const ACCESS_TOKEN_QUERY_PARAM: &str = "access_token";

/// Verified identity of a channel.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    /// Display name from the token, used when a join omits one.
    pub display_name: Option<String>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &"[REDACTED]")
            .field("display_name", &self.display_name.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Verifies client tokens.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Resolve `token` to an identity.
    ///
    /// # Errors
    ///
    /// `Unauthenticated` for any invalid token.
    async fn verify(&self, token: &str) -> Result<Identity, SignalingError>;
}

/// Verifies EdDSA (Ed25519) user tokens against a fixed public key.
pub struct JwtIdentityVerifier {
    decoding_key: DecodingKey,
    clock_skew: Duration,
}

impl JwtIdentityVerifier {
    /// Create a verifier for the auth subsystem's public key.
    ///
    /// `public_key` is either base64url raw key bytes or a PEM block.
    ///
    /// # Errors
    ///
    /// `Config` if the key cannot be decoded.
    pub fn new(public_key: &str, clock_skew: Duration) -> Result<Self, SignalingError> {
        let public_key_bytes = decode_ed25519_public_key(public_key)
            .map_err(|e| SignalingError::Config(format!("auth public key: {e}")))?;

        Ok(Self {
            decoding_key: DecodingKey::from_ed_der(&public_key_bytes),
            clock_skew,
        })
    }
}

impl std::fmt::Debug for JwtIdentityVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtIdentityVerifier")
            .field("clock_skew", &self.clock_skew)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentityVerifier {
    #[instrument(skip_all, name = "cs.auth.verify")]
    async fn verify(&self, token: &str) -> Result<Identity, SignalingError> {
        check_token_size(token).map_err(unauthenticated)?;

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.required_spec_claims.clear();
        validation.required_spec_claims.insert("exp".to_string());

        let token_data =
            decode::<UserClaims>(token, &self.decoding_key, &validation).map_err(|e| {
                debug!(target: "cs.auth", error = %e, "Token verification failed");
                SignalingError::Unauthenticated("The access token is invalid or expired".to_string())
            })?;
        let claims = token_data.claims;

        validate_iat(claims.iat, self.clock_skew).map_err(unauthenticated)?;
        let user_id = claims.require_subject().map_err(unauthenticated)?.to_string();

        Ok(Identity {
            user_id,
            display_name: claims.name.filter(|name| !name.trim().is_empty()),
        })
    }
}

fn unauthenticated(e: common::jwt::JwtValidationError) -> SignalingError {
    SignalingError::Unauthenticated(e.to_string())
}

/// Pull the token from the `Authorization` header, falling back to the
/// `access_token` query parameter.
///
/// # Errors
///
/// `Unauthenticated` when neither carries a token.
pub fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Result<String, SignalingError> {
    if let Some(auth_header) = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
    {
        let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
            debug!(target: "cs.auth", "Invalid Authorization header format");
            SignalingError::Unauthenticated("Invalid Authorization header format".to_string())
        })?;
        return Ok(token.trim().to_string());
    }

    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == ACCESS_TOKEN_QUERY_PARAM)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            debug!(target: "cs.auth", "Missing access token");
            SignalingError::Unauthenticated("Missing access token".to_string())
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use ring::signature::{Ed25519KeyPair, KeyPair};

    const SEED: [u8; 32] = [7u8; 32];
    const OTHER_SEED: [u8; 32] = [9u8; 32];

    fn pkcs8_from_seed(seed: &[u8; 32]) -> Vec<u8> {
        let mut pkcs8 = vec![
            0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22,
            0x04, 0x20,
        ];
        pkcs8.extend_from_slice(seed);
        pkcs8
    }

    fn public_key_b64(seed: &[u8; 32]) -> String {
        let keypair = Ed25519KeyPair::from_seed_unchecked(seed).unwrap();
        URL_SAFE_NO_PAD.encode(keypair.public_key().as_ref())
    }

    fn sign(seed: &[u8; 32], claims: &UserClaims) -> String {
        let key = EncodingKey::from_ed_der(&pkcs8_from_seed(seed));
        encode(&Header::new(Algorithm::EdDSA), claims, &key).unwrap()
    }

    fn verifier() -> JwtIdentityVerifier {
        JwtIdentityVerifier::new(&public_key_b64(&SEED), Duration::from_secs(300)).unwrap()
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    #[tokio::test]
    async fn test_valid_token_yields_identity() {
        let claims = UserClaims::new("alice", Some("Alice".to_string()), now(), Duration::from_secs(600));
        let identity = verifier().verify(&sign(&SEED, &claims)).await.unwrap();

        assert_eq!(identity.user_id, "alice");
        assert_eq!(identity.display_name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let claims = UserClaims::new("alice", None, now(), Duration::from_secs(600));
        let err = verifier().verify(&sign(&OTHER_SEED, &claims)).await.unwrap_err();
        assert!(matches!(err, SignalingError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let mut claims = UserClaims::new("alice", None, now() - 3600, Duration::from_secs(60));
        claims.exp = now() - 10;
        let err = verifier().verify(&sign(&SEED, &claims)).await.unwrap_err();
        assert!(matches!(err, SignalingError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn test_future_iat_rejected() {
        let claims = UserClaims::new("alice", None, now() + 3600, Duration::from_secs(600));
        let err = verifier().verify(&sign(&SEED, &claims)).await.unwrap_err();
        assert!(matches!(err, SignalingError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn test_blank_subject_rejected() {
        let claims = UserClaims::new("  ", None, now(), Duration::from_secs(600));
        let err = verifier().verify(&sign(&SEED, &claims)).await.unwrap_err();
        assert!(matches!(err, SignalingError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn test_oversized_and_garbage_tokens_rejected() {
        let verifier = verifier();
        let oversized = "a".repeat(common::jwt::MAX_JWT_SIZE_BYTES + 1);

        assert!(matches!(
            verifier.verify(&oversized).await,
            Err(SignalingError::Unauthenticated(_))
        ));
        assert!(matches!(
            verifier.verify("not.a.jwt").await,
            Err(SignalingError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_invalid_public_key_is_config_error() {
        let result = JwtIdentityVerifier::new("short", Duration::from_secs(300));
        assert!(matches!(result, Err(SignalingError::Config(_))));
    }

    #[test]
    fn test_extract_token_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc.def.ghi".parse().unwrap());

        assert_eq!(extract_token(&headers, None).unwrap(), "abc.def.ghi");
    }

    #[test]
    fn test_extract_token_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer from-header".parse().unwrap());

        let token = extract_token(&headers, Some("access_token=from-query")).unwrap();
        assert_eq!(token, "from-header");
    }

    #[test]
    fn test_extract_token_from_query() {
        let token =
            extract_token(&HeaderMap::new(), Some("room=r1&access_token=abc.def.ghi")).unwrap();
        assert_eq!(token, "abc.def.ghi");
    }

    #[test]
    fn test_extract_token_rejects_basic_auth_and_missing() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic dXNlcjpwYXNz".parse().unwrap());
        assert!(matches!(
            extract_token(&headers, None),
            Err(SignalingError::Unauthenticated(_))
        ));

        assert!(matches!(
            extract_token(&HeaderMap::new(), Some("access_token=")),
            Err(SignalingError::Unauthenticated(_))
        ));
        assert!(matches!(
            extract_token(&HeaderMap::new(), None),
            Err(SignalingError::Unauthenticated(_))
        ));
    }

    #[test]
    fn test_identity_debug_redacts() {
        let identity = Identity {
            user_id: "alice".to_string(),
            display_name: Some("Alice".to_string()),
        };
        assert!(!format!("{identity:?}").contains("alice"));
    }
}
