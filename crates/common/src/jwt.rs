//! User token helpers shared by the signaling gateway and its test tooling.
//!
//! The auth subsystem issues Ed25519-signed (`EdDSA`) user tokens. This module
//! holds the pieces that do not depend on a JWT library:
//! - Size limits checked before any parsing
//! - Clock skew constants and `iat` validation
//! - The user claims structure
//! - Ed25519 public key decoding (raw base64url or SPKI PEM)
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - Error messages are generic to prevent information leakage
//! - The `sub` field in claims is redacted in Debug output

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed JWT size in bytes (8KB).
///
/// Typical user tokens are 200-500 bytes. Anything larger is rejected before
/// base64 decoding or signature verification.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Default JWT clock skew tolerance (5 minutes).
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Maximum allowed JWT clock skew tolerance (10 minutes).
///
/// Configuration above this value is rejected at startup.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

/// Length of a raw Ed25519 public key.
pub const ED25519_PUBLIC_KEY_LEN: usize = 32;

/// DER prefix of a `SubjectPublicKeyInfo` wrapping an Ed25519 key (RFC 8410).
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during user token validation.
///
/// Every variant renders the same message. Details go to debug logs only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds maximum allowed.
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Token is not a well-formed JWT or its signature does not verify.
    #[error("The access token is invalid or expired")]
    MalformedToken,

    /// Token is past its `exp`.
    #[error("The access token is invalid or expired")]
    Expired,

    /// Token `iat` claim is too far in the future.
    #[error("The access token is invalid or expired")]
    IatTooFarInFuture,

    /// Token carries an empty `sub`.
    #[error("The access token is invalid or expired")]
    MissingSubject,

    /// Configured verification key is not a usable Ed25519 public key.
    #[error("Invalid Ed25519 public key")]
    InvalidPublicKey,
}

// =============================================================================
// Claims Types
// =============================================================================

/// Claims carried by a user token issued by the auth subsystem.
///
/// `sub` is the user id the signaling service trusts for every operation on
/// the channel. It is redacted in Debug output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserClaims {
    /// Subject (user id).
    pub sub: String,

    /// Optional display name chosen by the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Issued-at timestamp (Unix epoch seconds).
    pub iat: i64,
}

impl fmt::Debug for UserClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserClaims")
            .field("sub", &"[REDACTED]")
            .field("name", &self.name.as_ref().map(|_| "[REDACTED]"))
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .finish()
    }
}

impl UserClaims {
    /// Creates claims for `sub` valid for `ttl` from `now` (Unix seconds).
    #[must_use]
    pub fn new(sub: impl Into<String>, name: Option<String>, now: i64, ttl: Duration) -> Self {
        #[allow(clippy::cast_possible_wrap)]
        let ttl_secs = ttl.as_secs() as i64;
        Self {
            sub: sub.into(),
            name,
            exp: now.saturating_add(ttl_secs),
            iat: now,
        }
    }

    /// Reject claims whose subject is empty or whitespace.
    ///
    /// # Errors
    ///
    /// Returns `JwtValidationError::MissingSubject` for a blank `sub`.
    pub fn require_subject(&self) -> Result<&str, JwtValidationError> {
        if self.sub.trim().is_empty() {
            tracing::debug!(target: "common.jwt", "Token rejected: empty subject");
            return Err(JwtValidationError::MissingSubject);
        }
        Ok(&self.sub)
    }
}

// =============================================================================
// Functions
// =============================================================================

/// Reject tokens larger than [`MAX_JWT_SIZE_BYTES`] before any parsing.
///
/// # Errors
///
/// Returns `JwtValidationError::TokenTooLarge` for oversized tokens.
pub fn check_token_size(token: &str) -> Result<(), JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }
    Ok(())
}

/// Validate the `iat` (issued-at) claim with clock skew tolerance.
///
/// # Errors
///
/// Returns `JwtValidationError::IatTooFarInFuture` if `iat` is more than
/// `clock_skew` ahead of the current time.
pub fn validate_iat(iat: i64, clock_skew: Duration) -> Result<(), JwtValidationError> {
    let now = chrono::Utc::now().timestamp();
    validate_iat_at(iat, clock_skew, now)
}

/// Deterministic `iat` validation against an explicit `now` timestamp.
pub(crate) fn validate_iat_at(
    iat: i64,
    clock_skew: Duration,
    now: i64,
) -> Result<(), JwtValidationError> {
    // clock_skew is bounded by MAX_CLOCK_SKEW
    #[allow(clippy::cast_possible_wrap)]
    let clock_skew_secs = clock_skew.as_secs() as i64;
    let max_iat = now + clock_skew_secs;

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat = iat,
            now = now,
            max_allowed = max_iat,
            "Token rejected: iat too far in the future"
        );
        return Err(JwtValidationError::IatTooFarInFuture);
    }

    Ok(())
}

/// Decode an Ed25519 public key into its raw 32 bytes.
///
/// Accepts either the base64url (no padding) form used in JWK `x` fields or a
/// PEM `PUBLIC KEY` block holding an RFC 8410 `SubjectPublicKeyInfo`.
///
/// # Errors
///
/// Returns `JwtValidationError::InvalidPublicKey` when the input does not
/// decode to exactly one Ed25519 key.
pub fn decode_ed25519_public_key(encoded: &str) -> Result<Vec<u8>, JwtValidationError> {
    let trimmed = encoded.trim();

    let raw = if trimmed.starts_with("-----BEGIN") {
        let b64: String = trimmed
            .lines()
            .filter(|line| !line.starts_with("-----"))
            .map(str::trim)
            .collect();
        let der = STANDARD.decode(b64).map_err(|e| {
            tracing::debug!(target: "common.jwt", error = %e, "Public key PEM is not valid base64");
            JwtValidationError::InvalidPublicKey
        })?;
        der.strip_prefix(&ED25519_SPKI_PREFIX[..])
            .ok_or(JwtValidationError::InvalidPublicKey)?
            .to_vec()
    } else {
        URL_SAFE_NO_PAD.decode(trimmed).map_err(|e| {
            tracing::debug!(target: "common.jwt", error = %e, "Public key is not valid base64url");
            JwtValidationError::InvalidPublicKey
        })?
    };

    if raw.len() != ED25519_PUBLIC_KEY_LEN {
        tracing::debug!(
            target: "common.jwt",
            length = raw.len(),
            "Public key has unexpected length"
        );
        return Err(JwtValidationError::InvalidPublicKey);
    }

    Ok(raw)
}

// =============================================================================
// Tests
// =============================================================================
