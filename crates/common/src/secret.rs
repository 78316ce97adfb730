//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used throughout the signaling service.
//! `SecretString` implements `Debug` with redaction, so a config struct or
//! provider that derives `Debug` never prints a TURN credential or an API key
//! through `{:?}` or a tracing field. Values are zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct TurnServer {
//!     username: String,
//!     credential: SecretString,
//! }
//!
//! let turn = TurnServer {
//!     username: "relay-user".to_string(),
//!     credential: SecretString::from("turn-password"),
//! };
//!
//! // Redacted
//! let printed = format!("{turn:?}");
//! assert!(!printed.contains("turn-password"));
//!
//! // Access requires an explicit call
//! let credential: &str = turn.credential.expose_secret();
//! assert_eq!(credential, "turn-password");
//! ```
//!
//! Use `SecretString` for TURN credentials, ICE provider API keys and bearer
//! tokens. Use `SecretBox<T>` for binary key material.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("turn-password");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("turn-password"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("api-key-123");
        assert_eq!(secret.expose_secret(), "api-key-123");
    }

    #[test]
    fn test_struct_with_secret_is_safe() {
        #[allow(dead_code)]
        #[derive(Debug)]
        struct IceProviderCredentials {
            endpoint: String,
            api_key: SecretString,
        }

        let creds = IceProviderCredentials {
            endpoint: "https://ice.example.com".to_string(),
            api_key: SecretString::from("super-secret"),
        };

        let debug_str = format!("{creds:?}");

        assert!(debug_str.contains("ice.example.com"));
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("super-secret"));
    }

    #[test]
    fn test_deserialize() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct TurnCredentials {
            username: String,
            credential: SecretString,
        }

        let json = r#"{"username": "relay", "credential": "my-secret-value"}"#;
        let creds: TurnCredentials = serde_json::from_str(json).expect("deserialize");

        assert_eq!(creds.credential.expose_secret(), "my-secret-value");

        let debug = format!("{creds:?}");
        assert!(!debug.contains("my-secret-value"));
        assert!(debug.contains("REDACTED"));
    }
}
