//! Call signaling configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use crate::actors::RoomSettings;

use common::jwt::{DEFAULT_CLOCK_SKEW, MAX_CLOCK_SKEW};
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default room capacity.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 8;

/// Default reconnect window after an unexpected disconnect.
pub const DEFAULT_DISCONNECT_GRACE_PERIOD_SECONDS: u64 = 30;

/// Default lifetime of an empty room.
pub const DEFAULT_EMPTY_ROOM_IDLE_SECONDS: u64 = 10;

/// Default server ping period.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 15;

/// Default inbound silence before a channel counts as dropped.
pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 45;

/// Default public STUN server.
pub const DEFAULT_STUN_URLS: &str = "stun:stun.l.google.com:19302";

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "cs";

/// Call signaling configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// WebSocket server bind address (default: "0.0.0.0:8080").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this instance, used in logs.
    pub instance_id: String,

    /// Ed25519 public key of the identity issuer (base64url raw or PEM).
    pub auth_public_key: String,

    /// Allowed `iat` skew for user tokens in seconds.
    pub jwt_clock_skew_seconds: u64,

    /// Capacity for newly created rooms.
    pub default_max_participants: usize,

    pub disconnect_grace_period_seconds: u64,

    pub empty_room_idle_seconds: u64,

    pub heartbeat_interval_seconds: u64,

    pub idle_timeout_seconds: u64,

    /// Credential service URL; selects the HTTP ICE provider when set.
    pub ice_provider_url: Option<String>,

    /// Bearer key for the credential service.
    pub ice_provider_api_key: Option<SecretString>,

    pub stun_urls: Vec<String>,

    pub turn_urls: Vec<String>,

    pub turn_username: Option<String>,

    /// Protected by `SecretString` to prevent accidental logging.
    pub turn_credential: Option<SecretString>,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("instance_id", &self.instance_id)
            .field("auth_public_key", &self.auth_public_key)
            .field("jwt_clock_skew_seconds", &self.jwt_clock_skew_seconds)
            .field("default_max_participants", &self.default_max_participants)
            .field(
                "disconnect_grace_period_seconds",
                &self.disconnect_grace_period_seconds,
            )
            .field("empty_room_idle_seconds", &self.empty_room_idle_seconds)
            .field(
                "heartbeat_interval_seconds",
                &self.heartbeat_interval_seconds,
            )
            .field("idle_timeout_seconds", &self.idle_timeout_seconds)
            .field("ice_provider_url", &self.ice_provider_url)
            .field(
                "ice_provider_api_key",
                &self.ice_provider_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("stun_urls", &self.stun_urls)
            .field("turn_urls", &self.turn_urls)
            .field("turn_username", &self.turn_username)
            .field(
                "turn_credential",
                &self.turn_credential.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// See [`Config::from_vars`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// `MissingEnvVar` when `CS_AUTH_PUBLIC_KEY` is absent, `InvalidValue`
    /// for unparseable or out-of-range numbers.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let auth_public_key = vars
            .get("CS_AUTH_PUBLIC_KEY")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("CS_AUTH_PUBLIC_KEY".to_string()))?
            .clone();

        let signaling_bind_address = vars
            .get("CS_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("CS_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let jwt_clock_skew_seconds = parse_positive(
            vars,
            "CS_JWT_CLOCK_SKEW_SECONDS",
            DEFAULT_CLOCK_SKEW.as_secs(),
        )?;
        if jwt_clock_skew_seconds > MAX_CLOCK_SKEW.as_secs() {
            return Err(ConfigError::InvalidValue(format!(
                "CS_JWT_CLOCK_SKEW_SECONDS must not exceed {} seconds, got {jwt_clock_skew_seconds}",
                MAX_CLOCK_SKEW.as_secs()
            )));
        }

        let default_max_participants = usize::try_from(parse_positive(
            vars,
            "CS_DEFAULT_MAX_PARTICIPANTS",
            DEFAULT_MAX_PARTICIPANTS as u64,
        )?)
        .map_err(|e| {
            ConfigError::InvalidValue(format!("CS_DEFAULT_MAX_PARTICIPANTS out of range: {e}"))
        })?;

        let disconnect_grace_period_seconds = parse_positive(
            vars,
            "CS_DISCONNECT_GRACE_PERIOD_SECONDS",
            DEFAULT_DISCONNECT_GRACE_PERIOD_SECONDS,
        )?;

        let empty_room_idle_seconds = parse_positive(
            vars,
            "CS_EMPTY_ROOM_IDLE_SECONDS",
            DEFAULT_EMPTY_ROOM_IDLE_SECONDS,
        )?;

        let heartbeat_interval_seconds = parse_positive(
            vars,
            "CS_HEARTBEAT_INTERVAL_SECONDS",
            DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
        )?;

        let idle_timeout_seconds = parse_positive(
            vars,
            "CS_IDLE_TIMEOUT_SECONDS",
            DEFAULT_IDLE_TIMEOUT_SECONDS,
        )?;
        if idle_timeout_seconds <= heartbeat_interval_seconds {
            return Err(ConfigError::InvalidValue(format!(
                "CS_IDLE_TIMEOUT_SECONDS ({idle_timeout_seconds}) must exceed \
                 CS_HEARTBEAT_INTERVAL_SECONDS ({heartbeat_interval_seconds})"
            )));
        }

        let ice_provider_url = non_empty(vars, "CS_ICE_PROVIDER_URL");
        let ice_provider_api_key = non_empty(vars, "CS_ICE_PROVIDER_API_KEY").map(SecretString::from);

        let stun_urls = vars
            .get("CS_STUN_URLS")
            .map_or_else(|| split_list(DEFAULT_STUN_URLS), |v| split_list(v));
        let turn_urls = vars
            .get("CS_TURN_URLS")
            .map(|v| split_list(v))
            .unwrap_or_default();
        let turn_username = non_empty(vars, "CS_TURN_USERNAME");
        let turn_credential = non_empty(vars, "CS_TURN_CREDENTIAL").map(SecretString::from);

        // Generate instance ID
        let instance_id = vars.get("CS_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            signaling_bind_address,
            health_bind_address,
            instance_id,
            auth_public_key,
            jwt_clock_skew_seconds,
            default_max_participants,
            disconnect_grace_period_seconds,
            empty_room_idle_seconds,
            heartbeat_interval_seconds,
            idle_timeout_seconds,
            ice_provider_url,
            ice_provider_api_key,
            stun_urls,
            turn_urls,
            turn_username,
            turn_credential,
        })
    }

    /// Per-room policy derived from this configuration.
    #[must_use]
    pub fn room_settings(&self) -> RoomSettings {
        RoomSettings {
            default_max_participants: self.default_max_participants,
            grace_period: Duration::from_secs(self.disconnect_grace_period_seconds),
            empty_room_idle: Duration::from_secs(self.empty_room_idle_seconds),
        }
    }

    #[must_use]
    pub fn jwt_clock_skew(&self) -> Duration {
        Duration::from_secs(self.jwt_clock_skew_seconds)
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }
}

fn parse_positive(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    let Some(value_str) = vars.get(name) else {
        return Ok(default);
    };

    let value: u64 = value_str.trim().parse().map_err(|e| {
        ConfigError::InvalidValue(format!(
            "{name} must be a valid positive integer, got '{value_str}': {e}"
        ))
    })?;

    if value == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "{name} must be greater than 0"
        )));
    }

    Ok(value)
}

fn non_empty(vars: &HashMap<String, String>, name: &str) -> Option<String> {
    vars.get(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
