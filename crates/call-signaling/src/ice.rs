//! ICE server configuration providers.
//!
//! Clients ask for STUN/TURN servers with `GetIceConfiguration`. This service
//! does not generate TURN credentials; it either hands out a static list from
//! configuration or fetches a per-user list from an external credential
//! service. Either way the result is relayed to the client unchanged.

use crate::config::Config;
use crate::errors::SignalingError;
use crate::protocol::{IceConfiguration, IceServer};

use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Timeout for credential service requests in seconds.
const ICE_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Source of ICE server lists.
#[async_trait]
pub trait IceConfigProvider: Send + Sync {
    /// ICE servers for `user_id`.
    ///
    /// # Errors
    ///
    /// `IceUnavailable` when the list cannot be produced.
    async fn ice_configuration(&self, user_id: &str) -> Result<IceConfiguration, SignalingError>;
}

/// Static TURN entry.
#[derive(Debug, Clone)]
pub struct TurnServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: SecretString,
}

/// Provider serving a fixed list from configuration.
#[derive(Debug, Clone)]
pub struct StaticIceConfigProvider {
    stun_urls: Vec<String>,
    turn: Option<TurnServer>,
}

impl StaticIceConfigProvider {
    #[must_use]
    pub fn new(stun_urls: Vec<String>, turn: Option<TurnServer>) -> Self {
        Self { stun_urls, turn }
    }
}

#[async_trait]
impl IceConfigProvider for StaticIceConfigProvider {
    async fn ice_configuration(&self, _user_id: &str) -> Result<IceConfiguration, SignalingError> {
        let mut ice_servers = Vec::with_capacity(2);

        if !self.stun_urls.is_empty() {
            ice_servers.push(IceServer {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }

        if let Some(turn) = &self.turn {
            ice_servers.push(IceServer {
                urls: turn.urls.clone(),
                username: Some(turn.username.clone()),
                credential: Some(turn.credential.expose_secret().to_string()),
            });
        }

        Ok(IceConfiguration {
            ice_servers,
            ttl_seconds: None,
        })
    }
}

/// Provider fetching per-user lists from a credential service.
///
/// Issues `GET <url>?userId=<id>` with an optional bearer API key and
/// expects an `IceConfiguration` JSON body.
#[derive(Clone)]
pub struct HttpIceConfigProvider {
    client: Client,
    url: String,
    api_key: Option<SecretString>,
}

impl HttpIceConfigProvider {
    /// Create a provider for `url`.
    ///
    /// # Errors
    ///
    /// `Config` if the HTTP client cannot be built.
    pub fn new(url: String, api_key: Option<SecretString>) -> Result<Self, SignalingError> {
        Self::with_timeout(url, api_key, Duration::from_secs(ICE_REQUEST_TIMEOUT_SECS))
    }

    /// Like [`HttpIceConfigProvider::new`] with an explicit request timeout.
    ///
    /// # Errors
    ///
    /// `Config` if the HTTP client cannot be built.
    pub fn with_timeout(
        url: String,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, SignalingError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| {
                error!(target: "cs.ice", error = %e, "Failed to build HTTP client");
                SignalingError::Config(format!("ICE provider HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            url,
            api_key,
        })
    }
}

impl std::fmt::Debug for HttpIceConfigProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpIceConfigProvider")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl IceConfigProvider for HttpIceConfigProvider {
    #[instrument(skip_all, name = "cs.ice.fetch")]
    async fn ice_configuration(&self, user_id: &str) -> Result<IceConfiguration, SignalingError> {
        let mut request = self.client.get(&self.url).query(&[("userId", user_id)]);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request.send().await.map_err(|e| {
            warn!(target: "cs.ice", error = %e, "ICE credential request failed");
            SignalingError::IceUnavailable("credential service unreachable".to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(target: "cs.ice", status = %status, "ICE credential service returned error");
            return Err(SignalingError::IceUnavailable(format!(
                "credential service returned {status}"
            )));
        }

        let configuration: IceConfiguration = response.json().await.map_err(|e| {
            warn!(target: "cs.ice", error = %e, "Failed to parse ICE credential response");
            SignalingError::IceUnavailable("invalid credential service response".to_string())
        })?;

        debug!(
            target: "cs.ice",
            servers = configuration.ice_servers.len(),
            ttl_seconds = ?configuration.ttl_seconds,
            "Fetched ICE configuration"
        );

        Ok(configuration)
    }
}

/// Build the provider selected by configuration.
///
/// The HTTP provider is used when `CS_ICE_PROVIDER_URL` is set, the static
/// list otherwise.
///
/// # Errors
///
/// `Config` if the HTTP provider cannot be built.
pub fn provider_from_config(config: &Config) -> Result<Arc<dyn IceConfigProvider>, SignalingError> {
    if let Some(url) = &config.ice_provider_url {
        let provider = HttpIceConfigProvider::new(url.clone(), config.ice_provider_api_key.clone())?;
        return Ok(Arc::new(provider));
    }

    let turn = match (&config.turn_username, &config.turn_credential) {
        (Some(username), Some(credential)) if !config.turn_urls.is_empty() => Some(TurnServer {
            urls: config.turn_urls.clone(),
            username: username.clone(),
            credential: credential.clone(),
        }),
        _ => None,
    };

    Ok(Arc::new(StaticIceConfigProvider::new(
        config.stun_urls.clone(),
        turn,
    )))
}
