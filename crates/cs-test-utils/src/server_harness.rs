//! Test server harness for E2E testing
//!
//! Provides `TestSignalingServer` for spawning a real signaling listener in
//! tests. Tokens are minted with a deterministic [`TestKeypair`] whose
//! public key the server is configured with.

use crate::crypto_fixtures::TestKeypair;
use crate::ws_client::TestSignalingClient;

use call_signaling::actors::{ActorMetrics, RoomRegistryHandle};
use call_signaling::config::Config;
use call_signaling::coordinator::CallCoordinator;
use call_signaling::gateway::{signaling_router, GatewayState, JwtIdentityVerifier};
use call_signaling::ice::provider_from_config;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Seed of the keypair every harness signs tokens with.
pub const TEST_SIGNING_SEED: u8 = 42;

/// Test harness for spawning the signaling server in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_join_e2e() -> Result<(), anyhow::Error> {
///     let server = TestSignalingServer::spawn().await?;
///     let mut alice = server.connect("alice").await?;
///     alice.recv().await?; // Welcome
///     Ok(())
/// }
/// ```
pub struct TestSignalingServer {
    addr: SocketAddr,
    config: Config,
    keypair: TestKeypair,
    coordinator: CallCoordinator,
    _handle: JoinHandle<()>,
}

impl TestSignalingServer {
    /// Spawn a server with default test configuration.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(&[]).await
    }

    /// Spawn a server, overriding configuration variables.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Verify tokens signed by [`TEST_SIGNING_SEED`]
    /// - Use a static ICE list
    pub async fn spawn_with(overrides: &[(&str, &str)]) -> Result<Self, anyhow::Error> {
        let keypair = TestKeypair::from_seed(TEST_SIGNING_SEED)
            .map_err(|e| anyhow::anyhow!("Failed to create keypair: {}", e))?;

        let mut vars = HashMap::from([
            (
                "CS_SIGNALING_BIND_ADDRESS".to_string(),
                "127.0.0.1:0".to_string(),
            ),
            ("CS_INSTANCE_ID".to_string(), "cs-test".to_string()),
            (
                "CS_AUTH_PUBLIC_KEY".to_string(),
                keypair.public_key().to_string(),
            ),
            (
                "CS_STUN_URLS".to_string(),
                "stun:stun.test.local:3478".to_string(),
            ),
        ]);
        for (name, value) in overrides {
            vars.insert((*name).to_string(), (*value).to_string());
        }

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let verifier = JwtIdentityVerifier::new(&config.auth_public_key, config.jwt_clock_skew())
            .map_err(|e| anyhow::anyhow!("Failed to create verifier: {}", e))?;
        let ice = provider_from_config(&config)
            .map_err(|e| anyhow::anyhow!("Failed to create ICE provider: {}", e))?;

        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(
            config.instance_id.clone(),
            config.room_settings(),
            Arc::clone(&metrics),
        );
        let coordinator = CallCoordinator::new(registry, ice, metrics);

        let app = signaling_router(Arc::new(GatewayState {
            coordinator: coordinator.clone(),
            verifier: Arc::new(verifier),
            heartbeat_interval: config.heartbeat_interval(),
            idle_timeout: config.idle_timeout(),
        }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            config,
            keypair,
            coordinator,
            _handle: handle,
        })
    }

    /// WebSocket URL of the signaling endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Plain HTTP URL of the signaling endpoint.
    pub fn http_url(&self) -> String {
        format!("http://{}/ws", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn keypair(&self) -> &TestKeypair {
        &self.keypair
    }

    /// Coordinator behind the listener, for administrative calls.
    pub fn coordinator(&self) -> &CallCoordinator {
        &self.coordinator
    }

    /// Connect as `user_id` with a freshly minted token.
    pub async fn connect(&self, user_id: &str) -> Result<TestSignalingClient, anyhow::Error> {
        let token = self.keypair.token_for(user_id, None);
        TestSignalingClient::connect(&self.ws_url(), &token).await
    }
}

impl Drop for TestSignalingServer {
    fn drop(&mut self) {
        self.coordinator.registry().cancel();
        self._handle.abort();
    }
}
