//! WebSocket gateway for client channels.
//!
//! `GET /ws` authenticates the caller before the upgrade. A missing or
//! invalid token is answered with 401 and no channel is opened. After the
//! upgrade the channel is driven by [`socket::run_channel`].

pub mod auth;
pub mod socket;

pub use auth::{extract_token, Identity, IdentityVerifier, JwtIdentityVerifier};
pub use socket::Channel;

use crate::coordinator::CallCoordinator;
use crate::protocol::MAX_FRAME_BYTES;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        RawQuery, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, instrument};

/// State shared by every channel.
#[derive(Clone)]
pub struct GatewayState {
    pub coordinator: CallCoordinator,
    pub verifier: Arc<dyn IdentityVerifier>,
    /// Server ping period.
    pub heartbeat_interval: Duration,
    /// Inbound silence after which a channel counts as dropped.
    pub idle_timeout: Duration,
}

/// Build the signaling router.
///
/// - `/ws` - authenticated WebSocket upgrade
/// - TraceLayer for request logging
pub fn signaling_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[instrument(skip_all, name = "cs.gateway.upgrade")]
async fn ws_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match authenticate(&state, &headers, query.as_deref()).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            debug!(target: "cs.gateway", "Authenticated request is not a WebSocket upgrade");
            return rejection.into_response();
        }
    };

    // Oversized frames are answered with INVALID_PAYLOAD rather than
    // tearing the channel down, so the transport limit sits above ours.
    upgrade
        .max_message_size(MAX_FRAME_BYTES * 2)
        .on_upgrade(move |socket| socket::run_channel(socket, state, identity))
}

async fn authenticate(
    state: &GatewayState,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<Identity, crate::errors::SignalingError> {
    let token = extract_token(headers, query)?;
    state.verifier.verify(&token).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::{ActorMetrics, RoomRegistryHandle, RoomSettings};
    use crate::errors::SignalingError;
    use crate::ice::StaticIceConfigProvider;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    /// Accepts exactly one token.
    struct FixedVerifier;

    #[async_trait]
    impl IdentityVerifier for FixedVerifier {
        async fn verify(&self, token: &str) -> Result<Identity, SignalingError> {
            if token == "good-token" {
                Ok(Identity {
                    user_id: "alice".to_string(),
                    display_name: None,
                })
            } else {
                Err(SignalingError::Unauthenticated("bad token".to_string()))
            }
        }
    }

    fn router() -> Router {
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(
            "cs-test".to_string(),
            RoomSettings::default(),
            Arc::clone(&metrics),
        );
        let coordinator = CallCoordinator::new(
            registry,
            Arc::new(StaticIceConfigProvider::new(vec![], None)),
            metrics,
        );

        signaling_router(Arc::new(GatewayState {
            coordinator,
            verifier: Arc::new(FixedVerifier),
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(45),
        }))
    }

    #[tokio::test]
    async fn test_missing_token_is_401() {
        let response = router()
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key("WWW-Authenticate"));
    }

    #[tokio::test]
    async fn test_invalid_token_is_401() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/ws?access_token=forged")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_valid_token_without_upgrade_is_rejected() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/ws")
                    .header("authorization", "Bearer good-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_client_error());
        assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_gateway_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<GatewayState>();
    }
}
