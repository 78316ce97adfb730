//! Call Signaling Service Library
//!
//! Signaling and room coordination for small peer-to-peer video calls. The
//! service never touches media; it tracks who is in which room, relays SDP
//! offers, answers and ICE candidates between participants, and broadcasts
//! presence and media-state changes.
//!
//! - Room registry with on-demand creation and idle cleanup
//! - Participant session state machine with a reconnect grace period
//! - Directed signaling relay with sender identity stamped by the server
//! - WebSocket gateway with token authentication before upgrade
//! - ICE server configuration (static or from a credential service)
//!
//! # Architecture
//!
//! ```text
//! gateway (WebSocket) -> coordinator -> RoomRegistryActor -> RoomActor
//!                                                              |
//!                        ConnectionActor <- ConnectionHandle <-+
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Registry, room and connection actors
//! - [`config`] - Service configuration from environment
//! - [`coordinator`] - Operation entry point used by the gateway
//! - [`errors`] - Error types with wire codes and HTTP status mapping
//! - [`gateway`] - Authenticated WebSocket channel
//! - [`ice`] - ICE configuration providers
//! - [`observability`] - Health endpoints and Prometheus metrics
//! - [`protocol`] - JSON wire messages

pub mod actors;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod gateway;
pub mod ice;
pub mod observability;
pub mod protocol;
