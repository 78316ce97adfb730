//! # Call Signaling Test Utilities
//!
//! Shared test utilities for the call signaling service.
//!
//! This crate provides:
//! - Deterministic Ed25519 keys and user token signing (`TestKeypair`)
//! - Socket-free participants and coordinator (`TestParticipant`, `test_coordinator`)
//! - Server test harness (`TestSignalingServer` for E2E tests)
//! - WebSocket test client (`TestSignalingClient`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cs_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let server = TestSignalingServer::spawn().await?;
//!     let mut alice = server.connect("alice").await?;
//!
//!     let welcome = alice.recv().await?;
//!     assert!(matches!(welcome, ServerMessage::Welcome { .. }));
//!     Ok(())
//! }
//! ```

pub mod crypto_fixtures;
pub mod participant_fixtures;
pub mod server_harness;
pub mod ws_client;

// Re-export commonly used items
pub use crypto_fixtures::*;
pub use participant_fixtures::*;
pub use server_harness::*;
pub use ws_client::*;

pub use call_signaling::protocol::{ClientRequest, ServerMessage};
