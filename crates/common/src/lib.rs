//! Common utilities shared across the call signaling crates.

#![warn(clippy::pedantic)]

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for user token helpers (size limits, claims, iat checks)
pub mod jwt;
