//! Observability for the call signaling service.
//!
//! # Privacy by Default
//!
//! Handlers use `#[instrument(skip_all)]` with explicit safe fields. User ids
//! and SDP bodies are never logged above debug level and never used as
//! metric labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `cs_rooms_active` | Gauge | none | Live room actors |
//! | `cs_connections_active` | Gauge | none | Open client channels |
//! | `cs_participants_active` | Gauge | none | Participants incl. grace period |
//! | `cs_message_latency_seconds` | Histogram | `operation` | Request handling latency |
//! | `cs_relay_total` | Counter | `kind`, `outcome` | Offer/answer/ICE relay attempts |
//! | `cs_join_total` | Counter | `outcome` | Join attempts |
//! | `cs_grace_expired_total` | Counter | none | Removals after grace expiry |
//! | `cs_reconnect_total` | Counter | none | Successful reconnects |
//! | `cs_events_dropped_total` | Counter | `actor_type` | Events dropped on full queues |
//! | `cs_actor_panics_total` | Counter | `actor_type` | Actor panics |

pub mod health;
pub mod metrics;

pub use health::{health_router, operational_router, HealthState};
pub use metrics::init_metrics_recorder;
