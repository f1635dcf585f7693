//! Observability for the session coordinator.
//!
//! # Privacy by Default
//!
//! Instrumentation uses `#[instrument(skip_all)]` with explicit safe fields.
//! Display names and opaque media parameters never reach logs; ids do.
//!
//! # Metrics
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `sc_rooms_active` | Gauge | none |
//! | `sc_participants_active` | Gauge | none |
//! | `sc_connections_active` | Gauge | none |
//! | `sc_admission_total` | Counter | `outcome` |
//! | `sc_permission_changes_total` | Counter | `action`, `result` |
//! | `sc_producers_closed_total` | Counter | `reason` |
//! | `sc_media_engine_latency_seconds` | Histogram | `operation` |
//! | `sc_media_engine_errors_total` | Counter | `operation`, `kind` |
//! | `sc_quality_tier_changes_total` | Counter | `direction` |
//! | `sc_consumer_pauses_total` | Counter | none |
//! | `sc_message_latency_seconds` | Histogram | `message_type` |
//! | `sc_messages_dropped_total` | Counter | `channel` |
//! | `sc_projection_failures_total` | Counter | none |
//! | `sc_actor_panics_total` | Counter | `actor_type` |
//! | `sc_errors_total` | Counter | `operation`, `error_type` |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
