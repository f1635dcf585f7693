//! Participant-side session logic.
//!
//! The coordinator's producer announcements are best effort; the periodic
//! producer list is authoritative. This crate keeps a participant's local
//! view converged on that list and turns each remote producer into a
//! playable track, retrying the teardown/consume race with bounded backoff.
//!
//! ```text
//! ServerMessage ──► ParticipantSession ──► ProducerCache (what exists)
//!                         │
//!                         └──► ConsumerRetryEngine ──► ConsumeBackend
//!                                     │
//!                                     └──► ConsumerEvent (to the application)
//! ```
//!
//! # Modules
//!
//! - [`consumer`] - Retry engine, readiness and events
//! - [`reconcile`] - Producer cache and snapshot diffing
//! - [`session`] - Glue from signaling messages to cache and engine
//! - [`backend`] - Seam to the signaling connection
//! - [`errors`] - Client error type

pub mod backend;
pub mod consumer;
pub mod errors;
pub mod reconcile;
pub mod session;

pub use backend::ConsumeBackend;
pub use consumer::{ConsumerEvent, ConsumerRetryEngine, Readiness, RetryPolicy};
pub use errors::ClientError;
pub use reconcile::{ProducerCache, ReconcilePlan};
pub use session::ParticipantSession;
