//! Shared vocabulary for the classroom session coordinator.
//!
//! Both the coordinator service and the participant-side client depend on
//! this crate so that roles, media kinds, producer references and the
//! signaling protocol have exactly one definition.

#![warn(clippy::pedantic)]

/// Categorized error reasons shared across the wire
pub mod error;

/// Secret types that prevent accidental logging
pub mod secret;

/// Versioned signaling protocol (client and server messages)
pub mod signaling;

/// Roles, capabilities, media kinds and producer/consumer references
pub mod types;
