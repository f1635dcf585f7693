//! # SC Test Utilities
//!
//! Shared test utilities for the session coordinator.
//!
//! This crate wires a complete coordinator (registry, negotiator,
//! permission controller, presence) around the in-memory media engine so
//! integration tests can drive real signaling sessions without sockets.
//!
//! ## Modules
//!
//! - `fixtures` - Pre-configured participants and class policies
//! - `mock_store` - Projection store with failure injection
//! - `coordinator` - `TestCoordinator` and per-connection `TestConnection`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let coordinator = TestCoordinator::new();
//!     let mut teacher = coordinator.connect();
//!
//!     let reply = teacher.join(&TestParticipant::teacher("t1"), "room-1").await;
//!     assert!(matches!(reply, ServerMessage::JoinResponse { .. }));
//! }
//! ```

pub mod coordinator;
pub mod fixtures;
pub mod mock_store;

pub use coordinator::*;
pub use fixtures::*;
pub use mock_store::*;

pub use common::signaling::{ClientMessage, ServerMessage};
