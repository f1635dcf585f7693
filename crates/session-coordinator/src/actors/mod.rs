//! Actor model for the session coordinator.
//!
//! ```text
//! RoomRegistry (singleton per coordinator)
//! └── supervises N RoomActors
//!     └── RoomActor (one per live room)
//!         ├── owns participants, waiting room and producer table
//!         └── QualityAdapter (sibling task, stops with the room)
//! ```
//!
//! # Key Design Decisions
//!
//! - **One writer per room**: every room mutation is a message to its actor
//! - **CancellationToken propagation**: the registry hands each room a child token
//! - **Mailbox monitoring**: depth thresholds with metrics (Room: 100/500)
//! - **No engine calls inside the actor**: media round-trips run outside and
//!   commit their results back through the mailbox
//!
//! # Modules
//!
//! - [`room`] - `RoomActor` per live room
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod messages;
pub mod metrics;
pub mod room;

// Re-export primary types
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use room::{RoomActor, RoomActorHandle, RoomContext, DEGRADED_LINK_REASON};
