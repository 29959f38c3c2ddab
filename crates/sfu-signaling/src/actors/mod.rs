//! Actor system for room state.
//!
//! Hierarchy:
//! - `RoomRegistryActor` (singleton): supervises rooms, creates them lazily
//!   on first join, reaps them when they empty out or die
//! - `RoomActor` (per room): owns all state for one room and serializes
//!   every mutation through its mailbox
//!
//! Peers talk to actors through cloneable handles wrapping an mpsc sender
//! plus a `CancellationToken`; room-to-peer pushes travel over each peer's
//! event channel.

pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;

pub use messages::{ConsumerGrant, JoinOutcome, RegistryStatus, RoomEvent};
pub use metrics::{MetricsSnapshot, SignalMetrics};
pub use registry::{RoomRegistryActor, RoomRegistryHandle};
pub use room::{RoomActor, RoomActorHandle};
