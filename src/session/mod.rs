//! Connection tracking and room membership.
//!
//! This module contains:
//! - The connection registry (who is connected, in which role)
//! - The room router (who receives which broadcast)

pub mod registry;
pub mod rooms;

// Re-export commonly used types
pub use registry::{
    ClientCounts, Connection, ConnectionId, ConnectionRegistry, Role, UnrecognizedRole,
};
pub use rooms::{Outbox, Room, RoomRouter};
