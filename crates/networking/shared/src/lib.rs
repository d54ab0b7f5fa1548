//! Shared networking surface of the minigame: identifiers, wire types, the
//! session seams and an in-process loopback room.

/// Session level errors
pub mod error;
/// Strongly typed identifiers for participants, entities, matches and rooms
pub mod ids;
/// Messages and entity payloads exchanged with a session room
pub mod protocol;
/// The `Session` / `SessionConnector` seams
pub mod session;
/// Session implementations
pub mod transport;

pub use error::SessionError;
pub use ids::{EntityId, IdGenerator, MatchId, ParticipantId, RoomKey, SessionId};
pub use protocol::{
    ClientMessage, Collection, DisconnectReason, EntityEntry, EntityState, Facing, SessionEvent,
};
pub use session::{Session, SessionConnector};

/// Log target of the session layer.
pub const LOG_SESSION: &str = "session";
