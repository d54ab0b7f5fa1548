//! Seams between the minigame and whatever carries its sessions.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SessionError;
use crate::ids::{ParticipantId, RoomKey, SessionId};
use crate::protocol::{ClientMessage, EntityEntry, SessionEvent};

/// A joined room.
///
/// Sessions are shared (`Arc<dyn Session>`) between the round lifecycle and
/// the per-frame sync code, so every method takes `&self`. A left session
/// reports `is_open() == false` and yields no further events.
pub trait Session: Send + Sync + Debug {
    fn id(&self) -> SessionId;

    fn room(&self) -> &RoomKey;

    fn local_participant(&self) -> ParticipantId;

    /// True once the initial state burst has been delivered.
    fn is_synced(&self) -> bool;

    fn is_open(&self) -> bool;

    /// Current entity table as known to this session.
    fn entities(&self) -> Vec<EntityEntry>;

    /// Drains pending events in receipt order.
    fn poll_events(&self, output: &mut Vec<SessionEvent>);

    fn send(&self, message: ClientMessage) -> Result<(), SessionError>;
}

/// Joins and leaves rooms keyed by [`RoomKey`].
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn join(&self, room: &RoomKey) -> Result<Arc<dyn Session>, SessionError>;

    async fn leave(&self, session: &Arc<dyn Session>) -> Result<(), SessionError>;
}
