//! Messages and entity payloads exchanged with a session room.

use serde::{Deserialize, Serialize};

use crate::ids::{EntityId, ParticipantId};

/// Entity collections tracked by a minigame room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Collection {
    Players,
    PhysicsObjects,
    Hazards,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Facing {
    Left,
    #[default]
    Right,
}

/// Replicated state of one collection entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityState {
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub velocity_x: f32,
    pub velocity_y: f32,
    pub facing: Facing,
    pub animation_state: String,
    pub owner_id: Option<ParticipantId>,
}

impl EntityState {
    pub fn at(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            ..Default::default()
        }
    }

    pub fn owned_by(mut self, owner: ParticipantId) -> Self {
        self.owner_id = Some(owner);
        self
    }
}

/// One row of a room's entity table.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityEntry {
    pub collection: Collection,
    pub id: EntityId,
    pub state: EntityState,
}

/// Outbound messages from a participant to its room.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Pose push from the current holder of `entity`.
    PoseUpdate {
        entity: EntityId,
        x: f32,
        y: f32,
        angle: f32,
        velocity_x: f32,
        velocity_y: f32,
    },
    /// One-shot hit on a shared object.
    ObjectHit {
        object: EntityId,
        impulse_x: f32,
        impulse_y: f32,
    },
    /// Ask the room to make the sender the holder of `object`.
    AuthorityRequest { object: EntityId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    Graceful,
    ConnectionLost,
    Kicked,
}

/// Inbound notifications of a joined session.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Added {
        collection: Collection,
        id: EntityId,
        state: EntityState,
    },
    Changed {
        collection: Collection,
        id: EntityId,
        state: EntityState,
    },
    Removed {
        collection: Collection,
        id: EntityId,
    },
    /// The initial (or post-reconnect) state burst is complete.
    Synced,
    Disconnected {
        reason: DisconnectReason,
    },
    Reconnected,
}

impl SessionEvent {
    pub fn added(entry: &EntityEntry) -> Self {
        Self::Added {
            collection: entry.collection,
            id: entry.id.clone(),
            state: entry.state.clone(),
        }
    }
}
