//! The rendering/physics side the sync handler drives.

use std::fmt::Debug;

use bevy::math::Vec2;
use shared::{Collection, EntityId, EntityState, Facing};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Player,
    PhysicsObject,
    Hazard,
}

impl From<Collection> for EntityKind {
    fn from(collection: Collection) -> Self {
        match collection {
            Collection::Players => EntityKind::Player,
            Collection::PhysicsObjects => EntityKind::PhysicsObject,
            Collection::Hazards => EntityKind::Hazard,
        }
    }
}

/// Visual world of the minigame.
///
/// Map construction and asset loading happen behind this seam; the sync
/// handler only creates, moves and destroys visuals through it.
pub trait Scene {
    type Visual: Copy + Debug;

    /// Spawn the avatar this client controls.
    fn spawn_local_player(&mut self, id: &EntityId, state: &EntityState) -> Self::Visual;

    /// Spawn a proxy for an entity owned elsewhere.
    fn spawn_remote_proxy(
        &mut self,
        id: &EntityId,
        kind: EntityKind,
        state: &EntityState,
    ) -> Self::Visual;

    fn position(&self, visual: Self::Visual) -> Vec2;

    fn velocity(&self, visual: Self::Visual) -> Vec2;

    fn angle(&self, _visual: Self::Visual) -> f32 {
        0.0
    }

    fn set_position(&mut self, visual: Self::Visual, position: Vec2);

    fn set_velocity(&mut self, visual: Self::Visual, velocity: Vec2);

    /// Toggle local gravity/simulation of a visual.
    fn set_physics_enabled(&mut self, visual: Self::Visual, enabled: bool);

    fn apply_presentation(&mut self, visual: Self::Visual, facing: Facing, animation: &str);

    fn destroy(&mut self, visual: Self::Visual);
}
