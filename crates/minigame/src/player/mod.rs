//! Player movement: a transition table interpreted by a single engine.

mod machine;

pub use machine::PlayerStateMachine;

use bevy::math::Vec2;
use shared::Facing;

use crate::input::{Command, Direction};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlayerState {
    Idle,
    Move(Direction),
    Jump,
    Fall,
}

impl PlayerState {
    pub fn animation_key(self) -> &'static str {
        match self {
            PlayerState::Idle => "idle",
            PlayerState::Move(_) => "run",
            PlayerState::Jump => "jump",
            PlayerState::Fall => "fall",
        }
    }

    pub fn is_grounded_state(self) -> bool {
        matches!(self, PlayerState::Idle | PlayerState::Move(_))
    }
}

/// The physics body a [`PlayerStateMachine`] drives.
pub trait PlayerBody {
    fn is_grounded(&self) -> bool;
    fn velocity(&self) -> Vec2;
    fn set_velocity_x(&mut self, vx: f32);
    fn set_velocity_y(&mut self, vy: f32);
    fn set_facing(&mut self, facing: Facing);
    fn set_animation(&mut self, key: &'static str);
}

/// Physics predicates sampled once per update.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhysicsInput {
    pub grounded: bool,
    pub velocity_y: f32,
    /// Last known horizontal input.
    pub held: Option<Direction>,
    pub jump_buffered: bool,
}

/// Command-triggered transitions. `None` means the command is ignored here.
pub fn transition_on_command(
    state: PlayerState,
    command: Command,
    grounded: bool,
) -> Option<PlayerState> {
    match (state, command) {
        (PlayerState::Idle, Command::Move(direction)) => Some(PlayerState::Move(direction)),
        (PlayerState::Move(current), Command::Move(direction)) if current != direction => {
            Some(PlayerState::Move(direction))
        }
        (PlayerState::Move(_), Command::StopMove) => Some(PlayerState::Idle),
        (PlayerState::Idle | PlayerState::Move(_), Command::Jump) if grounded => {
            Some(PlayerState::Jump)
        }
        _ => None,
    }
}

/// Predicate-triggered transitions.
pub fn transition_on_physics(state: PlayerState, physics: PhysicsInput) -> Option<PlayerState> {
    match state {
        PlayerState::Idle | PlayerState::Move(_) if physics.grounded && physics.jump_buffered => {
            Some(PlayerState::Jump)
        }
        PlayerState::Idle | PlayerState::Move(_) if !physics.grounded => Some(PlayerState::Fall),
        // y grows downwards: a positive vertical velocity means the apex is behind us
        PlayerState::Jump if physics.velocity_y > 0.0 => Some(PlayerState::Fall),
        // grounded with the impulse already spent, e.g. clamped by a ceiling
        PlayerState::Jump if physics.grounded && physics.velocity_y >= 0.0 => Some(landing(physics)),
        PlayerState::Fall if physics.grounded => Some(landing(physics)),
        _ => None,
    }
}

fn landing(physics: PhysicsInput) -> PlayerState {
    if physics.jump_buffered {
        return PlayerState::Jump;
    }
    match physics.held {
        Some(direction) => PlayerState::Move(direction),
        None => PlayerState::Idle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn physics(grounded: bool, velocity_y: f32) -> PhysicsInput {
        PhysicsInput {
            grounded,
            velocity_y,
            held: None,
            jump_buffered: false,
        }
    }

    #[test]
    fn test_command_table() {
        use Direction::*;
        assert_eq!(
            transition_on_command(PlayerState::Idle, Command::Move(Left), true),
            Some(PlayerState::Move(Left))
        );
        assert_eq!(
            transition_on_command(PlayerState::Move(Left), Command::Move(Left), true),
            None
        );
        assert_eq!(
            transition_on_command(PlayerState::Move(Left), Command::StopMove, true),
            Some(PlayerState::Idle)
        );
        assert_eq!(
            transition_on_command(PlayerState::Idle, Command::Jump, false),
            None
        );
        assert_eq!(
            transition_on_command(PlayerState::Fall, Command::StopMove, false),
            None
        );
        assert_eq!(
            transition_on_command(PlayerState::Idle, Command::StopMove, true),
            None
        );
    }

    #[test]
    fn test_physics_table() {
        assert_eq!(
            transition_on_physics(PlayerState::Move(Direction::Right), physics(false, 0.0)),
            Some(PlayerState::Fall)
        );
        assert_eq!(
            transition_on_physics(PlayerState::Jump, physics(false, -10.0)),
            None
        );
        assert_eq!(
            transition_on_physics(PlayerState::Jump, physics(false, 1.0)),
            Some(PlayerState::Fall)
        );
        let landing = PhysicsInput {
            held: Some(Direction::Left),
            ..physics(true, 0.0)
        };
        assert_eq!(
            transition_on_physics(PlayerState::Fall, landing),
            Some(PlayerState::Move(Direction::Left))
        );
        assert_eq!(
            transition_on_physics(PlayerState::Fall, physics(true, 0.0)),
            Some(PlayerState::Idle)
        );
    }

    #[test]
    fn test_jump_lands_when_impulse_is_spent_on_the_ground() {
        let landing = PhysicsInput {
            held: Some(Direction::Right),
            ..physics(true, 0.0)
        };
        assert_eq!(
            transition_on_physics(PlayerState::Jump, landing),
            Some(PlayerState::Move(Direction::Right))
        );
        assert_eq!(
            transition_on_physics(PlayerState::Jump, physics(true, 0.0)),
            Some(PlayerState::Idle)
        );
        // take-off frame: still touching the floor, moving up
        assert_eq!(
            transition_on_physics(PlayerState::Jump, physics(true, -330.0)),
            None
        );
    }
}
