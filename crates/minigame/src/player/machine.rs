use tracing::debug;

use super::{PhysicsInput, PlayerBody, PlayerState, transition_on_command, transition_on_physics};
use crate::LOG_PLAYER;
use crate::config::PlayerSettings;
use crate::input::{Command, Direction};

/// Drives a [`PlayerBody`] through Idle/Move/Jump/Fall.
///
/// Exactly one state is active. Commands and physics predicates are looked
/// up in the transition tables; enter/exit actions depend only on the state.
#[derive(Debug, Clone)]
pub struct PlayerStateMachine {
    state: PlayerState,
    settings: PlayerSettings,
    held: Option<Direction>,
    jump_buffered_at: Option<f64>,
}

impl PlayerStateMachine {
    pub fn new(settings: PlayerSettings) -> Self {
        Self {
            state: PlayerState::Idle,
            settings,
            held: None,
            jump_buffered_at: None,
        }
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn held_direction(&self) -> Option<Direction> {
        self.held
    }

    pub fn settings(&self) -> &PlayerSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: PlayerSettings) {
        self.settings = settings;
    }

    fn jump_buffered(&self, now_ms: f64) -> bool {
        self.jump_buffered_at
            .is_some_and(|at| now_ms - at <= self.settings.jump_buffer_ms)
    }

    /// Exit the current state, enter `next` and log the transition.
    pub fn change_state(&mut self, next: PlayerState, body: &mut dyn PlayerBody) {
        let previous = self.state;
        self.exit(previous, body);
        self.state = next;
        self.enter(next, body);
        debug!(target: LOG_PLAYER, "player {:?} -> {:?}", previous, next);
    }

    fn exit(&mut self, state: PlayerState, body: &mut dyn PlayerBody) {
        if state == PlayerState::Fall {
            body.set_velocity_y(0.0);
        }
    }

    fn enter(&mut self, state: PlayerState, body: &mut dyn PlayerBody) {
        match state {
            PlayerState::Idle => body.set_velocity_x(0.0),
            PlayerState::Move(direction) => {
                body.set_velocity_x(direction.sign() * self.settings.run_speed);
                body.set_facing(direction.facing());
            }
            PlayerState::Jump => {
                self.jump_buffered_at = None;
                body.set_velocity_y(self.settings.jump_velocity);
            }
            PlayerState::Fall => {}
        }
        body.set_animation(state.animation_key());
    }

    /// Feed one command. Commands a state does not handle are ignored.
    pub fn process_command(&mut self, command: Command, body: &mut dyn PlayerBody, now_ms: f64) {
        match command {
            Command::Move(direction) => self.held = Some(direction),
            Command::StopMove => self.held = None,
            Command::Jump => self.jump_buffered_at = Some(now_ms),
        }

        if let Some(next) = transition_on_command(self.state, command, body.is_grounded()) {
            self.change_state(next, body);
            return;
        }

        // air control
        if matches!(self.state, PlayerState::Jump | PlayerState::Fall)
            && matches!(command, Command::Move(_) | Command::StopMove)
        {
            let vx = self.held.map_or(0.0, |d| d.sign() * self.settings.run_speed);
            body.set_velocity_x(vx);
            if let Some(direction) = self.held {
                body.set_facing(direction.facing());
            }
        }
    }

    /// Per-frame tick: expire the jump buffer and apply physics transitions.
    pub fn update(&mut self, body: &mut dyn PlayerBody, now_ms: f64) {
        if self.jump_buffered_at.is_some() && !self.jump_buffered(now_ms) {
            self.jump_buffered_at = None;
        }

        let physics = PhysicsInput {
            grounded: body.is_grounded(),
            velocity_y: body.velocity().y,
            held: self.held,
            jump_buffered: self.jump_buffered(now_ms),
        };
        if let Some(next) = transition_on_physics(self.state, physics) {
            self.change_state(next, body);
        }
    }
}
