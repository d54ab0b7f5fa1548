//! Command layer: raw device levels in, intention commands out.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use shared::Facing;
use tracing::debug;

use crate::LOG_INPUT;

/// Level state of the minigame's inputs for one poll.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawInput {
    pub left: bool,
    pub right: bool,
    pub jump: bool,
}

impl RawInput {
    pub const NONE: Self = Self {
        left: false,
        right: false,
        jump: false,
    };

    pub fn left() -> Self {
        Self {
            left: true,
            ..Self::NONE
        }
    }

    pub fn right() -> Self {
        Self {
            right: true,
            ..Self::NONE
        }
    }

    pub fn with_jump(mut self) -> Self {
        self.jump = true;
        self
    }
}

/// Anything that can be polled once per frame for input levels.
pub trait InputSource {
    fn poll(&mut self) -> RawInput;
}

/// Replays a fixed list of frames, then reports nothing pressed.
#[derive(Debug, Default)]
pub struct ScriptedInput {
    frames: VecDeque<RawInput>,
}

impl ScriptedInput {
    pub fn new(frames: impl IntoIterator<Item = RawInput>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    /// Appends `input` held for `frames` polls.
    pub fn hold(mut self, input: RawInput, frames: usize) -> Self {
        self.frames.extend(std::iter::repeat(input).take(frames));
        self
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl InputSource for ScriptedInput {
    fn poll(&mut self) -> RawInput {
        self.frames.pop_front().unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    /// Horizontal sign in screen coordinates.
    pub fn sign(self) -> f32 {
        match self {
            Direction::Left => -1.0,
            Direction::Right => 1.0,
        }
    }

    pub fn facing(self) -> Facing {
        match self {
            Direction::Left => Facing::Left,
            Direction::Right => Facing::Right,
        }
    }
}

/// Intention derived from input. Created per poll, never retained.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Move(Direction),
    StopMove,
    Jump,
}

/// Turns successive [`RawInput`] polls into [`Command`]s.
///
/// When both directions are held the most recently pressed one wins; when it
/// is released the other one takes over again. Left and Right rising in the
/// same poll resolve to Right. Move/StopMove are only emitted when the
/// resolved direction changes, Jump only on the rising edge.
#[derive(Debug, Default, Clone)]
pub struct CommandTranslator {
    previous: RawInput,
    /// Held directions, most recently pressed last.
    pressed: Vec<Direction>,
    direction: Option<Direction>,
}

impl CommandTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direction resolved by the last poll.
    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn translate(&mut self, input: RawInput, output: &mut Vec<Command>) {
        let previous = self.previous;
        self.previous = input;

        if !input.left {
            self.pressed.retain(|d| *d != Direction::Left);
        }
        if !input.right {
            self.pressed.retain(|d| *d != Direction::Right);
        }
        if input.left && !previous.left {
            self.pressed.push(Direction::Left);
        }
        if input.right && !previous.right {
            self.pressed.push(Direction::Right);
        }

        let resolved = self.pressed.last().copied();
        if resolved != self.direction {
            let command = match resolved {
                Some(direction) => Command::Move(direction),
                None => Command::StopMove,
            };
            debug!(target: LOG_INPUT, "direction {:?} -> {:?}", self.direction, resolved);
            self.direction = resolved;
            output.push(command);
        }

        if input.jump && !previous.jump {
            output.push(Command::Jump);
        }
    }

    /// Polls `source` once and translates the result.
    pub fn poll_from(&mut self, source: &mut dyn InputSource, output: &mut Vec<Command>) {
        let input = source.poll();
        self.translate(input, output);
    }
}
