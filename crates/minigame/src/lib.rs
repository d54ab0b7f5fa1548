//! Real-time sync and local simulation layer of the embedded action minigame.
//!
//! - [`input`]: device input to intention commands
//! - [`player`]: command-fed movement state machine
//! - [`networking`]: snapshot interpolation, object authority and session sync
//! - [`rounds`]: round plan, per-round sessions, scoring and hand-off
//! - [`plugin`]: Bevy wiring of all of the above

pub mod clock;
pub mod config;
pub mod input;
pub mod networking;
pub mod player;
pub mod plugin;
pub mod rounds;

pub use clock::{Clock, ManualClock};
pub use config::{PlayerSettings, RoundSettings, SyncSettings};
pub use plugin::MinigamePlugin;

/// Log target of the session sync layer.
pub const LOG_SYNC: &str = "minigame::sync";
/// Log target of the round lifecycle.
pub const LOG_ROUNDS: &str = "minigame::rounds";
/// Log target of the player state machine.
pub const LOG_PLAYER: &str = "minigame::player";
/// Log target of the command layer.
pub const LOG_INPUT: &str = "minigame::input";
