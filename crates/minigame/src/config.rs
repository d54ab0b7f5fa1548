//! Tunables of the minigame, stored as sections of the settings file.

use std::path::Path;
use std::time::Duration;

use bevy::prelude::Resource;
use serde::{Deserialize, Serialize};
use settings::{Settings, SettingsError, SettingsStore};

/// Snapshot interpolation, velocity correction and authority tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Resource)]
#[serde(default)]
pub struct SyncSettings {
    /// Snapshots kept per remote entity.
    pub buffer_capacity: usize,
    /// How far behind "now" remote entities are rendered.
    pub interpolation_delay_ms: f64,
    /// Above this distance (px) a physics-driven proxy snaps to its target.
    pub teleport_threshold: f32,
    /// Below this distance (px) a physics-driven proxy stops.
    pub stop_threshold: f32,
    /// Correction velocity per pixel of error (1/s).
    pub correction_gain: f32,
    pub max_correction_speed: f32,
    pub pose_push_hz: f32,
    pub authority_cooldown_ms: f64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 30,
            interpolation_delay_ms: 100.0,
            teleport_threshold: 200.0,
            stop_threshold: 2.0,
            correction_gain: 10.0,
            max_correction_speed: 600.0,
            pose_push_hz: 20.0,
            authority_cooldown_ms: 500.0,
        }
    }
}

impl Settings for SyncSettings {
    const SECTION: &'static str = "sync";
}

impl SyncSettings {
    /// Minimum spacing of two pose pushes for the same entity.
    pub fn push_interval_ms(&self) -> f64 {
        if self.pose_push_hz <= 0.0 {
            f64::INFINITY
        } else {
            1000.0 / f64::from(self.pose_push_hz)
        }
    }
}

/// Player movement. Screen coordinates: y grows downwards, so jumps are negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Resource)]
#[serde(default)]
pub struct PlayerSettings {
    pub run_speed: f32,
    pub jump_velocity: f32,
    pub gravity: f32,
    pub jump_buffer_ms: f64,
    /// Height of the flat floor used by the built-in integrator.
    pub floor_y: f32,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            run_speed: 160.0,
            jump_velocity: -330.0,
            gravity: 900.0,
            jump_buffer_ms: 120.0,
            floor_y: 480.0,
        }
    }
}

impl Settings for PlayerSettings {
    const SECTION: &'static str = "player";
}

/// Round lifecycle and scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Resource)]
#[serde(default)]
pub struct RoundSettings {
    /// Pause between a completed round and the next round start.
    pub settle_delay_ms: u64,
    /// Upper bound for a single session join or leave.
    pub session_timeout_ms: u64,
    /// Weighted score loses this fraction per full quiz time limit spent.
    pub penalty_rate: f32,
    /// Floor of the time multiplier.
    pub min_multiplier: f32,
}

impl Default for RoundSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: 1500,
            session_timeout_ms: 5000,
            penalty_rate: 0.5,
            min_multiplier: 0.5,
        }
    }
}

impl Settings for RoundSettings {
    const SECTION: &'static str = "rounds";
}

impl RoundSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

/// Opens the settings file at `path` with every minigame section registered.
pub fn open_settings(path: impl AsRef<Path>) -> Result<SettingsStore, SettingsError> {
    let store = SettingsStore::builder()
        .with_settings_file(path.as_ref())
        .build()?;
    store.register::<SyncSettings>()?;
    store.register::<PlayerSettings>()?;
    store.register::<RoundSettings>()?;
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_settings_merges_user_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("minigame.ron");
        std::fs::write(&path, r#"{ "sync": { "teleport_threshold": 320.0 } }"#).unwrap();

        let store = open_settings(&path).unwrap();
        let sync = store.get::<SyncSettings>().unwrap();
        assert_eq!(sync.teleport_threshold, 320.0);
        assert_eq!(sync.buffer_capacity, 30);
        assert_eq!(*store.get::<RoundSettings>().unwrap(), RoundSettings::default());
    }

    #[test]
    fn test_push_interval() {
        let settings = SyncSettings::default();
        assert_eq!(settings.push_interval_ms(), 50.0);
        let silent = SyncSettings {
            pose_push_hz: 0.0,
            ..Default::default()
        };
        assert!(silent.push_interval_ms().is_infinite());
    }
}
