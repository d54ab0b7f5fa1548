//! Integration tests for the SettingsStore:
//! - Recursive diffing (nested structs)
//! - Persisting only changed (delta) fields
//! - Reloading after external file modification

use std::collections::HashMap;
use std::fs;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use settings::{Settings, SettingsError, SettingsStore};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Smoothing {
    enabled: bool,
    delay_ms: u32,
}

impl Default for Smoothing {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Arena {
    tick_rate: u16,
    smoothing: Smoothing,
}

impl Default for Arena {
    fn default() -> Self {
        Self {
            tick_rate: 100,
            smoothing: Smoothing::default(),
        }
    }
}

impl Settings for Arena {
    const SECTION: &'static str = "arena";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct Hud {
    scale: f32,
}

impl Settings for Hud {
    const SECTION: &'static str = "hud";
}

fn read_file(path: &std::path::Path) -> HashMap<String, Value> {
    let content = fs::read_to_string(path).expect("read delta file");
    ron::from_str(&content).expect("parse delta RON")
}

#[test]
fn test_register_get_update_delta_flat_and_nested() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("settings.ron");

    let store = SettingsStore::builder()
        .with_settings_file(&path)
        .build()
        .expect("build store");
    store.register::<Arena>().expect("register arena");

    assert!(!path.exists(), "no file before the first update");

    let arena = store.get::<Arena>().expect("get initial");
    assert_eq!(*arena, Arena::default());

    store
        .update::<Arena, _>(|n| n.smoothing.enabled = true)
        .expect("update smoothing.enabled");

    assert!(path.exists(), "delta file should be created");
    let root = read_file(&path);
    assert_eq!(root.len(), 1);
    assert_eq!(root["arena"], json!({ "smoothing": { "enabled": true } }));

    store
        .update::<Arena, _>(|n| {
            n.tick_rate = 7777;
            n.smoothing.delay_ms = 50;
        })
        .expect("update tick rate + delay");

    let root = read_file(&path);
    assert_eq!(
        root["arena"],
        json!({ "tick_rate": 7777, "smoothing": { "enabled": true, "delay_ms": 50 } })
    );

    let arena = store.get::<Arena>().expect("get updated");
    assert_eq!(arena.tick_rate, 7777);
    assert!(arena.smoothing.enabled);
    assert_eq!(arena.smoothing.delay_ms, 50);
}

#[test]
fn test_update_back_to_defaults_removes_section() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("settings.ron");
    let store = SettingsStore::builder()
        .with_settings_file(&path)
        .build()
        .expect("build store");
    store.register::<Arena>().expect("register");

    store.update::<Arena, _>(|n| n.tick_rate = 1).expect("update");
    store.update::<Arena, _>(|n| n.tick_rate = 100).expect("revert");

    assert!(read_file(&path).is_empty());
}

#[test]
fn test_existing_delta_is_merged_on_register() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("settings.ron");
    fs::write(&path, r#"{ "arena": { "smoothing": { "delay_ms": 250 } } }"#).expect("seed");

    let store = SettingsStore::builder()
        .with_settings_file(&path)
        .build()
        .expect("build store");
    store.register::<Arena>().expect("register");

    let arena = store.get::<Arena>().expect("get");
    assert_eq!(arena.tick_rate, 100);
    assert_eq!(arena.smoothing.delay_ms, 250);
    assert!(!arena.smoothing.enabled);
}

#[test]
fn test_reload_picks_up_external_changes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("settings.ron");
    let store = SettingsStore::builder()
        .with_settings_file(&path)
        .build()
        .expect("build store");
    store.register::<Arena>().expect("register");

    fs::write(&path, r#"{ "arena": { "tick_rate": 4242 } }"#).expect("external write");
    store.reload().expect("reload");
    assert_eq!(store.get::<Arena>().expect("get").tick_rate, 4242);

    fs::remove_file(&path).expect("remove");
    store.reload().expect("reload without file");
    assert_eq!(*store.get::<Arena>().expect("get"), Arena::default());
}

#[test]
fn test_prune_stale_drops_unknown_sections_and_keys() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("settings.ron");
    fs::write(
        &path,
        r#"{ "arena": { "tick_rate": 9000, "legacy": true }, "retired": { "x": 1 } }"#,
    )
    .expect("seed");

    let store = SettingsStore::builder()
        .with_settings_file(&path)
        .build()
        .expect("build store");
    store.register::<Arena>().expect("register");
    store.prune_stale().expect("prune");

    let root = read_file(&path);
    assert_eq!(root.len(), 1);
    assert_eq!(root["arena"], json!({ "tick_rate": 9000 }));
}

#[test]
fn test_unregistered_and_duplicate_sections() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SettingsStore::builder()
        .with_settings_file(dir.path().join("settings.ron"))
        .build()
        .expect("build store");

    assert!(matches!(store.get::<Hud>(), Err(SettingsError::NotRegistered)));
    assert!(store.try_get::<Hud>().expect("try_get").is_none());

    store.register::<Hud>().expect("register");
    assert!(store.is_registered::<Hud>());
    assert!(matches!(store.register::<Hud>(), Err(SettingsError::Invalid(_))));
}

#[test]
fn test_builder_requires_a_file() {
    assert!(matches!(
        SettingsStore::builder().build(),
        Err(SettingsError::Invalid(_))
    ));
}
