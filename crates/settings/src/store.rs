use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{Settings, SettingsError};

const LOG_SETTINGS: &str = "settings";

type Section = Map<String, Value>;

fn to_section<T: Serialize>(value: &T) -> Result<Section, SettingsError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(SettingsError::Invalid("section must serialize to a map")),
    }
}

/// Merge default + delta recursively (maps only).
fn merge_maps(default: &Section, delta: &Section) -> Section {
    let mut merged = default.clone();
    for (key, delta_value) in delta {
        match (merged.get(key), delta_value) {
            (Some(Value::Object(default_sub)), Value::Object(delta_sub)) => {
                let nested = merge_maps(default_sub, delta_sub);
                merged.insert(key.clone(), Value::Object(nested));
            }
            _ => {
                merged.insert(key.clone(), delta_value.clone());
            }
        }
    }
    merged
}

/// Keys of `new` that differ from `default`, recursively.
fn diff_map(new: &Section, default: &Section) -> Section {
    let mut out = Section::new();
    for (key, new_value) in new {
        match (default.get(key), new_value) {
            (Some(Value::Object(default_sub)), Value::Object(new_sub)) => {
                let nested = diff_map(new_sub, default_sub);
                if !nested.is_empty() {
                    out.insert(key.clone(), Value::Object(nested));
                }
            }
            (Some(default_value), _) if default_value == new_value => {}
            _ => {
                out.insert(key.clone(), new_value.clone());
            }
        }
    }
    out
}

/// Drop keys of `candidate` that `default` does not know. Returns true on change.
fn prune_map(default: &Section, candidate: &mut Section) -> bool {
    let before = candidate.len();
    candidate.retain(|key, _| default.contains_key(key));
    let mut changed = candidate.len() != before;

    for (key, value) in candidate.iter_mut() {
        if let (Some(Value::Object(default_sub)), Value::Object(sub)) = (default.get(key), value) {
            changed |= prune_map(default_sub, sub);
        }
    }

    let before = candidate.len();
    candidate.retain(|_, value| !matches!(value, Value::Object(sub) if sub.is_empty()));
    changed || candidate.len() != before
}

fn read_deltas(path: &Path) -> Result<HashMap<String, Value>, SettingsError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(HashMap::new());
    }
    Ok(ron::from_str(&content)?)
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Builder for `SettingsStore` (single delta file).
#[derive(Default)]
pub struct SettingsStoreBuilder {
    settings_file: Option<PathBuf>,
}

impl SettingsStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.settings_file = Some(path.into());
        self
    }

    pub fn build(self) -> Result<SettingsStore, SettingsError> {
        let file_path = self
            .settings_file
            .ok_or(SettingsError::Invalid("settings file not specified"))?;

        if let Some(dir) = file_path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }

        let deltas = read_deltas(&file_path)?;
        debug!(target: LOG_SETTINGS, "loaded {} delta section(s) from {:?}", deltas.len(), file_path);

        Ok(SettingsStore {
            file_path,
            deltas: RwLock::new(deltas),
            defaults: RwLock::new(HashMap::new()),
            values: RwLock::new(HashMap::new()),
        })
    }
}

/// Settings store (thread-safe).
///
/// Holds, per registered section, the defaults and the effective merged value.
/// The file on disk only ever contains the deltas.
pub struct SettingsStore {
    file_path: PathBuf,
    deltas: RwLock<HashMap<String, Value>>,
    defaults: RwLock<HashMap<&'static str, Section>>,
    values: RwLock<HashMap<&'static str, Section>>,
}

impl SettingsStore {
    pub fn builder() -> SettingsStoreBuilder {
        SettingsStoreBuilder::new()
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn is_registered<T: Settings>(&self) -> bool {
        read_lock(&self.values).contains_key(T::name())
    }

    /// Register a section type (loads defaults and applies an existing delta if present).
    pub fn register<T>(&self) -> Result<(), SettingsError>
    where
        T: Settings + Default + Serialize + DeserializeOwned,
    {
        let section = T::name();
        if self.is_registered::<T>() {
            return Err(SettingsError::Invalid("section already registered"));
        }

        let default_map = to_section(&T::default())?;
        let merged = match read_lock(&self.deltas).get(section) {
            Some(Value::Object(delta)) => merge_maps(&default_map, delta),
            Some(_) => {
                warn!(target: LOG_SETTINGS, "ignoring non-map delta for section '{}'", section);
                default_map.clone()
            }
            None => default_map.clone(),
        };

        // Reject deltas that no longer fit the section type up front.
        serde_json::from_value::<T>(Value::Object(merged.clone()))?;

        write_lock(&self.defaults).insert(section, default_map);
        write_lock(&self.values).insert(section, merged);
        debug!(target: LOG_SETTINGS, "registered section '{}'", section);
        Ok(())
    }

    /// Snapshot of the effective section value.
    pub fn get<T>(&self) -> Result<Arc<T>, SettingsError>
    where
        T: Settings + DeserializeOwned,
    {
        self.try_get::<T>()?.ok_or(SettingsError::NotRegistered)
    }

    /// Like `get`, but `None` if the section is not registered.
    pub fn try_get<T>(&self) -> Result<Option<Arc<T>>, SettingsError>
    where
        T: Settings + DeserializeOwned,
    {
        let values = read_lock(&self.values);
        let Some(value) = values.get(T::name()) else {
            return Ok(None);
        };
        let instance: T = serde_json::from_value(Value::Object(value.clone()))?;
        Ok(Some(Arc::new(instance)))
    }

    /// Update via mutable closure. Only the recursive delta is persisted.
    pub fn update<T, F>(&self, mutator: F) -> Result<(), SettingsError>
    where
        T: Settings + Default + Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let section = T::name();
        let current = read_lock(&self.values)
            .get(section)
            .cloned()
            .ok_or(SettingsError::NotRegistered)?;
        let mut instance: T = serde_json::from_value(Value::Object(current))?;
        mutator(&mut instance);

        let new_map = to_section(&instance)?;
        let diff = {
            let defaults = read_lock(&self.defaults);
            let default_map = defaults.get(section).ok_or(SettingsError::NotRegistered)?;
            diff_map(&new_map, default_map)
        };

        write_lock(&self.values).insert(section, new_map);
        {
            let mut deltas = write_lock(&self.deltas);
            if diff.is_empty() {
                deltas.remove(section);
            } else {
                deltas.insert(section.to_string(), Value::Object(diff));
            }
        }

        self.persist_deltas()
    }

    /// Re-read the delta file and re-merge all registered sections.
    pub fn reload(&self) -> Result<(), SettingsError> {
        let new_deltas = read_deltas(&self.file_path)?;

        let defaults = read_lock(&self.defaults).clone();
        let mut values = write_lock(&self.values);
        for (section, default_map) in &defaults {
            let merged = match new_deltas.get(*section) {
                Some(Value::Object(delta)) => merge_maps(default_map, delta),
                _ => default_map.clone(),
            };
            values.insert(*section, merged);
        }
        drop(values);

        *write_lock(&self.deltas) = new_deltas;
        debug!(target: LOG_SETTINGS, "reloaded {:?}", self.file_path);
        Ok(())
    }

    /// Remove orphaned delta entries and persist the result.
    ///
    /// Unregistered sections are dropped, keys unknown to a section's defaults
    /// are pruned recursively, and sections left empty are removed.
    pub fn prune_stale(&self) -> Result<(), SettingsError> {
        let defaults = read_lock(&self.defaults).clone();
        {
            let mut deltas = write_lock(&self.deltas);
            deltas.retain(|section, value| {
                let Some(default_map) = defaults.get(section.as_str()) else {
                    return false;
                };
                match value {
                    Value::Object(delta) => {
                        prune_map(default_map, delta);
                        !delta.is_empty()
                    }
                    _ => true,
                }
            });
        }
        self.persist_deltas()
    }

    fn persist_deltas(&self) -> Result<(), SettingsError> {
        let clean: HashMap<String, Value> = read_lock(&self.deltas)
            .iter()
            .filter(|(_, v)| !matches!(v, Value::Object(m) if m.is_empty()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let pretty = ron::ser::PrettyConfig::default();
        let ron_string = ron::ser::to_string_pretty(&clean, pretty)?;

        let tmp = self.file_path.with_extension("tmp");
        fs::write(&tmp, ron_string)?;
        fs::rename(&tmp, &self.file_path)?;
        debug!(target: LOG_SETTINGS, "persisted {} delta section(s)", clean.len());
        Ok(())
    }
}
