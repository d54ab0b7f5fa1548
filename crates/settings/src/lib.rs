//! Typed settings sections layered over a single RON delta file.
//!
//! Every section is a plain `serde` struct with a `Default` impl. The store
//! keeps the defaults, merges the user's delta on top, and when a section is
//! updated it writes back only the keys that differ from the defaults.

mod errors;
mod store;

pub use errors::SettingsError;
pub use store::{SettingsStore, SettingsStoreBuilder};

/// A configuration section stored under `SECTION` in the settings file.
pub trait Settings: 'static + Send + Sync {
    const SECTION: &'static str;

    fn name() -> &'static str {
        Self::SECTION
    }
}
