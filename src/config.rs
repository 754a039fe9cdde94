//! Configuration and persisted user settings, loaded with Figment.
//!
//! Configuration is read from:
//! 1. `config/pm100x.toml` (or the path given on the command line)
//! 2. Environment variables prefixed with `PM100X_`, nested with `__`
//!
//! ```no_run
//! use pm100x_panel::config::PanelConfig;
//!
//! let config = PanelConfig::load()?;
//! println!("Refresh time: {} s", config.settings.refresh_time);
//! # Ok::<(), figment::Error>(())
//! ```
//!
//! The `[settings]` table holds the two values the panel writes back when the
//! user changes them (refresh time and auto-range). [`SettingsStore`] owns the
//! live copy and its backing file.

use anyhow::Context;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/pm100x.toml";

/// Prefix of environment overrides, e.g. `PM100X_SETTINGS__REFRESH_TIME=0.5`.
pub const ENV_PREFIX: &str = "PM100X_";

/// Smallest accepted refresh interval, in seconds.
pub const MIN_REFRESH_TIME: f64 = 0.001;

/// Poll interval for `seconds`, if it is at least [`MIN_REFRESH_TIME`] and
/// fits a [`Duration`].
pub fn refresh_interval(seconds: f64) -> Option<Duration> {
    if seconds < MIN_REFRESH_TIME {
        return None;
    }
    Duration::try_from_secs_f64(seconds).ok()
}

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Device selection
    pub device: DeviceConfig,
    /// Initial user settings
    pub settings: PanelSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Which console to talk to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Only discover this model ("PM100D" or "PM100A")
    pub model: Option<String>,
    /// Connect to this address without asking
    pub address: Option<String>,
}

/// User settings written back on change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelSettings {
    /// Poll interval in seconds
    pub refresh_time: f64,
    /// Auto-range applied on connect
    pub auto_power_range: bool,
}

impl Default for PanelSettings {
    fn default() -> Self {
        Self {
            refresh_time: 0.2,
            auto_power_range: true,
        }
    }
}

impl PanelConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment.
    ///
    /// A missing file is not an error; defaults fill every gap.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(PanelConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            ));
        }

        self.settings.validate()?;

        if let Some(model) = &self.device.model {
            model
                .parse::<pm_driver_thorlabs::Model>()
                .map_err(|e| e.to_string())?;
        }

        Ok(())
    }
}

impl PanelSettings {
    /// Check the refresh interval.
    pub fn validate(&self) -> Result<(), String> {
        match refresh_interval(self.refresh_time) {
            Some(_) => Ok(()),
            None => Err(format!(
                "Invalid refresh_time {}. Must be a number of seconds >= {MIN_REFRESH_TIME}",
                self.refresh_time
            )),
        }
    }
}

/// Live settings plus the file they are written back to.
#[derive(Debug)]
pub struct SettingsStore {
    path: Option<PathBuf>,
    current: RwLock<PanelSettings>,
}

impl SettingsStore {
    /// Settings that are never written anywhere.
    pub fn in_memory(settings: PanelSettings) -> Self {
        Self {
            path: None,
            current: RwLock::new(settings),
        }
    }

    /// Settings written back to `path` on every update.
    pub fn with_path(path: impl Into<PathBuf>, settings: PanelSettings) -> Self {
        Self {
            path: Some(path.into()),
            current: RwLock::new(settings),
        }
    }

    /// Read `path` if it exists, otherwise start from `defaults`.
    ///
    /// Keys missing from the file keep their value from `defaults`.
    pub fn load(path: impl Into<PathBuf>, defaults: PanelSettings) -> anyhow::Result<Self> {
        let path = path.into();
        let settings = if path.exists() {
            let settings: PanelSettings = Figment::from(Serialized::defaults(defaults))
                .merge(Toml::file(&path))
                .extract()
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            if let Err(e) = settings.validate() {
                anyhow::bail!("Invalid settings in {}: {e}", path.display());
            }
            settings
        } else {
            tracing::debug!(path = %path.display(), "No settings file, using defaults");
            defaults
        };
        Ok(Self::with_path(path, settings))
    }

    /// Snapshot of the current settings.
    pub fn settings(&self) -> PanelSettings {
        *self.current.read()
    }

    /// File the settings are saved to, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Mutate the settings and write them back.
    ///
    /// A failed write is logged; the in-memory value is updated regardless.
    pub fn update<F>(&self, f: F) -> PanelSettings
    where
        F: FnOnce(&mut PanelSettings),
    {
        let updated = {
            let mut current = self.current.write();
            f(&mut current);
            *current
        };
        if let Err(e) = self.save() {
            tracing::warn!(error = %e, "Could not save settings");
        }
        updated
    }

    /// Write the current settings to the backing file, if any.
    pub fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(&self.settings()).context("Failed to serialize settings")?;
        std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Settings saved");
        Ok(())
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::in_memory(PanelSettings::default())
    }
}

/// Per-user settings file, `<config dir>/pm100x/settings.toml`.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("pm100x").join("settings.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PanelConfig::default();
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.settings.refresh_time, 0.2);
        assert!(config.settings.auto_power_range);
        assert!(config.device.model.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[device]
model = "PM100A"

[settings]
refresh_time = 0.5
"#
        )
        .unwrap();

        let config = PanelConfig::load_from(file.path()).unwrap();

        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.device.model.as_deref(), Some("PM100A"));
        assert_eq!(config.settings.refresh_time, 0.5);
        // Not in the file
        assert!(config.settings.auto_power_range);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PanelConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.settings, PanelSettings::default());
    }

    #[test]
    fn test_validation() {
        let mut config = PanelConfig::default();
        config.settings.refresh_time = 0.0005;
        assert!(config.validate().unwrap_err().contains("refresh_time"));
        config.settings.refresh_time = 1e30;
        assert!(config.validate().unwrap_err().contains("refresh_time"));
        config.settings.refresh_time = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = PanelConfig::default();
        config.application.log_level = "loud".into();
        assert!(config.validate().unwrap_err().contains("log_level"));

        let mut config = PanelConfig::default();
        config.device.model = Some("PM400".into());
        assert!(config.validate().unwrap_err().contains("PM100D, PM100A"));
    }

    #[test]
    fn test_refresh_interval_bounds() {
        assert_eq!(refresh_interval(0.2), Some(Duration::from_millis(200)));
        assert_eq!(refresh_interval(MIN_REFRESH_TIME), Some(Duration::from_millis(1)));
        assert_eq!(refresh_interval(0.0009), None);
        assert_eq!(refresh_interval(f64::NAN), None);
        assert_eq!(refresh_interval(1e30), None);
        assert!(refresh_interval(86_400.0).is_some());
    }

    #[test]
    fn test_settings_store_writes_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");
        let store = SettingsStore::load(&path, PanelSettings::default()).unwrap();
        assert!(!path.exists());

        store.update(|s| s.refresh_time = 1.5);

        let reloaded = SettingsStore::load(&path, PanelSettings::default()).unwrap();
        assert_eq!(reloaded.settings().refresh_time, 1.5);
        assert!(reloaded.settings().auto_power_range);
        assert_eq!(reloaded.path(), Some(path.as_path()));
    }

    #[test]
    fn test_settings_store_rejects_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "refresh_time = 0.0\n").unwrap();

        assert!(SettingsStore::load(&path, PanelSettings::default()).is_err());
    }

    #[test]
    fn test_in_memory_store_never_writes() {
        let store = SettingsStore::default();
        let updated = store.update(|s| s.auto_power_range = false);
        assert!(!updated.auto_power_range);
        assert!(store.path().is_none());
        assert!(store.save().is_ok());
    }
}
