use crate::error::StoreError;
use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// API key plus the refresh cadence it should be polled with
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
    pub refresh_interval: Duration,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemperatureUnit {
    #[serde(rename = "C")]
    Celsius,
    #[serde(rename = "F")]
    Fahrenheit,
}

/// Source of credentials and preferences for the synchronizer.
///
/// Read at the start of every poll cycle, so changes take effect without a
/// restart.
pub trait ConfigStore: Send + Sync {
    /// Stored credentials, or `None` when no usable key is stored
    fn credentials(&self) -> Option<Credentials>;
    fn set_credentials(&self, api_key: &str) -> Result<(), StoreError>;
    /// Removes the key. A no-op when nothing is stored.
    fn clear_credentials(&self) -> Result<(), StoreError>;
    fn refresh_interval(&self) -> Duration;
    /// Intervals are kept in whole seconds, rounded to the nearest one and
    /// never below [`MIN_REFRESH_INTERVAL`].
    fn set_refresh_interval(&self, interval: Duration) -> Result<(), StoreError>;
    fn notifications_enabled(&self) -> bool;
    fn set_notifications_enabled(&self, enabled: bool) -> Result<(), StoreError>;
    fn temperature_unit(&self) -> TemperatureUnit;
    fn set_temperature_unit(&self, unit: TemperatureUnit) -> Result<(), StoreError>;
}

/// On-disk shape of the settings file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Settings {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default = "default_refresh_interval_seconds")]
    refresh_interval_seconds: u64,
    #[serde(default = "default_true")]
    notifications_enabled: bool,
    #[serde(default = "default_temperature_unit")]
    temperature_unit: TemperatureUnit,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            refresh_interval_seconds: default_refresh_interval_seconds(),
            notifications_enabled: true,
            temperature_unit: default_temperature_unit(),
        }
    }
}

fn default_refresh_interval_seconds() -> u64 {
    DEFAULT_REFRESH_INTERVAL.as_secs()
}

fn default_true() -> bool {
    true
}

fn default_temperature_unit() -> TemperatureUnit {
    TemperatureUnit::Fahrenheit
}

/// Settings kept in memory and, when opened with a path, mirrored to a JSON file
pub struct SettingsStore {
    path: Option<PathBuf>,
    settings: RwLock<Settings>,
}

impl SettingsStore {
    /// Store that forgets everything when dropped
    pub fn in_memory() -> Self {
        Self {
            path: None,
            settings: RwLock::new(Settings::default()),
        }
    }

    /// Loads the settings file at `path`, starting from defaults if it does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let settings = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No settings file at {:?}, using defaults", path);
                Settings::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            settings: RwLock::new(settings),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Settings> {
        self.settings.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Settings> {
        self.settings.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Applies `change` and persists the result while still holding the write lock
    fn update(&self, change: impl FnOnce(&mut Settings)) -> Result<(), StoreError> {
        let mut settings = self.write();
        let mut updated = settings.clone();
        change(&mut updated);
        if updated == *settings {
            return Ok(());
        }
        if let Some(path) = &self.path {
            persist(path, &updated)?;
        }
        *settings = updated;
        Ok(())
    }
}

fn persist(path: &Path, settings: &Settings) -> Result<(), StoreError> {
    let content = serde_json::to_string_pretty(settings)?;
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = open_private(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    tracing::debug!("Saved settings to {:?}", path);
    Ok(())
}

/// The file holds the API key, so only the owner may read it
#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

impl ConfigStore for SettingsStore {
    fn credentials(&self) -> Option<Credentials> {
        let settings = self.read();
        let api_key = settings.api_key.as_deref()?.trim();
        if api_key.is_empty() {
            return None;
        }
        Some(Credentials {
            api_key: api_key.to_string(),
            refresh_interval: clamp_interval(settings.refresh_interval_seconds),
        })
    }

    fn set_credentials(&self, api_key: &str) -> Result<(), StoreError> {
        let api_key = api_key.trim().to_string();
        self.update(|s| s.api_key = Some(api_key))
    }

    fn clear_credentials(&self) -> Result<(), StoreError> {
        self.update(|s| s.api_key = None)
    }

    fn refresh_interval(&self) -> Duration {
        clamp_interval(self.read().refresh_interval_seconds)
    }

    fn set_refresh_interval(&self, interval: Duration) -> Result<(), StoreError> {
        let seconds = interval.max(MIN_REFRESH_INTERVAL).as_secs_f64().round() as u64;
        self.update(|s| s.refresh_interval_seconds = seconds)
    }

    fn notifications_enabled(&self) -> bool {
        self.read().notifications_enabled
    }

    fn set_notifications_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        self.update(|s| s.notifications_enabled = enabled)
    }

    fn temperature_unit(&self) -> TemperatureUnit {
        self.read().temperature_unit
    }

    fn set_temperature_unit(&self, unit: TemperatureUnit) -> Result<(), StoreError> {
        self.update(|s| s.temperature_unit = unit)
    }
}

fn clamp_interval(seconds: u64) -> Duration {
    Duration::from_secs(seconds).max(MIN_REFRESH_INTERVAL)
}
