//! Solar Telemetry Sync Library
//!
//! This library keeps a local snapshot of a remote solar-energy telemetry API fresh.
//! A single poll loop fetches readings at the configured interval, skips the network
//! while unconfigured or offline, never runs two fetches at once and notifies
//! observers after every state change.

pub mod connectivity;
pub mod error;
pub mod models;
pub mod projection;
pub mod settings_store;
pub mod solar_api;
pub mod synchronizer;

// Re-export commonly used types for easier access
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use error::{FetchError, StoreError};
pub use models::{DailySummary, Snapshot, SolarSnapshot, WidgetData};
pub use projection::{BatteryBand, DashboardView, DisplayStatus};
pub use settings_store::{ConfigStore, Credentials, SettingsStore, TemperatureUnit};
pub use solar_api::{save_validated_api_key, KeyValidation, SnapshotSource, SolarApiClient};
pub use synchronizer::{Subscription, SyncOptions, SyncState, Synchronizer};
