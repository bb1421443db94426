use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserializer;
use serde_derive::{Deserialize, Serialize};

/// Real-time reading from `/api/solarapi/current`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolarSnapshot {
    #[serde(with = "iso8601")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub solar_production: f64,
    #[serde(default)]
    pub home_consumption: f64,
    #[serde(default)]
    pub grid_import: f64,
    #[serde(default)]
    pub grid_export: f64,
    #[serde(rename = "batterySOC", default)]
    pub battery_soc: f64,
    #[serde(default)]
    pub battery_power: f64,
    #[serde(default)]
    pub battery_voltage: f64,
    #[serde(default)]
    pub inverter_temperature: f64,
    #[serde(default = "default_grid_status", deserialize_with = "grid_status_or_default")]
    pub grid_status: String,
    #[serde(default)]
    pub generator_status: Option<String>,
    #[serde(
        default = "default_inverter_status",
        deserialize_with = "inverter_status_or_default"
    )]
    pub inverter_status: String,
    #[serde(default)]
    pub self_sufficiency: f64,
}

/// Compact reading from `/api/solarapi/widget`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetData {
    #[serde(default)]
    pub production: f64,
    #[serde(default)]
    pub consumption: f64,
    #[serde(default)]
    pub battery: f64,
    #[serde(default = "default_grid_status", deserialize_with = "grid_status_or_default")]
    pub grid: String,
    #[serde(default)]
    pub self_sufficiency: f64,
    #[serde(default)]
    pub today_production: f64,
    #[serde(default)]
    pub today_consumption: f64,
    #[serde(with = "iso8601")]
    pub timestamp: DateTime<Utc>,
}

/// One entry of `/api/solarapi/daily`, energies in Wh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    #[serde(with = "iso8601")]
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub total_production: f64,
    #[serde(default)]
    pub total_consumption: f64,
    #[serde(default)]
    pub total_grid_import: f64,
    #[serde(default)]
    pub total_grid_export: f64,
    #[serde(default)]
    pub peak_production: f64,
    #[serde(rename = "avgBatterySOC", default)]
    pub avg_battery_soc: f64,
    #[serde(default)]
    pub self_sufficiency: f64,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    #[serde(default, deserialize_with = "string_or_empty")]
    pub status: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub version: String,
}

/// Everything one successful poll cycle produced.
///
/// Only `current` is mandatory; the widget and daily calls are best effort.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub fetched_at: DateTime<Utc>,
    pub current: SolarSnapshot,
    pub widget: Option<WidgetData>,
    pub daily: Vec<DailySummary>,
}

impl Snapshot {
    /// Snapshot holding only a `/current` reading
    pub fn from_current(current: SolarSnapshot) -> Self {
        Self {
            fetched_at: Utc::now(),
            current,
            widget: None,
            daily: Vec::new(),
        }
    }
}

fn default_grid_status() -> String {
    "connected".to_string()
}

fn default_inverter_status() -> String {
    "online".to_string()
}

/// Reads a string field, substituting `default` for an explicit `null`
fn null_as<'de, D: Deserializer<'de>>(
    deserializer: D,
    default: fn() -> String,
) -> Result<String, D::Error> {
    let value = <Option<String> as serde::Deserialize>::deserialize(deserializer)?;
    Ok(value.unwrap_or_else(default))
}

fn grid_status_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    null_as(deserializer, default_grid_status)
}

fn inverter_status_or_default<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<String, D::Error> {
    null_as(deserializer, default_inverter_status)
}

fn string_or_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    null_as(deserializer, String::new)
}

/// ISO-8601 timestamps, with or without an offset. Offset-less values are UTC.
mod iso8601 {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp `{raw}`")))
    }

    pub(super) fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(with_offset) = DateTime::parse_from_rfc3339(raw) {
            return Some(with_offset.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn reading(battery_soc: f64) -> SolarSnapshot {
        SolarSnapshot {
            timestamp: Utc.with_ymd_and_hms(2025, 1, 5, 14, 5, 0).unwrap(),
            solar_production: 3456.4,
            home_consumption: 1200.0,
            grid_import: 0.0,
            grid_export: 2256.4,
            battery_soc,
            battery_power: -420.0,
            battery_voltage: 51.8,
            inverter_temperature: 38.5,
            grid_status: "connected".to_string(),
            generator_status: None,
            inverter_status: "online".to_string(),
            self_sufficiency: 85.4,
        }
    }

    pub(crate) fn snapshot_with_soc(battery_soc: f64) -> Snapshot {
        Snapshot::from_current(reading(battery_soc))
    }
}
