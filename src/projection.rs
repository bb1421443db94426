//! Display-ready values derived from a [`SyncState`].
//!
//! Everything in here is a pure function of its arguments. The only ambient
//! input, the local timezone used for the "Updated" label, is a parameter of
//! [`DashboardView::project_with`].

use crate::error::FetchError;
use crate::models::DailySummary;
use crate::settings_store::TemperatureUnit;
use crate::synchronizer::SyncState;
use chrono::{DateTime, Local, TimeZone, Utc};

const NO_WATTS: &str = "-- W";
const NO_PERCENT: &str = "--%";
const NO_STATUS: &str = "--";
const NO_KWH: &str = "-- kWh";

/// Severity band of a battery state of charge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryBand {
    Critical,
    Low,
    Nominal,
}

impl BatteryBand {
    pub const CRITICAL_BELOW: f64 = 10.0;
    pub const LOW_BELOW: f64 = 20.0;

    pub fn classify(soc: f64) -> Self {
        if soc < Self::CRITICAL_BELOW {
            BatteryBand::Critical
        } else if soc < Self::LOW_BELOW {
            BatteryBand::Low
        } else {
            BatteryBand::Nominal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Red,
    OrangeRed,
    Orange,
    LimeGreen,
    DodgerBlue,
    Gray,
}

impl Color {
    pub fn hex(&self) -> &'static str {
        match self {
            Color::Red => "#FF0000",
            Color::OrangeRed => "#FF4500",
            Color::Orange => "#FFA500",
            Color::LimeGreen => "#32CD32",
            Color::DodgerBlue => "#1E90FF",
            Color::Gray => "#808080",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridState {
    Connected,
    Disconnected,
}

impl GridState {
    /// Anything but "connected" counts as disconnected
    pub fn from_status(status: &str) -> Self {
        if status.trim().eq_ignore_ascii_case("connected") {
            GridState::Connected
        } else {
            GridState::Disconnected
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            GridState::Connected => "Connected",
            GridState::Disconnected => "Disconnected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InverterState {
    Online,
    Offline,
}

impl InverterState {
    pub fn from_status(status: &str) -> Self {
        if status.trim().eq_ignore_ascii_case("online") {
            InverterState::Online
        } else {
            InverterState::Offline
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            InverterState::Online => "Online",
            InverterState::Offline => "Offline",
        }
    }
}

/// Battery colour on the dashboard gauge. Gray when there is no reading.
pub fn battery_color(soc: Option<f64>) -> Color {
    match soc {
        None => Color::Gray,
        Some(soc) if soc < 10.0 => Color::Red,
        Some(soc) if soc < 20.0 => Color::OrangeRed,
        Some(soc) if soc < 50.0 => Color::Orange,
        Some(_) => Color::LimeGreen,
    }
}

pub fn grid_color(state: GridState) -> Color {
    match state {
        GridState::Connected => Color::DodgerBlue,
        GridState::Disconnected => Color::OrangeRed,
    }
}

/// Green for a valid/healthy flag, orange-red otherwise
pub fn status_color(valid: bool) -> Color {
    if valid {
        Color::LimeGreen
    } else {
        Color::OrangeRed
    }
}

/// Maps a 0-100 percentage onto a 0.0-1.0 progress bar value
pub fn percent_to_progress(percent: f64) -> f64 {
    if percent.is_nan() {
        return 0.0;
    }
    (percent / 100.0).clamp(0.0, 1.0)
}

/// `1234.4` -> `"1,234 W"`
pub fn format_watts(watts: f64) -> String {
    format!("{} W", group_number(watts, 0))
}

/// `85.4` -> `"85%"`
pub fn format_percent(percent: f64) -> String {
    format!("{}%", group_number(percent, 0))
}

/// Energy given in Wh, shown in kWh with one decimal: `12345.0` -> `"12.3 kWh"`
pub fn format_kwh(watt_hours: f64) -> String {
    format!("{} kWh", group_number(watt_hours / 1000.0, 1))
}

/// Inverter temperatures arrive in Celsius
pub fn format_temperature(celsius: f64, unit: TemperatureUnit) -> String {
    match unit {
        TemperatureUnit::Celsius => format!("{:.1} °C", celsius),
        TemperatureUnit::Fahrenheit => format!("{:.1} °F", celsius * 9.0 / 5.0 + 32.0),
    }
}

/// Rounds half away from zero to `decimals` places and groups the integer
/// part in thousands.
fn group_number(value: f64, decimals: usize) -> String {
    if !value.is_finite() {
        return NO_STATUS.to_string();
    }
    let scale = 10f64.powi(decimals as i32);
    let scaled = (value.abs() * scale).round();
    let negative = value < 0.0 && scaled > 0.0;

    let fixed = format!("{:.*}", decimals, scaled / scale);
    let (integer, fraction) = match fixed.split_once('.') {
        Some((integer, fraction)) => (integer, Some(fraction)),
        None => (fixed.as_str(), None),
    };

    let mut grouped = String::with_capacity(fixed.len() + integer.len() / 3 + 1);
    if negative {
        grouped.push('-');
    }
    for (i, digit) in integer.chars().enumerate() {
        if i > 0 && (integer.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    if let Some(fraction) = fraction {
        grouped.push('.');
        grouped.push_str(fraction);
    }
    grouped
}

/// What the dashboard should show instead of, or on top of, the readings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStatus {
    NeedsConfiguration,
    Unauthorized,
    Offline,
    /// The last refresh failed; older data may still be shown
    Stale,
    Loading,
    Ready,
}

impl DisplayStatus {
    /// Statuses the user has to act on before any data can be shown
    pub fn blocks_display(&self) -> bool {
        matches!(
            self,
            DisplayStatus::NeedsConfiguration | DisplayStatus::Unauthorized
        )
    }

    fn of(state: &SyncState) -> Self {
        if !state.is_configured {
            DisplayStatus::NeedsConfiguration
        } else if state.last_error == Some(FetchError::Unauthorized) {
            DisplayStatus::Unauthorized
        } else if state.is_offline {
            DisplayStatus::Offline
        } else if state.last_error.is_some() {
            DisplayStatus::Stale
        } else if state.last_snapshot.is_none() {
            DisplayStatus::Loading
        } else {
            DisplayStatus::Ready
        }
    }
}

/// One row of the daily history list
#[derive(Debug, Clone, PartialEq)]
pub struct DailyRow {
    pub date: String,
    pub production: String,
    pub consumption: String,
    pub self_sufficiency: String,
}

impl DailyRow {
    pub fn project(summary: &DailySummary) -> Self {
        Self {
            date: summary.date.format("%b %d").to_string(),
            production: format_kwh(summary.total_production),
            consumption: format_kwh(summary.total_consumption),
            self_sufficiency: format_percent(summary.self_sufficiency),
        }
    }
}

/// Everything the dashboard screen renders
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardView {
    pub status: DisplayStatus,
    pub message: String,
    pub solar_power: String,
    pub consumption: String,
    pub grid_import: String,
    pub grid_export: String,
    pub battery: String,
    pub battery_band: Option<BatteryBand>,
    pub battery_color: Color,
    pub battery_progress: f64,
    pub battery_charging: bool,
    pub grid_status: String,
    pub grid_color: Color,
    pub inverter_status: String,
    pub inverter_temperature: String,
    pub self_sufficiency: String,
    pub today_production: String,
    pub today_consumption: String,
    pub last_updated: String,
    pub is_refreshing: bool,
    pub daily: Vec<DailyRow>,
}

impl DashboardView {
    /// Projects with the host's local time and Fahrenheit temperatures
    pub fn project(state: &SyncState) -> Self {
        Self::project_with(state, TemperatureUnit::Fahrenheit, &Local)
    }

    pub fn project_with<Tz: TimeZone>(state: &SyncState, unit: TemperatureUnit, tz: &Tz) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        let status = DisplayStatus::of(state);
        let current = state.last_snapshot.as_ref().map(|s| &s.current);
        let widget = state.last_snapshot.as_ref().and_then(|s| s.widget.as_ref());
        let soc = current.map(|c| c.battery_soc);
        let grid = current.map(|c| GridState::from_status(&c.grid_status));

        Self {
            status,
            message: status_message(status, state.last_error.as_ref()),
            solar_power: current.map_or(NO_WATTS.to_string(), |c| format_watts(c.solar_production)),
            consumption: current.map_or(NO_WATTS.to_string(), |c| format_watts(c.home_consumption)),
            grid_import: current.map_or(NO_WATTS.to_string(), |c| format_watts(c.grid_import)),
            grid_export: current.map_or(NO_WATTS.to_string(), |c| format_watts(c.grid_export)),
            battery: soc.map_or(NO_PERCENT.to_string(), format_percent),
            battery_band: soc.map(BatteryBand::classify),
            battery_color: battery_color(soc),
            battery_progress: soc.map_or(0.0, percent_to_progress),
            battery_charging: current.is_some_and(|c| c.battery_power > 0.0),
            grid_status: grid.map_or(NO_STATUS, |g| g.label()).to_string(),
            // Assume connected until told otherwise
            grid_color: grid_color(grid.unwrap_or(GridState::Connected)),
            inverter_status: current
                .map_or(NO_STATUS, |c| InverterState::from_status(&c.inverter_status).label())
                .to_string(),
            inverter_temperature: current.map_or(NO_STATUS.to_string(), |c| {
                format_temperature(c.inverter_temperature, unit)
            }),
            self_sufficiency: current.map_or(NO_PERCENT.to_string(), |c| {
                format_percent(c.self_sufficiency)
            }),
            today_production: widget.map_or(NO_KWH.to_string(), |w| format_kwh(w.today_production)),
            today_consumption: widget
                .map_or(NO_KWH.to_string(), |w| format_kwh(w.today_consumption)),
            last_updated: state
                .last_updated_at
                .map(|at| updated_label(at, tz))
                .unwrap_or_default(),
            is_refreshing: state.is_fetching,
            daily: state
                .last_snapshot
                .as_ref()
                .map(|s| s.daily.iter().map(DailyRow::project).collect())
                .unwrap_or_default(),
        }
    }
}

fn updated_label<Tz: TimeZone>(at: DateTime<Utc>, tz: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("Updated {}", at.with_timezone(tz).format("%-I:%M %p"))
}

fn status_message(status: DisplayStatus, error: Option<&FetchError>) -> String {
    match status {
        DisplayStatus::NeedsConfiguration => "Please configure your API key in Settings.".to_string(),
        DisplayStatus::Unauthorized => "Unable to fetch solar data. Check your API key.".to_string(),
        DisplayStatus::Offline => "No internet connection.".to_string(),
        DisplayStatus::Stale => error.map(|e| format!("Error: {e}")).unwrap_or_default(),
        DisplayStatus::Loading | DisplayStatus::Ready => String::new(),
    }
}
