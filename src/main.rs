use anyhow::Context;
use solar_telemetry_sync::{
    save_validated_api_key, ConfigStore, ConnectivityMonitor, DashboardView, KeyValidation,
    SettingsStore, SolarApiClient, SyncOptions, Synchronizer,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_API_URL: &str = "https://solar.acidni.net";
const DEFAULT_SETTINGS_PATH: &str = "solar_settings.json";
const PROBE_PERIOD: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let api_url = env::var("SOLAR_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
    let settings_path =
        env::var("SOLAR_SETTINGS_PATH").unwrap_or_else(|_| DEFAULT_SETTINGS_PATH.to_string());
    let daily_days = match env_number("SOLAR_DAILY_DAYS")? {
        Some(days) => u32::try_from(days).context("SOLAR_DAILY_DAYS is out of range")?,
        None => solar_telemetry_sync::solar_api::DEFAULT_DAILY_DAYS,
    };

    tracing::info!("Starting solar telemetry sync against {}", api_url);

    let store = Arc::new(
        SettingsStore::open(&settings_path)
            .with_context(|| format!("Failed to load settings from {settings_path}"))?,
    );
    let client = Arc::new(SolarApiClient::new(api_url).with_daily_days(daily_days));

    configure_from_env(&client, store.as_ref()).await?;

    let connectivity = Arc::new(ConnectivityMonitor::default());
    let probe_cancel = CancellationToken::new();
    connectivity
        .clone()
        .spawn_probe(client.clone(), PROBE_PERIOD, probe_cancel.clone());

    let synchronizer = Synchronizer::new(
        client,
        store.clone(),
        connectivity,
        SyncOptions::default(),
    );

    let unit_store = store.clone();
    let _subscription = synchronizer.subscribe(move |state| {
        let view = DashboardView::project_with(state, unit_store.temperature_unit(), &chrono::Local);
        if view.status.blocks_display() || !view.message.is_empty() {
            tracing::warn!("{:?}: {}", view.status, view.message);
        } else if !view.is_refreshing {
            tracing::info!(
                "Solar {} | Home {} | Battery {} | Grid {} | Today {} | {}",
                view.solar_power,
                view.consumption,
                view.battery,
                view.grid_status,
                view.today_production,
                view.last_updated
            );
        }
    });

    synchronizer.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down");
    synchronizer.stop();
    probe_cancel.cancel();
    Ok(())
}

/// Applies `SOLAR_API_KEY` and `SOLAR_REFRESH_SECS` to the settings store
async fn configure_from_env(client: &SolarApiClient, store: &dyn ConfigStore) -> anyhow::Result<()> {
    if let Ok(api_key) = env::var("SOLAR_API_KEY") {
        match save_validated_api_key(client, store, &api_key).await? {
            KeyValidation::Saved => {}
            KeyValidation::Rejected => {
                tracing::warn!("SOLAR_API_KEY was rejected, keeping the stored key")
            }
            KeyValidation::Empty => tracing::warn!("SOLAR_API_KEY is empty, ignoring it"),
        }
    }

    if let Some(seconds) = env_number("SOLAR_REFRESH_SECS")? {
        store.set_refresh_interval(Duration::from_secs(seconds))?;
    }

    if store.credentials().is_none() {
        tracing::warn!("No API key configured, set SOLAR_API_KEY to start polling");
    }
    Ok(())
}

fn env_number(name: &str) -> anyhow::Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{name} must be a whole number, got `{raw}`")),
        Err(_) => Ok(None),
    }
}
