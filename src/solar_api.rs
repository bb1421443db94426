use crate::error::FetchError;
use crate::models::{DailySummary, HealthResponse, Snapshot, SolarSnapshot, WidgetData};
use crate::settings_store::ConfigStore;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DAILY_DAYS: u32 = 7;
const API_KEY_HEADER: &str = "X-API-Key";

/// The fixed set of endpoints the solar API exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Current,
    Widget,
    Daily { days: u32 },
    Health,
}

impl Endpoint {
    pub fn path(&self) -> String {
        match self {
            Endpoint::Current => "/api/solarapi/current".to_string(),
            Endpoint::Widget => "/api/solarapi/widget".to_string(),
            Endpoint::Daily { days } => format!("/api/solarapi/daily?days={days}"),
            Endpoint::Health => "/api/solarapi/health".to_string(),
        }
    }
}

/// Produces one [`Snapshot`] per call. The synchronizer only talks to this trait.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, api_key: &str, deadline: Duration)
        -> Result<Snapshot, FetchError>;
}

pub struct SolarApiClient {
    endpoint_url: String,
    daily_days: u32,
    client: reqwest::Client,
}

impl SolarApiClient {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into().trim_end_matches('/').to_string(),
            daily_days: DEFAULT_DAILY_DAYS,
            client: reqwest::Client::new(),
        }
    }

    /// Number of days requested from the daily endpoint on each snapshot
    pub fn with_daily_days(mut self, days: u32) -> Self {
        self.daily_days = days;
        self
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    /// Performs one GET against `endpoint` and decodes the body.
    ///
    /// `api_key` is sent as `X-API-Key` when present.
    pub async fn fetch<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint,
        api_key: Option<&str>,
        deadline: Duration,
    ) -> Result<T, FetchError> {
        let url = format!("{}{}", self.endpoint_url, endpoint.path());
        tracing::debug!("GET {}", url);

        let mut request = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(deadline);
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await.map_err(classify_transport)?;
        check_status(response.status())?;
        let body = response.bytes().await.map_err(classify_transport)?;

        serde_json::from_slice(&body).map_err(|e| {
            tracing::warn!("Unexpected body from {}: {}", url, e);
            FetchError::MalformedResponse
        })
    }

    pub async fn get_current(&self, api_key: &str) -> Result<SolarSnapshot, FetchError> {
        self.fetch(Endpoint::Current, Some(api_key), DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    pub async fn get_widget_data(&self, api_key: &str) -> Result<WidgetData, FetchError> {
        self.fetch(Endpoint::Widget, Some(api_key), DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    pub async fn get_daily_summaries(
        &self,
        api_key: &str,
        days: u32,
    ) -> Result<Vec<DailySummary>, FetchError> {
        self.fetch(Endpoint::Daily { days }, Some(api_key), DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    /// Liveness check, sent without credentials
    pub async fn check_health(&self) -> Result<HealthResponse, FetchError> {
        self.fetch(Endpoint::Health, None, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    /// True when the health endpoint accepts `api_key`. Never errors.
    pub async fn validate_api_key(&self, api_key: &str) -> bool {
        match self
            .fetch::<serde_json::Value>(Endpoint::Health, Some(api_key), DEFAULT_REQUEST_TIMEOUT)
            .await
        {
            // A 2xx with an odd body still means the key was accepted
            Ok(_) | Err(FetchError::MalformedResponse) => true,
            Err(e) => {
                tracing::debug!("API key validation failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl SnapshotSource for SolarApiClient {
    async fn fetch_snapshot(
        &self,
        api_key: &str,
        deadline: Duration,
    ) -> Result<Snapshot, FetchError> {
        let (current, widget, daily) = tokio::join!(
            self.fetch::<SolarSnapshot>(Endpoint::Current, Some(api_key), deadline),
            self.fetch::<WidgetData>(Endpoint::Widget, Some(api_key), deadline),
            self.fetch::<Vec<DailySummary>>(
                Endpoint::Daily {
                    days: self.daily_days
                },
                Some(api_key),
                deadline
            ),
        );

        let current = current?;
        let widget = widget
            .map_err(|e| tracing::warn!("Widget data unavailable: {}", e))
            .ok();
        let daily = daily
            .map_err(|e| tracing::warn!("Daily summaries unavailable: {}", e))
            .unwrap_or_default();

        Ok(Snapshot {
            fetched_at: Utc::now(),
            current,
            widget,
            daily,
        })
    }
}

fn check_status(status: StatusCode) -> Result<(), FetchError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(FetchError::Unauthorized)
    } else {
        Err(FetchError::ServerError(status.as_u16()))
    }
}

fn classify_transport(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else if e.is_decode() {
        FetchError::MalformedResponse
    } else {
        tracing::debug!("Transport failure: {}", e);
        FetchError::Unreachable
    }
}

/// Outcome of [`save_validated_api_key`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyValidation {
    Saved,
    Rejected,
    Empty,
}

/// Validates `api_key` against the API and stores it only when accepted
pub async fn save_validated_api_key(
    client: &SolarApiClient,
    store: &dyn ConfigStore,
    api_key: &str,
) -> anyhow::Result<KeyValidation> {
    let api_key = api_key.trim();
    if api_key.is_empty() {
        return Ok(KeyValidation::Empty);
    }
    if !client.validate_api_key(api_key).await {
        tracing::warn!("API key was rejected by {}", client.endpoint_url());
        return Ok(KeyValidation::Rejected);
    }
    store.set_credentials(api_key)?;
    tracing::info!("API key validated and saved");
    Ok(KeyValidation::Saved)
}

#[cfg(test)]
mod test_solar_api {
    use super::*;
    use crate::settings_store::SettingsStore;
    use tokio::net::TcpListener;
    use tokio_test::{assert_err, assert_ok};

    const CURRENT_BODY: &str = r#"
        {
            "timestamp": "2025-06-01T12:30:00Z",
            "solarProduction": 4200.0,
            "homeConsumption": 1800.0,
            "gridImport": 0.0,
            "gridExport": 2400.0,
            "batterySOC": 87.0,
            "batteryPower": 350.0,
            "batteryVoltage": 52.1,
            "inverterTemperature": 41.2,
            "gridStatus": "connected",
            "inverterStatus": "online",
            "selfSufficiency": 100.0
        }
    "#;

    const WIDGET_BODY: &str = r#"
        {
            "production": 4200.0,
            "consumption": 1800.0,
            "battery": 87.0,
            "grid": "connected",
            "selfSufficiency": 100.0,
            "todayProduction": 15300.0,
            "todayConsumption": 9100.0,
            "timestamp": "2025-06-01T12:30:00Z"
        }
    "#;

    #[tokio::test]
    async fn test_get_current_sends_api_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/solarapi/current")
            .match_header("X-API-Key", "test_key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(CURRENT_BODY)
            .create_async()
            .await;

        let api = SolarApiClient::new(server.url());
        let result = api.get_current("test_key").await.unwrap();

        assert_eq!(result.solar_production, 4200.0);
        assert_eq!(result.battery_soc, 87.0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_snapshot_combines_endpoints() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/solarapi/current")
            .with_status(200)
            .with_body(CURRENT_BODY)
            .create_async()
            .await;
        server
            .mock("GET", "/api/solarapi/widget")
            .with_status(200)
            .with_body(WIDGET_BODY)
            .create_async()
            .await;
        let daily = server
            .mock("GET", "/api/solarapi/daily")
            .match_query(mockito::Matcher::UrlEncoded("days".into(), "3".into()))
            .with_status(200)
            .with_body(r#"[{"date": "2025-05-31T00:00:00Z", "totalProduction": 21000.0}]"#)
            .create_async()
            .await;

        let api = SolarApiClient::new(server.url()).with_daily_days(3);
        let snapshot = api
            .fetch_snapshot("test_key", DEFAULT_REQUEST_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(snapshot.current.home_consumption, 1800.0);
        assert_eq!(snapshot.widget.unwrap().today_production, 15300.0);
        assert_eq!(snapshot.daily.len(), 1);
        daily.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_snapshot_tolerates_missing_extras() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/solarapi/current")
            .with_status(200)
            .with_body(CURRENT_BODY)
            .create_async()
            .await;
        server
            .mock("GET", "/api/solarapi/widget")
            .with_status(500)
            .create_async()
            .await;
        server
            .mock("GET", mockito::Matcher::Regex("^/api/solarapi/daily".into()))
            .with_status(200)
            .with_body("garbage")
            .create_async()
            .await;

        let api = SolarApiClient::new(server.url());
        let snapshot = api
            .fetch_snapshot("test_key", DEFAULT_REQUEST_TIMEOUT)
            .await
            .unwrap();

        assert!(snapshot.widget.is_none());
        assert!(snapshot.daily.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_snapshot_fails_when_current_fails() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/solarapi/current")
            .with_status(401)
            .create_async()
            .await;
        server
            .mock("GET", "/api/solarapi/widget")
            .with_status(200)
            .with_body(WIDGET_BODY)
            .create_async()
            .await;

        let api = SolarApiClient::new(server.url());
        let result = api.fetch_snapshot("bad_key", DEFAULT_REQUEST_TIMEOUT).await;

        assert_eq!(result.unwrap_err(), FetchError::Unauthorized);
    }

    #[tokio::test]
    async fn test_status_codes_are_classified() {
        let mut server = mockito::Server::new_async().await;
        let api = SolarApiClient::new(server.url());

        let forbidden = server
            .mock("GET", "/api/solarapi/widget")
            .with_status(403)
            .create_async()
            .await;
        assert_eq!(
            api.get_widget_data("k").await.unwrap_err(),
            FetchError::Unauthorized
        );
        forbidden.remove_async().await;

        server
            .mock("GET", "/api/solarapi/widget")
            .with_status(503)
            .create_async()
            .await;
        assert_eq!(
            api.get_widget_data("k").await.unwrap_err(),
            FetchError::ServerError(503)
        );
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/solarapi/current")
            .with_status(200)
            .with_body(r#"{"solarProduction": "lots"}"#)
            .create_async()
            .await;

        let api = SolarApiClient::new(server.url());
        assert_eq!(
            api.get_current("k").await.unwrap_err(),
            FetchError::MalformedResponse
        );
    }

    #[tokio::test]
    async fn test_null_statuses_do_not_fail_the_fetch() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/solarapi/current")
            .with_status(200)
            .with_body(
                r#"{"timestamp": "2025-06-01T12:30:00Z", "batterySOC": 50.0,
                    "gridStatus": null, "inverterStatus": null}"#,
            )
            .create_async()
            .await;

        let api = SolarApiClient::new(server.url());
        let current = assert_ok!(api.get_current("k").await);

        assert_eq!(current.grid_status, "connected");
        assert_eq!(current.inverter_status, "online");
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let api = SolarApiClient::new(format!("http://{addr}"));
        assert_eq!(
            api.get_current("k").await.unwrap_err(),
            FetchError::Unreachable
        );
    }

    #[tokio::test]
    async fn test_deadline_surfaces_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept connections but never answer
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let api = SolarApiClient::new(format!("http://{addr}"));
        let result = api
            .fetch::<SolarSnapshot>(Endpoint::Current, Some("k"), Duration::from_millis(200))
            .await;

        assert_eq!(result.unwrap_err(), FetchError::Timeout);
    }

    #[tokio::test]
    async fn test_check_health_sends_no_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/solarapi/health")
            .match_header("X-API-Key", mockito::Matcher::Missing)
            .with_status(200)
            .with_body(r#"{"status": "healthy", "version": "2.4.1"}"#)
            .create_async()
            .await;

        let api = SolarApiClient::new(server.url());
        let health = assert_ok!(api.check_health().await);

        assert_eq!(health.status, "healthy");
        assert_eq!(health.version, "2.4.1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_validate_api_key_unauthorized_is_false() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/solarapi/health")
            .match_header("X-API-Key", "wrong")
            .with_status(401)
            .create_async()
            .await;

        let api = SolarApiClient::new(server.url());
        assert!(!api.validate_api_key("wrong").await);
    }

    #[tokio::test]
    async fn test_validate_api_key_accepts_2xx() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/solarapi/health")
            .match_header("X-API-Key", "right")
            .with_status(200)
            .with_body(r#"{"status": "healthy", "version": "1"}"#)
            .create_async()
            .await;

        let api = SolarApiClient::new(server.url());
        assert!(api.validate_api_key("right").await);
    }

    #[tokio::test]
    async fn test_save_validated_api_key() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/solarapi/health")
            .match_header("X-API-Key", "good")
            .with_status(200)
            .with_body(r#"{"status": "healthy", "version": "1"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/api/solarapi/health")
            .match_header("X-API-Key", "bad")
            .with_status(401)
            .create_async()
            .await;

        let api = SolarApiClient::new(server.url());
        let store = SettingsStore::in_memory();

        assert_eq!(
            save_validated_api_key(&api, &store, "   ").await.unwrap(),
            KeyValidation::Empty
        );
        assert_eq!(
            save_validated_api_key(&api, &store, "bad").await.unwrap(),
            KeyValidation::Rejected
        );
        assert_eq!(store.credentials(), None);

        assert_eq!(
            save_validated_api_key(&api, &store, " good ").await.unwrap(),
            KeyValidation::Saved
        );
        assert_eq!(store.credentials().unwrap().api_key, "good");
    }

    #[tokio::test]
    async fn test_health_on_dead_host_is_err() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let api = SolarApiClient::new(format!("http://{addr}/"));
        assert_err!(api.check_health().await);
        assert!(!api.validate_api_key("k").await);
    }

    #[test]
    fn test_endpoint_paths() {
        assert_eq!(Endpoint::Current.path(), "/api/solarapi/current");
        assert_eq!(Endpoint::Widget.path(), "/api/solarapi/widget");
        assert_eq!(Endpoint::Daily { days: 7 }.path(), "/api/solarapi/daily?days=7");
        assert_eq!(Endpoint::Health.path(), "/api/solarapi/health");
    }
}
