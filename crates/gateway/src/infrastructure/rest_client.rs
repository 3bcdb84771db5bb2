use async_trait::async_trait;
use std::time::Duration;
use chrono::SecondsFormat;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

use fleet_core::{DeviceId, PositionUpdate, TelemetryEvent, Timestamp};
use fleet_ports::{EventFetchService, FetchError, FetchResult};

use super::parsers::{EventDto, PositionDto};

#[derive(Error, Debug)]
pub enum RestError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {code} - {msg}")]
    Api { code: u16, msg: String },
    #[error("Endpoint not supported: {0}")]
    NotSupported(String),
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Convert infrastructure RestError to domain FetchError
impl From<RestError> for FetchError {
    fn from(err: RestError) -> Self {
        match err {
            RestError::Http(e) => FetchError::Network(e.to_string()),
            RestError::Api { code, msg } => FetchError::Api { code, message: msg },
            RestError::NotSupported(path) => FetchError::NotSupported(path),
            RestError::Parse(msg) => FetchError::Parse(msg),
        }
    }
}

/// REST client for the telemetry server's pull API
/// Infrastructure component - handles HTTP communication
#[derive(Clone)]
pub struct RestEventFetcher {
    client: Client,
    base_url: String,
    credentials: Option<(String, String)>,
    timeout: Duration,
}

impl RestEventFetcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        RestEventFetcher {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Bound on a whole request, connect through body
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use HTTP basic authentication
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((user.into(), password.into()));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Events of a device through the multi-device report endpoint
    pub async fn get_report_events(
        &self,
        device_id: DeviceId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<TelemetryEvent>, RestError> {
        let query = [
            ("deviceId", device_id.get().to_string()),
            ("from", format_time(from)),
            ("to", format_time(to)),
        ];
        let dtos: Vec<EventDto> = self.get("/api/reports/events", &query).await?;
        Ok(dtos.into_iter().map(EventDto::into_event).collect())
    }

    /// Events of a device through the per-device endpoint
    pub async fn get_device_events(
        &self,
        device_id: DeviceId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<TelemetryEvent>, RestError> {
        let path = format!("/api/devices/{}/events", device_id.get());
        let query = [("from", format_time(from)), ("to", format_time(to))];
        let dtos: Vec<EventDto> = self.get(&path, &query).await?;
        Ok(dtos.into_iter().map(EventDto::into_event).collect())
    }

    /// Latest position of a device
    pub async fn get_latest_position(
        &self,
        device_id: DeviceId,
    ) -> Result<Option<PositionUpdate>, RestError> {
        let query = [("deviceId", device_id.get().to_string())];
        let dtos: Vec<PositionDto> = self.get("/api/positions", &query).await?;

        Ok(dtos
            .into_iter()
            .max_by_key(PositionDto::fix_time)
            .map(PositionDto::into_update))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, RestError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .timeout(self.timeout)
            .query(query);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }

        let resp = request.send().await?;
        self.handle_response(path, resp).await
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        path: &str,
        resp: reqwest::Response,
    ) -> Result<T, RestError> {
        let status = resp.status();
        let text = resp.text().await?;

        if let Some(error) = status_error(path, status, &text) {
            return Err(error);
        }

        serde_json::from_str(&text).map_err(|e| RestError::Parse(e.to_string()))
    }
}

fn format_time(timestamp: Timestamp) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Map a non-success status to an error. 404/405/501 mean the server does
/// not offer the endpoint.
fn status_error(path: &str, status: StatusCode, body: &str) -> Option<RestError> {
    if status.is_success() {
        return None;
    }

    match status {
        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => {
            Some(RestError::NotSupported(path.to_string()))
        }
        _ => Some(RestError::Api {
            code: status.as_u16(),
            msg: body.chars().take(200).collect(),
        }),
    }
}

#[async_trait]
impl EventFetchService for RestEventFetcher {
    async fn fetch_events(
        &self,
        device_id: DeviceId,
        from: Timestamp,
        to: Timestamp,
    ) -> FetchResult<Vec<TelemetryEvent>> {
        Ok(self.get_report_events(device_id, from, to).await?)
    }

    async fn fetch_device_events(
        &self,
        device_id: DeviceId,
        from: Timestamp,
        to: Timestamp,
    ) -> FetchResult<Vec<TelemetryEvent>> {
        Ok(self.get_device_events(device_id, from, to).await?)
    }

    async fn fetch_position(&self, device_id: DeviceId) -> FetchResult<Option<PositionUpdate>> {
        Ok(self.get_latest_position(device_id).await?)
    }
}
