use crate::channel::Channel;
use crate::config::SourceConfig;
use crate::db::models::StationLocation;
use crate::error::Result;
use crate::export::ExportRow;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Statuses worth another attempt.
const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Attempt `n` (counted from 0) waits `n * backoff_step` before the next try.
    pub backoff_step: Duration,
    /// Pause after every successful request.
    pub request_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_secs(5),
            request_delay: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(source: &SourceConfig) -> Self {
        Self {
            max_attempts: source.max_attempts,
            backoff_step: Duration::from_secs(source.backoff_step_secs),
            request_delay: Duration::from_millis(source.request_delay_ms),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StationDataResponse {
    #[serde(rename = "stationId")]
    pub station_id: Option<i32>,
    #[serde(default)]
    pub data: Vec<ApiObservation>,
}

#[derive(Debug, Deserialize)]
pub struct ApiObservation {
    pub datetime: String,
    #[serde(default)]
    pub channels: Vec<ApiChannel>,
}

#[derive(Debug, Deserialize)]
pub struct ApiChannel {
    pub name: Option<String>,
    pub value: Option<f64>,
    #[serde(default)]
    pub valid: bool,
}

#[derive(Debug, Deserialize)]
struct ApiStation {
    #[serde(rename = "stationId")]
    station_id: i32,
    #[serde(default)]
    location: Option<ApiLocation>,
}

#[derive(Debug, Deserialize)]
struct ApiLocation {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

enum Attempt<T> {
    Done(T),
    Retry(String),
}

enum Fetched {
    Body(String),
    NoContent,
    Rejected(StatusCode, String),
}

pub struct Fetcher {
    client: Client,
    base_url: String,
    api_token: String,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(base_url: &str, api_token: &str) -> Result<Self> {
        Self::with_policy(base_url, api_token, RetryPolicy::default(), Duration::from_secs(60))
    }

    pub fn from_config(source: &SourceConfig) -> Result<Self> {
        Self::with_policy(
            &source.base_url,
            &source.api_token,
            RetryPolicy::from_config(source),
            Duration::from_secs(source.request_timeout_secs),
        )
    }

    pub fn with_policy(
        base_url: &str,
        api_token: &str,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("weather-engine/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
            policy,
        })
    }

    /// Fetch one calendar year of observations for a station.
    ///
    /// Returns `Ok(None)` when the API has no data (204), rejects the request
    /// (other 4xx) or keeps failing after every retry. Only a malformed body
    /// is an error.
    pub async fn fetch_station_year(
        &self,
        station_id: i32,
        year: i32,
    ) -> Result<Option<StationDataResponse>> {
        let url = format!(
            "{}/{}/data?from={}/01/01&to={}/01/01",
            self.base_url,
            station_id,
            year,
            year + 1
        );
        info!("Fetching station {} year {}", station_id, year);

        match self.get_body(&url).await {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// Fetch coordinates for every station the API knows about.
    pub async fn fetch_locations(&self) -> Result<HashMap<i32, StationLocation>> {
        debug!("Fetching station location map from {}", self.base_url);

        let Some(body) = self.get_body(&self.base_url).await else {
            return Ok(HashMap::new());
        };

        let stations: Vec<ApiStation> = serde_json::from_str(&body)?;
        let map: HashMap<i32, StationLocation> = stations
            .into_iter()
            .map(|s| {
                let (latitude, longitude) = s
                    .location
                    .map(|l| (l.latitude, l.longitude))
                    .unwrap_or((None, None));
                (
                    s.station_id,
                    StationLocation {
                        station_id: s.station_id,
                        latitude,
                        longitude,
                    },
                )
            })
            .collect();

        info!("Station location map built for {} stations", map.len());
        Ok(map)
    }

    async fn get_body(&self, url: &str) -> Option<String> {
        let client = &self.client;
        let auth = format!("ApiToken {}", self.api_token);
        let auth = auth.as_str();

        let outcome = retry_with_backoff(&self.policy, || async move {
            let response = match client.get(url).header(AUTHORIZATION, auth).send().await {
                Ok(response) => response,
                Err(e) => return Attempt::Retry(format!("Network error ({})", e)),
            };

            let status = response.status();
            if status == StatusCode::NO_CONTENT {
                return Attempt::Done(Fetched::NoContent);
            }
            if RETRYABLE_STATUSES.contains(&status.as_u16()) {
                return Attempt::Retry(format!("Status {}", status));
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                let snippet: String = text.chars().take(100).collect();
                return Attempt::Done(Fetched::Rejected(status, snippet));
            }

            match response.text().await {
                Ok(body) => Attempt::Done(Fetched::Body(body)),
                Err(e) => Attempt::Retry(format!("Failed to read body ({})", e)),
            }
        })
        .await;

        match outcome {
            Some(Fetched::Body(body)) => {
                if !self.policy.request_delay.is_zero() {
                    tokio::time::sleep(self.policy.request_delay).await;
                }
                Some(body)
            }
            Some(Fetched::NoContent) => {
                info!("No content (204) for {}. Station might be inactive for this period.", url);
                None
            }
            Some(Fetched::Rejected(status, snippet)) => {
                warn!("Client error {} for {}: {}", status, url, snippet);
                None
            }
            None => {
                error!(
                    "Giving up on {} after {} attempts",
                    url, self.policy.max_attempts
                );
                None
            }
        }
    }
}

/// Retry a request with linear backoff
///
/// Returns `None` once every attempt asked for a retry.
async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, mut f: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    for attempt in 0..policy.max_attempts {
        match f().await {
            Attempt::Done(result) => return Some(result),
            Attempt::Retry(reason) => {
                if attempt + 1 == policy.max_attempts {
                    warn!(
                        "{} (attempt {}/{}), no retries left",
                        reason,
                        attempt + 1,
                        policy.max_attempts
                    );
                    break;
                }

                let delay = policy.backoff_step * attempt;
                warn!(
                    "{} (attempt {}/{}). Retrying in {:?}...",
                    reason,
                    attempt + 1,
                    policy.max_attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    None
}

/// Flatten one API observation into an export row.
///
/// Only channels flagged valid with a known name are kept.
pub fn flatten_observation(
    obs: &ApiObservation,
    station_id: i32,
    location: Option<&StationLocation>,
) -> ExportRow {
    let mut row = ExportRow::new(obs.datetime.clone(), station_id);
    if let Some(loc) = location {
        row.latitude = loc.latitude;
        row.longitude = loc.longitude;
    }

    for channel in obs.channels.iter().filter(|c| c.valid) {
        let Some(name) = channel.name.as_deref() else {
            continue;
        };
        if let Some(known) = Channel::from_raw_column(&name.to_lowercase()) {
            row.values.set(known, channel.value);
        }
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "stationId": 16,
        "data": [
            {
                "datetime": "2024-03-01T00:10:00+02:00",
                "channels": [
                    {"id": 1, "name": "Rain", "alias": null, "value": 0.3, "status": 1, "valid": true, "description": null},
                    {"id": 4, "name": "WS", "alias": null, "value": 3.1, "status": 1, "valid": true, "description": null},
                    {"id": 5, "name": "WD", "alias": null, "value": 271.0, "status": 1, "valid": true, "description": null},
                    {"id": 7, "name": "TD", "alias": null, "value": 12.4, "status": 2, "valid": false, "description": null},
                    {"id": 9, "name": "BP", "alias": null, "value": 1012.0, "status": 1, "valid": true, "description": null},
                    {"id": 11, "name": "Ws10mm", "alias": null, "value": 4.0, "status": 1, "valid": true, "description": null}
                ]
            }
        ]
    }"#;

    #[test]
    fn test_parse_station_response() {
        let response: StationDataResponse = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(response.station_id, Some(16));
        assert_eq!(response.data.len(), 1);
        assert_eq!(response.data[0].channels.len(), 6);
    }

    #[test]
    fn test_flatten_keeps_valid_known_channels() {
        let response: StationDataResponse = serde_json::from_str(SAMPLE).unwrap();
        let location = StationLocation {
            station_id: 16,
            latitude: Some(32.596),
            longitude: Some(35.277),
        };
        let row = flatten_observation(&response.data[0], 16, Some(&location));

        assert_eq!(row.timestamp, "2024-03-01T00:10:00+02:00");
        assert_eq!(row.station_id, 16);
        assert_eq!(row.latitude, Some(32.596));
        assert_eq!(row.values.get(Channel::Rain), Some(0.3));
        assert_eq!(row.values.get(Channel::Ws), Some(3.1));
        assert_eq!(row.values.get(Channel::Wd), Some(271.0));
        assert_eq!(row.values.get(Channel::Ws10mm), Some(4.0));
        // invalid flag
        assert_eq!(row.values.get(Channel::Td), None);
    }

    #[test]
    fn test_flatten_without_location() {
        let response: StationDataResponse = serde_json::from_str(SAMPLE).unwrap();
        let row = flatten_observation(&response.data[0], 16, None);
        assert_eq!(row.latitude, None);
        assert_eq!(row.longitude, None);
    }

    #[test]
    fn test_empty_body_data_defaults() {
        let response: StationDataResponse = serde_json::from_str(r#"{"stationId": 13}"#).unwrap();
        assert!(response.data.is_empty());
    }
}
