use crate::channel::{Channel, ChannelValues};
use chrono::{DateTime, Utc};

/// One row of the raw table.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObservation {
    pub station_id: i32,
    pub timestamp: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub values: ChannelValues,
}

impl RawObservation {
    pub fn new(station_id: i32, timestamp: DateTime<Utc>) -> Self {
        Self {
            station_id,
            timestamp,
            latitude: None,
            longitude: None,
            values: ChannelValues::default(),
        }
    }

    pub fn with(mut self, channel: Channel, value: f64) -> Self {
        self.values.set(channel, Some(value));
        self
    }

    pub fn with_location(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<f64> {
        self.values.get(channel)
    }
}

/// One row of the clean table: a station-hour.
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyAggregate {
    pub station_id: i32,
    /// Start of the hour, UTC.
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Number of raw samples that fell in this hour. Zero for synthesized gap rows.
    pub sample_count: usize,
    pub values: ChannelValues,
}

impl HourlyAggregate {
    pub fn get(&self, channel: Channel) -> Option<f64> {
        self.values.get(channel)
    }

    pub fn is_gap(&self) -> bool {
        self.sample_count == 0
    }
}

#[derive(Debug, Clone)]
pub struct InsertResult {
    pub inserted: usize,
    pub skipped_duplicates: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StationLocation {
    pub station_id: i32,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}
