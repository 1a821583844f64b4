//! Hourly aggregation of raw station observations.
//!
//! Each station is resampled independently onto a regular hourly grid that
//! spans its first to last observed hour. Wind direction is never averaged
//! directly: every sample is decomposed into u/v components first and the
//! components are averaged.

use crate::channel::{Channel, ChannelSet, ChannelValues};
use crate::config::{AggregationConfig, RainSumPolicy};
use crate::db::models::{HourlyAggregate, RawObservation};
use crate::error::{AppError, Result};
use crate::interpolate::fill_gaps;
use crate::wind::sample_components;
use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// All raw observations of one station.
#[derive(Debug, Clone)]
pub struct StationBatch {
    pub station_id: i32,
    pub observations: Vec<RawObservation>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregationWarning {
    /// No latitude or longitude was ever observed; rows carry (0.0, 0.0).
    MissingLocation { station_id: i32 },
}

impl fmt::Display for AggregationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationWarning::MissingLocation { station_id } => write!(
                f,
                "No latitude/longitude found for station {}, using 0.0",
                station_id
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StationAggregate {
    pub station_id: i32,
    pub rows: Vec<HourlyAggregate>,
    pub warnings: Vec<AggregationWarning>,
}

#[derive(Debug, Clone)]
pub struct AggregationOutput {
    /// Columns of the hourly table.
    pub channels: ChannelSet,
    /// Rows ordered by station, then hour.
    pub rows: Vec<HourlyAggregate>,
    pub warnings: Vec<AggregationWarning>,
    pub stations: usize,
}

/// Truncate an instant to the top of its hour.
///
/// Works on whole seconds, so any instant chrono can represent is accepted.
pub fn floor_hour(t: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let secs = t.timestamp().div_euclid(3600) * 3600;
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AppError::InvalidData(format!("Cannot truncate {} to the hour", t)))
}

/// Split a flat observation list into per-station batches ordered by id.
pub fn group_by_station(observations: Vec<RawObservation>) -> Vec<StationBatch> {
    let mut by_station: BTreeMap<i32, Vec<RawObservation>> = BTreeMap::new();
    for obs in observations {
        by_station.entry(obs.station_id).or_default().push(obs);
    }
    by_station
        .into_iter()
        .map(|(station_id, observations)| StationBatch {
            station_id,
            observations,
        })
        .collect()
}

/// Aggregate one station's raw observations into hourly rows.
///
/// `channels` is the raw schema; channels outside it are never emitted.
pub fn aggregate_station(
    station_id: i32,
    mut observations: Vec<RawObservation>,
    channels: &ChannelSet,
    config: &AggregationConfig,
) -> Result<StationAggregate> {
    let mut warnings = Vec::new();

    if observations.is_empty() {
        return Ok(StationAggregate {
            station_id,
            rows: Vec::new(),
            warnings,
        });
    }

    if let Some(stray) = observations.iter().find(|o| o.station_id != station_id) {
        return Err(AppError::Aggregation {
            station_id,
            reason: format!("batch contains an observation of station {}", stray.station_id),
        });
    }

    // Stable: equal timestamps keep their input order.
    observations.sort_by_key(|o| o.timestamp);

    let (latitude, longitude) = match resolve_location(&observations) {
        Some(loc) => loc,
        None => {
            let warning = AggregationWarning::MissingLocation { station_id };
            warn!("{}", warning);
            warnings.push(warning);
            (0.0, 0.0)
        }
    };

    let hourly = channels.hourly();
    let samples: Vec<ChannelValues> = observations
        .iter()
        .map(|o| derive_sample(o, channels))
        .collect();

    let first_hour = floor_hour(observations[0].timestamp)?;
    let last_hour = floor_hour(observations[observations.len() - 1].timestamp)?;
    let span = (last_hour - first_hour).num_hours() + 1;

    if span > config.max_span_hours {
        return Err(AppError::Aggregation {
            station_id,
            reason: format!(
                "observations span {} hours ({} to {}), limit is {}",
                span, first_hour, last_hour, config.max_span_hours
            ),
        });
    }

    // Sorted input means every bucket is a contiguous slice of `samples`.
    let mut bucket_ranges: Vec<(usize, usize)> = vec![(0, 0); span as usize];
    let mut start = 0;
    while start < observations.len() {
        let hour = floor_hour(observations[start].timestamp)?;
        let mut end = start + 1;
        while end < observations.len() && floor_hour(observations[end].timestamp)? == hour {
            end += 1;
        }
        let idx = (hour - first_hour).num_hours() as usize;
        bucket_ranges[idx] = (start, end);
        start = end;
    }

    let mut rows: Vec<HourlyAggregate> = bucket_ranges
        .iter()
        .enumerate()
        .map(|(i, &(from, to))| {
            let bucket = &samples[from..to];
            HourlyAggregate {
                station_id,
                timestamp: first_hour + Duration::hours(i as i64),
                latitude,
                longitude,
                sample_count: bucket.len(),
                values: reduce_bucket(bucket, &hourly, config.rain_sum_policy),
            }
        })
        .collect();

    for channel in hourly.iter() {
        let mut series: Vec<Option<f64>> = rows.iter().map(|r| r.get(channel)).collect();
        fill_gaps(&mut series, config.interpolation_limit);
        for (row, value) in rows.iter_mut().zip(series) {
            row.values.set(channel, value);
        }
    }

    let gaps = rows.iter().filter(|r| r.is_gap()).count();
    debug!(
        "Station {}: {} observations -> {} hourly rows ({} without samples)",
        station_id,
        observations.len(),
        rows.len(),
        gaps
    );

    Ok(StationAggregate {
        station_id,
        rows,
        warnings,
    })
}

/// Aggregate every station and concatenate the results.
///
/// Stations are independent and processed in parallel; the output order is
/// station id, then hour. The first station failure aborts the whole batch.
pub fn aggregate_stations(
    mut batches: Vec<StationBatch>,
    channels: &ChannelSet,
    config: &AggregationConfig,
) -> Result<AggregationOutput> {
    batches.sort_by_key(|b| b.station_id);
    let stations = batches.len();

    let per_station: Vec<StationAggregate> = batches
        .into_par_iter()
        .map(|batch| aggregate_station(batch.station_id, batch.observations, channels, config))
        .collect::<Result<Vec<_>>>()?;

    let total_rows = per_station.iter().map(|s| s.rows.len()).sum();
    let mut rows = Vec::with_capacity(total_rows);
    let mut warnings = Vec::new();
    for station in per_station {
        rows.extend(station.rows);
        warnings.extend(station.warnings);
    }

    info!(
        "Aggregated {} stations into {} hourly rows ({} warnings)",
        stations,
        rows.len(),
        warnings.len()
    );

    Ok(AggregationOutput {
        channels: channels.hourly(),
        rows,
        warnings,
        stations,
    })
}

/// First non-missing latitude and longitude in timestamp order.
fn resolve_location(observations: &[RawObservation]) -> Option<(f64, f64)> {
    let latitude = observations.iter().find_map(|o| o.latitude)?;
    let longitude = observations.iter().find_map(|o| o.longitude)?;
    Some((latitude, longitude))
}

/// Raw sample values plus the per-sample derived channels.
fn derive_sample(obs: &RawObservation, channels: &ChannelSet) -> ChannelValues {
    let mut values = ChannelValues::default();

    for channel in channels.iter().filter(|c| !c.is_derived()) {
        values.set(channel, obs.get(channel));
    }

    if channels.has_wind_vectors() {
        if let Some((u, v)) = sample_components(obs.get(Channel::Ws), obs.get(Channel::Wd)) {
            values.set(Channel::UVec, Some(u));
            values.set(Channel::VVec, Some(v));
        }
    }

    if channels.contains(Channel::Rain) {
        values.set(Channel::RainIntensityMax, obs.get(Channel::Rain));
    }

    values
}

fn reduce_bucket(
    bucket: &[ChannelValues],
    hourly: &ChannelSet,
    rain_policy: RainSumPolicy,
) -> ChannelValues {
    let mut out = ChannelValues::default();
    if bucket.is_empty() {
        return out;
    }

    for channel in hourly.iter() {
        let Some(reducer) = channel.reducer() else {
            continue;
        };
        let mut value = reducer.apply(bucket.iter().filter_map(|s| s.get(channel)));

        if channel == Channel::Rain && value.is_none() && rain_policy == RainSumPolicy::Zero {
            value = Some(0.0);
        }
        out.set(channel, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, h, m, 0).unwrap()
    }

    fn config() -> AggregationConfig {
        AggregationConfig::default()
    }

    #[test]
    fn test_floor_hour() {
        assert_eq!(floor_hour(at(10, 59)).unwrap(), at(10, 0));
        assert_eq!(floor_hour(at(10, 0)).unwrap(), at(10, 0));
    }

    #[test]
    fn test_floor_hour_outside_nanosecond_range() {
        let ancient = Utc.with_ymd_and_hms(1500, 6, 1, 10, 59, 30).unwrap();
        assert_eq!(
            floor_hour(ancient).unwrap(),
            Utc.with_ymd_and_hms(1500, 6, 1, 10, 0, 0).unwrap()
        );
        let future = Utc.with_ymd_and_hms(2300, 1, 1, 0, 30, 0).unwrap();
        assert_eq!(
            floor_hour(future).unwrap(),
            Utc.with_ymd_and_hms(2300, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_ancient_timestamp_hits_span_limit() {
        let obs = vec![
            RawObservation::new(16, Utc.with_ymd_and_hms(1500, 6, 1, 10, 0, 0).unwrap())
                .with(Channel::Td, 1.0),
            RawObservation::new(16, at(10, 0)).with(Channel::Td, 1.0),
        ];
        let err = aggregate_station(16, obs, &ChannelSet::all_raw(), &config()).unwrap_err();
        assert!(matches!(err, AppError::Aggregation { station_id: 16, .. }));
    }

    #[test]
    fn test_reducers_per_channel() {
        let obs = vec![
            RawObservation::new(16, at(10, 0))
                .with(Channel::Rain, 0.2)
                .with(Channel::TdMax, 20.0)
                .with(Channel::TdMin, 15.0)
                .with(Channel::Td, 18.0)
                .with(Channel::WsMax, 7.0),
            RawObservation::new(16, at(10, 10))
                .with(Channel::Rain, 0.6)
                .with(Channel::TdMax, 22.0)
                .with(Channel::TdMin, 14.0)
                .with(Channel::Td, 20.0)
                .with(Channel::WsMax, 9.0),
        ];

        let result = aggregate_station(16, obs, &ChannelSet::all_raw(), &config()).unwrap();
        assert_eq!(result.rows.len(), 1);
        let row = &result.rows[0];
        assert!((row.get(Channel::Rain).unwrap() - 0.8).abs() < 1e-9);
        assert_eq!(row.get(Channel::RainIntensityMax), Some(0.6));
        assert_eq!(row.get(Channel::TdMax), Some(22.0));
        assert_eq!(row.get(Channel::TdMin), Some(14.0));
        assert_eq!(row.get(Channel::Td), Some(19.0));
        assert_eq!(row.get(Channel::WsMax), Some(9.0));
        assert_eq!(row.get(Channel::Rh), None);
        assert_eq!(row.sample_count, 2);
    }

    #[test]
    fn test_circular_average_across_north() {
        let obs: Vec<RawObservation> = [350.0, 10.0, 350.0, 10.0, 350.0, 10.0]
            .iter()
            .enumerate()
            .map(|(i, &wd)| {
                RawObservation::new(16, at(10, 10 * i as u32))
                    .with(Channel::Ws, 10.0)
                    .with(Channel::Wd, wd)
            })
            .collect();

        let result = aggregate_station(16, obs, &ChannelSet::all_raw(), &config()).unwrap();
        let row = &result.rows[0];
        let u = row.get(Channel::UVec).unwrap();
        let v = row.get(Channel::VVec).unwrap();
        assert!(u.abs() <= 0.1, "u = {}", u);
        assert!(v < -9.0, "v = {}", v);
        assert_eq!(row.get(Channel::Wd), None);
    }

    #[test]
    fn test_opposing_winds_cancel() {
        let obs: Vec<RawObservation> = [0.0, 0.0, 0.0, 180.0, 180.0, 180.0]
            .iter()
            .enumerate()
            .map(|(i, &wd)| {
                RawObservation::new(16, at(3, 10 * i as u32))
                    .with(Channel::Ws, 10.0)
                    .with(Channel::Wd, wd)
            })
            .collect();

        let result = aggregate_station(16, obs, &ChannelSet::all_raw(), &config()).unwrap();
        let row = &result.rows[0];
        assert!(row.get(Channel::UVec).unwrap().abs() < 0.01);
        assert!(row.get(Channel::VVec).unwrap().abs() < 0.01);
        assert_eq!(row.get(Channel::Ws), Some(10.0));
    }

    #[test]
    fn test_short_gap_interpolated() {
        let obs = vec![
            RawObservation::new(16, at(0, 30)).with(Channel::Td, 10.0),
            RawObservation::new(16, at(3, 30)).with(Channel::Td, 16.0),
        ];
        let result = aggregate_station(16, obs, &ChannelSet::all_raw(), &config()).unwrap();
        let td: Vec<Option<f64>> = result.rows.iter().map(|r| r.get(Channel::Td)).collect();
        assert_eq!(td, vec![Some(10.0), Some(12.0), Some(14.0), Some(16.0)]);
        assert!(result.rows[1].is_gap());
        assert!(result.rows[2].is_gap());
    }

    #[test]
    fn test_long_gap_left_missing() {
        let obs = vec![
            RawObservation::new(16, at(0, 0)).with(Channel::Td, 10.0),
            RawObservation::new(16, at(4, 0)).with(Channel::Td, 18.0),
        ];
        let result = aggregate_station(16, obs, &ChannelSet::all_raw(), &config()).unwrap();
        assert_eq!(result.rows.len(), 5);
        for row in &result.rows[1..4] {
            assert!(row.is_gap());
            assert_eq!(row.get(Channel::Td), None);
            assert_eq!(row.station_id, 16);
        }
    }

    #[test]
    fn test_rows_carry_first_known_location() {
        let obs = vec![
            RawObservation::new(13, at(2, 0)).with(Channel::Td, 1.0),
            RawObservation::new(13, at(1, 0))
                .with(Channel::Td, 1.0)
                .with_location(32.6, 35.4),
            RawObservation::new(13, at(5, 0))
                .with(Channel::Td, 1.0)
                .with_location(32.7, 35.5),
        ];
        let result = aggregate_station(13, obs, &ChannelSet::all_raw(), &config()).unwrap();
        assert!(result.warnings.is_empty());
        assert_eq!(result.rows.len(), 5);
        for row in &result.rows {
            assert_eq!((row.latitude, row.longitude), (32.6, 35.4));
        }
    }

    #[test]
    fn test_missing_location_warns_and_defaults() {
        let obs = vec![RawObservation::new(500, at(1, 0)).with(Channel::Td, 1.0)];
        let result = aggregate_station(500, obs, &ChannelSet::all_raw(), &config()).unwrap();
        assert_eq!(
            result.warnings,
            vec![AggregationWarning::MissingLocation { station_id: 500 }]
        );
        assert_eq!((result.rows[0].latitude, result.rows[0].longitude), (0.0, 0.0));
    }

    // Rain sum over a bucket with samples but no valid rain is an open
    // question; both policies are pinned here.
    #[test]
    fn test_rain_sum_policy_for_rainless_bucket() {
        let obs = vec![
            RawObservation::new(16, at(1, 0)).with(Channel::Td, 12.0),
            RawObservation::new(16, at(1, 10)).with(Channel::Td, 12.5),
        ];

        let missing = aggregate_station(16, obs.clone(), &ChannelSet::all_raw(), &config()).unwrap();
        assert_eq!(missing.rows[0].get(Channel::Rain), None);
        assert_eq!(missing.rows[0].get(Channel::RainIntensityMax), None);

        let zero_config = AggregationConfig {
            rain_sum_policy: RainSumPolicy::Zero,
            ..AggregationConfig::default()
        };
        let zero = aggregate_station(16, obs, &ChannelSet::all_raw(), &zero_config).unwrap();
        assert_eq!(zero.rows[0].get(Channel::Rain), Some(0.0));
        assert_eq!(zero.rows[0].get(Channel::RainIntensityMax), None);
    }

    #[test]
    fn test_schema_without_direction_has_no_vectors() {
        let channels = ChannelSet::from_columns(["ws", "td"]);
        let obs = vec![RawObservation::new(16, at(1, 0))
            .with(Channel::Ws, 4.0)
            .with(Channel::Wd, 90.0)
            .with(Channel::Td, 20.0)];
        let result = aggregate_station(16, obs, &channels, &config()).unwrap();
        let row = &result.rows[0];
        assert_eq!(row.get(Channel::Ws), Some(4.0));
        assert_eq!(row.get(Channel::UVec), None);
        assert_eq!(row.get(Channel::Rain), None);
    }

    #[test]
    fn test_span_limit_is_an_error() {
        let obs = vec![
            RawObservation::new(16, at(0, 0)).with(Channel::Td, 1.0),
            RawObservation::new(16, at(23, 0)).with(Channel::Td, 1.0),
        ];
        let tight = AggregationConfig {
            max_span_hours: 10,
            ..AggregationConfig::default()
        };
        let err = aggregate_station(16, obs, &ChannelSet::all_raw(), &tight).unwrap_err();
        assert!(matches!(err, AppError::Aggregation { station_id: 16, .. }));
    }

    #[test]
    fn test_stray_station_is_an_error() {
        let obs = vec![RawObservation::new(43, at(0, 0))];
        assert!(aggregate_station(16, obs, &ChannelSet::all_raw(), &config()).is_err());
    }

    #[test]
    fn test_empty_station_yields_no_rows() {
        let result = aggregate_station(16, Vec::new(), &ChannelSet::all_raw(), &config()).unwrap();
        assert!(result.rows.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_aggregate_stations_orders_by_station() {
        let obs = vec![
            RawObservation::new(186, at(1, 0)).with(Channel::Td, 3.0).with_location(32.7, 35.2),
            RawObservation::new(13, at(1, 0)).with(Channel::Td, 5.0).with_location(32.7, 35.4),
            RawObservation::new(186, at(2, 0)).with(Channel::Td, 4.0),
        ];
        let output =
            aggregate_stations(group_by_station(obs), &ChannelSet::all_raw(), &config()).unwrap();
        assert_eq!(output.stations, 2);
        let keys: Vec<(i32, DateTime<Utc>)> =
            output.rows.iter().map(|r| (r.station_id, r.timestamp)).collect();
        assert_eq!(keys, vec![(13, at(1, 0)), (186, at(1, 0)), (186, at(2, 0))]);
    }
}
