//! Physical plausibility checks over raw or hourly rows.

use crate::channel::{Channel, ChannelValues};
use crate::db::models::{HourlyAggregate, RawObservation};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

pub const MIN_VALID_TEMP: f64 = -10.0;
pub const MAX_VALID_TEMP: f64 = 50.0;

/// Temperature channels bounded by [`MIN_VALID_TEMP`] and [`MAX_VALID_TEMP`].
const TEMPERATURE_CHANNELS: [Channel; 3] = [Channel::Td, Channel::TdMax, Channel::TdMin];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ViolationType {
    NegativeRain,
    TemperatureOutOfRange,
    CurrentAboveMax,
    CurrentBelowMin,
    InvertedRange,
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViolationType::NegativeRain => "negative rain",
            ViolationType::TemperatureOutOfRange => "temperature out of range",
            ViolationType::CurrentAboveMax => "td above tdmax",
            ViolationType::CurrentBelowMin => "td below tdmin",
            ViolationType::InvertedRange => "tdmax below tdmin",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub station_id: i32,
    pub timestamp: DateTime<Utc>,
    pub violation_type: ViolationType,
    pub details: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "station {} at {}: {} ({})",
            self.station_id, self.timestamp, self.violation_type, self.details
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub total_records: usize,
    pub valid_records: usize,
    pub violations: Vec<Violation>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn counts_by_type(&self) -> BTreeMap<ViolationType, usize> {
        let mut counts = BTreeMap::new();
        for v in &self.violations {
            *counts.entry(v.violation_type).or_insert(0) += 1;
        }
        counts
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "Integrity: {}/{} records passed, {} violations",
            self.valid_records,
            self.total_records,
            self.violations.len()
        );
        for (kind, count) in self.counts_by_type() {
            out.push_str(&format!("\n  {}: {}", kind, count));
        }
        out
    }
}

pub struct IntegrityChecker {
    min_temp: f64,
    max_temp: f64,
}

impl Default for IntegrityChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl IntegrityChecker {
    pub fn new() -> Self {
        Self {
            min_temp: MIN_VALID_TEMP,
            max_temp: MAX_VALID_TEMP,
        }
    }

    pub fn check_hourly(&self, rows: &[HourlyAggregate]) -> IntegrityReport {
        self.check(
            rows.iter()
                .map(|r| (r.station_id, r.timestamp, &r.values)),
        )
    }

    pub fn check_raw(&self, rows: &[RawObservation]) -> IntegrityReport {
        self.check(
            rows.iter()
                .map(|r| (r.station_id, r.timestamp, &r.values)),
        )
    }

    fn check<'a, I>(&self, rows: I) -> IntegrityReport
    where
        I: Iterator<Item = (i32, DateTime<Utc>, &'a ChannelValues)>,
    {
        let mut report = IntegrityReport::default();
        for (station_id, timestamp, values) in rows {
            report.total_records += 1;
            let before = report.violations.len();
            let mut flag = |violation_type: ViolationType, details: String| {
                report.violations.push(Violation {
                    station_id,
                    timestamp,
                    violation_type,
                    details,
                })
            };

            if let Some(rain) = values.get(Channel::Rain) {
                if rain < 0.0 {
                    flag(ViolationType::NegativeRain, format!("rain = {}", rain));
                }
            }

            for channel in TEMPERATURE_CHANNELS {
                if let Some(t) = values.get(channel) {
                    if t < self.min_temp || t > self.max_temp {
                        flag(
                            ViolationType::TemperatureOutOfRange,
                            format!(
                                "{} = {} outside [{}, {}]",
                                channel, t, self.min_temp, self.max_temp
                            ),
                        );
                    }
                }
            }

            let td = values.get(Channel::Td);
            let tdmax = values.get(Channel::TdMax);
            let tdmin = values.get(Channel::TdMin);

            if let (Some(td), Some(max)) = (td, tdmax) {
                if td > max {
                    flag(
                        ViolationType::CurrentAboveMax,
                        format!("td = {} > tdmax = {}", td, max),
                    );
                }
            }
            if let (Some(td), Some(min)) = (td, tdmin) {
                if td < min {
                    flag(
                        ViolationType::CurrentBelowMin,
                        format!("td = {} < tdmin = {}", td, min),
                    );
                }
            }
            if let (Some(max), Some(min)) = (tdmax, tdmin) {
                if max < min {
                    flag(
                        ViolationType::InvertedRange,
                        format!("tdmax = {} < tdmin = {}", max, min),
                    );
                }
            }

            if report.violations.len() == before {
                report.valid_records += 1;
            }
        }
        report
    }
}
