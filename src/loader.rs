//! Loader for station exports.
//!
//! Two layouts are understood:
//! - API exports written by the fetcher (`.csv`), with a single offset-aware
//!   `timestamp` column and a `station_id` column.
//! - Legacy spreadsheet exports (`.xlsx`, or the same sheet saved as `.csv`)
//!   with preamble rows, an optional units row, split `date`/`time` columns
//!   in local standard time and no station column. The station is taken
//!   from the file name.

use crate::channel::{Channel, ChannelSet};
use crate::config::LoaderConfig;
use crate::db::models::RawObservation;
use crate::error::{AppError, Result};
use crate::store::ObservationStore;
use calamine::{open_workbook_auto, Data, Reader};
use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};
use csv::StringRecord;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const MISSING_MARKERS: [&str; 3] = ["", "-", "nodata"];
const UNIT_KEYWORDS: [&str; 5] = ["mm", "deg", "m/sec", "degc", "hpa"];
const DATE_FORMATS: [&str; 4] = ["%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y-%m-%d"];
const SHORT_YEAR_DATE_FORMATS: [&str; 3] = ["%d/%m/%y", "%d-%m-%y", "%d.%m.%y"];
const EXPORT_EXTENSIONS: [&str; 2] = ["csv", "xlsx"];
const TIME_FORMATS: [&str; 2] = ["%H:%M", "%H:%M:%S"];
const NAIVE_TIMESTAMP_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

#[derive(Debug, Clone, Default)]
pub struct ParseStats {
    pub total_rows: usize,
    pub parsed_successfully: usize,
    pub parse_failures: usize,
    pub empty_rows: usize,
    pub units_row_dropped: bool,
    pub failure_rate: f64,
}

impl ParseStats {
    pub fn finalize(&mut self) {
        let non_empty = self.total_rows - self.empty_rows;
        self.failure_rate = if non_empty > 0 {
            self.parse_failures as f64 / non_empty as f64
        } else {
            0.0
        };
    }

    pub fn exceeds_threshold(&self, threshold: f64) -> bool {
        self.failure_rate > threshold
    }
}

#[derive(Debug, Clone)]
pub struct LoadedFile {
    pub observations: Vec<RawObservation>,
    /// Channel columns found in the file header.
    pub channels: ChannelSet,
    pub stats: ParseStats,
}

#[derive(Debug, Clone, Default)]
pub struct IngestSummary {
    pub files_found: usize,
    pub files_loaded: usize,
    pub files_failed: usize,
    pub rows_inserted: usize,
    pub rows_skipped: usize,
}

enum StationSource {
    Column(usize),
    Fixed(i32),
}

enum TimeLayout {
    Timestamp(usize),
    DateTime { date: usize, time: usize },
}

struct Layout {
    time: TimeLayout,
    station: StationSource,
    latitude: Option<usize>,
    longitude: Option<usize>,
    channels: Vec<(Channel, usize)>,
}

pub struct Loader {
    station_names: BTreeMap<i32, String>,
    local_offset: FixedOffset,
    max_failure_rate: f64,
    separator: regex_lite::Regex,
}

impl Loader {
    pub fn new(config: &LoaderConfig, station_names: &BTreeMap<i32, String>) -> Result<Self> {
        let local_offset = FixedOffset::east_opt(config.source_utc_offset_hours * 3600)
            .ok_or_else(|| {
                AppError::Config(format!(
                    "Invalid UTC offset: {} hours",
                    config.source_utc_offset_hours
                ))
            })?;
        let separator = regex_lite::Regex::new(r"[\s()]+")
            .map_err(|e| AppError::Config(format!("Invalid column pattern: {}", e)))?;

        Ok(Self {
            station_names: station_names.clone(),
            local_offset,
            max_failure_rate: config.max_failure_rate,
            separator,
        })
    }

    /// All `*.csv` and `*.xlsx` files in `dir`, sorted by path.
    ///
    /// Office lock files (`~$name.xlsx`) are skipped.
    pub fn discover_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for extension in EXPORT_EXTENSIONS {
            let pattern = dir.join(format!("*.{}", extension));
            let pattern = pattern
                .to_str()
                .ok_or_else(|| AppError::InvalidData(format!("Non UTF-8 path: {:?}", dir)))?;

            files.extend(
                glob::glob(pattern)
                    .map_err(|e| {
                        AppError::Config(format!("Invalid glob pattern '{}': {}", pattern, e))
                    })?
                    .filter_map(|entry| match entry {
                        Ok(path) => Some(path),
                        Err(e) => {
                            warn!("Skipping unreadable path: {}", e);
                            None
                        }
                    }),
            );
        }
        files.retain(|p| {
            !p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("~$"))
        });
        files.sort();
        Ok(files)
    }

    pub fn load_file(&self, path: &Path) -> Result<LoadedFile> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();

        let is_xlsx = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("xlsx"));

        if is_xlsx {
            let records = read_workbook(path)?;
            return self.parse_records(&records, stem);
        }

        let bytes = std::fs::read(path)?;
        let content = decode(&bytes);
        self.parse_content(&content, stem)
    }

    /// Parse one CSV export. `file_stem` names the station for legacy layouts.
    pub fn parse_content(&self, content: &str, file_stem: &str) -> Result<LoadedFile> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());

        let records: Vec<StringRecord> = reader.records().collect::<std::result::Result<_, _>>()?;
        self.parse_records(&records, file_stem)
    }

    /// Parse the rows of one export, preamble included.
    pub fn parse_records(&self, records: &[StringRecord], file_stem: &str) -> Result<LoadedFile> {
        let (header_idx, columns) = records
            .iter()
            .enumerate()
            .find_map(|(i, record)| {
                let columns: Vec<String> = record.iter().map(|c| self.normalize_column(c)).collect();
                is_header(&columns).then_some((i, columns))
            })
            .ok_or_else(|| {
                AppError::Parse(format!(
                    "No header row with 'timestamp' or 'date'/'time' columns in '{}'",
                    file_stem
                ))
            })?;

        let layout = self.layout(&columns, file_stem)?;
        let channels: ChannelSet = layout.channels.iter().map(|(c, _)| *c).collect();

        let mut data = &records[header_idx + 1..];
        let mut stats = ParseStats::default();

        if let Some(first) = data.first() {
            if is_units_row(first) {
                debug!("Detected units row in '{}', dropping it", file_stem);
                stats.units_row_dropped = true;
                data = &data[1..];
            }
        }

        let mut observations = Vec::with_capacity(data.len());
        for (row_num, record) in data.iter().enumerate() {
            stats.total_rows += 1;

            if record.iter().all(str::is_empty) {
                stats.empty_rows += 1;
                continue;
            }

            match self.parse_record(record, &layout) {
                Ok(obs) => {
                    observations.push(obs);
                    stats.parsed_successfully += 1;
                }
                Err(e) => {
                    stats.parse_failures += 1;
                    debug!("Dropping row {} of '{}': {}", row_num + 1, file_stem, e);
                }
            }
        }

        stats.finalize();

        if stats.parse_failures > 0 {
            warn!(
                "Dropped {} of {} rows in '{}' due to invalid timestamps or station ids",
                stats.parse_failures,
                stats.total_rows - stats.empty_rows,
                file_stem
            );
        }

        if stats.exceeds_threshold(self.max_failure_rate) {
            return Err(AppError::Parse(format!(
                "Parse failure rate {:.1}% exceeds threshold {:.1}%: {} failures out of {} non-empty rows",
                stats.failure_rate * 100.0,
                self.max_failure_rate * 100.0,
                stats.parse_failures,
                stats.total_rows - stats.empty_rows
            )));
        }

        Ok(LoadedFile {
            observations,
            channels,
            stats,
        })
    }

    /// Load every export in `dir` into the store.
    ///
    /// A file that cannot be read or parsed is logged and skipped.
    pub async fn ingest_directory<S: ObservationStore>(
        &self,
        store: &S,
        dir: &Path,
    ) -> Result<IngestSummary> {
        let files = Self::discover_files(dir)?;
        let mut summary = IngestSummary {
            files_found: files.len(),
            ..IngestSummary::default()
        };

        if files.is_empty() {
            warn!("No CSV files found in {}", dir.display());
            return Ok(summary);
        }

        info!("Found {} files to process", files.len());

        for path in files {
            info!("Processing: {}", path.display());

            let loaded = match self.load_file(&path) {
                Ok(loaded) => loaded,
                Err(e) => {
                    error!("Error processing {}: {}", path.display(), e);
                    summary.files_failed += 1;
                    continue;
                }
            };

            match store.insert_raw(&loaded.observations).await {
                Ok(result) => {
                    info!(
                        "Loaded {}: {} rows inserted, {} duplicates skipped",
                        path.display(),
                        result.inserted,
                        result.skipped_duplicates
                    );
                    summary.files_loaded += 1;
                    summary.rows_inserted += result.inserted;
                    summary.rows_skipped += result.skipped_duplicates;
                }
                Err(e) => {
                    error!("Error storing rows from {}: {}", path.display(), e);
                    summary.files_failed += 1;
                }
            }
        }

        info!(
            "Ingestion finished: {}/{} files loaded, {} rows inserted, {} duplicates skipped",
            summary.files_loaded, summary.files_found, summary.rows_inserted, summary.rows_skipped
        );
        Ok(summary)
    }

    /// Lowercase, collapse whitespace and parentheses into `_`.
    pub fn normalize_column(&self, raw: &str) -> String {
        let lowered = raw.trim().trim_start_matches('\u{feff}').to_lowercase();
        self.separator
            .replace_all(&lowered, "_")
            .trim_matches('_')
            .to_string()
    }

    fn layout(&self, columns: &[String], file_stem: &str) -> Result<Layout> {
        let position = |name: &str| columns.iter().position(|c| c == name);

        let time = match (position("timestamp"), position("date"), position("time")) {
            (Some(ts), _, _) => TimeLayout::Timestamp(ts),
            (None, Some(date), Some(time)) => TimeLayout::DateTime { date, time },
            _ => {
                return Err(AppError::Parse(
                    "Missing timestamp or date/time columns".to_string(),
                ))
            }
        };

        let station = match position("station_id") {
            Some(idx) => StationSource::Column(idx),
            None => {
                let id = self.station_for_file(file_stem).ok_or_else(|| {
                    AppError::InvalidData(format!(
                        "Could not determine station id for '{}'",
                        file_stem
                    ))
                })?;
                info!("Mapped '{}' to station {}", file_stem, id);
                StationSource::Fixed(id)
            }
        };

        let mut channels = Vec::new();
        let mut ignored = Vec::new();
        for (idx, column) in columns.iter().enumerate() {
            match Channel::from_raw_column(column) {
                Some(channel) if !channels.iter().any(|(c, _)| *c == channel) => {
                    channels.push((channel, idx))
                }
                Some(_) => {}
                None => ignored.push(column.as_str()),
            }
        }
        if !ignored.is_empty() {
            debug!("Ignoring columns in '{}': {:?}", file_stem, ignored);
        }

        Ok(Layout {
            time,
            station,
            latitude: position("latitude"),
            longitude: position("longitude"),
            channels,
        })
    }

    /// Station id whose configured name prefixes the file name.
    pub fn station_for_file(&self, file_stem: &str) -> Option<i32> {
        self.station_names
            .iter()
            .find(|(_, name)| file_stem.starts_with(name.as_str()))
            .map(|(id, _)| *id)
    }

    fn parse_record(&self, record: &StringRecord, layout: &Layout) -> Result<RawObservation> {
        let cell = |idx: usize| record.get(idx).unwrap_or_default();

        let timestamp = match layout.time {
            TimeLayout::Timestamp(idx) => parse_timestamp(cell(idx))?,
            TimeLayout::DateTime { date, time } => {
                parse_local_date_time(cell(date), cell(time), self.local_offset)?
            }
        };

        let station_id = match layout.station {
            StationSource::Fixed(id) => id,
            StationSource::Column(idx) => parse_station_id(cell(idx))?,
        };

        let mut obs = RawObservation::new(station_id, timestamp);
        obs.latitude = layout.latitude.and_then(|idx| parse_numeric(cell(idx)));
        obs.longitude = layout.longitude.and_then(|idx| parse_numeric(cell(idx)));
        for &(channel, idx) in &layout.channels {
            obs.values.set(channel, parse_numeric(cell(idx)));
        }
        Ok(obs)
    }
}

fn decode(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.trim_start_matches('\u{feff}').to_string(),
        Err(_) => {
            debug!("Input is not UTF-8, decoding as ISO-8859-8");
            let (decoded, _, _) = encoding_rs::ISO_8859_8.decode(bytes);
            decoded.into_owned()
        }
    }
}

fn is_header(columns: &[String]) -> bool {
    let has = |name: &str| columns.iter().any(|c| c == name);
    has("timestamp") || (has("date") && has("time"))
}

fn is_units_row(record: &StringRecord) -> bool {
    record.iter().any(|cell| {
        let cell = cell.to_lowercase();
        UNIT_KEYWORDS.iter().any(|k| cell.contains(k))
    })
}

/// Numeric cell; missing markers and anything non-numeric become `None`.
pub fn parse_numeric(cell: &str) -> Option<f64> {
    let cell = cell.trim();
    if MISSING_MARKERS.contains(&cell.to_lowercase().as_str()) {
        return None;
    }
    cell.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_station_id(cell: &str) -> Result<i32> {
    let value = parse_numeric(cell)
        .ok_or_else(|| AppError::Parse(format!("Invalid station id '{}'", cell)))?;
    if value.fract() != 0.0 || value < i32::MIN as f64 || value > i32::MAX as f64 {
        return Err(AppError::Parse(format!("Invalid station id '{}'", cell)));
    }
    Ok(value as i32)
}

/// Offset-aware timestamps are converted to UTC; naive ones are taken as UTC.
pub fn parse_timestamp(cell: &str) -> Result<DateTime<Utc>> {
    let cell = cell.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(cell) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(cell, "%Y-%m-%d %H:%M:%S%:z") {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(cell, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    Err(AppError::Parse(format!("Invalid timestamp '{}'", cell)))
}

/// `%Y` happily reads `20` as year 20, so four-digit forms only count when
/// they yield a four-digit year; two-digit years go through `%y`.
fn parse_day_first_date(text: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .filter_map(|f| NaiveDate::parse_from_str(text, f).ok())
        .find(|d| d.year() >= 1000)
        .or_else(|| {
            SHORT_YEAR_DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(text, f).ok())
        })
}

/// Rows of the first worksheet, as trimmed text cells.
fn read_workbook(path: &Path) -> Result<Vec<StringRecord>> {
    let mut workbook = open_workbook_auto(path)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| AppError::Parse(format!("Workbook {} has no sheets", path.display())))??;

    Ok(range
        .rows()
        .map(|row| row.iter().map(cell_text).collect::<StringRecord>())
        .collect())
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.trim().to_string(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        // Serial values below 1.0 are time-of-day cells.
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(ndt) if dt.as_f64() < 1.0 => ndt.format("%H:%M:%S").to_string(),
            Some(ndt) => ndt.format("%d/%m/%Y %H:%M:%S").to_string(),
            None => dt.as_f64().to_string(),
        },
        Data::Error(_) | Data::Empty => String::new(),
    }
}

/// Day-first local date and time in a fixed offset, converted to UTC.
///
/// `24:00` is midnight at the end of the day, i.e. 00:00 of the next day.
pub fn parse_local_date_time(
    date_cell: &str,
    time_cell: &str,
    offset: FixedOffset,
) -> Result<DateTime<Utc>> {
    // Spreadsheet dates sometimes carry a midnight time part.
    let date_part = date_cell.split_whitespace().next().unwrap_or_default();
    let date = parse_day_first_date(date_part)
        .ok_or_else(|| AppError::Parse(format!("Invalid date '{}'", date_cell)))?;

    let time_cell = time_cell.trim();
    let (time_text, next_day) = if time_cell.starts_with("24:00") {
        ("00:00", true)
    } else {
        (time_cell, false)
    };

    let time = TIME_FORMATS
        .iter()
        .find_map(|f| NaiveTime::parse_from_str(time_text, f).ok())
        .ok_or_else(|| AppError::Parse(format!("Invalid time '{}'", time_cell)))?;

    let mut local = NaiveDateTime::new(date, time);
    if next_day {
        local += Duration::days(1);
    }

    offset
        .from_local_datetime(&local)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| AppError::Parse(format!("Ambiguous local time {}", local)))
}
