//! CSV exports written by the fetcher and read back by the loader.

use crate::channel::{Channel, ChannelValues};
use crate::error::Result;
use std::path::{Path, PathBuf};

pub const CSV_HEADERS: [&str; 16] = [
    "timestamp",
    "station_id",
    "latitude",
    "longitude",
    "rain",
    "wsmax",
    "wdmax",
    "ws",
    "wd",
    "stdwd",
    "td",
    "rh",
    "tdmax",
    "tdmin",
    "ws1mm",
    "ws10mm",
];

/// A flattened API observation. The timestamp is kept exactly as the API
/// sent it; the loader normalizes it to UTC.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRow {
    pub timestamp: String,
    pub station_id: i32,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub values: ChannelValues,
}

impl ExportRow {
    pub fn new(timestamp: String, station_id: i32) -> Self {
        Self {
            timestamp,
            station_id,
            latitude: None,
            longitude: None,
            values: ChannelValues::default(),
        }
    }

    fn record(&self) -> Vec<String> {
        let mut record = Vec::with_capacity(CSV_HEADERS.len());
        record.push(self.timestamp.clone());
        record.push(self.station_id.to_string());
        record.push(fmt_opt(self.latitude));
        record.push(fmt_opt(self.longitude));
        for channel in Channel::RAW {
            record.push(fmt_opt(self.values.get(channel)));
        }
        record
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// `{dir}/{station_name}_{start_year}-{end_year}.csv`
pub fn export_path(dir: &Path, station_name: &str, start_year: i32, end_year: i32) -> PathBuf {
    dir.join(format!("{}_{}-{}.csv", station_name, start_year, end_year))
}

/// Streaming CSV writer for one station export.
pub struct ExportWriter {
    writer: csv::Writer<std::fs::File>,
    rows: usize,
}

impl ExportWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(CSV_HEADERS)?;
        Ok(Self { writer, rows: 0 })
    }

    pub fn write_rows(&mut self, rows: &[ExportRow]) -> Result<()> {
        for row in rows {
            self.writer.write_record(row.record())?;
        }
        self.rows += rows.len();
        Ok(())
    }

    /// Flush and return the number of data rows written.
    pub fn finish(mut self) -> Result<usize> {
        self.writer.flush()?;
        Ok(self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_follow_raw_channel_order() {
        for (i, channel) in Channel::RAW.iter().enumerate() {
            assert_eq!(CSV_HEADERS[i + 4], channel.column());
        }
    }

    #[test]
    fn test_export_path() {
        let path = export_path(Path::new("/tmp/out"), "Newe_Yaar", 2020, 2025);
        assert_eq!(path, PathBuf::from("/tmp/out/Newe_Yaar_2020-2025.csv"));
    }

    #[test]
    fn test_write_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let mut row = ExportRow::new("2024-03-01T00:10:00+02:00".to_string(), 16);
        row.values.set(Channel::Rain, Some(0.5));
        row.latitude = Some(32.5);

        let mut writer = ExportWriter::create(&path).unwrap();
        writer.write_rows(&[row]).unwrap();
        assert_eq!(writer.finish().unwrap(), 1);

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), CSV_HEADERS.join(","));
        assert_eq!(
            lines.next().unwrap(),
            "2024-03-01T00:10:00+02:00,16,32.5,,0.5,,,,,,,,,,,"
        );
    }
}
