use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use rust_xlsxwriter::Workbook;
use weather_engine::channel::Channel;
use weather_engine::cleaner::run_aggregation;
use weather_engine::config::{AggregationConfig, LoaderConfig};
use weather_engine::loader::Loader;
use weather_engine::store::{MemoryStore, ObservationStore};

const API_EXPORT: &str = "\
timestamp,station_id,latitude,longitude,rain,wsmax,wdmax,ws,wd,stdwd,td,rh,tdmax,tdmin,ws1mm,ws10mm
2024-03-01T00:10:00+02:00,16,32.596,35.277,0.0,5.2,280,3.1,271,12,12.4,81,12.6,12.2,4.0,3.5
2024-03-01T00:20:00+02:00,16,32.596,35.277,0.2,5.0,275,3.3,280,10,12.3,82,12.5,12.1,4.1,3.6
";

const LEGACY_EXPORT: &str = "\
Newe Yaar station report,,,,
Generated by the station portal,,,,
Date,Time,Rain,TD,RH
,,mm,degC,%
31/12/2020,23:50,0.0,9.5,88
31/12/2020,24:00,NoData,9.4,89
";

fn stations() -> BTreeMap<i32, String> {
    let mut stations = BTreeMap::new();
    stations.insert(16, "Afula_Nir_HaEmek".to_string());
    stations.insert(186, "Newe_Yaar".to_string());
    stations
}

fn write(dir: &Path, name: &str, content: &[u8]) {
    std::fs::write(dir.join(name), content).expect("Failed to write fixture");
}

#[tokio::test]
async fn test_ingest_directory_loads_both_layouts() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    write(dir.path(), "Afula_Nir_HaEmek_2020-2025.csv", API_EXPORT.as_bytes());
    write(dir.path(), "Newe_Yaar_2020.csv", LEGACY_EXPORT.as_bytes());
    write(dir.path(), "notes.txt", b"not a csv");

    let loader = Loader::new(&LoaderConfig::default(), &stations()).expect("Loader");
    let store = MemoryStore::new();
    let summary = loader
        .ingest_directory(&store, dir.path())
        .await
        .expect("Ingest failed");

    assert_eq!(summary.files_found, 2);
    assert_eq!(summary.files_loaded, 2);
    assert_eq!(summary.files_failed, 0);
    assert_eq!(summary.rows_inserted, 4);

    assert_eq!(store.station_ids().await.unwrap(), vec![16, 186]);

    let legacy = store
        .raw_for_station(186, &store.raw_channels().await.unwrap())
        .await
        .unwrap();
    assert_eq!(legacy.len(), 2);
    assert_eq!(
        legacy[1].timestamp,
        Utc.with_ymd_and_hms(2020, 12, 31, 22, 0, 0).unwrap()
    );
    assert_eq!(legacy[0].get(Channel::Td), Some(9.5));
    assert_eq!(legacy[0].get(Channel::Rh), Some(88.0));
    assert_eq!(legacy[1].get(Channel::Rain), None);
}

#[tokio::test]
async fn test_reingest_skips_duplicates() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    write(dir.path(), "Afula_Nir_HaEmek_2020-2025.csv", API_EXPORT.as_bytes());

    let loader = Loader::new(&LoaderConfig::default(), &stations()).expect("Loader");
    let store = MemoryStore::new();

    let first = loader.ingest_directory(&store, dir.path()).await.unwrap();
    let second = loader.ingest_directory(&store, dir.path()).await.unwrap();

    assert_eq!(first.rows_inserted, 2);
    assert_eq!(second.rows_inserted, 0);
    assert_eq!(second.rows_skipped, 2);
    assert_eq!(store.raw_len().unwrap(), 2);
}

#[tokio::test]
async fn test_bad_file_does_not_stop_the_run() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    write(dir.path(), "a_unknown_station.csv", b"Date,Time,TD\n01/01/2021,00:10,9.3\n");
    write(dir.path(), "b_garbage.csv", b"x,y\n1,2\n");
    write(dir.path(), "Newe_Yaar_2020.csv", LEGACY_EXPORT.as_bytes());

    let loader = Loader::new(&LoaderConfig::default(), &stations()).expect("Loader");
    let store = MemoryStore::new();
    let summary = loader.ingest_directory(&store, dir.path()).await.unwrap();

    assert_eq!(summary.files_found, 3);
    assert_eq!(summary.files_failed, 2);
    assert_eq!(summary.files_loaded, 1);
    assert_eq!(store.raw_len().unwrap(), 2);
}

#[tokio::test]
async fn test_hebrew_encoded_file_is_decoded() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let mut bytes = b"Station,Date,Time,TD\n".to_vec();
    // "Newe Yaar" in ISO-8859-8
    bytes.extend_from_slice(&[0xF0, 0xE5, 0xE4, b' ', 0xE9, 0xF2, 0xF8]);
    bytes.extend_from_slice(b",01/06/2021,12:00,28.5\n");
    write(dir.path(), "Newe_Yaar_hebrew.csv", &bytes);

    let loader = Loader::new(&LoaderConfig::default(), &stations()).expect("Loader");
    let store = MemoryStore::new();
    let summary = loader.ingest_directory(&store, dir.path()).await.unwrap();

    assert_eq!(summary.files_loaded, 1);
    let rows = store
        .raw_for_station(186, &store.raw_channels().await.unwrap())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].timestamp,
        Utc.with_ymd_and_hms(2021, 6, 1, 10, 0, 0).unwrap()
    );
    assert_eq!(rows[0].get(Channel::Td), Some(28.5));
}

#[tokio::test]
async fn test_two_digit_year_export_aggregates() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    write(
        dir.path(),
        "Newe_Yaar_2020.csv",
        b"Date,Time,Rain,TD\n31/12/20,22:50,0.1,9.6\n31/12/20,23:50,0.0,9.5\n01/01/21,00:50,0.2,9.3\n",
    );

    let loader = Loader::new(&LoaderConfig::default(), &stations()).expect("Loader");
    let store = MemoryStore::new();
    let summary = loader.ingest_directory(&store, dir.path()).await.unwrap();
    assert_eq!(summary.files_loaded, 1);
    assert_eq!(summary.rows_inserted, 3);

    let rows = store
        .raw_for_station(186, &store.raw_channels().await.unwrap())
        .await
        .unwrap();
    assert_eq!(
        rows[1].timestamp,
        Utc.with_ymd_and_hms(2020, 12, 31, 21, 50, 0).unwrap()
    );

    let clean = run_aggregation(&store, &AggregationConfig::default())
        .await
        .expect("Clean failed");
    assert_eq!(clean.hourly_rows, 3);
}

#[tokio::test]
async fn test_xlsx_export_is_loaded() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("Newe_Yaar_2020.xlsx");

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.write_string(0, 0, "Newe Yaar station report").unwrap();
    for (col, name) in ["Date", "Time", "Rain", "TD", "RH"].iter().enumerate() {
        sheet.write_string(2, col as u16, *name).unwrap();
    }
    for (col, unit) in ["mm", "degC", "%"].iter().enumerate() {
        sheet.write_string(3, col as u16 + 2, *unit).unwrap();
    }
    let samples = [("31/12/2020", "23:50", 0.0, 9.5, 88.0), ("31/12/2020", "24:00", 0.2, 9.4, 89.0)];
    for (i, (date, time, rain, td, rh)) in samples.iter().enumerate() {
        let row = 4 + i as u32;
        sheet.write_string(row, 0, *date).unwrap();
        sheet.write_string(row, 1, *time).unwrap();
        sheet.write_number(row, 2, *rain).unwrap();
        sheet.write_number(row, 3, *td).unwrap();
        sheet.write_number(row, 4, *rh).unwrap();
    }
    workbook.save(&path).expect("Failed to save workbook");

    let loader = Loader::new(&LoaderConfig::default(), &stations()).expect("Loader");
    let loaded = loader.load_file(&path).expect("Load failed");
    assert!(loaded.stats.units_row_dropped);
    assert_eq!(loaded.observations.len(), 2);
    assert!(loaded.observations.iter().all(|o| o.station_id == 186));
    assert_eq!(
        loaded.observations[1].timestamp,
        Utc.with_ymd_and_hms(2020, 12, 31, 22, 0, 0).unwrap()
    );
    assert_eq!(loaded.observations[1].get(Channel::Rain), Some(0.2));
    assert_eq!(loaded.observations[0].get(Channel::Rh), Some(88.0));

    let store = MemoryStore::new();
    let summary = loader.ingest_directory(&store, dir.path()).await.unwrap();
    assert_eq!(summary.files_found, 1);
    assert_eq!(summary.rows_inserted, 2);
}

#[test]
fn test_discover_files_is_sorted() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    write(dir.path(), "b.csv", b"");
    write(dir.path(), "a.csv", b"");
    write(dir.path(), "c.txt", b"");
    write(dir.path(), "a.xlsx", b"");
    write(dir.path(), "~$a.xlsx", b"");

    let files = Loader::discover_files(dir.path()).unwrap();
    let names: Vec<_> = files
        .iter()
        .filter_map(|p| p.file_name()?.to_str())
        .collect();
    assert_eq!(names, vec!["a.csv", "a.xlsx", "b.csv"]);
}
