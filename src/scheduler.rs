use crate::cleaner::{run_aggregation, CleanSummary};
use crate::config::Config;
use crate::error::Result;
use crate::export::{export_path, ExportWriter};
use crate::fetcher::{flatten_observation, Fetcher};
use crate::loader::{IngestSummary, Loader};
use crate::store::ObservationStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct FetchSummary {
    pub stations: usize,
    pub files_written: Vec<PathBuf>,
    pub rows_written: usize,
}

pub struct Scheduler<S> {
    config: Config,
    store: Arc<S>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: ObservationStore> Scheduler<S> {
    pub fn new(config: Config, store: Arc<S>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            config,
            store,
            shutdown_rx,
        }
    }

    /// Run the full pipeline once, then again on every interval tick until
    /// shutdown is signalled.
    pub async fn run(&mut self) -> Result<()> {
        let initial_delay = Duration::from_secs(self.config.scheduler.initial_delay_seconds);
        let poll_interval = Duration::from_secs(self.config.scheduler.interval_minutes * 60);

        info!(
            "Scheduler starting with {}s initial delay, {}m interval",
            self.config.scheduler.initial_delay_seconds, self.config.scheduler.interval_minutes
        );

        tokio::select! {
            _ = tokio::time::sleep(initial_delay) => {},
            _ = self.shutdown_rx.changed() => {
                info!("Shutdown received during initial delay");
                return Ok(());
            }
        }

        if let Err(e) = self.run_once().await {
            error!("Pipeline error: {}", e);
        }

        let mut ticker = interval(poll_interval);
        ticker.tick().await; // First tick is immediate, skip it

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("Pipeline error: {}", e);
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Fetch, ingest and clean in sequence.
    pub async fn run_once(&self) -> Result<CleanSummary> {
        info!("Starting pipeline run");
        self.run_fetch().await?;
        self.run_ingest().await?;
        let summary = self.run_clean().await?;
        info!("Pipeline run completed");
        Ok(summary)
    }

    /// Download every configured station and year into per-station CSV files.
    pub async fn run_fetch(&self) -> Result<FetchSummary> {
        let fetcher = Fetcher::from_config(&self.config.source)?;
        fetch_exports(&fetcher, &self.config).await
    }

    pub async fn run_ingest(&self) -> Result<IngestSummary> {
        let loader = Loader::new(&self.config.loader, &self.config.source.stations)?;
        loader
            .ingest_directory(self.store.as_ref(), &self.config.loader.data_dir)
            .await
    }

    pub async fn run_clean(&self) -> Result<CleanSummary> {
        run_aggregation(self.store.as_ref(), &self.config.aggregation).await
    }
}

/// Write one export per configured station covering every configured year.
///
/// A station-year without data is skipped; the export is still written with
/// whatever the other years returned.
pub async fn fetch_exports(fetcher: &Fetcher, config: &Config) -> Result<FetchSummary> {
    let source = &config.source;
    std::fs::create_dir_all(&source.output_dir)?;

    let locations = match fetcher.fetch_locations().await {
        Ok(map) => map,
        Err(e) => {
            warn!("Could not fetch station locations, exporting without coordinates: {}", e);
            Default::default()
        }
    };

    let year_delay = Duration::from_millis(source.year_delay_ms);
    let mut summary = FetchSummary::default();

    for (&station_id, name) in &source.stations {
        info!("Processing station {} ({})", station_id, name);

        let location = locations.get(&station_id);
        if location.is_none_or(|l| l.latitude.is_none() || l.longitude.is_none()) {
            warn!("No coordinates for station {} ({})", station_id, name);
        }

        let path = export_path(&source.output_dir, name, source.start_year, source.end_year);
        let mut writer = ExportWriter::create(&path)?;

        for year in source.years() {
            match fetcher.fetch_station_year(station_id, year).await {
                Ok(Some(response)) => {
                    let rows: Vec<_> = response
                        .data
                        .iter()
                        .map(|obs| flatten_observation(obs, station_id, location))
                        .collect();
                    info!("Station {} year {}: {} observations", station_id, year, rows.len());
                    writer.write_rows(&rows)?;
                }
                Ok(None) => {}
                Err(e) => error!("Error fetching station {} year {}: {}", station_id, year, e),
            }

            if !year_delay.is_zero() {
                tokio::time::sleep(year_delay).await;
            }
        }

        let rows = writer.finish()?;
        if rows == 0 {
            warn!("No data collected for station {} ({})", station_id, name);
        } else {
            info!("Saved {} rows to {}", rows, path.display());
        }
        summary.rows_written += rows;
        summary.files_written.push(path);
        summary.stations += 1;
    }

    Ok(summary)
}
