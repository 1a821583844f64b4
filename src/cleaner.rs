//! The clean run: raw table in, hourly table out.

use crate::aggregator::{aggregate_stations, AggregationWarning, StationBatch};
use crate::channel::Channel;
use crate::config::AggregationConfig;
use crate::error::{AppError, Result};
use crate::store::ObservationStore;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct CleanSummary {
    pub stations: usize,
    pub raw_rows: usize,
    pub hourly_rows: usize,
    pub warnings: Vec<AggregationWarning>,
}

/// Rebuild the clean table from every raw observation in `store`.
///
/// Any aggregation error aborts before the clean table is touched.
pub async fn run_aggregation<S: ObservationStore>(
    store: &S,
    config: &AggregationConfig,
) -> Result<CleanSummary> {
    let channels = store.raw_channels().await?;
    let missing: Vec<_> = Channel::RAW
        .into_iter()
        .filter(|c| !channels.contains(*c))
        .collect();
    if !missing.is_empty() {
        warn!("Raw table lacks channel columns {:?}; they are omitted from the clean table", missing);
    }

    let station_ids = store.station_ids().await?;
    info!("Aggregating {} stations", station_ids.len());

    let mut batches = Vec::with_capacity(station_ids.len());
    let mut raw_rows = 0;
    for station_id in station_ids {
        let observations = store.raw_for_station(station_id, &channels).await?;
        debug!("Station {}: {} raw rows", station_id, observations.len());
        raw_rows += observations.len();
        batches.push(StationBatch {
            station_id,
            observations,
        });
    }

    // CPU-bound; keep it off the async worker threads.
    let aggregation_config = config.clone();
    let output = tokio::task::spawn_blocking(move || {
        aggregate_stations(batches, &channels, &aggregation_config)
    })
    .await
    .map_err(|e| AppError::InvalidData(format!("Aggregation task failed: {}", e)))??;

    let written = store.replace_clean(&output.rows, &output.channels).await?;
    info!(
        "Clean run complete: {} raw rows from {} stations -> {} hourly rows ({} warnings)",
        raw_rows,
        output.stations,
        written,
        output.warnings.len()
    );

    Ok(CleanSummary {
        stations: output.stations,
        raw_rows,
        hourly_rows: written,
        warnings: output.warnings,
    })
}
