//! Storage capability used by the loader and the aggregation run.
//!
//! The PostgreSQL [`Repository`](crate::db::Repository) is the production
//! implementation. [`MemoryStore`] keeps both tables in process; the
//! `preview` command and the tests run against it.

use crate::channel::ChannelSet;
use crate::db::models::{HourlyAggregate, InsertResult, RawObservation};
use crate::error::{AppError, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

pub trait ObservationStore: Send + Sync {
    /// Raw channel columns that exist in the raw table.
    fn raw_channels(&self) -> impl Future<Output = Result<ChannelSet>> + Send;

    /// Distinct station ids of the raw table, ascending.
    fn station_ids(&self) -> impl Future<Output = Result<Vec<i32>>> + Send;

    /// Every raw observation of one station, ordered by timestamp.
    fn raw_for_station(
        &self,
        station_id: i32,
        channels: &ChannelSet,
    ) -> impl Future<Output = Result<Vec<RawObservation>>> + Send;

    /// Append observations, ignoring (station, timestamp) duplicates.
    fn insert_raw(
        &self,
        observations: &[RawObservation],
    ) -> impl Future<Output = Result<InsertResult>> + Send;

    /// Atomically replace the whole clean table. `channels` are its value columns.
    fn replace_clean(
        &self,
        rows: &[HourlyAggregate],
        channels: &ChannelSet,
    ) -> impl Future<Output = Result<usize>> + Send;
}

#[derive(Debug, Default)]
struct MemoryTables {
    raw: BTreeMap<(i32, chrono::DateTime<chrono::Utc>), RawObservation>,
    clean: Vec<HourlyAggregate>,
    clean_channels: ChannelSet,
}

/// In-process store with the same semantics as the database tables.
#[derive(Debug)]
pub struct MemoryStore {
    raw_channels: ChannelSet,
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_channels(ChannelSet::all_raw())
    }

    /// A store whose raw table only has the given channel columns.
    pub fn with_channels(raw_channels: ChannelSet) -> Self {
        Self {
            raw_channels,
            tables: Mutex::new(MemoryTables::default()),
        }
    }

    pub fn clean_rows(&self) -> Result<Vec<HourlyAggregate>> {
        Ok(self.lock()?.clean.clone())
    }

    pub fn clean_channels(&self) -> Result<ChannelSet> {
        Ok(self.lock()?.clean_channels.clone())
    }

    pub fn raw_len(&self) -> Result<usize> {
        Ok(self.lock()?.raw.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryTables>> {
        self.tables
            .lock()
            .map_err(|_| AppError::InvalidData("memory store lock poisoned".to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservationStore for MemoryStore {
    async fn raw_channels(&self) -> Result<ChannelSet> {
        Ok(self.raw_channels.clone())
    }

    async fn station_ids(&self) -> Result<Vec<i32>> {
        let tables = self.lock()?;
        let mut ids: Vec<i32> = tables.raw.keys().map(|(id, _)| *id).collect();
        ids.dedup();
        Ok(ids)
    }

    async fn raw_for_station(
        &self,
        station_id: i32,
        channels: &ChannelSet,
    ) -> Result<Vec<RawObservation>> {
        let tables = self.lock()?;
        Ok(tables
            .raw
            .values()
            .filter(|o| o.station_id == station_id)
            .map(|o| {
                let mut projected = RawObservation::new(o.station_id, o.timestamp);
                projected.latitude = o.latitude;
                projected.longitude = o.longitude;
                for channel in channels.iter() {
                    projected.values.set(channel, o.get(channel));
                }
                projected
            })
            .collect())
    }

    async fn insert_raw(&self, observations: &[RawObservation]) -> Result<InsertResult> {
        let mut tables = self.lock()?;
        let mut inserted = 0;
        for obs in observations {
            let key = (obs.station_id, obs.timestamp);
            if let std::collections::btree_map::Entry::Vacant(slot) = tables.raw.entry(key) {
                slot.insert(obs.clone());
                inserted += 1;
            }
        }
        Ok(InsertResult {
            inserted,
            skipped_duplicates: observations.len() - inserted,
        })
    }

    async fn replace_clean(&self, rows: &[HourlyAggregate], channels: &ChannelSet) -> Result<usize> {
        let mut tables = self.lock()?;
        tables.clean = rows.to_vec();
        tables.clean_channels = channels.clone();
        Ok(rows.len())
    }
}
