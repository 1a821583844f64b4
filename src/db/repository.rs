use crate::channel::{Channel, ChannelSet, ChannelValues};
use crate::db::models::{HourlyAggregate, InsertResult, RawObservation};
use crate::error::Result;
use crate::store::ObservationStore;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

pub const RAW_TABLE: &str = "raw_station_data";
pub const CLEAN_TABLE: &str = "clean_station_data";
const CLEAN_STAGING_TABLE: &str = "clean_station_data_staging";

// 16 binds per raw row, 18 at most per clean row; both stay well below the
// 65535 bind parameter limit.
const RAW_BATCH_SIZE: usize = 1000;
const CLEAN_BATCH_SIZE: usize = 2000;

pub struct Repository {
    pool: PgPool,
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let columns = sqlx::query_scalar::<_, String>(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        Ok(columns)
    }

    /// Read the whole clean table together with its value columns.
    pub async fn fetch_clean(&self) -> Result<(ChannelSet, Vec<HourlyAggregate>)> {
        let columns = self.table_columns(CLEAN_TABLE).await?;
        if columns.is_empty() {
            return Ok((ChannelSet::new(), Vec::new()));
        }

        let channels: ChannelSet = Channel::ALL
            .into_iter()
            .filter(|c| columns.iter().any(|col| col == c.column()))
            .collect();

        let sql = format!(
            "SELECT \"timestamp\", station_id, latitude, longitude, sample_count{} \
             FROM {} ORDER BY station_id, \"timestamp\"",
            select_list(&channels),
            CLEAN_TABLE
        );

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut aggregates = Vec::with_capacity(rows.len());
        for row in &rows {
            let sample_count: i32 = row.try_get("sample_count")?;
            aggregates.push(HourlyAggregate {
                station_id: row.try_get("station_id")?,
                timestamp: row.try_get("timestamp")?,
                latitude: row.try_get("latitude")?,
                longitude: row.try_get("longitude")?,
                sample_count: sample_count.max(0) as usize,
                values: read_values(row, &channels)?,
            });
        }

        Ok((channels, aggregates))
    }

    pub async fn count_raw(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", RAW_TABLE))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// The newest `per_station` raw rows of every station, ordered by
    /// station, then timestamp.
    pub async fn latest_raw(&self, per_station: i64) -> Result<Vec<RawObservation>> {
        let channels = self.raw_channels().await?;
        let columns = format!(
            "\"timestamp\", station_id, latitude, longitude{}",
            select_list(&channels)
        );
        let sql = format!(
            "WITH ranked AS ( \
                 SELECT {columns}, ROW_NUMBER() OVER ( \
                     PARTITION BY station_id ORDER BY \"timestamp\" DESC \
                 ) AS recency \
                 FROM {table} \
             ) \
             SELECT {columns} FROM ranked WHERE recency <= $1 \
             ORDER BY station_id, \"timestamp\"",
            columns = columns,
            table = RAW_TABLE
        );

        let rows = sqlx::query(&sql)
            .bind(per_station)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(|row| read_raw(row, &channels)).collect()
    }
}

impl ObservationStore for Repository {
    async fn raw_channels(&self) -> Result<ChannelSet> {
        let columns = self.table_columns(RAW_TABLE).await?;
        Ok(ChannelSet::from_columns(columns.iter().map(String::as_str)))
    }

    async fn station_ids(&self) -> Result<Vec<i32>> {
        let ids = sqlx::query_scalar::<_, i32>(&format!(
            "SELECT DISTINCT station_id FROM {} ORDER BY station_id",
            RAW_TABLE
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn raw_for_station(
        &self,
        station_id: i32,
        channels: &ChannelSet,
    ) -> Result<Vec<RawObservation>> {
        let sql = format!(
            "SELECT \"timestamp\", station_id, latitude, longitude{} \
             FROM {} WHERE station_id = $1 ORDER BY \"timestamp\"",
            select_list(channels),
            RAW_TABLE
        );

        let rows = sqlx::query(&sql)
            .bind(station_id)
            .fetch_all(&self.pool)
            .await?;

        let observations = rows
            .iter()
            .map(|row| read_raw(row, channels))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "Read {} raw observations for station {}",
            observations.len(),
            station_id
        );
        Ok(observations)
    }

    /// Insert observations in batch
    ///
    /// Uses `ON CONFLICT DO NOTHING` on (station_id, timestamp) so re-loading
    /// a file never rewrites existing rows. Processes in batches inside a
    /// single transaction.
    async fn insert_raw(&self, observations: &[RawObservation]) -> Result<InsertResult> {
        if observations.is_empty() {
            return Ok(InsertResult {
                inserted: 0,
                skipped_duplicates: 0,
            });
        }

        let channels = self.raw_channels().await?;
        let column_list = channels
            .iter()
            .map(|c| format!(", {}", c.column()))
            .collect::<String>();

        let mut inserted = 0;
        let mut tx = self.pool.begin().await?;

        let batches = observations.len().div_ceil(RAW_BATCH_SIZE);
        for (batch_idx, chunk) in observations.chunks(RAW_BATCH_SIZE).enumerate() {
            debug!(
                "Inserting batch {}/{} ({} observations)",
                batch_idx + 1,
                batches,
                chunk.len()
            );

            let mut query_builder = sqlx::QueryBuilder::new(format!(
                "INSERT INTO {} (\"timestamp\", station_id, latitude, longitude{}) ",
                RAW_TABLE, column_list
            ));

            query_builder.push_values(chunk, |mut b, obs| {
                b.push_bind(obs.timestamp)
                    .push_bind(obs.station_id)
                    .push_bind(obs.latitude)
                    .push_bind(obs.longitude);
                for channel in channels.iter() {
                    b.push_bind(obs.get(channel));
                }
            });

            query_builder.push(" ON CONFLICT (station_id, \"timestamp\") DO NOTHING");

            let result = query_builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected() as usize;
        }

        tx.commit().await?;

        Ok(InsertResult {
            inserted,
            skipped_duplicates: observations.len() - inserted,
        })
    }

    /// Rebuild the clean table through a staging table.
    ///
    /// Create, fill, drop and rename all run in one transaction; readers see
    /// either the previous table or the complete new one.
    async fn replace_clean(&self, rows: &[HourlyAggregate], channels: &ChannelSet) -> Result<usize> {
        let value_columns = channels
            .iter()
            .map(|c| format!("{} DOUBLE PRECISION, ", c.column()))
            .collect::<String>();
        let insert_columns = channels
            .iter()
            .map(|c| format!(", {}", c.column()))
            .collect::<String>();

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DROP TABLE IF EXISTS {}", CLEAN_STAGING_TABLE))
            .execute(&mut *tx)
            .await?;

        sqlx::query(&format!(
            "CREATE TABLE {staging} (\
                \"timestamp\" TIMESTAMPTZ NOT NULL, \
                station_id INTEGER NOT NULL, \
                sample_count INTEGER NOT NULL, \
                {values}\
                latitude DOUBLE PRECISION NOT NULL, \
                longitude DOUBLE PRECISION NOT NULL, \
                CONSTRAINT {staging}_pkey PRIMARY KEY (station_id, \"timestamp\"))",
            staging = CLEAN_STAGING_TABLE,
            values = value_columns
        ))
        .execute(&mut *tx)
        .await?;

        let mut written = 0;
        for chunk in rows.chunks(CLEAN_BATCH_SIZE) {
            let mut query_builder = sqlx::QueryBuilder::new(format!(
                "INSERT INTO {} (\"timestamp\", station_id, sample_count{}, latitude, longitude) ",
                CLEAN_STAGING_TABLE, insert_columns
            ));

            query_builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.timestamp)
                    .push_bind(row.station_id)
                    .push_bind(row.sample_count as i32);
                for channel in channels.iter() {
                    b.push_bind(row.get(channel));
                }
                b.push_bind(row.latitude).push_bind(row.longitude);
            });

            let result = query_builder.build().execute(&mut *tx).await?;
            written += result.rows_affected() as usize;
        }

        sqlx::query(&format!("DROP TABLE IF EXISTS {}", CLEAN_TABLE))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "ALTER TABLE {} RENAME TO {}",
            CLEAN_STAGING_TABLE, CLEAN_TABLE
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "ALTER INDEX {}_pkey RENAME TO {}_pkey",
            CLEAN_STAGING_TABLE, CLEAN_TABLE
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!("Replaced {} with {} hourly rows", CLEAN_TABLE, written);
        Ok(written)
    }
}

fn select_list(channels: &ChannelSet) -> String {
    channels
        .iter()
        .map(|c| format!(", {}", c.column()))
        .collect()
}

fn read_raw(row: &PgRow, channels: &ChannelSet) -> Result<RawObservation> {
    let timestamp: DateTime<Utc> = row.try_get("timestamp")?;
    Ok(RawObservation {
        station_id: row.try_get("station_id")?,
        timestamp,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        values: read_values(row, channels)?,
    })
}

fn read_values(row: &PgRow, channels: &ChannelSet) -> Result<ChannelValues> {
    let mut values = ChannelValues::default();
    for channel in channels.iter() {
        let value: Option<f64> = row.try_get(channel.column())?;
        values.set(channel, value);
    }
    Ok(values)
}
