//! Time-partitioned telemetry store on SQLite.
//!
//! Each channel's rows live in fixed-width chunk tables
//! (`<channel>_chunk_<start_us>`) registered in the `_chunks` catalog. Chunks
//! are created idempotently on first write into their time range, range reads
//! only touch overlapping chunks, and retention drops whole chunks.
//!
//! Every operation checks a connection out of the bounded pool and runs on
//! the blocking thread pool.

pub mod pool;
mod schema;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::Channel;
use crate::config::StoreConfig;
use crate::record::TelemetryRecord;
pub use pool::{ConnectionPool, PooledConnection};
use schema::{from_micros, to_micros};

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timed out after {0:?} waiting for a store connection")]
    PoolTimeout(Duration),
    #[error("Store is closed")]
    Closed,
    #[error("Store task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A record as persisted, with its store-assigned identity.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Per-channel sequence id, increasing in insertion order.
    pub id: i64,
    pub ingested_at: DateTime<Utc>,
    pub record: TelemetryRecord,
}

/// One catalogued partition, covering `[start_us, end_us)`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Chunk {
    start_us: i64,
    end_us: i64,
    table: String,
}

impl Chunk {
    fn contains(&self, ts_us: i64) -> bool {
        self.start_us <= ts_us && ts_us < self.end_us
    }
}

type ChunkCache = Arc<Mutex<HashMap<Channel, Vec<Chunk>>>>;

/// Handle to the time-series store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: ConnectionPool,
    chunks: ChunkCache,
    chunk_interval_us: i64,
}

impl Store {
    /// Open (or create) the store and its catalog.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let pool = ConnectionPool::open(config)?;
        let chunk_interval_us = i64::try_from(config.chunk_interval_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1_000_000)
            .max(1);

        let store = Self {
            pool,
            chunks: Arc::new(Mutex::new(HashMap::new())),
            chunk_interval_us,
        };

        // The catalog has to exist before any concurrent writer shows up.
        store
            .pool
            .with_idle(|conn| Ok(conn.execute_batch(schema::CATALOG_DDL)?))?;

        log::info!(
            "Opened telemetry store at {} (chunk interval {}s, pool max {})",
            config.path.display(),
            config.chunk_interval_secs,
            config.pool_max
        );
        Ok(store)
    }

    /// Release every pooled connection; later calls fail with [`StoreError::Closed`].
    pub fn close(&self) {
        self.pool.close();
        log::info!("Telemetry store closed");
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let mut conn = self.pool.acquire().await?;
        tokio::task::spawn_blocking(move || f(&mut conn))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Persist one validated record and return its sequence id.
    pub async fn insert(&self, record: &TelemetryRecord) -> Result<i64> {
        let channel = record.channel();
        let ts_us = to_micros(record.timestamp());
        let payload = schema::payload_values(record);
        let chunks = self.chunks.clone();
        let interval_us = self.chunk_interval_us;

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let cached = lock(&chunks)
                .get(&channel)
                .and_then(|known| known.iter().find(|c| c.contains(ts_us)).cloned());
            let (chunk, created) = match cached {
                Some(chunk) => (chunk, false),
                None => resolve_chunk(&tx, channel, ts_us, interval_us)?,
            };

            let id: i64 = tx.query_row(
                "INSERT INTO _sequences (channel, last_id) VALUES (?1, 1) \
                 ON CONFLICT(channel) DO UPDATE SET last_id = last_id + 1 \
                 RETURNING last_id",
                params![channel.name()],
                |row| row.get(0),
            )?;

            let mut values = Vec::with_capacity(payload.len() + 3);
            values.push(Value::Integer(id));
            values.push(Value::Integer(ts_us));
            values.extend(payload);
            values.push(Value::Integer(to_micros(Utc::now())));
            tx.execute(
                &schema::insert_sql(channel, &chunk.table),
                rusqlite::params_from_iter(values),
            )?;
            // Cache and catalog change together; retention trims under the same lock.
            {
                let mut cache = lock(&chunks);
                tx.commit()?;
                let known = cache.entry(channel).or_default();
                if !known.contains(&chunk) {
                    known.push(chunk.clone());
                }
            }

            if created {
                log::info!("Created chunk {} for {}", chunk.table, channel);
            }
            Ok(id)
        })
        .await
    }

    /// Rows on `channel` with `start <= ts <= end`, ascending by
    /// (timestamp, id), after skipping `offset` and capped at `limit`.
    pub async fn range(
        &self,
        channel: Channel,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<StoredRecord>> {
        let (lo, hi) = bounds(start, end);
        self.with_conn(move |conn| {
            let mut out = Vec::new();
            let mut skip = offset;
            let mut remaining = limit;

            for chunk in overlapping_chunks(conn, channel, lo, hi)? {
                if remaining == 0 {
                    break;
                }
                if skip > 0 {
                    let count: i64 = conn.query_row(
                        &format!(
                            "SELECT COUNT(*) FROM \"{}\" WHERE ts_us >= ?1 AND ts_us <= ?2",
                            chunk.table
                        ),
                        params![lo, hi],
                        |row| row.get(0),
                    )?;
                    let count = u64::try_from(count).unwrap_or(0);
                    if count <= skip {
                        skip -= count;
                        continue;
                    }
                }

                let sql = format!(
                    "SELECT {} FROM \"{}\" WHERE ts_us >= ?1 AND ts_us <= ?2 \
                     ORDER BY ts_us ASC, id ASC LIMIT ?3 OFFSET ?4",
                    schema::select_list(channel),
                    chunk.table
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    params![lo, hi, clamp_i64(remaining), clamp_i64(skip)],
                    |row| stored_from_row(channel, row),
                )?;
                for row in rows {
                    out.push(row?);
                }
                remaining = limit.saturating_sub(out.len() as u64);
                skip = 0;
            }
            Ok(out)
        })
        .await
    }

    /// Fold every row in `[start, end]` into `acc`, in ascending
    /// (timestamp, id) order.
    ///
    /// The fold runs on a blocking thread; the accumulator is handed back.
    pub async fn fold<A, F>(
        &self,
        channel: Channel,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        acc: A,
        mut f: F,
    ) -> Result<A>
    where
        A: Send + 'static,
        F: FnMut(&mut A, StoredRecord) + Send + 'static,
    {
        let (lo, hi) = bounds(Some(start), Some(end));
        self.with_conn(move |conn| {
            let mut acc = acc;
            for chunk in overlapping_chunks(conn, channel, lo, hi)? {
                let sql = format!(
                    "SELECT {} FROM \"{}\" WHERE ts_us >= ?1 AND ts_us <= ?2 \
                     ORDER BY ts_us ASC, id ASC",
                    schema::select_list(channel),
                    chunk.table
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![lo, hi])?;
                while let Some(row) = rows.next()? {
                    f(&mut acc, stored_from_row(channel, row)?);
                }
            }
            Ok(acc)
        })
        .await
    }

    /// Earliest and latest sensor timestamps stored on `channel`.
    pub async fn time_range(
        &self,
        channel: Channel,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        self.with_conn(move |conn| {
            let chunks = overlapping_chunks(conn, channel, i64::MIN, i64::MAX)?;

            let mut first = None;
            for chunk in &chunks {
                let min: Option<i64> = conn.query_row(
                    &format!("SELECT MIN(ts_us) FROM \"{}\"", chunk.table),
                    [],
                    |row| row.get(0),
                )?;
                if min.is_some() {
                    first = min;
                    break;
                }
            }
            let mut last = None;
            for chunk in chunks.iter().rev() {
                let max: Option<i64> = conn.query_row(
                    &format!("SELECT MAX(ts_us) FROM \"{}\"", chunk.table),
                    [],
                    |row| row.get(0),
                )?;
                if max.is_some() {
                    last = max;
                    break;
                }
            }

            match (first, last) {
                (Some(lo), Some(hi)) => Ok(Some((from_micros(0, lo)?, from_micros(0, hi)?))),
                _ => Ok(None),
            }
        })
        .await
    }

    /// Drop every chunk, on any channel, whose range ends at or before `cutoff`.
    pub async fn drop_chunks_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff_us = to_micros(cutoff);
        let chunks = self.chunks.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let expired: Vec<(String, String)> = {
                let mut stmt =
                    tx.prepare("SELECT channel, table_name FROM _chunks WHERE range_end_us <= ?1")?;
                let rows = stmt.query_map(params![cutoff_us], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            };

            for (_, table) in &expired {
                tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\"", table))?;
            }
            tx.execute(
                "DELETE FROM _chunks WHERE range_end_us <= ?1",
                params![cutoff_us],
            )?;
            // Forget the chunks before other writers can see the drop.
            {
                let mut cache = lock(&chunks);
                for known in cache.values_mut() {
                    known.retain(|c| c.end_us > cutoff_us);
                }
                tx.commit()?;
            }

            for (channel, table) in &expired {
                log::info!("Dropped expired chunk {} ({})", table, channel);
            }
            Ok(expired.len())
        })
        .await
    }

    /// Number of catalogued chunks on `channel`.
    pub async fn chunk_count(&self, channel: Channel) -> Result<usize> {
        self.with_conn(move |conn| {
            Ok(overlapping_chunks(conn, channel, i64::MIN, i64::MAX)?.len())
        })
        .await
    }
}

fn lock(cache: &ChunkCache) -> std::sync::MutexGuard<'_, HashMap<Channel, Vec<Chunk>>> {
    cache.lock().unwrap_or_else(|e| e.into_inner())
}

fn bounds(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> (i64, i64) {
    (
        start.map(to_micros).unwrap_or(i64::MIN),
        end.map(to_micros).unwrap_or(i64::MAX),
    )
}

fn clamp_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn stored_from_row(channel: Channel, row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRecord> {
    Ok(StoredRecord {
        id: row.get(0)?,
        ingested_at: from_micros(2, row.get(2)?)?,
        record: schema::record_from_row(channel, row)?,
    })
}

/// Chunks on `channel` intersecting `[lo, hi]`, ascending.
fn overlapping_chunks(conn: &Connection, channel: Channel, lo: i64, hi: i64) -> Result<Vec<Chunk>> {
    let mut stmt = conn.prepare_cached(
        "SELECT range_start_us, range_end_us, table_name FROM _chunks \
         WHERE channel = ?1 AND range_start_us <= ?3 AND range_end_us > ?2 \
         ORDER BY range_start_us ASC",
    )?;
    let rows = stmt.query_map(params![channel.name(), lo, hi], |row| {
        Ok(Chunk {
            start_us: row.get(0)?,
            end_us: row.get(1)?,
            table: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// Find the chunk holding `ts_us`, creating it if needed.
///
/// A new chunk is clipped to its neighbours so partitions never overlap,
/// even if the configured interval changed since they were written.
fn resolve_chunk(
    conn: &Connection,
    channel: Channel,
    ts_us: i64,
    interval_us: i64,
) -> Result<(Chunk, bool)> {
    let existing = conn
        .query_row(
            "SELECT range_start_us, range_end_us, table_name FROM _chunks \
             WHERE channel = ?1 AND range_start_us <= ?2 AND range_end_us > ?2",
            params![channel.name(), ts_us],
            |row| {
                Ok(Chunk {
                    start_us: row.get(0)?,
                    end_us: row.get(1)?,
                    table: row.get(2)?,
                })
            },
        )
        .optional()?;
    if let Some(chunk) = existing {
        return Ok((chunk, false));
    }

    let (mut start_us, mut end_us) = schema::aligned_chunk(ts_us, interval_us);
    let prev_end: Option<i64> = conn.query_row(
        "SELECT MAX(range_end_us) FROM _chunks WHERE channel = ?1 AND range_end_us <= ?2",
        params![channel.name(), ts_us],
        |row| row.get(0),
    )?;
    let next_start: Option<i64> = conn.query_row(
        "SELECT MIN(range_start_us) FROM _chunks WHERE channel = ?1 AND range_start_us > ?2",
        params![channel.name(), ts_us],
        |row| row.get(0),
    )?;
    if let Some(prev_end) = prev_end {
        start_us = start_us.max(prev_end);
    }
    if let Some(next_start) = next_start {
        end_us = end_us.min(next_start);
    }

    let table = schema::chunk_table_name(channel, start_us);
    conn.execute_batch(&schema::chunk_ddl(channel, &table))?;
    conn.execute(
        "INSERT INTO _chunks (channel, range_start_us, range_end_us, table_name) \
         VALUES (?1, ?2, ?3, ?4)",
        params![channel.name(), start_us, end_us, table],
    )?;

    Ok((
        Chunk {
            start_us,
            end_us,
            table,
        },
        true,
    ))
}
