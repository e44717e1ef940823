//! Historical reads: raw ranges, bucketed aggregates, and the overall data span.
//!
//! Every request is checked (channel allow-list, range order, limits) before
//! the store is touched.

mod aggregate;
pub mod interval;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::record::TelemetryRecord;
use crate::store::{Store, StoreError};
pub use aggregate::BUCKET_ORIGIN_SECS;
use aggregate::Aggregator;
pub use interval::parse_interval;

pub const DEFAULT_LIMIT: u64 = 10_000;
pub const MAX_LIMIT: u64 = 100_000;
pub const DEFAULT_INTERVAL: &str = "5 minutes";

/// Query errors
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Invalid table name: {0}")]
    UnknownChannel(String),
    #[error("start_ts must be less than or equal to end_ts")]
    InvalidRange,
    #[error("limit must be at most {MAX_LIMIT}, got {0}")]
    LimitTooLarge(u64),
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
    #[error("Database error: {0}")]
    Store(#[from] StoreError),
}

impl QueryError {
    /// Whether the caller is at fault (bad request) rather than the server.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, QueryError::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;

/// Parameters of a raw range read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RangeParams {
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Parameters of an aggregate read. Both bounds are required.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AggregateParams {
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub interval: Option<String>,
}

/// Earliest and latest position fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTimeRange {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct QueryEngine {
    store: Store,
}

impl QueryEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Records on `channel` within the range, ascending by timestamp.
    pub async fn raw(&self, channel: &str, params: &RangeParams) -> Result<Vec<TelemetryRecord>> {
        let channel = allowed(channel)?;
        check_order(params.start_ts, params.end_ts)?;
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
        if limit > MAX_LIMIT {
            return Err(QueryError::LimitTooLarge(limit));
        }

        let rows = self
            .store
            .range(
                channel,
                params.start_ts,
                params.end_ts,
                limit,
                params.offset.unwrap_or(0),
            )
            .await?;
        Ok(rows.into_iter().map(|row| row.record).collect())
    }

    /// One aggregated record per non-empty bucket in `[start_ts, end_ts]`.
    pub async fn aggregated(
        &self,
        channel: &str,
        params: &AggregateParams,
    ) -> Result<Vec<TelemetryRecord>> {
        let channel = allowed(channel)?;
        let start = params
            .start_ts
            .ok_or(QueryError::MissingParameter("start_ts"))?;
        let end = params.end_ts.ok_or(QueryError::MissingParameter("end_ts"))?;
        check_order(Some(start), Some(end))?;
        let width = parse_interval(params.interval.as_deref().unwrap_or(DEFAULT_INTERVAL))
            .map_err(QueryError::InvalidInterval)?;
        let width_us = i64::try_from(width.as_micros())
            .map_err(|_| QueryError::InvalidInterval("interval is too long".into()))?;

        let aggregator = self
            .store
            .fold(
                channel,
                start,
                end,
                Aggregator::new(channel, width_us),
                |agg, row| agg.push(row.record),
            )
            .await?;
        Ok(aggregator.finish())
    }

    /// Span of the position channel, the boat's track.
    pub async fn data_time_range(&self) -> Result<DataTimeRange> {
        let span = self.store.time_range(Channel::Position).await?;
        Ok(DataTimeRange {
            start_time: span.map(|(start, _)| start),
            end_time: span.map(|(_, end)| end),
        })
    }
}

fn allowed(name: &str) -> Result<Channel> {
    Channel::from_name(name).ok_or_else(|| QueryError::UnknownChannel(name.to_string()))
}

fn check_order(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Result<()> {
    match (start, end) {
        (Some(start), Some(end)) if start > end => Err(QueryError::InvalidRange),
        _ => Ok(()),
    }
}
