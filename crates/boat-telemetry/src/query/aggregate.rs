//! Time-bucketed aggregation.
//!
//! Rows arrive in ascending (timestamp, id) order and are folded into
//! fixed-width buckets aligned to [`BUCKET_ORIGIN_SECS`]. Each emitted record
//! carries its bucket's start as the timestamp.

use chrono::{DateTime, Utc};

use crate::channel::Channel;
use crate::record::{
    AccelerationSample, BatteryReading, ObstacleReport, PositionFix, TelemetryRecord,
    ThrustersInput,
};

/// 2000-01-03T00:00:00Z, a Monday, so week-wide buckets start on Mondays.
pub const BUCKET_ORIGIN_SECS: i64 = 946_857_600;

enum BucketState {
    /// Running sums of every numeric field.
    Mean { sums: Vec<f64>, count: u32 },
    /// Latest record seen so far (mode, mission).
    Last(TelemetryRecord),
    /// Closest obstacle so far; first one wins ties.
    Closest(ObstacleReport),
}

impl BucketState {
    fn start(record: TelemetryRecord) -> Self {
        match record {
            TelemetryRecord::Mode(_) | TelemetryRecord::Mission(_) => BucketState::Last(record),
            TelemetryRecord::Obstacle(r) => BucketState::Closest(r),
            other => BucketState::Mean {
                sums: numeric_fields(&other),
                count: 1,
            },
        }
    }

    fn push(&mut self, record: TelemetryRecord) {
        match (self, record) {
            (BucketState::Mean { sums, count }, record) => {
                for (sum, value) in sums.iter_mut().zip(numeric_fields(&record)) {
                    *sum += value;
                }
                *count += 1;
            }
            (BucketState::Last(last), record) => *last = record,
            (BucketState::Closest(best), TelemetryRecord::Obstacle(r)) => {
                if r.distance < best.distance {
                    *best = r;
                }
            }
            (BucketState::Closest(_), _) => {}
        }
    }
}

pub struct Aggregator {
    channel: Channel,
    width_us: i64,
    buckets: Vec<(i64, BucketState)>,
}

impl Aggregator {
    pub fn new(channel: Channel, width_us: i64) -> Self {
        Self {
            channel,
            width_us: width_us.max(1),
            buckets: Vec::new(),
        }
    }

    fn bucket_start(&self, ts_us: i64) -> i64 {
        let origin_us = BUCKET_ORIGIN_SECS * 1_000_000;
        let offset = ts_us.saturating_sub(origin_us);
        origin_us.saturating_add(offset.div_euclid(self.width_us).saturating_mul(self.width_us))
    }

    /// Add the next row. Rows must come in ascending time order.
    pub fn push(&mut self, record: TelemetryRecord) {
        if record.channel() != self.channel {
            return;
        }
        let start = self.bucket_start(record.timestamp().timestamp_micros());
        match self.buckets.last_mut() {
            Some((current, state)) if *current == start => state.push(record),
            _ => self.buckets.push((start, BucketState::start(record))),
        }
    }

    /// One record per non-empty bucket, ascending.
    pub fn finish(self) -> Vec<TelemetryRecord> {
        let channel = self.channel;
        self.buckets
            .into_iter()
            .filter_map(|(start_us, state)| {
                let timestamp = DateTime::from_timestamp_micros(start_us)?;
                Some(match state {
                    BucketState::Mean { sums, count } => {
                        let means: Vec<f64> = sums.iter().map(|s| s / f64::from(count)).collect();
                        from_means(channel, timestamp, &means)?
                    }
                    BucketState::Last(record) => with_timestamp(record, timestamp),
                    BucketState::Closest(r) => {
                        TelemetryRecord::Obstacle(ObstacleReport { timestamp, ..r })
                    }
                })
            })
            .collect()
    }
}

fn numeric_fields(record: &TelemetryRecord) -> Vec<f64> {
    match record {
        TelemetryRecord::Battery(r) => vec![
            r.left_battery_voltage,
            r.right_battery_voltage,
            r.central_battery_voltage,
        ],
        TelemetryRecord::Position(r) => vec![r.latitude, r.longitude, r.velocity, r.heading],
        TelemetryRecord::ThrustersInput(r) => vec![r.left_thruster, r.right_thruster],
        TelemetryRecord::Acceleration(r) => vec![r.acceleration],
        TelemetryRecord::Obstacle(r) => vec![r.latitude, r.longitude, r.distance],
        TelemetryRecord::Mission(_) | TelemetryRecord::Mode(_) => Vec::new(),
    }
}

fn from_means(channel: Channel, timestamp: DateTime<Utc>, m: &[f64]) -> Option<TelemetryRecord> {
    let record = match channel {
        Channel::Battery => TelemetryRecord::Battery(BatteryReading {
            timestamp,
            left_battery_voltage: *m.first()?,
            right_battery_voltage: *m.get(1)?,
            central_battery_voltage: *m.get(2)?,
        }),
        Channel::Position => TelemetryRecord::Position(PositionFix {
            timestamp,
            latitude: *m.first()?,
            longitude: *m.get(1)?,
            velocity: *m.get(2)?,
            heading: *m.get(3)?,
        }),
        Channel::ThrustersInput => TelemetryRecord::ThrustersInput(ThrustersInput {
            timestamp,
            left_thruster: *m.first()?,
            right_thruster: *m.get(1)?,
        }),
        Channel::Acceleration => TelemetryRecord::Acceleration(AccelerationSample {
            timestamp,
            acceleration: *m.first()?,
        }),
        Channel::Mission | Channel::Mode | Channel::Obstacle => return None,
    };
    Some(record)
}

fn with_timestamp(record: TelemetryRecord, timestamp: DateTime<Utc>) -> TelemetryRecord {
    match record {
        TelemetryRecord::Mode(mut r) => {
            r.timestamp = timestamp;
            TelemetryRecord::Mode(r)
        }
        TelemetryRecord::Mission(mut r) => {
            r.timestamp = timestamp;
            TelemetryRecord::Mission(r)
        }
        other => other,
    }
}
