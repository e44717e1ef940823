//! Table layout and row mapping for each channel.
//!
//! Column lists and row constructors are written out per channel so the
//! binding between records and SQL stays explicit.

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::Row;

use crate::channel::Channel;
use crate::record::{
    AccelerationSample, BatteryReading, MissionUpdate, Mode, ModeChange, ObstacleReport,
    PositionFix, TelemetryRecord, ThrustersInput,
};

pub(crate) const CATALOG_DDL: &str = "
    CREATE TABLE IF NOT EXISTS _chunks (
        channel         TEXT NOT NULL,
        range_start_us  INTEGER NOT NULL,
        range_end_us    INTEGER NOT NULL,
        table_name      TEXT NOT NULL UNIQUE,
        PRIMARY KEY (channel, range_start_us)
    );
    CREATE INDEX IF NOT EXISTS idx_chunks_end ON _chunks(channel, range_end_us);

    CREATE TABLE IF NOT EXISTS _sequences (
        channel  TEXT PRIMARY KEY,
        last_id  INTEGER NOT NULL
    );";

/// Payload columns and their SQLite types, in insert order.
pub(crate) fn payload_columns(channel: Channel) -> &'static [(&'static str, &'static str)] {
    match channel {
        Channel::Battery => &[
            ("left_battery_voltage", "REAL"),
            ("right_battery_voltage", "REAL"),
            ("central_battery_voltage", "REAL"),
        ],
        Channel::Mission => &[("description", "TEXT")],
        Channel::Mode => &[("mode", "TEXT")],
        Channel::Obstacle => &[
            ("latitude", "REAL"),
            ("longitude", "REAL"),
            ("distance", "REAL"),
        ],
        Channel::Position => &[
            ("latitude", "REAL"),
            ("longitude", "REAL"),
            ("velocity", "REAL"),
            ("heading", "REAL"),
        ],
        Channel::ThrustersInput => &[("left_thruster", "REAL"), ("right_thruster", "REAL")],
        Channel::Acceleration => &[("acceleration", "REAL")],
    }
}

/// Payload values of `record`, matching [`payload_columns`].
pub(crate) fn payload_values(record: &TelemetryRecord) -> Vec<Value> {
    match record {
        TelemetryRecord::Battery(r) => vec![
            Value::Real(r.left_battery_voltage),
            Value::Real(r.right_battery_voltage),
            Value::Real(r.central_battery_voltage),
        ],
        TelemetryRecord::Mission(r) => vec![Value::Text(r.description.clone())],
        TelemetryRecord::Mode(r) => vec![Value::Text(r.mode.as_str().to_string())],
        TelemetryRecord::Obstacle(r) => vec![
            Value::Real(r.latitude),
            Value::Real(r.longitude),
            Value::Real(r.distance),
        ],
        TelemetryRecord::Position(r) => vec![
            Value::Real(r.latitude),
            Value::Real(r.longitude),
            Value::Real(r.velocity),
            Value::Real(r.heading),
        ],
        TelemetryRecord::ThrustersInput(r) => {
            vec![Value::Real(r.left_thruster), Value::Real(r.right_thruster)]
        }
        TelemetryRecord::Acceleration(r) => vec![Value::Real(r.acceleration)],
    }
}

/// DDL for one chunk table. `table` comes from [`chunk_table_name`] only.
pub(crate) fn chunk_ddl(channel: Channel, table: &str) -> String {
    let columns: Vec<String> = payload_columns(channel)
        .iter()
        .map(|(name, ty)| format!("{} {} NOT NULL", name, ty))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (
            id              INTEGER NOT NULL,
            ts_us           INTEGER NOT NULL,
            {columns},
            ingested_at_us  INTEGER NOT NULL,
            PRIMARY KEY (id, ts_us)
        );
        CREATE INDEX IF NOT EXISTS \"{table}_ts\" ON \"{table}\"(ts_us, id);",
        table = table,
        columns = columns.join(",\n            "),
    )
}

pub(crate) fn insert_sql(channel: Channel, table: &str) -> String {
    let columns = payload_columns(channel);
    let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
    let placeholders = vec!["?"; columns.len() + 3].join(", ");
    format!(
        "INSERT INTO \"{}\" (id, ts_us, {}, ingested_at_us) VALUES ({})",
        table,
        names.join(", "),
        placeholders
    )
}

/// `SELECT` list whose layout [`record_from_row`] expects.
pub(crate) fn select_list(channel: Channel) -> String {
    let names: Vec<&str> = payload_columns(channel)
        .iter()
        .map(|(name, _)| *name)
        .collect();
    format!("id, ts_us, ingested_at_us, {}", names.join(", "))
}

/// Name of the chunk table covering `[start_us, ..)` on `channel`.
pub(crate) fn chunk_table_name(channel: Channel, start_us: i64) -> String {
    format!("{}_chunk_{}", channel.name(), start_us)
}

/// Epoch-aligned chunk containing `ts_us`.
pub(crate) fn aligned_chunk(ts_us: i64, interval_us: i64) -> (i64, i64) {
    let start = ts_us.div_euclid(interval_us).saturating_mul(interval_us);
    (start, start.saturating_add(interval_us))
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(idx: usize, us: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {}", us).into(),
        )
    })
}

/// Rebuild a record from a row laid out by [`select_list`].
pub(crate) fn record_from_row(channel: Channel, row: &Row<'_>) -> rusqlite::Result<TelemetryRecord> {
    let timestamp = from_micros(1, row.get(1)?)?;
    let record = match channel {
        Channel::Battery => TelemetryRecord::Battery(BatteryReading {
            timestamp,
            left_battery_voltage: row.get(3)?,
            right_battery_voltage: row.get(4)?,
            central_battery_voltage: row.get(5)?,
        }),
        Channel::Mission => TelemetryRecord::Mission(MissionUpdate {
            timestamp,
            description: row.get(3)?,
        }),
        Channel::Mode => {
            let raw: String = row.get(3)?;
            let mode = raw.parse::<Mode>().map_err(|reason| {
                rusqlite::Error::FromSqlConversionFailure(3, Type::Text, reason.into())
            })?;
            TelemetryRecord::Mode(ModeChange { timestamp, mode })
        }
        Channel::Obstacle => TelemetryRecord::Obstacle(ObstacleReport {
            timestamp,
            latitude: row.get(3)?,
            longitude: row.get(4)?,
            distance: row.get(5)?,
        }),
        Channel::Position => TelemetryRecord::Position(PositionFix {
            timestamp,
            latitude: row.get(3)?,
            longitude: row.get(4)?,
            velocity: row.get(5)?,
            heading: row.get(6)?,
        }),
        Channel::ThrustersInput => TelemetryRecord::ThrustersInput(ThrustersInput {
            timestamp,
            left_thruster: row.get(3)?,
            right_thruster: row.get(4)?,
        }),
        Channel::Acceleration => TelemetryRecord::Acceleration(AccelerationSample {
            timestamp,
            acceleration: row.get(3)?,
        }),
    };
    Ok(record)
}
