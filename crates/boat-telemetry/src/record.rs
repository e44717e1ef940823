//! Typed telemetry records, one per channel.
//!
//! Payloads arrive as JSON objects. Decoding goes through two steps that fail
//! differently: structural parsing ([`RecordError::Decode`]) and domain
//! constraint checks ([`RecordError::Validation`]). Both mean the message is
//! dropped.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::channel::Channel;

/// Errors from turning a raw payload into a record.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Validation error: {field} {reason}")]
    Validation { field: &'static str, reason: String },
}

impl From<serde_json::Error> for RecordError {
    fn from(err: serde_json::Error) -> Self {
        RecordError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RecordError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryReading {
    pub timestamp: DateTime<Utc>,
    pub left_battery_voltage: f64,
    pub right_battery_voltage: f64,
    pub central_battery_voltage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionUpdate {
    pub timestamp: DateTime<Utc>,
    pub description: String,
}

/// Operational mode reported by the boat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Auto,
    Manual,
    Off,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Auto => "AUTO",
            Mode::Manual => "MANUAL",
            Mode::Off => "OFF",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "AUTO" => Ok(Mode::Auto),
            "MANUAL" => Ok(Mode::Manual),
            "OFF" => Ok(Mode::Off),
            other => Err(format!("must be one of AUTO, MANUAL, OFF, got {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeChange {
    pub timestamp: DateTime<Utc>,
    pub mode: Mode,
}

/// Mode payload as it comes off the wire; membership is checked afterwards.
#[derive(Deserialize)]
struct ModeWire {
    timestamp: DateTime<Utc>,
    mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObstacleReport {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Distance to the obstacle in meters.
    pub distance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Speed over ground in m/s.
    pub velocity: f64,
    /// Heading in degrees.
    pub heading: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrustersInput {
    pub timestamp: DateTime<Utc>,
    pub left_thruster: f64,
    pub right_thruster: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccelerationSample {
    pub timestamp: DateTime<Utc>,
    /// Signed acceleration in m/s².
    pub acceleration: f64,
}

/// A validated record on any channel.
///
/// Serializes to the bare payload shape (no tag), which is what both the
/// live feeds and the history API return.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TelemetryRecord {
    Battery(BatteryReading),
    Mission(MissionUpdate),
    Mode(ModeChange),
    Obstacle(ObstacleReport),
    Position(PositionFix),
    ThrustersInput(ThrustersInput),
    Acceleration(AccelerationSample),
}

impl TelemetryRecord {
    /// Decode and validate a raw payload for `channel`.
    pub fn decode(channel: Channel, payload: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(payload)?;
        if !value.is_object() {
            return Err(RecordError::Decode("payload is not a JSON object".into()));
        }

        let record = match channel {
            Channel::Battery => TelemetryRecord::Battery(from_value(value)?),
            Channel::Mission => TelemetryRecord::Mission(from_value(value)?),
            Channel::Mode => {
                let wire: ModeWire = from_value(value)?;
                let mode = wire
                    .mode
                    .parse::<Mode>()
                    .map_err(|reason| RecordError::Validation {
                        field: "mode",
                        reason,
                    })?;
                TelemetryRecord::Mode(ModeChange {
                    timestamp: wire.timestamp,
                    mode,
                })
            }
            Channel::Obstacle => TelemetryRecord::Obstacle(from_value(value)?),
            Channel::Position => TelemetryRecord::Position(from_value(value)?),
            Channel::ThrustersInput => TelemetryRecord::ThrustersInput(from_value(value)?),
            Channel::Acceleration => TelemetryRecord::Acceleration(from_value(value)?),
        };

        record.validate()?;
        Ok(record)
    }

    pub fn channel(&self) -> Channel {
        match self {
            TelemetryRecord::Battery(_) => Channel::Battery,
            TelemetryRecord::Mission(_) => Channel::Mission,
            TelemetryRecord::Mode(_) => Channel::Mode,
            TelemetryRecord::Obstacle(_) => Channel::Obstacle,
            TelemetryRecord::Position(_) => Channel::Position,
            TelemetryRecord::ThrustersInput(_) => Channel::ThrustersInput,
            TelemetryRecord::Acceleration(_) => Channel::Acceleration,
        }
    }

    /// Sensor time of the sample.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TelemetryRecord::Battery(r) => r.timestamp,
            TelemetryRecord::Mission(r) => r.timestamp,
            TelemetryRecord::Mode(r) => r.timestamp,
            TelemetryRecord::Obstacle(r) => r.timestamp,
            TelemetryRecord::Position(r) => r.timestamp,
            TelemetryRecord::ThrustersInput(r) => r.timestamp,
            TelemetryRecord::Acceleration(r) => r.timestamp,
        }
    }

    /// Check every field constraint for the record's channel.
    pub fn validate(&self) -> Result<()> {
        match self {
            TelemetryRecord::Battery(r) => {
                non_negative("left_battery_voltage", r.left_battery_voltage)?;
                non_negative("right_battery_voltage", r.right_battery_voltage)?;
                non_negative("central_battery_voltage", r.central_battery_voltage)
            }
            TelemetryRecord::Mission(_) | TelemetryRecord::Mode(_) => Ok(()),
            TelemetryRecord::Obstacle(r) => {
                within("latitude", r.latitude, -90.0, 90.0)?;
                within("longitude", r.longitude, -180.0, 180.0)?;
                non_negative("distance", r.distance)
            }
            TelemetryRecord::Position(r) => {
                within("latitude", r.latitude, -90.0, 90.0)?;
                within("longitude", r.longitude, -180.0, 180.0)?;
                non_negative("velocity", r.velocity)?;
                within("heading", r.heading, 0.0, 360.0)
            }
            TelemetryRecord::ThrustersInput(r) => {
                within("left_thruster", r.left_thruster, -100.0, 100.0)?;
                within("right_thruster", r.right_thruster, -100.0, 100.0)
            }
            TelemetryRecord::Acceleration(r) => finite("acceleration", r.acceleration),
        }
    }

    /// JSON frame pushed to live subscribers.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn from_value<T: DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

fn finite(field: &'static str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(RecordError::Validation {
            field,
            reason: format!("must be finite, got {}", value),
        })
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<()> {
    finite(field, value)?;
    if value < 0.0 {
        return Err(RecordError::Validation {
            field,
            reason: format!("must be >= 0, got {}", value),
        });
    }
    Ok(())
}

fn within(field: &'static str, value: f64, min: f64, max: f64) -> Result<()> {
    finite(field, value)?;
    if value < min || value > max {
        return Err(RecordError::Validation {
            field,
            reason: format!("must be in [{}, {}], got {}", min, max, value),
        });
    }
    Ok(())
}
