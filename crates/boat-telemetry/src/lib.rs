//! Boat telemetry distribution engine.
//!
//! Ingests JSON telemetry from an MQTT broker on seven fixed topics, validates
//! each message against its channel schema, persists it into a
//! time-partitioned SQLite store and pushes it live to WebSocket subscribers.
//! A history API serves raw ranges and bucketed aggregates from the same store.

pub mod api;
pub mod broker;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fanout;
pub mod handler;
pub mod query;
pub mod record;
pub mod service;
pub mod store;

pub use channel::Channel;
pub use config::Config;
pub use error::{EngineError, Result};
pub use record::TelemetryRecord;
