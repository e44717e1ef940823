//! Per-channel message handling: decode, validate, persist, fan out.

use std::sync::Arc;

use crate::channel::Channel;
use crate::fanout::{FanoutRegistry, Registries};
use crate::record::{RecordError, TelemetryRecord};
use crate::store::Store;

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Stored under `id`, then pushed to `subscribers` live connections
    /// (`dropped` of them failed and were removed).
    Delivered {
        id: i64,
        subscribers: usize,
        dropped: usize,
    },
    /// Malformed or out-of-range payload; nothing stored.
    Rejected,
    /// Valid, but the store write failed. Not broadcast.
    NotPersisted,
}

/// Handles every message for one channel.
pub struct ChannelHandler {
    channel: Channel,
    store: Store,
    registry: Option<Arc<FanoutRegistry>>,
}

impl ChannelHandler {
    pub fn new(channel: Channel, store: Store, registries: &Registries) -> Self {
        Self {
            channel,
            store,
            registry: registries.get(channel).cloned(),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Process one raw payload. Never fails: every problem is logged and
    /// reported through the outcome.
    pub async fn handle(&self, payload: &[u8]) -> HandleOutcome {
        let record = match TelemetryRecord::decode(self.channel, payload) {
            Ok(record) => record,
            Err(e @ RecordError::Decode(_)) => {
                log::warn!("[{}] Dropping undecodable message: {}", self.channel, e);
                return HandleOutcome::Rejected;
            }
            Err(e @ RecordError::Validation { .. }) => {
                log::warn!("[{}] Dropping invalid message: {}", self.channel, e);
                return HandleOutcome::Rejected;
            }
        };

        // Persist first; a record that never made it to the store is not shown live.
        let id = match self.store.insert(&record).await {
            Ok(id) => id,
            Err(e) => {
                log::error!("[{}] Failed to persist record: {}", self.channel, e);
                return HandleOutcome::NotPersisted;
            }
        };

        let report = match &self.registry {
            Some(registry) => registry.broadcast(&record).await,
            None => Default::default(),
        };
        log::debug!(
            "[{}] Stored record #{} at {}, live delivered to {}",
            self.channel,
            id,
            record.timestamp(),
            report.delivered
        );

        HandleOutcome::Delivered {
            id,
            subscribers: report.delivered,
            dropped: report.dropped,
        }
    }
}
