//! Live fan-out of accepted records to dashboard subscribers.
//!
//! One [`FanoutRegistry`] per live channel. A broadcast snapshots the current
//! subscriber set, sends to everyone concurrently with a per-subscriber
//! timeout, and removes whoever failed in the same pass. There is no retry
//! and no per-subscriber queue; delivery across subscribers is unordered,
//! while each subscriber sees frames in broadcast order.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::Channel;
use crate::record::TelemetryRecord;

/// Why a frame could not be delivered.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Subscriber closed")]
    Closed,
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Send timed out after {0:?}")]
    Timeout(Duration),
}

/// A live connection that accepts JSON frames.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn deliver(&self, frame: &str) -> Result<(), DeliveryError>;

    /// Called once when a failed delivery removes this subscriber.
    fn evicted(&self) {}
}

/// Registry-local handle for a connected subscriber.
pub type SubscriberId = u64;

/// Result of one broadcast pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Subscribers of a single channel.
pub struct FanoutRegistry {
    channel: Channel,
    send_timeout: Duration,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriberId, Arc<dyn Subscriber>>>,
}

impl FanoutRegistry {
    pub fn new(channel: Channel, send_timeout: Duration) -> Self {
        Self {
            channel,
            send_timeout,
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriberId, Arc<dyn Subscriber>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an already-accepted connection.
    pub fn connect(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let total = {
            let mut subs = self.subscribers();
            subs.insert(id, subscriber);
            subs.len()
        };
        log::info!("[{}] New live subscriber #{}. Total: {}", self.channel, id, total);
        id
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn disconnect(&self, id: SubscriberId) -> bool {
        let (removed, remaining) = {
            let mut subs = self.subscribers();
            let removed = subs.remove(&id).is_some();
            (removed, subs.len())
        };
        if removed {
            log::info!(
                "[{}] Live subscriber #{} disconnected. Remaining: {}",
                self.channel,
                id,
                remaining
            );
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.subscribers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push `record` to every current subscriber.
    pub async fn broadcast(&self, record: &TelemetryRecord) -> BroadcastReport {
        match record.to_frame() {
            Ok(frame) => self.broadcast_frame(&frame).await,
            Err(e) => {
                log::error!("[{}] Failed to encode live frame: {}", self.channel, e);
                BroadcastReport::default()
            }
        }
    }

    /// Push a pre-encoded frame to every current subscriber.
    pub async fn broadcast_frame(&self, frame: &str) -> BroadcastReport {
        let snapshot: Vec<(SubscriberId, Arc<dyn Subscriber>)> = self
            .subscribers()
            .iter()
            .map(|(id, sub)| (*id, sub.clone()))
            .collect();
        if snapshot.is_empty() {
            return BroadcastReport::default();
        }

        let send_timeout = self.send_timeout;
        let results = join_all(snapshot.iter().map(|(id, sub)| async move {
            let outcome = match tokio::time::timeout(send_timeout, sub.deliver(frame)).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Timeout(send_timeout)),
            };
            (*id, outcome)
        }))
        .await;

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (id, outcome) in results {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    log::error!("[{}] Error sending to subscriber #{}: {}", self.channel, id, e);
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let (evicted, remaining) = {
                let mut subs = self.subscribers();
                let evicted: Vec<_> = failed.iter().filter_map(|id| subs.remove(id)).collect();
                (evicted, subs.len())
            };
            for sub in evicted {
                sub.evicted();
            }
            report.dropped = failed.len();
            log::info!(
                "[{}] Dropped {} failed subscriber(s). Remaining: {}",
                self.channel,
                failed.len(),
                remaining
            );
        }
        report
    }
}

/// One registry per live channel.
pub struct Registries {
    by_channel: [Option<Arc<FanoutRegistry>>; 7],
}

impl Registries {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            by_channel: Channel::ALL.map(|channel| {
                channel
                    .has_live_feed()
                    .then(|| Arc::new(FanoutRegistry::new(channel, send_timeout)))
            }),
        }
    }

    /// Registry for `channel`, if it has a live feed.
    pub fn get(&self, channel: Channel) -> Option<&Arc<FanoutRegistry>> {
        self.by_channel[channel.index()].as_ref()
    }

    pub fn total_subscribers(&self) -> usize {
        self.by_channel.iter().flatten().map(|r| r.len()).sum()
    }
}
