//! Topic dispatch onto per-channel ingestion lanes.
//!
//! Topics are resolved one message at a time, in arrival order. Each channel
//! then has its own lane (a task draining a bounded queue) so a slow store
//! write on one channel never holds up another, while messages within a
//! channel are handled strictly in order.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::Channel;
use crate::fanout::Registries;
use crate::handler::ChannelHandler;
use crate::store::Store;

/// Where an inbound message went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Queued(Channel),
    UnknownTopic,
    /// The channel's lane has already shut down.
    LaneClosed(Channel),
}

pub struct Dispatcher {
    lanes: Vec<mpsc::Sender<Vec<u8>>>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Start one lane per channel. Must be called inside a tokio runtime.
    pub fn new(store: &Store, registries: &Registries, lane_depth: usize) -> Self {
        let mut lanes = Vec::with_capacity(Channel::ALL.len());
        let mut workers = Vec::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            let handler = ChannelHandler::new(channel, store.clone(), registries);
            let (tx, rx) = mpsc::channel(lane_depth.max(1));
            lanes.push(tx);
            workers.push(tokio::spawn(run_lane(handler, rx)));
        }
        Self { lanes, workers }
    }

    /// Route one message. Waits for lane capacity when the channel is backed up.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) -> DispatchOutcome {
        let Some(channel) = Channel::from_topic(topic) else {
            log::warn!("Discarding message on unregistered topic {:?}", topic);
            return DispatchOutcome::UnknownTopic;
        };

        match self.lanes[channel.index()].send(payload.to_vec()).await {
            Ok(()) => DispatchOutcome::Queued(channel),
            Err(_) => {
                log::error!("[{}] Lane closed, dropping message", channel);
                DispatchOutcome::LaneClosed(channel)
            }
        }
    }

    /// Close every lane and wait for queued messages to be handled.
    pub async fn shutdown(self) {
        drop(self.lanes);
        for worker in self.workers {
            if let Err(e) = worker.await {
                log::error!("Ingestion lane task failed: {}", e);
            }
        }
        log::info!("Ingestion lanes drained");
    }
}

async fn run_lane(handler: ChannelHandler, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(payload) = rx.recv().await {
        handler.handle(&payload).await;
    }
    log::debug!("[{}] Lane stopped", handler.channel());
}
