//! Test helpers: temporary stores, recording subscribers and an in-process
//! HTTP server.

#![allow(dead_code)]

use async_trait::async_trait;
use boat_telemetry::api::{self, AppState};
use boat_telemetry::broker::ConnectionState;
use boat_telemetry::config::StoreConfig;
use boat_telemetry::fanout::{DeliveryError, Registries, Subscriber};
use boat_telemetry::query::QueryEngine;
use boat_telemetry::store::Store;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Store on a fresh temporary database. Keep the `TempDir` alive.
pub fn temp_store() -> (TempDir, Store) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::open(&StoreConfig::at(dir.path().join("telemetry.db"))).expect("open store");
    (dir, store)
}

/// Subscriber that keeps every frame it is sent.
#[derive(Default)]
pub struct RecordingSubscriber {
    pub frames: Mutex<Vec<String>>,
}

impl RecordingSubscriber {
    pub async fn frames(&self) -> Vec<serde_json::Value> {
        self.frames
            .lock()
            .await
            .iter()
            .map(|f| serde_json::from_str(f).expect("frame is JSON"))
            .collect()
    }
}

#[async_trait]
impl Subscriber for RecordingSubscriber {
    async fn deliver(&self, frame: &str) -> Result<(), DeliveryError> {
        self.frames.lock().await.push(frame.to_string());
        Ok(())
    }
}

/// Subscriber whose connection is already gone.
pub struct BrokenSubscriber;

#[async_trait]
impl Subscriber for BrokenSubscriber {
    async fn deliver(&self, _frame: &str) -> Result<(), DeliveryError> {
        Err(DeliveryError::Closed)
    }
}

/// A running HTTP server over `store`.
pub struct TestServer {
    pub addr: SocketAddr,
    pub registries: Arc<Registries>,
    pub broker_state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl TestServer {
    pub async fn start(store: Store) -> Self {
        let registries = Arc::new(Registries::new(Duration::from_millis(500)));
        let (broker_state, broker_rx) = watch::channel(ConnectionState::Connected);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let state = AppState {
            queries: QueryEngine::new(store),
            registries: registries.clone(),
            broker_state: broker_rx,
            shutdown: shutdown_rx.clone(),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let mut stop = shutdown_rx;
        let task = tokio::spawn(async move {
            axum::serve(listener, api::router(state))
                .with_graceful_shutdown(async move {
                    while !*stop.borrow_and_update() {
                        if stop.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await
                .expect("serve");
        });

        Self {
            addr,
            registries,
            broker_state,
            shutdown,
            task: Some(task),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub async fn stop(mut self) {
        self.shutdown.send(true).ok();
        if let Some(task) = self.task.take() {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("server stops")
                .expect("server task");
        }
    }
}

/// Poll `check` until it holds or `wait` elapses.
pub async fn eventually(wait: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
