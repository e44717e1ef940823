//! Engine lifecycle.
//!
//! Startup: store, then broker (fatal if unreachable), then ingestion lanes,
//! then HTTP. Shutdown runs the other way: HTTP stops, the broker session is
//! closed, lanes drain, and the store is closed last.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::api::{self, AppState};
use crate::broker::BrokerClient;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::fanout::Registries;
use crate::query::QueryEngine;
use crate::store::Store;

/// Initialise `env_logger` with an `info` default, overridable via `RUST_LOG`.
pub fn setup_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .try_init();
}

/// Run until Ctrl+C.
pub async fn run(config: &Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    ctrlc::set_handler({
        let shutdown_tx = shutdown_tx.clone();
        move || {
            log::info!("Received Ctrl+C, shutting down gracefully...");
            shutdown_tx.send(true).ok();
        }
    })?;

    run_until(config, shutdown_rx).await
}

/// Run until `shutdown` becomes `true` (or its sender is dropped).
pub async fn run_until(config: &Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    log::info!("Starting boat telemetry engine...");

    let store = Store::open(&config.store)?;

    let broker = match BrokerClient::connect(&config.broker).await {
        Ok(broker) => broker,
        Err(e) => {
            store.close();
            return Err(e.into());
        }
    };
    let broker_state = broker.state();

    let registries = Arc::new(Registries::new(config.fanout.send_timeout()));
    let dispatcher = Dispatcher::new(&store, &registries, config.ingest.lane_depth);

    // Ingestion and retention stop only after HTTP is down, including when
    // serving fails.
    let (stop, stopped) = watch::channel(false);
    let ingest = tokio::spawn({
        let stopped = stopped.clone();
        async move {
            if let Err(e) = broker.run(&dispatcher, stopped).await {
                log::error!("Ingestion stopped: {}", e);
            }
            dispatcher.shutdown().await;
        }
    });

    let retention = config.store.retention().map(|keep| {
        tokio::spawn(retention_loop(
            store.clone(),
            keep,
            config.store.retention_check(),
            stopped.clone(),
        ))
    });

    let state = AppState {
        queries: QueryEngine::new(store.clone()),
        registries,
        broker_state,
        shutdown: shutdown.clone(),
    };
    let served = serve_http(&config.http.bind, state, shutdown).await;
    if let Err(e) = &served {
        log::error!("HTTP server failed: {}", e);
    }

    stop.send_replace(true);
    if let Err(e) = ingest.await {
        log::error!("Ingestion task failed: {}", e);
    }
    if let Some(task) = retention {
        if let Err(e) = task.await {
            log::error!("Retention task failed: {}", e);
        }
    }

    store.close();
    log::info!("Boat telemetry engine stopped");
    served
}

async fn serve_http(
    bind: &str,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    log::info!("HTTP API listening on http://{}", listener.local_addr()?);

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut shutdown).await })
        .await?;
    log::info!("HTTP server stopped");
    Ok(())
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

/// Periodically drop chunks older than `keep`.
async fn retention_loop(
    store: Store,
    keep: Duration,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let Ok(keep) = chrono::Duration::from_std(keep) else {
        log::error!("Retention period {:?} is out of range, retention disabled", keep);
        return;
    };
    log::info!("Retention enabled: keeping {} day(s) of data", keep.num_days());

    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(cutoff) = Utc::now().checked_sub_signed(keep) else {
                    continue;
                };
                match store.drop_chunks_before(cutoff).await {
                    Ok(0) => log::debug!("Retention: nothing to drop before {}", cutoff),
                    Ok(n) => log::info!("Retention: dropped {} chunk(s) before {}", n, cutoff),
                    Err(e) => log::error!("Retention pass failed: {}", e),
                }
            }
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::broker::BrokerError;

    #[tokio::test]
    async fn unreachable_broker_is_fatal_before_serving() {
        let dir = tempfile::tempdir().unwrap();
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut config = Config::default();
        config.store.path = dir.path().join("svc.db");
        config.broker.host = "127.0.0.1".into();
        config.broker.port = port;
        config.broker.connect_retries = 2;
        config.broker.retry_delay_ms = 10;
        config.http.bind = "127.0.0.1:0".into();

        let (_tx, rx) = watch::channel(false);
        let err = run_until(&config, rx).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Broker(BrokerError::Connection { attempts: 2, .. })
        ));
    }

    /// Accept one MQTT client, acknowledge its CONNECT and return every
    /// byte it sends until it hangs up.
    async fn fake_broker(listener: tokio::net::TcpListener) -> Vec<u8> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        socket.read(&mut buf).await.unwrap();
        socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

        let mut received = Vec::new();
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
        received
    }

    #[tokio::test]
    async fn http_bind_failure_still_tears_down_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let broker_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_port = broker_listener.local_addr().unwrap().port();
        let broker = tokio::spawn(fake_broker(broker_listener));
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

        let mut config = Config::default();
        config.store.path = dir.path().join("svc.db");
        config.broker.host = "127.0.0.1".into();
        config.broker.port = broker_port;
        config.broker.connect_retries = 1;
        config.http.bind = occupied.local_addr().unwrap().to_string();

        let (_tx, rx) = watch::channel(false);
        let err = tokio::time::timeout(Duration::from_secs(10), run_until(&config, rx))
            .await
            .expect("engine returns instead of hanging")
            .unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));

        // the broker session was closed with DISCONNECT before returning
        let received = tokio::time::timeout(Duration::from_secs(5), broker)
            .await
            .unwrap()
            .unwrap();
        assert!(received.windows(2).any(|w| w == [0xE0, 0x00]));
    }

    #[tokio::test]
    async fn retention_loop_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&crate::config::StoreConfig::at(dir.path().join("r.db"))).unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(retention_loop(
            store,
            Duration::from_secs(86_400),
            Duration::from_millis(10),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
