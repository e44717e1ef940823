//! Live WebSocket feeds against an in-process server.

mod common;

use boat_telemetry::dispatch::Dispatcher;
use boat_telemetry::Channel;
use common::{eventually, temp_store, TestServer};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn accepted_record_is_pushed_to_every_socket() {
    let (_dir, store) = temp_store();
    let server = TestServer::start(store.clone()).await;
    let position = server.registries.get(Channel::Position).unwrap().clone();

    let (mut first, _) = connect_async(server.ws_url("/ws/position")).await.unwrap();
    let (mut second, _) = connect_async(server.ws_url("/ws/position")).await.unwrap();
    assert!(eventually(WAIT, || position.len() == 2).await);

    // inbound chatter is ignored
    first.send(Message::Text("hello".into())).await.unwrap();

    let dispatcher = Dispatcher::new(&store, &server.registries, 16);
    dispatcher
        .dispatch(
            "/boat/position",
            br#"{"timestamp":"2024-01-01T00:00:00Z","latitude":43.7,"longitude":7.4,"velocity":3.2,"heading":270.0}"#,
        )
        .await;
    dispatcher.shutdown().await;

    for socket in [&mut first, &mut second] {
        let msg = tokio::time::timeout(WAIT, socket.next())
            .await
            .expect("frame arrives")
            .expect("stream open")
            .expect("valid frame");
        let frame: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(frame["latitude"], 43.7);
        assert_eq!(frame["heading"], 270.0);
        assert_eq!(frame["timestamp"], "2024-01-01T00:00:00Z");
    }

    server.stop().await;
}

#[tokio::test]
async fn closing_the_socket_unregisters_the_subscriber() {
    let (_dir, store) = temp_store();
    let server = TestServer::start(store).await;
    let mode = server.registries.get(Channel::Mode).unwrap().clone();

    let (mut socket, _) = connect_async(server.ws_url("/ws/mode")).await.unwrap();
    assert!(eventually(WAIT, || mode.len() == 1).await);

    socket.close(None).await.unwrap();
    assert!(eventually(WAIT, || mode.is_empty()).await);

    server.stop().await;
}

#[tokio::test]
async fn dropped_connection_is_removed() {
    let (_dir, store) = temp_store();
    let server = TestServer::start(store).await;
    let battery = server.registries.get(Channel::Battery).unwrap().clone();

    let (socket, _) = connect_async(server.ws_url("/ws/battery")).await.unwrap();
    let (mut kept, _) = connect_async(server.ws_url("/ws/battery")).await.unwrap();
    assert!(eventually(WAIT, || battery.len() == 2).await);

    drop(socket);
    assert!(eventually(WAIT, || battery.len() == 1).await);

    let report = battery
        .broadcast_frame(r#"{"timestamp":"2024-01-01T00:00:00Z"}"#)
        .await;
    assert_eq!(report.delivered, 1);
    let msg = tokio::time::timeout(WAIT, kept.next()).await.unwrap().unwrap().unwrap();
    assert!(msg.is_text());

    server.stop().await;
}

#[tokio::test]
async fn channels_without_live_feed_are_not_found() {
    let (_dir, store) = temp_store();
    let server = TestServer::start(store).await;

    for path in ["/ws/thrusters_input", "/ws/acceleration", "/ws/engine"] {
        assert!(
            connect_async(server.ws_url(path)).await.is_err(),
            "{} should be refused",
            path
        );
        let resp = reqwest::get(server.url(path)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    server.stop().await;
}

#[tokio::test]
async fn shutdown_ends_open_sessions() {
    let (_dir, store) = temp_store();
    let server = TestServer::start(store).await;
    let obstacle = server.registries.get(Channel::Obstacle).unwrap().clone();

    let (_socket, _) = connect_async(server.ws_url("/ws/obstacle")).await.unwrap();
    assert!(eventually(WAIT, || obstacle.len() == 1).await);

    // would hang if the live session kept the connection open
    server.stop().await;
    assert!(eventually(WAIT, || obstacle.is_empty()).await);
}

#[tokio::test]
async fn evicted_subscriber_is_disconnected() {
    let (_dir, store) = temp_store();
    let server = TestServer::start(store).await;
    let battery = server.registries.get(Channel::Battery).unwrap().clone();

    // never read, so the server's writes back up
    let (mut stalled, _) = connect_async(server.ws_url("/ws/battery")).await.unwrap();
    assert!(eventually(WAIT, || battery.len() == 1).await);

    let frame = format!(r#"{{"padding":"{}"}}"#, "x".repeat(1 << 20));
    let mut evicted = false;
    for _ in 0..64 {
        if battery.broadcast_frame(&frame).await.dropped == 1 {
            evicted = true;
            break;
        }
    }
    assert!(evicted, "stalled socket was never dropped");
    assert!(battery.is_empty());

    // whatever was buffered drains, then the server ends the session
    let ended = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match stalled.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "server kept the evicted session open");

    server.stop().await;
}
