//! History API over HTTP: range bounds, ordering, validation and aggregation.

mod common;

use boat_telemetry::record::{BatteryReading, Mode, ModeChange, PositionFix};
use boat_telemetry::TelemetryRecord;
use chrono::{DateTime, Duration, TimeZone, Utc};
use common::{temp_store, TestServer};
use reqwest::StatusCode;
use serde_json::Value;

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

async fn get_json(url: &str) -> (StatusCode, Value) {
    let resp = reqwest::get(url).await.unwrap();
    let status = resp.status();
    (status, resp.json().await.unwrap())
}

#[tokio::test]
async fn raw_range_is_bounded_and_ascending() -> anyhow::Result<()> {
    let (_dir, store) = temp_store();
    // inserted out of order
    for secs in [50, 10, 40, 20, 30, 0, 60] {
        store
            .insert(&TelemetryRecord::Position(PositionFix {
                timestamp: base() + Duration::seconds(secs),
                latitude: 45.0,
                longitude: 9.0,
                velocity: secs as f64,
                heading: 180.0,
            }))
            .await?;
    }
    let server = TestServer::start(store).await;

    let url = server.url(&format!(
        "/api/position?start_ts={}&end_ts={}",
        iso(base() + Duration::seconds(10)),
        iso(base() + Duration::seconds(50)),
    ));
    let (status, body) = get_json(&url).await;
    assert_eq!(status, StatusCode::OK);
    let velocities: Vec<f64> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["velocity"].as_f64().unwrap())
        .collect();
    assert_eq!(velocities, vec![10.0, 20.0, 30.0, 40.0, 50.0]);

    let (_, page) = get_json(&server.url("/api/position?limit=2&offset=3")).await;
    let page: Vec<f64> = page
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["velocity"].as_f64().unwrap())
        .collect();
    assert_eq!(page, vec![30.0, 40.0]);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn bad_requests_are_client_errors() {
    let (_dir, store) = temp_store();
    let server = TestServer::start(store).await;

    let (status, body) = get_json(&server.url(&format!(
        "/api/battery?start_ts={}&end_ts={}",
        iso(base() + Duration::hours(1)),
        iso(base()),
    )))
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "start_ts must be less than or equal to end_ts");

    let (status, body) = get_json(&server.url("/api/users")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Invalid table name: users");

    let (status, _) = get_json(&server.url("/api/battery?limit=100001")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = get_json(&server.url("/api/battery/aggregated")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("start_ts"));

    // malformed query strings still get a JSON error body
    for path in [
        "/api/battery?limit=-1",
        "/api/battery?start_ts=garbage",
        "/api/battery/aggregated?start_ts=2024-01-01T00:00:00&end_ts=2024-01-02T00:00:00Z",
    ] {
        let (status, body) = get_json(&server.url(path)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", path);
        assert!(!body["detail"].as_str().unwrap().is_empty(), "{}", path);
    }

    server.stop().await;
}

#[tokio::test]
async fn fifteen_minutes_in_five_minute_buckets() -> anyhow::Result<()> {
    let (_dir, store) = temp_store();
    // one sample per second for 15 minutes
    for secs in 0..900i64 {
        let ts = base() + Duration::seconds(secs);
        store
            .insert(&TelemetryRecord::Battery(BatteryReading {
                timestamp: ts,
                left_battery_voltage: secs as f64,
                right_battery_voltage: 12.0,
                central_battery_voltage: (secs % 10) as f64,
            }))
            .await?;
        let mode = match secs {
            0..=299 => Mode::Auto,
            300..=599 => Mode::Manual,
            _ => Mode::Off,
        };
        // the mode flips once at the very end of every bucket
        let mode = if secs % 300 == 299 { Mode::Manual } else { mode };
        store
            .insert(&TelemetryRecord::Mode(ModeChange {
                timestamp: ts,
                mode,
            }))
            .await?;
    }
    let server = TestServer::start(store).await;
    let range = format!(
        "start_ts={}&end_ts={}&interval=5%20minutes",
        iso(base()),
        iso(base() + Duration::seconds(899)),
    );

    let (status, body) = get_json(&server.url(&format!("/api/battery/aggregated?{}", range))).await;
    assert_eq!(status, StatusCode::OK);
    let buckets = body.as_array().unwrap();
    assert_eq!(buckets.len(), 3);
    for (i, bucket) in buckets.iter().enumerate() {
        let start = 300 * i as i64;
        assert_eq!(bucket["timestamp"], iso(base() + Duration::seconds(start)));
        // mean of start..start+300
        let expected = start as f64 + 149.5;
        let left = bucket["left_battery_voltage"].as_f64().unwrap();
        assert!((left - expected).abs() < 1e-9, "bucket {}: {}", i, left);
        assert!((bucket["right_battery_voltage"].as_f64().unwrap() - 12.0).abs() < 1e-9);
        assert!((bucket["central_battery_voltage"].as_f64().unwrap() - 4.5).abs() < 1e-9);
    }

    let (status, body) = get_json(&server.url(&format!("/api/mode/aggregated?{}", range))).await;
    assert_eq!(status, StatusCode::OK);
    let modes: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["mode"].as_str().unwrap())
        .collect();
    assert_eq!(modes, vec!["MANUAL", "MANUAL", "MANUAL"]);

    // default interval is five minutes too
    let (_, body) = get_json(&server.url(&format!(
        "/api/battery/aggregated?start_ts={}&end_ts={}",
        iso(base()),
        iso(base() + Duration::seconds(899)),
    )))
    .await;
    assert_eq!(body.as_array().unwrap().len(), 3);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn data_time_range_and_health() -> anyhow::Result<()> {
    let (_dir, store) = temp_store();
    for secs in [120, 0, 60] {
        store
            .insert(&TelemetryRecord::Position(PositionFix {
                timestamp: base() + Duration::seconds(secs),
                latitude: 0.0,
                longitude: 0.0,
                velocity: 0.0,
                heading: 0.0,
            }))
            .await?;
    }
    let server = TestServer::start(store).await;

    let (status, body) = get_json(&server.url("/api/data-time-range")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["start_time"], iso(base()));
    assert_eq!(body["end_time"], iso(base() + Duration::seconds(120)));

    let (_, health) = get_json(&server.url("/health")).await;
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["mqtt_connected"], true);

    server
        .broker_state
        .send_replace(boat_telemetry::broker::ConnectionState::Disconnected);
    let (_, health) = get_json(&server.url("/health")).await;
    assert_eq!(health["mqtt_connected"], false);

    server.stop().await;
    Ok(())
}
