use async_trait::async_trait;
use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

use sparrow_bookings::services::messaging_service::{BatchOutcome, PushMessage};
use sparrow_bookings::services::{HaversineDirections, PushProvider};
use sparrow_bookings::store::{MemorySpatialIndex, MemoryStore, SpatialIndex};
use sparrow_bookings::{create_router, AppConfig, AppResult, AppState};

#[derive(Default)]
struct RecordingPush {
    sent: Mutex<Vec<PushMessage>>,
}

#[async_trait]
impl PushProvider for RecordingPush {
    async fn send_batch(&self, messages: Vec<PushMessage>) -> AppResult<BatchOutcome> {
        let outcome = BatchOutcome {
            success_count: messages.len(),
            failure_count: 0,
        };
        self.sent.lock().await.extend(messages);
        Ok(outcome)
    }
}

fn test_server() -> TestServer {
    test_server_with_push().0
}

fn test_server_with_push() -> (TestServer, Arc<RecordingPush>) {
    let index: Arc<dyn SpatialIndex> = Arc::new(MemorySpatialIndex::new());
    let push = Arc::new(RecordingPush::default());
    let provider: Arc<dyn PushProvider> = push.clone();
    let state = AppState::with_components(
        AppConfig::default(),
        Arc::new(MemoryStore::new()),
        Some(index),
        Some(provider),
        Arc::new(HaversineDirections::new(40.0)),
    );
    (TestServer::new(create_router(Arc::new(state))).unwrap(), push)
}

/// Registers a driver and walks it to an active, online position.
async fn onboard_driver(server: &TestServer, phone: &str, lat: f64, lng: f64) -> String {
    let response = server
        .post("/drivers")
        .json(&json!({
            "name": "Ravi Kumar",
            "phone_number": phone,
            "vehicle_number": "ka01ab1234",
            "vehicle_model": "Swift Dzire",
            "vehicle_type": "sedan",
            "push_token": format!("push-{}", phone),
        }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let body = response.json::<Value>();
    assert_eq!(body["data"]["status"], "pending_verification");
    assert_eq!(body["data"]["vehicle"]["number"], "KA01AB1234");
    let driver_id = body["data"]["id"].as_str().unwrap().to_string();

    server
        .put(&format!("/drivers/{}/status", driver_id))
        .json(&json!({ "status": "active" }))
        .await
        .assert_status_ok();
    server
        .put(&format!("/drivers/{}/availability", driver_id))
        .json(&json!({ "is_online": true, "is_available": true }))
        .await
        .assert_status_ok();
    server
        .put(&format!("/drivers/{}/location", driver_id))
        .json(&json!({ "lat": lat, "lng": lng }))
        .await
        .assert_status_ok();

    driver_id
}

fn booking_body(distance_km: Option<f64>) -> Value {
    let mut body = json!({
        "user_id": "usr-261018-a1b2c",
        "source": {
            "name": "MG Road",
            "address": "MG Road, Bengaluru",
            "coordinates": { "lat": 12.9756, "lng": 77.6050 }
        },
        "destination": {
            "name": "Mysuru Palace",
            "address": "Mysuru Palace, Mysuru",
            "coordinates": { "lat": 12.3052, "lng": 76.6552 }
        },
        "pickup_date": "2026-11-02",
        "pickup_time": "09:30",
        "vehicle_type": "sedan"
    });
    if let Some(distance) = distance_km {
        body["distance_km"] = json!(distance);
    }
    body
}

async fn create_booking(server: &TestServer, distance_km: Option<f64>) -> Value {
    let response = server.post("/bookings").json(&booking_body(distance_km)).await;
    response.assert_status(StatusCode::CREATED);
    response.json::<Value>()["data"].clone()
}

#[tokio::test]
async fn test_health_check() {
    let server = test_server();

    let response = server.get("/health").await;
    response.assert_status_ok();

    let body = response.json::<Value>();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "healthy");
    assert_eq!(body["data"]["store"], "memory");
}

#[tokio::test]
async fn test_unknown_booking_is_not_found() {
    let server = test_server();

    let response = server.get("/bookings/bkg-000000-zzzzz").await;
    response.assert_status_not_found();

    let body = response.json::<Value>();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "booking_not_found");
}

#[tokio::test]
async fn test_create_booking_reports_every_missing_field() {
    let server = test_server();

    let response = server.post("/bookings").json(&json!({})).await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let body = response.json::<Value>();
    assert_eq!(body["error"], "validation_failed");
    let fields: Vec<&str> = body["details"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|d| d["field"].as_str())
        .collect();
    for field in ["user_id", "source", "destination", "pickup_date", "pickup_time"] {
        assert!(fields.contains(&field), "missing {} in {:?}", field, fields);
    }
}

#[tokio::test]
async fn test_accept_requires_driver_id() {
    let server = test_server();
    let booking = create_booking(&server, Some(120.0)).await;

    let response = server
        .post(&format!("/bookings/{}/accept", booking["id"].as_str().unwrap()))
        .json(&json!({}))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["error"], "missing_field");
}

#[tokio::test]
async fn test_trip_lifecycle_over_http() {
    let (server, push) = test_server_with_push();
    let d1 = onboard_driver(&server, "+919845000001", 12.9716, 77.5946).await;
    let d2 = onboard_driver(&server, "+919845000002", 12.9720, 77.5950).await;

    let response = server.post("/bookings").json(&booking_body(Some(120.0))).await;
    response.assert_status(StatusCode::CREATED);
    let body = response.json::<Value>();
    assert!(body["message"].as_str().unwrap().contains("2 of 2"));
    {
        let sent = push.sent.lock().await;
        let tokens: Vec<&str> = sent.iter().map(|m| m.device_token.as_str()).collect();
        assert_eq!(tokens.len(), 2);
        assert!(tokens.contains(&"push-+919845000001"));
    }
    let booking = &body["data"];
    assert_eq!(booking["status"], "pending");
    assert_eq!(booking["total_price"], 2218);
    assert_eq!(booking["service_charge"], 222);
    assert_eq!(booking["driver_amount"], 1996);
    let id = booking["id"].as_str().unwrap().to_string();

    let response = server
        .post(&format!("/bookings/{}/accept", id))
        .json(&json!({ "driver_id": d1 }))
        .await;
    response.assert_status_ok();
    let accepted = response.json::<Value>();
    assert_eq!(accepted["data"]["status"], "accepted");
    assert_eq!(accepted["data"]["payment"]["advance_amount"], 444);

    // Second driver is too late
    let response = server
        .post(&format!("/bookings/{}/accept", id))
        .json(&json!({ "driver_id": d2 }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["error"], "invalid_transition");

    let response = server
        .get(&format!("/drivers/{}/active-booking", d1))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["data"]["id"], id.as_str());

    server
        .post(&format!("/bookings/{}/start", id))
        .json(&json!({ "driver_id": d1 }))
        .await
        .assert_status_ok();

    let response = server.post(&format!("/bookings/{}/generate-otp", id)).await;
    response.assert_status_ok();
    let otp = response.json::<Value>()["data"]["otp"].as_str().unwrap().to_string();
    assert_eq!(otp.len(), 4);

    let wrong = if otp == "0000" { "1111" } else { "0000" };
    let response = server
        .post(&format!("/bookings/{}/complete", id))
        .json(&json!({ "otp": wrong }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["error"], "otp_mismatch");

    let response = server
        .post(&format!("/bookings/{}/complete", id))
        .json(&json!({ "otp": otp }))
        .await;
    response.assert_status_ok();
    let completed = response.json::<Value>();
    assert_eq!(completed["data"]["status"], "completed");
    assert_eq!(completed["data"]["payment"]["status"], "paid");

    let response = server.get(&format!("/drivers/{}", d1)).await;
    response.assert_status_ok();
    let driver = response.json::<Value>();
    assert_eq!(driver["data"]["total_earnings"], 1996);
    assert_eq!(driver["data"]["total_trips"], 1);

    let response = server.get(&format!("/drivers/{}/earnings", d1)).await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["data"]["total"], 1996);

    let response = server
        .post(&format!("/drivers/{}/earnings/reconcile", d1))
        .await;
    response.assert_status_ok();
    let report = response.json::<Value>();
    assert_eq!(report["data"]["ledger_total"], 1996);
    assert_eq!(report["data"]["total_trips"], 1);
}

#[tokio::test]
async fn test_busy_driver_cannot_take_second_booking() {
    let server = test_server();
    let d1 = onboard_driver(&server, "+919845000003", 12.9716, 77.5946).await;

    let first = create_booking(&server, Some(120.0)).await;
    let second = create_booking(&server, Some(120.0)).await;

    server
        .post(&format!("/bookings/{}/accept", first["id"].as_str().unwrap()))
        .json(&json!({ "driver_id": d1 }))
        .await
        .assert_status_ok();

    let response = server
        .post(&format!("/bookings/{}/accept", second["id"].as_str().unwrap()))
        .json(&json!({ "driver_id": d1 }))
        .await;
    response.assert_status(StatusCode::CONFLICT);
    assert_eq!(response.json::<Value>()["error"], "driver_busy");
}

#[tokio::test]
async fn test_rider_cancel_then_cancel_again() {
    let server = test_server();
    let booking = create_booking(&server, Some(45.0)).await;
    let id = booking["id"].as_str().unwrap();

    let response = server
        .post(&format!("/bookings/{}/cancel", id))
        .json(&json!({ "reason": "Plans changed" }))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["data"]["status"], "cancelled");

    let response = server.post(&format!("/bookings/{}/cancel", id)).await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_fare_estimate() {
    let server = test_server();

    let response = server
        .post("/fares/estimate")
        .json(&json!({ "distance_km": 120.0, "vehicle_type": "sedan" }))
        .await;
    response.assert_status_ok();
    let body = response.json::<Value>();
    assert_eq!(body["data"]["fare"]["total"], 2218);
    assert_eq!(body["data"]["vehicle_class"], "sedan");

    let response = server
        .post("/fares/estimate")
        .json(&json!({ "distance_km": -4.0 }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_nearby_drivers_only_lists_eligible() {
    let server = test_server();
    let near = onboard_driver(&server, "+919845000004", 12.9716, 77.5946).await;
    onboard_driver(&server, "+919845000005", 13.3000, 77.5946).await;

    let response = server
        .get("/drivers/nearby")
        .add_query_param("lat", 12.9756)
        .add_query_param("lng", 77.6050)
        .add_query_param("radius_m", 5000)
        .await;
    response.assert_status_ok();
    let drivers = response.json::<Value>()["data"].as_array().unwrap().clone();
    assert_eq!(drivers.len(), 1);
    assert_eq!(drivers[0]["driver"]["id"], near.as_str());
}

#[tokio::test]
async fn test_duplicate_driver_phone_conflicts() {
    let server = test_server();
    onboard_driver(&server, "+919845000006", 12.9716, 77.5946).await;

    let response = server
        .post("/drivers")
        .json(&json!({
            "name": "Someone Else",
            "phone_number": "+919845000006",
            "vehicle_number": "KA02CD5678",
            "vehicle_model": "Innova"
        }))
        .await;
    response.assert_status(StatusCode::CONFLICT);
}
