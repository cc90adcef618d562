// src/handlers/driver_handler.rs
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use super::ApiResponse;
use crate::{
    errors::AppResult,
    models::{
        BookingResponse, DriverAvailability, DriverLocationUpdate, DriverRegistration, DriverResponse,
        DriverStatusUpdate, EarningsSummary, NearbyDriver, NearbyDriversQuery, ReconcileReport,
    },
    services::DriverOperations,
    state::AppState,
};

type DriverReply = AppResult<Json<ApiResponse<DriverResponse>>>;

pub async fn register_driver(
    State(state): State<Arc<AppState>>,
    Json(registration): Json<DriverRegistration>,
) -> AppResult<(StatusCode, Json<ApiResponse<DriverResponse>>)> {
    let driver = state.driver_service.register_driver(registration).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::with_message(driver, "Driver registered, pending verification")),
    ))
}

pub async fn get_driver(State(state): State<Arc<AppState>>, Path(driver_id): Path<String>) -> DriverReply {
    let driver = state.driver_service.get_driver(&driver_id).await?;
    Ok(Json(ApiResponse::ok(driver)))
}

pub async fn nearby_drivers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NearbyDriversQuery>,
) -> AppResult<Json<ApiResponse<Vec<NearbyDriver>>>> {
    let drivers = state.driver_service.find_nearby_drivers(query).await?;
    Ok(Json(ApiResponse::ok(drivers)))
}

pub async fn update_location(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
    Json(update): Json<DriverLocationUpdate>,
) -> DriverReply {
    let driver = state.driver_service.update_location(&driver_id, update).await?;
    Ok(Json(ApiResponse::ok(driver)))
}

pub async fn update_availability(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
    Json(update): Json<DriverAvailability>,
) -> DriverReply {
    let driver = state.driver_service.update_availability(&driver_id, update).await?;
    Ok(Json(ApiResponse::ok(driver)))
}

pub async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
    Json(update): Json<DriverStatusUpdate>,
) -> DriverReply {
    let driver = state.driver_service.update_status(&driver_id, update).await?;
    Ok(Json(ApiResponse::ok(driver)))
}

pub async fn get_earnings(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
) -> AppResult<Json<ApiResponse<EarningsSummary>>> {
    let summary = state.driver_service.get_earnings(&driver_id).await?;
    Ok(Json(ApiResponse::ok(summary)))
}

pub async fn reconcile_earnings(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
) -> AppResult<Json<ApiResponse<ReconcileReport>>> {
    let report = state.driver_service.reconcile_totals(&driver_id).await?;
    Ok(Json(ApiResponse::ok(report)))
}

pub async fn active_booking(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<String>,
) -> AppResult<Json<ApiResponse<Option<BookingResponse>>>> {
    let booking = state.driver_service.get_active_booking(&driver_id).await?;
    let message = if booking.is_some() { "Active booking found" } else { "No active booking" };
    Ok(Json(ApiResponse::with_message(booking, message)))
}
