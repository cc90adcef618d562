// src/handlers/booking_handler.rs
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use super::ApiResponse;
use crate::{
    errors::{AppError, AppResult},
    models::{
        BookingFilter, BookingPatch, BookingResponse, CancelRequest, CompleteRequest, CreateBookingRequest,
        DriverAction, FareEstimateRequest, FareEstimateResponse, OtpResponse, PaymentConfirmation,
    },
    services::BookingOperations,
    state::AppState,
};

type BookingReply = AppResult<Json<ApiResponse<BookingResponse>>>;

fn driver_id_of(action: Option<DriverAction>) -> AppResult<String> {
    action
        .and_then(|a| a.driver_id)
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .ok_or_else(|| AppError::missing_field("driver_id"))
}

pub async fn create_booking(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateBookingRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<BookingResponse>>)> {
    let created = state.booking_service.create_booking(request).await?;
    let message = format!(
        "Booking created and offered to {} of {} nearby drivers",
        created.dispatch.drivers_notified, created.dispatch.total_drivers
    );
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::with_message(created.booking, message)),
    ))
}

pub async fn list_bookings(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<BookingFilter>,
) -> AppResult<Json<ApiResponse<Vec<BookingResponse>>>> {
    let bookings = state.booking_service.list_bookings(filter).await?;
    Ok(Json(ApiResponse::ok(bookings)))
}

pub async fn get_booking(State(state): State<Arc<AppState>>, Path(booking_id): Path<String>) -> BookingReply {
    let booking = state.booking_service.get_booking(&booking_id).await?;
    Ok(Json(ApiResponse::ok(booking)))
}

pub async fn patch_booking(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<String>,
    Json(patch): Json<BookingPatch>,
) -> BookingReply {
    let booking = state.booking_service.patch_booking(&booking_id, patch).await?;
    Ok(Json(ApiResponse::ok(booking)))
}

pub async fn delete_booking(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<String>,
) -> AppResult<Json<ApiResponse<()>>> {
    state.booking_service.delete_booking(&booking_id).await?;
    Ok(Json(ApiResponse::message("Booking deleted")))
}

pub async fn accept_booking(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<String>,
    body: Option<Json<DriverAction>>,
) -> BookingReply {
    let driver_id = driver_id_of(body.map(|Json(b)| b))?;
    let booking = state.booking_service.accept_booking(&booking_id, &driver_id).await?;
    Ok(Json(ApiResponse::with_message(booking, "Booking accepted")))
}

pub async fn reject_booking(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<String>,
    body: Option<Json<DriverAction>>,
) -> BookingReply {
    let driver_id = driver_id_of(body.map(|Json(b)| b))?;
    let booking = state.booking_service.reject_booking(&booking_id, &driver_id).await?;
    Ok(Json(ApiResponse::with_message(booking, "Booking rejected")))
}

pub async fn start_trip(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<String>,
    body: Option<Json<DriverAction>>,
) -> BookingReply {
    let driver_id = body.and_then(|Json(b)| b.driver_id);
    let booking = state
        .booking_service
        .start_trip(&booking_id, driver_id.as_deref())
        .await?;
    Ok(Json(ApiResponse::with_message(booking, "Trip started")))
}

/// The code goes back in the body for the rider app to display.
pub async fn generate_otp(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<String>,
) -> AppResult<Json<ApiResponse<OtpResponse>>> {
    let otp = state.booking_service.generate_completion_otp(&booking_id).await?;
    Ok(Json(ApiResponse::ok(otp)))
}

pub async fn complete_booking(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<String>,
    body: Option<Json<CompleteRequest>>,
) -> BookingReply {
    let otp = body
        .and_then(|Json(b)| b.otp)
        .ok_or_else(|| AppError::missing_field("otp"))?;
    let booking = state.booking_service.complete_booking(&booking_id, &otp).await?;
    Ok(Json(ApiResponse::with_message(booking, "Trip completed")))
}

pub async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> BookingReply {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let booking = state.booking_service.cancel_booking(&booking_id, request).await?;
    Ok(Json(ApiResponse::with_message(booking, "Booking cancelled")))
}

pub async fn confirm_payment(
    State(state): State<Arc<AppState>>,
    Path(booking_id): Path<String>,
    Json(confirmation): Json<PaymentConfirmation>,
) -> BookingReply {
    let booking = state
        .booking_service
        .confirm_payment(&booking_id, confirmation)
        .await?;
    Ok(Json(ApiResponse::with_message(booking, "Payment recorded")))
}

pub async fn estimate_fare(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FareEstimateRequest>,
) -> AppResult<Json<ApiResponse<FareEstimateResponse>>> {
    let estimate = state.booking_service.estimate_fare(request).await?;
    Ok(Json(ApiResponse::ok(estimate)))
}
