// src/router.rs
use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers::{booking_handler, driver_handler, health};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        // Bookings
        .route(
            "/bookings",
            get(booking_handler::list_bookings).post(booking_handler::create_booking),
        )
        .route(
            "/bookings/:id",
            get(booking_handler::get_booking)
                .patch(booking_handler::patch_booking)
                .delete(booking_handler::delete_booking),
        )
        .route("/bookings/:id/accept", post(booking_handler::accept_booking))
        .route("/bookings/:id/reject", post(booking_handler::reject_booking))
        .route("/bookings/:id/start", post(booking_handler::start_trip))
        .route("/bookings/:id/generate-otp", post(booking_handler::generate_otp))
        .route("/bookings/:id/complete", post(booking_handler::complete_booking))
        .route("/bookings/:id/cancel", post(booking_handler::cancel_booking))
        .route("/bookings/:id/payment", post(booking_handler::confirm_payment))
        .route("/fares/estimate", post(booking_handler::estimate_fare))
        // Drivers
        .route("/drivers", post(driver_handler::register_driver))
        .route("/drivers/nearby", get(driver_handler::nearby_drivers))
        .route("/drivers/:id", get(driver_handler::get_driver))
        .route("/drivers/:id/location", put(driver_handler::update_location))
        .route("/drivers/:id/availability", put(driver_handler::update_availability))
        .route("/drivers/:id/status", put(driver_handler::update_status))
        .route("/drivers/:id/earnings", get(driver_handler::get_earnings))
        .route(
            "/drivers/:id/earnings/reconcile",
            post(driver_handler::reconcile_earnings),
        )
        .route("/drivers/:id/active-booking", get(driver_handler::active_booking))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
