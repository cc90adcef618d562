// src/services/booking_service.rs
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    errors::{AppError, AppResult, ValidationError},
    models::{
        AdditionalCharges, Booking, BookingFilter, BookingPatch, BookingResponse, BookingStatus, BookingUpdate,
        CancelRequest, Cancellation, CancelledBy, CompletionOtp, CreateBookingRequest, Driver,
        DriverEarning, DriverSnapshot, EarningKind, EarningStatus, FareBreakdown,
        FareEstimateRequest, FareEstimateResponse, GeoPoint, OtpResponse, Payment,
        PaymentConfirmation, PaymentStatus, Place, TripClass, TripSnapshot, TripType, VehicleClass,
    },
    services::{
        directions_service::DirectionsProvider,
        fare_service::compute_fare,
        geo_service::{Eligibility, GeoMatcher, MatchQuery},
        messaging_service::{DispatchReport, NotificationDispatcher, TripSummary},
    },
    store::{BookingStore, ClaimOutcome, DriverStore, EarningStore, Repository},
    utils::{
        id_generator::{IdGenerator, IdType},
        otp::{generate_numeric_otp, otp_matches},
    },
};

/// Tunables for the booking lifecycle.
#[derive(Debug, Clone)]
pub struct BookingPolicy {
    pub match_radius_m: f64,
    pub otp_ttl_minutes: i64,
    pub commission_percent: i64,
    pub max_trip_distance_km: f64,
    /// Skip drivers who rejected a booking when re-offering it after a
    /// driver cancellation.
    pub exclude_rejected_on_rematch: bool,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            match_radius_m: 10_000.0,
            otp_ttl_minutes: 10,
            commission_percent: 10,
            max_trip_distance_km: 2000.0,
            exclude_rejected_on_rematch: false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BookingCreated {
    pub booking: BookingResponse,
    pub dispatch: DispatchReport,
}

#[async_trait]
pub trait BookingOperations: Send + Sync {
    async fn create_booking(&self, request: CreateBookingRequest) -> AppResult<BookingCreated>;
    async fn get_booking(&self, booking_id: &str) -> AppResult<BookingResponse>;
    async fn list_bookings(&self, filter: BookingFilter) -> AppResult<Vec<BookingResponse>>;
    async fn update_booking(&self, booking_id: &str, update: BookingUpdate) -> AppResult<BookingResponse>;
    async fn patch_booking(&self, booking_id: &str, patch: BookingPatch) -> AppResult<BookingResponse>;
    async fn accept_booking(&self, booking_id: &str, driver_id: &str) -> AppResult<BookingResponse>;
    async fn reject_booking(&self, booking_id: &str, driver_id: &str) -> AppResult<BookingResponse>;
    async fn driver_cancel_booking(
        &self,
        booking_id: &str,
        driver_id: &str,
        reason: Option<String>,
    ) -> AppResult<BookingResponse>;
    async fn cancel_booking(&self, booking_id: &str, request: CancelRequest) -> AppResult<BookingResponse>;
    async fn start_trip(&self, booking_id: &str, driver_id: Option<&str>) -> AppResult<BookingResponse>;
    async fn generate_completion_otp(&self, booking_id: &str) -> AppResult<OtpResponse>;
    async fn complete_booking(&self, booking_id: &str, otp: &str) -> AppResult<BookingResponse>;
    async fn delete_booking(&self, booking_id: &str) -> AppResult<()>;
    async fn confirm_payment(&self, booking_id: &str, confirmation: PaymentConfirmation) -> AppResult<BookingResponse>;
    async fn estimate_fare(&self, request: FareEstimateRequest) -> AppResult<FareEstimateResponse>;
}

pub struct BookingService {
    repo: Arc<dyn Repository>,
    matcher: Arc<GeoMatcher>,
    dispatcher: Arc<NotificationDispatcher>,
    directions: Arc<dyn DirectionsProvider>,
    policy: BookingPolicy,
}

struct Pricing {
    fare: FareBreakdown,
    total_price: i64,
    service_charge: i64,
    driver_amount: i64,
}

fn percent_of(amount: i64, percent: i64) -> i64 {
    (amount as f64 * percent as f64 / 100.0).round() as i64
}

fn required(field: &str) -> ValidationError {
    ValidationError {
        field: field.to_string(),
        message: "is required".to_string(),
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ValidationError {
    ValidationError {
        field: field.to_string(),
        message: message.into(),
    }
}

fn validate_distance(distance_km: f64, max_km: f64) -> Result<(), ValidationError> {
    if !distance_km.is_finite() || distance_km <= 0.0 {
        return Err(invalid("distance_km", "Distance must be greater than zero"));
    }
    if distance_km > max_km {
        return Err(invalid("distance_km", format!("Distance must not exceed {} km", max_km)));
    }
    Ok(())
}

/// Round trips need a return date on or after the pickup date.
fn validate_schedule(
    is_round_trip: bool,
    pickup_date: NaiveDate,
    return_date: Option<NaiveDate>,
) -> Result<(), ValidationError> {
    if !is_round_trip {
        return Ok(());
    }
    match return_date {
        None => Err(invalid("return_date", "Return date is required for round trips")),
        Some(date) if date < pickup_date => {
            Err(invalid("return_date", "Return date cannot be before pickup date"))
        }
        Some(_) => Ok(()),
    }
}

fn validate_places(field: &str, places: &[&Place], errors: &mut Vec<ValidationError>) {
    for place in places {
        if !place.coordinates.is_valid() {
            errors.push(invalid(field, "Coordinates are out of range"));
            return;
        }
    }
}

fn require_text(value: Option<String>, field: &str) -> AppResult<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::missing_field(field))
}

fn driver_snapshot(driver: &Driver) -> DriverSnapshot {
    DriverSnapshot {
        name: driver.name.clone(),
        phone_number: driver.phone_number.clone(),
        vehicle_number: driver.vehicle.number.clone(),
        vehicle_model: driver.vehicle.model.clone(),
    }
}

fn assigned_driver(booking: &Booking) -> AppResult<String> {
    booking.driver_id.clone().ok_or_else(|| {
        AppError::internal_error(format!(
            "Booking {} is {} without a driver",
            booking.id, booking.status
        ))
    })
}

/// Only the assigned driver may hand an accepted booking back.
fn guard_release(booking: &Booking, driver_id: &str) -> AppResult<()> {
    if !booking.status.is_assigned() {
        return Err(AppError::InvalidTransition {
            from: booking.status,
            action: "cancel",
        });
    }
    if booking.driver_id.as_deref() != Some(driver_id) {
        return Err(AppError::DriverNotEligible(format!(
            "Driver {} is not assigned to booking {}",
            driver_id, booking.id
        )));
    }
    Ok(())
}

fn guard_start(booking: &Booking, driver_id: Option<&str>) -> AppResult<String> {
    if !booking.status.is_assigned() {
        return Err(AppError::InvalidTransition {
            from: booking.status,
            action: "start",
        });
    }
    let assigned = assigned_driver(booking)?;
    if let Some(driver_id) = driver_id {
        if driver_id != assigned {
            return Err(AppError::DriverNotEligible(format!(
                "Driver {} is not assigned to booking {}",
                driver_id, booking.id
            )));
        }
    }
    Ok(assigned)
}

fn guard_cancel(booking: &Booking) -> AppResult<()> {
    if booking.status.is_terminal() {
        return Err(AppError::InvalidTransition {
            from: booking.status,
            action: "cancel",
        });
    }
    Ok(())
}

fn booking_reference() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("TRP{}", raw[..8].to_uppercase())
}

impl BookingService {
    pub fn new(
        repo: Arc<dyn Repository>,
        matcher: Arc<GeoMatcher>,
        dispatcher: Arc<NotificationDispatcher>,
        directions: Arc<dyn DirectionsProvider>,
        policy: BookingPolicy,
    ) -> Self {
        Self {
            repo,
            matcher,
            dispatcher,
            directions,
            policy,
        }
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    fn otp_ttl(&self) -> Duration {
        Duration::minutes(self.policy.otp_ttl_minutes)
    }

    fn price(
        &self,
        distance_km: f64,
        vehicle_class: VehicleClass,
        is_round_trip: bool,
        extras: &AdditionalCharges,
    ) -> Pricing {
        let fare = compute_fare(distance_km, vehicle_class, is_round_trip);
        let total_price = fare.total + extras.parking + extras.waiting;
        let service_charge = percent_of(total_price, self.policy.commission_percent);
        Pricing {
            fare,
            total_price,
            service_charge,
            driver_amount: total_price - service_charge,
        }
    }

    fn apply_pricing(booking: &mut Booking, pricing: Pricing) {
        booking.base_price = pricing.fare.base_fare;
        booking.additional_charges.driver_allowance = pricing.fare.driver_allowance;
        booking.fare_breakdown = pricing.fare;
        booking.total_price = pricing.total_price;
        booking.service_charge = pricing.service_charge;
        booking.driver_amount = pricing.driver_amount;
        booking.payment.amount = pricing.total_price;
    }

    async fn load(&self, booking_id: &str) -> AppResult<Booking> {
        self.repo
            .get_booking(booking_id)
            .await?
            .ok_or_else(|| AppError::booking_not_found(booking_id))
    }

    /// Explains why a conditional write did not apply.
    async fn lost_write(&self, booking_id: &str, expected: BookingStatus, action: &'static str) -> AppError {
        match self.repo.get_booking(booking_id).await {
            Ok(None) => AppError::booking_not_found(booking_id),
            Ok(Some(current)) if current.status != expected => AppError::InvalidTransition {
                from: current.status,
                action,
            },
            Ok(Some(_)) => AppError::Conflict(format!("Booking {} was modified concurrently", booking_id)),
            Err(e) => e,
        }
    }

    /// Conditional write of a booking loaded at `expected` status. Bumps the
    /// revision so any other write based on the same load is refused.
    async fn commit(&self, booking: &mut Booking, expected: BookingStatus, action: &'static str) -> AppResult<()> {
        let loaded_revision = booking.revision;
        booking.revision = loaded_revision + 1;
        if self.repo.replace_booking_if(booking, expected, loaded_revision).await? {
            return Ok(());
        }
        Err(self.lost_write(&booking.id, expected, action).await)
    }

    async fn offer_to_nearby_drivers(&self, booking: &Booking, query: &MatchQuery) -> DispatchReport {
        let matches = match self
            .matcher
            .find_nearby_drivers(
                booking.source.coordinates,
                self.policy.match_radius_m,
                Eligibility::Active,
                query,
            )
            .await
        {
            Ok(matches) => matches,
            Err(e) => {
                tracing::error!("Driver matching failed for booking {}: {}", booking.id, e);
                return DispatchReport::default();
            }
        };

        let drivers: Vec<Driver> = matches.into_iter().map(|m| m.driver).collect();
        self.dispatcher
            .notify_drivers(&TripSummary::from(booking), &drivers)
            .await
    }

    async fn record_earning(
        &self,
        booking: &Booking,
        driver_id: &str,
        amount: i64,
        kind: EarningKind,
        trips: u32,
    ) -> AppResult<()> {
        let entry = DriverEarning {
            id: IdGenerator::generate(IdType::Earning),
            driver_id: driver_id.to_string(),
            booking_id: booking.id.clone(),
            amount,
            kind,
            status: EarningStatus::Credited,
            trip: TripSnapshot {
                source: booking.source.address.clone(),
                destination: booking.destination.address.clone(),
                distance_km: booking.distance_km,
                customer_id: booking.user_id.clone(),
                vehicle_class: booking.vehicle_class,
            },
            created_at: Utc::now(),
        };

        match self.repo.append_earning(&entry).await {
            Ok(()) => {}
            Err(AppError::Conflict(msg)) => {
                tracing::warn!("Ledger entry skipped: {}", msg);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        tracing::info!("Credited {} {} to driver {} for {}", kind, amount, driver_id, booking.id);
        self.repo.credit_driver(driver_id, amount, trips).await
    }

    async fn guard_accept(&self, booking: &Booking, driver_id: &str) -> AppResult<Driver> {
        if booking.status != BookingStatus::Pending {
            return Err(AppError::InvalidTransition {
                from: booking.status,
                action: "accept",
            });
        }
        let driver = self
            .repo
            .get_driver(driver_id)
            .await?
            .ok_or_else(|| AppError::driver_not_found(driver_id))?;
        if !driver.status.can_take_bookings() {
            return Err(AppError::DriverNotEligible(format!(
                "Driver {} is not approved for trips",
                driver_id
            )));
        }
        Ok(driver)
    }

    /// Completion checks in order: code present, trip underway, code fresh,
    /// code matches. Returns the assigned driver.
    fn guard_complete(&self, booking: &Booking, otp: &str) -> AppResult<String> {
        let status = booking.status;
        let Some(stored) = booking.completion_otp.as_ref() else {
            return Err(AppError::OtpNotGenerated);
        };
        if !status.is_underway() {
            return Err(AppError::InvalidTransition { from: status, action: "complete" });
        }
        if Utc::now() - stored.generated_at > self.otp_ttl() {
            return Err(AppError::OtpExpired);
        }
        if !otp_matches(&stored.code, otp) {
            tracing::warn!("OTP mismatch on booking {}", booking.id);
            return Err(AppError::OtpMismatch);
        }
        assigned_driver(booking)
    }

    /// Runs the guards of a PATCH status change without writing anything.
    async fn check_transition(
        &self,
        booking: &Booking,
        target: BookingStatus,
        driver_id: Option<&str>,
        otp: Option<&str>,
        cancelled_by: Option<CancelledBy>,
    ) -> AppResult<()> {
        let text = |value: Option<&str>, field: &str| require_text(value.map(str::to_string), field);
        match target {
            BookingStatus::Accepted | BookingStatus::Confirmed => {
                let driver_id = text(driver_id, "driver_id")?;
                self.guard_accept(booking, &driver_id).await.map(|_| ())
            }
            BookingStatus::Pending => {
                if !booking.status.is_assigned() {
                    return Err(AppError::InvalidTransition {
                        from: booking.status,
                        action: "release",
                    });
                }
                let driver_id = text(driver_id.or(booking.driver_id.as_deref()), "driver_id")?;
                guard_release(booking, &driver_id)
            }
            BookingStatus::Started | BookingStatus::InProgress => guard_start(booking, driver_id).map(|_| ()),
            BookingStatus::Completed => {
                let otp = text(otp, "otp")?;
                self.guard_complete(booking, &otp).map(|_| ())
            }
            BookingStatus::Cancelled => {
                if cancelled_by == Some(CancelledBy::Driver) {
                    let driver_id = text(driver_id, "driver_id")?;
                    guard_release(booking, &driver_id)
                } else {
                    guard_cancel(booking)
                }
            }
        }
    }

    async fn transition_to(
        &self,
        booking_id: &str,
        target: BookingStatus,
        driver_id: Option<String>,
        otp: Option<String>,
        reason: Option<String>,
        cancelled_by: Option<CancelledBy>,
    ) -> AppResult<BookingResponse> {
        match target {
            BookingStatus::Accepted | BookingStatus::Confirmed => {
                let driver_id = require_text(driver_id, "driver_id")?;
                self.accept_booking(booking_id, &driver_id).await
            }
            BookingStatus::Pending => {
                let booking = self.load(booking_id).await?;
                if !booking.status.is_assigned() {
                    return Err(AppError::InvalidTransition {
                        from: booking.status,
                        action: "release",
                    });
                }
                let driver_id = require_text(driver_id.or(booking.driver_id), "driver_id")?;
                self.driver_cancel_booking(booking_id, &driver_id, reason).await
            }
            BookingStatus::Started | BookingStatus::InProgress => {
                self.start_trip(booking_id, driver_id.as_deref()).await
            }
            BookingStatus::Completed => {
                let otp = require_text(otp, "otp")?;
                self.complete_booking(booking_id, &otp).await
            }
            BookingStatus::Cancelled => {
                let request = CancelRequest {
                    reason,
                    cancelled_by: Some(cancelled_by.unwrap_or(CancelledBy::User)),
                    driver_id,
                };
                self.cancel_booking(booking_id, request).await
            }
        }
    }
}

#[async_trait]
impl BookingOperations for BookingService {
    async fn create_booking(&self, request: CreateBookingRequest) -> AppResult<BookingCreated> {
        let CreateBookingRequest {
            user_id,
            trip_type,
            booking_type,
            trip_class,
            source,
            destination,
            stops,
            pickup_date,
            pickup_time,
            return_date,
            is_round_trip,
            vehicle_type,
            distance_km,
            duration_min,
            parking_charges,
            waiting_charges,
            payment_method,
        } = request;

        let mut errors = Vec::new();

        let user_id = user_id.map(|u| u.trim().to_string()).filter(|u| !u.is_empty());
        let pickup_time = pickup_time.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        for (field, present) in [
            ("user_id", user_id.is_some()),
            ("source", source.is_some()),
            ("destination", destination.is_some()),
            ("pickup_date", pickup_date.is_some()),
            ("pickup_time", pickup_time.is_some()),
        ] {
            if !present {
                errors.push(required(field));
            }
        }

        let trip_type = match (trip_type, booking_type.as_deref()) {
            (Some(trip_type), _) => trip_type,
            (None, Some(legacy)) => TripType::from_legacy(legacy).unwrap_or_else(|| {
                errors.push(invalid("booking_type", format!("Unknown booking type '{}'", legacy)));
                TripType::Ride
            }),
            (None, None) => TripType::default(),
        };

        if let Some(source) = &source {
            validate_places("source", &[source], &mut errors);
        }
        if let Some(destination) = &destination {
            validate_places("destination", &[destination], &mut errors);
        }
        validate_places("stops", &stops.iter().collect::<Vec<_>>(), &mut errors);

        let parking = parking_charges.unwrap_or(0);
        let waiting = waiting_charges.unwrap_or(0);
        if parking < 0 {
            errors.push(invalid("parking_charges", "Must not be negative"));
        }
        if waiting < 0 {
            errors.push(invalid("waiting_charges", "Must not be negative"));
        }

        if let Some(pickup_date) = pickup_date {
            if let Err(e) = validate_schedule(is_round_trip, pickup_date, return_date) {
                errors.push(e);
            }
        }

        let (Some(user_id), Some(source), Some(destination), Some(pickup_date), Some(pickup_time)) =
            (user_id, source, destination, pickup_date, pickup_time)
        else {
            return Err(AppError::ValidationFailed(errors));
        };
        if !errors.is_empty() {
            return Err(AppError::ValidationFailed(errors));
        }

        let (distance_km, duration_min) = match distance_km {
            Some(distance_km) => (distance_km, duration_min),
            None => {
                let waypoints: Vec<GeoPoint> = stops.iter().map(|s| s.coordinates).collect();
                let route = self
                    .directions
                    .route(source.coordinates, destination.coordinates, &waypoints)
                    .await
                    .map_err(|e| {
                        tracing::warn!("Route lookup failed: {}", e);
                        AppError::validation_error("distance_km", "Distance could not be determined, supply distance_km")
                    })?;
                (route.distance_km, duration_min.or(Some(route.duration_min)))
            }
        };
        validate_distance(distance_km, self.policy.max_trip_distance_km)
            .map_err(|e| AppError::ValidationFailed(vec![e]))?;

        let vehicle_class = vehicle_type
            .as_deref()
            .map(VehicleClass::from_name)
            .unwrap_or_default();
        let additional_charges = AdditionalCharges {
            driver_allowance: 0,
            parking,
            waiting,
        };
        let pricing = self.price(distance_km, vehicle_class, is_round_trip, &additional_charges);

        let now = Utc::now();
        let mut booking = Booking {
            id: IdGenerator::generate(IdType::Booking),
            reference: booking_reference(),
            user_id,
            driver_id: None,
            driver: None,
            trip_type,
            trip_class: trip_class.unwrap_or_else(|| TripClass::from_distance(distance_km)),
            source,
            destination,
            stops,
            pickup_date,
            pickup_time,
            return_date,
            is_round_trip,
            vehicle_class,
            distance_km,
            duration_min,
            base_price: 0,
            service_charge: 0,
            driver_amount: 0,
            additional_charges,
            total_price: 0,
            fare_breakdown: FareBreakdown::default(),
            payment: Payment {
                method: payment_method.unwrap_or_default(),
                ..Payment::default()
            },
            status: BookingStatus::Pending,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancellation: None,
            rejected_drivers: Vec::new(),
            completion_otp: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        };
        Self::apply_pricing(&mut booking, pricing);

        self.repo.insert_booking(&booking).await?;
        tracing::info!(
            "Booking created: {} ({}, {:.1} km, total {})",
            booking.id,
            booking.trip_type.kind(),
            booking.distance_km,
            booking.total_price
        );

        let dispatch = self.offer_to_nearby_drivers(&booking, &MatchQuery::default()).await;

        Ok(BookingCreated {
            booking: booking.into(),
            dispatch,
        })
    }

    async fn get_booking(&self, booking_id: &str) -> AppResult<BookingResponse> {
        tracing::debug!("Getting booking: {}", booking_id);
        Ok(self.load(booking_id).await?.into())
    }

    async fn list_bookings(&self, filter: BookingFilter) -> AppResult<Vec<BookingResponse>> {
        let bookings = self.repo.list_bookings(&filter).await?;
        tracing::debug!("Listed {} bookings", bookings.len());
        Ok(bookings.into_iter().map(BookingResponse::from).collect())
    }

    async fn update_booking(&self, booking_id: &str, update: BookingUpdate) -> AppResult<BookingResponse> {
        let booking = self.load(booking_id).await?;
        let status = booking.status;
        if status.is_terminal() {
            return Err(AppError::InvalidTransition { from: status, action: "update" });
        }
        if update.is_empty() {
            return Err(AppError::validation_error("body", "No updatable fields supplied"));
        }

        let mut updated = booking;
        if let Some(stops) = update.stops {
            let mut errors = Vec::new();
            validate_places("stops", &stops.iter().collect::<Vec<_>>(), &mut errors);
            if !errors.is_empty() {
                return Err(AppError::ValidationFailed(errors));
            }
            updated.stops = stops;
        }
        if let Some(pickup_date) = update.pickup_date {
            updated.pickup_date = pickup_date;
        }
        if let Some(pickup_time) = update.pickup_time {
            updated.pickup_time = require_text(Some(pickup_time), "pickup_time")?;
        }
        if let Some(return_date) = update.return_date {
            updated.return_date = Some(return_date);
        }
        if let Some(is_round_trip) = update.is_round_trip {
            if is_round_trip != updated.is_round_trip {
                // The fare doubles or halves, which only the rider may still agree to
                if status != BookingStatus::Pending {
                    return Err(AppError::validation_error(
                        "is_round_trip",
                        "Round trip can only be changed before a driver accepts",
                    ));
                }
                updated.is_round_trip = is_round_trip;
                let pricing = self.price(
                    updated.distance_km,
                    updated.vehicle_class,
                    is_round_trip,
                    &updated.additional_charges,
                );
                Self::apply_pricing(&mut updated, pricing);
            }
        }

        validate_schedule(updated.is_round_trip, updated.pickup_date, updated.return_date)
            .map_err(|e| AppError::ValidationFailed(vec![e]))?;

        updated.updated_at = Utc::now();
        self.commit(&mut updated, status, "update").await?;
        tracing::info!("Booking {} updated", booking_id);
        Ok(updated.into())
    }

    async fn patch_booking(&self, booking_id: &str, patch: BookingPatch) -> AppResult<BookingResponse> {
        let BookingPatch {
            status,
            driver_id,
            otp,
            reason,
            cancelled_by,
            update,
        } = patch;

        // A status change that would be refused must not leave field edits behind
        if let (Some(target), false) = (status, update.is_empty()) {
            let current = self.load(booking_id).await?;
            self.check_transition(&current, target, driver_id.as_deref(), otp.as_deref(), cancelled_by)
                .await?;
        }

        let mut latest = None;
        if !update.is_empty() {
            latest = Some(self.update_booking(booking_id, update).await?);
        }

        match (status, latest) {
            (Some(target), _) => {
                self.transition_to(booking_id, target, driver_id, otp, reason, cancelled_by)
                    .await
            }
            (None, Some(updated)) => Ok(updated),
            (None, None) => Err(AppError::validation_error("status", "Nothing to update")),
        }
    }

    async fn accept_booking(&self, booking_id: &str, driver_id: &str) -> AppResult<BookingResponse> {
        let booking = self.load(booking_id).await?;
        let driver = self.guard_accept(&booking, driver_id).await?;

        let now = Utc::now();
        let loaded_revision = booking.revision;
        let mut accepted = booking;
        accepted.revision = loaded_revision + 1;
        accepted.driver_id = Some(driver.id.clone());
        accepted.driver = Some(driver_snapshot(&driver));
        accepted.status = accepted.trip_type.accepted_status();
        accepted.accepted_at = Some(now);
        let advance = percent_of(accepted.total_price, accepted.trip_type.advance_percent());
        accepted.payment.advance_amount = advance;
        accepted.payment.remaining_amount = accepted.total_price - advance;
        accepted.updated_at = now;

        match self.repo.claim_booking(&accepted, loaded_revision).await? {
            ClaimOutcome::Claimed => {
                tracing::info!(
                    "Booking {} {} by driver {} (advance {})",
                    booking_id,
                    accepted.status,
                    driver_id,
                    advance
                );
                Ok(accepted.into())
            }
            ClaimOutcome::Missing => Err(AppError::booking_not_found(booking_id)),
            ClaimOutcome::StatusChanged(status) => {
                tracing::info!("Driver {} lost the race for booking {}", driver_id, booking_id);
                Err(AppError::InvalidTransition { from: status, action: "accept" })
            }
            ClaimOutcome::DriverBusy => {
                tracing::warn!("Driver {} already holds an active booking", driver_id);
                Err(AppError::DriverBusy)
            }
            ClaimOutcome::Stale => Err(AppError::Conflict(format!(
                "Booking {} was modified concurrently",
                booking_id
            ))),
        }
    }

    async fn reject_booking(&self, booking_id: &str, driver_id: &str) -> AppResult<BookingResponse> {
        let booking = self.load(booking_id).await?;
        let status = booking.status;
        if !matches!(
            status,
            BookingStatus::Pending | BookingStatus::Accepted | BookingStatus::Confirmed
        ) {
            return Err(AppError::InvalidTransition { from: status, action: "reject" });
        }
        // The assigned driver has to cancel instead
        if booking.driver_id.as_deref() == Some(driver_id) {
            return Err(AppError::InvalidTransition { from: status, action: "reject" });
        }
        if booking.rejected_drivers.iter().any(|d| d == driver_id) {
            return Ok(booking.into());
        }

        let mut updated = booking;
        updated.rejected_drivers.push(driver_id.to_string());
        updated.updated_at = Utc::now();
        self.commit(&mut updated, status, "reject").await?;

        tracing::info!("Driver {} rejected booking {}", driver_id, booking_id);
        Ok(updated.into())
    }

    async fn driver_cancel_booking(
        &self,
        booking_id: &str,
        driver_id: &str,
        reason: Option<String>,
    ) -> AppResult<BookingResponse> {
        let booking = self.load(booking_id).await?;
        let status = booking.status;
        guard_release(&booking, driver_id)?;

        let now = Utc::now();
        let mut released = booking;
        released.status = BookingStatus::Pending;
        released.driver_id = None;
        released.driver = None;
        released.accepted_at = None;
        released.payment = Payment {
            method: released.payment.method,
            amount: released.total_price,
            ..Payment::default()
        };
        released.cancellation = Some(Cancellation {
            reason,
            cancelled_by: CancelledBy::Driver,
            driver_id: Some(driver_id.to_string()),
            at: now,
        });
        released.updated_at = now;
        self.commit(&mut released, status, "cancel").await?;
        tracing::info!("Driver {} released booking {}", driver_id, booking_id);

        let mut query = MatchQuery::default();
        query.exclude.insert(driver_id.to_string());
        if self.policy.exclude_rejected_on_rematch {
            query.exclude.extend(released.rejected_drivers.iter().cloned());
        }
        let dispatch = self.offer_to_nearby_drivers(&released, &query).await;
        tracing::debug!(
            "Booking {} re-offered to {} drivers",
            booking_id,
            dispatch.drivers_notified
        );

        Ok(released.into())
    }

    async fn cancel_booking(&self, booking_id: &str, request: CancelRequest) -> AppResult<BookingResponse> {
        let cancelled_by = request.cancelled_by.unwrap_or(CancelledBy::User);
        if cancelled_by == CancelledBy::Driver {
            let driver_id = require_text(request.driver_id, "driver_id")?;
            return self
                .driver_cancel_booking(booking_id, &driver_id, request.reason)
                .await;
        }

        let booking = self.load(booking_id).await?;
        let status = booking.status;
        guard_cancel(&booking)?;

        let now = Utc::now();
        let mut cancelled = booking;
        cancelled.status = BookingStatus::Cancelled;
        cancelled.cancelled_at = Some(now);
        cancelled.cancellation = Some(Cancellation {
            reason: request.reason,
            cancelled_by,
            driver_id: cancelled.driver_id.clone(),
            at: now,
        });
        cancelled.completion_otp = None;
        cancelled.updated_at = now;
        self.commit(&mut cancelled, status, "cancel").await?;

        tracing::info!("Booking {} cancelled from {}", booking_id, status);
        Ok(cancelled.into())
    }

    async fn start_trip(&self, booking_id: &str, driver_id: Option<&str>) -> AppResult<BookingResponse> {
        let booking = self.load(booking_id).await?;
        let status = booking.status;
        let assigned = guard_start(&booking, driver_id)?;

        let now = Utc::now();
        let mut started = booking;
        started.status = BookingStatus::Started;
        started.started_at = Some(now);
        if started.payment.advance_amount > 0 {
            started.payment.status = PaymentStatus::PartiallyPaid;
        }
        started.updated_at = now;
        self.commit(&mut started, status, "start").await?;
        tracing::info!("Trip started for booking {}", booking_id);

        let advance = started.payment.advance_amount;
        if advance > 0 {
            self.record_earning(&started, &assigned, advance, EarningKind::AdvancePayment, 0)
                .await?;
        }

        Ok(started.into())
    }

    async fn generate_completion_otp(&self, booking_id: &str) -> AppResult<OtpResponse> {
        let booking = self.load(booking_id).await?;
        let status = booking.status;
        if !status.is_underway() {
            return Err(AppError::InvalidTransition {
                from: status,
                action: "generate an OTP for",
            });
        }

        let now = Utc::now();
        let code = generate_numeric_otp();
        let mut updated = booking;
        updated.completion_otp = Some(CompletionOtp {
            code: code.clone(),
            generated_at: now,
        });
        updated.updated_at = now;
        self.commit(&mut updated, status, "generate an OTP for").await?;

        tracing::info!("Completion OTP generated for booking {}", booking_id);
        Ok(OtpResponse {
            booking_id: booking_id.to_string(),
            otp: code,
            generated_at: now,
            expires_at: now + self.otp_ttl(),
        })
    }

    async fn complete_booking(&self, booking_id: &str, otp: &str) -> AppResult<BookingResponse> {
        let booking = self.load(booking_id).await?;
        let status = booking.status;
        let driver_id = self.guard_complete(&booking, otp)?;

        let remaining = booking.remaining_driver_amount();

        let now = Utc::now();
        let mut completed = booking;
        completed.status = BookingStatus::Completed;
        completed.completed_at = Some(now);
        completed.completion_otp = None;
        completed.payment.status = PaymentStatus::Paid;
        completed.payment.amount = completed.total_price;
        completed.payment.remaining_amount = 0;
        completed.payment.paid_at.get_or_insert(now);
        completed.updated_at = now;
        self.commit(&mut completed, status, "complete").await?;
        tracing::info!("Booking {} completed", booking_id);

        if remaining > 0 {
            self.record_earning(&completed, &driver_id, remaining, EarningKind::TripCompletion, 1)
                .await?;
        } else {
            self.repo.credit_driver(&driver_id, 0, 1).await?;
        }

        Ok(completed.into())
    }

    async fn delete_booking(&self, booking_id: &str) -> AppResult<()> {
        let booking = self.load(booking_id).await?;
        if booking.status != BookingStatus::Pending {
            return Err(AppError::InvalidTransition {
                from: booking.status,
                action: "delete",
            });
        }
        if !self.repo.delete_booking_if(booking_id, BookingStatus::Pending).await? {
            return Err(self.lost_write(booking_id, BookingStatus::Pending, "delete").await);
        }

        tracing::info!("Booking {} deleted", booking_id);
        Ok(())
    }

    async fn confirm_payment(&self, booking_id: &str, confirmation: PaymentConfirmation) -> AppResult<BookingResponse> {
        let booking = self.load(booking_id).await?;
        let status = booking.status;
        if status == BookingStatus::Cancelled {
            return Err(AppError::InvalidTransition {
                from: status,
                action: "record a payment for",
            });
        }
        if booking.payment.status == PaymentStatus::Paid && booking.payment.transaction_id.is_some() {
            return Err(AppError::Conflict(format!(
                "Payment for booking {} is already recorded",
                booking_id
            )));
        }

        let amount = confirmation.amount.unwrap_or(booking.total_price);
        if amount < 0 {
            return Err(AppError::validation_error("amount", "Must not be negative"));
        }

        let now = Utc::now();
        let mut paid = booking;
        if let Some(method) = confirmation.method {
            paid.payment.method = method;
        }
        paid.payment.transaction_id = confirmation.transaction_id;
        paid.payment.status = PaymentStatus::Paid;
        paid.payment.amount = amount;
        paid.payment.remaining_amount = 0;
        paid.payment.paid_at = Some(now);
        paid.updated_at = now;
        self.commit(&mut paid, status, "record a payment for").await?;

        tracing::info!("Payment recorded for booking {}", booking_id);
        Ok(paid.into())
    }

    async fn estimate_fare(&self, request: FareEstimateRequest) -> AppResult<FareEstimateResponse> {
        let distance_km = request
            .distance_km
            .ok_or_else(|| AppError::missing_field("distance_km"))?;
        validate_distance(distance_km, self.policy.max_trip_distance_km)
            .map_err(|e| AppError::ValidationFailed(vec![e]))?;

        let vehicle_class = request
            .vehicle_type
            .as_deref()
            .map(VehicleClass::from_name)
            .unwrap_or_default();

        Ok(FareEstimateResponse {
            distance_km,
            vehicle_class,
            is_round_trip: request.is_round_trip,
            fare: compute_fare(distance_km, vehicle_class, request.is_round_trip),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DriverStatus, Vehicle};
    use crate::services::directions_service::HaversineDirections;
    use crate::services::messaging_service::{BatchOutcome, PushMessage, PushProvider};
    use crate::store::{MemorySpatialIndex, MemoryStore, SpatialIndex};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingPush {
        batches: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl PushProvider for RecordingPush {
        async fn send_batch(&self, messages: Vec<PushMessage>) -> AppResult<BatchOutcome> {
            let tokens: Vec<String> = messages.into_iter().map(|m| m.device_token).collect();
            let outcome = BatchOutcome {
                success_count: tokens.len(),
                failure_count: 0,
            };
            self.batches.lock().await.push(tokens);
            Ok(outcome)
        }
    }

    /// Yields after every booking read so concurrent operations all load
    /// before any of them writes.
    struct InterleavingStore {
        inner: Arc<MemoryStore>,
        claims: AtomicUsize,
    }

    #[async_trait]
    impl BookingStore for InterleavingStore {
        async fn insert_booking(&self, booking: &Booking) -> AppResult<()> {
            self.inner.insert_booking(booking).await
        }

        async fn get_booking(&self, booking_id: &str) -> AppResult<Option<Booking>> {
            let booking = self.inner.get_booking(booking_id).await;
            tokio::task::yield_now().await;
            booking
        }

        async fn list_bookings(&self, filter: &BookingFilter) -> AppResult<Vec<Booking>> {
            self.inner.list_bookings(filter).await
        }

        async fn replace_booking_if(
            &self,
            booking: &Booking,
            expected: BookingStatus,
            expected_revision: u64,
        ) -> AppResult<bool> {
            self.inner.replace_booking_if(booking, expected, expected_revision).await
        }

        async fn claim_booking(&self, booking: &Booking, expected_revision: u64) -> AppResult<ClaimOutcome> {
            self.claims.fetch_add(1, Ordering::SeqCst);
            self.inner.claim_booking(booking, expected_revision).await
        }

        async fn delete_booking_if(&self, booking_id: &str, expected: BookingStatus) -> AppResult<bool> {
            self.inner.delete_booking_if(booking_id, expected).await
        }

        async fn active_booking_for_driver(&self, driver_id: &str) -> AppResult<Option<Booking>> {
            self.inner.active_booking_for_driver(driver_id).await
        }
    }

    #[async_trait]
    impl DriverStore for InterleavingStore {
        async fn insert_driver(&self, driver: &Driver) -> AppResult<()> {
            self.inner.insert_driver(driver).await
        }

        async fn get_driver(&self, driver_id: &str) -> AppResult<Option<Driver>> {
            self.inner.get_driver(driver_id).await
        }

        async fn list_drivers(&self) -> AppResult<Vec<Driver>> {
            self.inner.list_drivers().await
        }

        async fn update_driver(&self, driver: &Driver) -> AppResult<()> {
            self.inner.update_driver(driver).await
        }

        async fn credit_driver(&self, driver_id: &str, amount: i64, trips: u32) -> AppResult<()> {
            self.inner.credit_driver(driver_id, amount, trips).await
        }

        async fn set_driver_totals(&self, driver_id: &str, total_earnings: i64, total_trips: u32) -> AppResult<()> {
            self.inner.set_driver_totals(driver_id, total_earnings, total_trips).await
        }
    }

    #[async_trait]
    impl EarningStore for InterleavingStore {
        async fn append_earning(&self, earning: &DriverEarning) -> AppResult<()> {
            self.inner.append_earning(earning).await
        }

        async fn list_earnings(&self, driver_id: &str) -> AppResult<Vec<DriverEarning>> {
            self.inner.list_earnings(driver_id).await
        }

        async fn list_booking_earnings(&self, booking_id: &str) -> AppResult<Vec<DriverEarning>> {
            self.inner.list_booking_earnings(booking_id).await
        }
    }

    struct Harness {
        service: BookingService,
        store: Arc<MemoryStore>,
        index: Arc<MemorySpatialIndex>,
        push: Arc<RecordingPush>,
        interleaving: Option<Arc<InterleavingStore>>,
    }

    impl Harness {
        fn new(policy: BookingPolicy) -> Self {
            Self::build(policy, false)
        }

        /// Service reads go through `InterleavingStore`; `store` still
        /// reaches the documents directly.
        fn interleaving(policy: BookingPolicy) -> Self {
            Self::build(policy, true)
        }

        fn build(policy: BookingPolicy, interleave: bool) -> Self {
            let store = Arc::new(MemoryStore::new());
            let index = Arc::new(MemorySpatialIndex::new());
            let push = Arc::new(RecordingPush::default());
            let interleaving = interleave.then(|| {
                Arc::new(InterleavingStore {
                    inner: store.clone(),
                    claims: AtomicUsize::new(0),
                })
            });
            let repo: Arc<dyn Repository> = match &interleaving {
                Some(wrapper) => wrapper.clone(),
                None => store.clone(),
            };
            let matcher = Arc::new(GeoMatcher::new(Some(index.clone()), store.clone(), 50));
            let dispatcher = Arc::new(NotificationDispatcher::new(Some(push.clone())));
            let service = BookingService::new(
                repo,
                matcher,
                dispatcher,
                Arc::new(HaversineDirections::new(40.0)),
                policy,
            );
            Self {
                service,
                store,
                index,
                push,
                interleaving,
            }
        }

        fn claim_calls(&self) -> usize {
            self.interleaving
                .as_ref()
                .map_or(0, |w| w.claims.load(Ordering::SeqCst))
        }

        async fn add_driver(&self, id: &str, lat: f64, lng: f64) {
            let now = Utc::now();
            let driver = Driver {
                id: id.to_string(),
                name: format!("Driver {}", id),
                phone_number: "+919845000000".to_string(),
                vehicle: Vehicle {
                    number: format!("KA01{}", id.to_uppercase()),
                    model: "Swift Dzire".to_string(),
                    class: VehicleClass::Sedan,
                },
                status: DriverStatus::Active,
                current_location: Some(GeoPoint::new(lat, lng)),
                location_updated_at: Some(now),
                is_online: true,
                is_available: true,
                push_token: Some(format!("push-{}", id)),
                rating: 4.7,
                total_trips: 0,
                total_earnings: 0,
                created_at: now,
                updated_at: now,
            };
            self.store.insert_driver(&driver).await.unwrap();
            self.index.update_location(id, GeoPoint::new(lat, lng)).await.unwrap();
        }

        async fn create(&self, request: CreateBookingRequest) -> BookingResponse {
            self.service.create_booking(request).await.unwrap().booking
        }
    }

    fn place(name: &str, lat: f64, lng: f64) -> Place {
        Place {
            name: name.to_string(),
            address: format!("{}, Karnataka", name),
            coordinates: GeoPoint::new(lat, lng),
        }
    }

    fn ride_request(distance_km: Option<f64>) -> CreateBookingRequest {
        CreateBookingRequest {
            user_id: Some("usr-261018-a1b2c".to_string()),
            source: Some(place("MG Road", 12.9756, 77.6050)),
            destination: Some(place("Mysuru Palace", 12.3052, 76.6552)),
            pickup_date: NaiveDate::from_ymd_opt(2026, 11, 2),
            pickup_time: Some("09:30".to_string()),
            vehicle_type: Some("sedan".to_string()),
            distance_km,
            ..Default::default()
        }
    }

    fn validation_fields(err: AppError) -> Vec<String> {
        match err {
            AppError::ValidationFailed(errors) => errors.into_iter().map(|e| e.field).collect(),
            other => panic!("expected validation failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_prices_and_offers_to_nearby_drivers() {
        let h = Harness::new(BookingPolicy::default());
        h.add_driver("d1", 12.9716, 77.5946).await;
        h.add_driver("d2", 12.9800, 77.6100).await;
        h.add_driver("far", 13.3000, 77.5946).await;

        let created = h.service.create_booking(ride_request(Some(120.0))).await.unwrap();
        let booking = created.booking;

        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(booking.fare_breakdown.total, 2218);
        assert_eq!(booking.total_price, 2218);
        assert_eq!(booking.service_charge, 222);
        assert_eq!(booking.driver_amount, 1996);
        assert_eq!(booking.base_price, 1440);
        assert_eq!(booking.additional_charges.driver_allowance, 240);
        assert_eq!(booking.trip_class, TripClass::Outstation);
        assert!(booking.reference.starts_with("TRP"));
        assert!(IdGenerator::validate_id(&booking.id, Some(IdType::Booking)));

        assert_eq!(created.dispatch, DispatchReport { drivers_notified: 2, total_drivers: 2 });
        let batches = h.push.batches.lock().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec!["push-d2".to_string(), "push-d1".to_string()]);
    }

    #[tokio::test]
    async fn test_create_without_drivers_still_succeeds() {
        let h = Harness::new(BookingPolicy::default());
        let created = h.service.create_booking(ride_request(Some(12.0))).await.unwrap();
        assert_eq!(created.dispatch, DispatchReport::default());
        assert_eq!(created.booking.trip_class, TripClass::City);
        // Extras ride on top of the fare
        let mut request = ride_request(Some(12.0));
        request.parking_charges = Some(50);
        request.waiting_charges = Some(30);
        let booking = h.create(request).await;
        assert_eq!(booking.total_price, created.booking.total_price + 80);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_requests() {
        let h = Harness::new(BookingPolicy::default());

        let err = h.service.create_booking(CreateBookingRequest::default()).await.unwrap_err();
        let fields = validation_fields(err);
        for field in ["user_id", "source", "destination", "pickup_date", "pickup_time"] {
            assert!(fields.contains(&field.to_string()), "missing {}", field);
        }

        let mut request = ride_request(Some(50.0));
        request.is_round_trip = true;
        let err = h.service.create_booking(request).await.unwrap_err();
        assert_eq!(validation_fields(err), vec!["return_date"]);

        let mut request = ride_request(Some(50.0));
        request.is_round_trip = true;
        request.return_date = NaiveDate::from_ymd_opt(2026, 11, 1);
        let err = h.service.create_booking(request).await.unwrap_err();
        assert_eq!(validation_fields(err), vec!["return_date"]);

        for distance in [0.0, -3.0, 2000.5] {
            let err = h.service.create_booking(ride_request(Some(distance))).await.unwrap_err();
            assert_eq!(validation_fields(err), vec!["distance_km"]);
        }

        let mut request = ride_request(Some(50.0));
        request.booking_type = Some("hovercraft".to_string());
        let err = h.service.create_booking(request).await.unwrap_err();
        assert_eq!(validation_fields(err), vec!["booking_type"]);

        assert!(h.store.list_bookings(&BookingFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_estimates_missing_distance() {
        let h = Harness::new(BookingPolicy::default());
        let request = ride_request(None);
        let booking = h.create(request).await;
        assert!((120.0..140.0).contains(&booking.distance_km), "{}", booking.distance_km);
        assert!(booking.duration_min.unwrap() > 120);
    }

    #[tokio::test]
    async fn test_concurrent_accepts_have_one_winner() {
        let h = Harness::interleaving(BookingPolicy::default());
        h.add_driver("d1", 12.9716, 77.5946).await;
        h.add_driver("d2", 12.9720, 77.5950).await;
        let booking = h.create(ride_request(Some(120.0))).await;

        let (first, second) = tokio::join!(
            h.service.accept_booking(&booking.id, "d1"),
            h.service.accept_booking(&booking.id, "d2"),
        );

        // Both passed the pending check, so the store decided
        assert_eq!(h.claim_calls(), 2);
        let winners = [&first, &second].iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        let (winner, loser) = if first.is_ok() { (first, second) } else { (second, first) };
        assert!(matches!(
            loser,
            Err(AppError::InvalidTransition { from: BookingStatus::Accepted, action: "accept" })
        ));

        let stored = h.store.get_booking(&booking.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BookingStatus::Accepted);
        assert_eq!(stored.driver_id, winner.unwrap().driver_id);
        assert_eq!(stored.revision, booking.revision + 1);
    }

    #[tokio::test]
    async fn test_concurrent_accepts_by_one_driver_claim_one_booking() {
        let h = Harness::interleaving(BookingPolicy::default());
        h.add_driver("d1", 12.9716, 77.5946).await;
        let morning = h.create(ride_request(Some(120.0))).await;
        let evening = h.create(ride_request(Some(30.0))).await;

        let (first, second) = tokio::join!(
            h.service.accept_booking(&morning.id, "d1"),
            h.service.accept_booking(&evening.id, "d1"),
        );

        assert_eq!(h.claim_calls(), 2);
        let winners = [&first, &second].iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        let loser = if first.is_ok() { &second } else { &first };
        assert!(matches!(loser, Err(AppError::DriverBusy)));

        let held = h.store.active_booking_for_driver("d1").await.unwrap().unwrap();
        let released = if held.id == morning.id { &evening.id } else { &morning.id };
        let untouched = h.store.get_booking(released).await.unwrap().unwrap();
        assert_eq!(untouched.status, BookingStatus::Pending);
        assert_eq!(untouched.driver_id, None);
    }

    #[tokio::test]
    async fn test_concurrent_writes_from_one_load_keep_a_single_winner() {
        let h = Harness::interleaving(BookingPolicy::default());
        let booking = h.create(ride_request(Some(120.0))).await;
        let early = || BookingUpdate {
            pickup_time: Some("07:00".to_string()),
            ..Default::default()
        };

        let (by_d1, by_d2, moved) = tokio::join!(
            h.service.reject_booking(&booking.id, "d1"),
            h.service.reject_booking(&booking.id, "d2"),
            h.service.update_booking(&booking.id, early()),
        );

        let outcomes = [&by_d1, &by_d2, &moved];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        for lost in outcomes.iter().filter(|r| r.is_err()) {
            assert!(matches!(lost, Err(AppError::Conflict(_))), "{:?}", lost);
        }
        let stored = h.store.get_booking(&booking.id).await.unwrap().unwrap();
        assert_eq!(stored.revision, booking.revision + 1);

        // Retrying the refused writes against the fresh document applies all three
        if by_d1.is_err() {
            h.service.reject_booking(&booking.id, "d1").await.unwrap();
        }
        if by_d2.is_err() {
            h.service.reject_booking(&booking.id, "d2").await.unwrap();
        }
        if moved.is_err() {
            h.service.update_booking(&booking.id, early()).await.unwrap();
        }

        let stored = h.store.get_booking(&booking.id).await.unwrap().unwrap();
        let mut rejected = stored.rejected_drivers.clone();
        rejected.sort();
        assert_eq!(rejected, vec!["d1", "d2"]);
        assert_eq!(stored.pickup_time, "07:00");
        assert_eq!(stored.status, BookingStatus::Pending);
        assert_eq!(stored.revision, booking.revision + 3);
    }

    #[tokio::test]
    async fn test_accept_racing_a_reject_never_drops_either_write() {
        let h = Harness::interleaving(BookingPolicy::default());
        h.add_driver("d1", 12.9716, 77.5946).await;
        let booking = h.create(ride_request(Some(120.0))).await;

        let (rejected, accepted) = tokio::join!(
            h.service.reject_booking(&booking.id, "d2"),
            h.service.accept_booking(&booking.id, "d1"),
        );

        let stored = h.store.get_booking(&booking.id).await.unwrap().unwrap();
        assert_eq!(stored.revision, booking.revision + 1);
        match (rejected, accepted) {
            (Ok(_), Err(AppError::Conflict(_))) => {
                assert_eq!(stored.status, BookingStatus::Pending);
                assert_eq!(stored.rejected_drivers, vec!["d2"]);
                assert_eq!(stored.driver_id, None);
            }
            (Err(AppError::InvalidTransition { action: "reject", .. }), Ok(_)) => {
                assert_eq!(stored.status, BookingStatus::Accepted);
                assert!(stored.rejected_drivers.is_empty());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_claim_of_a_stale_load_is_refused() {
        let h = Harness::new(BookingPolicy::default());
        h.add_driver("d1", 12.9716, 77.5946).await;
        let booking = h.create(ride_request(Some(120.0))).await;
        let loaded = h.store.get_booking(&booking.id).await.unwrap().unwrap();

        let mut edited = loaded.clone();
        edited.pickup_time = "07:00".to_string();
        edited.revision += 1;
        assert!(h
            .store
            .replace_booking_if(&edited, BookingStatus::Pending, loaded.revision)
            .await
            .unwrap());

        let mut claim = loaded.clone();
        claim.driver_id = Some("d1".to_string());
        claim.status = BookingStatus::Accepted;
        claim.revision = loaded.revision + 1;
        let outcome = h.store.claim_booking(&claim, loaded.revision).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Stale));

        // Same revision as the edit, so a replace based on the old load is refused too
        assert!(!h
            .store
            .replace_booking_if(&claim, BookingStatus::Pending, loaded.revision)
            .await
            .unwrap());
        let stored = h.store.get_booking(&booking.id).await.unwrap().unwrap();
        assert_eq!(stored.pickup_time, "07:00");
        assert_eq!(stored.driver_id, None);
    }

    #[tokio::test]
    async fn test_accept_rules() {
        let h = Harness::new(BookingPolicy::default());
        h.add_driver("d1", 12.9716, 77.5946).await;
        h.add_driver("d2", 12.9720, 77.5950).await;

        let ride = h.create(ride_request(Some(120.0))).await;
        let accepted = h.service.accept_booking(&ride.id, "d1").await.unwrap();
        assert_eq!(accepted.status, BookingStatus::Accepted);
        assert_eq!(accepted.payment.advance_amount, 444);
        assert_eq!(accepted.payment.remaining_amount, 2218 - 444);
        assert_eq!(accepted.driver.unwrap().vehicle_number, "KA01D1");

        // Repeating an applied transition is an error
        let err = h.service.accept_booking(&ride.id, "d1").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { from: BookingStatus::Accepted, .. }));

        // d1 is busy until the ride ends
        let other = h.create(ride_request(Some(40.0))).await;
        let err = h.service.accept_booking(&other.id, "d1").await.unwrap_err();
        assert!(matches!(err, AppError::DriverBusy));

        let mut airport = ride_request(Some(35.0));
        airport.booking_type = Some("airport_drop".to_string());
        let airport = h.create(airport).await;
        let confirmed = h.service.accept_booking(&airport.id, "d2").await.unwrap();
        assert_eq!(confirmed.status, BookingStatus::Confirmed);
        assert_eq!(confirmed.payment.advance_amount, percent_of(confirmed.total_price, 20));

        let mut rental = ride_request(Some(80.0));
        rental.trip_type = Some(TripType::Rental { package_hours: 8 });
        let rental = h.create(rental).await;
        h.add_driver("d3", 12.9730, 77.5960).await;
        let accepted = h.service.accept_booking(&rental.id, "d3").await.unwrap();
        assert_eq!(accepted.status, BookingStatus::Accepted);
        assert_eq!(accepted.payment.advance_amount, percent_of(accepted.total_price, 25));

        let err = h.service.accept_booking(&other.id, "ghost").await.unwrap_err();
        assert!(matches!(err, AppError::DriverNotFound(_)));
    }

    #[tokio::test]
    async fn test_reject_records_driver_once() {
        let h = Harness::new(BookingPolicy::default());
        h.add_driver("d1", 12.9716, 77.5946).await;
        let booking = h.create(ride_request(Some(60.0))).await;

        h.service.reject_booking(&booking.id, "d2").await.unwrap();
        let rejected = h.service.reject_booking(&booking.id, "d2").await.unwrap();
        assert_eq!(rejected.status, BookingStatus::Pending);
        assert_eq!(rejected.rejected_drivers, vec!["d2".to_string()]);

        h.service.accept_booking(&booking.id, "d1").await.unwrap();
        let err = h.service.reject_booking(&booking.id, "d1").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { action: "reject", .. }));

        let after = h.service.reject_booking(&booking.id, "d3").await.unwrap();
        assert_eq!(after.status, BookingStatus::Accepted);
        assert_eq!(after.rejected_drivers.len(), 2);
    }

    #[tokio::test]
    async fn test_driver_cancel_returns_booking_to_pending() {
        let h = Harness::new(BookingPolicy::default());
        h.add_driver("d1", 12.9716, 77.5946).await;
        h.add_driver("d2", 12.9720, 77.5950).await;
        h.add_driver("d3", 12.9725, 77.5955).await;
        let booking = h.create(ride_request(Some(60.0))).await;

        h.service.reject_booking(&booking.id, "d3").await.unwrap();
        h.service.accept_booking(&booking.id, "d1").await.unwrap();

        let err = h
            .service
            .driver_cancel_booking(&booking.id, "d2", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DriverNotEligible(_)));

        let released = h
            .service
            .cancel_booking(
                &booking.id,
                CancelRequest {
                    reason: Some("Vehicle breakdown".to_string()),
                    cancelled_by: Some(CancelledBy::Driver),
                    driver_id: Some("d1".to_string()),
                },
            )
            .await
            .unwrap();

        assert_eq!(released.status, BookingStatus::Pending);
        assert!(released.driver_id.is_none());
        assert!(released.driver.is_none());
        assert!(released.accepted_at.is_none());
        assert_eq!(released.payment.advance_amount, 0);
        let cancellation = released.cancellation.unwrap();
        assert_eq!(cancellation.cancelled_by, CancelledBy::Driver);
        assert_eq!(cancellation.driver_id.as_deref(), Some("d1"));

        // Re-offered to everyone but the cancelling driver
        let batches = h.push.batches.lock().await;
        let reoffer = batches.last().unwrap();
        assert_eq!(reoffer.len(), 2);
        assert!(!reoffer.contains(&"push-d1".to_string()));
        assert!(reoffer.contains(&"push-d3".to_string()));
        drop(batches);

        // d1 is free again
        let other = h.create(ride_request(Some(30.0))).await;
        h.service.accept_booking(&other.id, "d1").await.unwrap();
    }

    #[tokio::test]
    async fn test_rematch_can_exclude_rejecting_drivers() {
        let h = Harness::new(BookingPolicy {
            exclude_rejected_on_rematch: true,
            ..BookingPolicy::default()
        });
        h.add_driver("d1", 12.9716, 77.5946).await;
        h.add_driver("d2", 12.9720, 77.5950).await;
        h.add_driver("d3", 12.9725, 77.5955).await;
        let booking = h.create(ride_request(Some(60.0))).await;

        h.service.reject_booking(&booking.id, "d3").await.unwrap();
        h.service.accept_booking(&booking.id, "d1").await.unwrap();
        h.service.driver_cancel_booking(&booking.id, "d1", None).await.unwrap();

        let batches = h.push.batches.lock().await;
        assert_eq!(batches.last().unwrap(), &vec!["push-d2".to_string()]);
    }

    #[tokio::test]
    async fn test_full_trip_credits_driver() {
        let h = Harness::new(BookingPolicy::default());
        h.add_driver("d1", 12.9716, 77.5946).await;
        h.add_driver("d2", 12.9720, 77.5950).await;
        let booking = h.create(ride_request(Some(120.0))).await;

        h.service.accept_booking(&booking.id, "d1").await.unwrap();
        let err = h.service.accept_booking(&booking.id, "d2").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));

        let err = h.service.generate_completion_otp(&booking.id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));

        let started = h.service.start_trip(&booking.id, Some("d1")).await.unwrap();
        assert_eq!(started.status, BookingStatus::Started);
        assert_eq!(started.payment.status, PaymentStatus::PartiallyPaid);
        let driver = h.store.get_driver("d1").await.unwrap().unwrap();
        assert_eq!(driver.total_earnings, 444);
        assert_eq!(driver.total_trips, 0);

        let otp = h.service.generate_completion_otp(&booking.id).await.unwrap();
        assert_eq!(otp.otp.len(), 4);
        assert_eq!(otp.expires_at - otp.generated_at, Duration::minutes(10));

        let wrong = if otp.otp == "0000" { "1111" } else { "0000" };
        let err = h.service.complete_booking(&booking.id, wrong).await.unwrap_err();
        assert!(matches!(err, AppError::OtpMismatch));
        let stored = h.store.get_booking(&booking.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BookingStatus::Started);

        let completed = h.service.complete_booking(&booking.id, &otp.otp).await.unwrap();
        assert_eq!(completed.status, BookingStatus::Completed);
        assert_eq!(completed.payment.status, PaymentStatus::Paid);

        // The OTP is cleared, so the same code cannot complete twice
        let err = h.service.complete_booking(&booking.id, &otp.otp).await.unwrap_err();
        assert!(matches!(err, AppError::OtpNotGenerated));

        let driver = h.store.get_driver("d1").await.unwrap().unwrap();
        assert_eq!(driver.total_earnings, 1996);
        assert_eq!(driver.total_trips, 1);

        let ledger = h.store.list_booking_earnings(&booking.id).await.unwrap();
        let kinds: Vec<(EarningKind, i64)> = ledger.iter().map(|e| (e.kind, e.amount)).collect();
        assert_eq!(
            kinds,
            vec![(EarningKind::AdvancePayment, 444), (EarningKind::TripCompletion, 1552)]
        );

        // Completed bookings no longer hold the driver
        assert!(h.store.active_booking_for_driver("d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_otp_is_rejected() {
        let h = Harness::new(BookingPolicy::default());
        h.add_driver("d1", 12.9716, 77.5946).await;
        let booking = h.create(ride_request(Some(20.0))).await;
        h.service.accept_booking(&booking.id, "d1").await.unwrap();
        h.service.start_trip(&booking.id, None).await.unwrap();
        let otp = h.service.generate_completion_otp(&booking.id).await.unwrap();

        let mut stored = h.store.get_booking(&booking.id).await.unwrap().unwrap();
        if let Some(code) = stored.completion_otp.as_mut() {
            code.generated_at = code.generated_at - Duration::minutes(11);
        }
        assert!(h.store.replace_booking_if(&stored, BookingStatus::Started, stored.revision).await.unwrap());

        let err = h.service.complete_booking(&booking.id, &otp.otp).await.unwrap_err();
        assert!(matches!(err, AppError::OtpExpired));

        let fresh = h.service.generate_completion_otp(&booking.id).await.unwrap();
        h.service.complete_booking(&booking.id, &fresh.otp).await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_advance_writes_no_advance_entry() {
        let h = Harness::new(BookingPolicy::default());
        h.add_driver("d1", 12.9716, 77.5946).await;
        let booking = h.create(ride_request(Some(20.0))).await;
        h.service.accept_booking(&booking.id, "d1").await.unwrap();

        let mut stored = h.store.get_booking(&booking.id).await.unwrap().unwrap();
        stored.payment.advance_amount = 0;
        assert!(h.store.replace_booking_if(&stored, BookingStatus::Accepted, stored.revision).await.unwrap());

        h.service.start_trip(&booking.id, None).await.unwrap();
        assert!(h.store.list_booking_earnings(&booking.id).await.unwrap().is_empty());

        let otp = h.service.generate_completion_otp(&booking.id).await.unwrap();
        let completed = h.service.complete_booking(&booking.id, &otp.otp).await.unwrap();

        let ledger = h.store.list_booking_earnings(&booking.id).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].kind, EarningKind::TripCompletion);
        assert_eq!(ledger[0].amount, completed.driver_amount);
    }

    #[tokio::test]
    async fn test_delete_only_while_pending() {
        let h = Harness::new(BookingPolicy::default());
        h.add_driver("d1", 12.9716, 77.5946).await;
        let pending = h.create(ride_request(Some(20.0))).await;
        h.service.delete_booking(&pending.id).await.unwrap();
        let err = h.service.get_booking(&pending.id).await.unwrap_err();
        assert!(matches!(err, AppError::BookingNotFound(_)));

        let accepted = h.create(ride_request(Some(20.0))).await;
        h.service.accept_booking(&accepted.id, "d1").await.unwrap();
        let err = h.service.delete_booking(&accepted.id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { action: "delete", .. }));
    }

    #[tokio::test]
    async fn test_update_revalidates_round_trip() {
        let h = Harness::new(BookingPolicy::default());
        let booking = h.create(ride_request(Some(30.0))).await;

        let err = h
            .service
            .update_booking(
                &booking.id,
                BookingUpdate {
                    is_round_trip: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(validation_fields(err), vec!["return_date"]);

        let updated = h
            .service
            .update_booking(
                &booking.id,
                BookingUpdate {
                    is_round_trip: Some(true),
                    return_date: NaiveDate::from_ymd_opt(2026, 11, 4),
                    pickup_time: Some("07:15".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.is_round_trip);
        assert_eq!(updated.pickup_time, "07:15");
        assert_eq!(updated.fare_breakdown, compute_fare(30.0, VehicleClass::Sedan, true));

        let err = h
            .service
            .update_booking(
                &booking.id,
                BookingUpdate {
                    pickup_date: NaiveDate::from_ymd_opt(2026, 11, 9),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(validation_fields(err), vec!["return_date"]);
    }

    #[tokio::test]
    async fn test_patch_dispatches_transitions() {
        let h = Harness::new(BookingPolicy::default());
        h.add_driver("d1", 12.9716, 77.5946).await;
        let booking = h.create(ride_request(Some(30.0))).await;

        let accepted = h
            .service
            .patch_booking(
                &booking.id,
                BookingPatch {
                    status: Some(BookingStatus::Accepted),
                    driver_id: Some("d1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(accepted.status, BookingStatus::Accepted);

        let err = h
            .service
            .patch_booking(
                &booking.id,
                BookingPatch {
                    status: Some(BookingStatus::Completed),
                    otp: Some("1234".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::OtpNotGenerated));

        let started = h
            .service
            .patch_booking(
                &booking.id,
                BookingPatch {
                    status: Some(BookingStatus::InProgress),
                    update: BookingUpdate {
                        pickup_time: Some("10:00".to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(started.status, BookingStatus::Started);
        assert_eq!(started.pickup_time, "10:00");

        let cancelled = h
            .service
            .patch_booking(
                &booking.id,
                BookingPatch {
                    status: Some(BookingStatus::Cancelled),
                    reason: Some("Rider unreachable".to_string()),
                    cancelled_by: Some(CancelledBy::Admin),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        assert_eq!(cancelled.cancellation.unwrap().cancelled_by, CancelledBy::Admin);

        let err = h
            .service
            .patch_booking(&booking.id, BookingPatch::default())
            .await
            .unwrap_err();
        assert_eq!(validation_fields(err), vec!["status"]);
    }

    #[tokio::test]
    async fn test_refused_patch_leaves_fields_untouched() {
        let h = Harness::new(BookingPolicy::default());
        let booking = h.create(ride_request(Some(120.0))).await;
        let late = || BookingUpdate {
            pickup_time: Some("23:59".to_string()),
            ..Default::default()
        };

        let err = h
            .service
            .patch_booking(
                &booking.id,
                BookingPatch {
                    status: Some(BookingStatus::Completed),
                    otp: Some("1234".to_string()),
                    update: late(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::OtpNotGenerated));

        let err = h
            .service
            .patch_booking(
                &booking.id,
                BookingPatch {
                    status: Some(BookingStatus::Started),
                    update: late(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidTransition { from: BookingStatus::Pending, action: "start" }
        ));

        let err = h
            .service
            .patch_booking(
                &booking.id,
                BookingPatch {
                    status: Some(BookingStatus::Accepted),
                    driver_id: Some("ghost".to_string()),
                    update: late(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DriverNotFound(_)), "{:?}", err);

        let stored = h.store.get_booking(&booking.id).await.unwrap().unwrap();
        assert_eq!(stored.pickup_time, "09:30");
        assert_eq!(stored.status, BookingStatus::Pending);
        assert_eq!(stored.revision, booking.revision);
    }

    #[tokio::test]
    async fn test_user_cancel_is_terminal() {
        let h = Harness::new(BookingPolicy::default());
        h.add_driver("d1", 12.9716, 77.5946).await;
        let booking = h.create(ride_request(Some(30.0))).await;
        h.service.accept_booking(&booking.id, "d1").await.unwrap();

        let cancelled = h
            .service
            .cancel_booking(&booking.id, CancelRequest::default())
            .await
            .unwrap();
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());
        assert_eq!(cancelled.cancellation.unwrap().cancelled_by, CancelledBy::User);

        let err = h
            .service
            .cancel_booking(&booking.id, CancelRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { from: BookingStatus::Cancelled, .. }));

        let err = h
            .service
            .update_booking(
                &booking.id,
                BookingUpdate {
                    pickup_time: Some("11:00".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { action: "update", .. }));

        // The driver is released by the cancellation
        assert!(h.store.active_booking_for_driver("d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_payment_confirmation() {
        let h = Harness::new(BookingPolicy::default());
        let booking = h.create(ride_request(Some(30.0))).await;

        let paid = h
            .service
            .confirm_payment(
                &booking.id,
                PaymentConfirmation {
                    method: Some(crate::models::PaymentMethod::Upi),
                    transaction_id: Some("UPI-88231".to_string()),
                    amount: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(paid.payment.status, PaymentStatus::Paid);
        assert_eq!(paid.payment.amount, booking.total_price);
        assert_eq!(paid.status, BookingStatus::Pending);

        let err = h
            .service
            .confirm_payment(
                &booking.id,
                PaymentConfirmation {
                    method: None,
                    transaction_id: Some("UPI-88232".to_string()),
                    amount: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_estimate_fare() {
        let h = Harness::new(BookingPolicy::default());
        let estimate = h
            .service
            .estimate_fare(FareEstimateRequest {
                distance_km: Some(120.0),
                vehicle_type: Some("limousine".to_string()),
                is_round_trip: false,
            })
            .await
            .unwrap();
        assert_eq!(estimate.vehicle_class, VehicleClass::Sedan);
        assert_eq!(estimate.fare.total, 2218);

        let err = h
            .service
            .estimate_fare(FareEstimateRequest {
                distance_km: None,
                vehicle_type: None,
                is_round_trip: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::MissingRequiredField(_)));
    }
}
