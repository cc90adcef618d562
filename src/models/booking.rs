// src/models/booking.rs
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::fare::{FareBreakdown, VehicleClass};
use super::location::Place;

/// Distance above which a trip is priced and scheduled as outstation.
pub const OUTSTATION_THRESHOLD_KM: f64 = 100.0;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,    // Waiting for a driver to accept
    Accepted,   // Driver accepted an on-demand trip
    Confirmed,  // Driver accepted a scheduled trip
    InProgress, // Legacy alias of Started
    Started,    // Driver picked up the rider
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Accepted => "accepted",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Started => "started",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    /// Statuses in which the assigned driver is considered occupied.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            BookingStatus::Accepted
                | BookingStatus::Confirmed
                | BookingStatus::Started
                | BookingStatus::InProgress
        )
    }

    pub fn is_assigned(&self) -> bool {
        matches!(self, BookingStatus::Accepted | BookingStatus::Confirmed)
    }

    pub fn is_underway(&self) -> bool {
        matches!(self, BookingStatus::Started | BookingStatus::InProgress)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TripClass {
    City,
    Outstation,
}

impl TripClass {
    pub fn from_distance(distance_km: f64) -> Self {
        if distance_km > OUTSTATION_THRESHOLD_KM {
            TripClass::Outstation
        } else {
            TripClass::City
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AirportDirection {
    Pickup, // From the airport
    Drop,   // To the airport
}

/// One canonical booking shape for every product line.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TripType {
    Ride,
    AirportTransfer {
        direction: AirportDirection,
        #[serde(default)]
        flight_number: Option<String>,
        #[serde(default)]
        terminal: Option<String>,
    },
    Rental {
        package_hours: u32,
    },
    Resort {
        resort_id: String,
        guests: u32,
        nights: u32,
    },
    PackageTour {
        package_id: String,
        seats: u32,
    },
}

impl Default for TripType {
    fn default() -> Self {
        TripType::Ride
    }
}

impl TripType {
    /// Maps the flat `booking_type` strings older clients still send.
    pub fn from_legacy(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ride" | "city" | "outstation" => Some(TripType::Ride),
            "airport" | "airport_pickup" => Some(TripType::AirportTransfer {
                direction: AirportDirection::Pickup,
                flight_number: None,
                terminal: None,
            }),
            "airport_drop" => Some(TripType::AirportTransfer {
                direction: AirportDirection::Drop,
                flight_number: None,
                terminal: None,
            }),
            "rental" => Some(TripType::Rental { package_hours: 8 }),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TripType::Ride => "ride",
            TripType::AirportTransfer { .. } => "airport_transfer",
            TripType::Rental { .. } => "rental",
            TripType::Resort { .. } => "resort",
            TripType::PackageTour { .. } => "package_tour",
        }
    }

    /// Share of the total price collected as advance when the trip starts.
    pub fn advance_percent(&self) -> i64 {
        match self {
            TripType::Ride | TripType::AirportTransfer { .. } => 20,
            TripType::Rental { .. } | TripType::Resort { .. } | TripType::PackageTour { .. } => 25,
        }
    }

    /// Status a booking moves to when a driver accepts it.
    pub fn accepted_status(&self) -> BookingStatus {
        match self {
            TripType::Ride | TripType::Rental { .. } => BookingStatus::Accepted,
            _ => BookingStatus::Confirmed,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DriverSnapshot {
    pub name: String,
    pub phone_number: String,
    pub vehicle_number: String,
    pub vehicle_model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdditionalCharges {
    pub driver_allowance: i64,
    pub parking: i64,
    pub waiting: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[default]
    Cash,
    Upi,
    Card,
    Wallet,
    NetBanking,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    PartiallyPaid,
    Paid,
    Refunded,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Payment {
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub amount: i64,
    pub advance_amount: i64,
    pub remaining_amount: i64,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelledBy {
    User,
    Driver,
    Admin,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Cancellation {
    pub reason: Option<String>,
    pub cancelled_by: CancelledBy,
    pub driver_id: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CompletionOtp {
    pub code: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Booking {
    pub id: String,
    pub reference: String, // Short code shown to riders and drivers
    pub user_id: String,
    pub driver_id: Option<String>,
    pub driver: Option<DriverSnapshot>,
    pub trip_type: TripType,
    pub trip_class: TripClass,

    // Itinerary
    pub source: Place,
    pub destination: Place,
    pub stops: Vec<Place>,

    // Scheduling
    pub pickup_date: NaiveDate,
    pub pickup_time: String,
    pub return_date: Option<NaiveDate>,
    pub is_round_trip: bool,

    // Pricing
    pub vehicle_class: VehicleClass,
    pub distance_km: f64,
    pub duration_min: Option<u32>,
    pub base_price: i64,
    pub service_charge: i64,
    pub driver_amount: i64,
    pub additional_charges: AdditionalCharges,
    pub total_price: i64,
    pub fare_breakdown: FareBreakdown,
    pub payment: Payment,

    pub status: BookingStatus,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation: Option<Cancellation>,
    pub rejected_drivers: Vec<String>,
    pub completion_otp: Option<CompletionOtp>,

    /// Bumped on every stored write; conditional writes compare it.
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// Advance already credited to the driver, zero before the trip starts.
    pub fn advance_paid(&self) -> i64 {
        if self.started_at.is_some() {
            self.payment.advance_amount
        } else {
            0
        }
    }

    /// What the driver is still owed at completion, never negative.
    pub fn remaining_driver_amount(&self) -> i64 {
        (self.driver_amount - self.advance_paid()).max(0)
    }

    pub fn is_held_by(&self, driver_id: &str) -> bool {
        self.status.is_active() && self.driver_id.as_deref() == Some(driver_id)
    }
}

// Request/Response Models
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct CreateBookingRequest {
    pub user_id: Option<String>,
    pub trip_type: Option<TripType>,
    pub booking_type: Option<String>,
    pub trip_class: Option<TripClass>,
    pub source: Option<Place>,
    pub destination: Option<Place>,
    #[serde(default)]
    pub stops: Vec<Place>,
    pub pickup_date: Option<NaiveDate>,
    pub pickup_time: Option<String>,
    pub return_date: Option<NaiveDate>,
    #[serde(default)]
    pub is_round_trip: bool,
    pub vehicle_type: Option<String>,
    pub distance_km: Option<f64>,
    pub duration_min: Option<u32>,
    pub parking_charges: Option<i64>,
    pub waiting_charges: Option<i64>,
    pub payment_method: Option<PaymentMethod>,
}

/// Fields a rider may change on a live booking. Nothing else is patchable.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct BookingUpdate {
    pub stops: Option<Vec<Place>>,
    pub pickup_date: Option<NaiveDate>,
    pub pickup_time: Option<String>,
    pub return_date: Option<NaiveDate>,
    pub is_round_trip: Option<bool>,
}

impl BookingUpdate {
    pub fn is_empty(&self) -> bool {
        self.stops.is_none()
            && self.pickup_date.is_none()
            && self.pickup_time.is_none()
            && self.return_date.is_none()
            && self.is_round_trip.is_none()
    }
}

/// Body of `PATCH /bookings/:id`: an optional status transition plus
/// allow-listed field updates.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct BookingPatch {
    pub status: Option<BookingStatus>,
    pub driver_id: Option<String>,
    pub otp: Option<String>,
    pub reason: Option<String>,
    pub cancelled_by: Option<CancelledBy>,
    #[serde(flatten)]
    pub update: BookingUpdate,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DriverAction {
    pub driver_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct CancelRequest {
    pub reason: Option<String>,
    pub cancelled_by: Option<CancelledBy>,
    pub driver_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub otp: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub method: Option<PaymentMethod>,
    pub transaction_id: Option<String>,
    pub amount: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct BookingFilter {
    pub user_id: Option<String>,
    pub driver_id: Option<String>,
    pub status: Option<BookingStatus>,
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        self.user_id.as_ref().map_or(true, |id| &booking.user_id == id)
            && self
                .driver_id
                .as_ref()
                .map_or(true, |id| booking.driver_id.as_ref() == Some(id))
            && self.status.map_or(true, |s| booking.status == s)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BookingResponse {
    pub id: String,
    pub reference: String,
    pub user_id: String,
    pub driver_id: Option<String>,
    pub driver: Option<DriverSnapshot>,
    pub trip_type: TripType,
    pub trip_class: TripClass,
    pub source: Place,
    pub destination: Place,
    pub stops: Vec<Place>,
    pub pickup_date: NaiveDate,
    pub pickup_time: String,
    pub return_date: Option<NaiveDate>,
    pub is_round_trip: bool,
    pub vehicle_class: VehicleClass,
    pub distance_km: f64,
    pub duration_min: Option<u32>,
    pub base_price: i64,
    pub service_charge: i64,
    pub driver_amount: i64,
    pub additional_charges: AdditionalCharges,
    pub total_price: i64,
    pub fare_breakdown: FareBreakdown,
    pub payment: Payment,
    pub status: BookingStatus,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation: Option<Cancellation>,
    pub rejected_drivers: Vec<String>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Booking> for BookingResponse {
    fn from(booking: Booking) -> Self {
        Self {
            id: booking.id,
            reference: booking.reference,
            user_id: booking.user_id,
            driver_id: booking.driver_id,
            driver: booking.driver,
            trip_type: booking.trip_type,
            trip_class: booking.trip_class,
            source: booking.source,
            destination: booking.destination,
            stops: booking.stops,
            pickup_date: booking.pickup_date,
            pickup_time: booking.pickup_time,
            return_date: booking.return_date,
            is_round_trip: booking.is_round_trip,
            vehicle_class: booking.vehicle_class,
            distance_km: booking.distance_km,
            duration_min: booking.duration_min,
            base_price: booking.base_price,
            service_charge: booking.service_charge,
            driver_amount: booking.driver_amount,
            additional_charges: booking.additional_charges,
            total_price: booking.total_price,
            fare_breakdown: booking.fare_breakdown,
            payment: booking.payment,
            status: booking.status,
            accepted_at: booking.accepted_at,
            started_at: booking.started_at,
            completed_at: booking.completed_at,
            cancelled_at: booking.cancelled_at,
            cancellation: booking.cancellation,
            rejected_drivers: booking.rejected_drivers,
            revision: booking.revision,
            created_at: booking.created_at,
            updated_at: booking.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OtpResponse {
    pub booking_id: String,
    pub otp: String,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
