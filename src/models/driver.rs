// src/models/driver.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fare::VehicleClass;
use super::location::GeoPoint;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    PendingVerification, // Documents under review
    Approved,            // Verified but not yet switched on
    Rejected,            // Verification failed
    Active,              // Taking trips
    Inactive,
    Busy,
    Suspended,
}

impl DriverStatus {
    /// Whether a driver in this status may accept bookings at all.
    pub fn can_take_bookings(&self) -> bool {
        matches!(
            self,
            DriverStatus::Approved | DriverStatus::Active | DriverStatus::Busy
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Vehicle {
    pub number: String, // Registration plate
    pub model: String,
    pub class: VehicleClass,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Driver {
    pub id: String,
    pub name: String,
    pub phone_number: String,
    pub vehicle: Vehicle,
    pub status: DriverStatus,
    pub current_location: Option<GeoPoint>,
    pub location_updated_at: Option<DateTime<Utc>>,
    pub is_online: bool,
    pub is_available: bool,
    pub push_token: Option<String>, // For push notifications
    pub rating: f32,
    pub total_trips: u32,
    pub total_earnings: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Driver {
    pub fn has_push_token(&self) -> bool {
        self.push_token.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DriverRegistration {
    pub name: Option<String>,
    pub phone_number: Option<String>,
    pub vehicle_number: Option<String>,
    pub vehicle_model: Option<String>,
    pub vehicle_type: Option<String>,
    pub push_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DriverLocationUpdate {
    pub lat: f64,
    pub lng: f64,
}

/// Allow-listed availability fields a driver's client may change.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct DriverAvailability {
    pub is_online: Option<bool>,
    pub is_available: Option<bool>,
    pub push_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DriverStatusUpdate {
    pub status: DriverStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NearbyDriversQuery {
    pub lat: f64,
    pub lng: f64,
    pub radius_m: Option<f64>,
    pub mode: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DriverResponse {
    pub id: String,
    pub name: String,
    pub phone_number: String,
    pub vehicle: Vehicle,
    pub status: DriverStatus,
    pub current_location: Option<GeoPoint>,
    pub is_online: bool,
    pub is_available: bool,
    pub rating: f32,
    pub total_trips: u32,
    pub total_earnings: i64,
}

impl From<Driver> for DriverResponse {
    fn from(driver: Driver) -> Self {
        Self {
            id: driver.id,
            name: driver.name,
            phone_number: driver.phone_number,
            vehicle: driver.vehicle,
            status: driver.status,
            current_location: driver.current_location,
            is_online: driver.is_online,
            is_available: driver.is_available,
            rating: driver.rating,
            total_trips: driver.total_trips,
            total_earnings: driver.total_earnings,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NearbyDriver {
    pub driver: DriverResponse,
    pub distance_m: f64,
    pub approximate: bool,
}
