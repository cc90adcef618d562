// src/models/fare.rs
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum VehicleClass {
    #[default]
    Sedan,
    Suv,
    Luxury,
}

impl VehicleClass {
    /// Lenient parse; anything unrecognised is priced as a sedan.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "suv" => VehicleClass::Suv,
            "luxury" => VehicleClass::Luxury,
            _ => VehicleClass::Sedan,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleClass::Sedan => "sedan",
            VehicleClass::Suv => "suv",
            VehicleClass::Luxury => "luxury",
        }
    }
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Price snapshot stored on a booking. Whole currency units.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct FareBreakdown {
    pub base_fare: i64,
    pub driver_allowance: i64,
    pub toll_charges: i64,
    pub taxes: i64,
    pub total: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FareEstimateRequest {
    pub distance_km: Option<f64>,
    pub vehicle_type: Option<String>,
    #[serde(default)]
    pub is_round_trip: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FareEstimateResponse {
    pub distance_km: f64,
    pub vehicle_class: VehicleClass,
    pub is_round_trip: bool,
    pub fare: FareBreakdown,
}
