// src/services/fare_service.rs
//! Fare calculation. Pure functions over a static rate table.

use crate::models::{FareBreakdown, VehicleClass};

/// One toll unit is charged per started block of this many kilometres.
pub const TOLL_BLOCK_KM: f64 = 200.0;

/// Toll amount per block.
pub const TOLL_PER_BLOCK: f64 = 200.0;

pub const TAX_RATE: f64 = 0.18;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FareRates {
    pub base_rate_per_km: f64,
    pub minimum_fare: f64,
    pub driver_allowance_per_km: f64,
}

pub fn rates_for(class: VehicleClass) -> FareRates {
    match class {
        VehicleClass::Sedan => FareRates {
            base_rate_per_km: 12.0,
            minimum_fare: 500.0,
            driver_allowance_per_km: 2.0,
        },
        VehicleClass::Suv => FareRates {
            base_rate_per_km: 16.0,
            minimum_fare: 800.0,
            driver_allowance_per_km: 3.0,
        },
        VehicleClass::Luxury => FareRates {
            base_rate_per_km: 24.0,
            minimum_fare: 1500.0,
            driver_allowance_per_km: 4.0,
        },
    }
}

/// Compute the fare for a trip.
///
/// Expects `distance_km > 0`; range checks belong to the caller. Round trips
/// double the distance-based components before the minimum fare applies.
pub fn compute_fare(distance_km: f64, class: VehicleClass, is_round_trip: bool) -> FareBreakdown {
    let rates = rates_for(class);

    let mut base_fare = distance_km * rates.base_rate_per_km;
    let mut driver_allowance = distance_km * rates.driver_allowance_per_km;
    let mut toll_charges = (distance_km / TOLL_BLOCK_KM).ceil() * TOLL_PER_BLOCK;

    if is_round_trip {
        base_fare *= 2.0;
        driver_allowance *= 2.0;
        toll_charges *= 2.0;
    }

    let base_fare = base_fare.max(rates.minimum_fare);
    let subtotal = base_fare + driver_allowance + toll_charges;
    let taxes = (subtotal * TAX_RATE).round();
    let total = subtotal + taxes;

    FareBreakdown {
        base_fare: base_fare.round() as i64,
        driver_allowance: driver_allowance.round() as i64,
        toll_charges: toll_charges.round() as i64,
        taxes: taxes as i64,
        total: total.round() as i64,
    }
}
