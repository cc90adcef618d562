// src/models/earning.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::fare::VehicleClass;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EarningKind {
    AdvancePayment,
    TripCompletion,
    Bonus,
    Penalty,
}

impl EarningKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EarningKind::AdvancePayment => "advance_payment",
            EarningKind::TripCompletion => "trip_completion",
            EarningKind::Bonus => "bonus",
            EarningKind::Penalty => "penalty",
        }
    }

    /// Kinds limited to a single entry per booking.
    pub fn is_once_per_booking(&self) -> bool {
        matches!(self, EarningKind::AdvancePayment | EarningKind::TripCompletion)
    }
}

impl fmt::Display for EarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EarningStatus {
    Credited,
    Pending,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TripSnapshot {
    pub source: String,
    pub destination: String,
    pub distance_km: f64,
    pub customer_id: String,
    pub vehicle_class: VehicleClass,
}

/// Ledger entry. Written once, never updated.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DriverEarning {
    pub id: String,
    pub driver_id: String,
    pub booking_id: String,
    pub amount: i64,
    pub kind: EarningKind,
    pub status: EarningStatus,
    pub trip: TripSnapshot,
    pub created_at: DateTime<Utc>,
}

impl DriverEarning {
    /// Signed contribution to the driver's running total.
    pub fn signed_amount(&self) -> i64 {
        match self.kind {
            EarningKind::Penalty => -self.amount.abs(),
            _ => self.amount,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EarningsSummary {
    pub driver_id: String,
    pub total: i64,
    pub entries: Vec<DriverEarning>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub driver_id: String,
    pub previous_total: i64,
    pub ledger_total: i64,
    pub total_trips: u32,
}
