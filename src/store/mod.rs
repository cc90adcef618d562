// src/store/mod.rs
//! Persistence seams for bookings, drivers, the earnings ledger and the
//! driver location index.
//!
//! Every booking write after creation is a compare-and-swap on the stored
//! status and revision. Booking, ledger and driver counters are separate documents and
//! are written separately; the ledger is authoritative for earnings.

use async_trait::async_trait;

use crate::errors::AppResult;
use crate::models::{Booking, BookingFilter, BookingStatus, Driver, DriverEarning, GeoPoint};

pub mod memory;
pub mod redis_store;

pub use memory::{MemorySpatialIndex, MemoryStore};
pub use redis_store::{RedisGeoIndex, RedisStore};

/// Result of trying to hand a pending booking to a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    Missing,
    /// Someone else moved the booking out of `pending` first.
    StatusChanged(BookingStatus),
    /// The driver already holds another active booking.
    DriverBusy,
    /// Still pending, but written since the caller loaded it.
    Stale,
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn insert_booking(&self, booking: &Booking) -> AppResult<()>;
    async fn get_booking(&self, booking_id: &str) -> AppResult<Option<Booking>>;
    async fn list_bookings(&self, filter: &BookingFilter) -> AppResult<Vec<Booking>>;

    /// Overwrite the booking only if the stored copy still has status
    /// `expected` and revision `expected_revision`. `booking.revision` is
    /// stored as given, so callers bump it before writing.
    async fn replace_booking_if(
        &self,
        booking: &Booking,
        expected: BookingStatus,
        expected_revision: u64,
    ) -> AppResult<bool>;

    /// Store `booking` (already carrying its new driver, status and
    /// revision) only if the stored copy is still pending at
    /// `expected_revision` and its driver holds no other active booking.
    /// The checks and the write happen atomically.
    async fn claim_booking(&self, booking: &Booking, expected_revision: u64) -> AppResult<ClaimOutcome>;

    async fn delete_booking_if(&self, booking_id: &str, expected: BookingStatus) -> AppResult<bool>;
    async fn active_booking_for_driver(&self, driver_id: &str) -> AppResult<Option<Booking>>;
}

#[async_trait]
pub trait DriverStore: Send + Sync {
    async fn insert_driver(&self, driver: &Driver) -> AppResult<()>;
    async fn get_driver(&self, driver_id: &str) -> AppResult<Option<Driver>>;
    async fn list_drivers(&self) -> AppResult<Vec<Driver>>;

    /// Persist profile, location and availability. Counters are untouched.
    async fn update_driver(&self, driver: &Driver) -> AppResult<()>;

    /// Atomic increment of the running totals.
    async fn credit_driver(&self, driver_id: &str, amount: i64, trips: u32) -> AppResult<()>;
    async fn set_driver_totals(&self, driver_id: &str, total_earnings: i64, total_trips: u32) -> AppResult<()>;
}

#[async_trait]
pub trait EarningStore: Send + Sync {
    /// Append to the ledger. A second advance or completion entry for the
    /// same booking is rejected with a conflict.
    async fn append_earning(&self, earning: &DriverEarning) -> AppResult<()>;
    async fn list_earnings(&self, driver_id: &str) -> AppResult<Vec<DriverEarning>>;
    async fn list_booking_earnings(&self, booking_id: &str) -> AppResult<Vec<DriverEarning>>;
}

/// Spatial index over last-reported driver positions.
#[async_trait]
pub trait SpatialIndex: Send + Sync {
    async fn update_location(&self, driver_id: &str, point: GeoPoint) -> AppResult<()>;
    async fn remove(&self, driver_id: &str) -> AppResult<()>;

    /// Driver ids with great-circle distance in metres, nearest first.
    async fn nearby(&self, center: GeoPoint, radius_m: f64, limit: usize) -> AppResult<Vec<(String, f64)>>;
}

/// Everything that reads or writes documents, bundled for wiring.
pub trait Repository: BookingStore + DriverStore + EarningStore {}

impl<T: BookingStore + DriverStore + EarningStore> Repository for T {}
