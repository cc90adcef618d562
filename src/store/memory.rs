// src/store/memory.rs
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{BookingStore, ClaimOutcome, DriverStore, EarningStore, SpatialIndex};
use crate::errors::{AppError, AppResult};
use crate::models::{Booking, BookingFilter, BookingStatus, Driver, DriverEarning, GeoPoint};

/// In-process store for development and tests.
///
/// Bookings sit behind a single lock so the accept path can check the
/// booking status and the driver's other bookings in one critical section.
#[derive(Debug, Default)]
pub struct MemoryStore {
    bookings: RwLock<HashMap<String, Booking>>,
    drivers: RwLock<HashMap<String, Driver>>,
    earnings: RwLock<Vec<DriverEarning>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn insert_booking(&self, booking: &Booking) -> AppResult<()> {
        let mut bookings = self.bookings.write().await;
        if bookings.contains_key(&booking.id) {
            return Err(AppError::Conflict(format!("Booking {} already exists", booking.id)));
        }
        bookings.insert(booking.id.clone(), booking.clone());
        Ok(())
    }

    async fn get_booking(&self, booking_id: &str) -> AppResult<Option<Booking>> {
        Ok(self.bookings.read().await.get(booking_id).cloned())
    }

    async fn list_bookings(&self, filter: &BookingFilter) -> AppResult<Vec<Booking>> {
        let bookings = self.bookings.read().await;
        let mut matched: Vec<Booking> = bookings
            .values()
            .filter(|b| filter.matches(b))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched)
    }

    async fn replace_booking_if(
        &self,
        booking: &Booking,
        expected: BookingStatus,
        expected_revision: u64,
    ) -> AppResult<bool> {
        let mut bookings = self.bookings.write().await;
        match bookings.get_mut(&booking.id) {
            Some(current) if current.status == expected && current.revision == expected_revision => {
                *current = booking.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_booking(&self, booking: &Booking, expected_revision: u64) -> AppResult<ClaimOutcome> {
        let Some(driver_id) = booking.driver_id.as_deref() else {
            return Err(AppError::internal_error("claim_booking called without a driver"));
        };

        let mut bookings = self.bookings.write().await;

        let (current_status, current_revision) = match bookings.get(&booking.id) {
            Some(current) => (current.status, current.revision),
            None => return Ok(ClaimOutcome::Missing),
        };
        if current_status != BookingStatus::Pending {
            return Ok(ClaimOutcome::StatusChanged(current_status));
        }
        if current_revision != expected_revision {
            return Ok(ClaimOutcome::Stale);
        }

        let busy = bookings
            .values()
            .any(|other| other.id != booking.id && other.is_held_by(driver_id));
        if busy {
            return Ok(ClaimOutcome::DriverBusy);
        }

        bookings.insert(booking.id.clone(), booking.clone());
        Ok(ClaimOutcome::Claimed)
    }

    async fn delete_booking_if(&self, booking_id: &str, expected: BookingStatus) -> AppResult<bool> {
        let mut bookings = self.bookings.write().await;
        match bookings.get(booking_id) {
            Some(current) if current.status == expected => {
                bookings.remove(booking_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn active_booking_for_driver(&self, driver_id: &str) -> AppResult<Option<Booking>> {
        let bookings = self.bookings.read().await;
        Ok(bookings.values().find(|b| b.is_held_by(driver_id)).cloned())
    }
}

#[async_trait]
impl DriverStore for MemoryStore {
    async fn insert_driver(&self, driver: &Driver) -> AppResult<()> {
        let mut drivers = self.drivers.write().await;
        if drivers.contains_key(&driver.id) {
            return Err(AppError::Conflict(format!("Driver {} already exists", driver.id)));
        }
        drivers.insert(driver.id.clone(), driver.clone());
        Ok(())
    }

    async fn get_driver(&self, driver_id: &str) -> AppResult<Option<Driver>> {
        Ok(self.drivers.read().await.get(driver_id).cloned())
    }

    async fn list_drivers(&self) -> AppResult<Vec<Driver>> {
        Ok(self.drivers.read().await.values().cloned().collect())
    }

    async fn update_driver(&self, driver: &Driver) -> AppResult<()> {
        let mut drivers = self.drivers.write().await;
        let current = drivers
            .get_mut(&driver.id)
            .ok_or_else(|| AppError::driver_not_found(&driver.id))?;

        let (total_trips, total_earnings) = (current.total_trips, current.total_earnings);
        *current = driver.clone();
        current.total_trips = total_trips;
        current.total_earnings = total_earnings;
        Ok(())
    }

    async fn credit_driver(&self, driver_id: &str, amount: i64, trips: u32) -> AppResult<()> {
        let mut drivers = self.drivers.write().await;
        let driver = drivers
            .get_mut(driver_id)
            .ok_or_else(|| AppError::driver_not_found(driver_id))?;
        driver.total_earnings += amount;
        driver.total_trips += trips;
        driver.updated_at = Utc::now();
        Ok(())
    }

    async fn set_driver_totals(&self, driver_id: &str, total_earnings: i64, total_trips: u32) -> AppResult<()> {
        let mut drivers = self.drivers.write().await;
        let driver = drivers
            .get_mut(driver_id)
            .ok_or_else(|| AppError::driver_not_found(driver_id))?;
        driver.total_earnings = total_earnings;
        driver.total_trips = total_trips;
        driver.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl EarningStore for MemoryStore {
    async fn append_earning(&self, earning: &DriverEarning) -> AppResult<()> {
        let mut earnings = self.earnings.write().await;
        if earning.kind.is_once_per_booking()
            && earnings
                .iter()
                .any(|e| e.booking_id == earning.booking_id && e.kind == earning.kind)
        {
            return Err(AppError::Conflict(format!(
                "{} already recorded for booking {}",
                earning.kind, earning.booking_id
            )));
        }
        earnings.push(earning.clone());
        Ok(())
    }

    async fn list_earnings(&self, driver_id: &str) -> AppResult<Vec<DriverEarning>> {
        let earnings = self.earnings.read().await;
        Ok(earnings.iter().filter(|e| e.driver_id == driver_id).cloned().collect())
    }

    async fn list_booking_earnings(&self, booking_id: &str) -> AppResult<Vec<DriverEarning>> {
        let earnings = self.earnings.read().await;
        Ok(earnings.iter().filter(|e| e.booking_id == booking_id).cloned().collect())
    }
}

/// Great-circle scan over an in-process position map.
#[derive(Debug, Default)]
pub struct MemorySpatialIndex {
    positions: RwLock<HashMap<String, GeoPoint>>,
}

impl MemorySpatialIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SpatialIndex for MemorySpatialIndex {
    async fn update_location(&self, driver_id: &str, point: GeoPoint) -> AppResult<()> {
        self.positions.write().await.insert(driver_id.to_string(), point);
        Ok(())
    }

    async fn remove(&self, driver_id: &str) -> AppResult<()> {
        self.positions.write().await.remove(driver_id);
        Ok(())
    }

    async fn nearby(&self, center: GeoPoint, radius_m: f64, limit: usize) -> AppResult<Vec<(String, f64)>> {
        let positions = self.positions.read().await;
        let mut hits: Vec<(String, f64)> = positions
            .iter()
            .map(|(id, point)| (id.clone(), center.distance_meters(point)))
            .filter(|(_, distance)| *distance <= radius_m)
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        hits.truncate(limit);
        Ok(hits)
    }
}
