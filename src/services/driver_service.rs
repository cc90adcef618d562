// src/services/driver_service.rs
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use crate::{
    errors::{AppError, AppResult, ValidationError},
    models::{
        BookingFilter, BookingResponse, BookingStatus, Driver, DriverAvailability, DriverLocationUpdate,
        DriverRegistration, DriverResponse, DriverStatus, DriverStatusUpdate, EarningsSummary, GeoPoint,
        NearbyDriver, NearbyDriversQuery, ReconcileReport, Vehicle, VehicleClass,
    },
    services::geo_service::{Eligibility, GeoMatcher, MatchQuery},
    store::{BookingStore, DriverStore, EarningStore, Repository, SpatialIndex},
    utils::id_generator::{IdGenerator, IdType},
};

#[async_trait]
pub trait DriverOperations: Send + Sync {
    async fn register_driver(&self, registration: DriverRegistration) -> AppResult<DriverResponse>;
    async fn get_driver(&self, driver_id: &str) -> AppResult<DriverResponse>;
    async fn update_location(&self, driver_id: &str, update: DriverLocationUpdate) -> AppResult<DriverResponse>;
    async fn update_availability(&self, driver_id: &str, update: DriverAvailability) -> AppResult<DriverResponse>;
    async fn update_status(&self, driver_id: &str, update: DriverStatusUpdate) -> AppResult<DriverResponse>;
    async fn find_nearby_drivers(&self, query: NearbyDriversQuery) -> AppResult<Vec<NearbyDriver>>;
    async fn get_earnings(&self, driver_id: &str) -> AppResult<EarningsSummary>;
    async fn reconcile_totals(&self, driver_id: &str) -> AppResult<ReconcileReport>;
    async fn get_active_booking(&self, driver_id: &str) -> AppResult<Option<BookingResponse>>;
}

pub struct DriverService {
    repo: Arc<dyn Repository>,
    index: Option<Arc<dyn SpatialIndex>>,
    matcher: Arc<GeoMatcher>,
    default_radius_m: f64,
}

impl DriverService {
    pub fn new(
        repo: Arc<dyn Repository>,
        index: Option<Arc<dyn SpatialIndex>>,
        matcher: Arc<GeoMatcher>,
        default_radius_m: f64,
    ) -> Self {
        Self {
            repo,
            index,
            matcher,
            default_radius_m,
        }
    }

    async fn load(&self, driver_id: &str) -> AppResult<Driver> {
        self.repo
            .get_driver(driver_id)
            .await?
            .ok_or_else(|| AppError::driver_not_found(driver_id))
    }
}

#[async_trait]
impl DriverOperations for DriverService {
    async fn register_driver(&self, registration: DriverRegistration) -> AppResult<DriverResponse> {
        let mut errors = Vec::new();
        let mut field = |name: &str, value: Option<String>| {
            let value = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
            if value.is_none() {
                errors.push(ValidationError {
                    field: name.to_string(),
                    message: "is required".to_string(),
                });
            }
            value
        };
        let name = field("name", registration.name);
        let phone_number = field("phone_number", registration.phone_number);
        let vehicle_number = field("vehicle_number", registration.vehicle_number);
        let vehicle_model = field("vehicle_model", registration.vehicle_model);

        let (Some(name), Some(phone_number), Some(vehicle_number), Some(vehicle_model)) =
            (name, phone_number, vehicle_number, vehicle_model)
        else {
            return Err(AppError::ValidationFailed(errors));
        };

        tracing::info!("Registering driver with phone {}", phone_number);

        let existing = self.repo.list_drivers().await?;
        if existing.iter().any(|d| d.phone_number == phone_number) {
            return Err(AppError::Conflict("A driver with this phone number already exists".to_string()));
        }

        let now = Utc::now();
        let driver = Driver {
            id: IdGenerator::generate(IdType::Driver),
            name,
            phone_number,
            vehicle: Vehicle {
                number: vehicle_number.to_uppercase(),
                model: vehicle_model,
                class: registration
                    .vehicle_type
                    .as_deref()
                    .map(VehicleClass::from_name)
                    .unwrap_or_default(),
            },
            status: DriverStatus::PendingVerification,
            current_location: None,
            location_updated_at: None,
            is_online: false,
            is_available: false,
            push_token: registration.push_token.filter(|t| !t.trim().is_empty()),
            rating: 0.0,
            total_trips: 0,
            total_earnings: 0,
            created_at: now,
            updated_at: now,
        };

        self.repo.insert_driver(&driver).await?;
        tracing::info!("Driver registered successfully: {}", driver.id);

        Ok(driver.into())
    }

    async fn get_driver(&self, driver_id: &str) -> AppResult<DriverResponse> {
        tracing::debug!("Getting driver: {}", driver_id);
        Ok(self.load(driver_id).await?.into())
    }

    async fn update_location(&self, driver_id: &str, update: DriverLocationUpdate) -> AppResult<DriverResponse> {
        let point = GeoPoint::new(update.lat, update.lng);
        if !point.is_valid() {
            return Err(AppError::validation_error("lat", "Coordinates are out of range"));
        }

        let mut driver = self.load(driver_id).await?;
        let now = Utc::now();
        driver.current_location = Some(point);
        driver.location_updated_at = Some(now);
        driver.updated_at = now;
        self.repo.update_driver(&driver).await?;

        // The document keeps the position, so matching degrades to a scan
        if let Some(index) = &self.index {
            if let Err(e) = index.update_location(driver_id, point).await {
                tracing::warn!("Spatial index update failed for driver {}: {}", driver_id, e);
            }
        }

        tracing::debug!("Driver {} at {},{}", driver_id, point.lat, point.lng);
        Ok(driver.into())
    }

    async fn update_availability(&self, driver_id: &str, update: DriverAvailability) -> AppResult<DriverResponse> {
        let mut driver = self.load(driver_id).await?;
        if let Some(is_online) = update.is_online {
            driver.is_online = is_online;
        }
        if let Some(is_available) = update.is_available {
            driver.is_available = is_available;
        }
        if let Some(token) = update.push_token {
            let token = token.trim().to_string();
            driver.push_token = (!token.is_empty()).then_some(token);
        }
        driver.updated_at = Utc::now();
        self.repo.update_driver(&driver).await?;

        tracing::info!(
            "Driver {} online={} available={}",
            driver_id,
            driver.is_online,
            driver.is_available
        );
        Ok(driver.into())
    }

    async fn update_status(&self, driver_id: &str, update: DriverStatusUpdate) -> AppResult<DriverResponse> {
        let mut driver = self.load(driver_id).await?;
        tracing::info!("Updating driver status: {} {:?} -> {:?}", driver_id, driver.status, update.status);

        driver.status = update.status;
        driver.updated_at = Utc::now();
        self.repo.update_driver(&driver).await?;
        Ok(driver.into())
    }

    async fn find_nearby_drivers(&self, query: NearbyDriversQuery) -> AppResult<Vec<NearbyDriver>> {
        let center = GeoPoint::new(query.lat, query.lng);
        if !center.is_valid() {
            return Err(AppError::validation_error("lat", "Coordinates are out of range"));
        }
        let radius_m = query.radius_m.unwrap_or(self.default_radius_m);
        if !radius_m.is_finite() || radius_m <= 0.0 {
            return Err(AppError::validation_error("radius_m", "Radius must be greater than zero"));
        }

        let eligibility = Eligibility::from_mode(query.mode.as_deref());
        let matches = self
            .matcher
            .find_nearby_drivers(center, radius_m, eligibility, &MatchQuery::default())
            .await?;

        Ok(matches
            .into_iter()
            .map(|m| NearbyDriver {
                driver: m.driver.into(),
                distance_m: m.distance_m,
                approximate: m.approximate,
            })
            .collect())
    }

    async fn get_earnings(&self, driver_id: &str) -> AppResult<EarningsSummary> {
        self.load(driver_id).await?;
        let entries = self.repo.list_earnings(driver_id).await?;
        let total = entries.iter().map(|e| e.signed_amount()).sum();
        Ok(EarningsSummary {
            driver_id: driver_id.to_string(),
            total,
            entries,
        })
    }

    /// Rebuild the driver's running totals from the ledger and completed
    /// bookings, repairing drift left by a partial write.
    async fn reconcile_totals(&self, driver_id: &str) -> AppResult<ReconcileReport> {
        let driver = self.load(driver_id).await?;

        let ledger_total: i64 = self
            .repo
            .list_earnings(driver_id)
            .await?
            .iter()
            .map(|e| e.signed_amount())
            .sum();
        let filter = BookingFilter {
            driver_id: Some(driver_id.to_string()),
            status: Some(BookingStatus::Completed),
            ..Default::default()
        };
        let total_trips = self.repo.list_bookings(&filter).await?.len() as u32;

        self.repo
            .set_driver_totals(driver_id, ledger_total, total_trips)
            .await?;

        if ledger_total != driver.total_earnings || total_trips != driver.total_trips {
            tracing::warn!(
                "Driver {} totals repaired: earnings {} -> {}, trips {} -> {}",
                driver_id,
                driver.total_earnings,
                ledger_total,
                driver.total_trips,
                total_trips
            );
        }

        Ok(ReconcileReport {
            driver_id: driver_id.to_string(),
            previous_total: driver.total_earnings,
            ledger_total,
            total_trips,
        })
    }

    async fn get_active_booking(&self, driver_id: &str) -> AppResult<Option<BookingResponse>> {
        self.load(driver_id).await?;
        Ok(self
            .repo
            .active_booking_for_driver(driver_id)
            .await?
            .map(BookingResponse::from))
    }
}
