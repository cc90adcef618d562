// src/services/geo_service.rs
use std::collections::HashSet;
use std::sync::Arc;

use crate::{
    errors::AppResult,
    models::{Driver, DriverStatus, GeoPoint, METERS_PER_DEGREE},
    store::{DriverStore, SpatialIndex},
};

/// Hard cap on drivers returned per query, bounding notification fan-out.
pub const MAX_MATCHED_DRIVERS: usize = 50;

/// Which drivers count as candidates for a trip offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// Driver status is `active`.
    Active,
    /// Online and available flags set on an approved or active driver.
    OnlineAvailable,
}

impl Eligibility {
    pub fn from_mode(mode: Option<&str>) -> Self {
        match mode {
            Some("online") | Some("available") => Eligibility::OnlineAvailable,
            _ => Eligibility::Active,
        }
    }

    pub fn admits(&self, driver: &Driver) -> bool {
        if !driver.has_push_token() {
            return false;
        }
        match self {
            Eligibility::Active => driver.status == DriverStatus::Active,
            Eligibility::OnlineAvailable => {
                driver.is_online
                    && driver.is_available
                    && matches!(driver.status, DriverStatus::Approved | DriverStatus::Active)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchedDriver {
    pub driver: Driver,
    pub distance_m: f64,
    /// Set when the result came from the coordinate-difference fallback.
    pub approximate: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MatchQuery {
    pub exclude: HashSet<String>,
}

pub struct GeoMatcher {
    index: Option<Arc<dyn SpatialIndex>>,
    drivers: Arc<dyn DriverStore>,
    limit: usize,
}

impl GeoMatcher {
    pub fn new(index: Option<Arc<dyn SpatialIndex>>, drivers: Arc<dyn DriverStore>, limit: usize) -> Self {
        Self {
            index,
            drivers,
            limit: limit.clamp(1, MAX_MATCHED_DRIVERS),
        }
    }

    /// Drivers near `pickup`, nearest first. Reflects last-reported
    /// positions only.
    pub async fn find_nearby_drivers(
        &self,
        pickup: GeoPoint,
        max_distance_m: f64,
        eligibility: Eligibility,
        query: &MatchQuery,
    ) -> AppResult<Vec<MatchedDriver>> {
        if let Some(index) = &self.index {
            match self.match_with_index(index.as_ref(), pickup, max_distance_m, eligibility, query).await {
                Ok(matches) => return Ok(matches),
                Err(e) => {
                    tracing::warn!("Spatial index query failed, using approximate scan: {}", e);
                }
            }
        } else {
            tracing::debug!("No spatial index configured, using approximate scan");
        }

        self.match_by_scan(pickup, max_distance_m, eligibility, query).await
    }

    async fn match_with_index(
        &self,
        index: &dyn SpatialIndex,
        pickup: GeoPoint,
        max_distance_m: f64,
        eligibility: Eligibility,
        query: &MatchQuery,
    ) -> AppResult<Vec<MatchedDriver>> {
        // Over-fetch so ineligible drivers do not starve the result
        let hits = index.nearby(pickup, max_distance_m, self.limit * 4).await?;

        let mut matches = Vec::with_capacity(self.limit);
        for (driver_id, distance_m) in hits {
            if query.exclude.contains(&driver_id) {
                continue;
            }
            let Some(driver) = self.drivers.get_driver(&driver_id).await? else {
                tracing::debug!("Spatial index references unknown driver {}", driver_id);
                continue;
            };
            if !eligibility.admits(&driver) {
                continue;
            }
            matches.push(MatchedDriver {
                driver,
                distance_m,
                approximate: false,
            });
            if matches.len() == self.limit {
                break;
            }
        }

        tracing::debug!("Matched {} drivers via spatial index", matches.len());
        Ok(matches)
    }

    /// Degraded path: compares raw coordinate differences against the
    /// radius converted to degrees. Latitude distortion is ignored.
    async fn match_by_scan(
        &self,
        pickup: GeoPoint,
        max_distance_m: f64,
        eligibility: Eligibility,
        query: &MatchQuery,
    ) -> AppResult<Vec<MatchedDriver>> {
        let radius_deg = max_distance_m / METERS_PER_DEGREE;
        let threshold = radius_deg * radius_deg;

        let mut candidates: Vec<(f64, Driver)> = self
            .drivers
            .list_drivers()
            .await?
            .into_iter()
            .filter(|d| !query.exclude.contains(&d.id) && eligibility.admits(d))
            .filter_map(|d| {
                let location = d.current_location?;
                let squared = pickup.squared_degree_distance(&location);
                (squared <= threshold).then_some((squared, d))
            })
            .collect();

        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
        candidates.truncate(self.limit);

        Ok(candidates
            .into_iter()
            .map(|(squared, driver)| MatchedDriver {
                driver,
                distance_m: squared.sqrt() * METERS_PER_DEGREE,
                approximate: true,
            })
            .collect())
    }
}
