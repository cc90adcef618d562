// src/services/directions_service.rs
use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    errors::{AppError, AppResult},
    models::GeoPoint,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteEstimate {
    pub distance_km: f64,
    pub duration_min: u32,
}

#[async_trait]
pub trait DirectionsProvider: Send + Sync {
    async fn route(
        &self,
        origin: GeoPoint,
        destination: GeoPoint,
        waypoints: &[GeoPoint],
    ) -> AppResult<RouteEstimate>;
}

/// Straight-line legs through every waypoint at a fixed average speed.
pub struct HaversineDirections {
    average_speed_kmh: f64,
}

impl HaversineDirections {
    pub fn new(average_speed_kmh: f64) -> Self {
        Self {
            average_speed_kmh: if average_speed_kmh > 0.0 { average_speed_kmh } else { 40.0 },
        }
    }
}

#[async_trait]
impl DirectionsProvider for HaversineDirections {
    async fn route(
        &self,
        origin: GeoPoint,
        destination: GeoPoint,
        waypoints: &[GeoPoint],
    ) -> AppResult<RouteEstimate> {
        let mut path = Vec::with_capacity(waypoints.len() + 2);
        path.push(origin);
        path.extend_from_slice(waypoints);
        path.push(destination);

        let meters: f64 = path.windows(2).map(|leg| leg[0].distance_meters(&leg[1])).sum();
        let distance_km = meters / 1000.0;
        let duration_min = (distance_km / self.average_speed_kmh * 60.0).ceil() as u32;

        Ok(RouteEstimate {
            distance_km,
            duration_min,
        })
    }
}

#[derive(Debug, Deserialize)]
struct DirectionsResponse {
    status: String,
    #[serde(default)]
    routes: Vec<DirectionsRoute>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DirectionsRoute {
    legs: Vec<DirectionsLeg>,
}

#[derive(Debug, Deserialize)]
struct DirectionsLeg {
    distance: TextValue,
    duration: TextValue,
}

#[derive(Debug, Deserialize)]
struct TextValue {
    value: u64,
}

pub struct GoogleDirections {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl GoogleDirections {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://maps.googleapis.com/maps/api/directions/json".to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn format_point(point: &GeoPoint) -> String {
        format!("{},{}", point.lat, point.lng)
    }
}

#[async_trait]
impl DirectionsProvider for GoogleDirections {
    async fn route(
        &self,
        origin: GeoPoint,
        destination: GeoPoint,
        waypoints: &[GeoPoint],
    ) -> AppResult<RouteEstimate> {
        let mut query = vec![
            ("origin", Self::format_point(&origin)),
            ("destination", Self::format_point(&destination)),
            ("key", self.api_key.clone()),
        ];
        if !waypoints.is_empty() {
            let joined = waypoints.iter().map(Self::format_point).collect::<Vec<_>>().join("|");
            query.push(("waypoints", joined));
        }

        let response: DirectionsResponse = self
            .client
            .get(&self.base_url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        summarize_route(response)
    }
}

fn summarize_route(response: DirectionsResponse) -> AppResult<RouteEstimate> {
    if response.status != "OK" {
        return Err(AppError::Directions(
            response.error_message.unwrap_or(response.status),
        ));
    }
    let route = response
        .routes
        .into_iter()
        .next()
        .ok_or_else(|| AppError::Directions("No route returned".to_string()))?;

    let (meters, seconds) = route
        .legs
        .iter()
        .fold((0u64, 0u64), |(m, s), leg| (m + leg.distance.value, s + leg.duration.value));

    Ok(RouteEstimate {
        distance_km: meters as f64 / 1000.0,
        duration_min: seconds.div_ceil(60) as u32,
    })
}
