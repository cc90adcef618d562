// src/state.rs
use std::env;
use std::str::FromStr;
use std::sync::Arc;

use crate::errors::{AppError, AppResult};
use crate::services::{
    BookingPolicy, BookingService, DirectionsProvider, DriverService, FcmConfig, FcmPushProvider,
    GeoMatcher, GoogleDirections, HaversineDirections, MockPushProvider, NotificationDispatcher,
    PushProvider, MAX_MATCHED_DRIVERS,
};
use crate::store::{MemorySpatialIndex, MemoryStore, RedisGeoIndex, RedisStore, Repository, SpatialIndex};

pub struct AppState {
    pub booking_service: Arc<BookingService>,
    pub driver_service: Arc<DriverService>,
    pub config: AppConfig,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub redis_url: Option<String>,
    pub fcm_server_key: Option<String>,
    pub push_mock: bool,
    pub google_maps_api_key: Option<String>,
    pub max_matched_drivers: usize,
    pub average_speed_kmh: f64,
    pub policy: BookingPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            redis_url: None,
            fcm_server_key: None,
            push_mock: false,
            google_maps_api_key: None,
            max_matched_drivers: MAX_MATCHED_DRIVERS,
            average_speed_kmh: 40.0,
            policy: BookingPolicy::default(),
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> AppResult<T> {
    match optional_var(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| AppError::Configuration(format!("{} has an invalid value: {}", name, raw))),
    }
}

impl AppConfig {
    pub fn from_env() -> AppResult<Self> {
        let defaults = Self::default();
        let policy = BookingPolicy {
            match_radius_m: parsed_var("MATCH_RADIUS_METERS", defaults.policy.match_radius_m)?,
            otp_ttl_minutes: parsed_var("OTP_TTL_MINUTES", defaults.policy.otp_ttl_minutes)?,
            commission_percent: parsed_var("PLATFORM_COMMISSION_PERCENT", defaults.policy.commission_percent)?,
            max_trip_distance_km: parsed_var("MAX_TRIP_DISTANCE_KM", defaults.policy.max_trip_distance_km)?,
            exclude_rejected_on_rematch: parsed_var(
                "EXCLUDE_REJECTED_ON_REMATCH",
                defaults.policy.exclude_rejected_on_rematch,
            )?,
        };

        if !(0..=100).contains(&policy.commission_percent) {
            return Err(AppError::Configuration(
                "PLATFORM_COMMISSION_PERCENT must be between 0 and 100".to_string(),
            ));
        }
        if policy.otp_ttl_minutes <= 0 {
            return Err(AppError::Configuration("OTP_TTL_MINUTES must be positive".to_string()));
        }

        Ok(Self {
            bind_addr: optional_var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            redis_url: optional_var("REDIS_URL"),
            fcm_server_key: optional_var("FCM_SERVER_KEY"),
            push_mock: parsed_var("PUSH_MOCK", defaults.push_mock)?,
            google_maps_api_key: optional_var("GOOGLE_MAPS_API_KEY"),
            max_matched_drivers: parsed_var("MAX_MATCHED_DRIVERS", defaults.max_matched_drivers)?,
            average_speed_kmh: parsed_var("AVERAGE_SPEED_KMH", defaults.average_speed_kmh)?,
            policy,
        })
    }
}

impl AppState {
    pub async fn new(config: AppConfig) -> AppResult<Self> {
        let provider: Option<Arc<dyn PushProvider>> = match (&config.fcm_server_key, config.push_mock) {
            (Some(key), _) => Some(Arc::new(FcmPushProvider::new(FcmConfig::with_server_key(key.clone())))),
            (None, true) => {
                tracing::warn!("FCM_SERVER_KEY not set, using mock push provider");
                Some(Arc::new(MockPushProvider))
            }
            (None, false) => {
                tracing::warn!("FCM_SERVER_KEY not set, trip offers will not be pushed");
                None
            }
        };

        let directions: Arc<dyn DirectionsProvider> = match &config.google_maps_api_key {
            Some(key) => Arc::new(GoogleDirections::new(key.clone())),
            None => Arc::new(HaversineDirections::new(config.average_speed_kmh)),
        };

        match config.redis_url.clone() {
            Some(url) => {
                let store = Arc::new(RedisStore::connect(&url).await?);
                tracing::info!("Connected to Redis");
                let index: Arc<dyn SpatialIndex> = Arc::new(RedisGeoIndex::new(store.connection()));
                Ok(Self::with_components(config, store, Some(index), provider, directions))
            }
            None => {
                tracing::warn!("REDIS_URL not set, using in-memory store");
                let index: Arc<dyn SpatialIndex> = Arc::new(MemorySpatialIndex::new());
                Ok(Self::with_components(
                    config,
                    Arc::new(MemoryStore::new()),
                    Some(index),
                    provider,
                    directions,
                ))
            }
        }
    }

    /// Wire services over explicit backends.
    pub fn with_components<R: Repository + 'static>(
        config: AppConfig,
        repo: Arc<R>,
        index: Option<Arc<dyn SpatialIndex>>,
        provider: Option<Arc<dyn PushProvider>>,
        directions: Arc<dyn DirectionsProvider>,
    ) -> Self {
        let matcher = Arc::new(GeoMatcher::new(index.clone(), repo.clone(), config.max_matched_drivers));
        let dispatcher = Arc::new(NotificationDispatcher::new(provider));

        let booking_service = Arc::new(BookingService::new(
            repo.clone(),
            matcher.clone(),
            dispatcher,
            directions,
            config.policy.clone(),
        ));
        let driver_service = Arc::new(DriverService::new(
            repo,
            index,
            matcher,
            config.policy.match_radius_m,
        ));

        Self {
            booking_service,
            driver_service,
            config,
        }
    }
}
