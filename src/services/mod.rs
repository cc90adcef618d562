// src/services/mod.rs
pub mod booking_service;
pub mod directions_service;
pub mod driver_service;
pub mod fare_service;
pub mod geo_service;
pub mod messaging_service;

pub use booking_service::{BookingCreated, BookingOperations, BookingPolicy, BookingService};
pub use directions_service::{DirectionsProvider, GoogleDirections, HaversineDirections, RouteEstimate};
pub use driver_service::{DriverOperations, DriverService};
pub use geo_service::{Eligibility, GeoMatcher, MatchedDriver, MAX_MATCHED_DRIVERS};
pub use messaging_service::{
    DispatchReport, FcmConfig, FcmPushProvider, MockPushProvider, NotificationDispatcher, PushProvider,
};
