pub mod errors;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;
pub mod state;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use errors::{AppError, AppResult, ValidationError};
pub use router::create_router;
pub use state::{AppConfig, AppState};
