use std::sync::Arc;

use sparrow_bookings::{create_router, AppConfig, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file (ignore if not found)
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sparrow_bookings=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    let bind_addr = config.bind_addr.clone();
    let app_state = AppState::new(config).await?;

    let app = create_router(Arc::new(app_state));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Booking service listening on {}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
