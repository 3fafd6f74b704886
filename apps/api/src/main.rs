use std::sync::Arc;
use anyhow::{anyhow, Context};
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::{self, TraceLayer};
use tracing::{Level, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use scheduling_cell::handlers::SchedulingState;
use scheduling_cell::BroadcastNotificationDispatcher;
use shared_config::AppConfig;
use shared_database::SupabaseClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting clinic calendar API server");

    let config = AppConfig::from_env();
    config.calendar.validate()
        .map_err(|e| anyhow!("invalid calendar settings: {}", e))?;
    if !config.is_configured() {
        warn!("Supabase is not configured; calendar requests will fail");
    }

    // Everything below lives for the whole process and is handed down explicitly.
    let supabase = Arc::new(SupabaseClient::new(&config));
    let notifier = Arc::new(BroadcastNotificationDispatcher::default());
    if let Some(url) = config.notification_webhook_url.clone() {
        notifier.spawn_webhook_forwarder(url);
    }

    let bind_address = config.bind_address.clone();
    let state = Arc::new(SchedulingState::new(config, supabase, notifier));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router::create_router(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new()
                    .level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new()
                    .level(Level::INFO)),
        )
        .layer(cors);

    let listener = TcpListener::bind(&bind_address).await
        .with_context(|| format!("failed to bind {}", bind_address))?;
    info!("Listening on {}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}
