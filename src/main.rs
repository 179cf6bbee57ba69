use actix_web::{web, App, HttpServer};
use anyhow::Context;
use authgate_server::auth::handlers;
use authgate_server::auth::RateLimiter;
use authgate_server::clock::{Clock, SystemClock};
use authgate_server::db::DbOperations;
use authgate_server::notify::{HttpNotifier, LogNotifier, Notifier};
use authgate_server::{health_check, AppState, AuthCore, Settings};
use dotenv::dotenv;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Load configuration
    let config = Settings::new().context("Failed to load configuration")?;
    info!(environment = %config.environment, "Configuration loaded successfully");

    let db = DbOperations::new_with_options(
        &config.database.url,
        config.database.max_connections,
        Duration::from_secs(config.database.acquire_timeout_secs),
    )
    .await
    .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to run migrations")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let rate_limiter = Arc::new(RateLimiter::connect(&config.rate_limit, clock.clone()).await);

    let notifier: Arc<dyn Notifier> = match &config.notifier.endpoint {
        Some(endpoint) => {
            info!(%endpoint, "Sending notifications to HTTP relay");
            Arc::new(HttpNotifier::new(
                endpoint,
                Duration::from_millis(config.notifier.timeout_ms),
            )?)
        }
        None => {
            info!("No notifier endpoint configured, logging notifications only");
            Arc::new(LogNotifier)
        }
    };

    let core = AuthCore::new(&config, Arc::new(db), rate_limiter, notifier, clock)?;
    let state = web::Data::new(AppState::new(config.clone(), core));

    // Periodic cleanup of expired revocations, attempts and rate-limit windows
    let maintenance_state = state.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(MAINTENANCE_INTERVAL).await;
            match maintenance_state.auth.purge_expired().await {
                Ok(report) => info!(
                    revoked_tokens = report.revoked_tokens,
                    failed_attempts = report.failed_attempts,
                    rate_limit_windows = report.rate_limit_windows,
                    "Purged expired auth records"
                ),
                Err(e) => error!(error = %e, "Maintenance pass failed"),
            }
        }
    });

    // Create and bind TCP listener
    let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))?;
    info!("Starting server at {}:{}", config.server.host, config.server.port);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/health", web::get().to(health_check))
            .service(web::scope("/api/v1/auth").configure(handlers::configure))
    })
    .listen(listener)?
    .workers(config.server.workers as usize)
    .run()
    .await?;

    Ok(())
}
