pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod notify;

use actix_web::HttpResponse;
use std::sync::Arc;

pub use auth::AuthCore;
pub use config::Settings;
pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;

/// Health check endpoint handler
/// Returns a JSON response with server status, rate-limit backend and timestamp
pub async fn health_check(state: actix_web::web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "rate_limit_backend": state.auth.rate_limiter().backend_name(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Application state shared across all workers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub auth: Arc<AuthCore>,
}

impl AppState {
    pub fn new(config: Settings, auth: AuthCore) -> Self {
        Self {
            config: Arc::new(config),
            auth: Arc::new(auth),
        }
    }
}
