use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tracing::{info_span, Instrument, Span};

use crate::error::{AppError, AuthError};
use crate::AppState;

const UNKNOWN_CALLER: &str = "unknown";
const MAX_USER_AGENT_LENGTH: usize = 256;

/// Mounts the auth endpoints on a scope, e.g. `/api/v1/auth`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/register", web::post().to(register))
        .route("/login", web::post().to(login))
        .route("/refresh", web::post().to(refresh))
        .route("/logout", web::post().to(logout))
        .route("/me", web::get().to(me))
        .route("/password-reset", web::post().to(request_password_reset))
        .route("/password-reset/verify", web::post().to(confirm_password_reset))
        .route("/email/verify", web::post().to(verify_email))
        .route("/email/resend-verification", web::post().to(resend_verification));
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetConfirmRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailRequest {
    pub token: String,
}

/// The calling client as seen by the auth core and its log events.
struct Caller {
    source: String,
    user_agent: String,
}

impl Caller {
    fn new(req: &HttpRequest, state: &AppState) -> Self {
        let user_agent = req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .unwrap_or(UNKNOWN_CALLER)
            .chars()
            .take(MAX_USER_AGENT_LENGTH)
            .collect();

        Self {
            source: source_address(req, state.config.server.trust_forwarded_for),
            user_agent,
        }
    }

    /// Events emitted inside this span carry the source and user agent.
    fn span(&self) -> Span {
        info_span!("auth_request", source = %self.source, user_agent = %self.user_agent)
    }
}

/// Rate limits are keyed on the peer IP. Forwarding headers are client
/// controlled, so they are read only when the deployment says a proxy sets them.
fn source_address(req: &HttpRequest, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        if let Some(addr) = req.connection_info().realip_remote_addr() {
            return addr
                .parse::<SocketAddr>()
                .map(|a| a.ip().to_string())
                .unwrap_or_else(|_| addr.to_string());
        }
    }

    req.peer_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CALLER.to_string())
}

fn bearer_token(req: &HttpRequest) -> Result<&str, AppError> {
    req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(AppError::AuthError(AuthError::TokenInvalid))
}

fn message(text: &str) -> HttpResponse {
    HttpResponse::Ok().json(json!({ "message": text }))
}

pub async fn register(
    req: HttpRequest,
    body: web::Json<RegisterRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let caller = Caller::new(&req, &state);
    let identity = state
        .auth
        .register(&body.username, &body.email, &body.password, &caller.source)
        .instrument(caller.span())
        .await?;
    Ok(HttpResponse::Created().json(identity))
}

pub async fn login(
    req: HttpRequest,
    body: web::Json<LoginRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let caller = Caller::new(&req, &state);
    let pair = state
        .auth
        .login(&body.username, &body.password, &caller.source)
        .instrument(caller.span())
        .await?;
    Ok(HttpResponse::Ok().json(pair))
}

pub async fn refresh(
    body: web::Json<RefreshRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let pair = state.auth.refresh(&body.refresh_token).await?;
    Ok(HttpResponse::Ok().json(pair))
}

pub async fn logout(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.auth.logout(bearer_token(&req)?).await?;
    Ok(message("Successfully logged out"))
}

pub async fn me(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let identity = state.auth.authenticate(bearer_token(&req)?).await?;
    Ok(HttpResponse::Ok().json(identity))
}

pub async fn request_password_reset(
    req: HttpRequest,
    body: web::Json<EmailRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let caller = Caller::new(&req, &state);
    state
        .auth
        .request_password_reset(&body.email, &caller.source)
        .instrument(caller.span())
        .await?;
    Ok(message("If the email exists, a password reset link has been sent"))
}

pub async fn confirm_password_reset(
    body: web::Json<ResetConfirmRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    state
        .auth
        .confirm_password_reset(&body.token, &body.new_password)
        .await?;
    Ok(message("Password has been reset"))
}

pub async fn verify_email(
    body: web::Json<VerifyEmailRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    state.auth.verify_email(&body.token).await?;
    Ok(message("Email verified"))
}

pub async fn resend_verification(
    req: HttpRequest,
    body: web::Json<EmailRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let caller = Caller::new(&req, &state);
    state
        .auth
        .resend_verification(&body.email, &caller.source)
        .instrument(caller.span())
        .await?;
    Ok(message("If the email is registered and unverified, a verification link has been sent"))
}
