//! Authentication: HMAC-signed tokens, login, role gates, and account
//! bootstrap.

use std::sync::Arc;

use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::Json;
use hmac::{Hmac, Mac};
use lazy_static::lazy_static;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::fleet::context::ServiceContext;
use crate::fleet::errors::{FleetError, Result};
use crate::fleet::models::{FcmToken, User, UserRole};
use crate::web::WebError;

type HmacSha256 = Hmac<Sha256>;

/// Issued tokens live for a day.
pub const TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;

lazy_static! {
    static ref EMAIL_RE: Regex =
        Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").unwrap();
}

/// Verified caller identity carried by every authenticated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub email: String,
    pub role: UserRole,
    pub exp: i64,
}

fn b64(data: &[u8]) -> String {
    base64::encode_config(data, base64::URL_SAFE_NO_PAD)
}

fn b64_decode(data: &str) -> Result<Vec<u8>> {
    base64::decode_config(data, base64::URL_SAFE_NO_PAD)
        .map_err(|_| FleetError::Auth("malformed token".to_string()))
}

fn mac_for(secret: &str) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| FleetError::internal(format!("bad signing key: {}", e)))
}

/// Signs a HS256 token for the user.
pub fn issue_token(secret: &str, user: &User, now: i64) -> Result<String> {
    let claims = Claims {
        user_id: user.id,
        email: user.email.clone(),
        role: user.role,
        exp: now + TOKEN_TTL_SECONDS,
    };
    let header = b64(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = b64(serde_json::to_string(&claims)?.as_bytes());
    let signing_input = format!("{}.{}", header, payload);

    let mut mac = mac_for(secret)?;
    mac.update(signing_input.as_bytes());
    let signature = b64(&mac.finalize().into_bytes());
    Ok(format!("{}.{}", signing_input, signature))
}

/// Validates signature and expiry, returning the embedded identity.
pub fn verify_token(secret: &str, token: &str) -> Result<Claims> {
    let mut parts = token.split('.');
    let (header, payload, signature) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(h), Some(p), Some(s), None) => (h, p, s),
        _ => return Err(FleetError::Auth("malformed token".to_string())),
    };

    let mut mac = mac_for(secret)?;
    mac.update(format!("{}.{}", header, payload).as_bytes());
    let signature = b64_decode(signature)?;
    mac.verify_slice(&signature)
        .map_err(|_| FleetError::Auth("invalid token signature".to_string()))?;

    let claims: Claims = serde_json::from_slice(&b64_decode(payload)?)
        .map_err(|_| FleetError::Auth("malformed token claims".to_string()))?;
    if claims.exp <= chrono::Utc::now().timestamp() {
        return Err(FleetError::Auth("token expired".to_string()));
    }
    Ok(claims)
}

/// Pulls a bearer token out of the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

// ---- extractors ----

/// Any authenticated caller.
pub struct AuthUser(pub Claims);

/// Caller with the admin role.
pub struct AdminUser(pub Claims);

/// Caller with the driver role.
pub struct DriverUser(pub Claims);

fn authenticate(parts: &Parts, ctx: &ServiceContext) -> Result<Claims> {
    let token = bearer_token(&parts.headers)
        .ok_or_else(|| FleetError::Auth("missing bearer token".to_string()))?;
    verify_token(&ctx.config.jwt_secret, &token)
}

#[axum::async_trait]
impl FromRequestParts<Arc<ServiceContext>> for AuthUser {
    type Rejection = WebError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &Arc<ServiceContext>,
    ) -> std::result::Result<Self, Self::Rejection> {
        Ok(AuthUser(authenticate(parts, ctx)?))
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<ServiceContext>> for AdminUser {
    type Rejection = WebError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &Arc<ServiceContext>,
    ) -> std::result::Result<Self, Self::Rejection> {
        let claims = authenticate(parts, ctx)?;
        if claims.role != UserRole::Admin {
            return Err(FleetError::Forbidden("manager role required".to_string()).into());
        }
        Ok(AdminUser(claims))
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<ServiceContext>> for DriverUser {
    type Rejection = WebError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &Arc<ServiceContext>,
    ) -> std::result::Result<Self, Self::Rejection> {
        let claims = authenticate(parts, ctx)?;
        if claims.role != UserRole::Driver {
            return Err(FleetError::Forbidden("driver role required".to_string()).into());
        }
        Ok(DriverUser(claims))
    }
}

// ---- handlers ----

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
}

pub async fn login(
    State(ctx): State<Arc<ServiceContext>>,
    Json(req): Json<LoginRequest>,
) -> std::result::Result<Json<LoginResponse>, WebError> {
    let user = ctx
        .store
        .read(|s| s.user_by_email(&req.email))
        .ok_or_else(|| FleetError::Auth("invalid email or password".to_string()))?;

    let valid = bcrypt::verify(&req.password, &user.password_hash).unwrap_or(false);
    if !valid {
        return Err(FleetError::Auth("invalid email or password".to_string()).into());
    }

    let token = issue_token(
        &ctx.config.jwt_secret,
        &user,
        chrono::Utc::now().timestamp(),
    )?;
    tracing::info!(user_id = %user.id, "login");
    Ok(Json(LoginResponse { token, user }))
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub password: String,
    pub name: String,
    pub role: UserRole,
}

pub async fn create_user(
    AdminUser(_): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
    Json(req): Json<CreateUserRequest>,
) -> std::result::Result<Json<User>, WebError> {
    if !EMAIL_RE.is_match(&req.email) {
        return Err(FleetError::validation("invalid email address").into());
    }
    if req.password.len() < 8 {
        return Err(FleetError::validation("password must be at least 8 characters").into());
    }

    let password_hash =
        bcrypt::hash(&req.password, bcrypt::DEFAULT_COST).map_err(FleetError::from)?;
    let user = User {
        id: Uuid::new_v4(),
        email: req.email.to_ascii_lowercase(),
        password_hash,
        name: req.name,
        role: req.role,
        created_at: chrono::Utc::now().timestamp(),
    };
    let created = user.clone();
    ctx.store.transaction(move |tx| tx.insert_user(user))?;
    Ok(Json(created))
}

pub async fn list_users(
    AdminUser(_): AdminUser,
    State(ctx): State<Arc<ServiceContext>>,
) -> std::result::Result<Json<Vec<User>>, WebError> {
    Ok(Json(ctx.store.read(|s| s.users())))
}

#[derive(Debug, Deserialize)]
pub struct RegisterTokenRequest {
    pub token: String,
    pub platform: Option<String>,
}

/// Registers a push token for the calling user; unique on token, so a
/// re-registration moves it.
pub async fn register_fcm_token(
    AuthUser(claims): AuthUser,
    State(ctx): State<Arc<ServiceContext>>,
    Json(req): Json<RegisterTokenRequest>,
) -> std::result::Result<Json<serde_json::Value>, WebError> {
    if req.token.is_empty() {
        return Err(FleetError::validation("token must not be empty").into());
    }
    ctx.store.transaction(|tx| {
        tx.upsert_fcm_token(FcmToken {
            user_id: claims.user_id,
            token: req.token.clone(),
            platform: req.platform.clone(),
            created_at: chrono::Utc::now().timestamp(),
        });
        Ok(())
    })?;
    Ok(Json(serde_json::json!({ "registered": true })))
}

/// First-boot bootstrap: an empty user table gets an admin account with a
/// random password logged exactly once.
pub fn seed_admin(ctx: &ServiceContext) -> Result<()> {
    if !ctx.store.read(|s| s.users_is_empty()) {
        return Ok(());
    }

    let password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    let password_hash = bcrypt::hash(&password, bcrypt::DEFAULT_COST)?;

    let admin = User {
        id: Uuid::new_v4(),
        email: "admin@localhost".to_string(),
        password_hash,
        name: "Administrator".to_string(),
        role: UserRole::Admin,
        created_at: chrono::Utc::now().timestamp(),
    };
    ctx.store.transaction(move |tx| tx.insert_user(admin))?;

    tracing::warn!("created admin@localhost with password: {}", password);
    tracing::warn!("log in and change this password; it will not be shown again");
    Ok(())
}
