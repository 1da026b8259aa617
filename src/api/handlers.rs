use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::auth::gate::bearer_from_headers;
use crate::auth::password::{hash_password, verify_password};
use crate::errors::AppError;
use crate::models::token::{Identity, TokenSummary};
use crate::models::user::{
    ChangePasswordRequest, CreateUserRequest, DeleteUserRequest, LoginRequest, NewUser, User,
    UserFilter, UserStatus, UserUpdate,
};
use crate::store::StoreError;
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub message: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub message: String,
    pub user: User,
}

#[derive(Debug, Serialize)]
pub struct UserListResponse {
    pub message: String,
    pub users: Vec<User>,
}

#[derive(Debug, Serialize)]
pub struct TokenListResponse {
    pub count: usize,
    pub tokens: Vec<TokenSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub message: String,
    pub deleted: u64,
}

/// `GET /api/users` query. Both keys arrive as raw strings so an unparsable
/// id is reported like a missing one.
#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub username: Option<String>,
    pub id: Option<String>,
}

// ── Accounts ─────────────────────────────────────────────────

/// POST /api/register — create an account
pub async fn register(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, AppError> {
    let Json(req) = payload?;
    req.validate()?;

    let password_hash = hash_password(&req.password, state.config.bcrypt_cost).await?;
    let new_user = NewUser {
        username: req.username,
        password_hash,
        role: req.role,
        email: req.email,
        fullname: req.fullname,
    };

    let id = state.users.create_user(&new_user).await.map_err(|e| match e {
        StoreError::Conflict(_) => {
            AppError::Conflict(format!("username '{}' already exists", new_user.username))
        }
        other => other.into(),
    })?;

    tracing::info!(user_id = id, username = %new_user.username, role = %new_user.role, "user registered");
    Ok(MessageResponse::new("user created successfully"))
}

/// POST /api/login — verify credentials and hand out the user's bearer token
pub async fn login(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, AppError> {
    let Json(req) = payload?;
    req.validate()?;

    let user = match state.users.find_user_by_username(&req.username).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            state.metrics.record_login("unknown_user");
            return Err(AppError::NotFound(format!("user '{}' not found", req.username)));
        }
        Err(e) => {
            state.metrics.record_login("error");
            return Err(e.into());
        }
    };

    if user.status == UserStatus::Deleted {
        state.metrics.record_login("deleted");
        return Err(AppError::Malformed("user account is deleted".into()));
    }

    let matches = verify_password(&req.password, &user.password).await.map_err(|e| {
        state.metrics.record_login("error");
        AppError::Internal(e)
    })?;
    if !matches {
        state.metrics.record_login("bad_password");
        tracing::warn!(username = %user.username, "login rejected: bad password");
        return Err(AppError::InvalidCredentials);
    }

    let token = state
        .issuer
        .issue_or_refresh(&user.username, user.role, state.issuer.expiry_from_now())
        .await
        .map_err(|e| {
            state.metrics.record_login("error");
            AppError::from(e)
        })?;

    state.metrics.record_login("success");
    tracing::info!(username = %user.username, "login succeeded");
    Ok(Json(LoginResponse {
        message: "login successful".into(),
        token,
    }))
}

/// POST /api/logout — revoke the presented token
pub async fn logout(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    headers: HeaderMap,
) -> Result<Json<MessageResponse>, AppError> {
    let token = bearer_from_headers(&headers).map_err(|e| e.into_gate_rejection())?;
    state.issuer.revoke(token).await?;
    tracing::info!(username = %identity.username, "logged out");
    Ok(MessageResponse::new("logged out"))
}

/// POST /api/delete — soft-delete an account (admin)
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    payload: Result<Json<DeleteUserRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, AppError> {
    identity.require_admin()?;
    let Json(req) = payload?;
    if req.username.is_empty() {
        return Err(AppError::Malformed("username is required".into()));
    }

    let update = UserUpdate {
        username: req.username.clone(),
        status: Some(UserStatus::Deleted),
        ..Default::default()
    };
    if !state.users.update_user(&update).await? {
        return Err(AppError::NotFound(format!("user '{}' not found", req.username)));
    }
    state.issuer.revoke_user(&req.username).await?;

    tracing::info!(username = %req.username, by = %identity.username, "user deleted");
    Ok(MessageResponse::new("user deleted successfully"))
}

/// POST /api/change_password — owner or admin sets a new password
pub async fn change_password(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    payload: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, AppError> {
    let Json(req) = payload?;
    identity.require_self_or_admin(&req.username)?;

    let update = UserUpdate {
        username: req.username,
        password: Some(req.password),
        ..Default::default()
    };
    update.validate()?;

    let update = with_hashed_password(update, state.config.bcrypt_cost).await?;
    if !state.users.update_user(&update).await? {
        return Err(AppError::NotFound(format!("user '{}' not found", update.username)));
    }

    tracing::info!(username = %update.username, by = %identity.username, "password changed");
    Ok(MessageResponse::new("password updated successfully"))
}

/// POST /api/update — partial account update (admin)
pub async fn update_user(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    payload: Result<Json<UserUpdate>, JsonRejection>,
) -> Result<Json<MessageResponse>, AppError> {
    identity.require_admin()?;
    let Json(update) = payload?;
    update.validate()?;

    let update = with_hashed_password(update, state.config.bcrypt_cost).await?;
    if !state.users.update_user(&update).await? {
        return Err(AppError::NotFound(format!("user '{}' not found", update.username)));
    }

    // A token carries the role it was issued with; make the next login re-read it.
    if update.affects_access() {
        state.issuer.revoke_user(&update.username).await?;
    }

    tracing::info!(username = %update.username, by = %identity.username, "user updated");
    Ok(MessageResponse::new("user updated successfully"))
}

/// GET /api/users?username=…|id=… — fetch one account (admin)
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    query: Result<Query<UserQuery>, QueryRejection>,
) -> Result<Json<UserResponse>, AppError> {
    identity.require_admin()?;
    let Query(query) = query?;

    let user = match query.username.as_deref().filter(|u| !u.is_empty()) {
        Some(username) => state.users.find_user_by_username(username).await?,
        None => {
            let id = parse_user_id(query.id.as_deref())
                .ok_or_else(|| AppError::Malformed("username or id is required".into()))?;
            state.users.find_user_by_id(id).await?
        }
    };

    let user = user.ok_or_else(|| AppError::NotFound("user not found".into()))?;
    Ok(Json(UserResponse {
        message: "user retrieved successfully".into(),
        user,
    }))
}

/// GET /api/users/list?status=…&role=…&email=…&created_after=… — list accounts matching a `UserFilter` (admin)
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    filter: Result<Query<UserFilter>, QueryRejection>,
) -> Result<Json<UserListResponse>, AppError> {
    identity.require_admin()?;
    let Query(filter) = filter?;
    let users = state.users.list_users(&filter).await?;
    Ok(Json(UserListResponse {
        message: "users retrieved successfully".into(),
        users,
    }))
}

// ── Tokens ───────────────────────────────────────────────────

/// GET /api/tokens — list stored tokens, values truncated (admin)
pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Result<Json<TokenListResponse>, AppError> {
    identity.require_admin()?;
    let tokens: Vec<TokenSummary> = state.issuer.list().await?.iter().map(TokenSummary::from).collect();
    Ok(Json(TokenListResponse {
        count: tokens.len(),
        tokens,
    }))
}

/// POST /api/tokens/purge_expired — run the expiry sweep now (admin)
pub async fn purge_expired_tokens(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Result<Json<PurgeResponse>, AppError> {
    identity.require_admin()?;
    let deleted = state.issuer.sweep_expired().await?;
    state.metrics.record_sweep(deleted);
    tracing::info!(deleted, by = %identity.username, "purged expired tokens");
    Ok(Json(PurgeResponse {
        message: "expired tokens purged".into(),
        deleted,
    }))
}

// ── Helpers ──────────────────────────────────────────────────

async fn with_hashed_password(mut update: UserUpdate, cost: u32) -> Result<UserUpdate, AppError> {
    if let Some(plain) = update.password.take() {
        update.password = Some(hash_password(&plain, cost).await?);
    }
    Ok(update)
}

/// Non-zero ids that fit the `BIGSERIAL` column.
fn parse_user_id(raw: Option<&str>) -> Option<i64> {
    let id: u64 = raw?.trim().parse().ok()?;
    if id == 0 {
        return None;
    }
    i64::try_from(id).ok()
}
