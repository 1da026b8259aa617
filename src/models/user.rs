use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

pub const MAX_USERNAME_LEN: usize = 50;
pub const MIN_PASSWORD_LEN: usize = 6;
pub const MAX_PASSWORD_LEN: usize = 50;
pub const MAX_EMAIL_LEN: usize = 100;
pub const MAX_FULLNAME_LEN: usize = 50;

/// Account roles. Matches the `role` column in both `users` and `tokens`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            other => Err(AppError::Malformed(format!("unknown role '{}'", other))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
    Deleted,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Inactive => "inactive",
            UserStatus::Deleted => "deleted",
        }
    }
}

impl FromStr for UserStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(UserStatus::Active),
            "inactive" => Ok(UserStatus::Inactive),
            "deleted" => Ok(UserStatus::Deleted),
            other => Err(AppError::Malformed(format!("unknown status '{}'", other))),
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A stored account. `password` holds the bcrypt hash and never leaves the server.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub role: Role,
    pub email: String,
    pub fullname: String,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for the credential store; `password_hash` is already hashed.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub email: String,
    pub fullname: String,
}

/// Partial update keyed by username. `None` means "leave the column alone".
///
/// Passwords arrive in plain text from the API and are replaced by their hash
/// before the update reaches a store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserUpdate {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub fullname: Option<String>,
    #[serde(default)]
    pub status: Option<UserStatus>,
}

impl UserUpdate {
    pub fn is_empty(&self) -> bool {
        self.password.is_none()
            && self.role.is_none()
            && self.email.is_none()
            && self.fullname.is_none()
            && self.status.is_none()
    }

    /// True when applying this update changes what a token for the user may do.
    pub fn affects_access(&self) -> bool {
        self.role.is_some() || self.status.is_some()
    }

    pub fn validate(&self) -> Result<(), AppError> {
        validate_username(&self.username)?;
        if let Some(password) = &self.password {
            validate_password(password)?;
        }
        if let Some(email) = &self.email {
            validate_email(email)?;
        }
        if let Some(fullname) = &self.fullname {
            validate_fullname(fullname)?;
        }
        if self.is_empty() {
            return Err(AppError::Malformed("no fields to update".into()));
        }
        Ok(())
    }
}

/// Optional filters for listing accounts. Present fields are ANDed.
///
/// `email` and `fullname` match exactly. The time bounds are half-open:
/// `*_after` is inclusive, `*_before` exclusive.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserFilter {
    pub status: Option<UserStatus>,
    pub role: Option<Role>,
    pub email: Option<String>,
    pub fullname: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
}

impl UserFilter {
    pub fn matches(&self, user: &User) -> bool {
        self.status.map_or(true, |s| s == user.status)
            && self.role.map_or(true, |r| r == user.role)
            && self.email.as_deref().map_or(true, |e| e == user.email)
            && self.fullname.as_deref().map_or(true, |f| f == user.fullname)
            && in_window(user.created_at, self.created_after, self.created_before)
            && in_window(user.updated_at, self.updated_after, self.updated_before)
    }
}

fn in_window(at: DateTime<Utc>, after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> bool {
    after.map_or(true, |a| at >= a) && before.map_or(true, |b| at < b)
}

// -- Request bodies --

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub role: Role,
    pub email: String,
    pub fullname: String,
}

impl CreateUserRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        validate_username(&self.username)?;
        validate_password(&self.password)?;
        validate_email(&self.email)?;
        validate_fullname(&self.fullname)
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl LoginRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.username.is_empty() {
            return Err(AppError::Malformed("username is required".into()));
        }
        validate_password(&self.password)
    }
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub username: String,
    pub password: String,
}

/// Body of `POST /api/delete`. Extra fields are accepted and ignored.
#[derive(Debug, Deserialize)]
pub struct DeleteUserRequest {
    pub username: String,
}

// -- Field rules --

fn validate_username(username: &str) -> Result<(), AppError> {
    if username.is_empty() {
        return Err(AppError::Malformed("username is required".into()));
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err(AppError::Malformed(format!(
            "username must be at most {} characters",
            MAX_USERNAME_LEN
        )));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), AppError> {
    let len = password.chars().count();
    if !(MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&len) {
        return Err(AppError::Malformed(format!(
            "password must be between {} and {} characters",
            MIN_PASSWORD_LEN, MAX_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), AppError> {
    if email.chars().count() > MAX_EMAIL_LEN {
        return Err(AppError::Malformed(format!(
            "email must be at most {} characters",
            MAX_EMAIL_LEN
        )));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') && !domain.starts_with('.') => Ok(()),
        _ => Err(AppError::Malformed("email is not a valid address".into())),
    }
}

fn validate_fullname(fullname: &str) -> Result<(), AppError> {
    if fullname.is_empty() {
        return Err(AppError::Malformed("fullname is required".into()));
    }
    if fullname.chars().count() > MAX_FULLNAME_LEN {
        return Err(AppError::Malformed(format!(
            "fullname must be at most {} characters",
            MAX_FULLNAME_LEN
        )));
    }
    Ok(())
}
