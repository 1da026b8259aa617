use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};

use super::{AuthError, TokenIssuer};
use crate::errors::AppError;
use crate::models::token::Identity;
use crate::AppState;

/// `"Bearer "`, compared case-insensitively.
const BEARER_PREFIX: &[u8] = b"bearer ";

/// Pull the token out of an `Authorization` header value.
///
/// The scheme is matched case-insensitively on exactly one following space;
/// whatever comes after that is the token, verbatim.
pub fn extract_bearer(header: Option<&str>) -> Result<&str, AuthError> {
    let header =
        header.ok_or_else(|| AuthError::Malformed("missing authorization header".into()))?;

    let bytes = header.as_bytes();
    if bytes.len() < BEARER_PREFIX.len() || !bytes[..BEARER_PREFIX.len()].eq_ignore_ascii_case(BEARER_PREFIX) {
        return Err(AuthError::Malformed(
            "authorization header must use the Bearer scheme".into(),
        ));
    }

    // The prefix is ASCII, so this index is a char boundary.
    let token = &header[BEARER_PREFIX.len()..];
    if token.is_empty() {
        return Err(AuthError::Malformed("empty bearer token".into()));
    }
    Ok(token)
}

fn authorization_value(headers: &HeaderMap) -> Result<Option<&str>, AuthError> {
    headers
        .get(AUTHORIZATION)
        .map(|v| {
            v.to_str()
                .map_err(|_| AuthError::Malformed("authorization header is not valid ASCII".into()))
        })
        .transpose()
}

/// Same as `extract_bearer`, reading straight from request headers.
pub fn bearer_from_headers(headers: &HeaderMap) -> Result<&str, AuthError> {
    extract_bearer(authorization_value(headers)?)
}

/// Resolve the caller's identity from an `Authorization` header value.
pub async fn authenticate(header: Option<&str>, issuer: &TokenIssuer) -> Result<Identity, AuthError> {
    authenticate_at(header, issuer, Utc::now()).await
}

/// `authenticate` with the gate's own expiry check pinned to `now`.
async fn authenticate_at(
    header: Option<&str>,
    issuer: &TokenIssuer,
    now: DateTime<Utc>,
) -> Result<Identity, AuthError> {
    let token = extract_bearer(header)?;
    let identity = issuer.validate(token).await?;
    // The issuer already rejects expired rows; checked again at the boundary.
    if identity.expired_at <= now {
        return Err(AuthError::Expired);
    }
    Ok(identity)
}

/// Middleware for protected routes. On success the `Identity` is attached to
/// the request extensions for handlers to extract.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let outcome = match authorization_value(req.headers()) {
        Ok(header) => authenticate(header, &state.issuer).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(identity) => {
            state.metrics.record_auth("authorized");
            tracing::debug!(username = %identity.username, role = %identity.role, "request authorized");
            req.extensions_mut().insert(identity);
            Ok(next.run(req).await)
        }
        Err(e) => {
            state.metrics.record_auth(e.kind());
            tracing::warn!(
                method = %req.method(),
                path = %req.uri().path(),
                reason = e.kind(),
                "rejected request at auth gate"
            );
            Err(e.into_gate_rejection())
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized("Unauthorized: no authenticated identity".into()))
    }
}

impl Identity {
    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.role.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden("admin role required".into()))
        }
    }

    /// Allowed when acting on one's own account, or as an admin.
    pub fn require_self_or_admin(&self, username: &str) -> Result<(), AppError> {
        if self.username == username || self.role.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden(
                "only the account owner or an admin may do this".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::issuer::{generate_token, DEFAULT_TOKEN_TTL};
    use crate::models::user::Role;
    use crate::store::memory::MemoryStore;
    use crate::store::TokenStore;
    use chrono::Duration;

    fn issuer() -> (TokenIssuer, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (TokenIssuer::new(store.clone(), DEFAULT_TOKEN_TTL), store)
    }

    #[test]
    fn test_extract_bearer_scheme_is_case_insensitive() {
        assert_eq!(extract_bearer(Some("Bearer abc")).unwrap(), "abc");
        assert_eq!(extract_bearer(Some("bearer abc")).unwrap(), "abc");
        assert_eq!(extract_bearer(Some("BEARER abc")).unwrap(), "abc");
    }

    #[test]
    fn test_extract_bearer_rejects_other_shapes() {
        for header in [None, Some(""), Some("Bearer"), Some("Bearer "), Some("Token abc"), Some("Basic dXNlcg==")] {
            assert!(
                matches!(extract_bearer(header), Err(AuthError::Malformed(_))),
                "header {:?} should be malformed",
                header
            );
        }
    }

    #[test]
    fn test_extract_bearer_keeps_token_verbatim() {
        // Only the single separator space is consumed.
        assert_eq!(extract_bearer(Some("Bearer  abc")).unwrap(), " abc");
    }

    #[test]
    fn test_extract_bearer_non_ascii_prefix() {
        assert!(extract_bearer(Some("Béarer abc")).is_err());
    }

    #[tokio::test]
    async fn test_authenticate_live_token() {
        let (issuer, _) = issuer();
        let token = issuer
            .issue_or_refresh("alice", Role::User, Utc::now() + Duration::minutes(15))
            .await
            .unwrap();
        let header = format!("Bearer {}", token);
        let identity = authenticate(Some(&header), &issuer).await.unwrap();
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.role, Role::User);
    }

    #[tokio::test]
    async fn test_authenticate_expired_and_unknown() {
        let (issuer, store) = issuer();
        let token = generate_token();
        store
            .insert("alice", &token, Role::User, Utc::now() - Duration::seconds(1))
            .await
            .unwrap();

        let expired = authenticate(Some(&format!("Bearer {}", token)), &issuer).await;
        assert!(matches!(expired, Err(AuthError::Expired)));

        let unknown = authenticate(Some(&format!("Bearer {}", generate_token())), &issuer).await;
        assert!(matches!(unknown, Err(AuthError::NotFound)));
    }

    #[tokio::test]
    async fn test_gate_rejects_identity_expiring_before_its_clock() {
        let (issuer, store) = issuer();
        let token = generate_token();
        let expires = Utc::now() + Duration::minutes(5);
        store.insert("alice", &token, Role::User, expires).await.unwrap();
        let header = format!("Bearer {}", token);

        // The issuer still sees a live row; only the boundary check can refuse it.
        assert!(issuer.validate(&token).await.is_ok());
        let late = authenticate_at(Some(&header), &issuer, expires + Duration::seconds(1)).await;
        assert!(matches!(late, Err(AuthError::Expired)));
        let at_expiry = authenticate_at(Some(&header), &issuer, expires).await;
        assert!(matches!(at_expiry, Err(AuthError::Expired)));
        assert!(authenticate_at(Some(&header), &issuer, expires - Duration::seconds(1)).await.is_ok());
    }

    #[test]
    fn test_role_checks() {
        let user = Identity {
            username: "alice".into(),
            role: Role::User,
            expired_at: Utc::now(),
        };
        assert!(user.require_admin().is_err());
        assert!(user.require_self_or_admin("alice").is_ok());
        assert!(matches!(user.require_self_or_admin("bob"), Err(AppError::Forbidden(_))));

        let admin = Identity {
            username: "root".into(),
            role: Role::Admin,
            expired_at: Utc::now(),
        };
        assert!(admin.require_admin().is_ok());
        assert!(admin.require_self_or_admin("bob").is_ok());
    }
}
