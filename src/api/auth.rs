// =============================================================================
// Bearer Token Authentication — Axum extractors
// =============================================================================
//
// Tokens are opaque: the external identity provider issues them and the
// users table maps each one to an (email, name, role) identity. The email is
// the portfolio key everywhere in the engine.
//
// Usage as Axum extractors:
//
//   async fn handler(AuthUser(user): AuthUser, ...) { ... }     // any user
//   async fn handler(AuthAdmin(user): AuthAdmin, ...) { ... }   // role=admin
//
// A missing or unknown token short-circuits with 401; a non-admin presenting
// an admin-only request gets 403.
// =============================================================================

use std::sync::Arc;

use axum::{extract::FromRequestParts, http::request::Parts};
use tracing::warn;

use crate::app_state::AppState;
use crate::storage::UserRow;
use crate::types::EngineError;

/// Pull the token out of an `Authorization: Bearer <token>` header.
fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
}

/// Resolve a raw token against the users table. Shared with the WebSocket
/// layer, where the token arrives in the subscribe protocol rather than a
/// header.
pub fn resolve_token(state: &AppState, token: &str) -> Result<UserRow, EngineError> {
    if token.is_empty() {
        return Err(EngineError::Unauthorized);
    }
    match state.store.user_by_token(token) {
        Ok(Some(user)) => Ok(user),
        Ok(None) => {
            warn!("unknown bearer token presented");
            Err(EngineError::Unauthorized)
        }
        Err(e) => Err(EngineError::Storage(e.to_string())),
    }
}

// =============================================================================
// Extractors
// =============================================================================

/// Any authenticated participant.
pub struct AuthUser(pub UserRow);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = EngineError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(EngineError::Unauthorized)?;
        resolve_token(state, token).map(AuthUser)
    }
}

/// An authenticated participant with the admin role.
pub struct AuthAdmin(pub UserRow);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthAdmin {
    type Rejection = EngineError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let AuthUser(user) = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            warn!(user = %user.email, "non-admin attempted an admin endpoint");
            return Err(EngineError::Forbidden);
        }
        Ok(AuthAdmin(user))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::RuntimeConfig;
    use crate::storage::Store;

    fn state_with_users() -> Arc<AppState> {
        let store = Arc::new(Store::in_memory().unwrap());
        store
            .upsert_user(&UserRow {
                auth_id: "user-token".into(),
                email: "asha@example.com".into(),
                name: "Asha".into(),
                role: "user".into(),
            })
            .unwrap();
        store
            .upsert_user(&UserRow {
                auth_id: "admin-token".into(),
                email: "ops@example.com".into(),
                name: "Ops".into(),
                role: "admin".into(),
            })
            .unwrap();
        Arc::new(AppState::with_store(RuntimeConfig::default(), store).unwrap())
    }

    #[test]
    fn resolve_known_and_unknown_tokens() {
        let state = state_with_users();

        let user = resolve_token(&state, "user-token").unwrap();
        assert_eq!(user.email, "asha@example.com");
        assert!(!user.is_admin());

        let admin = resolve_token(&state, "admin-token").unwrap();
        assert!(admin.is_admin());

        assert_eq!(
            resolve_token(&state, "bogus").unwrap_err().code(),
            "UNAUTHORIZED"
        );
        assert_eq!(resolve_token(&state, "").unwrap_err().code(), "UNAUTHORIZED");
    }
}
